//! Host-side channel engine for a USB-attached multi-channel CAN/CAN-FD
//! interface.
//!
//! The engine owns the wire protocol, timestamp synchronisation, CAN-FD
//! fragment reassembly, and TX tracking needed to drive one or more
//! channels on a single USB device. USB enumeration, descriptor parsing,
//! and packet-level reconnection are out of scope -- see
//! [`transport::UsbTransport`] for the boundary this crate expects a host
//! application (or a fuller transport) to fill in.
//!
//! A typical client:
//!
//! ```no_run
//! use zenocan::channel::ChannelEngine;
//! use zenocan::device::LibraryContext;
//! use zenocan::protocol::OpenFlags;
//!
//! let ctx = LibraryContext::new();
//! let device = ctx.open_first_device(1)?;
//! let channel = ChannelEngine::new(device, 0);
//! channel.open(OpenFlags::empty())?;
//! channel.bus_on()?;
//! # Ok::<(), zenocan::error::Error>(())
//! ```

#![warn(missing_docs)]

pub mod bittiming;
pub mod channel;
pub mod device;
pub mod error;
pub mod frame;
pub mod protocol;
mod reassembly;
mod ring;
pub mod timestamp;
pub mod transport;
mod tx_tracker;

pub use channel::{ChannelEngine, ChannelEvent, ChannelState, NotifyMask};
pub use device::{Device, DeviceInfo, LibraryContext};
pub use error::{Error, Result};
pub use frame::{Frame, FrameFlags};
pub use protocol::{BusStatus, DriverMode, OpenFlags};
