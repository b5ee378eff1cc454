//! Library context and shared device handle (spec §4.I, Design Notes §9).
//!
//! Replaces the original engine's implicit global "is library
//! initialised" flag and handle-to-channel table with an explicit,
//! constructible [`LibraryContext`]. A [`Device`] is the shared USB
//! handle referenced by every channel opened on it; per Design Notes, the
//! device never owns its channels by pointer -- it only knows them by
//! array index, via a weak back-reference table that channels register
//! into on open and clear on close. This avoids the ownership cycle a
//! naive `Device -> Channel -> Device` link would create.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::Result;
use crate::protocol::DeviceEvent;
use crate::transport::{RusbTransport, UsbTransport};

/// How long the device dispatch thread blocks waiting for the next event
/// before checking whether it should keep running.
const DISPATCH_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Anything that can receive a decoded [`DeviceEvent`] addressed to it.
/// Implemented by the channel engine; kept as a trait here so `Device`
/// does not need to depend on `ChannelInner`'s concrete type, matching
/// the index-only back-reference Design Notes calls for.
pub trait EventSink: Send + Sync {
    /// Handles one event routed to this channel by the device dispatch
    /// thread.
    fn dispatch_event(&self, event: DeviceEvent);
}

/// Static, device-reported identification and capability data, filled in
/// once at construction.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    /// Device serial number.
    pub serial_number: u32,
    /// Vendor product code.
    pub product_code: u32,
    /// Firmware version.
    pub firmware_version: u32,
    /// Device capability bitmask (spec §4.F `getCapabilities`).
    pub capabilities: u32,
}

/// The shared USB device backing one or more channels.
pub struct Device {
    pub(crate) transport: Arc<dyn UsbTransport>,
    pub(crate) info: DeviceInfo,
    channel_count: u8,
    open_refcount: AtomicU32,
    channels: Mutex<Vec<Option<Weak<dyn EventSink>>>>,
    dispatch_running: Arc<std::sync::atomic::AtomicBool>,
}

impl Device {
    /// Wraps `transport` as a device exposing `channel_count` channels.
    pub fn new(transport: Arc<dyn UsbTransport>, channel_count: u8, info: DeviceInfo) -> Arc<Device> {
        let dev = Arc::new(Device {
            transport,
            info,
            channel_count,
            open_refcount: AtomicU32::new(0),
            channels: Mutex::new((0..channel_count).map(|_| None).collect()),
            dispatch_running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });
        dev.clone().start_dispatch_thread();
        dev
    }

    /// Number of channels this device exposes.
    pub fn channel_count(&self) -> u8 {
        self.channel_count
    }

    /// Registers `sink` as the receiver for events addressed to
    /// `channel`, replacing any prior registration. Called by a channel
    /// when it opens.
    pub fn register_channel(&self, channel: u8, sink: Weak<dyn EventSink>) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(slot) = channels.get_mut(channel as usize) {
            *slot = Some(sink);
        }
    }

    /// Clears the registration for `channel`. Called by a channel when it
    /// closes, so no further events are routed to a torn-down channel
    /// (spec invariant 6).
    pub fn unregister_channel(&self, channel: u8) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(slot) = channels.get_mut(channel as usize) {
            *slot = None;
        }
    }

    /// Increments the shared-handle refcount; the first `open` on any
    /// channel is responsible for actually opening the USB device (that
    /// mechanics lives in the transport, out of scope here -- this
    /// refcount exists so `close` on one channel does not tear down a
    /// device other channels still use).
    pub fn acquire(&self) {
        self.open_refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the shared-handle refcount.
    pub fn release(&self) {
        self.open_refcount.fetch_sub(1, Ordering::SeqCst);
    }

    /// Current number of channels holding a reference to this device.
    pub fn refcount(&self) -> u32 {
        self.open_refcount.load(Ordering::SeqCst)
    }

    fn start_dispatch_thread(self: Arc<Self>) {
        self.dispatch_running.store(true, Ordering::SeqCst);
        let running = self.dispatch_running.clone();
        thread::spawn(move || {
            debug!("device dispatch thread started");
            while running.load(Ordering::SeqCst) {
                match self.transport.poll_event(DISPATCH_POLL_TIMEOUT) {
                    Ok(Some(event)) => self.route(event),
                    Ok(None) => {}
                    Err(e) => warn!("device dispatch thread: transport error: {e}"),
                }
            }
            debug!("device dispatch thread stopped");
        });
    }

    fn route(&self, event: DeviceEvent) {
        let channel = event_channel(&event);
        let sink = {
            let channels = self.channels.lock().unwrap();
            channels
                .get(channel as usize)
                .and_then(|slot| slot.clone())
        };
        match sink.and_then(|weak| weak.upgrade()) {
            Some(sink) => sink.dispatch_event(event),
            None => debug!("device dispatch: no channel registered for index {channel}, dropping event"),
        }
    }
}

fn event_channel(event: &DeviceEvent) -> u8 {
    match event {
        DeviceEvent::RxClassic { channel, .. }
        | DeviceEvent::RxFragmentP1 { channel, .. }
        | DeviceEvent::RxFragmentP2 { channel, .. }
        | DeviceEvent::RxFragmentP3 { channel, .. }
        | DeviceEvent::TxAck { channel, .. }
        | DeviceEvent::Status { channel, .. } => *channel,
    }
}

/// Explicit, client-constructed replacement for the process-wide globals
/// the original engine relied on (Design Notes §9). Vends [`Device`]
/// handles; holds no other state of its own.
#[derive(Default)]
pub struct LibraryContext {
    devices: Mutex<Vec<Arc<Device>>>,
}

impl LibraryContext {
    /// Creates an empty library context.
    pub fn new() -> Self {
        LibraryContext::default()
    }

    /// Registers a device with this context and returns the shared
    /// handle clients use to open channels on it.
    pub fn adopt_device(&self, device: Arc<Device>) -> Arc<Device> {
        self.devices.lock().unwrap().push(device.clone());
        device
    }

    /// Opens the first USB adapter `RusbTransport::open_first` finds and
    /// adopts it as a `channel_count`-channel `Device`. Not a scan over
    /// multiple physical devices (spec §1 scope) -- just the single-device
    /// open path every caller otherwise wires up by hand.
    pub fn open_first_device(&self, channel_count: u8) -> Result<Arc<Device>> {
        let transport = Arc::new(RusbTransport::open_first()?);
        Ok(self.adopt_device(Device::new(transport, channel_count, DeviceInfo::default())))
    }

    /// Returns every device currently registered with this context.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().clone()
    }
}
