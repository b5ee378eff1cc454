//! Wire protocol: command envelope, payload structs, and device events
//! (spec §6).
//!
//! Every command and event shares an 8-byte header followed by a fixed
//! payload, little-endian throughout. Packing/unpacking is hand-written
//! with `to_le_bytes`/`copy_from_slice` rather than a serialization crate,
//! matching how the rest of the retrieval pack's gs_usb-family crates
//! handle fixed vendor wire formats.

use bitflags::bitflags;

use crate::bittiming::{BitTiming, DataBitTiming};
use crate::frame::FrameFlags;

/// Command/event identifiers (spec §6). Only the subset needed to drive
/// the channel engine is modeled; this is not a general vendor protocol
/// library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    /// host -> dev: open a channel.
    Open = 0x01,
    /// dev -> host: reply to Open.
    OpenReply = 0x02,
    /// host -> dev: close a channel.
    Close = 0x03,
    /// host -> dev: go bus-on.
    BusOn = 0x04,
    /// host -> dev: go bus-off.
    BusOff = 0x05,
    /// host -> dev: set arbitration-phase bit timing.
    SetBitTiming = 0x06,
    /// host -> dev: set CAN-FD data-phase bit timing.
    SetDataBitTiming = 0x07,
    /// host -> dev: set driver operating mode.
    SetOpMode = 0x08,
    /// host -> dev: request a device clock read.
    ReadClock = 0x09,
    /// dev -> host: reply to ReadClock.
    ReadClockReply = 0x0A,
    /// host -> dev: transmit a classic CAN frame.
    TxCan20 = 0x0B,
    /// host -> dev: transmit CAN-FD fragment 1.
    TxCanFdP1 = 0x0C,
    /// host -> dev: transmit CAN-FD fragment 2.
    TxCanFdP2 = 0x0D,
    /// host -> dev: transmit CAN-FD fragment 3.
    TxCanFdP3 = 0x0E,
    /// dev -> host: acknowledgement of a prior transmit.
    TxAck = 0x0F,
    /// dev -> host: received classic CAN frame.
    RxCan20 = 0x10,
    /// dev -> host: received CAN-FD fragment 1.
    RxCanFdP1 = 0x11,
    /// dev -> host: received CAN-FD fragment 2.
    RxCanFdP2 = 0x12,
    /// dev -> host: received CAN-FD fragment 3.
    RxCanFdP3 = 0x13,
    /// dev -> host: bus status change.
    Status = 0x14,
}

/// Shared 8-byte header preceding every command/event payload.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Command/event id.
    pub cmd_id: u8,
    /// 7-bit transaction id (top bit unused), wrapping per channel.
    pub transaction_id: u8,
    /// Channel index this command/event applies to.
    pub channel: u8,
    /// Reserved, always zero on the wire.
    pub reserved: u8,
    /// Low 32 bits of the device timestamp at time of submission/receipt.
    pub timestamp_lo: u32,
}

impl Header {
    /// Size of the packed header in bytes.
    pub const SIZE: usize = 8;

    /// Packs the header into its 8-byte wire form.
    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.cmd_id;
        buf[1] = self.transaction_id;
        buf[2] = self.channel;
        buf[3] = self.reserved;
        buf[4..8].copy_from_slice(&self.timestamp_lo.to_le_bytes());
        buf
    }

    /// Unpacks a header from its 8-byte wire form.
    pub fn unpack(buf: &[u8]) -> Header {
        Header {
            cmd_id: buf[0],
            transaction_id: buf[1],
            channel: buf[2],
            reserved: buf[3],
            timestamp_lo: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

/// An outbound command: header plus opaque payload bytes, ready to hand
/// to [`crate::transport::UsbTransport`].
#[derive(Debug, Clone)]
pub struct CommandFrame {
    /// Shared header.
    pub header: Header,
    /// Payload bytes, already packed.
    pub payload: Vec<u8>,
}

impl CommandFrame {
    /// Serialises header + payload into one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Header::SIZE + self.payload.len());
        out.extend_from_slice(&self.header.pack());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// A synchronous reply to a command submitted with
/// `send_and_wait_reply`.
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    /// Shared header.
    pub header: Header,
    /// Payload bytes, not yet interpreted.
    pub payload: Vec<u8>,
}

/// Payload of an `OPEN_REPLY`.
#[derive(Debug, Clone, Copy)]
pub struct OpenReply {
    /// Maximum number of outstanding TX requests this channel may have.
    pub max_pending_tx: u32,
    /// Device clock tick count at the moment OPEN completed.
    pub clock_start_ref: u32,
    /// Microseconds per device clock tick.
    pub base_clock_divisor: u32,
}

impl OpenReply {
    /// Unpacks an OPEN_REPLY payload (12 bytes).
    pub fn unpack(buf: &[u8]) -> OpenReply {
        OpenReply {
            max_pending_tx: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            clock_start_ref: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            base_clock_divisor: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// Payload of a `READ_CLOCK_REPLY`.
#[derive(Debug, Clone, Copy)]
pub struct ReadClockReply {
    /// Full 64-bit device clock value.
    pub clock_value: u64,
    /// Microseconds per device clock tick.
    pub divisor: u32,
}

impl ReadClockReply {
    /// Unpacks a READ_CLOCK_REPLY payload (12 bytes).
    pub fn unpack(buf: &[u8]) -> ReadClockReply {
        ReadClockReply {
            clock_value: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            divisor: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

bitflags! {
    /// Flags accepted by `ChannelEngine::open` (spec §4.F).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Open in CAN-FD mode.
        const CAN_FD = 0x1;
        /// CAN-FD, non-ISO variant.
        const CAN_FD_NON_ISO = 0x2;
        /// Shared access mode. Always rejected by this engine.
        const SHARED_MODE = 0x4;
        /// Request exclusive access (the default, effectively).
        const EXCLUSIVE = 0x8;
        /// Reject standard-frame sends; require extended ids.
        const REQUIRE_EXTENDED = 0x10;
        /// Accept virtual (software-only) channels.
        const ACCEPT_VIRTUAL = 0x20;
    }
}

/// Driver operating modes (spec §4.E). Only `Silent` and `Normal` are
/// accepted by `setDriverMode`; `Off`/`SelfReception` exist for
/// completeness of the taxonomy but are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    /// Bus is not driven; device stays off-bus.
    Off,
    /// Receive-only; no ACKs, errors, or frames are transmitted.
    Silent,
    /// Normal two-way operation.
    Normal,
    /// Device receives its own transmissions as if from another node.
    SelfReception,
}

impl DriverMode {
    /// The wire byte `SET_OP_MODE` carries for this mode, given whether
    /// the channel is operating in CAN-FD mode (`Normal`'s command byte
    /// depends on this, per spec §4.E).
    pub fn wire_value(self, is_fd_mode: bool) -> u8 {
        match self {
            DriverMode::Off => 0,
            DriverMode::Silent => 1,
            DriverMode::Normal if is_fd_mode => 3,
            DriverMode::Normal => 2,
            DriverMode::SelfReception => 4,
        }
    }
}

/// Bus status reported by a `STATUS` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    /// Controller healthy.
    ErrorActive,
    /// Elevated error count, still participating.
    ErrorWarning,
    /// Error-passive: reduced participation.
    ErrorPassive,
    /// Bus-off: controller has stopped driving the bus.
    BusOff,
}

/// A decoded event arriving from the device on the USB receive path,
/// already classified per spec §2's `RX-fragment | TX-ack | status |
/// reply` split. `ChannelEngine` dispatches these into the reassembler,
/// RX ring, or TX tracker as appropriate.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A complete classic CAN frame.
    RxClassic {
        /// Target channel.
        channel: u8,
        /// Arbitration id.
        can_id: u32,
        /// Flag bits.
        flags: FrameFlags,
        /// Data length code (0-8).
        dlc: u8,
        /// Up to 8 payload bytes.
        data: Vec<u8>,
        /// Raw 64-bit device timestamp.
        timestamp_raw: u64,
    },
    /// CAN-FD fragment 1.
    RxFragmentP1 {
        /// Target channel.
        channel: u8,
        /// Arbitration id.
        can_id: u32,
        /// Flag bits.
        flags: FrameFlags,
        /// Actual FD byte count.
        dlc: u8,
        /// Up to 18 payload bytes.
        data: Vec<u8>,
        /// Raw 32-bit device timestamp.
        timestamp_raw: u32,
    },
    /// CAN-FD fragment 2.
    RxFragmentP2 {
        /// Target channel.
        channel: u8,
        /// Up to 28 payload bytes.
        data: Vec<u8>,
    },
    /// CAN-FD fragment 3.
    RxFragmentP3 {
        /// Target channel.
        channel: u8,
        /// Up to 18 payload bytes.
        data: Vec<u8>,
    },
    /// Acknowledgement of a prior `send`.
    TxAck {
        /// Target channel.
        channel: u8,
        /// Transaction id being acknowledged.
        transaction_id: u8,
        /// Flag bits; an error bit here triggers a TX-ring flush.
        flags: FrameFlags,
        /// Raw 64-bit device timestamp.
        timestamp_raw: u64,
    },
    /// A bus status change.
    Status {
        /// Target channel.
        channel: u8,
        /// New bus status.
        status: BusStatus,
    },
}

/// Builds the OPEN command payload (spec §6): `channel,
/// base_clock_divisor, fd_mode, fd_non_iso`.
pub fn build_open_payload(base_clock_divisor: u8, fd_mode: bool, fd_non_iso: bool) -> Vec<u8> {
    vec![base_clock_divisor, fd_mode as u8, fd_non_iso as u8]
}

/// Builds the SET_BIT_TIMING payload. `cicfg1`/`cicfg2` are 16-bit device
/// registers, packed little-endian after the single-byte fields.
pub fn build_bit_timing_payload(bt: BitTiming) -> Vec<u8> {
    let mut payload = vec![bt.brp, bt.tseg1, bt.tseg2, bt.sjw, bt.cancks];
    payload.extend_from_slice(&bt.cicfg1.to_le_bytes());
    payload.extend_from_slice(&bt.cicfg2.to_le_bytes());
    payload
}

/// Builds the SET_DATA_BIT_TIMING payload.
pub fn build_data_bit_timing_payload(bt: DataBitTiming) -> Vec<u8> {
    vec![
        bt.brp,
        bt.tseg1,
        bt.tseg2,
        bt.sjw,
        bt.tdc_offset,
        bt.tdc_value,
        bt.ssp_mode_off as u8,
    ]
}
