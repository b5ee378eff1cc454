//! CAN frame representation and the client-visible flag bits (spec §6).

use bitflags::bitflags;

bitflags! {
    /// Flag bits carried on every RX record and accepted on `send`.
    ///
    /// Bit values match the wire protocol exactly (spec §6) so a `Frame`'s
    /// flags can be written straight into a command envelope without
    /// translation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u32 {
        /// Remote transmission request.
        const RTR = 0x1;
        /// Standard (11-bit) arbitration id.
        const STANDARD = 0x2;
        /// Extended (29-bit) arbitration id.
        const EXTENDED = 0x4;
        /// Device-reported error frame.
        const ERROR_FRAME = 0x20;
        /// This record is the acknowledgement of a prior `send`, not a frame
        /// received from the bus.
        const TX_MSG_ACKNOWLEDGE = 0x40;
        /// Device-reported receive hardware overrun.
        const ERROR_HW_OVERRUN = 0x200;
        /// CAN-FD frame (up to 64 data bytes).
        const CAN_FD_FRAME = 0x0001_0000;
        /// CAN-FD bit rate switch: data phase transmitted at the data bitrate.
        const CAN_FD_BRS = 0x0002_0000;
        /// CAN-FD error state indicator.
        const CAN_FD_ESI = 0x0004_0000;
    }
}

impl FrameFlags {
    /// Returns true if exactly one of [`FrameFlags::STANDARD`] /
    /// [`FrameFlags::EXTENDED`] is set, as required by `send`.
    pub fn has_exactly_one_id_kind(self) -> bool {
        self.contains(FrameFlags::STANDARD) ^ self.contains(FrameFlags::EXTENDED)
    }
}

/// Maximum data length for a CAN-FD frame.
pub const MAX_FD_DLC: u8 = 64;
/// Maximum data length for a classic CAN frame.
pub const MAX_CLASSIC_DLC: u8 = 8;

/// The DLC values CAN-FD frames may report beyond the classic 0-8 range.
pub const FD_DLC_VALUES: [u8; 7] = [12, 16, 20, 24, 32, 48, 64];

/// A single CAN or CAN-FD frame, either about to be sent or received from
/// the ring buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// CAN arbitration id (11-bit standard or 29-bit extended).
    pub can_id: u32,
    /// Data length code. For FD frames this is the actual byte count
    /// (0-64), not the classic 4-bit code.
    pub dlc: u8,
    /// Frame data. Only the first `dlc` bytes are meaningful.
    pub data: [u8; 64],
    /// Flag bits, see [`FrameFlags`].
    pub flags: FrameFlags,
    /// Host-timeline microsecond timestamp. Zero for frames not yet sent.
    pub timestamp_us: u64,
}

impl Frame {
    /// Builds a frame from an explicit id/payload/dlc/flags tuple, as
    /// accepted by `ChannelEngine::send`.
    pub fn new(can_id: u32, payload: &[u8], dlc: u8, flags: FrameFlags) -> Self {
        let mut data = [0u8; 64];
        let len = payload.len().min(data.len());
        data[..len].copy_from_slice(&payload[..len]);
        Frame {
            can_id,
            dlc,
            data,
            flags,
            timestamp_us: 0,
        }
    }

    /// Returns the slice of `data` actually carrying payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Number of bits this frame contributes to bus load accounting
    /// (spec §4.F `getBusLoad`): header bits plus 8 bits per data byte.
    pub fn bus_load_bits(&self) -> u32 {
        let header_bits = if self.flags.contains(FrameFlags::EXTENDED) {
            63
        } else {
            44
        };
        header_bits + 8 * self.dlc as u32
    }

    /// Validates `dlc` against the classic/FD rules in spec §4.F.
    pub fn validate_dlc(dlc: u8, is_fd: bool) -> bool {
        if dlc <= MAX_CLASSIC_DLC {
            return true;
        }
        is_fd && FD_DLC_VALUES.contains(&dlc)
    }
}
