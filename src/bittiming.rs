//! Bit-timing tables (spec §4.E, §6).
//!
//! Bitrate selection is table-driven rather than computed, matching the
//! wire-level requirement that timing tuples be reproduced bit-for-bit:
//! `setBusParameters`/`setBusParametersFd` look a requested bitrate up in
//! one of the two closed tables below instead of deriving register values
//! from the device clock (contrast the teacher's own `calculate_bit_timing`,
//! which computes BRP/seg1/seg2 from an arbitrary clock -- that approach
//! doesn't give bit-exact reproducibility across firmware revisions, which
//! this protocol's closed bitrate set requires).

/// Nominal (arbitration-phase) bit-timing register set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    /// Baud rate prescaler.
    pub brp: u8,
    /// Time segment 1 (propagation + phase seg 1).
    pub tseg1: u8,
    /// Time segment 2 (phase seg 2).
    pub tseg2: u8,
    /// Synchronisation jump width.
    pub sjw: u8,
    /// Clock domain select / CAN core clock configuration byte.
    pub cancks: u8,
    /// CAN core integration config register 1 (device-specific; values up
    /// to 0x00FF observed, so a byte would do, but kept `u16` alongside
    /// `cicfg2` for a uniform register width).
    pub cicfg1: u16,
    /// CAN core integration config register 2 (device-specific; values up
    /// to 0x07BF require a 16-bit field).
    pub cicfg2: u16,
}

/// CAN-FD data-phase bit-timing register set, with transmitter delay
/// compensation fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBitTiming {
    /// Baud rate prescaler.
    pub brp: u8,
    /// Time segment 1.
    pub tseg1: u8,
    /// Time segment 2.
    pub tseg2: u8,
    /// Synchronisation jump width.
    pub sjw: u8,
    /// Transmitter delay compensation offset.
    pub tdc_offset: u8,
    /// Transmitter delay compensation value.
    pub tdc_value: u8,
    /// Secondary sample point mode disabled (wire field
    /// `tdc_ssp_mode_off`): `true` turns SSP off for this data bitrate,
    /// `false` (the default for most rows) leaves it on.
    pub ssp_mode_off: bool,
}

/// One row of the arbitration bitrate table.
struct Row {
    bitrate: u32,
    timing: BitTiming,
}

/// One row of the CAN-FD data bitrate table.
struct DataRow {
    bitrate: u32,
    timing: DataBitTiming,
}

// Tuples transcribed verbatim from the vendor's `setBusParameters`/
// `setBusParametersFd` switches (zzenocanchannel.cpp), not derived or
// invented. cancks/cicfg1/cicfg2 are opaque device configuration registers
// that must be sent exactly as given.
const ARBITRATION_TABLE: &[Row] = &[
    Row { bitrate: 10_000, timing: BitTiming { brp: 156, tseg1: 16, tseg2: 7, sjw: 0, cancks: 0, cicfg1: 0x00FF, cicfg2: 0x07BF } },
    Row { bitrate: 33_333, timing: BitTiming { brp: 46, tseg1: 16, tseg2: 7, sjw: 0, cancks: 1, cicfg1: 0x003D, cicfg2: 0x04BA } },
    Row { bitrate: 50_000, timing: BitTiming { brp: 30, tseg1: 16, tseg2: 7, sjw: 0, cancks: 1, cicfg1: 0x0031, cicfg2: 0x01B3 } },
    Row { bitrate: 62_000, timing: BitTiming { brp: 26, tseg1: 15, tseg2: 6, sjw: 3, cancks: 1, cicfg1: 0x002E, cicfg2: 0x02A9 } },
    Row { bitrate: 83_000, timing: BitTiming { brp: 18, tseg1: 16, tseg2: 6, sjw: 0, cancks: 1, cicfg1: 0x0029, cicfg2: 0x01A1 } },
    Row { bitrate: 83_333, timing: BitTiming { brp: 18, tseg1: 16, tseg2: 6, sjw: 0, cancks: 1, cicfg1: 0x0029, cicfg2: 0x01A1 } },
    Row { bitrate: 100_000, timing: BitTiming { brp: 14, tseg1: 16, tseg2: 7, sjw: 0, cancks: 1, cicfg1: 0x0022, cicfg2: 0x01A1 } },
    Row { bitrate: 125_000, timing: BitTiming { brp: 0, tseg1: 254, tseg2: 63, sjw: 63, cancks: 1, cicfg1: 0x001B, cicfg2: 0x01A1 } },
    Row { bitrate: 250_000, timing: BitTiming { brp: 0, tseg1: 126, tseg2: 31, sjw: 31, cancks: 1, cicfg1: 0x000D, cicfg2: 0x01A1 } },
    Row { bitrate: 500_000, timing: BitTiming { brp: 0, tseg1: 62, tseg2: 15, sjw: 15, cancks: 1, cicfg1: 0x0006, cicfg2: 0x01A1 } },
    // 1 Mbit/s is additionally rejected on channels >= MAX_CHANNEL_FOR_1MBIT
    // by `lookup_arbitration` below -- the source's internal clock domain
    // for those channels cannot realise it.
    Row { bitrate: 1_000_000, timing: BitTiming { brp: 0, tseg1: 30, tseg2: 7, sjw: 7, cancks: 1, cicfg1: 0x0002, cicfg2: 0x02A0 } },
];

const DATA_TABLE: &[DataRow] = &[
    DataRow { bitrate: 500_000, timing: DataBitTiming { brp: 1, tseg1: 30, tseg2: 7, sjw: 7, tdc_offset: 31, tdc_value: 0, ssp_mode_off: true } },
    DataRow { bitrate: 833_000, timing: DataBitTiming { brp: 1, tseg1: 17, tseg2: 4, sjw: 4, tdc_offset: 18, tdc_value: 0, ssp_mode_off: true } },
    DataRow { bitrate: 1_000_000, timing: DataBitTiming { brp: 0, tseg1: 30, tseg2: 7, sjw: 7, tdc_offset: 31, tdc_value: 0, ssp_mode_off: false } },
    DataRow { bitrate: 1_500_000, timing: DataBitTiming { brp: 0, tseg1: 18, tseg2: 5, sjw: 5, tdc_offset: 19, tdc_value: 0, ssp_mode_off: false } },
    DataRow { bitrate: 2_000_000, timing: DataBitTiming { brp: 0, tseg1: 14, tseg2: 3, sjw: 3, tdc_offset: 15, tdc_value: 0, ssp_mode_off: false } },
    DataRow { bitrate: 3_000_000, timing: DataBitTiming { brp: 0, tseg1: 8, tseg2: 2, sjw: 2, tdc_offset: 9, tdc_value: 0, ssp_mode_off: false } },
    DataRow { bitrate: 4_000_000, timing: DataBitTiming { brp: 0, tseg1: 6, tseg2: 1, sjw: 1, tdc_offset: 7, tdc_value: 0, ssp_mode_off: false } },
    DataRow { bitrate: 5_000_000, timing: DataBitTiming { brp: 0, tseg1: 4, tseg2: 1, sjw: 1, tdc_offset: 5, tdc_value: 0, ssp_mode_off: false } },
    DataRow { bitrate: 6_700_000, timing: DataBitTiming { brp: 0, tseg1: 3, tseg2: 0, sjw: 0, tdc_offset: 4, tdc_value: 0, ssp_mode_off: false } },
    DataRow { bitrate: 8_000_000, timing: DataBitTiming { brp: 0, tseg1: 2, tseg2: 0, sjw: 0, tdc_offset: 3, tdc_value: 1, ssp_mode_off: false } },
    DataRow { bitrate: 10_000_000, timing: DataBitTiming { brp: 0, tseg1: 1, tseg2: 0, sjw: 0, tdc_offset: 2, tdc_value: 0, ssp_mode_off: false } },
];

/// Maximum channel index permitted to select 1 Mbit/s arbitration
/// bitrate; channels at or above this index share a clock domain that
/// cannot realise it (spec §4.E).
pub const MAX_CHANNEL_FOR_1MBIT: u8 = 4;

/// Looks up the arbitration bit-timing tuple for `bitrate` on `channel`.
/// Returns `None` if the bitrate is unsupported, or if `channel` cannot
/// realise 1 Mbit/s.
pub fn lookup_arbitration(channel: u8, bitrate: u32) -> Option<BitTiming> {
    if bitrate == 1_000_000 && channel >= MAX_CHANNEL_FOR_1MBIT {
        return None;
    }
    ARBITRATION_TABLE
        .iter()
        .find(|row| row.bitrate == bitrate)
        .map(|row| row.timing)
}

/// Looks up the CAN-FD data-phase bit-timing tuple for `bitrate`.
pub fn lookup_data(bitrate: u32) -> Option<DataBitTiming> {
    DATA_TABLE
        .iter()
        .find(|row| row.bitrate == bitrate)
        .map(|row| row.timing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_arbitration_bitrate_resolves() {
        assert!(lookup_arbitration(0, 500_000).is_some());
        assert!(lookup_arbitration(0, 1_000_000).is_some());
    }

    #[test]
    fn unknown_arbitration_bitrate_rejected() {
        assert!(lookup_arbitration(0, 999_999).is_none());
    }

    #[test]
    fn high_channel_rejects_1mbit() {
        assert!(lookup_arbitration(4, 1_000_000).is_none());
        assert!(lookup_arbitration(3, 1_000_000).is_some());
    }

    #[test]
    fn known_data_bitrate_resolves() {
        assert!(lookup_data(8_000_000).is_some());
        assert!(lookup_data(123).is_none());
    }
}
