//! CAN-FD fragment reassembler (spec §4.C).
//!
//! Joins `P1`/`P2`/`P3` fragment packets into whole CAN-FD frames. Runs
//! inline on the USB read thread -- it owns no thread of its own and holds
//! no locks; the channel engine feeds it fragments and receives completed
//! [`Frame`]s to push into the RX ring.

use log::debug;

use crate::frame::{Frame, FrameFlags};

/// Payload carried in a P1 fragment: header fields plus up to 18 data
/// bytes (spec §4.C).
#[derive(Debug, Clone)]
pub struct FragmentP1 {
    /// CAN arbitration id.
    pub can_id: u32,
    /// Flag bits (spec §6), sans `CAN_FD_FRAME` which the reassembler adds.
    pub flags: FrameFlags,
    /// Actual FD byte count (0-64), not the 4-bit code.
    pub dlc: u8,
    /// Up to 18 data bytes carried in this fragment.
    pub data: Vec<u8>,
    /// Raw 32-bit device timestamp.
    pub timestamp_raw: u32,
}

/// Payload carried in a P2 fragment: up to 28 continuation bytes.
#[derive(Debug, Clone)]
pub struct FragmentP2 {
    /// Up to 28 data bytes.
    pub data: Vec<u8>,
}

/// Payload carried in a P3 fragment: up to 18 continuation bytes.
#[derive(Debug, Clone)]
pub struct FragmentP3 {
    /// Up to 18 data bytes.
    pub data: Vec<u8>,
}

#[derive(Debug)]
enum State {
    Idle,
    AwaitP2 { p1: FragmentP1 },
    AwaitP3 { p1: FragmentP1, p2_data: Vec<u8> },
}

/// Per-channel CAN-FD reassembly state machine.
pub struct Reassembler {
    state: State,
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler { state: State::Idle }
    }
}

impl Reassembler {
    /// Creates a reassembler in the Idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets to Idle, discarding any buffered fragment.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    /// Feeds a P1 fragment. Returns a completed frame immediately if
    /// `dlc <= 18` (spec §4.C); otherwise buffers and awaits P2.
    pub fn on_p1(&mut self, p1: FragmentP1) -> Option<Frame> {
        if !matches!(self.state, State::Idle) {
            debug!("reassembler: P1 arrived mid-sequence, discarding buffered fragment(s)");
        }
        if p1.dlc <= 18 {
            let data = p1.data.clone();
            self.state = State::Idle;
            Some(emit(&p1, &data))
        } else {
            self.state = State::AwaitP2 { p1 };
            None
        }
    }

    /// Feeds a P2 fragment. Completes the frame if the buffered P1's dlc
    /// is `<= 46`; otherwise buffers and awaits P3. Any other current
    /// state is a resync: the fragment is discarded.
    pub fn on_p2(&mut self, p2: FragmentP2) -> Option<Frame> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::AwaitP2 { p1 } => {
                if p1.dlc <= 46 {
                    let mut data = p1.data.clone();
                    data.extend_from_slice(&p2.data);
                    data.truncate(p1.dlc as usize);
                    Some(emit(&p1, &data))
                } else {
                    self.state = State::AwaitP3 {
                        p1,
                        p2_data: p2.data,
                    };
                    None
                }
            }
            other => {
                debug!("reassembler: unexpected P2 in state {:?}, resyncing to Idle", other);
                self.state = State::Idle;
                None
            }
        }
    }

    /// Feeds a P3 fragment, completing a frame that needed all three
    /// fragments. Any other current state is a resync: the fragment is
    /// discarded and state resets to Idle.
    pub fn on_p3(&mut self, p3: FragmentP3) -> Option<Frame> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::AwaitP3 { p1, p2_data } => {
                let mut data = p1.data.clone();
                data.extend_from_slice(&p2_data);
                data.extend_from_slice(&p3.data);
                data.truncate(p1.dlc as usize);
                Some(emit(&p1, &data))
            }
            other => {
                debug!("reassembler: unexpected P3 in state {:?}, resyncing to Idle", other);
                self.state = State::Idle;
                None
            }
        }
    }
}

fn emit(p1: &FragmentP1, data: &[u8]) -> Frame {
    let mut frame = Frame::new(p1.can_id, data, p1.dlc, p1.flags | FrameFlags::CAN_FD_FRAME);
    // Host-timeline stamping happens one layer up, via TimestampSync; the
    // raw tick count is preserved here so the caller can normalize it.
    frame.timestamp_us = p1.timestamp_raw as u64;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p1(dlc: u8, data: Vec<u8>) -> FragmentP1 {
        FragmentP1 {
            can_id: 0x1ABCDEF,
            flags: FrameFlags::EXTENDED,
            dlc,
            data,
            timestamp_raw: 0,
        }
    }

    #[test]
    fn p1_alone_completes_small_frame() {
        let mut r = Reassembler::new();
        let frame = r.on_p1(p1(8, vec![1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        assert_eq!(frame.dlc, 8);
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(frame.flags.contains(FrameFlags::CAN_FD_FRAME));
    }

    #[test]
    fn p1_p2_completes_mid_frame() {
        let mut r = Reassembler::new();
        let p1_data: Vec<u8> = (0..18).collect();
        assert!(r.on_p1(p1(32, p1_data.clone())).is_none());
        let p2_data: Vec<u8> = (18..32).collect();
        let frame = r.on_p2(FragmentP2 { data: p2_data }).unwrap();
        assert_eq!(frame.dlc, 32);
        assert_eq!(frame.payload(), (0u8..32).collect::<Vec<u8>>().as_slice());
    }

    #[test]
    fn p1_p2_p3_completes_large_frame() {
        let mut r = Reassembler::new();
        let p1_data: Vec<u8> = (0..18).collect();
        assert!(r.on_p1(p1(64, p1_data)).is_none());
        let p2_data: Vec<u8> = (18..46).collect();
        assert!(r.on_p2(FragmentP2 { data: p2_data }).is_none());
        let p3_data: Vec<u8> = (46..64).collect();
        let frame = r.on_p3(FragmentP3 { data: p3_data }).unwrap();
        assert_eq!(frame.dlc, 64);
        assert_eq!(frame.payload(), (0u8..64).collect::<Vec<u8>>().as_slice());
    }

    #[test]
    fn repeated_p1_without_p2_discards_and_restarts() {
        let mut r = Reassembler::new();
        assert!(r.on_p1(p1(64, vec![0xAA; 18])).is_none());
        // Second P1 with no P2/P3 in between: discard first, restart fresh.
        let frame = r.on_p1(p1(8, vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(frame.is_some());
        assert_eq!(frame.unwrap().dlc, 8);
    }

    #[test]
    fn p3_out_of_sequence_resyncs() {
        let mut r = Reassembler::new();
        assert!(r.on_p3(FragmentP3 { data: vec![] }).is_none());
        // Idle state unaffected; a fresh P1 still works.
        let frame = r.on_p1(p1(8, vec![9; 8])).unwrap();
        assert_eq!(frame.dlc, 8);
    }

    #[test]
    fn p2_while_idle_is_discarded() {
        let mut r = Reassembler::new();
        assert!(r.on_p2(FragmentP2 { data: vec![1, 2, 3] }).is_none());
    }
}
