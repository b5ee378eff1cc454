//! End-to-end tests driving `ChannelEngine` against `FakeTransport`,
//! exercising the scenarios, laws, and invariants a CAN-FD channel
//! engine is expected to uphold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use zenocan::channel::ChannelEngine;
use zenocan::device::{Device, DeviceInfo};
use zenocan::error::Error;
use zenocan::frame::FrameFlags;
use zenocan::protocol::{CommandId, DeviceEvent, Header, OpenFlags, ReplyFrame};
use zenocan::transport::FakeTransport;

fn open_channel(index: u8, max_pending_tx: u32, fd: bool) -> (ChannelEngine, Arc<FakeTransport>) {
    let transport = FakeTransport::new();
    let device = Device::new(transport.clone(), 8, DeviceInfo::default());
    let channel = ChannelEngine::new(device, index);

    let mut payload = Vec::new();
    payload.extend_from_slice(&max_pending_tx.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&1u32.to_le_bytes());
    transport.set_next_reply(ReplyFrame {
        header: Header {
            cmd_id: CommandId::OpenReply as u8,
            transaction_id: 0,
            channel: index,
            reserved: 0,
            timestamp_lo: 0,
        },
        payload,
    });

    let flags = if fd {
        OpenFlags::CAN_FD
    } else {
        OpenFlags::empty()
    };
    channel.open(flags).expect("open should succeed");
    (channel, transport)
}

fn ack_reply() -> ReplyFrame {
    ReplyFrame {
        header: Header {
            cmd_id: 0,
            transaction_id: 0,
            channel: 0,
            reserved: 0,
            timestamp_lo: 0,
        },
        payload: Vec::new(),
    }
}

/// Scenario 1: an FD send with a matching ack round-trips byte-identical,
/// with flags showing Extended|CanFdFrame|TxMsgAcknowledge.
#[test]
fn fd_send_with_matching_ack_round_trips() {
    let (channel, transport) = open_channel(0, 4, true);

    let payload: Vec<u8> = (0u8..64).collect();
    let send_flags = FrameFlags::EXTENDED | FrameFlags::CAN_FD_FRAME;
    channel
        .send(0x1ABCDEF, &payload, 64, send_flags, Some(Duration::from_millis(200)))
        .expect("fd send should be accepted");

    // Three fragments: P1 (20 bytes), P2 (28 bytes), P3 (16 bytes).
    let submitted = transport.drain_submitted();
    assert_eq!(submitted.len(), 3);
    assert_eq!(submitted[0].header.cmd_id, CommandId::TxCanFdP1 as u8);
    assert_eq!(submitted[1].header.cmd_id, CommandId::TxCanFdP2 as u8);
    assert_eq!(submitted[2].header.cmd_id, CommandId::TxCanFdP3 as u8);

    transport.inject(DeviceEvent::TxAck {
        channel: 0,
        transaction_id: 0,
        flags: FrameFlags::empty(),
        timestamp_raw: 5_000,
    });

    let frame = channel
        .read_wait(Some(Duration::from_secs(1)))
        .expect("acked frame should arrive");
    assert_eq!(frame.can_id, 0x1ABCDEF);
    assert_eq!(frame.dlc, 64);
    assert_eq!(frame.payload(), payload.as_slice());
    assert!(frame.flags.contains(FrameFlags::EXTENDED));
    assert!(frame.flags.contains(FrameFlags::CAN_FD_FRAME));
    assert!(frame.flags.contains(FrameFlags::TX_MSG_ACKNOWLEDGE));
}

/// Scenario 2: with `max_outstanding_tx = 4`, a fifth zero-wait send
/// overflows.
#[test]
fn fifth_send_overflows_transmit_buffer() {
    let (channel, _transport) = open_channel(0, 4, false);
    for _ in 0..4 {
        channel
            .send(0x100, &[0xAA], 1, FrameFlags::STANDARD, None)
            .expect("first four sends should fit in the cap");
    }
    let err = channel
        .send(0x100, &[0xAA], 1, FrameFlags::STANDARD, None)
        .unwrap_err();
    assert!(matches!(err, Error::TransmitBufferOverflow { outstanding: 4 }));
}

/// Scenario 3: a second P1 with no intervening P2 discards the first
/// buffered fragment and begins anew -- no frame is emitted until a
/// fragment sequence actually completes.
#[test]
fn repeated_p1_with_no_followup_emits_nothing() {
    let (channel, transport) = open_channel(0, 4, true);

    transport.inject(DeviceEvent::RxFragmentP1 {
        channel: 0,
        can_id: 0x1ABCDEF,
        flags: FrameFlags::EXTENDED,
        dlc: 64,
        data: vec![0xAA; 18],
        timestamp_raw: 100,
    });
    transport.inject(DeviceEvent::RxFragmentP1 {
        channel: 0,
        can_id: 0x1ABCDEF,
        flags: FrameFlags::EXTENDED,
        dlc: 64,
        data: vec![0xBB; 18],
        timestamp_raw: 200,
    });

    let err = channel.read_wait(Some(Duration::from_millis(80))).unwrap_err();
    assert!(matches!(err, Error::Timeout));
}

/// Scenario 4: 1 Mbit/s is rejected on channel index 4.
#[test]
fn channel_four_rejects_one_megabit() {
    let (channel, _transport) = open_channel(4, 4, false);
    let err = channel.set_bus_parameters(1_000_000, 0.875, 1).unwrap_err();
    assert!(matches!(err, Error::UnsupportedBitrate(1_000_000)));
    assert!(channel.last_error_text().unwrap().contains("not supported"));
}

/// Scenario 5: an idle, bus-on channel's `readWait` times out no sooner
/// than the requested duration.
#[test]
fn idle_bus_on_channel_times_out_after_requested_duration() {
    let (channel, transport) = open_channel(0, 4, false);
    transport.set_next_reply(ack_reply());
    channel.bus_on().expect("bus_on should succeed");

    let start = Instant::now();
    let err = channel.read_wait(Some(Duration::from_millis(50))).unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(50));
}

/// Scenario 6: a send with neither Standard nor Extended set is rejected
/// and leaves the TX tracker state untouched -- the next legitimate send
/// still gets the first transaction id.
#[test]
fn send_with_no_id_kind_is_invalid_and_does_not_consume_a_transaction_id() {
    let (channel, transport) = open_channel(0, 4, false);
    let err = channel
        .send(0x100, &[1, 2, 3], 3, FrameFlags::empty(), Some(Duration::from_millis(10)))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)));

    channel
        .send(0x100, &[1, 2, 3], 3, FrameFlags::STANDARD, None)
        .expect("a legitimate send should still succeed");
    let submitted = transport.drain_submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].header.transaction_id, 0);
}

/// Invariant: a TX ack carrying an error flag flushes the outstanding
/// ring without producing a TxMsgAcknowledge RX record, freeing up the
/// in-flight cap for the next send.
#[test]
fn error_flagged_ack_flushes_without_rx_record() {
    let (channel, transport) = open_channel(0, 1, false);
    channel
        .send(0x200, &[1, 2], 2, FrameFlags::STANDARD, None)
        .unwrap();

    // At the cap already: a second send would overflow without a flush.
    assert!(matches!(
        channel.send(0x200, &[1, 2], 2, FrameFlags::STANDARD, None),
        Err(Error::TransmitBufferOverflow { outstanding: 1 })
    ));

    transport.inject(DeviceEvent::TxAck {
        channel: 0,
        transaction_id: 0,
        flags: FrameFlags::ERROR_FRAME,
        timestamp_raw: 10,
    });

    let err = channel.read_wait(Some(Duration::from_millis(80))).unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // The ring was flushed, so the cap is free again.
    channel
        .send(0x200, &[1, 2], 2, FrameFlags::STANDARD, None)
        .expect("flush should have freed the in-flight cap");
    let submitted = transport.drain_submitted();
    assert_eq!(submitted.last().unwrap().header.transaction_id, 1);
}

/// Invariant: timestamps handed back from `readWait` do not decrease
/// within a single open session, even across classic-frame events with
/// increasing raw device ticks.
#[test]
fn readwait_timestamps_are_non_decreasing() {
    let (channel, transport) = open_channel(0, 4, false);

    transport.inject(DeviceEvent::RxClassic {
        channel: 0,
        can_id: 0x10,
        flags: FrameFlags::STANDARD,
        dlc: 1,
        data: vec![1],
        timestamp_raw: 1_000,
    });
    transport.inject(DeviceEvent::RxClassic {
        channel: 0,
        can_id: 0x11,
        flags: FrameFlags::STANDARD,
        dlc: 1,
        data: vec![2],
        timestamp_raw: 2_000,
    });

    let first = channel.read_wait(Some(Duration::from_secs(1))).unwrap();
    let second = channel.read_wait(Some(Duration::from_secs(1))).unwrap();
    assert!(second.timestamp_us >= first.timestamp_us);
}

/// Law: close is idempotent, and after it returns, readWait never
/// produces a frame again.
#[test]
fn close_is_idempotent_and_readwait_stays_timed_out_after() {
    let (channel, transport) = open_channel(0, 4, false);
    transport.set_next_reply(ack_reply());
    assert!(channel.close().is_ok());
    assert!(channel.close().is_ok());

    transport.inject(DeviceEvent::RxClassic {
        channel: 0,
        can_id: 0x10,
        flags: FrameFlags::STANDARD,
        dlc: 1,
        data: vec![1],
        timestamp_raw: 1,
    });
    let err = channel.read_wait(Some(Duration::ZERO)).unwrap_err();
    assert!(matches!(err, Error::Timeout));
}
