//! Channel state machine and channel engine (spec §4.E, §4.F).
//!
//! `ChannelEngine` is the public surface applications use: `open`,
//! `close`, `busOn`/`busOff`, bit-timing setters, `send`, `readWait`, and
//! the assorted getters. Internally it composes the ring buffers (§4.A),
//! timestamp synchroniser (§4.B), reassembler (§4.C), and TX tracker
//! (§4.D) behind the two-mutex, two-condvar locking scheme spec §5
//! requires.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, warn};

use crate::bittiming::{lookup_arbitration, lookup_data};
use crate::device::{Device, EventSink};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameFlags};
use crate::protocol::{
    build_bit_timing_payload, build_data_bit_timing_payload, build_open_payload, BusStatus,
    CommandFrame, DeviceEvent, DriverMode, Header, OpenFlags, OpenReply, ReadClockReply,
};
use crate::reassembly::{FragmentP1, FragmentP2, FragmentP3, Reassembler};
use crate::ring::{RingBuffer, DEFAULT_RX_CAPACITY};
use crate::timestamp::TimestampSync;
use crate::tx_tracker::{BeginSendOutcome, TxTracker};

const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
const DRIFT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

bitflags! {
    /// Selects which event kinds wake a registered callback (spec §4.E
    /// `setEventCallback`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NotifyMask: u32 {
        /// Newly received (or reassembled) frames.
        const RX = 0x1;
        /// Transmit acknowledgements.
        const TX_ACK = 0x2;
        /// Bus status changes.
        const STATUS = 0x4;
        /// Internal/transport errors.
        const ERROR = 0x8;
        /// Bus-on/bus-off transitions.
        const BUS_ON_OFF = 0x10;
    }
}

/// An event handed to a registered callback. Callbacks run on internal
/// (USB read / drift timer) threads and must be reentrancy-tolerant and
/// non-blocking (spec §4.E, Design Notes "callback reentrancy").
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A frame was pushed to the RX ring.
    Rx(Frame),
    /// A transmit was acknowledged.
    TxAck(Frame),
    /// Bus status changed.
    Status(BusStatus),
    /// An internal/transport error occurred.
    Error(String),
    /// The channel transitioned bus-on (`true`) or bus-off (`false`).
    BusOnOff(bool),
}

/// Channel lifecycle state (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No USB resources held, rings empty.
    Closed,
    /// USB channel opened, not driving the bus.
    Open,
    /// Driving the bus.
    BusOn,
}

type Callback = dyn Fn(ChannelEvent) + Send + Sync;

struct RxShared {
    ring: RingBuffer<Frame>,
    reassembler: Reassembler,
}

struct TxShared {
    tracker: TxTracker,
}

struct BusLoadState {
    last_measured: Instant,
}

pub(crate) struct ChannelInner {
    device: Arc<Device>,
    index: u8,

    open_count: AtomicU32,
    state: Mutex<ChannelState>,
    is_fd_mode: AtomicBool,
    current_bitrate: AtomicU32,
    current_data_bitrate: AtomicU32,
    base_clock_divisor: AtomicU32,

    rx: Mutex<RxShared>,
    rx_cond: Condvar,
    tx: Mutex<TxShared>,
    tx_cond: Condvar,

    timestamp: Mutex<Option<TimestampSync>>,
    last_error: Mutex<Option<String>>,
    callback: Mutex<Option<(NotifyMask, Box<Callback>)>>,
    bus_load: Mutex<BusLoadState>,
    bus_load_bits: AtomicU64,

    drift_thread_running: Arc<AtomicBool>,
}

impl ChannelInner {
    fn set_last_error(&self, err: &Error) {
        *self.last_error.lock().unwrap() = Some(err.to_string());
    }

    fn fire(&self, kind: NotifyMask, event: ChannelEvent) {
        if let Some((mask, cb)) = self.callback.lock().unwrap().as_ref() {
            if mask.contains(kind) {
                cb(event);
            }
        }
    }

    /// Pushes `frame` onto the RX ring under `rx_mutex` and wakes any
    /// `readWait` waiter (spec §5 suspension points). Overflow is logged
    /// and the frame silently dropped (spec §4.A contract).
    fn push_rx(&self, frame: Frame) {
        self.bus_load_bits
            .fetch_add(frame.bus_load_bits() as u64, Ordering::Relaxed);
        let mut rx = self.rx.lock().unwrap();
        if !rx.ring.write(frame.clone()) {
            warn!("channel {}: RX ring overflow, dropping frame", self.index);
            return;
        }
        drop(rx);
        self.rx_cond.notify_one();
        self.fire(NotifyMask::RX, ChannelEvent::Rx(frame));
    }
}

impl EventSink for ChannelInner {
    fn dispatch_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::RxClassic {
                can_id,
                flags,
                dlc,
                data,
                timestamp_raw,
                ..
            } => {
                if flags.contains(FrameFlags::CAN_FD_FRAME) && !self.is_fd_mode.load(Ordering::SeqCst) {
                    warn!("channel {}: dropping FD-flagged classic frame, channel not in FD mode", self.index);
                    return;
                }
                let ts = self
                    .timestamp
                    .lock()
                    .unwrap()
                    .as_mut()
                    .map(|sync| sync.stamp_wide(timestamp_raw))
                    .unwrap_or(0);
                let mut frame = Frame::new(can_id, &data, dlc, flags);
                frame.timestamp_us = ts;
                self.push_rx(frame);
            }
            DeviceEvent::RxFragmentP1 {
                can_id,
                flags,
                dlc,
                data,
                timestamp_raw,
                ..
            } => {
                if !self.is_fd_mode.load(Ordering::SeqCst) {
                    warn!("channel {}: dropping FD fragment, channel not in FD mode", self.index);
                    return;
                }
                let mut rx = self.rx.lock().unwrap();
                let completed = rx.reassembler.on_p1(FragmentP1 {
                    can_id,
                    flags,
                    dlc,
                    data,
                    timestamp_raw,
                });
                drop(rx);
                self.emit_reassembled(completed);
            }
            DeviceEvent::RxFragmentP2 { data, .. } => {
                let mut rx = self.rx.lock().unwrap();
                let completed = rx.reassembler.on_p2(FragmentP2 { data });
                drop(rx);
                self.emit_reassembled(completed);
            }
            DeviceEvent::RxFragmentP3 { data, .. } => {
                let mut rx = self.rx.lock().unwrap();
                let completed = rx.reassembler.on_p3(FragmentP3 { data });
                drop(rx);
                self.emit_reassembled(completed);
            }
            DeviceEvent::TxAck {
                transaction_id,
                flags,
                timestamp_raw,
                ..
            } => self.handle_tx_ack(transaction_id, flags, timestamp_raw),
            DeviceEvent::Status { status, .. } => {
                self.fire(NotifyMask::STATUS, ChannelEvent::Status(status));
            }
        }
    }
}

impl ChannelInner {
    fn emit_reassembled(&self, completed: Option<Frame>) {
        if let Some(mut frame) = completed {
            let raw = frame.timestamp_us as u32;
            let ts = self
                .timestamp
                .lock()
                .unwrap()
                .as_mut()
                .map(|sync| sync.normalize_event(raw))
                .unwrap_or(0);
            frame.timestamp_us = ts;
            self.push_rx(frame);
        }
    }

    /// Ack path (spec §4.D step 1-3): acquire `tx_mutex`, match, release,
    /// then acquire `rx_mutex` to push the derived event -- the lock
    /// ordering spec §5 requires, never held simultaneously.
    fn handle_tx_ack(&self, transaction_id: u8, flags: FrameFlags, timestamp_raw: u64) {
        let matched = {
            let mut tx = self.tx.lock().unwrap();
            let matched = tx.tracker.match_ack(transaction_id);
            if flags.contains(FrameFlags::ERROR_FRAME) {
                warn!("channel {}: TX ack carried error flag, flushing TX ring", self.index);
                tx.tracker.flush();
            }
            matched
        };
        self.tx_cond.notify_one();

        let Some(entry) = matched else {
            debug!("channel {}: unmatched TX ack for transaction {transaction_id}", self.index);
            return;
        };
        if flags.contains(FrameFlags::ERROR_FRAME) {
            return;
        }

        let ts = self
            .timestamp
            .lock()
            .unwrap()
            .as_mut()
            .map(|sync| sync.stamp_wide(timestamp_raw))
            .unwrap_or(0);
        let mut frame = Frame::new(entry.can_id, &entry.data[..entry.dlc as usize], entry.dlc, entry.flags);
        frame.flags |= FrameFlags::TX_MSG_ACKNOWLEDGE;
        frame.timestamp_us = ts;
        self.push_rx(frame.clone());
        self.fire(NotifyMask::TX_ACK, ChannelEvent::TxAck(frame));
    }
}

/// Public channel handle. Cheaply cloneable; every clone shares the same
/// underlying state, so it can be handed to a client thread, the USB
/// dispatch thread, and a drift-sync timer thread simultaneously, as
/// spec §5's concurrency model requires.
#[derive(Clone)]
pub struct ChannelEngine {
    inner: Arc<ChannelInner>,
}

impl ChannelEngine {
    /// Creates a channel engine bound to `index` on `device`, initially
    /// Closed.
    pub fn new(device: Arc<Device>, index: u8) -> ChannelEngine {
        ChannelEngine {
            inner: Arc::new(ChannelInner {
                device,
                index,
                open_count: AtomicU32::new(0),
                state: Mutex::new(ChannelState::Closed),
                is_fd_mode: AtomicBool::new(false),
                current_bitrate: AtomicU32::new(0),
                current_data_bitrate: AtomicU32::new(0),
                base_clock_divisor: AtomicU32::new(1),
                rx: Mutex::new(RxShared {
                    ring: RingBuffer::new(DEFAULT_RX_CAPACITY),
                    reassembler: Reassembler::new(),
                }),
                rx_cond: Condvar::new(),
                tx: Mutex::new(TxShared {
                    tracker: TxTracker::new(0),
                }),
                tx_cond: Condvar::new(),
                timestamp: Mutex::new(None),
                last_error: Mutex::new(None),
                callback: Mutex::new(None),
                bus_load: Mutex::new(BusLoadState {
                    last_measured: Instant::now(),
                }),
                bus_load_bits: AtomicU64::new(0),
                drift_thread_running: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Channel index on its device.
    pub fn index(&self) -> u8 {
        self.inner.index
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock().unwrap()
    }

    /// The last error message recorded by a failed operation, if any
    /// (spec `last_error_text`).
    pub fn last_error_text(&self) -> Option<String> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Opens the channel: Closed -> Open (spec §4.E, §4.F). Fails if the
    /// channel is already open, or `flags` requests shared mode.
    pub fn open(&self, flags: OpenFlags) -> Result<()> {
        if flags.contains(OpenFlags::SHARED_MODE) {
            let err = Error::State {
                channel: self.inner.index,
                reason: "shared mode not supported on this channel".into(),
            };
            self.inner.set_last_error(&err);
            return Err(err);
        }

        if self
            .inner
            .open_count
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let err = Error::State {
                channel: self.inner.index,
                reason: "channel is already open".into(),
            };
            self.inner.set_last_error(&err);
            return Err(err);
        }

        {
            let mut rx = self.inner.rx.lock().unwrap();
            rx.ring.clear();
            rx.reassembler.reset();
        }
        {
            let mut tx = self.inner.tx.lock().unwrap();
            tx.tracker = TxTracker::new(0);
        }
        self.inner.device.acquire();

        let is_fd = flags.contains(OpenFlags::CAN_FD);
        let fd_non_iso = flags.contains(OpenFlags::CAN_FD_NON_ISO);
        let cmd = CommandFrame {
            header: Header {
                cmd_id: crate::protocol::CommandId::Open as u8,
                transaction_id: 0,
                channel: self.inner.index,
                reserved: 0,
                timestamp_lo: 0,
            },
            payload: build_open_payload(1, is_fd, fd_non_iso),
        };

        let reply = match self
            .inner
            .device
            .transport
            .send_and_wait_reply(cmd, COMMAND_TIMEOUT)
        {
            Ok(reply) => reply,
            Err(e) => {
                self.inner.open_count.store(0, Ordering::SeqCst);
                self.inner.device.release();
                self.inner.set_last_error(&e);
                return Err(e);
            }
        };

        let open_reply = OpenReply::unpack(&reply.payload);
        // Design Notes §9: take base_clock_divisor verbatim from the
        // device, rather than the source's `min(x,1)`-then-hardcode-70
        // workaround for high-index channels.
        self.inner
            .base_clock_divisor
            .store(open_reply.base_clock_divisor.max(1), Ordering::SeqCst);
        self.inner.is_fd_mode.store(is_fd, Ordering::SeqCst);

        {
            let mut tx = self.inner.tx.lock().unwrap();
            tx.tracker.set_max_outstanding(open_reply.max_pending_tx);
        }
        {
            let mut sync = self.inner.timestamp.lock().unwrap();
            let mut ts = TimestampSync::new(open_reply.base_clock_divisor.max(1));
            ts.adjust_initial_drift(open_reply.clock_start_ref as u64);
            *sync = Some(ts);
        }

        self.inner
            .device
            .register_channel(self.inner.index, Arc::downgrade(&self.inner) as Weak<dyn EventSink>);

        *self.inner.state.lock().unwrap() = ChannelState::Open;
        self.start_drift_thread();
        Ok(())
    }

    fn start_drift_thread(&self) {
        self.inner.drift_thread_running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let running = self.inner.drift_thread_running.clone();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(DRIFT_SYNC_INTERVAL);
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let cmd = CommandFrame {
                    header: Header {
                        cmd_id: crate::protocol::CommandId::ReadClock as u8,
                        transaction_id: 0,
                        channel: inner.index,
                        reserved: 0,
                        timestamp_lo: 0,
                    },
                    payload: Vec::new(),
                };
                match inner.device.transport.send_and_wait_reply(cmd, COMMAND_TIMEOUT) {
                    Ok(reply) => {
                        let clock = ReadClockReply::unpack(&reply.payload);
                        if let Some(sync) = inner.timestamp.lock().unwrap().as_mut() {
                            sync.adjust_drift(clock.clock_value / clock.divisor.max(1) as u64);
                        }
                    }
                    Err(e) => warn!("channel {}: drift sync clock read failed: {e}", inner.index),
                }
            }
        });
    }

    /// Closes the channel: idempotent after first success (spec §4.F).
    /// Performs bus-off first if needed.
    pub fn close(&self) -> Result<()> {
        let current = *self.inner.state.lock().unwrap();
        if current == ChannelState::Closed {
            return Ok(());
        }
        if current == ChannelState::BusOn {
            self.bus_off()?;
        }

        let cmd = CommandFrame {
            header: Header {
                cmd_id: crate::protocol::CommandId::Close as u8,
                transaction_id: 0,
                channel: self.inner.index,
                reserved: 0,
                timestamp_lo: 0,
            },
            payload: Vec::new(),
        };
        if let Err(e) = self
            .inner
            .device
            .transport
            .send_and_wait_reply(cmd, COMMAND_TIMEOUT)
        {
            warn!("channel {}: CLOSE command failed: {e}", self.inner.index);
        }

        self.inner.drift_thread_running.store(false, Ordering::SeqCst);
        self.inner.device.unregister_channel(self.inner.index);
        *self.inner.callback.lock().unwrap() = None;
        self.inner.is_fd_mode.store(false, Ordering::SeqCst);
        self.inner.current_bitrate.store(0, Ordering::SeqCst);
        *self.inner.state.lock().unwrap() = ChannelState::Closed;
        self.inner.device.release();
        self.inner.open_count.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Open -> BusOn.
    pub fn bus_on(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            ChannelState::Closed => Err(self.state_error("channel is not open")),
            ChannelState::BusOn => Ok(()),
            ChannelState::Open => {
                let cmd = self.simple_command(crate::protocol::CommandId::BusOn as u8);
                self.inner
                    .device
                    .transport
                    .send_and_wait_reply(cmd, COMMAND_TIMEOUT)
                    .map_err(|e| {
                        self.inner.set_last_error(&e);
                        e
                    })?;
                *state = ChannelState::BusOn;
                drop(state);
                self.inner.fire(NotifyMask::BUS_ON_OFF, ChannelEvent::BusOnOff(true));
                Ok(())
            }
        }
    }

    /// BusOn -> Open. A no-op if already Open (idempotence law, spec §8).
    pub fn bus_off(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            ChannelState::Closed => Err(self.state_error("channel is not open")),
            ChannelState::Open => Ok(()),
            ChannelState::BusOn => {
                let cmd = self.simple_command(crate::protocol::CommandId::BusOff as u8);
                self.inner
                    .device
                    .transport
                    .send_and_wait_reply(cmd, COMMAND_TIMEOUT)
                    .map_err(|e| {
                        self.inner.set_last_error(&e);
                        e
                    })?;
                *state = ChannelState::Open;
                drop(state);
                self.inner.fire(NotifyMask::BUS_ON_OFF, ChannelEvent::BusOnOff(false));
                Ok(())
            }
        }
    }

    fn simple_command(&self, cmd_id: u8) -> CommandFrame {
        CommandFrame {
            header: Header {
                cmd_id,
                transaction_id: 0,
                channel: self.inner.index,
                reserved: 0,
                timestamp_lo: 0,
            },
            payload: Vec::new(),
        }
    }

    fn state_error(&self, reason: &str) -> Error {
        let err = Error::State {
            channel: self.inner.index,
            reason: reason.to_string(),
        };
        self.inner.set_last_error(&err);
        err
    }

    fn require_open(&self) -> Result<()> {
        if *self.inner.state.lock().unwrap() == ChannelState::Closed {
            return Err(self.state_error("channel is not open"));
        }
        Ok(())
    }

    /// Sets the arbitration-phase bitrate via the table lookup in spec
    /// §4.E/§6. `sample_point`/`sjw` are accepted for API compatibility
    /// but ignored -- timing is table-driven.
    pub fn set_bus_parameters(&self, bitrate: u32, _sample_point: f32, _sjw: u32) -> Result<()> {
        self.require_open()?;
        let bt = lookup_arbitration(self.inner.index, bitrate).ok_or_else(|| {
            let err = Error::UnsupportedBitrate(bitrate);
            self.inner.set_last_error(&err);
            err
        })?;
        let mut cmd = self.simple_command(crate::protocol::CommandId::SetBitTiming as u8);
        cmd.payload = build_bit_timing_payload(bt);
        self.inner
            .device
            .transport
            .send_and_wait_reply(cmd, COMMAND_TIMEOUT)
            .map_err(|e| {
                self.inner.set_last_error(&e);
                e
            })?;
        self.inner.current_bitrate.store(bitrate, Ordering::SeqCst);
        Ok(())
    }

    /// Sets the CAN-FD data-phase bitrate via the table lookup in spec
    /// §4.E/§6.
    pub fn set_bus_parameters_fd(&self, bitrate: u32, _sample_point: f32, _sjw: u32) -> Result<()> {
        self.require_open()?;
        let bt = lookup_data(bitrate).ok_or_else(|| {
            let err = Error::UnsupportedBitrate(bitrate);
            self.inner.set_last_error(&err);
            err
        })?;
        let mut cmd = self.simple_command(crate::protocol::CommandId::SetDataBitTiming as u8);
        cmd.payload = build_data_bit_timing_payload(bt);
        self.inner
            .device
            .transport
            .send_and_wait_reply(cmd, COMMAND_TIMEOUT)
            .map_err(|e| {
                self.inner.set_last_error(&e);
                e
            })?;
        self.inner.current_data_bitrate.store(bitrate, Ordering::SeqCst);
        Ok(())
    }

    /// Sets the driver operating mode. Only `Silent` and `Normal` are
    /// accepted (spec §4.E).
    pub fn set_driver_mode(&self, mode: DriverMode) -> Result<()> {
        self.require_open()?;
        if !matches!(mode, DriverMode::Silent | DriverMode::Normal) {
            let err = Error::InvalidParam(format!("driver mode {mode:?} is not accepted"));
            self.inner.set_last_error(&err);
            return Err(err);
        }
        let is_fd = self.inner.is_fd_mode.load(Ordering::SeqCst);
        let mut cmd = self.simple_command(crate::protocol::CommandId::SetOpMode as u8);
        cmd.payload = vec![mode.wire_value(is_fd)];
        self.inner
            .device
            .transport
            .send_and_wait_reply(cmd, COMMAND_TIMEOUT)
            .map_err(|e| {
                self.inner.set_last_error(&e);
                e
            })?;
        Ok(())
    }

    /// Registers (or clears, with an empty mask) the event callback (spec
    /// §4.E). Runs on internal threads -- must not block.
    pub fn set_event_callback<F>(&self, mask: NotifyMask, callback: F)
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        *self.inner.callback.lock().unwrap() = Some((mask, Box::new(callback)));
    }

    /// Sends a frame (spec §4.D send path, §4.F `send`). `timeout` of
    /// `None` fails immediately with `TransmitBufferOverflow` if the
    /// in-flight cap is reached; `Some(d)` waits up to `d` on the TX
    /// condition variable.
    pub fn send(
        &self,
        can_id: u32,
        payload: &[u8],
        dlc: u8,
        flags: FrameFlags,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.require_open()?;
        let is_fd = self.inner.is_fd_mode.load(Ordering::SeqCst);
        if !Frame::validate_dlc(dlc, is_fd) {
            let err = Error::InvalidParam(format!("dlc {dlc} invalid (fd={is_fd})"));
            self.inner.set_last_error(&err);
            return Err(err);
        }
        if !flags.has_exactly_one_id_kind() {
            let err = Error::InvalidParam("exactly one of Standard/Extended must be set".into());
            self.inner.set_last_error(&err);
            return Err(err);
        }

        let frame = Frame::new(can_id, payload, dlc, flags);
        let mut tx = self.inner.tx.lock().unwrap();
        let transaction_id = loop {
            match tx.tracker.begin_send() {
                BeginSendOutcome::Allocated(id) => break id,
                BeginSendOutcome::AtCapacity => {
                    let outstanding = tx.tracker.outstanding_count();
                    match timeout {
                        None => {
                            let err = Error::TransmitBufferOverflow { outstanding };
                            self.inner.set_last_error(&err);
                            return Err(err);
                        }
                        Some(d) => {
                            let (guard, result) = self.inner.tx_cond.wait_timeout(tx, d).unwrap();
                            tx = guard;
                            if result.timed_out() {
                                let err = Error::TransmitBufferOverflow { outstanding };
                                self.inner.set_last_error(&err);
                                return Err(err);
                            }
                        }
                    }
                }
            }
        };

        let commands = build_tx_commands(self.inner.index, transaction_id, &frame);
        for cmd in commands {
            if let Err(e) = self.inner.device.transport.submit_command(cmd) {
                let err = Error::SendError(e.to_string());
                self.inner.set_last_error(&err);
                return Err(err);
            }
        }
        tx.tracker.commit_send(transaction_id, &frame);
        self.inner
            .bus_load_bits
            .fetch_add(frame.bus_load_bits() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks until a frame is available or `timeout` elapses (`None`
    /// waits forever, spec §4.F `readWait` with `timeout_ms = -1`).
    pub fn read_wait(&self, timeout: Option<Duration>) -> Result<Frame> {
        if *self.inner.state.lock().unwrap() == ChannelState::Closed {
            return Err(Error::Timeout);
        }
        let mut rx = self.inner.rx.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(frame) = rx.ring.read() {
                return Ok(frame);
            }
            match deadline {
                None => rx = self.inner.rx_cond.wait(rx).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (guard, result) = self
                        .inner
                        .rx_cond
                        .wait_timeout(rx, deadline - now)
                        .unwrap();
                    rx = guard;
                    if result.timed_out() && rx.ring.is_empty() {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }

    /// Bus load percentage (0-100) observed since the last call (spec
    /// §4.F `getBusLoad`).
    pub fn get_bus_load(&self) -> u32 {
        let now = Instant::now();
        let mut state = self.inner.bus_load.lock().unwrap();
        let dt = now.duration_since(state.last_measured).as_secs_f64().max(1e-6);
        state.last_measured = now;
        let bits = self.inner.bus_load_bits.swap(0, Ordering::SeqCst);
        let bitrate = self.inner.current_bitrate.load(Ordering::SeqCst).max(1) as f64;
        let load = (bits as f64 * 100.0) / (bitrate * dt);
        load.min(100.0) as u32
    }

    /// Capability bitmask reported by the device.
    pub fn get_capabilities(&self) -> u32 {
        self.inner.device.info.capabilities
    }

    /// Reads the device clock and returns it in host-epoch microseconds
    /// (spec §4.F `getDeviceClock`).
    pub fn get_device_clock(&self) -> Result<u64> {
        let cmd = self.simple_command(crate::protocol::CommandId::ReadClock as u8);
        let reply = self
            .inner
            .device
            .transport
            .send_and_wait_reply(cmd, COMMAND_TIMEOUT)
            .map_err(|e| Error::ClockRead(e.to_string()))?;
        let clock = ReadClockReply::unpack(&reply.payload);
        let mut sync = self.inner.timestamp.lock().unwrap();
        Ok(sync
            .as_mut()
            .map(|s| s.normalize_timer(clock.clock_value))
            .unwrap_or(clock.clock_value))
    }

    /// Device serial number.
    pub fn get_serial_number(&self) -> u32 {
        self.inner.device.info.serial_number
    }

    /// Device product code.
    pub fn get_product_code(&self) -> u32 {
        self.inner.device.info.product_code
    }

    /// Device firmware version.
    pub fn get_firmware_version(&self) -> u32 {
        self.inner.device.info.firmware_version
    }
}

/// Builds the one, two, or three fragment commands needed to transmit
/// `frame` (spec §4.D step 4). Classic frames (dlc <= 8, not in FD mode)
/// are sent as a single TX_CAN20. FD frames are split P1 (up to 20 bytes),
/// P2 when `dlc > 20` (up to 28 bytes), P3 when `dlc > 48` (up to 16
/// bytes) -- the TX-side thresholds used by `sendFD`
/// (`examples/original_source/src/zzenocanchannel.cpp`), which differ from
/// the RX reassembler's 18/46-byte thresholds.
fn build_tx_commands(channel: u8, transaction_id: u8, frame: &Frame) -> Vec<CommandFrame> {
    let header = |cmd_id: u8| Header {
        cmd_id,
        transaction_id,
        channel,
        reserved: 0,
        timestamp_lo: 0,
    };

    let is_fd_frame = frame.flags.contains(FrameFlags::CAN_FD_FRAME) || frame.dlc > 8;
    if !is_fd_frame {
        let mut payload = Vec::with_capacity(4 + 4 + 1 + 8);
        payload.extend_from_slice(&frame.can_id.to_le_bytes());
        payload.extend_from_slice(&frame.flags.bits().to_le_bytes());
        payload.push(frame.dlc);
        let mut data = [0u8; 8];
        let n = frame.dlc.min(8) as usize;
        data[..n].copy_from_slice(&frame.data[..n]);
        payload.extend_from_slice(&data);
        return vec![CommandFrame {
            header: header(crate::protocol::CommandId::TxCan20 as u8),
            payload,
        }];
    }

    let dlc = frame.dlc as usize;
    let mut commands = Vec::with_capacity(3);

    let p1_len = dlc.min(20);
    let mut p1_payload = Vec::with_capacity(4 + 4 + 1 + 20);
    p1_payload.extend_from_slice(&frame.can_id.to_le_bytes());
    p1_payload.extend_from_slice(&frame.flags.bits().to_le_bytes());
    p1_payload.push(frame.dlc);
    let mut p1_data = [0u8; 20];
    p1_data[..p1_len].copy_from_slice(&frame.data[..p1_len]);
    p1_payload.extend_from_slice(&p1_data);
    commands.push(CommandFrame {
        header: header(crate::protocol::CommandId::TxCanFdP1 as u8),
        payload: p1_payload,
    });

    if dlc > 20 {
        let p2_len = dlc.min(48) - 20;
        let mut p2_data = [0u8; 28];
        p2_data[..p2_len].copy_from_slice(&frame.data[20..20 + p2_len]);
        commands.push(CommandFrame {
            header: header(crate::protocol::CommandId::TxCanFdP2 as u8),
            payload: p2_data.to_vec(),
        });

        if dlc > 48 {
            let p3_len = dlc - 48;
            let mut p3_data = [0u8; 16];
            p3_data[..p3_len].copy_from_slice(&frame.data[48..48 + p3_len]);
            commands.push(CommandFrame {
                header: header(crate::protocol::CommandId::TxCanFdP3 as u8),
                payload: p3_data.to_vec(),
            });
        }
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use crate::protocol::{Header as Hdr, ReplyFrame};
    use crate::transport::FakeTransport;

    fn make_engine() -> (ChannelEngine, Arc<FakeTransport>) {
        let transport = FakeTransport::new();
        let device = Device::new(transport.clone(), 8, DeviceInfo::default());
        (ChannelEngine::new(device, 0), transport)
    }

    fn queue_open_reply(transport: &FakeTransport, max_pending_tx: u32) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&max_pending_tx.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        transport.set_next_reply(ReplyFrame {
            header: Hdr {
                cmd_id: crate::protocol::CommandId::OpenReply as u8,
                transaction_id: 0,
                channel: 0,
                reserved: 0,
                timestamp_lo: 0,
            },
            payload,
        });
    }

    fn queue_ack_reply(transport: &FakeTransport) {
        transport.set_next_reply(ReplyFrame {
            header: Hdr {
                cmd_id: 0,
                transaction_id: 0,
                channel: 0,
                reserved: 0,
                timestamp_lo: 0,
            },
            payload: Vec::new(),
        });
    }

    #[test]
    fn open_twice_fails() {
        let (engine, transport) = make_engine();
        queue_open_reply(&transport, 4);
        engine.open(OpenFlags::empty()).unwrap();
        let err = engine.open(OpenFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::State { .. }));
        assert!(engine.last_error_text().unwrap().contains("already open"));
    }

    #[test]
    fn close_is_idempotent() {
        let (engine, transport) = make_engine();
        queue_open_reply(&transport, 4);
        engine.open(OpenFlags::empty()).unwrap();
        queue_ack_reply(&transport);
        assert!(engine.close().is_ok());
        assert!(engine.close().is_ok());
    }

    #[test]
    fn bus_off_while_open_is_noop() {
        let (engine, transport) = make_engine();
        queue_open_reply(&transport, 4);
        engine.open(OpenFlags::empty()).unwrap();
        assert!(engine.bus_off().is_ok());
        assert_eq!(engine.state(), ChannelState::Open);
    }

    #[test]
    fn send_with_bad_flags_is_invalid_param() {
        let (engine, transport) = make_engine();
        queue_open_reply(&transport, 4);
        engine.open(OpenFlags::empty()).unwrap();
        let err = engine
            .send(0x100, &[1, 2, 3], 3, FrameFlags::empty(), Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn send_overflow_with_zero_timeout() {
        let (engine, transport) = make_engine();
        queue_open_reply(&transport, 4);
        engine.open(OpenFlags::empty()).unwrap();
        for _ in 0..4 {
            engine
                .send(0x100, &[1], 1, FrameFlags::STANDARD, None)
                .unwrap();
        }
        let err = engine
            .send(0x100, &[1], 1, FrameFlags::STANDARD, None)
            .unwrap_err();
        assert!(matches!(err, Error::TransmitBufferOverflow { outstanding: 4 }));
    }

    #[test]
    fn readwait_times_out_when_idle() {
        let (engine, transport) = make_engine();
        queue_open_reply(&transport, 4);
        engine.open(OpenFlags::empty()).unwrap();
        let start = Instant::now();
        let err = engine.read_wait(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn readwait_after_close_times_out_immediately() {
        let (engine, transport) = make_engine();
        queue_open_reply(&transport, 4);
        engine.open(OpenFlags::empty()).unwrap();
        queue_ack_reply(&transport);
        engine.close().unwrap();
        let err = engine.read_wait(Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn unsupported_bitrate_on_high_channel() {
        let transport = FakeTransport::new();
        let device = Device::new(transport.clone(), 8, DeviceInfo::default());
        let engine = ChannelEngine::new(device, 4);
        queue_open_reply(&transport, 4);
        engine.open(OpenFlags::empty()).unwrap();
        let err = engine.set_bus_parameters(1_000_000, 0.0, 0).unwrap_err();
        assert!(matches!(err, Error::UnsupportedBitrate(_)));
        assert!(engine.last_error_text().unwrap().contains("not supported")
            || format!("{err}").contains("not supported"));
    }
}
