//! Opens the first matching USB adapter, goes bus-on at 500 kbit/s, prints
//! every received frame, and sends an incrementing counter frame once a
//! second until interrupted.

use std::time::Duration;

use zenocan::channel::{ChannelEngine, ChannelEvent, NotifyMask};
use zenocan::device::LibraryContext;
use zenocan::frame::FrameFlags;
use zenocan::protocol::OpenFlags;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let ctx = LibraryContext::new();
    let device = ctx.open_first_device(1)?;
    let channel = ChannelEngine::new(device, 0);

    channel.open(OpenFlags::empty())?;
    channel.set_bus_parameters(500_000, 0.875, 1)?;

    channel.set_event_callback(NotifyMask::RX | NotifyMask::ERROR, |event| {
        if let ChannelEvent::Rx(frame) = event {
            println!(
                "rx id={:#x} dlc={} data={:02x?} ts={}us",
                frame.can_id,
                frame.dlc,
                frame.payload(),
                frame.timestamp_us
            );
        }
    });

    channel.bus_on()?;

    let mut counter: u8 = 0;
    loop {
        let payload = [counter, 0, 0, 0];
        channel.send(
            0x123,
            &payload,
            payload.len() as u8,
            FrameFlags::STANDARD,
            Some(Duration::from_millis(100)),
        )?;
        counter = counter.wrapping_add(1);
        std::thread::sleep(Duration::from_secs(1));
    }
}
