//! Sends a burst of heaps through a writer and receives them on a reader,
//! both attached to the simulated device with loopback enabled.
//!
//! Run with `RUST_LOG=verbline=debug` to see stream setup.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing_subscriber::EnvFilter;
use verbline::verbs::sim::SimDevice;
use verbline::{
    Driver, HeapQueue, ItemStatus, MprqReader, PacketSink, RecvConfigBuilder, SendConfigBuilder,
    UdpIbvWriter, WakeAction,
};

const HEAPS: usize = 64;
const PACKETS_PER_HEAP: usize = 8;
const PAYLOAD: usize = 1400;

/// Counts packets and checks that every payload byte carries its heap tag.
struct Verify {
    packets: usize,
    bytes: usize,
    corrupt: usize,
}

impl PacketSink for Verify {
    fn add_packet(&mut self, payload: &[u8]) {
        let tag = (self.packets / PACKETS_PER_HEAP) as u8;
        if payload.iter().any(|&b| b != tag) {
            self.corrupt += 1;
        }
        self.packets += 1;
        self.bytes += payload.len();
    }

    fn is_stopped(&self) -> bool {
        self.packets == HEAPS * PACKETS_PER_HEAP
    }
}

fn main() -> Result<(), verbline::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let device = Rc::new(SimDevice::default());
    device.set_loopback(true);
    let group: SocketAddr = "239.10.0.1:7148"
        .parse()
        .map_err(|_| verbline::Error::InvalidArgument("bad group address".into()))?;

    let send = SendConfigBuilder::new()
        .endpoint(group)
        .interface_address(device.interface().into())
        .source_port(9000)
        .rate(50e6)
        .build()?;
    let recv = RecvConfigBuilder::new()
        .endpoint(group)
        .interface_address(device.interface().into())
        .buffer_size(4 << 20)
        .build()?;

    let observer = verbline::observer::tracing();
    let mut reader = MprqReader::new(Rc::clone(&device), &recv, Rc::clone(&observer))?;
    let mut writer = UdpIbvWriter::new(Rc::clone(&device), &send, observer)?;
    let mut driver = Driver::new(32)?;

    let mut queue = HeapQueue::new(writer.max_packet_size());
    queue.set_rate(writer.software_rate());
    let items = (0..HEAPS)
        .map(|h| {
            let packets = (0..PACKETS_PER_HEAP)
                .map(|_| vec![Bytes::from(vec![h as u8; PAYLOAD])])
                .collect();
            queue.enqueue(packets, 0)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let start = Instant::now();
    driver.flush(&mut writer, &mut queue)?;
    let elapsed = start.elapsed();

    let mut sink = Verify {
        packets: 0,
        bytes: 0,
        corrupt: 0,
    };
    let deadline = Some(Instant::now() + Duration::from_secs(1));
    let outcome = driver.run_reader(&mut reader, &mut sink, deadline)?;

    let sent = items
        .iter()
        .filter(|item| item.status() == ItemStatus::Sent)
        .count();
    println!(
        "sent {sent}/{HEAPS} heaps in {:.1} ms (hw rate limit: {})",
        elapsed.as_secs_f64() * 1e3,
        writer.hw_rate_enabled()
    );
    println!(
        "received {} packets, {} bytes, {} corrupt, complete: {}",
        sink.packets,
        sink.bytes,
        sink.corrupt,
        outcome == WakeAction::Stopped
    );
    Ok(())
}
