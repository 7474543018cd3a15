//! Integration tests: send and receive streams against the simulated device.
//!
//! The simulator loops transmitted frames back through its flow steering
//! rules, so a writer and a reader on the same device exercise framing,
//! steering, striding receive and completion accounting end to end.

#![cfg(feature = "sim")]

use std::cell::RefCell;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use verbline::verbs::sim::{ObjectKind, SimConfig, SimDevice};
use verbline::{
    Driver, Error, HeapQueue, ItemStatus, Level, MemoryRange, MprqReader, Observer, PacketSink,
    RecvConfigBuilder, SendConfigBuilder, UdpIbvWriter, WakeAction,
};

// ── Helpers ─────────────────────────────────────────────────────────

const GROUP_A: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 4, 0, 1)), 7000);
const GROUP_B: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 4, 0, 2)), 7001);

#[derive(Default)]
struct Recorder {
    messages: RefCell<Vec<(Level, String)>>,
}

impl Recorder {
    fn contains(&self, needle: &str) -> bool {
        self.messages.borrow().iter().any(|(_, m)| m.contains(needle))
    }
}

impl Observer for Recorder {
    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        self.messages.borrow_mut().push((level, message.to_string()));
    }
}

#[derive(Default)]
struct Collect {
    packets: Vec<Vec<u8>>,
    limit: Option<usize>,
}

impl PacketSink for Collect {
    fn add_packet(&mut self, payload: &[u8]) {
        self.packets.push(payload.to_vec());
    }

    fn is_stopped(&self) -> bool {
        self.limit.is_some_and(|n| self.packets.len() >= n)
    }
}

fn looped_device() -> Rc<SimDevice> {
    let sim = Rc::new(SimDevice::default());
    sim.set_loopback(true);
    sim
}

fn iface(sim: &SimDevice) -> IpAddr {
    IpAddr::V4(sim.interface())
}

/// Busy-polling writer: every wait resolves to `Immediate`.
fn send_builder(sim: &SimDevice) -> SendConfigBuilder {
    SendConfigBuilder::new()
        .interface_address(iface(sim))
        .source_port(9000)
        .buffer_size(64 * 1024)
        .comp_vector(-1)
}

fn recv_builder(sim: &SimDevice) -> RecvConfigBuilder {
    RecvConfigBuilder::new()
        .interface_address(iface(sim))
        .buffer_size(4 << 20)
        .comp_vector(-1)
}

/// Run `writer` until the source has nothing left in flight.
fn pump(writer: &mut UdpIbvWriter<SimDevice>, queue: &mut HeapQueue) {
    for _ in 0..10_000 {
        match writer.wakeup(queue).unwrap() {
            WakeAction::Immediate => {}
            WakeAction::NewPackets => return,
            other => panic!("unexpected {other:?}"),
        }
    }
    panic!("writer did not settle");
}

fn heap(tag: u8, packets: usize, len: usize) -> Vec<Vec<Bytes>> {
    (0..packets)
        .map(|i| vec![Bytes::from(vec![tag.wrapping_add(i as u8); len])])
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn heaps_arrive_in_order_across_substreams() {
    let sim = looped_device();
    let send = send_builder(&sim)
        .endpoint(GROUP_A)
        .endpoint(GROUP_B)
        .build()
        .unwrap();
    let mut writer = UdpIbvWriter::new(Rc::clone(&sim), &send, verbline::observer::tracing())
        .unwrap();
    assert_eq!(writer.num_substreams(), 2);
    let recv = recv_builder(&sim)
        .endpoint(GROUP_A)
        .endpoint(GROUP_B)
        .build()
        .unwrap();
    let mut reader =
        MprqReader::new(Rc::clone(&sim), &recv, verbline::observer::tracing()).unwrap();

    let mut queue = HeapQueue::new(writer.max_packet_size());
    let items: Vec<_> = (0..10u8)
        .map(|h| queue.enqueue(heap(h * 16, 3, 700), usize::from(h % 2)).unwrap())
        .collect();
    pump(&mut writer, &mut queue);
    assert!(queue.is_idle());
    assert_eq!(writer.available(), writer.n_slots());
    for item in &items {
        assert_eq!(item.status(), ItemStatus::Sent);
        assert_eq!(item.bytes_sent(), 2100);
    }

    let mut sink = Collect::default();
    assert_eq!(reader.read(&mut sink).unwrap(), WakeAction::Immediate);
    assert_eq!(sink.packets.len(), 30);
    for (n, packet) in sink.packets.iter().enumerate() {
        let expected = (n / 3) as u8 * 16 + (n % 3) as u8;
        assert_eq!(packet, &vec![expected; 700], "packet {n}");
    }
    assert_eq!(sim.dropped_frames(), 0);
}

#[test]
fn registered_memory_is_received_intact() {
    static ARENA: [u8; 4096] = {
        let mut a = [0u8; 4096];
        let mut i = 0;
        while i < a.len() {
            a[i] = (i % 251) as u8;
            i += 1;
        }
        a
    };
    let sim = looped_device();
    let send = send_builder(&sim)
        .endpoint(GROUP_A)
        .memory_region(MemoryRange::from_static(&ARENA))
        .build()
        .unwrap();
    let mut writer = UdpIbvWriter::new(Rc::clone(&sim), &send, verbline::observer::tracing())
        .unwrap();
    let recv = recv_builder(&sim).endpoint(GROUP_A).build().unwrap();
    let mut reader =
        MprqReader::new(Rc::clone(&sim), &recv, verbline::observer::tracing()).unwrap();

    let header = Bytes::from_static(b"hdr:");
    let body = Bytes::from_static(&ARENA[100..1100]);
    let mut queue = HeapQueue::new(writer.max_packet_size());
    let item = queue
        .enqueue(vec![vec![header.clone(), body.clone()]], 0)
        .unwrap();
    pump(&mut writer, &mut queue);
    assert_eq!(item.status(), ItemStatus::Sent);

    let mut sink = Collect::default();
    reader.read(&mut sink).unwrap();
    let mut expected = header.to_vec();
    expected.extend_from_slice(&body);
    assert_eq!(sink.packets, vec![expected]);
}

#[test]
fn failed_completion_fails_only_its_batch() {
    let sim = looped_device();
    let send = send_builder(&sim).endpoint(GROUP_A).build().unwrap();
    let mut writer = UdpIbvWriter::new(Rc::clone(&sim), &send, verbline::observer::tracing())
        .unwrap();
    let mut queue = HeapQueue::new(writer.max_packet_size());

    sim.fail_sends(1);
    let failed = queue.enqueue(heap(1, 2, 100), 0).unwrap();
    pump(&mut writer, &mut queue);
    assert_eq!(failed.status(), ItemStatus::Failed(libc::EIO));
    assert_eq!(failed.bytes_sent(), 0);

    let ok = queue.enqueue(heap(2, 2, 100), 0).unwrap();
    pump(&mut writer, &mut queue);
    assert_eq!(ok.status(), ItemStatus::Sent);
    assert_eq!(ok.bytes_sent(), 200);
}

#[test]
fn unicast_reaches_interface_flow() {
    let sim = looped_device();
    let target = SocketAddr::new(iface(&sim), 9100);
    let send = send_builder(&sim)
        .unicast_endpoint(target, sim.mac())
        .build()
        .unwrap();
    let mut writer = UdpIbvWriter::new(Rc::clone(&sim), &send, verbline::observer::tracing())
        .unwrap();
    let recv = recv_builder(&sim).endpoint(target).build().unwrap();
    let mut reader =
        MprqReader::new(Rc::clone(&sim), &recv, verbline::observer::tracing()).unwrap();

    let mut queue = HeapQueue::new(writer.max_packet_size());
    queue.enqueue(heap(9, 1, 64), 0).unwrap();
    pump(&mut writer, &mut queue);

    let mut sink = Collect::default();
    reader.read(&mut sink).unwrap();
    assert_eq!(sink.packets, vec![vec![9; 64]]);
}

#[test]
fn receive_capacity_is_reduced_to_device_limits() {
    let mut config = SimConfig::default();
    // Room for the strides of two 1 MiB entries only.
    config.attr.max_cqe = 2 * 16384;
    let sim = Rc::new(SimDevice::new(config));
    let recorder = Rc::new(Recorder::default());
    let recv = recv_builder(&sim).endpoint(GROUP_A).build().unwrap();
    let reader = MprqReader::new(Rc::clone(&sim), &recv, recorder.clone()).unwrap();
    assert!(reader.layout().reduced);
    assert_eq!(reader.layout().n_wqe, 2);
    assert_eq!(sim.posted_wqes(), 2);
    assert!(recorder.contains("Reducing buffer to 2097152 to accommodate device limits"));
}

#[test]
fn too_few_receive_entries_fail_without_leaks() {
    let mut config = SimConfig::default();
    config.attr.max_qp_wr = 1;
    let sim = Rc::new(SimDevice::new(config));
    let recv = recv_builder(&sim).endpoint(GROUP_A).build().unwrap();
    let err = MprqReader::new(Rc::clone(&sim), &recv, verbline::observer::tracing());
    assert!(matches!(err, Err(Error::NotSupported(_))));
    assert_eq!(sim.live_objects(), 0);
    assert_eq!(sim.busy_destroys(), 0);
}

#[test]
fn streams_release_every_device_object() {
    let sim = looped_device();
    {
        let send = send_builder(&sim).endpoint(GROUP_A).build().unwrap();
        let recv = recv_builder(&sim).endpoint(GROUP_A).build().unwrap();
        let _writer =
            UdpIbvWriter::new(Rc::clone(&sim), &send, verbline::observer::tracing()).unwrap();
        let _reader =
            MprqReader::new(Rc::clone(&sim), &recv, verbline::observer::tracing()).unwrap();
        assert_eq!(sim.live_of(ObjectKind::Flow), 1);
    }
    assert_eq!(sim.live_objects(), 0);
    assert_eq!(sim.busy_destroys(), 0);
}

/// Check if io_uring is supported on this kernel.
fn io_uring_supported() -> bool {
    let ret = unsafe { libc::syscall(libc::SYS_io_uring_setup, 1u32, std::ptr::null_mut::<u8>()) };
    ret != -1 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ENOSYS)
}

#[test]
fn driver_moves_heaps_through_completion_channels() {
    if !io_uring_supported() {
        eprintln!("SKIP: io_uring not supported on this kernel");
        return;
    }
    let Ok(mut driver) = Driver::new(16) else {
        eprintln!("SKIP: io_uring setup failed");
        return;
    };
    let sim = looped_device();
    sim.set_auto_complete(false);
    let send = send_builder(&sim)
        .endpoint(GROUP_A)
        .comp_vector(0)
        .build()
        .unwrap();
    let mut writer = UdpIbvWriter::new(Rc::clone(&sim), &send, verbline::observer::tracing())
        .unwrap();
    let recv = recv_builder(&sim)
        .endpoint(GROUP_A)
        .comp_vector(1)
        .build()
        .unwrap();
    let mut reader =
        MprqReader::new(Rc::clone(&sim), &recv, verbline::observer::tracing()).unwrap();

    let mut queue = HeapQueue::new(writer.max_packet_size());
    let item = queue.enqueue(heap(3, 4, 256), 0).unwrap();
    // Completions are held, so the writer parks on its channel.
    let mut action = writer.wakeup(&mut queue).unwrap();
    while action == WakeAction::Immediate {
        action = writer.wakeup(&mut queue).unwrap();
    }
    assert_eq!(action, WakeAction::CompletionEvent);
    assert!(sim.pending_sends() > 0);
    sim.complete_sends(usize::MAX);
    assert_eq!(
        driver.run_writer(&mut writer, &mut queue).unwrap(),
        WakeAction::NewPackets
    );
    assert_eq!(item.status(), ItemStatus::Sent);

    let mut sink = Collect {
        limit: Some(4),
        ..Collect::default()
    };
    let deadline = Some(Instant::now() + Duration::from_secs(5));
    assert_eq!(
        driver.run_reader(&mut reader, &mut sink, deadline).unwrap(),
        WakeAction::Stopped
    );
    assert_eq!(sink.packets.len(), 4);
}
