//! Raw Ethernet UDP writer over a verbs queue pair.

use std::net::{SocketAddrV4, UdpSocket};
use std::os::fd::RawFd;
use std::rc::Rc;

use super::rate::setup_hw_rate;
use super::region::RegionSet;
use super::slot::{SlotRing, Staging, assemble, slot_counts};
use super::{PacketResult, PacketSource, TransmitPacket, WakeAction};
use crate::config::SendConfig;
use crate::error::{Error, Result};
use crate::frame::{self, FrameTarget, FrameTemplate, HEADER_LEN};
use crate::metrics::{
    SEND_BATCHES, SEND_BYTES, SEND_COPIED_BYTES, SEND_FAILED_COMPLETIONS, SEND_HW_RATE_LIMITED,
    SEND_PACKETS, SEND_SLOTS_EXHAUSTED, SEND_ZERO_COPY_FRAGMENTS,
};
use crate::memory::PinnedBuffer;
use crate::observer::Observer;
use crate::resource::{
    CmId, CompletionChannel, CompletionQueue, DeviceContext, EventChannel, MemoryRegion,
    ProtectionDomain, QueuePair,
};
use crate::verbs::{
    Access, MAX_SGE, Provider, QpCaps, QpInitAttr, QpState, SendWr, WcStatus, WorkCompletion,
};

/// Sends UDP datagrams as raw Ethernet frames.
///
/// Packets are pulled from a [`PacketSource`] in batches, framed into a ring
/// of slots and posted as one chained work request per batch. Only the last
/// request of a chain is signaled; its id carries the batch length so a
/// single completion retires the whole batch.
pub struct UdpIbvWriter<P: Provider> {
    slots: SlotRing,
    chain: Vec<SendWr>,
    regions: RegionSet,
    targets: Vec<FrameTarget>,
    observer: Rc<dyn Observer>,
    frame_size: usize,
    target_batch: usize,
    max_poll: u32,
    max_packet_size: usize,
    rate: f64,
    hw_rate: bool,

    // Handles, dependents first.
    qp: QueuePair<P>,
    _user_mrs: Vec<MemoryRegion<P>>,
    mr: MemoryRegion<P>,
    send_cq: CompletionQueue<P>,
    _recv_cq: CompletionQueue<P>,
    comp_channel: Option<CompletionChannel<P>>,
    _pd: ProtectionDomain<P>,
    _loopback: Option<DeviceContext<P>>,
    cm_id: CmId<P>,
    _event_channel: EventChannel<P>,
    buffer: PinnedBuffer,
    _socket: Option<UdpSocket>,
}

impl<P: Provider> UdpIbvWriter<P> {
    pub fn new(provider: Rc<P>, config: &SendConfig, observer: Rc<dyn Observer>) -> Result<Self> {
        config.validate()?;
        let iface = config.interface_v4()?;

        // Reserve a source port unless the caller picked one.
        let (socket, src_port) = match config.source_port {
            Some(port) => (None, port),
            None => {
                let socket = UdpSocket::bind(SocketAddrV4::new(iface, 0))?;
                let port = socket.local_addr()?.port();
                (Some(socket), port)
            }
        };

        let event_channel = EventChannel::new(provider)?;
        let mut cm_id = CmId::new(&event_channel)?;
        cm_id.bind_addr(iface)?;
        let port = cm_id
            .port()
            .ok_or_else(|| Error::NotSupported(format!("{iface} is not bound to a port")))?;
        let loopback = if config.multicast_loopback {
            Some(DeviceContext::open(Rc::clone(cm_id.provider()), iface)?)
        } else {
            None
        };
        let attr = cm_id.query_device()?;
        let pd = ProtectionDomain::new(&cm_id)?;

        let (n_slots, target_batch) = slot_counts(config.buffer_size, config.max_packet_size);
        let cqe = u32::try_from(n_slots)
            .map_err(|_| Error::invalid("buffer_size is too large"))?;

        let frame_size = config.max_packet_size + HEADER_LEN;
        let mut buffer = PinnedBuffer::new(n_slots * frame_size)?;
        // Safety: the buffer is dropped after the region, here and in the
        // writer's field order. Registrations outlive the queue pair.
        let mr = unsafe {
            MemoryRegion::new(&pd, buffer.as_ptr(), buffer.len(), Access::LOCAL_READ)
        }?;
        let mut user_mrs = Vec::with_capacity(config.memory_regions.len());
        for range in &config.memory_regions {
            // Safety: the caller vouched for the range when building it.
            user_mrs.push(unsafe {
                MemoryRegion::new(&pd, range.ptr(), range.len(), Access::LOCAL_READ)
            }?);
        }
        let regions = RegionSet::new(user_mrs.iter().map(|m| (m.addr(), m.len(), m.lkey())));

        let comp_channel = if config.comp_vector >= 0 {
            Some(CompletionChannel::new(&cm_id)?)
        } else {
            None
        };
        let vector = config.comp_vector.max(0) as u32 % attr.num_comp_vectors.max(1);
        let send_cq = CompletionQueue::new(&cm_id, cqe, comp_channel.as_ref(), vector)?;
        let recv_cq = CompletionQueue::new(&cm_id, 1, None, 0)?;
        let qp = QueuePair::new(
            &pd,
            &QpInitAttr {
                send_cq: send_cq.raw(),
                recv_cq: recv_cq.raw(),
                caps: QpCaps {
                    max_send_wr: cqe,
                    max_recv_wr: 1,
                    max_send_sge: MAX_SGE as u32,
                    max_recv_sge: 1,
                },
            },
        )?;
        qp.modify(QpState::Init, Some(port.port_num))?;
        qp.modify(QpState::ReadyToReceive, None)?;
        qp.modify(QpState::ReadyToSend, None)?;

        let hw_rate = config.allow_hw_rate
            && config.rate > 0.0
            && setup_hw_rate(
                &cm_id,
                &qp,
                config.rate,
                config.max_packet_size,
                observer.as_ref(),
            );
        if hw_rate {
            SEND_HW_RATE_LIMITED.increment();
        }


        let mut targets = Vec::with_capacity(config.destinations.len());
        for dest in &config.destinations {
            let endpoint = crate::flow::require_ipv4(&dest.endpoint)?;
            let mac = dest
                .mac
                .unwrap_or_else(|| frame::multicast_mac(*endpoint.ip()));
            targets.push(FrameTarget { mac, endpoint });
        }
        let template = FrameTemplate {
            src_mac: port.mac,
            src: SocketAddrV4::new(iface, src_port),
            target: targets[0],
            ttl: config.ttl,
        };
        let mut slots = SlotRing::new(n_slots, frame_size);
        for slot in slots.iter_mut() {
            let offset = slot.frame_offset;
            template.write(&mut buffer.as_mut_slice()[offset..offset + frame_size]);
        }

        observer.debug(format_args!(
            "sending from {iface}:{src_port} with {n_slots} slots, batch {target_batch}"
        ));

        Ok(UdpIbvWriter {
            slots,
            chain: Vec::with_capacity(target_batch),
            regions,
            targets,
            observer,
            frame_size,
            target_batch,
            max_poll: config.max_poll,
            max_packet_size: config.max_packet_size,
            rate: config.rate,
            hw_rate,
            _user_mrs: user_mrs,
            mr,
            qp,
            send_cq,
            _recv_cq: recv_cq,
            comp_channel,
            _pd: pd,
            _loopback: loopback,
            cm_id,
            _event_channel: event_channel,
            buffer,
            _socket: socket,
        })
    }

    pub fn n_slots(&self) -> usize {
        self.slots.n_slots()
    }

    pub fn target_batch(&self) -> usize {
        self.target_batch
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.slots.available()
    }

    /// Slots posted but not yet reaped.
    pub fn outstanding(&self) -> usize {
        self.slots.outstanding()
    }

    pub fn num_substreams(&self) -> usize {
        self.targets.len()
    }

    /// Whether the adapter paces this stream.
    pub fn hw_rate_enabled(&self) -> bool {
        self.hw_rate
    }

    /// Rate the packet source should enforce itself: zero when the adapter
    /// paces the stream.
    pub fn software_rate(&self) -> f64 {
        if self.hw_rate { 0.0 } else { self.rate }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Descriptor to wait on after [`WakeAction::CompletionEvent`].
    pub fn completion_fd(&self) -> Option<RawFd> {
        self.comp_channel.as_ref().map(CompletionChannel::fd)
    }

    pub fn cm_id(&self) -> &CmId<P> {
        &self.cm_id
    }

    /// Run one round: reap completions, then frame and post a batch.
    pub fn wakeup(&mut self, source: &mut impl PacketSource) -> Result<WakeAction> {
        let more_cqe = self.reap(source)?;
        if self.slots.available() < self.target_batch {
            SEND_SLOTS_EXHAUSTED.increment();
            return self.wait_for_space();
        }

        let mut packet = TransmitPacket::default();
        let mut result = PacketResult::Empty;
        let mut copied = 0;
        let mut zero_copy = 0;
        let mut payload_bytes = 0;
        self.chain.clear();
        while self.chain.len() < self.target_batch {
            packet.clear();
            result = source.next_packet(&mut packet);
            if result != PacketResult::Success {
                break;
            }
            let size = packet.size();
            if size > self.max_packet_size {
                self.observer.warning(format_args!(
                    "dropping packet of {size} bytes (max_packet_size is {})",
                    self.max_packet_size
                ));
                self.reject(&packet, libc::EMSGSIZE, source);
                continue;
            }
            let substream = packet.substream();
            if substream >= self.targets.len() {
                self.observer.warning(format_args!(
                    "dropping packet for unknown substream {substream}"
                ));
                self.reject(&packet, libc::EINVAL, source);
                continue;
            }

            let slot = self.slots.tail_mut();
            let offset = slot.frame_offset;
            let addr = self.buffer.addr() + offset as u64;
            let frame = &mut self.buffer.as_mut_slice()[offset..offset + self.frame_size];
            if self.targets.len() > 1 {
                frame::set_target(frame, &self.targets[substream]);
            }
            frame::set_payload_len(frame, size);
            let mut staging = Staging {
                frame,
                addr,
                lkey: self.mr.lkey(),
            };
            let built = assemble(
                &mut slot.wr,
                &mut slot.keep,
                &mut staging,
                &self.regions,
                &packet.buffers,
            );
            slot.wr.wr_id = 0;
            slot.wr.signaled = false;
            slot.item = packet.item.take();
            slot.last = packet.last;
            self.chain.push(slot.wr);
            self.slots.commit_tail();

            copied += built.copied;
            zero_copy += built.zero_copy;
            payload_bytes += size;
        }

        let posted = self.chain.len();
        if posted > 0 {
            if let Some(last) = self.chain.last_mut() {
                last.wr_id = posted as u64;
                last.signaled = true;
            }
            if let Err(e) = self.qp.post_send(&self.chain) {
                self.abandon(posted, source);
                return Err(e);
            }
            SEND_BATCHES.increment();
            SEND_PACKETS.add(posted as u64);
            SEND_BYTES.add(payload_bytes as u64);
            SEND_COPIED_BYTES.add(copied as u64);
            SEND_ZERO_COPY_FRAGMENTS.add(zero_copy as u64);
        }

        if posted > 0 || more_cqe {
            Ok(WakeAction::Immediate)
        } else if self.slots.available() < self.slots.n_slots() {
            self.wait_for_space()
        } else if result == PacketResult::Sleep {
            Ok(WakeAction::Sleep)
        } else {
            Ok(WakeAction::NewPackets)
        }
    }

    /// Drain the completion channel after its descriptor became readable,
    /// then run [`UdpIbvWriter::wakeup`]. Spurious wakes are harmless.
    pub fn handle_completion_event(
        &mut self,
        source: &mut impl PacketSource,
    ) -> Result<WakeAction> {
        if let Some(channel) = &self.comp_channel {
            while channel.get_event()?.is_some() {
                self.send_cq.ack_events(1);
            }
        }
        self.wakeup(source)
    }

    /// Retire completed batches. Returns whether more completions may be
    /// pending.
    fn reap(&mut self, source: &mut impl PacketSource) -> Result<bool> {
        let n_slots = self.slots.n_slots();
        let min_available = n_slots.min(self.slots.available() + self.target_batch);
        let mut retries = self.max_poll;
        let mut heaps = 0;
        let mut wc = [WorkCompletion::default()];
        while self.slots.available() < min_available {
            if self.send_cq.poll(&mut wc)? == 0 {
                retries -= 1;
                if retries == 0 {
                    break;
                }
                continue;
            }
            let failed = match wc[0].status {
                WcStatus::Success => false,
                WcStatus::Failed(code) => {
                    SEND_FAILED_COMPLETIONS.increment();
                    self.observer
                        .warning(format_args!("Work Request failed with code {code}"));
                    true
                }
            };
            let batch = (wc[0].wr_id as usize).min(self.slots.outstanding());
            for _ in 0..batch {
                let slot = self.slots.head_mut();
                if let Some(item) = &slot.item {
                    if failed {
                        item.fail(libc::EIO);
                    } else {
                        item.add_bytes(slot.wr.byte_len() - HEADER_LEN);
                    }
                }
                heaps += slot.heaps();
                self.slots.retire_head();
            }
        }
        if heaps > 0 {
            source.heaps_completed(heaps);
        }
        Ok(self.slots.available() < n_slots && retries > 0)
    }

    fn wait_for_space(&self) -> Result<WakeAction> {
        match &self.comp_channel {
            Some(_) => {
                self.send_cq.req_notify(false)?;
                Ok(WakeAction::CompletionEvent)
            }
            None => Ok(WakeAction::Immediate),
        }
    }

    /// Fail a packet that cannot be framed. If it ends its heap, the heap is
    /// reported behind the newest outstanding slot so reports stay in post
    /// order.
    fn reject(&mut self, packet: &TransmitPacket, errno: i32, source: &mut impl PacketSource) {
        if let Some(item) = &packet.item {
            item.fail(errno);
        }
        if !packet.last {
            return;
        }
        match self.slots.newest_mut() {
            Some(slot) => slot.extra_heaps += 1,
            None => source.heaps_completed(1),
        }
    }

    /// Undo the slots of a chain the device refused. Their items are marked
    /// failed and left incomplete. Rejected heaps parked on those slots move
    /// to the newest slot still outstanding, or are reported now.
    fn abandon(&mut self, count: usize, source: &mut impl PacketSource) {
        let mut parked = 0;
        for _ in 0..count {
            if let Some(slot) = self.slots.newest_mut() {
                if let Some(item) = &slot.item {
                    item.fail(libc::EIO);
                }
                parked += slot.extra_heaps;
            }
            self.slots.rewind(1);
        }
        if parked == 0 {
            return;
        }
        match self.slots.newest_mut() {
            Some(slot) => slot.extra_heaps += parked,
            None => source.heaps_completed(parked),
        }
    }
}

impl<P: Provider> Drop for UdpIbvWriter<P> {
    fn drop(&mut self) {
        // Stop the device reading from slots and user memory before the
        // registrations go away.
        let _ = self.qp.modify(QpState::Error, None);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use bytes::Bytes;

    use super::*;
    use crate::config::{MemoryRange, SendConfigBuilder};
    use crate::frame::{MacAddr, udp_from_ethernet};
    use crate::observer::capture::Capture;
    use crate::send::{HeapQueue, ItemStatus};
    use crate::verbs::sim::{ObjectKind, SimDevice};

    const FRAME: usize = 1472 + HEADER_LEN;

    fn group(n: u8) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(239, 1, 0, n), 7148))
    }

    fn builder(sim: &SimDevice) -> SendConfigBuilder {
        SendConfigBuilder::new()
            .endpoint(group(1))
            .interface_address(IpAddr::V4(sim.interface()))
            .source_port(9000)
    }

    fn writer(
        sim: &Rc<SimDevice>,
        config: &SendConfig,
    ) -> (UdpIbvWriter<SimDevice>, Rc<Capture>) {
        let capture = Rc::new(Capture::default());
        let w = UdpIbvWriter::new(Rc::clone(sim), config, capture.clone()).unwrap();
        (w, capture)
    }

    fn payload(len: usize, fill: u8) -> Vec<Bytes> {
        vec![Bytes::from(vec![fill; len])]
    }

    #[test]
    fn five_packets_post_one_chain() {
        let sim = Rc::new(SimDevice::default());
        sim.set_auto_complete(false);
        let config = builder(&sim).buffer_size(8 * FRAME).build().unwrap();
        let (mut w, _) = writer(&sim, &config);
        assert_eq!(w.n_slots(), 8);
        assert_eq!(w.target_batch(), 2);
        // One big batch needs a larger target; drive the ring directly.
        w.target_batch = 8;

        let mut q = HeapQueue::new(1472);
        let a = q.enqueue(vec![payload(100, 1), payload(100, 2)], 0).unwrap();
        let b = q.enqueue(vec![payload(50, 3), payload(50, 4), payload(50, 5)], 0).unwrap();

        assert_eq!(w.wakeup(&mut q).unwrap(), WakeAction::Immediate);
        assert_eq!(w.available(), 3);
        assert_eq!(w.available() + w.outstanding(), w.n_slots());
        assert_eq!(sim.pending_sends(), 1);
        assert_eq!(sim.take_transmitted().len(), 5);

        // Nothing completed yet: wait on the channel.
        assert_eq!(w.wakeup(&mut q).unwrap(), WakeAction::CompletionEvent);
        assert_eq!(sim.complete_sends(1), 1);
        assert_eq!(w.handle_completion_event(&mut q).unwrap(), WakeAction::NewPackets);
        assert_eq!(w.available(), 8);
        assert_eq!(a.status(), ItemStatus::Sent);
        assert_eq!(a.bytes_sent(), 200);
        assert_eq!(b.status(), ItemStatus::Sent);
        assert_eq!(b.bytes_sent(), 150);
        assert!(q.is_idle());
    }

    #[test]
    fn frames_carry_header_and_payload() {
        let sim = Rc::new(SimDevice::default());
        let config = builder(&sim).ttl(4).build().unwrap();
        let (mut w, _) = writer(&sim, &config);
        let mut q = HeapQueue::new(1472);
        q.enqueue(
            vec![vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")]],
            0,
        )
        .unwrap();
        w.wakeup(&mut q).unwrap();
        let wire = sim.take_transmitted();
        assert_eq!(wire.len(), 1);
        let frame = &wire[0];
        assert_eq!(udp_from_ethernet(frame).unwrap(), b"hello world");
        let (mac, _, dst) = frame::destination(frame).unwrap();
        assert_eq!(mac, frame::multicast_mac(Ipv4Addr::new(239, 1, 0, 1)));
        assert_eq!(dst, SocketAddrV4::new(Ipv4Addr::new(239, 1, 0, 1), 7148));
        assert_eq!(&frame[6..12], &sim.mac().0);
        assert_eq!(frame[22], 4);
        assert_eq!(u16::from_be_bytes([frame[34], frame[35]]), 9000);
    }

    #[test]
    fn substreams_rewrite_destination() {
        let sim = Rc::new(SimDevice::default());
        let peer = MacAddr([2, 0, 0, 0, 0, 9]);
        let unicast = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 9), 5000));
        let config = builder(&sim)
            .unicast_endpoint(unicast, peer)
            .build()
            .unwrap();
        let (mut w, _) = writer(&sim, &config);
        assert_eq!(w.num_substreams(), 2);
        let mut q = HeapQueue::new(1472);
        q.enqueue(vec![payload(10, 0)], 1).unwrap();
        q.enqueue(vec![payload(10, 0)], 0).unwrap();
        w.wakeup(&mut q).unwrap();
        let wire = sim.take_transmitted();
        let (mac, _, dst) = frame::destination(&wire[0]).unwrap();
        assert_eq!((mac, dst), (peer, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 5000)));
        let (_, _, dst) = frame::destination(&wire[1]).unwrap();
        assert_eq!(dst.port(), 7148);
    }

    #[test]
    fn failed_completion_marks_item_once() {
        let sim = Rc::new(SimDevice::default());
        sim.set_auto_complete(false);
        let config = builder(&sim).buffer_size(8 * FRAME).build().unwrap();
        let (mut w, capture) = writer(&sim, &config);
        let mut q = HeapQueue::new(1472);
        let item = q
            .enqueue((0..4).map(|i| payload(64, i)).collect(), 0)
            .unwrap();
        // Two chains of two slots each, both failing.
        sim.fail_sends(2);
        w.wakeup(&mut q).unwrap();
        w.wakeup(&mut q).unwrap();
        assert_eq!(sim.complete_sends(2), 2);
        let mut action = w.handle_completion_event(&mut q).unwrap();
        while action == WakeAction::Immediate {
            action = w.wakeup(&mut q).unwrap();
        }
        assert_eq!(item.bytes_sent(), 0);
        assert_eq!(item.status(), ItemStatus::Failed(libc::EIO));
        assert!(capture.contains("Work Request failed with code"));
        assert_eq!(w.available(), 8);
    }

    /// Yields `packets` from the back, counting completed heaps.
    struct ListSource {
        packets: Vec<TransmitPacket>,
        completed: usize,
    }

    impl PacketSource for ListSource {
        fn next_packet(&mut self, out: &mut TransmitPacket) -> PacketResult {
            match self.packets.pop() {
                Some(p) => {
                    *out = p;
                    PacketResult::Success
                }
                None => PacketResult::Empty,
            }
        }

        fn heaps_completed(&mut self, n: usize) {
            self.completed += n;
        }
    }

    fn heap(len: usize, item: &Rc<crate::send::SendItem>) -> TransmitPacket {
        TransmitPacket {
            buffers: payload(len, 0),
            item: Some(item.clone()),
            last: true,
        }
    }

    #[test]
    fn registered_memory_is_sent_in_place() {
        static ARENA: [u8; 4096] = [0x5a; 4096];
        let sim = Rc::new(SimDevice::default());
        let config = builder(&sim)
            .memory_region(MemoryRange::from_static(&ARENA))
            .build()
            .unwrap();
        let (mut w, _) = writer(&sim, &config);
        let zero_copy_before = SEND_ZERO_COPY_FRAGMENTS.value();
        let mut q = HeapQueue::new(1472);
        let arena = Bytes::from_static(&ARENA);
        q.enqueue(vec![vec![arena.slice(0..1000)]], 0).unwrap();
        w.wakeup(&mut q).unwrap();
        assert!(SEND_ZERO_COPY_FRAGMENTS.value() > zero_copy_before);
        let wire = sim.take_transmitted();
        assert_eq!(udp_from_ethernet(&wire[0]).unwrap(), &ARENA[..1000]);
    }

    #[test]
    fn oversize_packet_fails_item_and_keeps_heap_order() {
        let sim = Rc::new(SimDevice::default());
        sim.set_auto_complete(false);
        let config = builder(&sim).max_packet_size(100).build().unwrap();
        let (mut w, capture) = writer(&sim, &config);

        let good = crate::send::SendItem::new(0);
        let bad = crate::send::SendItem::new(0);
        let mut source = ListSource {
            packets: vec![
                TransmitPacket {
                    buffers: payload(200, 0),
                    item: Some(bad.clone()),
                    last: true,
                },
                TransmitPacket {
                    buffers: payload(50, 0),
                    item: Some(good.clone()),
                    last: true,
                },
            ],
            completed: 0,
        };
        w.wakeup(&mut source).unwrap();
        assert_eq!(bad.error().and_then(|e| e.raw_os_error()), Some(libc::EMSGSIZE));
        assert!(capture.contains("dropping packet of 200 bytes"));
        // The rejected heap waits behind the posted one.
        assert_eq!(source.completed, 0);
        sim.complete_sends(1);
        w.handle_completion_event(&mut source).unwrap();
        assert_eq!(source.completed, 2);
        assert_eq!(good.bytes_sent(), 50);
    }

    #[test]
    fn busy_polling_without_channel() {
        let sim = Rc::new(SimDevice::default());
        sim.set_auto_complete(false);
        let config = builder(&sim).comp_vector(-1).build().unwrap();
        let (mut w, _) = writer(&sim, &config);
        assert!(w.completion_fd().is_none());
        assert_eq!(sim.live_of(ObjectKind::CompletionChannel), 0);
        let mut q = HeapQueue::new(1472);
        q.enqueue(vec![payload(10, 0)], 0).unwrap();
        assert_eq!(w.wakeup(&mut q).unwrap(), WakeAction::Immediate);
        // Outstanding work and no channel: poll again rather than wait.
        assert_eq!(w.wakeup(&mut q).unwrap(), WakeAction::Immediate);
    }

    #[test]
    fn hw_rate_applied_when_supported() {
        let sim = Rc::new(SimDevice::default());
        let config = builder(&sim).rate(1e9).build().unwrap();
        let (w, _) = writer(&sim, &config);
        assert!(w.hw_rate_enabled());
        assert_eq!(w.software_rate(), 0.0);
        assert_eq!(sim.rate_limits().len(), 1);
        assert_eq!(sim.rate_limits()[0].typical_pkt_sz as usize, FRAME);
    }

    #[test]
    fn hw_rate_falls_back_quietly() {
        let sim = Rc::new(SimDevice::default());
        sim.fail_next("modify_qp_rate_limit", libc::EINVAL);
        let config = builder(&sim).rate(1e9).build().unwrap();
        let (w, capture) = writer(&sim, &config);
        assert!(!w.hw_rate_enabled());
        assert_eq!(w.software_rate(), 1e9);
        assert!(capture.contains("ibv_modify_qp_rate_limit failed"));

        let config = builder(&sim).rate(10.0).build().unwrap();
        let (w, capture) = writer(&sim, &config);
        assert!(!w.hw_rate_enabled());
        assert!(capture.contains("does not support the rate"));

        let config = builder(&sim).rate(1e9).allow_hw_rate(false).build().unwrap();
        let (w, _) = writer(&sim, &config);
        assert!(!w.hw_rate_enabled());
    }

    #[test]
    fn post_failure_abandons_batch() {
        let sim = Rc::new(SimDevice::default());
        let config = builder(&sim).build().unwrap();
        let (mut w, _) = writer(&sim, &config);
        let mut q = HeapQueue::new(1472);
        let item = q.enqueue(vec![payload(10, 0)], 0).unwrap();
        sim.fail_next("post_send", libc::ENOMEM);
        assert!(matches!(
            w.wakeup(&mut q),
            Err(Error::Device { op: "ibv_post_send", .. })
        ));
        assert_eq!(w.outstanding(), 0);
        assert_eq!(item.status(), ItemStatus::Incomplete);
        assert!(item.error().is_some());
    }

    #[test]
    fn post_failure_reports_parked_heaps() {
        let sim = Rc::new(SimDevice::default());
        sim.set_auto_complete(false);
        let config = builder(&sim).max_packet_size(100).build().unwrap();
        let (mut w, _) = writer(&sim, &config);
        let (first, good, bad) = (
            crate::send::SendItem::new(0),
            crate::send::SendItem::new(0),
            crate::send::SendItem::new(0),
        );

        // Nothing else outstanding: the rejected heap is reported at once.
        let mut source = ListSource {
            packets: vec![heap(200, &bad), heap(50, &good)],
            completed: 0,
        };
        sim.fail_next("post_send", libc::ENOMEM);
        assert!(w.wakeup(&mut source).is_err());
        assert_eq!(source.completed, 1);
        assert_eq!(w.outstanding(), 0);

        // Behind an outstanding batch: it moves onto that batch.
        let mut source = ListSource {
            packets: vec![heap(50, &first)],
            completed: 0,
        };
        w.wakeup(&mut source).unwrap();
        source.packets = vec![heap(200, &bad), heap(50, &good)];
        sim.fail_next("post_send", libc::ENOMEM);
        assert!(w.wakeup(&mut source).is_err());
        assert_eq!(source.completed, 0);
        assert_eq!(w.outstanding(), 1);
        sim.complete_sends(1);
        w.handle_completion_event(&mut source).unwrap();
        assert_eq!(source.completed, 2);
        assert_eq!(first.status(), ItemStatus::Sent);
    }

    #[test]
    fn teardown_releases_everything() {
        let sim = Rc::new(SimDevice::default());
        sim.set_auto_complete(false);
        let config = builder(&sim).multicast_loopback(true).build().unwrap();
        let (mut w, _) = writer(&sim, &config);
        let mut q = HeapQueue::new(1472);
        let item = q.enqueue(vec![payload(10, 0)], 0).unwrap();
        w.wakeup(&mut q).unwrap();
        drop(w);
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(sim.busy_destroys(), 0);
        assert_eq!(item.status(), ItemStatus::Incomplete);
        let destroyed = sim.destroyed();
        let pos = |k| destroyed.iter().position(|d| *d == k).unwrap();
        assert!(pos(ObjectKind::QueuePair) < pos(ObjectKind::MemoryRegion));
        assert!(pos(ObjectKind::QueuePair) < pos(ObjectKind::CompletionQueue));
        assert!(pos(ObjectKind::MemoryRegion) < pos(ObjectKind::ProtectionDomain));
        assert!(pos(ObjectKind::CompletionQueue) < pos(ObjectKind::CompletionChannel));
        assert_eq!(destroyed.last(), Some(&ObjectKind::EventChannel));
    }

    #[test]
    fn construction_failure_leaks_nothing() {
        let sim = Rc::new(SimDevice::default());
        sim.fail_next("create_qp", libc::ENOMEM);
        let config = builder(&sim).build().unwrap();
        let err = UdpIbvWriter::new(Rc::clone(&sim), &config, crate::observer::tracing());
        assert!(matches!(err, Err(Error::Device { op: "ibv_create_qp", .. })));
        assert_eq!(sim.live_objects(), 0);
    }
}
