//! Striding multi-packet receive queue reader.
//!
//! The receive buffer is split into work-queue entries (WQEs), each made of
//! fixed-size strides. The device writes every frame at the next free stride
//! of the current WQE and reports the stride index in the completion, so one
//! posted receive covers many packets. A WQE is posted back once all of its
//! strides have been accounted for; WQEs are always reposted in buffer
//! order.

use std::os::fd::RawFd;
use std::rc::Rc;

use super::{Delivery, PacketSink, PollResult, process_one_packet};
use crate::config::RecvConfig;
use crate::counter::Tally;
use crate::error::{Error, Result};
use crate::flow::create_flows;
use crate::frame::udp_from_ethernet;
use crate::memory::PinnedBuffer;
use crate::metrics::{
    RECV_BYTES, RECV_FAILED_COMPLETIONS, RECV_MALFORMED, RECV_PACKETS,
    RECV_POLL_BUDGET_EXHAUSTED, RECV_WQE_REPOSTS,
};
use crate::observer::Observer;
use crate::resource::{
    CmId, CompletionChannel, CompletionQueue, DeviceContext, EventChannel, Flow, MemoryRegion,
    ProtectionDomain, QueuePair, RwqIndTable, WorkQueue,
};
use crate::send::WakeAction;
use crate::verbs::{
    Access, DeviceAttr, Provider, RecvWr, Sge, StridingParams, WcStatus, WorkCompletion,
    WqInitAttr, WqState,
};

/// Completions handled per [`MprqReader::poll_once`], so a flood of packets
/// cannot starve the caller.
const MAX_ITER: usize = 256;

/// Preferred stride: 64 bytes.
const STRIDE_LOG: u8 = 6;
/// Preferred WQE: 1 MiB.
const WQE_LOG: u8 = 20;

/// Buffer geometry for a striding receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridingLayout {
    pub params: StridingParams,
    pub stride_size: usize,
    pub strides_per_wqe: usize,
    pub wqe_size: usize,
    pub n_wqe: usize,
    /// Completion queue depth: one entry per stride in the buffer.
    pub n_strides: usize,
    pub buffer_size: usize,
    /// The requested buffer was shrunk to fit device limits.
    pub reduced: bool,
}

impl StridingLayout {
    pub fn compute(attr: &DeviceAttr, buffer_size: usize) -> Result<Self> {
        let caps = attr.striding_rq.ok_or_else(|| {
            Error::NotSupported("device does not support multi-packet receive queues".into())
        })?;
        let stride_log = STRIDE_LOG.clamp(
            caps.min_single_stride_log_num_of_bytes,
            caps.max_single_stride_log_num_of_bytes.max(caps.min_single_stride_log_num_of_bytes),
        );
        let strides_log = WQE_LOG.saturating_sub(stride_log).clamp(
            caps.min_single_wqe_log_num_of_strides,
            caps.max_single_wqe_log_num_of_strides.max(caps.min_single_wqe_log_num_of_strides),
        );
        let stride_size = 1usize << stride_log;
        let strides_per_wqe = 1usize << strides_log;
        let wqe_size = stride_size * strides_per_wqe;

        let buffer_size = buffer_size.max(2 * wqe_size);
        let mut reduced = false;
        let mut n_strides = buffer_size >> stride_log;
        if (attr.max_cqe as usize) < n_strides {
            n_strides = attr.max_cqe as usize;
            reduced = true;
        }
        let mut n_wqe = n_strides >> strides_log;
        if (attr.max_qp_wr as usize) < n_wqe {
            n_wqe = attr.max_qp_wr as usize;
            reduced = true;
        }
        n_strides = n_wqe << strides_log;
        if n_wqe < 2 {
            return Err(Error::NotSupported(
                "Insufficient resources for a multi-packet receive queue".into(),
            ));
        }
        Ok(StridingLayout {
            params: StridingParams {
                single_stride_log_num_of_bytes: stride_log,
                single_wqe_log_num_of_strides: strides_log,
            },
            stride_size,
            strides_per_wqe,
            wqe_size,
            n_wqe,
            n_strides,
            buffer_size: n_wqe * wqe_size,
            reduced,
        })
    }
}

/// How completions are pulled off the queue. Picked once per reader from
/// the device capabilities.
trait CompletionPoll {
    /// Begin a pass. `budget` bounds how many completions may be taken.
    fn start<P: Provider>(
        &mut self,
        cq: &CompletionQueue<P>,
        budget: usize,
    ) -> Result<Option<WorkCompletion>>;

    fn next<P: Provider>(
        &mut self,
        cq: &CompletionQueue<P>,
        budget: usize,
    ) -> Result<Option<WorkCompletion>>;

    /// Close a pass whose `start` returned a completion.
    fn end<P: Provider>(&mut self, cq: &CompletionQueue<P>);
}

/// `ibv_poll_cq` into a local batch. Entries left over when a pass stops
/// early are handed out first by the next pass.
struct LegacyPoll {
    batch: [WorkCompletion; 32],
    len: usize,
    pos: usize,
}

impl LegacyPoll {
    fn new() -> Self {
        LegacyPoll {
            batch: [WorkCompletion::default(); 32],
            len: 0,
            pos: 0,
        }
    }
}

impl CompletionPoll for LegacyPoll {
    fn start<P: Provider>(
        &mut self,
        cq: &CompletionQueue<P>,
        budget: usize,
    ) -> Result<Option<WorkCompletion>> {
        self.next(cq, budget)
    }

    #[inline]
    fn next<P: Provider>(
        &mut self,
        cq: &CompletionQueue<P>,
        budget: usize,
    ) -> Result<Option<WorkCompletion>> {
        if self.pos == self.len {
            let want = budget.clamp(1, self.batch.len());
            self.len = cq.poll(&mut self.batch[..want])?;
            self.pos = 0;
            if self.len == 0 {
                return Ok(None);
            }
        }
        let wc = self.batch[self.pos];
        self.pos += 1;
        Ok(Some(wc))
    }

    fn end<P: Provider>(&mut self, _cq: &CompletionQueue<P>) {}
}

/// Extended start/next/end polling.
struct ExtendedPoll;

impl CompletionPoll for ExtendedPoll {
    fn start<P: Provider>(
        &mut self,
        cq: &CompletionQueue<P>,
        _budget: usize,
    ) -> Result<Option<WorkCompletion>> {
        cq.start_poll()
    }

    #[inline]
    fn next<P: Provider>(
        &mut self,
        cq: &CompletionQueue<P>,
        _budget: usize,
    ) -> Result<Option<WorkCompletion>> {
        cq.next_poll()
    }

    fn end<P: Provider>(&mut self, cq: &CompletionQueue<P>) {
        cq.end_poll();
    }
}

enum Poller {
    Legacy(LegacyPoll),
    Extended(ExtendedPoll),
}

/// Software view of the WQE ring: which WQE the device is filling and how
/// many of its strides have completed.
struct StrideRing<P: Provider> {
    wq: WorkQueue<P>,
    layout: StridingLayout,
    base: u64,
    lkey: u32,
    wqe_start: usize,
    strides_used: usize,
    max_size: usize,
    observer: Rc<dyn Observer>,
}

impl<P: Provider> StrideRing<P> {
    fn post(&self, offset: usize) -> Result<()> {
        self.wq.post_recv(&RecvWr {
            wr_id: (offset / self.layout.wqe_size) as u64,
            sge: Sge {
                addr: self.base + offset as u64,
                length: self.layout.wqe_size as u32,
                lkey: self.lkey,
            },
        })
    }

    /// Deliver one completion and account its strides. Returns whether the
    /// sink asked to stop.
    fn handle(
        &mut self,
        wc: &WorkCompletion,
        buffer: &PinnedBuffer,
        sink: &mut impl PacketSink,
        packets: &mut Tally,
        bytes: &mut Tally,
    ) -> Result<bool> {
        let mut stopped = false;
        if wc.filler {
            // Skipped tail of the WQE; nothing to deliver.
        } else if let WcStatus::Failed(code) = wc.status {
            RECV_FAILED_COMPLETIONS.increment();
            self.observer
                .warning(format_args!("Work Request failed with code {code}"));
        } else {
            let offset = self.wqe_start + usize::from(wc.stride_index) * self.layout.stride_size;
            let frame = buffer
                .as_slice()
                .get(offset..offset + wc.byte_len as usize)
                .unwrap_or_default();
            match udp_from_ethernet(frame) {
                Ok(payload) => {
                    match process_one_packet(sink, payload, self.max_size, self.observer.as_ref()) {
                        Delivery::Dropped => {}
                        Delivery::Accepted => {
                            packets.increment();
                            bytes.add(payload.len() as u64);
                        }
                        Delivery::Stopped => {
                            packets.increment();
                            bytes.add(payload.len() as u64);
                            stopped = true;
                        }
                    }
                }
                Err(e) => {
                    RECV_MALFORMED.increment();
                    self.observer.warning(format_args!("{e}"));
                }
            }
        }

        self.strides_used += usize::from(wc.strides);
        if self.strides_used >= self.layout.strides_per_wqe {
            self.strides_used = 0;
            self.post(self.wqe_start)?;
            RECV_WQE_REPOSTS.increment();
            self.wqe_start += self.layout.wqe_size;
            if self.wqe_start == self.layout.buffer_size {
                self.wqe_start = 0;
            }
        }
        Ok(stopped)
    }
}

fn poll_pass<P: Provider, C: CompletionPoll>(
    poller: &mut C,
    cq: &CompletionQueue<P>,
    ring: &mut StrideRing<P>,
    buffer: &PinnedBuffer,
    sink: &mut impl PacketSink,
) -> Result<PollResult> {
    let Some(first) = poller.start(cq, MAX_ITER)? else {
        return Ok(PollResult::Drained);
    };
    let result = drain(first, poller, cq, ring, buffer, sink);
    poller.end(cq);
    if let Ok(PollResult::Partial) = result {
        RECV_POLL_BUDGET_EXHAUSTED.increment();
    }
    result
}

fn drain<P: Provider, C: CompletionPoll>(
    first: WorkCompletion,
    poller: &mut C,
    cq: &CompletionQueue<P>,
    ring: &mut StrideRing<P>,
    buffer: &PinnedBuffer,
    sink: &mut impl PacketSink,
) -> Result<PollResult> {
    let mut packets = RECV_PACKETS.tally();
    let mut bytes = RECV_BYTES.tally();
    let mut wc = first;
    for iter in 1..=MAX_ITER {
        if ring.handle(&wc, buffer, sink, &mut packets, &mut bytes)? {
            return Ok(PollResult::Stopped);
        }
        if iter == MAX_ITER {
            break;
        }
        match poller.next(cq, MAX_ITER - iter)? {
            Some(next) => wc = next,
            None => return Ok(PollResult::Drained),
        }
    }
    Ok(PollResult::Partial)
}

/// Receives UDP datagrams through a striding receive queue.
pub struct MprqReader<P: Provider> {
    poller: Poller,
    max_poll: u32,

    // Handles, dependents first.
    _flows: Vec<Flow<P>>,
    _qp: QueuePair<P>,
    _ind_table: RwqIndTable<P>,
    ring: StrideRing<P>,
    _mr: MemoryRegion<P>,
    recv_cq: CompletionQueue<P>,
    comp_channel: Option<CompletionChannel<P>>,
    _pd: ProtectionDomain<P>,
    _loopback: Option<DeviceContext<P>>,
    cm_id: CmId<P>,
    _event_channel: EventChannel<P>,
    buffer: PinnedBuffer,
}

impl<P: Provider> MprqReader<P> {
    pub fn new(provider: Rc<P>, config: &RecvConfig, observer: Rc<dyn Observer>) -> Result<Self> {
        config.validate()?;
        let iface = config.interface_v4()?;

        let event_channel = EventChannel::new(provider)?;
        let mut cm_id = CmId::new(&event_channel)?;
        cm_id.bind_addr(iface)?;
        let loopback = if config.multicast_loopback {
            Some(DeviceContext::open(Rc::clone(cm_id.provider()), iface)?)
        } else {
            None
        };
        let attr = cm_id.query_device()?;
        let layout = StridingLayout::compute(&attr, config.buffer_size)?;
        if layout.reduced {
            observer.warning(format_args!(
                "Reducing buffer to {} to accommodate device limits",
                layout.buffer_size
            ));
        }

        let pd = ProtectionDomain::new(&cm_id)?;
        let comp_channel = if config.comp_vector >= 0 {
            Some(CompletionChannel::new(&cm_id)?)
        } else {
            None
        };
        let vector = config.comp_vector.max(0) as u32 % attr.num_comp_vectors.max(1);
        let recv_cq = CompletionQueue::new(
            &cm_id,
            layout.n_strides as u32,
            comp_channel.as_ref(),
            vector,
        )?;

        let buffer = PinnedBuffer::new(layout.buffer_size)?;
        // Safety: the buffer is dropped after the region, here and in the
        // reader's field order.
        let mr = unsafe {
            MemoryRegion::new(&pd, buffer.as_ptr(), buffer.len(), Access::LOCAL_WRITE)
        }?;
        let wq = WorkQueue::new(
            &cm_id,
            &WqInitAttr {
                pd: pd.raw(),
                cq: recv_cq.raw(),
                max_wr: layout.n_wqe as u32,
                striding: layout.params,
            },
        )?;
        let ring = StrideRing {
            wq,
            layout,
            base: buffer.addr(),
            lkey: mr.lkey(),
            wqe_start: 0,
            strides_used: 0,
            max_size: config.max_size,
            observer: Rc::clone(&observer),
        };
        let ind_table = RwqIndTable::new(&cm_id, &[&ring.wq])?;
        let qp = QueuePair::new_hash(&cm_id, &pd, &ind_table)?;
        ring.wq.modify(WqState::Ready)?;
        for i in 0..layout.n_wqe {
            ring.post(i * layout.wqe_size)?;
        }
        let flows = create_flows(&qp, &config.endpoints, &cm_id)?;

        let poller = if attr.extended_cq {
            Poller::Extended(ExtendedPoll)
        } else {
            Poller::Legacy(LegacyPoll::new())
        };
        observer.debug(format_args!(
            "receiving on {iface} with {} WQEs of {} strides of {} bytes",
            layout.n_wqe, layout.strides_per_wqe, layout.stride_size
        ));

        Ok(MprqReader {
            poller,
            max_poll: config.max_poll,
            _flows: flows,
            _qp: qp,
            _ind_table: ind_table,
            ring,
            _mr: mr,
            recv_cq,
            comp_channel,
            _pd: pd,
            _loopback: loopback,
            cm_id,
            _event_channel: event_channel,
            buffer,
        })
    }

    pub fn layout(&self) -> &StridingLayout {
        &self.ring.layout
    }

    /// Descriptor to wait on after [`WakeAction::CompletionEvent`].
    pub fn completion_fd(&self) -> Option<RawFd> {
        self.comp_channel.as_ref().map(CompletionChannel::fd)
    }

    pub fn cm_id(&self) -> &CmId<P> {
        &self.cm_id
    }

    /// Handle at most a bounded number of completions.
    pub fn poll_once(&mut self, sink: &mut impl PacketSink) -> Result<PollResult> {
        let MprqReader {
            poller,
            recv_cq,
            ring,
            buffer,
            ..
        } = self;
        match poller {
            Poller::Legacy(p) => poll_pass(p, recv_cq, ring, buffer, sink),
            Poller::Extended(p) => poll_pass(p, recv_cq, ring, buffer, sink),
        }
    }

    /// Poll up to `max_poll` times. When the queue drains and a completion
    /// channel is configured, arm it and poll once more so completions that
    /// raced the arming are not missed.
    pub fn read(&mut self, sink: &mut impl PacketSink) -> Result<WakeAction> {
        for _ in 0..self.max_poll {
            match self.poll_once(sink)? {
                PollResult::Stopped => return Ok(WakeAction::Stopped),
                PollResult::Partial => {}
                PollResult::Drained if self.comp_channel.is_some() => {
                    self.recv_cq.req_notify(false)?;
                    match self.poll_once(sink)? {
                        PollResult::Stopped => return Ok(WakeAction::Stopped),
                        PollResult::Drained => return Ok(WakeAction::CompletionEvent),
                        PollResult::Partial => {}
                    }
                }
                PollResult::Drained => {}
            }
        }
        Ok(WakeAction::Immediate)
    }

    /// Drain the completion channel after its descriptor became readable,
    /// then [`MprqReader::read`].
    pub fn handle_completion_event(&mut self, sink: &mut impl PacketSink) -> Result<WakeAction> {
        if let Some(channel) = &self.comp_channel {
            while channel.get_event()?.is_some() {
                self.recv_cq.ack_events(1);
            }
        }
        self.read(sink)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

    use super::*;
    use crate::config::RecvConfigBuilder;
    use crate::frame::{FrameTarget, FrameTemplate, MacAddr, build_frame, multicast_mac};
    use crate::observer::Level;
    use crate::observer::capture::Capture;
    use crate::recv::test_sink::Collect;
    use crate::verbs::StridingRqCaps;
    use crate::verbs::sim::{ObjectKind, SimConfig, SimDevice};

    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 2, 0, 1);
    const PORT: u16 = 7148;

    fn attr(max_cqe: u32, max_qp_wr: u32) -> DeviceAttr {
        DeviceAttr {
            max_cqe,
            max_qp_wr,
            num_comp_vectors: 1,
            packet_pacing: None,
            striding_rq: Some(StridingRqCaps {
                min_single_stride_log_num_of_bytes: 6,
                max_single_stride_log_num_of_bytes: 13,
                min_single_wqe_log_num_of_strides: 3,
                max_single_wqe_log_num_of_strides: 16,
            }),
            extended_cq: true,
        }
    }

    #[test]
    fn layout_prefers_64_byte_strides_and_1_mib_wqes() {
        let l = StridingLayout::compute(&attr(1 << 22, 1 << 15), 16 << 20).unwrap();
        assert_eq!(l.stride_size, 64);
        assert_eq!(l.strides_per_wqe, 16384);
        assert_eq!(l.wqe_size, 1 << 20);
        assert_eq!(l.n_wqe, 16);
        assert_eq!(l.buffer_size, 16 << 20);
        assert!(!l.reduced);
    }

    #[test]
    fn layout_rounds_small_buffers_up_to_two_wqes() {
        let l = StridingLayout::compute(&attr(1 << 22, 1 << 15), 1000).unwrap();
        assert_eq!(l.n_wqe, 2);
        assert_eq!(l.buffer_size, 2 << 20);
    }

    #[test]
    fn layout_clamps_to_device_limits() {
        // Four WQEs requested, but the CQ only fits two WQEs' strides.
        let l = StridingLayout::compute(&attr(2 * 16384, 1 << 15), 4 << 20).unwrap();
        assert!(l.reduced);
        assert_eq!(l.n_wqe, 2);
        assert_eq!(l.buffer_size, 2 << 20);

        let l = StridingLayout::compute(&attr(1 << 22, 3), 8 << 20).unwrap();
        assert!(l.reduced);
        assert_eq!(l.n_wqe, 3);
    }

    #[test]
    fn layout_respects_stride_caps() {
        let mut a = attr(1 << 22, 1 << 15);
        a.striding_rq = Some(StridingRqCaps {
            min_single_stride_log_num_of_bytes: 8,
            max_single_stride_log_num_of_bytes: 13,
            min_single_wqe_log_num_of_strides: 3,
            max_single_wqe_log_num_of_strides: 9,
        });
        let l = StridingLayout::compute(&a, 0).unwrap();
        assert_eq!(l.stride_size, 256);
        assert_eq!(l.strides_per_wqe, 512);
    }

    #[test]
    fn layout_errors() {
        assert!(matches!(
            StridingLayout::compute(&attr(1 << 22, 1), 16 << 20),
            Err(Error::NotSupported(m)) if m.contains("Insufficient")
        ));
        let mut a = attr(1 << 22, 1 << 15);
        a.striding_rq = None;
        assert!(matches!(
            StridingLayout::compute(&a, 16 << 20),
            Err(Error::NotSupported(_))
        ));
    }

    /// A device with 1 KiB WQEs of 16 strides, so tests wrap quickly.
    fn small_sim(extended_cq: bool) -> Rc<SimDevice> {
        let mut config = SimConfig::default();
        config.attr.striding_rq = Some(StridingRqCaps {
            min_single_stride_log_num_of_bytes: 6,
            max_single_stride_log_num_of_bytes: 6,
            min_single_wqe_log_num_of_strides: 3,
            max_single_wqe_log_num_of_strides: 4,
        });
        config.attr.extended_cq = extended_cq;
        Rc::new(SimDevice::new(config))
    }

    fn recv_config(sim: &SimDevice, buffer_size: usize) -> RecvConfigBuilder {
        RecvConfigBuilder::new()
            .endpoint(SocketAddr::from((GROUP, PORT)))
            .interface_address(IpAddr::V4(sim.interface()))
            .buffer_size(buffer_size)
    }

    fn reader(sim: &Rc<SimDevice>, config: &RecvConfig) -> (MprqReader<SimDevice>, Rc<Capture>) {
        let capture = Rc::new(Capture::default());
        let r = MprqReader::new(Rc::clone(sim), config, capture.clone()).unwrap();
        (r, capture)
    }

    fn template() -> FrameTemplate {
        FrameTemplate {
            src_mac: MacAddr([2, 0, 0, 0, 0, 7]),
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 5555),
            target: FrameTarget {
                mac: multicast_mac(GROUP),
                endpoint: SocketAddrV4::new(GROUP, PORT),
            },
            ttl: 1,
        }
    }

    /// Frame of `len` payload bytes, all `fill`.
    fn frame(len: usize, fill: u8) -> Vec<u8> {
        build_frame(&template(), &vec![fill; len])
    }

    #[test]
    fn delivers_steered_frames() {
        let sim = small_sim(true);
        let (mut r, _) = reader(&sim, &recv_config(&sim, 4096).build().unwrap());
        assert_eq!(r.layout().wqe_size, 1024);
        assert_eq!(r.layout().n_wqe, 4);
        assert_eq!(sim.posted_wqes(), 4);

        assert_eq!(sim.deliver(&frame(100, 1)), 1);
        assert_eq!(sim.deliver(&frame(20, 2)), 1);
        let mut sink = Collect::default();
        assert_eq!(r.read(&mut sink).unwrap(), WakeAction::CompletionEvent);
        assert_eq!(sink.packets, vec![vec![1; 100], vec![2; 20]]);

        // Armed: the next frame fires the channel.
        let fd = r.completion_fd().unwrap();
        assert_eq!(sim.deliver(&frame(10, 3)), 1);
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 1);
        assert_eq!(
            r.handle_completion_event(&mut sink).unwrap(),
            WakeAction::CompletionEvent
        );
        assert_eq!(sink.packets.len(), 3);
    }

    #[test]
    fn wqes_repost_in_order_and_wrap() {
        for extended in [true, false] {
            let sim = small_sim(extended);
            let (mut r, _) = reader(&sim, &recv_config(&sim, 2048).build().unwrap());
            assert_eq!(r.layout().n_wqe, 2);
            let mut sink = Collect::default();
            // 100-byte payloads take 3 strides: five per WQE plus a filler.
            for round in 0..6u8 {
                for i in 0..7u8 {
                    assert_eq!(sim.deliver(&frame(100, round * 10 + i)), 1);
                }
                r.read(&mut sink).unwrap();
                assert_eq!(sim.posted_wqes(), 2);
            }
            assert_eq!(sink.packets.len(), 42);
            for (n, p) in sink.packets.iter().enumerate() {
                let expected = (n / 7) as u8 * 10 + (n % 7) as u8;
                assert_eq!(p, &vec![expected; 100], "packet {n}");
            }
            assert_eq!(sim.dropped_frames(), 0);
        }
    }

    #[test]
    fn poll_once_is_bounded() {
        for extended in [true, false] {
            let sim = small_sim(extended);
            let (mut r, _) = reader(&sim, &recv_config(&sim, 64 * 1024).build().unwrap());
            for i in 0..300u32 {
                assert_eq!(sim.deliver(&frame(8, i as u8)), 1);
            }
            let mut sink = Collect::default();
            assert_eq!(r.poll_once(&mut sink).unwrap(), PollResult::Partial);
            assert_eq!(sink.packets.len(), MAX_ITER, "extended: {extended}");
            assert_eq!(r.poll_once(&mut sink).unwrap(), PollResult::Drained);
            assert_eq!(sink.packets.len(), 300);
            for (i, p) in sink.packets.iter().enumerate() {
                assert_eq!(p, &vec![i as u8; 8], "packet {i}");
            }
        }
    }

    #[test]
    fn malformed_and_oversized_frames_are_skipped() {
        let sim = small_sim(true);
        let config = recv_config(&sim, 4096).max_size(50).build().unwrap();
        let (mut r, capture) = reader(&sim, &config);
        let mut tcp = frame(10, 0);
        tcp[23] = 6;
        sim.deliver(&tcp);
        sim.deliver(&frame(60, 1));
        sim.deliver(&frame(50, 2));
        let mut sink = Collect::default();
        r.read(&mut sink).unwrap();
        assert_eq!(sink.packets, vec![vec![2; 50]]);
        assert!(capture.contains("Packet is not UDP"));
        assert!(capture.contains("dropped packet due to truncation"));
        assert_eq!(capture.count(Level::Warning), 1);
    }

    #[test]
    fn stops_when_sink_stops() {
        let sim = small_sim(false);
        let (mut r, _) = reader(&sim, &recv_config(&sim, 4096).build().unwrap());
        for i in 0..5 {
            sim.deliver(&frame(16, i));
        }
        let mut sink = Collect {
            stop_after: Some(2),
            ..Collect::default()
        };
        assert_eq!(r.read(&mut sink).unwrap(), WakeAction::Stopped);
        assert_eq!(sink.packets.len(), 2);
    }

    #[test]
    fn reduced_buffer_is_logged() {
        let mut config = SimConfig::default();
        config.attr.max_cqe = 2 * 16384;
        let sim = Rc::new(SimDevice::new(config));
        let (r, capture) = reader(&sim, &recv_config(&sim, 4 << 20).build().unwrap());
        assert_eq!(r.layout().n_wqe, 2);
        assert!(capture.contains("Reducing buffer to 2097152 to accommodate device limits"));
    }

    #[test]
    fn busy_polling_returns_immediate() {
        let sim = small_sim(true);
        let config = recv_config(&sim, 4096).comp_vector(-1).max_poll(3).build().unwrap();
        let (mut r, _) = reader(&sim, &config);
        assert!(r.completion_fd().is_none());
        let mut sink = Collect::default();
        assert_eq!(r.read(&mut sink).unwrap(), WakeAction::Immediate);
    }

    #[test]
    fn teardown_and_failed_construction_release_everything() {
        let sim = small_sim(true);
        let (r, _) = reader(&sim, &recv_config(&sim, 4096).build().unwrap());
        drop(r);
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(sim.busy_destroys(), 0);
        assert_eq!(sim.destroyed().first(), Some(&ObjectKind::Flow));

        sim.fail_next("create_flow", libc::EPERM);
        let err = MprqReader::new(
            Rc::clone(&sim),
            &recv_config(&sim, 4096).build().unwrap(),
            crate::observer::tracing(),
        );
        assert!(matches!(err, Err(Error::Device { op: "ibv_create_flow", .. })));
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(sim.busy_destroys(), 0);
    }
}
