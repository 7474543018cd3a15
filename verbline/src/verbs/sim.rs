//! In-memory verbs device.
//!
//! `SimDevice` plays the adapter for tests and demos. Objects live in a slab
//! and track what they reference, so destroying an object that is still in
//! use fails with `EBUSY` the way the kernel driver does. Posted send chains
//! are gathered from their scatter-gather lists into frames on a wire log;
//! frames handed to [`SimDevice::deliver`] are steered through flows into
//! posted striding receive entries. Completion channels are backed by a real
//! `eventfd`, so io_uring polling works against the simulator.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use slab::Slab;

use super::*;
use crate::frame;

/// Status the simulator reports for a scatter-gather entry outside any
/// registration (IBV_WC_LOC_PROT_ERR).
pub const WC_LOC_PROT_ERR: u32 = 4;
/// Status reported for injected send failures (IBV_WC_GENERAL_ERR).
pub const WC_GENERAL_ERR: u32 = 21;

/// Kinds of simulated objects, as recorded in the destroy log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    EventChannel,
    CmId,
    DeviceContext,
    ProtectionDomain,
    CompletionChannel,
    CompletionQueue,
    QueuePair,
    MemoryRegion,
    Flow,
    WorkQueue,
    IndirectionTable,
}

/// Identity of the simulated adapter.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub interface: Ipv4Addr,
    pub mac: frame::MacAddr,
    pub port_num: u8,
    pub attr: DeviceAttr,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            interface: Ipv4Addr::new(10, 0, 0, 1),
            mac: frame::MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            port_num: 1,
            attr: DeviceAttr {
                max_cqe: 1 << 22,
                max_qp_wr: 32768,
                num_comp_vectors: 4,
                packet_pacing: Some(PacketPacingCaps {
                    qp_rate_limit_min: 1_000,
                    qp_rate_limit_max: 100_000_000,
                    raw_packet_qp: true,
                }),
                striding_rq: Some(StridingRqCaps {
                    min_single_stride_log_num_of_bytes: 6,
                    max_single_stride_log_num_of_bytes: 13,
                    min_single_wqe_log_num_of_strides: 3,
                    max_single_wqe_log_num_of_strides: 16,
                }),
                extended_cq: true,
            },
        }
    }
}

struct Cq {
    id: RawObject,
    capacity: usize,
    entries: VecDeque<WorkCompletion>,
    channel: Option<RawObject>,
    armed: bool,
    unacked: u32,
    polling: bool,
}

struct Qp {
    pd: RawObject,
    cqs: Option<(RawObject, RawObject)>,
    ind_table: Option<RawObject>,
    state: QpState,
    max_send_wr: u32,
    recv_posted: usize,
}

struct Wq {
    pd: RawObject,
    cq: RawObject,
    stride_size: usize,
    strides_per_wqe: usize,
    ready: bool,
    max_wr: usize,
    posted: VecDeque<RecvWr>,
    used: usize,
}

enum Object {
    EventChannel,
    CmId {
        channel: RawObject,
        bound: bool,
    },
    DeviceContext,
    Pd {
        id: RawObject,
    },
    CompChannel {
        id: RawObject,
        fd: OwnedFd,
        events: VecDeque<RawObject>,
    },
    Cq(Cq),
    Qp(Qp),
    Mr {
        pd: RawObject,
        addr: usize,
        len: usize,
        lkey: u32,
        access: Access,
    },
    Flow {
        qp: RawObject,
        spec: crate::flow::FlowSpec,
    },
    Wq(Wq),
    IndTable {
        wqs: Vec<RawObject>,
    },
}

impl Object {
    fn kind(&self) -> ObjectKind {
        match self {
            Object::EventChannel => ObjectKind::EventChannel,
            Object::CmId { .. } => ObjectKind::CmId,
            Object::DeviceContext => ObjectKind::DeviceContext,
            Object::Pd { .. } => ObjectKind::ProtectionDomain,
            Object::CompChannel { .. } => ObjectKind::CompletionChannel,
            Object::Cq(_) => ObjectKind::CompletionQueue,
            Object::Qp(_) => ObjectKind::QueuePair,
            Object::Mr { .. } => ObjectKind::MemoryRegion,
            Object::Flow { .. } => ObjectKind::Flow,
            Object::Wq(_) => ObjectKind::WorkQueue,
            Object::IndTable { .. } => ObjectKind::IndirectionTable,
        }
    }

    fn references(&self, target: RawObject) -> bool {
        match self {
            Object::EventChannel | Object::DeviceContext => false,
            Object::CmId { channel, .. } => *channel == target,
            Object::Pd { id } => *id == target,
            Object::CompChannel { id, .. } => *id == target,
            Object::Cq(cq) => cq.id == target || cq.channel == Some(target),
            Object::Qp(qp) => {
                qp.pd == target
                    || qp.ind_table == Some(target)
                    || qp.cqs.is_some_and(|(s, r)| s == target || r == target)
            }
            Object::Mr { pd, .. } => *pd == target,
            Object::Flow { qp, .. } => *qp == target,
            Object::Wq(wq) => wq.pd == target || wq.cq == target,
            Object::IndTable { wqs } => wqs.contains(&target),
        }
    }
}

struct PendingSend {
    cq: RawObject,
    wc: WorkCompletion,
}

struct State {
    config: SimConfig,
    objects: Slab<Object>,
    destroyed: Vec<ObjectKind>,
    busy_destroys: usize,
    next_lkey: u32,
    wire: Vec<Vec<u8>>,
    pending: VecDeque<PendingSend>,
    auto_complete: bool,
    loopback: bool,
    fail_sends: usize,
    injected: Vec<(&'static str, i32)>,
    rate_limits: Vec<RateLimit>,
    dropped_frames: usize,
    cq_overflows: usize,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn key(raw: RawObject) -> io::Result<usize> {
    raw.get().checked_sub(1).ok_or_else(|| errno(libc::EINVAL))
}

impl State {
    fn insert(&mut self, object: Object) -> RawObject {
        RawObject::new(self.objects.insert(object) + 1)
    }

    fn get(&self, raw: RawObject) -> io::Result<&Object> {
        self.objects.get(key(raw)?).ok_or_else(|| errno(libc::EINVAL))
    }

    fn get_mut(&mut self, raw: RawObject) -> io::Result<&mut Object> {
        self.objects.get_mut(key(raw)?).ok_or_else(|| errno(libc::EINVAL))
    }

    fn cq_mut(&mut self, raw: RawObject) -> io::Result<&mut Cq> {
        match self.get_mut(raw)? {
            Object::Cq(cq) => Ok(cq),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn check_injected(&mut self, op: &'static str) -> io::Result<()> {
        if let Some(pos) = self.injected.iter().position(|(o, _)| *o == op) {
            let (_, code) = self.injected.remove(pos);
            return Err(errno(code));
        }
        Ok(())
    }

    fn destroy(&mut self, raw: RawObject, kind: ObjectKind) -> io::Result<()> {
        let k = key(raw)?;
        match self.objects.get(k) {
            Some(obj) if obj.kind() == kind => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        let busy = self.objects.iter().any(|(_, o)| o.references(raw))
            || matches!(self.objects.get(k), Some(Object::Cq(cq)) if cq.unacked > 0);
        if busy {
            self.busy_destroys += 1;
            return Err(errno(libc::EBUSY));
        }
        self.objects.remove(k);
        self.destroyed.push(kind);
        Ok(())
    }

    /// Queue a completion on `cq`, firing its channel when armed.
    fn complete(&mut self, cq_raw: RawObject, wc: WorkCompletion) {
        let Ok(cq) = self.cq_mut(cq_raw) else {
            return;
        };
        if cq.entries.len() >= cq.capacity {
            self.cq_overflows += 1;
            return;
        }
        cq.entries.push_back(wc);
        if !cq.armed {
            return;
        }
        cq.armed = false;
        let Some(channel) = cq.channel else {
            return;
        };
        if let Ok(Object::CompChannel { fd, events, .. }) = self.get_mut(channel) {
            events.push_back(cq_raw);
            let one: u64 = 1;
            unsafe {
                libc::write(fd.as_raw_fd(), (&one as *const u64).cast(), 8);
            }
        }
    }

    /// Find the registration for `sge` and return the memory it describes.
    fn resolve(&self, pd: RawObject, sge: &Sge, access: Access) -> Option<*mut u8> {
        let addr = sge.addr as usize;
        let len = sge.length as usize;
        self.objects.iter().find_map(|(_, o)| match o {
            Object::Mr {
                pd: mr_pd,
                addr: start,
                len: mr_len,
                lkey,
                access: mr_access,
            } if *lkey == sge.lkey
                && *mr_pd == pd
                && mr_access.contains(access)
                && addr >= *start
                && addr + len <= start + mr_len =>
            {
                Some(addr as *mut u8)
            }
            _ => None,
        })
    }

    fn transmit(&mut self, qp_raw: RawObject, chain: &[SendWr]) -> io::Result<()> {
        let (pd, send_cq, state, max_send_wr) = match self.get(qp_raw)? {
            Object::Qp(Qp {
                pd,
                cqs: Some((send_cq, _)),
                state,
                max_send_wr,
                ..
            }) => (*pd, *send_cq, *state, *max_send_wr),
            _ => return Err(errno(libc::EINVAL)),
        };
        if state != QpState::ReadyToSend {
            return Err(errno(libc::EINVAL));
        }
        let outstanding = self.pending.iter().filter(|p| p.cq == send_cq).count();
        if outstanding + chain.len() > max_send_wr as usize {
            return Err(errno(libc::ENOMEM));
        }
        let mut chain_failed = false;
        for wr in chain {
            let mut frame_bytes = Vec::with_capacity(wr.byte_len());
            let mut ok = true;
            for sge in wr.sges() {
                match self.resolve(pd, sge, Access::LOCAL_READ) {
                    Some(ptr) => {
                        // Safety: the range lies inside a live registration.
                        let bytes = unsafe { std::slice::from_raw_parts(ptr, sge.length as usize) };
                        frame_bytes.extend_from_slice(bytes);
                    }
                    None => ok = false,
                }
            }
            if ok {
                if self.loopback {
                    self.steer(&frame_bytes);
                }
                self.wire.push(frame_bytes);
            } else {
                chain_failed = true;
            }
            if wr.signaled {
                let status = if chain_failed {
                    WcStatus::Failed(WC_LOC_PROT_ERR)
                } else if self.fail_sends > 0 {
                    self.fail_sends -= 1;
                    WcStatus::Failed(WC_GENERAL_ERR)
                } else {
                    WcStatus::Success
                };
                chain_failed = false;
                let wc = WorkCompletion {
                    wr_id: wr.wr_id,
                    status,
                    ..WorkCompletion::default()
                };
                if self.auto_complete {
                    self.complete(send_cq, wc);
                } else {
                    self.pending.push_back(PendingSend { cq: send_cq, wc });
                }
            }
        }
        Ok(())
    }

    /// Hand `frame` to every queue whose flows match it.
    fn steer(&mut self, frame: &[u8]) -> usize {
        let Some(dest) = frame::destination(frame) else {
            self.dropped_frames += 1;
            return 0;
        };
        let qps: Vec<RawObject> = self
            .objects
            .iter()
            .filter_map(|(_, o)| match o {
                Object::Flow { qp, spec } if spec.matches(dest.0, dest.1, dest.2) => Some(*qp),
                _ => None,
            })
            .collect();
        let mut delivered = 0;
        for qp in qps {
            let wq = match self.get(qp) {
                Ok(Object::Qp(Qp {
                    ind_table: Some(table),
                    ..
                })) => match self.get(*table) {
                    Ok(Object::IndTable { wqs }) => wqs.first().copied(),
                    _ => None,
                },
                _ => None,
            };
            match wq {
                Some(wq) if self.land(wq, frame) => delivered += 1,
                _ => self.dropped_frames += 1,
            }
        }
        delivered
    }

    /// Write `frame` into the head striding entry of `wq_raw`.
    fn land(&mut self, wq_raw: RawObject, frame: &[u8]) -> bool {
        let Ok(Object::Wq(wq)) = self.get_mut(wq_raw) else {
            return false;
        };
        if !wq.ready {
            return false;
        }
        let need = frame.len().div_ceil(wq.stride_size).max(1);
        if need > wq.strides_per_wqe {
            return false;
        }
        let mut fillers = Vec::new();
        if wq.used + need > wq.strides_per_wqe {
            if let Some(head) = wq.posted.pop_front() {
                fillers.push(WorkCompletion {
                    wr_id: head.wr_id,
                    stride_index: wq.used as u16,
                    strides: (wq.strides_per_wqe - wq.used) as u16,
                    filler: true,
                    ..WorkCompletion::default()
                });
            }
            wq.used = 0;
        }
        let cq = wq.cq;
        let Some(head) = wq.posted.front().copied() else {
            for wc in fillers {
                self.complete(cq, wc);
            }
            return false;
        };
        let stride_index = wq.used;
        let offset = stride_index * wq.stride_size;
        wq.used += need;
        let done = wq.used == wq.strides_per_wqe;
        if done {
            wq.posted.pop_front();
            wq.used = 0;
        }
        let pd = wq.pd;
        let target = Sge {
            addr: head.sge.addr + offset as u64,
            length: frame.len() as u32,
            lkey: head.sge.lkey,
        };
        for wc in fillers {
            self.complete(cq, wc);
        }
        let status = match self.resolve(pd, &target, Access::LOCAL_WRITE) {
            Some(ptr) => {
                // Safety: the range lies inside a live writable registration.
                unsafe { std::ptr::copy_nonoverlapping(frame.as_ptr(), ptr, frame.len()) };
                WcStatus::Success
            }
            None => WcStatus::Failed(WC_LOC_PROT_ERR),
        };
        self.complete(
            cq,
            WorkCompletion {
                wr_id: head.wr_id,
                status,
                byte_len: frame.len() as u32,
                stride_index: stride_index as u16,
                strides: need as u16,
                filler: false,
            },
        );
        true
    }
}

/// Simulated adapter implementing [`Provider`].
pub struct SimDevice {
    state: RefCell<State>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        SimDevice {
            state: RefCell::new(State {
                config,
                objects: Slab::new(),
                destroyed: Vec::new(),
                busy_destroys: 0,
                next_lkey: 0x100,
                wire: Vec::new(),
                pending: VecDeque::new(),
                auto_complete: true,
                loopback: false,
                fail_sends: 0,
                injected: Vec::new(),
                rate_limits: Vec::new(),
                dropped_frames: 0,
                cq_overflows: 0,
            }),
        }
    }

    pub fn interface(&self) -> Ipv4Addr {
        self.state.borrow().config.interface
    }

    pub fn mac(&self) -> frame::MacAddr {
        self.state.borrow().config.mac
    }

    /// When disabled, send completions wait for [`SimDevice::complete_sends`].
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.borrow_mut().auto_complete = enabled;
    }

    /// Steer transmitted frames back through the receive flows.
    pub fn set_loopback(&self, enabled: bool) {
        self.state.borrow_mut().loopback = enabled;
    }

    /// Make the next `count` signaled send completions fail.
    pub fn fail_sends(&self, count: usize) {
        self.state.borrow_mut().fail_sends += count;
    }

    /// Make the next call to provider method `op` fail with `code`.
    pub fn fail_next(&self, op: &'static str, code: i32) {
        self.state.borrow_mut().injected.push((op, code));
    }

    /// Release up to `max` held send completions. Returns how many.
    pub fn complete_sends(&self, max: usize) -> usize {
        let mut st = self.state.borrow_mut();
        let mut n = 0;
        while n < max {
            let Some(p) = st.pending.pop_front() else {
                break;
            };
            st.complete(p.cq, p.wc);
            n += 1;
        }
        n
    }

    pub fn pending_sends(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Drain the frames transmitted so far.
    pub fn take_transmitted(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.borrow_mut().wire)
    }

    /// Deliver a frame from the wire. Returns how many queues received it.
    pub fn deliver(&self, frame: &[u8]) -> usize {
        self.state.borrow_mut().steer(frame)
    }

    pub fn dropped_frames(&self) -> usize {
        self.state.borrow().dropped_frames
    }

    pub fn cq_overflows(&self) -> usize {
        self.state.borrow().cq_overflows
    }

    pub fn rate_limits(&self) -> Vec<RateLimit> {
        self.state.borrow().rate_limits.clone()
    }

    /// Striding receive entries currently owned by the device, across all
    /// work queues.
    pub fn posted_wqes(&self) -> usize {
        self.state
            .borrow()
            .objects
            .iter()
            .map(|(_, o)| match o {
                Object::Wq(wq) => wq.posted.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn live_objects(&self) -> usize {
        self.state.borrow().objects.len()
    }

    pub fn live_of(&self, kind: ObjectKind) -> usize {
        self.state
            .borrow()
            .objects
            .iter()
            .filter(|(_, o)| o.kind() == kind)
            .count()
    }

    /// Kinds of destroyed objects, in destruction order.
    pub fn destroyed(&self) -> Vec<ObjectKind> {
        self.state.borrow().destroyed.clone()
    }

    /// Destroy calls rejected because the object was still referenced.
    pub fn busy_destroys(&self) -> usize {
        self.state.borrow().busy_destroys
    }
}

impl Provider for SimDevice {
    fn create_event_channel(&self) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_event_channel")?;
        Ok(st.insert(Object::EventChannel))
    }

    fn destroy_event_channel(&self, channel: RawObject) -> io::Result<()> {
        self.state
            .borrow_mut()
            .destroy(channel, ObjectKind::EventChannel)
    }

    fn create_id(&self, channel: RawObject) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_id")?;
        match st.get(channel)? {
            Object::EventChannel => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        Ok(st.insert(Object::CmId {
            channel,
            bound: false,
        }))
    }

    fn destroy_id(&self, id: RawObject) -> io::Result<()> {
        self.state.borrow_mut().destroy(id, ObjectKind::CmId)
    }

    fn bind_addr(&self, id: RawObject, addr: Ipv4Addr) -> io::Result<BoundPort> {
        let mut st = self.state.borrow_mut();
        st.check_injected("bind_addr")?;
        if addr != st.config.interface {
            return Err(errno(libc::EADDRNOTAVAIL));
        }
        let port = BoundPort {
            port_num: st.config.port_num,
            mac: st.config.mac,
        };
        match st.get_mut(id)? {
            Object::CmId { bound, .. } => *bound = true,
            _ => return Err(errno(libc::EINVAL)),
        }
        Ok(port)
    }

    fn query_device(&self, id: RawObject) -> io::Result<DeviceAttr> {
        let mut st = self.state.borrow_mut();
        st.check_injected("query_device")?;
        match st.get(id)? {
            Object::CmId { bound: true, .. } => Ok(st.config.attr.clone()),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn open_device(&self, addr: Ipv4Addr) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("open_device")?;
        if addr != st.config.interface {
            return Err(errno(libc::ENODEV));
        }
        Ok(st.insert(Object::DeviceContext))
    }

    fn close_device(&self, ctx: RawObject) -> io::Result<()> {
        self.state
            .borrow_mut()
            .destroy(ctx, ObjectKind::DeviceContext)
    }

    fn alloc_pd(&self, id: RawObject) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("alloc_pd")?;
        match st.get(id)? {
            Object::CmId { bound: true, .. } => Ok(st.insert(Object::Pd { id })),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn dealloc_pd(&self, pd: RawObject) -> io::Result<()> {
        self.state
            .borrow_mut()
            .destroy(pd, ObjectKind::ProtectionDomain)
    }

    unsafe fn reg_mr(
        &self,
        pd: RawObject,
        addr: *const u8,
        len: usize,
        access: Access,
    ) -> io::Result<(RawObject, u32)> {
        let mut st = self.state.borrow_mut();
        st.check_injected("reg_mr")?;
        if len == 0 || addr.is_null() {
            return Err(errno(libc::EINVAL));
        }
        match st.get(pd)? {
            Object::Pd { .. } => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        let lkey = st.next_lkey;
        st.next_lkey += 1;
        let mr = st.insert(Object::Mr {
            pd,
            addr: addr as usize,
            len,
            lkey,
            access,
        });
        Ok((mr, lkey))
    }

    fn dereg_mr(&self, mr: RawObject) -> io::Result<()> {
        self.state
            .borrow_mut()
            .destroy(mr, ObjectKind::MemoryRegion)
    }

    fn create_comp_channel(&self, id: RawObject) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_comp_channel")?;
        st.get(id)?;
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: eventfd returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(st.insert(Object::CompChannel {
            id,
            fd,
            events: VecDeque::new(),
        }))
    }

    fn destroy_comp_channel(&self, channel: RawObject) -> io::Result<()> {
        self.state
            .borrow_mut()
            .destroy(channel, ObjectKind::CompletionChannel)
    }

    fn comp_channel_fd(&self, channel: RawObject) -> RawFd {
        match self.state.borrow().get(channel) {
            Ok(Object::CompChannel { fd, .. }) => fd.as_raw_fd(),
            _ => -1,
        }
    }

    fn get_cq_event(&self, channel: RawObject) -> io::Result<Option<RawObject>> {
        let mut st = self.state.borrow_mut();
        let cq = match st.get_mut(channel)? {
            Object::CompChannel { fd, events, .. } => {
                let cq = events.pop_front();
                if events.is_empty() {
                    let mut counter = [0u8; 8];
                    unsafe {
                        libc::read(fd.as_raw_fd(), counter.as_mut_ptr().cast(), 8);
                    }
                }
                cq
            }
            _ => return Err(errno(libc::EINVAL)),
        };
        if let Some(cq) = cq {
            st.cq_mut(cq)?.unacked += 1;
        }
        Ok(cq)
    }

    fn create_cq(
        &self,
        id: RawObject,
        cqe: u32,
        channel: Option<RawObject>,
        comp_vector: u32,
    ) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_cq")?;
        st.get(id)?;
        let attr = &st.config.attr;
        if cqe == 0 || cqe > attr.max_cqe || comp_vector >= attr.num_comp_vectors.max(1) {
            return Err(errno(libc::EINVAL));
        }
        if let Some(ch) = channel {
            match st.get(ch)? {
                Object::CompChannel { .. } => {}
                _ => return Err(errno(libc::EINVAL)),
            }
        }
        Ok(st.insert(Object::Cq(Cq {
            id,
            capacity: cqe as usize,
            entries: VecDeque::new(),
            channel,
            armed: false,
            unacked: 0,
            polling: false,
        })))
    }

    fn destroy_cq(&self, cq: RawObject) -> io::Result<()> {
        self.state
            .borrow_mut()
            .destroy(cq, ObjectKind::CompletionQueue)
    }

    fn poll_cq(&self, cq: RawObject, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        let mut st = self.state.borrow_mut();
        let cq = st.cq_mut(cq)?;
        let mut n = 0;
        while n < wc.len() {
            let Some(entry) = cq.entries.pop_front() else {
                break;
            };
            wc[n] = entry;
            n += 1;
        }
        Ok(n)
    }

    fn req_notify_cq(&self, cq: RawObject, _solicited_only: bool) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_injected("req_notify_cq")?;
        let cq = st.cq_mut(cq)?;
        if cq.channel.is_none() {
            return Err(errno(libc::EINVAL));
        }
        cq.armed = true;
        Ok(())
    }

    fn ack_cq_events(&self, cq: RawObject, count: u32) {
        if let Ok(cq) = self.state.borrow_mut().cq_mut(cq) {
            cq.unacked = cq.unacked.saturating_sub(count);
        }
    }

    fn start_poll(&self, cq: RawObject) -> io::Result<Option<WorkCompletion>> {
        let mut st = self.state.borrow_mut();
        let extended = st.config.attr.extended_cq;
        let cq = st.cq_mut(cq)?;
        if !extended || cq.polling {
            return Err(errno(libc::EINVAL));
        }
        let wc = cq.entries.pop_front();
        cq.polling = wc.is_some();
        Ok(wc)
    }

    fn next_poll(&self, cq: RawObject) -> io::Result<Option<WorkCompletion>> {
        let mut st = self.state.borrow_mut();
        let cq = st.cq_mut(cq)?;
        if !cq.polling {
            return Err(errno(libc::EINVAL));
        }
        Ok(cq.entries.pop_front())
    }

    fn end_poll(&self, cq: RawObject) {
        if let Ok(cq) = self.state.borrow_mut().cq_mut(cq) {
            cq.polling = false;
        }
    }

    fn create_qp(&self, pd: RawObject, attr: &QpInitAttr) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_qp")?;
        match st.get(pd)? {
            Object::Pd { .. } => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        let max_wr = st.config.attr.max_qp_wr;
        if attr.caps.max_send_wr > max_wr || attr.caps.max_recv_wr > max_wr {
            return Err(errno(libc::EINVAL));
        }
        if attr.caps.max_send_sge as usize > MAX_SGE {
            return Err(errno(libc::EINVAL));
        }
        st.cq_mut(attr.send_cq)?;
        st.cq_mut(attr.recv_cq)?;
        Ok(st.insert(Object::Qp(Qp {
            pd,
            cqs: Some((attr.send_cq, attr.recv_cq)),
            ind_table: None,
            state: QpState::Reset,
            max_send_wr: attr.caps.max_send_wr,
            recv_posted: 0,
        })))
    }

    fn create_hash_qp(&self, id: RawObject, attr: &HashQpInitAttr) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_hash_qp")?;
        st.get(id)?;
        match st.get(attr.ind_table)? {
            Object::IndTable { .. } => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        Ok(st.insert(Object::Qp(Qp {
            pd: attr.pd,
            cqs: None,
            ind_table: Some(attr.ind_table),
            state: QpState::ReadyToReceive,
            max_send_wr: 0,
            recv_posted: 0,
        })))
    }

    fn destroy_qp(&self, qp: RawObject) -> io::Result<()> {
        self.state.borrow_mut().destroy(qp, ObjectKind::QueuePair)
    }

    fn modify_qp(&self, qp: RawObject, state: QpState, _port_num: Option<u8>) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_injected("modify_qp")?;
        match st.get_mut(qp)? {
            Object::Qp(q) if state == QpState::Error || state > q.state => {
                q.state = state;
                Ok(())
            }
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn modify_qp_rate_limit(&self, qp: RawObject, limit: &RateLimit) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_injected("modify_qp_rate_limit")?;
        let caps = st.config.attr.packet_pacing.unwrap_or_default();
        if !caps.raw_packet_qp
            || limit.rate_limit < caps.qp_rate_limit_min
            || limit.rate_limit > caps.qp_rate_limit_max
        {
            return Err(errno(libc::EINVAL));
        }
        match st.get(qp)? {
            Object::Qp(_) => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        st.rate_limits.push(*limit);
        Ok(())
    }

    fn post_send(&self, qp: RawObject, chain: &[SendWr]) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_injected("post_send")?;
        st.transmit(qp, chain)
    }

    fn post_recv(&self, qp: RawObject, _wr: &RecvWr) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        match st.get_mut(qp)? {
            Object::Qp(q) if q.cqs.is_some() => {
                q.recv_posted += 1;
                Ok(())
            }
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn create_flow(&self, qp: RawObject, spec: &crate::flow::FlowSpec) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_flow")?;
        match st.get(qp)? {
            Object::Qp(_) => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        Ok(st.insert(Object::Flow {
            qp,
            spec: spec.clone(),
        }))
    }

    fn destroy_flow(&self, flow: RawObject) -> io::Result<()> {
        self.state.borrow_mut().destroy(flow, ObjectKind::Flow)
    }

    fn create_wq(&self, id: RawObject, attr: &WqInitAttr) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_wq")?;
        st.get(id)?;
        let Some(caps) = st.config.attr.striding_rq else {
            return Err(errno(libc::EOPNOTSUPP));
        };
        let p = attr.striding;
        let stride_ok = (caps.min_single_stride_log_num_of_bytes
            ..=caps.max_single_stride_log_num_of_bytes)
            .contains(&p.single_stride_log_num_of_bytes);
        let strides_ok = (caps.min_single_wqe_log_num_of_strides
            ..=caps.max_single_wqe_log_num_of_strides)
            .contains(&p.single_wqe_log_num_of_strides);
        if !stride_ok || !strides_ok || attr.max_wr > st.config.attr.max_qp_wr {
            return Err(errno(libc::EINVAL));
        }
        st.cq_mut(attr.cq)?;
        Ok(st.insert(Object::Wq(Wq {
            pd: attr.pd,
            cq: attr.cq,
            stride_size: 1 << p.single_stride_log_num_of_bytes,
            strides_per_wqe: 1 << p.single_wqe_log_num_of_strides,
            ready: false,
            max_wr: attr.max_wr as usize,
            posted: VecDeque::new(),
            used: 0,
        })))
    }

    fn modify_wq(&self, wq: RawObject, state: WqState) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_injected("modify_wq")?;
        match st.get_mut(wq)? {
            Object::Wq(w) => {
                w.ready = state == WqState::Ready;
                Ok(())
            }
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn destroy_wq(&self, wq: RawObject) -> io::Result<()> {
        self.state.borrow_mut().destroy(wq, ObjectKind::WorkQueue)
    }

    fn post_wq_recv(&self, wq: RawObject, wr: &RecvWr) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_injected("post_wq_recv")?;
        match st.get_mut(wq)? {
            Object::Wq(w) if w.posted.len() < w.max_wr => {
                if wr.sge.length as usize != w.stride_size * w.strides_per_wqe {
                    return Err(errno(libc::EINVAL));
                }
                w.posted.push_back(*wr);
                Ok(())
            }
            Object::Wq(_) => Err(errno(libc::ENOMEM)),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn create_rwq_ind_table(&self, id: RawObject, wqs: &[RawObject]) -> io::Result<RawObject> {
        let mut st = self.state.borrow_mut();
        st.check_injected("create_rwq_ind_table")?;
        st.get(id)?;
        if wqs.is_empty() || !wqs.len().is_power_of_two() {
            return Err(errno(libc::EINVAL));
        }
        for wq in wqs {
            match st.get(*wq)? {
                Object::Wq(_) => {}
                _ => return Err(errno(libc::EINVAL)),
            }
        }
        Ok(st.insert(Object::IndTable { wqs: wqs.to_vec() }))
    }

    fn destroy_rwq_ind_table(&self, table: RawObject) -> io::Result<()> {
        self.state
            .borrow_mut()
            .destroy(table, ObjectKind::IndirectionTable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(sim: &SimDevice) -> (RawObject, RawObject) {
        let ch = sim.create_event_channel().unwrap();
        let id = sim.create_id(ch).unwrap();
        sim.bind_addr(id, sim.interface()).unwrap();
        (ch, id)
    }

    #[test]
    fn destroy_in_use_is_busy() {
        let sim = SimDevice::default();
        let (ch, id) = bound(&sim);
        let pd = sim.alloc_pd(id).unwrap();
        assert_eq!(
            sim.destroy_id(id).unwrap_err().raw_os_error(),
            Some(libc::EBUSY)
        );
        assert_eq!(sim.busy_destroys(), 1);
        sim.dealloc_pd(pd).unwrap();
        sim.destroy_id(id).unwrap();
        sim.destroy_event_channel(ch).unwrap();
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(
            sim.destroyed(),
            vec![
                ObjectKind::ProtectionDomain,
                ObjectKind::CmId,
                ObjectKind::EventChannel
            ]
        );
    }

    #[test]
    fn bind_rejects_foreign_address() {
        let sim = SimDevice::default();
        let ch = sim.create_event_channel().unwrap();
        let id = sim.create_id(ch).unwrap();
        assert!(sim.bind_addr(id, Ipv4Addr::new(192, 168, 9, 9)).is_err());
        assert!(sim.query_device(id).is_err());
    }

    #[test]
    fn injected_failure_fires_once() {
        let sim = SimDevice::default();
        sim.fail_next("create_event_channel", libc::ENOMEM);
        assert!(sim.create_event_channel().is_err());
        assert!(sim.create_event_channel().is_ok());
    }

    #[test]
    fn armed_cq_signals_eventfd() {
        let sim = SimDevice::default();
        let (_ch, id) = bound(&sim);
        let comp = sim.create_comp_channel(id).unwrap();
        let cq = sim.create_cq(id, 16, Some(comp), 0).unwrap();
        sim.req_notify_cq(cq, false).unwrap();
        sim.state.borrow_mut().complete(cq, WorkCompletion::default());

        let fd = sim.comp_channel_fd(comp);
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 1);
        assert_eq!(sim.get_cq_event(comp).unwrap(), Some(cq));
        assert_eq!(sim.get_cq_event(comp).unwrap(), None);
        assert_eq!(
            sim.destroy_cq(cq).unwrap_err().raw_os_error(),
            Some(libc::EBUSY)
        );
        sim.ack_cq_events(cq, 1);
        sim.destroy_cq(cq).unwrap();
    }

    #[test]
    fn extended_poll_session() {
        let sim = SimDevice::default();
        let (_ch, id) = bound(&sim);
        let cq = sim.create_cq(id, 16, None, 0).unwrap();
        assert_eq!(sim.start_poll(cq).unwrap(), None);
        for i in 0..3 {
            sim.state.borrow_mut().complete(
                cq,
                WorkCompletion {
                    wr_id: i,
                    ..WorkCompletion::default()
                },
            );
        }
        assert_eq!(sim.start_poll(cq).unwrap().map(|w| w.wr_id), Some(0));
        assert!(sim.start_poll(cq).is_err());
        assert_eq!(sim.next_poll(cq).unwrap().map(|w| w.wr_id), Some(1));
        sim.end_poll(cq);
        let mut wc = [WorkCompletion::default(); 4];
        assert_eq!(sim.poll_cq(cq, &mut wc).unwrap(), 1);
        assert_eq!(wc[0].wr_id, 2);
    }

    #[test]
    fn cq_overflow_drops() {
        let sim = SimDevice::default();
        let (_ch, id) = bound(&sim);
        let cq = sim.create_cq(id, 2, None, 0).unwrap();
        for _ in 0..3 {
            sim.state
                .borrow_mut()
                .complete(cq, WorkCompletion::default());
        }
        assert_eq!(sim.cq_overflows(), 1);
    }
}
