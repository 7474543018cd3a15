//! [`Provider`] over libibverbs, librdmacm and mlx5 direct verbs.
//!
//! Object ids are the libraries' own pointers. Calls that `verbs.h` only
//! offers as inline wrappers are dispatched through the context's operation
//! tables, the same way the wrappers do it.
//!
//! Striding receive queues report each completion's stride count and filler
//! flag packed into the byte-count word, but not its stride index. The
//! device fills strides in order, so the index is tracked per completion
//! queue here.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, c_void};
use std::io;
use std::mem::{self, offset_of, size_of};
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::os::raw::c_int;
use std::ptr;

use rdma_sys::{
    ibv_ack_cq_events, ibv_alloc_pd, ibv_close_device, ibv_comp_channel, ibv_context,
    ibv_cq, ibv_cq_ex, ibv_cq_init_attr_ex, ibv_create_comp_channel, ibv_create_cq,
    ibv_create_qp, ibv_dealloc_pd, ibv_dereg_mr, ibv_destroy_comp_channel, ibv_destroy_cq,
    ibv_destroy_qp, ibv_device_attr, ibv_device_attr_ex, ibv_flow, ibv_flow_attr,
    ibv_flow_attr_type, ibv_flow_spec_eth, ibv_flow_spec_ipv4, ibv_flow_spec_tcp_udp,
    ibv_flow_spec_type, ibv_get_cq_event, ibv_modify_qp, ibv_mr, ibv_open_device, ibv_pd,
    ibv_poll_cq_attr, ibv_qp, ibv_qp_attr, ibv_qp_init_attr, ibv_qp_init_attr_ex,
    ibv_qp_rate_limit_attr, ibv_qp_state, ibv_qp_type, ibv_query_device, ibv_recv_wr,
    ibv_reg_mr, ibv_rwq_ind_table, ibv_rwq_ind_table_init_attr, ibv_send_wr, ibv_sge, ibv_wc,
    ibv_wc_status, ibv_wq, ibv_wq_attr, ibv_wq_init_attr, ibv_wq_state, ibv_wq_type,
    ibv_wr_opcode, rdma_bind_addr, rdma_cm_id, rdma_create_event_channel, rdma_create_id,
    rdma_destroy_event_channel, rdma_destroy_id, rdma_event_channel, rdma_port_space,
    verbs_context,
};

use super::mlx5dv::{
    MLX5DV_CONTEXT_MASK_STRIDING_RQ, MLX5DV_WQ_INIT_ATTR_MASK_STRIDING_RQ, MPRQ_FILLER_MASK,
    MPRQ_LEN_MASK, MPRQ_STRIDE_NUM_MASK, MPRQ_STRIDE_NUM_SHIFT, mlx5dv_context,
    mlx5dv_create_wq, mlx5dv_is_supported, mlx5dv_query_device, mlx5dv_striding_rq_init_attr,
    mlx5dv_wq_init_attr,
};
use super::{
    Access, BoundPort, DeviceAttr, HashQpInitAttr, PacketPacingCaps, Provider, QpInitAttr,
    QpState, RateLimit, RawObject, RecvWr, SendWr, StridingRqCaps, WcStatus, WorkCompletion,
    WqInitAttr, WqState,
};
use crate::flow::FlowSpec;
use crate::frame::MacAddr;

const IBV_ACCESS_LOCAL_WRITE: c_int = 1;
const IBV_SEND_SIGNALED: u32 = 1 << 1;
const IBV_QP_STATE: c_int = 1 << 0;
const IBV_QP_PORT: c_int = 1 << 5;
const IBV_QP_INIT_ATTR_PD: u32 = 1 << 0;
const IBV_QP_INIT_ATTR_IND_TABLE: u32 = 1 << 4;
const IBV_QP_INIT_ATTR_RX_HASH: u32 = 1 << 5;
const IBV_RX_HASH_FUNC_TOEPLITZ: u8 = 1;
const IBV_WC_EX_WITH_BYTE_LEN: u64 = 1 << 0;
const IBV_WQ_ATTR_STATE: u32 = 1 << 0;

/// Legacy polls fetch at most this many entries per call.
const POLL_BATCH: usize = 32;

fn ptr_of<T>(object: RawObject) -> *mut T {
    object.get() as *mut T
}

fn object<T>(ptr: *mut T) -> io::Result<RawObject> {
    if ptr.is_null() {
        Err(last_error())
    } else {
        Ok(RawObject::new(ptr as usize))
    }
}

/// `errno` after a failed call, never "success".
fn last_error() -> io::Error {
    let e = io::Error::last_os_error();
    match e.raw_os_error() {
        Some(0) | None => io::Error::from_raw_os_error(libc::EIO),
        _ => e,
    }
}

/// Verbs calls return 0, an errno value, or -1 with `errno` set.
fn check(ret: c_int) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        -1 => Err(last_error()),
        e => Err(io::Error::from_raw_os_error(e.abs())),
    }
}

fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::EOPNOTSUPP)
}

/// The extended context that carries a verbs context, if the provider has
/// one.
///
/// # Safety
///
/// `ctx` must be null or a live device context.
unsafe fn extended<'a>(ctx: *mut ibv_context) -> Option<&'a verbs_context> {
    // Safety: the caller guarantees `ctx` is live; an extended context
    // embeds it as its last field.
    unsafe {
        if ctx.is_null() || (*ctx).abi_compat as usize != usize::MAX {
            return None;
        }
        let base = ctx.cast::<u8>().sub(offset_of!(verbs_context, context));
        Some(&*base.cast::<verbs_context>())
    }
}

/// Look up an optional operation of an extended context.
macro_rules! context_op {
    ($ctx:expr, $op:ident) => {
        // Safety: callers pass contexts of live objects.
        match unsafe { extended($ctx) } {
            Some(v) if v.sz >= size_of::<verbs_context>() - offset_of!(verbs_context, $op) => v.$op,
            _ => None,
        }
    };
}

/// Position of the device within the current receive entry of a striding
/// queue.
#[derive(Debug, Clone, Copy)]
struct StrideCursor {
    per_wqe: u32,
    used: u32,
}

impl StrideCursor {
    fn new(log_strides: u8) -> Self {
        StrideCursor {
            per_wqe: 1 << log_strides,
            used: 0,
        }
    }

    /// Unpack the byte-count word of a successful completion into `wc`.
    fn apply(&mut self, byte_cnt: u32, wc: &mut WorkCompletion) {
        let strides = (byte_cnt & MPRQ_STRIDE_NUM_MASK) >> MPRQ_STRIDE_NUM_SHIFT;
        wc.byte_len = byte_cnt & MPRQ_LEN_MASK;
        wc.filler = byte_cnt & MPRQ_FILLER_MASK != 0;
        wc.stride_index = self.used as u16;
        wc.strides = strides as u16;
        self.used += strides;
        if self.used >= self.per_wqe {
            self.used = 0;
        }
    }
}

#[derive(Debug, Default)]
struct CqInfo {
    extended: bool,
    striding: Option<StrideCursor>,
}

/// Translate one completion. `byte_cnt` is only read for successes.
fn completion(
    wr_id: u64,
    status: u32,
    byte_cnt: impl FnOnce() -> u32,
    striding: Option<&mut StrideCursor>,
) -> WorkCompletion {
    let mut wc = WorkCompletion {
        wr_id,
        ..WorkCompletion::default()
    };
    if status != ibv_wc_status::IBV_WC_SUCCESS as u32 {
        wc.status = WcStatus::Failed(status);
        return wc;
    }
    let byte_cnt = byte_cnt();
    match striding {
        Some(cursor) => cursor.apply(byte_cnt, &mut wc),
        None => wc.byte_len = byte_cnt,
    }
    wc
}

/// One steering rule as the kernel expects it: the attribute header
/// followed by its specs, back to back.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct FlowRule {
    attr: ibv_flow_attr,
    eth: ibv_flow_spec_eth,
    ip: ibv_flow_spec_ipv4,
    udp: ibv_flow_spec_tcp_udp,
}

impl FlowRule {
    fn new(spec: &FlowSpec) -> Self {
        // Safety: plain C structs, valid when zeroed.
        let (mut attr, mut eth, mut ip, mut udp): (
            ibv_flow_attr,
            ibv_flow_spec_eth,
            ibv_flow_spec_ipv4,
            ibv_flow_spec_tcp_udp,
        ) = unsafe { (mem::zeroed(), mem::zeroed(), mem::zeroed(), mem::zeroed()) };

        attr.type_ = ibv_flow_attr_type::IBV_FLOW_ATTR_NORMAL;
        attr.size = size_of::<FlowRule>() as u16;
        attr.num_of_specs = 3;
        attr.port = spec.port_num;

        eth.type_ = ibv_flow_spec_type::IBV_FLOW_SPEC_ETH;
        eth.size = size_of::<ibv_flow_spec_eth>() as u16;
        eth.val.dst_mac = spec.dst_mac.0;
        eth.mask.dst_mac = [0xff; 6];
        eth.val.ether_type = spec.ether_type.to_be();
        eth.mask.ether_type = 0xffff;

        ip.type_ = ibv_flow_spec_type::IBV_FLOW_SPEC_IPV4;
        ip.size = size_of::<ibv_flow_spec_ipv4>() as u16;
        if let Some(dst) = spec.dst_ip {
            ip.val.dst_ip = u32::from(dst).to_be();
            ip.mask.dst_ip = u32::MAX;
        }

        udp.type_ = ibv_flow_spec_type::IBV_FLOW_SPEC_UDP;
        udp.size = size_of::<ibv_flow_spec_tcp_udp>() as u16;
        udp.val.dst_port = spec.udp_dst_port.to_be();
        udp.mask.dst_port = 0xffff;

        FlowRule { attr, eth, ip, udp }
    }
}

/// Link-layer address of the interface that owns `addr`.
pub fn interface_mac(addr: Ipv4Addr) -> io::Result<MacAddr> {
    struct IfAddrs(*mut libc::ifaddrs);

    impl Drop for IfAddrs {
        fn drop(&mut self) {
            // Safety: the list came from getifaddrs and is freed once.
            unsafe { libc::freeifaddrs(self.0) };
        }
    }

    let mut head = ptr::null_mut();
    // Safety: getifaddrs fills `head` on success.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let list = IfAddrs(head);
    // Safety: entries stay valid until `list` is dropped.
    let entries = || {
        std::iter::successors(unsafe { list.0.as_ref() }, |ifa| unsafe {
            ifa.ifa_next.as_ref()
        })
    };
    let family = |ifa: &libc::ifaddrs| {
        // Safety: a non-null ifa_addr points at a sockaddr.
        unsafe { ifa.ifa_addr.as_ref() }.map(|sa| c_int::from(sa.sa_family))
    };

    let name = entries()
        .find(|ifa| {
            family(ifa) == Some(libc::AF_INET) && {
                // Safety: AF_INET entries hold a sockaddr_in.
                let sin = unsafe { &*ifa.ifa_addr.cast::<libc::sockaddr_in>() };
                u32::from_be(sin.sin_addr.s_addr) == u32::from(addr)
            }
        })
        // Safety: ifa_name is a NUL-terminated interface name.
        .map(|ifa| unsafe { CStr::from_ptr(ifa.ifa_name) })
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EADDRNOTAVAIL))?;

    entries()
        .filter(|ifa| family(ifa) == Some(libc::AF_PACKET))
        // Safety: as above.
        .filter(|ifa| unsafe { CStr::from_ptr(ifa.ifa_name) } == name)
        .find_map(|ifa| {
            // Safety: AF_PACKET entries hold a sockaddr_ll.
            let sll = unsafe { &*ifa.ifa_addr.cast::<libc::sockaddr_ll>() };
            (sll.sll_halen == 6).then(|| {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&sll.sll_addr[..6]);
                MacAddr(mac)
            })
        })
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))
}

/// A verbs-capable adapter reached through the system's RDMA libraries.
///
/// Mellanox/NVIDIA ConnectX devices support every stream feature. Other
/// devices can send, but lack striding receive queues.
#[derive(Default)]
pub struct IbvDevice {
    cqs: RefCell<HashMap<usize, CqInfo>>,
    send_wrs: RefCell<Vec<ibv_send_wr>>,
}

impl IbvDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn context_of_id(id: RawObject) -> io::Result<*mut ibv_context> {
        // Safety: `id` is a live connection id.
        let ctx = unsafe { (*ptr_of::<rdma_cm_id>(id)).verbs };
        if ctx.is_null() {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        Ok(ctx)
    }

    fn poll_next_ex(&self, cq: RawObject, ret: c_int) -> io::Result<Option<WorkCompletion>> {
        match ret {
            0 => {}
            libc::ENOENT => return Ok(None),
            e => return Err(io::Error::from_raw_os_error(e)),
        }
        let cq_ex = ptr_of::<ibv_cq_ex>(cq);
        // Safety: a poll session is open on a live extended queue.
        let (wr_id, status, read_len) = unsafe {
            (
                (*cq_ex).wr_id,
                (*cq_ex).status as u32,
                (*cq_ex).read_byte_len,
            )
        };
        let mut cqs = self.cqs.borrow_mut();
        let striding = cqs.get_mut(&cq.get()).and_then(|i| i.striding.as_mut());
        let byte_cnt = || {
            // Safety: as above.
            read_len.map_or(0, |read| unsafe { read(cq_ex) })
        };
        Ok(Some(completion(wr_id, status, byte_cnt, striding)))
    }
}

impl Provider for IbvDevice {
    fn create_event_channel(&self) -> io::Result<RawObject> {
        // Safety: no preconditions.
        object(unsafe { rdma_create_event_channel() })
    }

    fn destroy_event_channel(&self, channel: RawObject) -> io::Result<()> {
        // Safety: `channel` is live and has no ids left.
        unsafe { rdma_destroy_event_channel(ptr_of::<rdma_event_channel>(channel)) };
        Ok(())
    }

    fn create_id(&self, channel: RawObject) -> io::Result<RawObject> {
        let mut id = ptr::null_mut();
        // Safety: `channel` is live; `id` is written on success.
        check(unsafe {
            rdma_create_id(
                ptr_of::<rdma_event_channel>(channel),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_UDP,
            )
        })?;
        object(id)
    }

    fn destroy_id(&self, id: RawObject) -> io::Result<()> {
        // Safety: `id` is live.
        check(unsafe { rdma_destroy_id(ptr_of::<rdma_cm_id>(id)) })
    }

    fn bind_addr(&self, id: RawObject, addr: Ipv4Addr) -> io::Result<BoundPort> {
        // Safety: sockaddr_in is valid when zeroed.
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_addr.s_addr = u32::from(addr).to_be();
        let raw = ptr_of::<rdma_cm_id>(id);
        // Safety: `raw` is live and `sin` outlives the call.
        check(unsafe { rdma_bind_addr(raw, (&mut sin as *mut libc::sockaddr_in).cast()) })?;
        Self::context_of_id(id)?;
        Ok(BoundPort {
            // Safety: `raw` is live.
            port_num: unsafe { (*raw).port_num },
            mac: interface_mac(addr)?,
        })
    }

    fn query_device(&self, id: RawObject) -> io::Result<DeviceAttr> {
        let ctx = Self::context_of_id(id)?;
        let mut attr = DeviceAttr {
            // Safety: `ctx` is live.
            num_comp_vectors: unsafe { (*ctx).num_comp_vectors }.max(0) as u32,
            extended_cq: context_op!(ctx, create_cq_ex).is_some(),
            ..DeviceAttr::default()
        };
        let raw_packet = 1 << (ibv_qp_type::IBV_QPT_RAW_PACKET as u32);

        if let Some(query) = context_op!(ctx, query_device_ex) {
            // Safety: plain C struct, filled in by the call.
            let mut ex: ibv_device_attr_ex = unsafe { mem::zeroed() };
            check(unsafe { query(ctx, ptr::null(), &mut ex, size_of::<ibv_device_attr_ex>()) })?;
            attr.max_cqe = ex.orig_attr.max_cqe.max(0) as u32;
            attr.max_qp_wr = ex.orig_attr.max_qp_wr.max(0) as u32;
            let pacing = ex.packet_pacing_caps;
            if pacing.qp_rate_limit_max > 0 {
                attr.packet_pacing = Some(PacketPacingCaps {
                    qp_rate_limit_min: pacing.qp_rate_limit_min,
                    qp_rate_limit_max: pacing.qp_rate_limit_max,
                    raw_packet_qp: pacing.supported_qpts & raw_packet != 0,
                });
            }
        } else {
            // Safety: as above.
            let mut basic: ibv_device_attr = unsafe { mem::zeroed() };
            check(unsafe { ibv_query_device(ctx, &mut basic) })?;
            attr.max_cqe = basic.max_cqe.max(0) as u32;
            attr.max_qp_wr = basic.max_qp_wr.max(0) as u32;
        }

        // Safety: `ctx` and its device are live.
        if unsafe { mlx5dv_is_supported((*ctx).device) } {
            let mut dv = mlx5dv_context::with_mask(MLX5DV_CONTEXT_MASK_STRIDING_RQ);
            // Safety: `dv` has room for every field the mask selects.
            let ok = unsafe { mlx5dv_query_device(ctx, &mut dv) } == 0;
            let caps = dv.striding_rq_caps;
            if ok
                && dv.comp_mask & MLX5DV_CONTEXT_MASK_STRIDING_RQ != 0
                && caps.supported_qpts & raw_packet != 0
            {
                let log = |v: u32| v.min(u32::from(u8::MAX)) as u8;
                attr.striding_rq = Some(StridingRqCaps {
                    min_single_stride_log_num_of_bytes: log(
                        caps.min_single_stride_log_num_of_bytes,
                    ),
                    max_single_stride_log_num_of_bytes: log(
                        caps.max_single_stride_log_num_of_bytes,
                    ),
                    min_single_wqe_log_num_of_strides: log(caps.min_single_wqe_log_num_of_strides),
                    max_single_wqe_log_num_of_strides: log(caps.max_single_wqe_log_num_of_strides),
                });
            }
        }
        Ok(attr)
    }

    fn open_device(&self, addr: Ipv4Addr) -> io::Result<RawObject> {
        // A separate context needs a separate device open; the connection
        // manager shares one per device.
        let channel = self.create_event_channel()?;
        let opened = self.create_id(channel).and_then(|id| {
            let ctx = self.bind_addr(id, addr).and_then(|_| {
                let shared = Self::context_of_id(id)?;
                // Safety: `shared` and its device are live.
                object(unsafe { ibv_open_device((*shared).device) })
            });
            let _ = self.destroy_id(id);
            ctx
        });
        let _ = self.destroy_event_channel(channel);
        opened
    }

    fn close_device(&self, ctx: RawObject) -> io::Result<()> {
        // Safety: `ctx` was opened by `open_device` and has no dependents.
        check(unsafe { ibv_close_device(ptr_of::<ibv_context>(ctx)) })
    }

    fn alloc_pd(&self, id: RawObject) -> io::Result<RawObject> {
        let ctx = Self::context_of_id(id)?;
        // Safety: `ctx` is live.
        object(unsafe { ibv_alloc_pd(ctx) })
    }

    fn dealloc_pd(&self, pd: RawObject) -> io::Result<()> {
        // Safety: `pd` is live.
        check(unsafe { ibv_dealloc_pd(ptr_of::<ibv_pd>(pd)) })
    }

    unsafe fn reg_mr(
        &self,
        pd: RawObject,
        addr: *const u8,
        len: usize,
        access: Access,
    ) -> io::Result<(RawObject, u32)> {
        let flags = if access.contains(Access::LOCAL_WRITE) {
            IBV_ACCESS_LOCAL_WRITE
        } else {
            0
        };
        // Safety: the caller keeps the range mapped until deregistration.
        let mr = unsafe { ibv_reg_mr(ptr_of::<ibv_pd>(pd), addr.cast_mut().cast(), len, flags) };
        let raw = object(mr)?;
        // Safety: `mr` is a fresh registration.
        Ok((raw, unsafe { (*mr).lkey }))
    }

    fn dereg_mr(&self, mr: RawObject) -> io::Result<()> {
        // Safety: `mr` is live.
        check(unsafe { ibv_dereg_mr(ptr_of::<ibv_mr>(mr)) })
    }

    fn create_comp_channel(&self, id: RawObject) -> io::Result<RawObject> {
        let ctx = Self::context_of_id(id)?;
        // Safety: `ctx` is live.
        let channel = unsafe { ibv_create_comp_channel(ctx) };
        let raw = object(channel)?;
        // Safety: `channel` is live; its descriptor is switched to
        // non-blocking so `get_cq_event` can return empty-handed.
        let nonblocking = unsafe {
            let fd = (*channel).fd;
            let flags = libc::fcntl(fd, libc::F_GETFL);
            flags >= 0 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == 0
        };
        if !nonblocking {
            let err = io::Error::last_os_error();
            // Safety: nothing references the channel yet.
            unsafe { ibv_destroy_comp_channel(channel) };
            return Err(err);
        }
        Ok(raw)
    }

    fn destroy_comp_channel(&self, channel: RawObject) -> io::Result<()> {
        // Safety: `channel` is live and no queue uses it.
        check(unsafe { ibv_destroy_comp_channel(ptr_of::<ibv_comp_channel>(channel)) })
    }

    fn comp_channel_fd(&self, channel: RawObject) -> RawFd {
        // Safety: `channel` is live.
        unsafe { (*ptr_of::<ibv_comp_channel>(channel)).fd }
    }

    fn get_cq_event(&self, channel: RawObject) -> io::Result<Option<RawObject>> {
        let mut cq: *mut ibv_cq = ptr::null_mut();
        let mut cq_context: *mut c_void = ptr::null_mut();
        // Safety: `channel` is live and its descriptor non-blocking.
        let ret = unsafe {
            ibv_get_cq_event(
                ptr_of::<ibv_comp_channel>(channel),
                &mut cq,
                &mut cq_context,
            )
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }
        object(cq).map(Some)
    }

    fn create_cq(
        &self,
        id: RawObject,
        cqe: u32,
        channel: Option<RawObject>,
        comp_vector: u32,
    ) -> io::Result<RawObject> {
        let ctx = Self::context_of_id(id)?;
        let channel = channel.map_or(ptr::null_mut(), ptr_of::<ibv_comp_channel>);
        let (cq, extended) = match context_op!(ctx, create_cq_ex) {
            Some(create) => {
                // Safety: plain C struct.
                let mut attr: ibv_cq_init_attr_ex = unsafe { mem::zeroed() };
                attr.cqe = cqe;
                attr.channel = channel;
                attr.comp_vector = comp_vector;
                attr.wc_flags = IBV_WC_EX_WITH_BYTE_LEN;
                // Safety: `ctx` and `channel` are live.
                (unsafe { create(ctx, &mut attr) }.cast::<ibv_cq>(), true)
            }
            None => {
                // Safety: as above.
                let cq = unsafe {
                    ibv_create_cq(
                        ctx,
                        cqe as c_int,
                        ptr::null_mut(),
                        channel,
                        comp_vector as c_int,
                    )
                };
                (cq, false)
            }
        };
        let raw = object(cq)?;
        self.cqs.borrow_mut().insert(
            raw.get(),
            CqInfo {
                extended,
                striding: None,
            },
        );
        Ok(raw)
    }

    fn destroy_cq(&self, cq: RawObject) -> io::Result<()> {
        // Safety: `cq` is live and no queue uses it.
        check(unsafe { ibv_destroy_cq(ptr_of::<ibv_cq>(cq)) })?;
        self.cqs.borrow_mut().remove(&cq.get());
        Ok(())
    }

    fn poll_cq(&self, cq: RawObject, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        let raw_cq = ptr_of::<ibv_cq>(cq);
        // Safety: plain C structs.
        let mut batch: [ibv_wc; POLL_BATCH] = unsafe { mem::zeroed() };
        let want = wc.len().min(POLL_BATCH);
        // Safety: `raw_cq` is live.
        let poll = unsafe { (*(*raw_cq).context).ops.poll_cq }.ok_or_else(unsupported)?;
        let n = unsafe { poll(raw_cq, want as c_int, batch.as_mut_ptr()) };
        if n < 0 {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        let n = n as usize;
        let mut cqs = self.cqs.borrow_mut();
        let mut striding = cqs.get_mut(&cq.get()).and_then(|i| i.striding.as_mut());
        for (out, entry) in wc.iter_mut().zip(&batch[..n]) {
            *out = completion(
                entry.wr_id,
                entry.status as u32,
                || entry.byte_len,
                striding.as_deref_mut(),
            );
        }
        Ok(n)
    }

    fn req_notify_cq(&self, cq: RawObject, solicited_only: bool) -> io::Result<()> {
        let raw_cq = ptr_of::<ibv_cq>(cq);
        // Safety: `raw_cq` is live.
        let notify = unsafe { (*(*raw_cq).context).ops.req_notify_cq }.ok_or_else(unsupported)?;
        check(unsafe { notify(raw_cq, c_int::from(solicited_only)) })
    }

    fn ack_cq_events(&self, cq: RawObject, count: u32) {
        // Safety: `cq` is live.
        unsafe { ibv_ack_cq_events(ptr_of::<ibv_cq>(cq), count) };
    }

    fn start_poll(&self, cq: RawObject) -> io::Result<Option<WorkCompletion>> {
        if !self.cqs.borrow().get(&cq.get()).is_some_and(|i| i.extended) {
            return Err(unsupported());
        }
        let cq_ex = ptr_of::<ibv_cq_ex>(cq);
        // Safety: `cq_ex` is a live extended queue.
        let start = unsafe { (*cq_ex).start_poll }.ok_or_else(unsupported)?;
        // Safety: plain C struct.
        let mut attr: ibv_poll_cq_attr = unsafe { mem::zeroed() };
        let ret = unsafe { start(cq_ex, &mut attr) };
        self.poll_next_ex(cq, ret)
    }

    fn next_poll(&self, cq: RawObject) -> io::Result<Option<WorkCompletion>> {
        let cq_ex = ptr_of::<ibv_cq_ex>(cq);
        // Safety: a session opened by `start_poll` is in progress.
        let next = unsafe { (*cq_ex).next_poll }.ok_or_else(unsupported)?;
        let ret = unsafe { next(cq_ex) };
        self.poll_next_ex(cq, ret)
    }

    fn end_poll(&self, cq: RawObject) {
        let cq_ex = ptr_of::<ibv_cq_ex>(cq);
        // Safety: as above.
        if let Some(end) = unsafe { (*cq_ex).end_poll } {
            unsafe { end(cq_ex) };
        }
    }

    fn create_qp(&self, pd: RawObject, attr: &QpInitAttr) -> io::Result<RawObject> {
        // Safety: plain C struct.
        let mut init: ibv_qp_init_attr = unsafe { mem::zeroed() };
        init.send_cq = ptr_of::<ibv_cq>(attr.send_cq);
        init.recv_cq = ptr_of::<ibv_cq>(attr.recv_cq);
        init.cap.max_send_wr = attr.caps.max_send_wr;
        init.cap.max_recv_wr = attr.caps.max_recv_wr;
        init.cap.max_send_sge = attr.caps.max_send_sge;
        init.cap.max_recv_sge = attr.caps.max_recv_sge;
        init.qp_type = ibv_qp_type::IBV_QPT_RAW_PACKET;
        // Safety: `pd` and both queues are live.
        object(unsafe { ibv_create_qp(ptr_of::<ibv_pd>(pd), &mut init) })
    }

    fn create_hash_qp(&self, id: RawObject, attr: &HashQpInitAttr) -> io::Result<RawObject> {
        let ctx = Self::context_of_id(id)?;
        let create = context_op!(ctx, create_qp_ex).ok_or_else(unsupported)?;
        let mut key = attr.hash_key;
        // Safety: plain C struct.
        let mut init: ibv_qp_init_attr_ex = unsafe { mem::zeroed() };
        init.qp_type = ibv_qp_type::IBV_QPT_RAW_PACKET;
        init.comp_mask = IBV_QP_INIT_ATTR_PD | IBV_QP_INIT_ATTR_IND_TABLE | IBV_QP_INIT_ATTR_RX_HASH;
        init.pd = ptr_of::<ibv_pd>(attr.pd);
        init.rwq_ind_tbl = ptr_of::<ibv_rwq_ind_table>(attr.ind_table);
        init.rx_hash_conf.rx_hash_function = IBV_RX_HASH_FUNC_TOEPLITZ;
        init.rx_hash_conf.rx_hash_key_len = key.len() as u8;
        init.rx_hash_conf.rx_hash_key = key.as_mut_ptr();
        init.rx_hash_conf.rx_hash_fields_mask = 0;
        // Safety: every referenced object is live; `key` outlives the call.
        object(unsafe { create(ctx, &mut init) })
    }

    fn destroy_qp(&self, qp: RawObject) -> io::Result<()> {
        // Safety: `qp` is live and has no flows.
        check(unsafe { ibv_destroy_qp(ptr_of::<ibv_qp>(qp)) })
    }

    fn modify_qp(&self, qp: RawObject, state: QpState, port_num: Option<u8>) -> io::Result<()> {
        // Safety: plain C struct.
        let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qp_state = match state {
            QpState::Reset => ibv_qp_state::IBV_QPS_RESET,
            QpState::Init => ibv_qp_state::IBV_QPS_INIT,
            QpState::ReadyToReceive => ibv_qp_state::IBV_QPS_RTR,
            QpState::ReadyToSend => ibv_qp_state::IBV_QPS_RTS,
            QpState::Error => ibv_qp_state::IBV_QPS_ERR,
        };
        let mut mask = IBV_QP_STATE;
        if let Some(port) = port_num {
            attr.port_num = port;
            mask |= IBV_QP_PORT;
        }
        // Safety: `qp` is live.
        check(unsafe { ibv_modify_qp(ptr_of::<ibv_qp>(qp), &mut attr, mask) })
    }

    fn modify_qp_rate_limit(&self, qp: RawObject, limit: &RateLimit) -> io::Result<()> {
        let raw_qp = ptr_of::<ibv_qp>(qp);
        // Safety: `raw_qp` is live.
        let ctx = unsafe { (*raw_qp).context };
        let modify = context_op!(ctx, modify_qp_rate_limit).ok_or_else(unsupported)?;
        // Safety: plain C struct.
        let mut attr: ibv_qp_rate_limit_attr = unsafe { mem::zeroed() };
        attr.rate_limit = limit.rate_limit;
        attr.typical_pkt_sz = limit.typical_pkt_sz;
        attr.max_burst_sz = limit.max_burst_sz;
        check(unsafe { modify(raw_qp, &mut attr) })
    }

    fn post_send(&self, qp: RawObject, chain: &[SendWr]) -> io::Result<()> {
        if chain.is_empty() {
            return Ok(());
        }
        let mut wrs = self.send_wrs.borrow_mut();
        wrs.clear();
        for wr in chain {
            // Safety: plain C struct.
            let mut raw: ibv_send_wr = unsafe { mem::zeroed() };
            raw.wr_id = wr.wr_id;
            // `Sge` shares `ibv_sge`'s layout; the device only reads it.
            raw.sg_list = wr.sg_list.as_ptr().cast_mut().cast::<ibv_sge>();
            raw.num_sge = wr.num_sge as c_int;
            raw.opcode = ibv_wr_opcode::IBV_WR_SEND;
            raw.send_flags = if wr.signaled { IBV_SEND_SIGNALED } else { 0 };
            wrs.push(raw);
        }
        let n = wrs.len();
        let base = wrs.as_mut_ptr();
        for i in 0..n - 1 {
            // Safety: both indices are in bounds.
            unsafe { (*base.add(i)).next = base.add(i + 1) };
        }
        let raw_qp = ptr_of::<ibv_qp>(qp);
        // Safety: `raw_qp` is live; the chain and its lists outlive the call.
        let post = unsafe { (*(*raw_qp).context).ops.post_send }.ok_or_else(unsupported)?;
        let mut bad = ptr::null_mut();
        check(unsafe { post(raw_qp, base, &mut bad) })
    }

    fn post_recv(&self, qp: RawObject, wr: &RecvWr) -> io::Result<()> {
        let mut sge = wr.sge;
        // Safety: plain C struct.
        let mut raw: ibv_recv_wr = unsafe { mem::zeroed() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = (&mut sge as *mut super::Sge).cast::<ibv_sge>();
        raw.num_sge = 1;
        let raw_qp = ptr_of::<ibv_qp>(qp);
        // Safety: `raw_qp` is live; `raw` and `sge` outlive the call.
        let post = unsafe { (*(*raw_qp).context).ops.post_recv }.ok_or_else(unsupported)?;
        let mut bad = ptr::null_mut();
        check(unsafe { post(raw_qp, &mut raw, &mut bad) })
    }

    fn create_flow(&self, qp: RawObject, spec: &FlowSpec) -> io::Result<RawObject> {
        let raw_qp = ptr_of::<ibv_qp>(qp);
        // Safety: `raw_qp` is live.
        let ctx = unsafe { (*raw_qp).context };
        let create = context_op!(ctx, ibv_create_flow).ok_or_else(unsupported)?;
        let mut rule = FlowRule::new(spec);
        // Safety: the attribute header is the rule's first field and the
        // specs follow it as declared in its size.
        let attr = ptr::addr_of_mut!(rule).cast::<ibv_flow_attr>();
        object(unsafe { create(raw_qp, attr) })
    }

    fn destroy_flow(&self, flow: RawObject) -> io::Result<()> {
        let raw = ptr_of::<ibv_flow>(flow);
        // Safety: `raw` is live.
        let ctx = unsafe { (*raw).context };
        let destroy = context_op!(ctx, ibv_destroy_flow).ok_or_else(unsupported)?;
        check(unsafe { destroy(raw) })
    }

    fn create_wq(&self, id: RawObject, attr: &WqInitAttr) -> io::Result<RawObject> {
        let ctx = Self::context_of_id(id)?;
        // Safety: plain C struct.
        let mut init: ibv_wq_init_attr = unsafe { mem::zeroed() };
        init.wq_type = ibv_wq_type::IBV_WQT_RQ;
        init.max_wr = attr.max_wr;
        init.max_sge = 1;
        init.pd = ptr_of::<ibv_pd>(attr.pd);
        init.cq = ptr_of::<ibv_cq>(attr.cq);
        let mut dv = mlx5dv_wq_init_attr {
            comp_mask: MLX5DV_WQ_INIT_ATTR_MASK_STRIDING_RQ,
            striding_rq_attrs: mlx5dv_striding_rq_init_attr {
                single_stride_log_num_of_bytes: u32::from(
                    attr.striding.single_stride_log_num_of_bytes,
                ),
                single_wqe_log_num_of_strides: u32::from(
                    attr.striding.single_wqe_log_num_of_strides,
                ),
                two_byte_shift_en: 0,
            },
        };
        // Safety: `ctx`, the domain and the queue are live.
        let wq = object(unsafe { mlx5dv_create_wq(ctx, &mut init, &mut dv) })?;
        if let Some(info) = self.cqs.borrow_mut().get_mut(&attr.cq.get()) {
            info.striding = Some(StrideCursor::new(
                attr.striding.single_wqe_log_num_of_strides,
            ));
        }
        Ok(wq)
    }

    fn modify_wq(&self, wq: RawObject, state: WqState) -> io::Result<()> {
        let raw = ptr_of::<ibv_wq>(wq);
        // Safety: `raw` is live.
        let ctx = unsafe { (*raw).context };
        let modify = context_op!(ctx, modify_wq).ok_or_else(unsupported)?;
        // Safety: plain C struct.
        let mut attr: ibv_wq_attr = unsafe { mem::zeroed() };
        attr.attr_mask = IBV_WQ_ATTR_STATE;
        attr.wq_state = match state {
            WqState::Reset => ibv_wq_state::IBV_WQS_RESET,
            WqState::Ready => ibv_wq_state::IBV_WQS_RDY,
        };
        check(unsafe { modify(raw, &mut attr) })
    }

    fn destroy_wq(&self, wq: RawObject) -> io::Result<()> {
        let raw = ptr_of::<ibv_wq>(wq);
        // Safety: `raw` is live and no table references it.
        let ctx = unsafe { (*raw).context };
        let destroy = context_op!(ctx, destroy_wq).ok_or_else(unsupported)?;
        check(unsafe { destroy(raw) })
    }

    fn post_wq_recv(&self, wq: RawObject, wr: &RecvWr) -> io::Result<()> {
        let raw_wq = ptr_of::<ibv_wq>(wq);
        let mut sge = wr.sge;
        // Safety: plain C struct.
        let mut raw: ibv_recv_wr = unsafe { mem::zeroed() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = (&mut sge as *mut super::Sge).cast::<ibv_sge>();
        raw.num_sge = 1;
        // Safety: `raw_wq` is live; `raw` and `sge` outlive the call.
        let post = unsafe { (*raw_wq).post_recv }.ok_or_else(unsupported)?;
        let mut bad = ptr::null_mut();
        check(unsafe { post(raw_wq, &mut raw, &mut bad) })
    }

    fn create_rwq_ind_table(&self, id: RawObject, wqs: &[RawObject]) -> io::Result<RawObject> {
        if !wqs.len().is_power_of_two() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let ctx = Self::context_of_id(id)?;
        let create = context_op!(ctx, create_rwq_ind_table).ok_or_else(unsupported)?;
        let mut table: Vec<*mut ibv_wq> = wqs.iter().map(|&wq| ptr_of::<ibv_wq>(wq)).collect();
        // Safety: plain C struct.
        let mut init: ibv_rwq_ind_table_init_attr = unsafe { mem::zeroed() };
        init.log_ind_tbl_size = wqs.len().trailing_zeros();
        init.ind_tbl = table.as_mut_ptr();
        // Safety: every queue is live; `table` outlives the call.
        object(unsafe { create(ctx, &mut init) })
    }

    fn destroy_rwq_ind_table(&self, table: RawObject) -> io::Result<()> {
        let raw = ptr_of::<ibv_rwq_ind_table>(table);
        // Safety: `raw` is live and no queue pair uses it.
        let ctx = unsafe { (*raw).context };
        let destroy = context_op!(ctx, destroy_rwq_ind_table).ok_or_else(unsupported)?;
        check(unsafe { destroy(raw) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ETHERTYPE_IPV4, multicast_mac};

    fn byte_cnt(len: u32, strides: u32, filler: bool) -> u32 {
        len | (strides << MPRQ_STRIDE_NUM_SHIFT) | if filler { MPRQ_FILLER_MASK } else { 0 }
    }

    #[test]
    fn stride_index_follows_the_fill_order() {
        let mut cursor = StrideCursor::new(4);
        let mut seen = Vec::new();
        for (len, strides, filler) in [(100, 2, false), (1000, 13, false), (0, 1, true)] {
            let wc = completion(
                0,
                ibv_wc_status::IBV_WC_SUCCESS as u32,
                || byte_cnt(len, strides, filler),
                Some(&mut cursor),
            );
            seen.push((wc.stride_index, wc.strides, wc.byte_len, wc.filler));
        }
        assert_eq!(
            seen,
            vec![(0, 2, 100, false), (2, 13, 1000, false), (15, 1, 0, true)]
        );
        // The filler closed the entry: the next one starts over.
        let wc = completion(
            0,
            ibv_wc_status::IBV_WC_SUCCESS as u32,
            || byte_cnt(64, 1, false),
            Some(&mut cursor),
        );
        assert_eq!(wc.stride_index, 0);
    }

    #[test]
    fn failed_completions_leave_the_cursor_alone() {
        let mut cursor = StrideCursor::new(4);
        let wc = completion(7, 5, || panic!("byte count read"), Some(&mut cursor));
        assert_eq!(wc.status, WcStatus::Failed(5));
        assert_eq!(wc.wr_id, 7);
        assert_eq!(wc.strides, 0);
        assert_eq!(cursor.used, 0);
    }

    #[test]
    fn plain_queues_report_the_raw_length() {
        let wc = completion(
            3,
            ibv_wc_status::IBV_WC_SUCCESS as u32,
            || 0x8001_0040,
            None,
        );
        assert_eq!(wc.byte_len, 0x8001_0040);
        assert!(!wc.filler);
    }

    #[test]
    fn flow_rule_is_packed_in_kernel_order() {
        let group = Ipv4Addr::new(239, 1, 2, 3);
        let spec = FlowSpec {
            port_num: 1,
            dst_mac: multicast_mac(group),
            ether_type: ETHERTYPE_IPV4,
            dst_ip: Some(group),
            udp_dst_port: 7148,
        };
        let rule = FlowRule::new(&spec);
        let header = size_of::<ibv_flow_attr>();
        let eth = size_of::<ibv_flow_spec_eth>();
        let ip = size_of::<ibv_flow_spec_ipv4>();
        let udp = size_of::<ibv_flow_spec_tcp_udp>();
        assert_eq!(size_of::<FlowRule>(), header + eth + ip + udp);
        let attr = rule.attr;
        assert_eq!(usize::from(attr.size), size_of::<FlowRule>());
        assert_eq!(attr.num_of_specs, 3);
        let (ip_val, udp_val) = (rule.ip.val, rule.udp.val);
        assert_eq!(u32::from_be(ip_val.dst_ip), u32::from(group));
        assert_eq!(u16::from_be(udp_val.dst_port), 7148);
    }

    #[test]
    fn wildcard_address_leaves_ip_unmasked() {
        let spec = FlowSpec {
            port_num: 1,
            dst_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            ether_type: ETHERTYPE_IPV4,
            dst_ip: None,
            udp_dst_port: 9000,
        };
        let rule = FlowRule::new(&spec);
        let mask = rule.ip.mask;
        assert_eq!({ mask.dst_ip }, 0);
    }

    #[test]
    fn interface_mac_lookup() {
        assert!(interface_mac(Ipv4Addr::LOCALHOST).is_ok());
        let err = interface_mac(Ipv4Addr::new(192, 0, 2, 123)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRNOTAVAIL));
    }
}
