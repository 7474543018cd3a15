//! The verbs provider seam.
//!
//! Every device call made by the handles in [`crate::resource`] goes through
//! a [`Provider`]. Streams are generic over the provider, so the per-packet
//! paths compile down to direct calls.
//!
//! Two providers ship with the crate. With the `rdma` feature, `IbvDevice`
//! drives real adapters through libibverbs, librdmacm and libmlx5. With
//! the `sim` feature (on by default), `sim::SimDevice` implements the
//! trait in memory.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use crate::flow::FlowSpec;
use crate::frame::MacAddr;

#[cfg(feature = "rdma")]
mod ibv;
#[cfg(feature = "rdma")]
mod mlx5dv;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(feature = "rdma")]
pub use ibv::{IbvDevice, interface_mac};

/// Maximum scatter-gather entries per send work request.
pub const MAX_SGE: usize = 4;

/// Opaque reference to a provider-owned object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawObject(usize);

impl RawObject {
    pub const fn new(id: usize) -> Self {
        RawObject(id)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

/// Result of binding a connection identifier to a local address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPort {
    pub port_num: u8,
    pub mac: MacAddr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketPacingCaps {
    /// Minimum rate, kbit/s.
    pub qp_rate_limit_min: u32,
    /// Maximum rate, kbit/s. Zero means pacing is unsupported.
    pub qp_rate_limit_max: u32,
    /// Whether raw packet queue pairs can be paced.
    pub raw_packet_qp: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StridingRqCaps {
    pub min_single_stride_log_num_of_bytes: u8,
    pub max_single_stride_log_num_of_bytes: u8,
    pub min_single_wqe_log_num_of_strides: u8,
    pub max_single_wqe_log_num_of_strides: u8,
}

/// Device attributes relevant to the streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAttr {
    pub max_cqe: u32,
    pub max_qp_wr: u32,
    pub num_comp_vectors: u32,
    pub packet_pacing: Option<PacketPacingCaps>,
    pub striding_rq: Option<StridingRqCaps>,
    /// Whether the extended (start/next/end) completion polling API is
    /// available.
    pub extended_cq: bool,
}

/// Queue-pair states, in the only order a stream walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqState {
    Reset,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Attributes for a raw packet queue pair.
#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    pub send_cq: RawObject,
    pub recv_cq: RawObject,
    pub caps: QpCaps,
}

/// Attributes for a receive-side hashing queue pair over an indirection table.
#[derive(Debug, Clone, Copy)]
pub struct HashQpInitAttr {
    pub pd: RawObject,
    pub ind_table: RawObject,
    pub hash_key: [u8; 40],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridingParams {
    pub single_stride_log_num_of_bytes: u8,
    pub single_wqe_log_num_of_strides: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct WqInitAttr {
    pub pd: RawObject,
    pub cq: RawObject,
    pub max_wr: u32,
    pub striding: StridingParams,
}

/// Hardware packet pacing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// kbit/s
    pub rate_limit: u32,
    pub typical_pkt_sz: u16,
    pub max_burst_sz: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WcStatus {
    #[default]
    Success,
    /// Non-success completion with the device status code.
    Failed(u32),
}

impl WcStatus {
    #[inline]
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

/// One completion queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub byte_len: u32,
    /// Striding receive only: first stride of the frame within its entry.
    pub stride_index: u16,
    /// Striding receive only: strides consumed by this completion.
    pub strides: u16,
    /// Striding receive only: the device skipped the tail of the entry.
    pub filler: bool,
}

/// Scatter-gather element, laid out like `struct ibv_sge`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Send work request. Chains are passed as slices to [`Provider::post_send`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SendWr {
    pub wr_id: u64,
    pub sg_list: [Sge; MAX_SGE],
    pub num_sge: usize,
    pub signaled: bool,
}

impl SendWr {
    #[inline]
    pub fn sges(&self) -> &[Sge] {
        &self.sg_list[..self.num_sge]
    }

    /// Total bytes described by the scatter-gather list.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.sges().iter().map(|s| s.length as usize).sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

/// Memory-region access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access(u32);

impl Access {
    pub const LOCAL_READ: Access = Access(0);
    pub const LOCAL_WRITE: Access = Access(1);

    pub fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Device operations used by the streams.
///
/// Creation calls return the provider's object id; destroy calls take it
/// back. Callers guarantee that every id passed in is live, and that
/// dependent objects are destroyed before the objects they reference.
pub trait Provider {
    // ── Connection management ────────────────────────────────────
    fn create_event_channel(&self) -> io::Result<RawObject>;
    fn destroy_event_channel(&self, channel: RawObject) -> io::Result<()>;
    fn create_id(&self, channel: RawObject) -> io::Result<RawObject>;
    fn destroy_id(&self, id: RawObject) -> io::Result<()>;
    fn bind_addr(&self, id: RawObject, addr: Ipv4Addr) -> io::Result<BoundPort>;
    fn query_device(&self, id: RawObject) -> io::Result<DeviceAttr>;
    fn open_device(&self, addr: Ipv4Addr) -> io::Result<RawObject>;
    fn close_device(&self, ctx: RawObject) -> io::Result<()>;

    // ── Protection domains and memory ────────────────────────────
    fn alloc_pd(&self, id: RawObject) -> io::Result<RawObject>;
    fn dealloc_pd(&self, pd: RawObject) -> io::Result<()>;
    /// Register `len` bytes at `addr`. Returns the region id and local key.
    ///
    /// # Safety
    ///
    /// The range must stay mapped until [`Provider::dereg_mr`] is called.
    unsafe fn reg_mr(
        &self,
        pd: RawObject,
        addr: *const u8,
        len: usize,
        access: Access,
    ) -> io::Result<(RawObject, u32)>;
    fn dereg_mr(&self, mr: RawObject) -> io::Result<()>;

    // ── Completion ───────────────────────────────────────────────
    fn create_comp_channel(&self, id: RawObject) -> io::Result<RawObject>;
    fn destroy_comp_channel(&self, channel: RawObject) -> io::Result<()>;
    fn comp_channel_fd(&self, channel: RawObject) -> RawFd;
    /// Retrieve one pending event without blocking: the CQ it fired for.
    fn get_cq_event(&self, channel: RawObject) -> io::Result<Option<RawObject>>;
    fn create_cq(
        &self,
        id: RawObject,
        cqe: u32,
        channel: Option<RawObject>,
        comp_vector: u32,
    ) -> io::Result<RawObject>;
    fn destroy_cq(&self, cq: RawObject) -> io::Result<()>;
    fn poll_cq(&self, cq: RawObject, wc: &mut [WorkCompletion]) -> io::Result<usize>;
    fn req_notify_cq(&self, cq: RawObject, solicited_only: bool) -> io::Result<()>;
    fn ack_cq_events(&self, cq: RawObject, count: u32);
    /// Extended polling: begin a session and return the first entry.
    fn start_poll(&self, cq: RawObject) -> io::Result<Option<WorkCompletion>>;
    fn next_poll(&self, cq: RawObject) -> io::Result<Option<WorkCompletion>>;
    /// Close a session opened by a `start_poll` that returned an entry.
    fn end_poll(&self, cq: RawObject);

    // ── Queue pairs ──────────────────────────────────────────────
    fn create_qp(&self, pd: RawObject, attr: &QpInitAttr) -> io::Result<RawObject>;
    fn create_hash_qp(&self, id: RawObject, attr: &HashQpInitAttr) -> io::Result<RawObject>;
    fn destroy_qp(&self, qp: RawObject) -> io::Result<()>;
    fn modify_qp(&self, qp: RawObject, state: QpState, port_num: Option<u8>) -> io::Result<()>;
    fn modify_qp_rate_limit(&self, qp: RawObject, limit: &RateLimit) -> io::Result<()>;
    fn post_send(&self, qp: RawObject, chain: &[SendWr]) -> io::Result<()>;
    fn post_recv(&self, qp: RawObject, wr: &RecvWr) -> io::Result<()>;

    // ── Steering and striding receive ────────────────────────────
    fn create_flow(&self, qp: RawObject, spec: &FlowSpec) -> io::Result<RawObject>;
    fn destroy_flow(&self, flow: RawObject) -> io::Result<()>;
    fn create_wq(&self, id: RawObject, attr: &WqInitAttr) -> io::Result<RawObject>;
    fn modify_wq(&self, wq: RawObject, state: WqState) -> io::Result<()>;
    fn destroy_wq(&self, wq: RawObject) -> io::Result<()>;
    fn post_wq_recv(&self, wq: RawObject, wr: &RecvWr) -> io::Result<()>;
    fn create_rwq_ind_table(&self, id: RawObject, wqs: &[RawObject]) -> io::Result<RawObject>;
    fn destroy_rwq_ind_table(&self, table: RawObject) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_wr_byte_len_counts_active_sges() {
        let mut wr = SendWr::default();
        wr.sg_list[0].length = 42;
        wr.sg_list[1].length = 100;
        wr.sg_list[2].length = 999;
        wr.num_sge = 2;
        assert_eq!(wr.byte_len(), 142);
    }

    #[test]
    fn qp_states_are_ordered() {
        assert!(QpState::Reset < QpState::Init);
        assert!(QpState::Init < QpState::ReadyToReceive);
        assert!(QpState::ReadyToReceive < QpState::ReadyToSend);
    }

    #[test]
    fn access_flags() {
        assert!(Access::LOCAL_WRITE.contains(Access::LOCAL_READ));
        assert!(!Access::LOCAL_READ.contains(Access::LOCAL_WRITE));
    }
}
