//! Owning handles over verbs objects.
//!
//! Every handle holds its provider and raw id and releases the object on
//! drop. Handles are built from borrowed dependencies; the type system does
//! not tie their lifetimes together, so owners declare handle fields in
//! dependency order (dependents first) and rely on declaration-order drop.

use std::cell::Cell;
use std::fmt;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::flow::FlowSpec;
use crate::verbs::{
    Access, BoundPort, DeviceAttr, HashQpInitAttr, Provider, QpInitAttr, QpState, RateLimit,
    RawObject, RecvWr, SendWr, WorkCompletion, WqInitAttr, WqState,
};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $destroy:ident) => {
        $(#[$meta])*
        pub struct $name<P: Provider> {
            provider: Rc<P>,
            raw: RawObject,
        }

        impl<P: Provider> $name<P> {
            #[inline]
            pub fn raw(&self) -> RawObject {
                self.raw
            }
        }

        impl<P: Provider> Drop for $name<P> {
            fn drop(&mut self) {
                let _ = self.provider.$destroy(self.raw);
            }
        }

        impl<P: Provider> fmt::Debug for $name<P> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.raw).finish()
            }
        }
    };
}

handle!(
    /// Connection-manager event channel.
    EventChannel,
    destroy_event_channel
);
handle!(
    /// Device context opened directly on an interface.
    DeviceContext,
    close_device
);
handle!(ProtectionDomain, dealloc_pd);
handle!(CompletionChannel, destroy_comp_channel);
handle!(CompletionQueue, destroy_cq);
handle!(
    /// Flow steering rule attached to a queue pair.
    Flow,
    destroy_flow
);
handle!(WorkQueue, destroy_wq);
handle!(
    /// Receive work queue indirection table.
    RwqIndTable,
    destroy_rwq_ind_table
);

impl<P: Provider> EventChannel<P> {
    pub fn new(provider: Rc<P>) -> Result<Self> {
        let raw = provider
            .create_event_channel()
            .map_err(Error::device("rdma_create_event_channel"))?;
        Ok(EventChannel { provider, raw })
    }

    pub fn provider(&self) -> &Rc<P> {
        &self.provider
    }
}

impl<P: Provider> DeviceContext<P> {
    /// Open the device that owns `addr`. Holding the context is what keeps
    /// multicast loopback enabled for the process.
    pub fn open(provider: Rc<P>, addr: Ipv4Addr) -> Result<Self> {
        let raw = provider
            .open_device(addr)
            .map_err(Error::device("ibv_open_device"))?;
        Ok(DeviceContext { provider, raw })
    }
}

/// Connection identifier, bound to a local interface.
pub struct CmId<P: Provider> {
    provider: Rc<P>,
    raw: RawObject,
    port: Option<BoundPort>,
}

impl<P: Provider> CmId<P> {
    pub fn new(channel: &EventChannel<P>) -> Result<Self> {
        let provider = Rc::clone(&channel.provider);
        let raw = provider
            .create_id(channel.raw)
            .map_err(Error::device("rdma_create_id"))?;
        Ok(CmId {
            provider,
            raw,
            port: None,
        })
    }

    pub fn bind_addr(&mut self, addr: Ipv4Addr) -> Result<()> {
        let port = self
            .provider
            .bind_addr(self.raw, addr)
            .map_err(Error::device("rdma_bind_addr"))?;
        self.port = Some(port);
        Ok(())
    }

    /// Port the id was bound to, once [`CmId::bind_addr`] succeeded.
    pub fn port(&self) -> Option<BoundPort> {
        self.port
    }

    pub fn query_device(&self) -> Result<DeviceAttr> {
        self.provider
            .query_device(self.raw)
            .map_err(Error::device("ibv_query_device_ex"))
    }

    pub fn raw(&self) -> RawObject {
        self.raw
    }

    pub fn provider(&self) -> &Rc<P> {
        &self.provider
    }
}

impl<P: Provider> Drop for CmId<P> {
    fn drop(&mut self) {
        let _ = self.provider.destroy_id(self.raw);
    }
}

impl<P: Provider> ProtectionDomain<P> {
    pub fn new(id: &CmId<P>) -> Result<Self> {
        let provider = Rc::clone(&id.provider);
        let raw = provider
            .alloc_pd(id.raw)
            .map_err(Error::device("ibv_alloc_pd"))?;
        Ok(ProtectionDomain { provider, raw })
    }
}

impl<P: Provider> CompletionChannel<P> {
    pub fn new(id: &CmId<P>) -> Result<Self> {
        let provider = Rc::clone(&id.provider);
        let raw = provider
            .create_comp_channel(id.raw)
            .map_err(Error::device("ibv_create_comp_channel"))?;
        Ok(CompletionChannel { provider, raw })
    }

    /// Descriptor that becomes readable when an armed CQ fires.
    pub fn fd(&self) -> RawFd {
        self.provider.comp_channel_fd(self.raw)
    }

    /// Non-blocking: the CQ an event fired for, if one is pending.
    pub fn get_event(&self) -> Result<Option<RawObject>> {
        self.provider
            .get_cq_event(self.raw)
            .map_err(Error::device("ibv_get_cq_event"))
    }
}

impl<P: Provider> CompletionQueue<P> {
    pub fn new(
        id: &CmId<P>,
        cqe: u32,
        channel: Option<&CompletionChannel<P>>,
        comp_vector: u32,
    ) -> Result<Self> {
        let provider = Rc::clone(&id.provider);
        let raw = provider
            .create_cq(id.raw, cqe, channel.map(|c| c.raw), comp_vector)
            .map_err(Error::device("ibv_create_cq"))?;
        Ok(CompletionQueue { provider, raw })
    }

    #[inline]
    pub fn poll(&self, wc: &mut [WorkCompletion]) -> Result<usize> {
        self.provider
            .poll_cq(self.raw, wc)
            .map_err(Error::device("ibv_poll_cq"))
    }

    pub fn req_notify(&self, solicited_only: bool) -> Result<()> {
        self.provider
            .req_notify_cq(self.raw, solicited_only)
            .map_err(Error::device("ibv_req_notify_cq"))
    }

    pub fn ack_events(&self, count: u32) {
        self.provider.ack_cq_events(self.raw, count);
    }

    #[inline]
    pub fn start_poll(&self) -> Result<Option<WorkCompletion>> {
        self.provider
            .start_poll(self.raw)
            .map_err(Error::device("ibv_start_poll"))
    }

    #[inline]
    pub fn next_poll(&self) -> Result<Option<WorkCompletion>> {
        self.provider
            .next_poll(self.raw)
            .map_err(Error::device("ibv_next_poll"))
    }

    #[inline]
    pub fn end_poll(&self) {
        self.provider.end_poll(self.raw);
    }
}

/// Queue pair. Tracks its state so transitions only move forward.
pub struct QueuePair<P: Provider> {
    provider: Rc<P>,
    raw: RawObject,
    state: Cell<QpState>,
}

impl<P: Provider> QueuePair<P> {
    /// Raw packet queue pair for the send path.
    pub fn new(pd: &ProtectionDomain<P>, attr: &QpInitAttr) -> Result<Self> {
        let provider = Rc::clone(&pd.provider);
        let raw = provider
            .create_qp(pd.raw, attr)
            .map_err(Error::device("ibv_create_qp"))?;
        Ok(QueuePair {
            provider,
            raw,
            state: Cell::new(QpState::Reset),
        })
    }

    /// Receive-only queue pair hashing into an indirection table.
    pub fn new_hash(
        id: &CmId<P>,
        pd: &ProtectionDomain<P>,
        table: &RwqIndTable<P>,
    ) -> Result<Self> {
        let provider = Rc::clone(&id.provider);
        let attr = HashQpInitAttr {
            pd: pd.raw,
            ind_table: table.raw,
            hash_key: [0; 40],
        };
        let raw = provider
            .create_hash_qp(id.raw, &attr)
            .map_err(Error::device("ibv_create_qp_ex"))?;
        Ok(QueuePair {
            provider,
            raw,
            state: Cell::new(QpState::ReadyToReceive),
        })
    }

    pub fn raw(&self) -> RawObject {
        self.raw
    }

    pub fn state(&self) -> QpState {
        self.state.get()
    }

    /// Move to `state`. Only forward transitions, or a drop to the error
    /// state, are accepted.
    pub fn modify(&self, state: QpState, port_num: Option<u8>) -> Result<()> {
        let current = self.state.get();
        if state != QpState::Error && state <= current {
            return Err(Error::invalid(format!(
                "queue pair cannot move from {current:?} to {state:?}"
            )));
        }
        self.provider
            .modify_qp(self.raw, state, port_num)
            .map_err(Error::device("ibv_modify_qp"))?;
        self.state.set(state);
        Ok(())
    }

    #[inline]
    pub fn post_send(&self, chain: &[SendWr]) -> Result<()> {
        self.provider
            .post_send(self.raw, chain)
            .map_err(Error::device("ibv_post_send"))
    }

    pub fn post_recv(&self, wr: &RecvWr) -> Result<()> {
        self.provider
            .post_recv(self.raw, wr)
            .map_err(Error::device("ibv_post_recv"))
    }

    pub fn set_rate_limit(&self, limit: &RateLimit) -> Result<()> {
        self.provider
            .modify_qp_rate_limit(self.raw, limit)
            .map_err(Error::device("ibv_modify_qp_rate_limit"))
    }
}

impl<P: Provider> Drop for QueuePair<P> {
    fn drop(&mut self) {
        let _ = self.provider.destroy_qp(self.raw);
    }
}

impl<P: Provider> fmt::Debug for QueuePair<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("raw", &self.raw)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Registered memory region.
pub struct MemoryRegion<P: Provider> {
    provider: Rc<P>,
    raw: RawObject,
    addr: usize,
    len: usize,
    lkey: u32,
}

impl<P: Provider> MemoryRegion<P> {
    /// Register `len` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// The memory must stay mapped for the lifetime of the returned region.
    pub unsafe fn new(
        pd: &ProtectionDomain<P>,
        ptr: *const u8,
        len: usize,
        access: Access,
    ) -> Result<Self> {
        let provider = Rc::clone(&pd.provider);
        let (raw, lkey) = unsafe { provider.reg_mr(pd.raw, ptr, len, access) }
            .map_err(Error::device("ibv_reg_mr"))?;
        Ok(MemoryRegion {
            provider,
            raw,
            addr: ptr as usize,
            len,
            lkey,
        })
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<P: Provider> Drop for MemoryRegion<P> {
    fn drop(&mut self) {
        let _ = self.provider.dereg_mr(self.raw);
    }
}

impl<P: Provider> Flow<P> {
    pub fn new(qp: &QueuePair<P>, spec: &FlowSpec) -> Result<Self> {
        let provider = Rc::clone(&qp.provider);
        let raw = provider
            .create_flow(qp.raw, spec)
            .map_err(Error::device("ibv_create_flow"))?;
        Ok(Flow { provider, raw })
    }
}

impl<P: Provider> WorkQueue<P> {
    pub fn new(id: &CmId<P>, attr: &WqInitAttr) -> Result<Self> {
        let provider = Rc::clone(&id.provider);
        let raw = provider
            .create_wq(id.raw, attr)
            .map_err(Error::device("mlx5dv_create_wq"))?;
        Ok(WorkQueue { provider, raw })
    }

    pub fn modify(&self, state: WqState) -> Result<()> {
        self.provider
            .modify_wq(self.raw, state)
            .map_err(Error::device("ibv_modify_wq"))
    }

    #[inline]
    pub fn post_recv(&self, wr: &RecvWr) -> Result<()> {
        self.provider
            .post_wq_recv(self.raw, wr)
            .map_err(Error::device("ibv_post_wq_recv"))
    }
}

impl<P: Provider> RwqIndTable<P> {
    pub fn new(id: &CmId<P>, wqs: &[&WorkQueue<P>]) -> Result<Self> {
        let provider = Rc::clone(&id.provider);
        let raws: Vec<RawObject> = wqs.iter().map(|wq| wq.raw).collect();
        let raw = provider
            .create_rwq_ind_table(id.raw, &raws)
            .map_err(Error::device("ibv_create_rwq_ind_table"))?;
        Ok(RwqIndTable { provider, raw })
    }
}
