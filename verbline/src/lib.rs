//! verbline — kernel-bypass UDP over verbs queue pairs.
//!
//! Two stream types move UDP datagrams between user memory and a
//! verbs-capable adapter without the kernel network stack:
//!
//! - [`UdpIbvWriter`] frames packets into a ring of pre-registered slots and
//!   posts them as chained raw-packet sends. Payloads already living in
//!   registered memory are sent in place.
//! - [`MprqReader`] receives into a striding multi-packet receive queue fed
//!   by flow steering rules, handing payloads to a [`PacketSink`].
//!
//! Neither stream blocks. Every call returns a [`WakeAction`] telling the
//! caller what to wait for; [`Driver`] is a minimal io_uring based caller.
//!
//! All device access goes through the [`verbs::Provider`] trait. With the
//! `rdma` feature, `verbs::IbvDevice` drives real adapters; the default
//! `sim` feature provides an in-memory device for tests and demos.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::net::{IpAddr, SocketAddr};
//! use std::rc::Rc;
//!
//! use bytes::Bytes;
//! use verbline::verbs::Provider;
//! use verbline::{Driver, HeapQueue, SendConfigBuilder, UdpIbvWriter};
//!
//! fn send_hello<P: Provider>(device: Rc<P>, interface: IpAddr) -> Result<(), verbline::Error> {
//!     let group: SocketAddr = "239.1.2.3:7148".parse().unwrap();
//!     let config = SendConfigBuilder::new()
//!         .endpoint(group)
//!         .interface_address(interface)
//!         .build()?;
//!     let mut writer = UdpIbvWriter::new(device, &config, verbline::observer::tracing())?;
//!     let mut queue = HeapQueue::new(writer.max_packet_size());
//!     queue.enqueue(vec![vec![Bytes::from_static(b"hello")]], 0)?;
//!     Driver::new(8)?.flush(&mut writer, &mut queue)
//! }
//! ```
//!
//! On hardware, pass `Rc::new(verbs::IbvDevice::new())` and the address of
//! the adapter's interface.


// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod memory;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod counter;
pub mod driver;
pub mod error;
pub mod flow;
pub mod frame;
pub mod metrics;
pub mod observer;
pub mod recv;
pub mod resource;
pub mod send;
pub mod verbs;

// ── Re-exports ──────────────────────────────────────────────────────────

pub use config::{
    Destination, MemoryRange, RecvConfig, RecvConfigBuilder, SendConfig, SendConfigBuilder,
};
pub use counter::set_thread_shard;
pub use driver::Driver;
pub use error::{Error, FrameError, Result};
pub use observer::{Level, Observer, TracingObserver};
pub use recv::{MprqReader, PacketSink, PollResult, StridingLayout};
pub use send::{
    HeapQueue, ItemStatus, PacketResult, PacketSource, SendItem, TransmitPacket, UdpIbvWriter,
    WakeAction,
};
