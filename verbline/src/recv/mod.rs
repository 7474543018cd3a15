//! Zero-copy receive path.
//!
//! Readers hand UDP payloads to a [`PacketSink`] straight out of the
//! device-written buffer. The sink copies or decodes what it needs before
//! returning; the memory is handed back to the device afterwards.

use crate::metrics::RECV_TRUNCATED;
use crate::observer::Observer;

pub mod mprq;

pub use mprq::{MprqReader, StridingLayout};

/// Consumer of received payloads, typically a stream's packet decoder.
pub trait PacketSink {
    fn add_packet(&mut self, payload: &[u8]);

    /// Once true, readers stop delivering and report
    /// [`crate::WakeAction::Stopped`].
    fn is_stopped(&self) -> bool;
}

/// Outcome of one bounded polling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// The completion queue is empty.
    Drained,
    /// The per-pass budget ran out with completions possibly pending.
    Partial,
    /// The sink asked to stop.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Dropped,
    Accepted,
    Stopped,
}

/// Pass one payload to `sink`, dropping empty and oversized ones.
pub(crate) fn process_one_packet(
    sink: &mut impl PacketSink,
    payload: &[u8],
    max_size: usize,
    observer: &dyn Observer,
) -> Delivery {
    if payload.is_empty() {
        return Delivery::Dropped;
    }
    if payload.len() > max_size {
        // A payload at the limit may have been cut short on the wire.
        RECV_TRUNCATED.increment();
        observer.info(format_args!("dropped packet due to truncation"));
        return Delivery::Dropped;
    }
    sink.add_packet(payload);
    if sink.is_stopped() {
        observer.debug(format_args!("UDP reader: end of stream detected"));
        return Delivery::Stopped;
    }
    Delivery::Accepted
}
