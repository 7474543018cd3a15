//! Zero-copy send path.
//!
//! A [`UdpIbvWriter`] pulls packets from a [`PacketSource`], frames them into
//! a ring of slots and posts them as chained work requests. Accounting flows
//! back to the [`SendItem`] each packet belongs to as completions are reaped.

use std::cell::Cell;
use std::io;
use std::rc::Rc;

use bytes::Bytes;

pub mod queue;
pub(crate) mod rate;
pub(crate) mod region;
pub(crate) mod slot;
pub mod writer;

pub use queue::HeapQueue;
pub use writer::UdpIbvWriter;

/// What a [`PacketSource`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketResult {
    /// A packet was written to the output.
    Success,
    /// Nothing queued. The writer waits for new packets.
    Empty,
    /// Packets are queued but held back by rate limiting.
    Sleep,
}

/// What the caller should do before invoking the stream again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeAction {
    /// Call again straight away.
    Immediate,
    /// Wait for the completion channel to become readable.
    CompletionEvent,
    /// Wait until more packets are queued.
    NewPackets,
    /// Wait out the rate limiter.
    Sleep,
    /// The stream has finished; do not call again.
    Stopped,
}

/// Outcome of a queued item, as seen by its submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Incomplete,
    Sent,
    /// Failed with the given OS error code.
    Failed(i32),
}

/// Per-item accounting shared between the queue and the writer.
#[derive(Debug)]
pub struct SendItem {
    substream: usize,
    bytes_sent: Cell<usize>,
    error: Cell<Option<i32>>,
    done: Cell<bool>,
}

impl SendItem {
    pub fn new(substream: usize) -> Rc<Self> {
        Rc::new(SendItem {
            substream,
            bytes_sent: Cell::new(0),
            error: Cell::new(None),
            done: Cell::new(false),
        })
    }

    pub fn substream(&self) -> usize {
        self.substream
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.get()
    }

    pub fn error(&self) -> Option<io::Error> {
        self.error.get().map(io::Error::from_raw_os_error)
    }

    pub fn status(&self) -> ItemStatus {
        if !self.done.get() {
            return ItemStatus::Incomplete;
        }
        match self.error.get() {
            Some(code) => ItemStatus::Failed(code),
            None => ItemStatus::Sent,
        }
    }

    pub(crate) fn add_bytes(&self, n: usize) {
        self.bytes_sent.set(self.bytes_sent.get() + n);
    }

    /// Record `errno` unless an error is already recorded.
    pub(crate) fn fail(&self, errno: i32) {
        if self.error.get().is_none() {
            self.error.set(Some(errno));
        }
    }

    pub(crate) fn finish(&self) {
        self.done.set(true);
    }
}

/// One outbound packet: payload fragments and the item it belongs to.
///
/// Fragments are cheap `Bytes` handles. A fragment referenced in place by
/// the device is kept alive by its slot until the completion is reaped.
#[derive(Debug, Default)]
pub struct TransmitPacket {
    pub buffers: Vec<Bytes>,
    pub item: Option<Rc<SendItem>>,
    /// Final packet of its heap.
    pub last: bool,
}

impl TransmitPacket {
    pub fn size(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.item = None;
        self.last = false;
    }

    /// Destination index, taken from the owning item.
    pub fn substream(&self) -> usize {
        self.item.as_ref().map_or(0, |item| item.substream())
    }
}

/// Supplies packets to a writer and hears back about finished heaps.
pub trait PacketSource {
    fn next_packet(&mut self, out: &mut TransmitPacket) -> PacketResult;

    /// `n` heaps had their last packet completed since the previous report.
    fn heaps_completed(&mut self, n: usize);
}
