//! Sharded counters for hot-path statistics.
//!
//! Send and receive loops run on dedicated threads, one stream per thread.
//! Each [`CounterGroup`] packs up to 16 counters into one cache line per
//! shard, and every thread writes only to its own shard. Bursts of updates
//! inside a poll loop are folded into a [`Tally`] and published once.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const CACHE_LINE: usize = 128;
const SLOTS: usize = CACHE_LINE / 8;
const NUM_SHARDS: usize = 32;

thread_local! {
    static SHARD: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pin the calling thread to a shard. Stream threads call this once with
/// their stream index so two streams never share a line.
pub fn set_thread_shard(id: usize) {
    SHARD.set(Some(id % NUM_SHARDS));
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to 16 counters.
pub struct CounterGroup {
    shards: [Shard; NUM_SHARDS],
}

impl CounterGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const SHARD_INIT: Shard = Shard {
            slots: [ZERO; SLOTS],
        };
        Self {
            shards: [SHARD_INIT; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn sum(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// A counter backed by one slot of a [`CounterGroup`], exported through
/// metriken.
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Self { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        if value != 0 {
            self.group.add(self.slot, value);
        }
    }

    pub fn value(&self) -> u64 {
        self.group.sum(self.slot)
    }

    /// Start a local tally that is published to this counter on drop.
    pub fn tally(&'static self) -> Tally {
        Tally {
            counter: self,
            pending: 0,
        }
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(self.group.sum(self.slot)))
    }
}

/// Unsynchronised accumulator for a [`Counter`], flushed once per burst.
pub struct Tally {
    counter: &'static Counter,
    pending: u64,
}

impl Tally {
    #[inline]
    pub fn add(&mut self, value: u64) {
        self.pending += value;
    }

    #[inline]
    pub fn increment(&mut self) {
        self.pending += 1;
    }
}

impl Drop for Tally {
    fn drop(&mut self) {
        self.counter.add(self.pending);
    }
}

#[inline]
fn shard_index() -> usize {
    SHARD.get().unwrap_or_else(|| {
        thread_local! {
            static ANCHOR: u8 = const { 0 };
        }
        ANCHOR.with(|x| x as *const u8 as usize / CACHE_LINE) % NUM_SHARDS
    })
}
