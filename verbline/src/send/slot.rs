//! Send slots and scatter-gather assembly.
//!
//! Each slot owns a fixed frame in the staging buffer, a pre-built work
//! request, and the fragments the device reads in place. A slot moves
//! free -> populated -> posted -> completed and back to free when its
//! completion is reaped. Slots are taken at the tail and returned at the
//! head, so completion order matches post order.

use std::rc::Rc;

use bytes::Bytes;

use super::SendItem;
use super::region::RegionSet;
use crate::frame::HEADER_LEN;
use crate::verbs::{MAX_SGE, SendWr, Sge};

/// In-flight batches are capped at this many bytes of framed packets.
const MAX_BATCH_BYTES: usize = 262144;

/// Slot count and batch size for a staging buffer.
pub(crate) fn slot_counts(buffer_size: usize, max_packet_size: usize) -> (usize, usize) {
    let frame = max_packet_size + HEADER_LEN;
    let n_slots = (buffer_size / frame).max(1);
    let target_batch = (n_slots / 4).min(MAX_BATCH_BYTES / frame).max(1);
    (n_slots, target_batch)
}

pub(crate) struct Slot {
    pub(crate) wr: SendWr,
    /// Byte offset of this slot's frame in the staging buffer.
    pub(crate) frame_offset: usize,
    /// Fragments referenced in place by `wr`.
    pub(crate) keep: [Option<Bytes>; MAX_SGE],
    pub(crate) item: Option<Rc<SendItem>>,
    pub(crate) last: bool,
    /// Heaps of rejected packets that completed behind this slot.
    pub(crate) extra_heaps: usize,
}

impl Slot {
    /// Heaps finished when this slot completes.
    #[inline]
    pub(crate) fn heaps(&self) -> usize {
        usize::from(self.last) + self.extra_heaps
    }

    /// Drop everything the slot held for the device.
    pub(crate) fn release(&mut self) {
        self.keep = Default::default();
        self.item = None;
        self.last = false;
        self.extra_heaps = 0;
    }
}

pub(crate) struct SlotRing {
    slots: Box<[Slot]>,
    head: usize,
    tail: usize,
    available: usize,
}

impl SlotRing {
    pub(crate) fn new(n_slots: usize, frame_size: usize) -> Self {
        let slots: Box<[Slot]> = (0..n_slots)
            .map(|i| Slot {
                wr: SendWr::default(),
                frame_offset: i * frame_size,
                keep: Default::default(),
                item: None,
                last: false,
                extra_heaps: 0,
            })
            .collect();
        SlotRing {
            slots,
            head: 0,
            tail: 0,
            available: n_slots,
        }
    }

    #[inline]
    pub(crate) fn n_slots(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn available(&self) -> usize {
        self.available
    }

    #[inline]
    pub(crate) fn outstanding(&self) -> usize {
        self.slots.len() - self.available
    }

    /// Next free slot. Only valid while `available() > 0`.
    #[inline]
    pub(crate) fn tail_mut(&mut self) -> &mut Slot {
        debug_assert!(self.available > 0);
        &mut self.slots[self.tail]
    }

    /// Mark the tail slot as posted.
    #[inline]
    pub(crate) fn commit_tail(&mut self) {
        debug_assert!(self.available > 0);
        self.tail = (self.tail + 1) % self.slots.len();
        self.available -= 1;
    }

    /// Oldest posted slot. Only valid while `outstanding() > 0`.
    #[inline]
    pub(crate) fn head_mut(&mut self) -> &mut Slot {
        debug_assert!(self.outstanding() > 0);
        &mut self.slots[self.head]
    }

    /// Return the head slot to the free pool.
    #[inline]
    pub(crate) fn retire_head(&mut self) {
        debug_assert!(self.outstanding() > 0);
        self.slots[self.head].release();
        self.head = (self.head + 1) % self.slots.len();
        self.available += 1;
    }

    /// Most recently taken slot that is still outstanding.
    pub(crate) fn newest_mut(&mut self) -> Option<&mut Slot> {
        if self.outstanding() == 0 {
            return None;
        }
        let n = self.slots.len();
        Some(&mut self.slots[(self.tail + n - 1) % n])
    }

    /// Hand back the `count` most recently taken slots, newest first,
    /// releasing what they hold.
    pub(crate) fn rewind(&mut self, count: usize) {
        debug_assert!(count <= self.outstanding());
        let n = self.slots.len();
        for _ in 0..count {
            self.tail = (self.tail + n - 1) % n;
            self.slots[self.tail].release();
            self.available += 1;
        }
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }
}

/// Where copied fragments land, and how the device addresses it.
pub(crate) struct Staging<'a> {
    /// This slot's frame: header followed by room for the payload.
    pub(crate) frame: &'a mut [u8],
    /// Device address of `frame[0]`.
    pub(crate) addr: u64,
    pub(crate) lkey: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Assembled {
    pub(crate) copied: usize,
    pub(crate) zero_copy: usize,
}

/// Fill `wr` with the header SGE plus one SGE per payload fragment, merging
/// neighbours that share a key and are contiguous.
///
/// A fragment inside a registered region is referenced in place (and kept
/// alive through `keep`) when the packet has no more fragments than the
/// SGE budget; otherwise it is copied behind the header. If the in-place
/// attempt still runs out of SGEs, the whole packet is copied.
pub(crate) fn assemble(
    wr: &mut SendWr,
    keep: &mut [Option<Bytes>; MAX_SGE],
    staging: &mut Staging<'_>,
    regions: &RegionSet,
    buffers: &[Bytes],
) -> Assembled {
    if buffers.len() <= MAX_SGE
        && !regions.is_empty()
        && let Some(done) = build(wr, keep, staging, Some(regions), buffers)
    {
        return done;
    }
    *keep = Default::default();
    build(wr, keep, staging, None, buffers).unwrap_or_default()
}

fn build(
    wr: &mut SendWr,
    keep: &mut [Option<Bytes>; MAX_SGE],
    staging: &mut Staging<'_>,
    regions: Option<&RegionSet>,
    buffers: &[Bytes],
) -> Option<Assembled> {
    wr.sg_list[0] = Sge {
        addr: staging.addr,
        length: HEADER_LEN as u32,
        lkey: staging.lkey,
    };
    wr.num_sge = 1;
    let mut copy_at = HEADER_LEN;
    let mut out = Assembled::default();
    let mut kept = 0;

    for buf in buffers.iter().filter(|b| !b.is_empty()) {
        let ptr = buf.as_ptr() as usize;
        let in_place = regions.and_then(|r| r.lookup(ptr, buf.len()));
        let cur = match in_place {
            Some(lkey) => {
                keep[kept] = Some(buf.clone());
                kept += 1;
                out.zero_copy += 1;
                Sge {
                    addr: ptr as u64,
                    length: buf.len() as u32,
                    lkey,
                }
            }
            None => {
                staging.frame[copy_at..copy_at + buf.len()].copy_from_slice(buf);
                let sge = Sge {
                    addr: staging.addr + copy_at as u64,
                    length: buf.len() as u32,
                    lkey: staging.lkey,
                };
                copy_at += buf.len();
                out.copied += buf.len();
                sge
            }
        };
        let prev = &mut wr.sg_list[wr.num_sge - 1];
        if prev.lkey == cur.lkey && prev.addr + u64::from(prev.length) == cur.addr {
            prev.length += cur.length;
        } else if wr.num_sge == MAX_SGE {
            return None;
        } else {
            wr.sg_list[wr.num_sge] = cur;
            wr.num_sge += 1;
        }
    }
    Some(out)
}
