//! A simple in-memory packet source.
//!
//! Callers enqueue heaps (pre-built packets sharing one [`SendItem`]); the
//! writer pulls them packet by packet. Heaps whose last packet has been
//! handed out wait in flight until the writer reports them complete, which
//! it does in post order.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{PacketResult, PacketSource, SendItem, TransmitPacket};
use crate::error::{Error, Result};

/// Bytes of credit allowed to accumulate while the queue is idle.
const BURST_BYTES: f64 = 65536.0;

/// Software pacing: a packet may leave once the previous ones have been
/// paid for at `rate` bytes per second.
#[derive(Debug)]
struct Pacer {
    rate: f64,
    next: Instant,
}

impl Pacer {
    fn new(rate: f64, now: Instant) -> Self {
        Pacer { rate, next: now }
    }

    fn ready(&self, now: Instant) -> bool {
        now >= self.next
    }

    fn charge(&mut self, bytes: usize, now: Instant) {
        let burst = Duration::from_secs_f64(BURST_BYTES / self.rate);
        let floor = now.checked_sub(burst).unwrap_or(now);
        self.next = self.next.max(floor) + Duration::from_secs_f64(bytes as f64 / self.rate);
    }
}

struct Heap {
    item: Rc<SendItem>,
    packets: VecDeque<Vec<Bytes>>,
}

/// FIFO of heaps implementing [`PacketSource`].
pub struct HeapQueue {
    max_packet_size: usize,
    pending: VecDeque<Heap>,
    in_flight: VecDeque<Rc<SendItem>>,
    pacer: Option<Pacer>,
}

impl HeapQueue {
    pub fn new(max_packet_size: usize) -> Self {
        HeapQueue {
            max_packet_size,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            pacer: None,
        }
    }

    /// Limit output to `rate` bytes of payload per second. Zero removes the
    /// limit.
    pub fn set_rate(&mut self, rate: f64) {
        self.pacer = (rate > 0.0).then(|| Pacer::new(rate, Instant::now()));
    }

    /// Drop software pacing, e.g. because the adapter paces instead.
    pub fn disable_rate_limit(&mut self) {
        self.pacer = None;
    }

    /// Queue one heap for `substream`. Every packet is a list of payload
    /// fragments; the last packet finishes the heap.
    pub fn enqueue(&mut self, packets: Vec<Vec<Bytes>>, substream: usize) -> Result<Rc<SendItem>> {
        for packet in &packets {
            let size: usize = packet.iter().map(Bytes::len).sum();
            if size > self.max_packet_size {
                return Err(Error::invalid(format!(
                    "packet of {size} bytes exceeds max_packet_size {}",
                    self.max_packet_size
                )));
            }
        }
        let item = SendItem::new(substream);
        if packets.is_empty() {
            item.finish();
            return Ok(item);
        }
        self.pending.push_back(Heap {
            item: Rc::clone(&item),
            packets: packets.into(),
        });
        Ok(item)
    }

    /// Heaps with packets still to hand out.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Heaps fully handed out but not yet reported complete.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// When rate limiting holds back queued packets, the instant they may
    /// resume.
    pub fn sleep_deadline(&self) -> Option<Instant> {
        match &self.pacer {
            Some(pacer) if !self.pending.is_empty() => Some(pacer.next),
            _ => None,
        }
    }

    fn next_packet_at(&mut self, out: &mut TransmitPacket, now: Instant) -> PacketResult {
        let Some(heap) = self.pending.front_mut() else {
            return PacketResult::Empty;
        };
        if let Some(pacer) = &self.pacer
            && !pacer.ready(now)
        {
            return PacketResult::Sleep;
        }
        let Some(buffers) = heap.packets.pop_front() else {
            return PacketResult::Empty;
        };
        out.buffers = buffers;
        out.item = Some(Rc::clone(&heap.item));
        out.last = heap.packets.is_empty();
        if out.last {
            self.in_flight.push_back(Rc::clone(&heap.item));
            self.pending.pop_front();
        }
        if let Some(pacer) = &mut self.pacer {
            pacer.charge(out.size(), now);
        }
        PacketResult::Success
    }
}

impl PacketSource for HeapQueue {
    fn next_packet(&mut self, out: &mut TransmitPacket) -> PacketResult {
        self.next_packet_at(out, Instant::now())
    }

    fn heaps_completed(&mut self, n: usize) {
        for _ in 0..n {
            match self.in_flight.pop_front() {
                Some(item) => item.finish(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::ItemStatus;

    fn packet(len: usize) -> Vec<Bytes> {
        vec![Bytes::from(vec![0xab; len])]
    }

    #[test]
    fn hands_out_packets_in_order_and_flags_last() {
        let mut q = HeapQueue::new(1472);
        let a = q.enqueue(vec![packet(10), packet(20)], 0).unwrap();
        let b = q.enqueue(vec![packet(30)], 1).unwrap();
        let mut out = TransmitPacket::default();

        assert_eq!(q.next_packet(&mut out), PacketResult::Success);
        assert_eq!(out.size(), 10);
        assert!(!out.last);
        out.clear();
        assert_eq!(q.next_packet(&mut out), PacketResult::Success);
        assert!(out.last);
        assert!(Rc::ptr_eq(out.item.as_ref().unwrap(), &a));
        out.clear();
        assert_eq!(q.next_packet(&mut out), PacketResult::Success);
        assert_eq!(out.substream(), 1);
        out.clear();
        assert_eq!(q.next_packet(&mut out), PacketResult::Empty);

        assert_eq!(q.in_flight(), 2);
        q.heaps_completed(1);
        assert_eq!(a.status(), ItemStatus::Sent);
        assert_eq!(b.status(), ItemStatus::Incomplete);
        q.heaps_completed(1);
        assert!(q.is_idle());
    }

    #[test]
    fn oversize_packet_rejected_at_enqueue() {
        let mut q = HeapQueue::new(100);
        assert!(q.enqueue(vec![packet(50), packet(101)], 0).is_err());
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn empty_heap_finishes_immediately() {
        let mut q = HeapQueue::new(100);
        let item = q.enqueue(Vec::new(), 0).unwrap();
        assert_eq!(item.status(), ItemStatus::Sent);
        assert!(q.is_idle());
    }

    #[test]
    fn pacer_sleeps_until_paid() {
        let mut q = HeapQueue::new(1500);
        let start = Instant::now();
        q.pacer = Some(Pacer::new(1000.0, start));
        for _ in 0..3 {
            q.enqueue(vec![packet(500)], 0).unwrap();
        }
        let mut out = TransmitPacket::default();
        assert_eq!(q.next_packet_at(&mut out, start), PacketResult::Success);
        out.clear();
        // 500 bytes at 1000 B/s costs half a second.
        assert_eq!(q.next_packet_at(&mut out, start), PacketResult::Sleep);
        assert_eq!(q.sleep_deadline(), Some(start + Duration::from_millis(500)));
        let later = start + Duration::from_millis(500);
        assert_eq!(q.next_packet_at(&mut out, later), PacketResult::Success);

        q.disable_rate_limit();
        out.clear();
        assert_eq!(q.next_packet_at(&mut out, later), PacketResult::Success);
        assert_eq!(q.sleep_deadline(), None);
    }

    #[test]
    fn idle_credit_is_capped() {
        let start = Instant::now();
        let mut pacer = Pacer::new(65536.0, start);
        // After ten idle seconds only one second of burst is available.
        let now = start + Duration::from_secs(10);
        pacer.charge(65536, now);
        assert!(pacer.ready(now));
        pacer.charge(65536, now);
        assert!(!pacer.ready(now));
    }
}
