//! Transport statistics, exposed through metriken.

use crate::counter::{Counter, CounterGroup};
use metriken::metric;

static SEND: CounterGroup = CounterGroup::new();
static RECV: CounterGroup = CounterGroup::new();

/// Counter slot indices for the send path.
pub mod send {
    pub const PACKETS: usize = 0;
    pub const BYTES: usize = 1;
    pub const COPIED_BYTES: usize = 2;
    pub const BATCHES: usize = 3;
    pub const FAILED_COMPLETIONS: usize = 4;
    pub const SLOTS_EXHAUSTED: usize = 5;
    pub const ZERO_COPY_FRAGMENTS: usize = 6;
    pub const HW_RATE_LIMITED: usize = 7;
}

/// Counter slot indices for the receive path.
pub mod recv {
    pub const PACKETS: usize = 0;
    pub const BYTES: usize = 1;
    pub const TRUNCATED: usize = 2;
    pub const MALFORMED: usize = 3;
    pub const FAILED_COMPLETIONS: usize = 4;
    pub const WQE_REPOSTS: usize = 5;
    pub const POLL_BUDGET_EXHAUSTED: usize = 6;
}

// ── Send ─────────────────────────────────────────────────────────

#[metric(name = "verbline/send/packets", description = "Packets posted to the send queue")]
pub static SEND_PACKETS: Counter = Counter::new(&SEND, send::PACKETS);

#[metric(name = "verbline/send/bytes", description = "Payload bytes posted")]
pub static SEND_BYTES: Counter = Counter::new(&SEND, send::BYTES);

#[metric(
    name = "verbline/send/copied_bytes",
    description = "Payload bytes copied into the staging buffer"
)]
pub static SEND_COPIED_BYTES: Counter = Counter::new(&SEND, send::COPIED_BYTES);

#[metric(name = "verbline/send/batches", description = "Work request chains posted")]
pub static SEND_BATCHES: Counter = Counter::new(&SEND, send::BATCHES);

#[metric(
    name = "verbline/send/failed_completions",
    description = "Send completions with non-success status"
)]
pub static SEND_FAILED_COMPLETIONS: Counter = Counter::new(&SEND, send::FAILED_COMPLETIONS);

#[metric(
    name = "verbline/send/slots_exhausted",
    description = "Wakeups that stopped because every slot was in flight"
)]
pub static SEND_SLOTS_EXHAUSTED: Counter = Counter::new(&SEND, send::SLOTS_EXHAUSTED);

#[metric(
    name = "verbline/send/zero_copy_fragments",
    description = "Payload fragments referenced in place from registered memory"
)]
pub static SEND_ZERO_COPY_FRAGMENTS: Counter = Counter::new(&SEND, send::ZERO_COPY_FRAGMENTS);

#[metric(
    name = "verbline/send/hw_rate_limited",
    description = "Streams that enabled hardware packet pacing"
)]
pub static SEND_HW_RATE_LIMITED: Counter = Counter::new(&SEND, send::HW_RATE_LIMITED);

// ── Receive ──────────────────────────────────────────────────────

#[metric(name = "verbline/recv/packets", description = "UDP payloads delivered")]
pub static RECV_PACKETS: Counter = Counter::new(&RECV, recv::PACKETS);

#[metric(name = "verbline/recv/bytes", description = "UDP payload bytes delivered")]
pub static RECV_BYTES: Counter = Counter::new(&RECV, recv::BYTES);

#[metric(
    name = "verbline/recv/truncated",
    description = "Packets dropped for exceeding the maximum size"
)]
pub static RECV_TRUNCATED: Counter = Counter::new(&RECV, recv::TRUNCATED);

#[metric(
    name = "verbline/recv/malformed",
    description = "Frames discarded during Ethernet/IPv4/UDP parsing"
)]
pub static RECV_MALFORMED: Counter = Counter::new(&RECV, recv::MALFORMED);

#[metric(
    name = "verbline/recv/failed_completions",
    description = "Receive completions with non-success status"
)]
pub static RECV_FAILED_COMPLETIONS: Counter = Counter::new(&RECV, recv::FAILED_COMPLETIONS);

#[metric(
    name = "verbline/recv/wqe_reposts",
    description = "Striding receive entries handed back to the device"
)]
pub static RECV_WQE_REPOSTS: Counter = Counter::new(&RECV, recv::WQE_REPOSTS);

#[metric(
    name = "verbline/recv/poll_budget_exhausted",
    description = "Receive polls that stopped at the completion cap"
)]
pub static RECV_POLL_BUDGET_EXHAUSTED: Counter =
    Counter::new(&RECV, recv::POLL_BUDGET_EXHAUSTED);
