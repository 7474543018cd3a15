use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{Error, Result};
use crate::frame::{ETHERNET_HEADER_LEN, HEADER_LEN, MacAddr};
use crate::send::region;

/// Largest UDP payload an IPv4 datagram can carry.
const MAX_UDP_PAYLOAD: usize = 65535 - (HEADER_LEN - ETHERNET_HEADER_LEN);

pub const DEFAULT_SEND_BUFFER_SIZE: usize = 512 * 1024;
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_POLL: u32 = 10;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;
pub const DEFAULT_RECV_MAX_SIZE: usize = 9200;
pub const DEFAULT_TTL: u8 = 1;

/// A caller-owned memory range to pre-register for zero-copy sends.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    ptr: *const u8,
    len: usize,
}

// Safety: the range is only read by the device, and the caller guarantees it
// outlives every stream it is registered with.
unsafe impl Send for MemoryRange {}
unsafe impl Sync for MemoryRange {}

impl MemoryRange {
    /// # Safety
    ///
    /// `len` bytes at `ptr` must stay mapped, and must not be modified while
    /// packets referencing them are in flight, for as long as any stream
    /// built from a config containing this range exists.
    pub unsafe fn from_raw(ptr: *const u8, len: usize) -> Self {
        MemoryRange { ptr, len }
    }

    pub fn from_static(data: &'static [u8]) -> Self {
        MemoryRange {
            ptr: data.as_ptr(),
            len: data.len(),
        }
    }

    pub fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Where a send stream addresses its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub endpoint: SocketAddr,
    /// Link-layer address. Derived for multicast groups; required for
    /// unicast endpoints.
    pub mac: Option<MacAddr>,
}

impl Destination {
    pub fn multicast(endpoint: SocketAddr) -> Self {
        Destination {
            endpoint,
            mac: None,
        }
    }

    pub fn unicast(endpoint: SocketAddr, mac: MacAddr) -> Self {
        Destination {
            endpoint,
            mac: Some(mac),
        }
    }
}

fn interface_v4(addr: Option<IpAddr>) -> Result<Ipv4Addr> {
    match addr {
        Some(IpAddr::V4(v4)) if !v4.is_unspecified() => Ok(v4),
        Some(IpAddr::V6(_)) => Err(Error::invalid("interface address is not an IPv4 address")),
        _ => Err(Error::invalid("interface address is not specified")),
    }
}

fn endpoint_v4(endpoint: &SocketAddr) -> Result<SocketAddrV4> {
    match endpoint {
        SocketAddr::V4(v4) => Ok(*v4),
        SocketAddr::V6(_) => Err(Error::invalid(format!(
            "endpoint {endpoint} is not an IPv4 address"
        ))),
    }
}

/// Configuration for [`crate::send::UdpIbvWriter`].
#[derive(Debug, Clone)]
pub struct SendConfig {
    pub destinations: Vec<Destination>,
    pub interface_address: Option<IpAddr>,
    /// Staging buffer size. Rounded down to whole slots.
    pub buffer_size: usize,
    pub ttl: u8,
    /// Completion vector for interrupt-driven waits. Negative selects busy
    /// polling without a completion channel.
    pub comp_vector: i32,
    /// Empty polls tolerated per reap.
    pub max_poll: u32,
    pub memory_regions: Vec<MemoryRange>,
    /// Largest UDP payload, excluding framing.
    pub max_packet_size: usize,
    /// Target rate in bytes per second. Zero disables rate limiting.
    pub rate: f64,
    /// Allow offloading the rate limit to the adapter.
    pub allow_hw_rate: bool,
    /// Source UDP port. When unset, a socket bound on the interface reserves
    /// one.
    pub source_port: Option<u16>,
    /// Keep a device context open so multicast sent here loops back to
    /// local receivers.
    pub multicast_loopback: bool,
}

impl Default for SendConfig {
    fn default() -> Self {
        SendConfig {
            destinations: Vec::new(),
            interface_address: None,
            buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            ttl: DEFAULT_TTL,
            comp_vector: 0,
            max_poll: DEFAULT_MAX_POLL,
            memory_regions: Vec::new(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            rate: 0.0,
            allow_hw_rate: true,
            source_port: None,
            multicast_loopback: false,
        }
    }
}

impl SendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.destinations.is_empty() {
            return Err(Error::invalid("endpoints is empty"));
        }
        for dest in &self.destinations {
            let v4 = endpoint_v4(&dest.endpoint)?;
            if !v4.ip().is_multicast() && dest.mac.is_none() {
                return Err(Error::invalid(format!(
                    "unicast endpoint {v4} needs a link-layer address"
                )));
            }
        }
        interface_v4(self.interface_address)?;
        // A single empty poll is a valid setting; only zero is refused.
        if self.max_poll < 1 {
            return Err(Error::invalid("max_poll must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(Error::invalid("buffer_size must be > 0"));
        }
        if !(1..=MAX_UDP_PAYLOAD).contains(&self.max_packet_size) {
            return Err(Error::invalid(format!(
                "max_packet_size must be in 1..={MAX_UDP_PAYLOAD}"
            )));
        }
        if !self.rate.is_finite() || self.rate < 0.0 {
            return Err(Error::invalid("rate must be finite and non-negative"));
        }
        region::validate_ranges(&self.memory_regions)
    }

    pub(crate) fn interface_v4(&self) -> Result<Ipv4Addr> {
        interface_v4(self.interface_address)
    }
}

/// Builder for [`SendConfig`].
#[derive(Debug, Default)]
pub struct SendConfigBuilder {
    config: SendConfig,
}

impl SendConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Addressing ───────────────────────────────────────────────────

    /// Add a multicast destination.
    pub fn endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.config.destinations.push(Destination::multicast(endpoint));
        self
    }

    /// Add a unicast destination reached at `mac`.
    pub fn unicast_endpoint(mut self, endpoint: SocketAddr, mac: MacAddr) -> Self {
        self.config
            .destinations
            .push(Destination::unicast(endpoint, mac));
        self
    }

    pub fn interface_address(mut self, addr: IpAddr) -> Self {
        self.config.interface_address = Some(addr);
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.config.ttl = ttl;
        self
    }

    pub fn source_port(mut self, port: u16) -> Self {
        self.config.source_port = Some(port);
        self
    }

    pub fn multicast_loopback(mut self, enable: bool) -> Self {
        self.config.multicast_loopback = enable;
        self
    }

    // ── Buffering and polling ────────────────────────────────────────

    /// Staging buffer size. 0 selects the default.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = if size == 0 {
            DEFAULT_SEND_BUFFER_SIZE
        } else {
            size
        };
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    pub fn comp_vector(mut self, vector: i32) -> Self {
        self.config.comp_vector = vector;
        self
    }

    pub fn max_poll(mut self, max_poll: u32) -> Self {
        self.config.max_poll = max_poll;
        self
    }

    pub fn memory_region(mut self, range: MemoryRange) -> Self {
        self.config.memory_regions.push(range);
        self
    }

    // ── Rate ─────────────────────────────────────────────────────────

    pub fn rate(mut self, bytes_per_second: f64) -> Self {
        self.config.rate = bytes_per_second;
        self
    }

    pub fn allow_hw_rate(mut self, allow: bool) -> Self {
        self.config.allow_hw_rate = allow;
        self
    }

    pub fn build(self) -> Result<SendConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration for [`crate::recv::MprqReader`].
#[derive(Debug, Clone)]
pub struct RecvConfig {
    pub endpoints: Vec<SocketAddr>,
    pub interface_address: Option<IpAddr>,
    /// Receive buffer size. Rounded up to at least two entries and clamped
    /// to device limits.
    pub buffer_size: usize,
    /// Largest UDP payload delivered; larger packets are dropped.
    pub max_size: usize,
    /// Negative selects busy polling.
    pub comp_vector: i32,
    pub max_poll: u32,
    pub multicast_loopback: bool,
}

impl Default for RecvConfig {
    fn default() -> Self {
        RecvConfig {
            endpoints: Vec::new(),
            interface_address: None,
            buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_size: DEFAULT_RECV_MAX_SIZE,
            comp_vector: 0,
            max_poll: DEFAULT_MAX_POLL,
            multicast_loopback: false,
        }
    }
}

impl RecvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::invalid("endpoints is empty"));
        }
        for endpoint in &self.endpoints {
            endpoint_v4(endpoint)?;
        }
        interface_v4(self.interface_address)?;
        // A single empty poll is a valid setting; only zero is refused.
        if self.max_poll < 1 {
            return Err(Error::invalid("max_poll must be at least 1"));
        }
        if self.max_size == 0 {
            return Err(Error::invalid("max_size must be > 0"));
        }
        if self.buffer_size == 0 {
            return Err(Error::invalid("buffer_size must be > 0"));
        }
        Ok(())
    }

    pub(crate) fn interface_v4(&self) -> Result<Ipv4Addr> {
        interface_v4(self.interface_address)
    }
}

/// Builder for [`RecvConfig`].
#[derive(Debug, Default)]
pub struct RecvConfigBuilder {
    config: RecvConfig,
}

impl RecvConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.config.endpoints.push(endpoint);
        self
    }

    pub fn interface_address(mut self, addr: IpAddr) -> Self {
        self.config.interface_address = Some(addr);
        self
    }

    /// Receive buffer size. 0 selects the default.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = if size == 0 {
            DEFAULT_RECV_BUFFER_SIZE
        } else {
            size
        };
        self
    }

    pub fn max_size(mut self, size: usize) -> Self {
        self.config.max_size = size;
        self
    }

    pub fn comp_vector(mut self, vector: i32) -> Self {
        self.config.comp_vector = vector;
        self
    }

    pub fn max_poll(mut self, max_poll: u32) -> Self {
        self.config.max_poll = max_poll;
        self
    }

    pub fn multicast_loopback(mut self, enable: bool) -> Self {
        self.config.multicast_loopback = enable;
        self
    }

    pub fn build(self) -> Result<RecvConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
