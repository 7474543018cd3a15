//! Flow steering rules for UDP endpoints.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{Error, Result};
use crate::frame::{ETHERTYPE_IPV4, MacAddr, multicast_mac};
use crate::resource::{CmId, Flow, QueuePair};
use crate::verbs::Provider;

/// Match criteria of one steering rule: Ethernet destination and type, IPv4
/// destination (wildcard when `None`) and UDP destination port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    pub port_num: u8,
    pub dst_mac: MacAddr,
    pub ether_type: u16,
    pub dst_ip: Option<Ipv4Addr>,
    pub udp_dst_port: u16,
}

impl FlowSpec {
    /// Build the rule for `endpoint`. Multicast groups match their derived
    /// link address; everything else matches the interface's own address.
    pub fn for_endpoint(endpoint: SocketAddrV4, interface_mac: MacAddr, port_num: u8) -> Self {
        let ip = *endpoint.ip();
        let dst_mac = if ip.is_multicast() {
            multicast_mac(ip)
        } else {
            interface_mac
        };
        FlowSpec {
            port_num,
            dst_mac,
            ether_type: ETHERTYPE_IPV4,
            dst_ip: (!ip.is_unspecified()).then_some(ip),
            udp_dst_port: endpoint.port(),
        }
    }

    pub fn matches(&self, mac: MacAddr, ether_type: u16, dst: SocketAddrV4) -> bool {
        self.dst_mac == mac
            && self.ether_type == ether_type
            && self.dst_ip.is_none_or(|ip| ip == *dst.ip())
            && self.udp_dst_port == dst.port()
    }
}

pub(crate) fn require_ipv4(endpoint: &SocketAddr) -> Result<SocketAddrV4> {
    match endpoint {
        SocketAddr::V4(v4) => Ok(*v4),
        SocketAddr::V6(_) => Err(Error::invalid("endpoint is not an IPv4 address")),
    }
}

/// Steer packets addressed to `endpoint` into `qp`.
pub fn create_flow<P: Provider>(
    qp: &QueuePair<P>,
    endpoint: &SocketAddr,
    id: &CmId<P>,
) -> Result<Flow<P>> {
    let endpoint = require_ipv4(endpoint)?;
    let port = id
        .port()
        .ok_or_else(|| Error::invalid("connection id is not bound to an interface"))?;
    Flow::new(qp, &FlowSpec::for_endpoint(endpoint, port.mac, port.port_num))
}

/// One rule per endpoint. On failure the rules already created are released.
pub fn create_flows<P: Provider>(
    qp: &QueuePair<P>,
    endpoints: &[SocketAddr],
    id: &CmId<P>,
) -> Result<Vec<Flow<P>>> {
    endpoints
        .iter()
        .map(|endpoint| create_flow(qp, endpoint, id))
        .collect()
}
