//! Ethernet/IPv4/UDP framing.
//!
//! The send path pre-fills every slot with a [`FrameTemplate`] and patches
//! only the length fields, checksum and (with several destinations) the
//! addressing per packet. The receive path strips headers with
//! [`udp_from_ethernet`].

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::FrameError;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// Bytes of framing in front of every UDP payload.
pub const HEADER_LEN: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = 17;

const IP_FLAG_DF: u16 = 0x4000;
const IP_FLAG_MF: u16 = 0x2000;
const IP_FRAG_OFFSET_MASK: u16 = 0x1fff;

// Offsets from the start of the Ethernet frame.
const ETH_DST: usize = 0;
const ETH_SRC: usize = 6;
const ETH_TYPE: usize = 12;
const IP: usize = ETHERNET_HEADER_LEN;
const IP_TOTAL_LEN: usize = IP + 2;
const IP_FLAGS: usize = IP + 6;
const IP_TTL: usize = IP + 8;
const IP_PROTO: usize = IP + 9;
const IP_CSUM: usize = IP + 10;
const IP_SRC: usize = IP + 12;
const IP_DST: usize = IP + 16;
const UDP: usize = IP + IPV4_HEADER_LEN;
const UDP_SRC: usize = UDP;
const UDP_DST: usize = UDP + 2;
const UDP_LEN: usize = UDP + 4;
const UDP_CSUM: usize = UDP + 6;

/// 48-bit link-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Link-layer address an IPv4 multicast group maps to (RFC 1112).
pub fn multicast_mac(addr: Ipv4Addr) -> MacAddr {
    let o = addr.octets();
    MacAddr([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
}

/// Internet checksum over an IPv4 header.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in header.chunks(2) {
        let word = match *chunk {
            [hi, lo] => u16::from_be_bytes([hi, lo]),
            [hi] => u16::from_be_bytes([hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Addressing that varies per destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTarget {
    pub mac: MacAddr,
    pub endpoint: SocketAddrV4,
}

/// Header fields shared by every frame a stream sends.
#[derive(Debug, Clone, Copy)]
pub struct FrameTemplate {
    pub src_mac: MacAddr,
    pub src: SocketAddrV4,
    pub target: FrameTarget,
    pub ttl: u8,
}

impl FrameTemplate {
    /// Write the full header into the first [`HEADER_LEN`] bytes of `frame`.
    pub fn write(&self, frame: &mut [u8]) {
        let h = &mut frame[..HEADER_LEN];
        h.fill(0);
        h[ETH_SRC..ETH_SRC + 6].copy_from_slice(&self.src_mac.0);
        h[ETH_TYPE..ETH_TYPE + 2].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        h[IP] = 0x45;
        h[IP_FLAGS..IP_FLAGS + 2].copy_from_slice(&IP_FLAG_DF.to_be_bytes());
        h[IP_TTL] = self.ttl;
        h[IP_PROTO] = IPPROTO_UDP;
        h[IP_SRC..IP_SRC + 4].copy_from_slice(&self.src.ip().octets());
        h[UDP_SRC..UDP_SRC + 2].copy_from_slice(&self.src.port().to_be_bytes());
        h[UDP_CSUM..UDP_CSUM + 2].copy_from_slice(&0u16.to_be_bytes());
        set_target(h, &self.target);
    }
}

/// Rewrite destination MAC, IPv4 address and UDP port.
pub fn set_target(frame: &mut [u8], target: &FrameTarget) {
    frame[ETH_DST..ETH_DST + 6].copy_from_slice(&target.mac.0);
    frame[IP_DST..IP_DST + 4].copy_from_slice(&target.endpoint.ip().octets());
    frame[UDP_DST..UDP_DST + 2].copy_from_slice(&target.endpoint.port().to_be_bytes());
}

/// Stamp IPv4 total length and UDP length for `payload_len` bytes of
/// payload, then refresh the IPv4 checksum.
pub fn set_payload_len(frame: &mut [u8], payload_len: usize) {
    let ip_len = (payload_len + IPV4_HEADER_LEN + UDP_HEADER_LEN) as u16;
    let udp_len = (payload_len + UDP_HEADER_LEN) as u16;
    frame[IP_TOTAL_LEN..IP_TOTAL_LEN + 2].copy_from_slice(&ip_len.to_be_bytes());
    frame[UDP_LEN..UDP_LEN + 2].copy_from_slice(&udp_len.to_be_bytes());
    frame[IP_CSUM..IP_CSUM + 2].copy_from_slice(&[0, 0]);
    let csum = ipv4_checksum(&frame[IP..IP + IPV4_HEADER_LEN]);
    frame[IP_CSUM..IP_CSUM + 2].copy_from_slice(&csum.to_be_bytes());
}

/// Destination MAC, IPv4 address and UDP port of a frame, if it is long
/// enough to carry them. Used by flow matching.
pub fn destination(frame: &[u8]) -> Option<(MacAddr, u16, SocketAddrV4)> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[ETH_DST..ETH_DST + 6]);
    let ethertype = u16::from_be_bytes([frame[ETH_TYPE], frame[ETH_TYPE + 1]]);
    let ip = Ipv4Addr::new(
        frame[IP_DST],
        frame[IP_DST + 1],
        frame[IP_DST + 2],
        frame[IP_DST + 3],
    );
    let port = u16::from_be_bytes([frame[UDP_DST], frame[UDP_DST + 1]]);
    Some((MacAddr(mac), ethertype, SocketAddrV4::new(ip, port)))
}

/// Validate an Ethernet frame carrying IPv4/UDP and return the UDP payload.
pub fn udp_from_ethernet(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return Err(FrameError::Length("Frame is too short for Ethernet header"));
    }
    let ethertype = u16::from_be_bytes([frame[ETH_TYPE], frame[ETH_TYPE + 1]]);
    if ethertype != ETHERTYPE_IPV4 {
        return Err(FrameError::PacketType(
            "Frame has wrong ethernet type (VLAN tagging?), discarding",
        ));
    }
    let ip = &frame[IP..];
    if ip.len() < IPV4_HEADER_LEN {
        return Err(FrameError::Length("Frame is too short for IPv4 header"));
    }
    if ip[0] >> 4 != 4 {
        return Err(FrameError::PacketType("Frame is not IPv4, discarding"));
    }
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    if ihl < IPV4_HEADER_LEN || ihl > ip.len() {
        return Err(FrameError::Length("IPv4 header length is invalid"));
    }
    let total_len = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
    if total_len < ihl || total_len > ip.len() {
        return Err(FrameError::Length("IPv4 total length is out of range"));
    }
    let flags = u16::from_be_bytes([ip[6], ip[7]]);
    if flags & IP_FLAG_MF != 0 || flags & IP_FRAG_OFFSET_MASK != 0 {
        return Err(FrameError::PacketType("IP datagram is fragmented, discarding"));
    }
    if ip[9] != IPPROTO_UDP {
        return Err(FrameError::PacketType("Packet is not UDP, discarding"));
    }
    let udp = &ip[ihl..total_len];
    if udp.len() < UDP_HEADER_LEN {
        return Err(FrameError::Length("Datagram is too short for UDP header"));
    }
    let udp_len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));
    if udp_len < UDP_HEADER_LEN || udp_len > udp.len() {
        return Err(FrameError::Length("UDP length is out of range"));
    }
    Ok(&udp[UDP_HEADER_LEN..udp_len])
}

#[cfg(test)]
pub(crate) fn build_frame(template: &FrameTemplate, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN + payload.len()];
    template.write(&mut frame);
    set_payload_len(&mut frame, payload.len());
    frame[HEADER_LEN..].copy_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> FrameTemplate {
        let group = Ipv4Addr::new(239, 10, 20, 30);
        FrameTemplate {
            src_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 40000),
            target: FrameTarget {
                mac: multicast_mac(group),
                endpoint: SocketAddrV4::new(group, 7148),
            },
            ttl: 4,
        }
    }

    #[test]
    fn multicast_mac_masks_high_bit() {
        let mac = multicast_mac(Ipv4Addr::new(239, 200, 1, 2));
        assert_eq!(mac, MacAddr([0x01, 0x00, 0x5e, 0x48, 0x01, 0x02]));
        assert_eq!(mac.to_string(), "01:00:5e:48:01:02");
    }

    #[test]
    fn checksum_of_known_header() {
        // Classic example header from RFC 1071 discussions.
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ipv4_checksum(&header), 0xb861);
    }

    #[test]
    fn template_fields() {
        let frame = build_frame(&template(), b"hello");
        assert_eq!(frame.len(), HEADER_LEN + 5);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(frame[IP], 0x45);
        assert_eq!(&frame[IP_FLAGS..IP_FLAGS + 2], &[0x40, 0x00]);
        assert_eq!(frame[IP_TTL], 4);
        assert_eq!(frame[IP_PROTO], 17);
        assert_eq!(&frame[UDP_CSUM..UDP_CSUM + 2], &[0, 0]);
        assert_eq!(ipv4_checksum(&frame[IP..IP + IPV4_HEADER_LEN]), 0);
        let (mac, ethertype, dst) = destination(&frame).unwrap();
        assert_eq!(mac, multicast_mac(Ipv4Addr::new(239, 10, 20, 30)));
        assert_eq!(ethertype, ETHERTYPE_IPV4);
        assert_eq!(dst.port(), 7148);
    }

    #[test]
    fn parse_round_trip_payload() {
        let frame = build_frame(&template(), b"payload bytes");
        assert_eq!(udp_from_ethernet(&frame).unwrap(), b"payload bytes");
    }

    #[test]
    fn retarget_updates_addressing() {
        let mut frame = build_frame(&template(), b"x");
        let target = FrameTarget {
            mac: MacAddr([0xaa; 6]),
            endpoint: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 9000),
        };
        set_target(&mut frame, &target);
        set_payload_len(&mut frame, 1);
        let (mac, _, dst) = destination(&frame).unwrap();
        assert_eq!(mac, MacAddr([0xaa; 6]));
        assert_eq!(dst, target.endpoint);
        assert_eq!(ipv4_checksum(&frame[IP..IP + IPV4_HEADER_LEN]), 0);
    }

    #[test]
    fn rejects_vlan_tagged() {
        let mut frame = build_frame(&template(), b"x");
        frame[12] = 0x81;
        frame[13] = 0x00;
        assert!(matches!(
            udp_from_ethernet(&frame),
            Err(FrameError::PacketType(_))
        ));
    }

    #[test]
    fn rejects_fragments() {
        let mut frame = build_frame(&template(), b"x");
        frame[IP_FLAGS] = 0x20;
        assert!(matches!(
            udp_from_ethernet(&frame),
            Err(FrameError::PacketType(_))
        ));
    }

    #[test]
    fn rejects_non_udp() {
        let mut frame = build_frame(&template(), b"x");
        frame[IP_PROTO] = 6;
        assert!(matches!(
            udp_from_ethernet(&frame),
            Err(FrameError::PacketType(_))
        ));
    }

    #[test]
    fn rejects_truncated() {
        let frame = build_frame(&template(), b"0123456789");
        assert!(matches!(
            udp_from_ethernet(&frame[..HEADER_LEN + 3]),
            Err(FrameError::Length(_))
        ));
        assert!(matches!(
            udp_from_ethernet(&frame[..10]),
            Err(FrameError::Length(_))
        ));
    }
}
