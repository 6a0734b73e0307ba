//! Decoded packet model
//!
//! The packet source hands the pipeline [`DecodedPacket`]s: the link-layer
//! ether type, an optional parsed IPv4 summary and the arrival instant. Raw
//! Ethernet II frames can be decoded with [`DecodedPacket::from_ethernet_frame`].

use std::net::Ipv4Addr;
use std::time::Instant;

use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};

use crate::error::{Error, Result};

/// Well-known EtherType values
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
}

/// IP protocol numbers the record builder classifies
pub mod ip_protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// Minimum ICMP header length (type, code, checksum, rest-of-header)
const ICMP_HEADER_LEN: usize = 8;

/// Parsed transport-layer header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    Icmp { icmp_type: u8, code: u8 },
    Tcp { source_port: u16, destination_port: u16 },
    Udp { source_port: u16, destination_port: u16 },
}

/// Network-layer summary of an IPv4 packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Summary {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Total length field of the IPv4 header
    pub total_length: u16,
    /// `None` when the payload is not ICMP/TCP/UDP or failed to parse
    pub transport: Option<TransportHeader>,
}

/// One packet delivered by the packet source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub ether_type: u16,
    /// `None` for non-IPv4 frames and for IPv4 headers that failed to parse
    pub ipv4: Option<Ipv4Summary>,
    pub arrival: Instant,
}

impl DecodedPacket {
    /// Build an IPv4 packet from already-parsed fields
    pub fn ipv4(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        total_length: u16,
        transport: Option<TransportHeader>,
        arrival: Instant,
    ) -> Self {
        Self {
            ether_type: ethertype::IPV4,
            ipv4: Some(Ipv4Summary {
                source,
                destination,
                total_length,
                transport,
            }),
            arrival,
        }
    }

    /// Build a packet whose network layer the pipeline does not look at
    pub fn other(ether_type: u16, arrival: Instant) -> Self {
        Self {
            ether_type,
            ipv4: None,
            arrival,
        }
    }

    /// Decode an Ethernet II frame
    ///
    /// Fails only when the frame is too short to hold an Ethernet header. A
    /// broken IPv4 header leaves `ipv4` empty and a broken transport header
    /// leaves `transport` empty, so the record builder can still decide.
    pub fn from_ethernet_frame(frame: &[u8], arrival: Instant) -> Result<Self> {
        let eth = Ethernet2HeaderSlice::from_slice(frame)
            .map_err(|e| Error::decode(format!("Ethernet parse error: {}", e)))?;
        let ether_type = eth.ether_type().0;

        if ether_type != ethertype::IPV4 {
            return Ok(Self::other(ether_type, arrival));
        }

        let payload = &frame[eth.slice().len()..];
        Ok(Self {
            ether_type,
            ipv4: parse_ipv4(payload),
            arrival,
        })
    }

    /// Whether this packet carries a parsed IPv4 layer
    pub fn is_ipv4(&self) -> bool {
        self.ether_type == ethertype::IPV4 && self.ipv4.is_some()
    }
}

fn parse_ipv4(data: &[u8]) -> Option<Ipv4Summary> {
    let ipv4 = Ipv4HeaderSlice::from_slice(data).ok()?;
    let header_len = ipv4.slice().len();
    let payload = &data[header_len..];

    let transport = match ipv4.protocol().0 {
        ip_protocol::ICMP if payload.len() >= ICMP_HEADER_LEN => Some(TransportHeader::Icmp {
            icmp_type: payload[0],
            code: payload[1],
        }),
        ip_protocol::TCP => TcpHeaderSlice::from_slice(payload)
            .ok()
            .map(|tcp| TransportHeader::Tcp {
                source_port: tcp.source_port(),
                destination_port: tcp.destination_port(),
            }),
        ip_protocol::UDP => UdpHeaderSlice::from_slice(payload)
            .ok()
            .map(|udp| TransportHeader::Udp {
                source_port: udp.source_port(),
                destination_port: udp.destination_port(),
            }),
        _ => None,
    };

    Some(Ipv4Summary {
        source: ipv4.source_addr(),
        destination: ipv4.destination_addr(),
        total_length: ipv4.total_len(),
        transport,
    })
}

#[cfg(test)]
pub(crate) mod test_frames {
    //! Hand-built frames shared by the tests of several modules

    /// Ethernet II header with the given ether type
    pub fn ethernet(ether_type: u16) -> Vec<u8> {
        let mut frame = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02];
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame
    }

    /// Ethernet + minimal IPv4 header (no options) + `payload`
    pub fn ipv4_frame(protocol: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total_len = (20 + payload.len()) as u16;
        let mut frame = ethernet(0x0800);
        frame.extend_from_slice(&[0x45, 0x00]);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x40, protocol, 0x00, 0x00]);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(payload);
        frame
    }

    /// UDP header with the given ports and no payload
    pub fn udp(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(&src_port.to_be_bytes());
        header.extend_from_slice(&dst_port.to_be_bytes());
        header.extend_from_slice(&8u16.to_be_bytes());
        header.extend_from_slice(&[0x00, 0x00]);
        header
    }

    /// TCP header (20 bytes, SYN) with the given ports
    pub fn tcp(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut header = Vec::with_capacity(20);
        header.extend_from_slice(&src_port.to_be_bytes());
        header.extend_from_slice(&dst_port.to_be_bytes());
        header.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]);
        header.extend_from_slice(&[0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
        header
    }

    /// ICMP header with the given type and code
    pub fn icmp(icmp_type: u8, code: u8) -> Vec<u8> {
        vec![icmp_type, code, 0, 0, 0, 1, 0, 1]
    }
}

#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;

    #[test]
    fn test_decode_udp_frame() {
        let frame = ipv4_frame(17, [10, 0, 0, 1], [10, 0, 0, 2], &udp(5353, 53));
        let packet = DecodedPacket::from_ethernet_frame(&frame, Instant::now()).unwrap();

        assert!(packet.is_ipv4());
        let ipv4 = packet.ipv4.unwrap();
        assert_eq!(ipv4.source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ipv4.destination, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ipv4.total_length, 28);
        assert_eq!(
            ipv4.transport,
            Some(TransportHeader::Udp { source_port: 5353, destination_port: 53 })
        );
    }

    #[test]
    fn test_decode_tcp_and_icmp_frames() {
        let frame = ipv4_frame(6, [192, 168, 1, 1], [192, 168, 1, 2], &tcp(40000, 443));
        let packet = DecodedPacket::from_ethernet_frame(&frame, Instant::now()).unwrap();
        assert_eq!(
            packet.ipv4.unwrap().transport,
            Some(TransportHeader::Tcp { source_port: 40000, destination_port: 443 })
        );

        let frame = ipv4_frame(1, [192, 168, 1, 1], [192, 168, 1, 2], &icmp(8, 0));
        let packet = DecodedPacket::from_ethernet_frame(&frame, Instant::now()).unwrap();
        assert_eq!(
            packet.ipv4.unwrap().transport,
            Some(TransportHeader::Icmp { icmp_type: 8, code: 0 })
        );
    }

    #[test]
    fn test_decode_non_ipv4_frame() {
        let mut frame = ethernet(ethertype::ARP);
        frame.extend_from_slice(&[0u8; 28]);
        let packet = DecodedPacket::from_ethernet_frame(&frame, Instant::now()).unwrap();

        assert_eq!(packet.ether_type, ethertype::ARP);
        assert!(!packet.is_ipv4());
    }

    #[test]
    fn test_decode_broken_layers() {
        // IPv4 ether type but a truncated network header
        let mut frame = ethernet(ethertype::IPV4);
        frame.extend_from_slice(&[0x45, 0x00, 0x00]);
        let packet = DecodedPacket::from_ethernet_frame(&frame, Instant::now()).unwrap();
        assert!(packet.ipv4.is_none());

        // Valid IPv4 header, truncated TCP header
        let frame = ipv4_frame(6, [1, 1, 1, 1], [2, 2, 2, 2], &[0x00, 0x50]);
        let packet = DecodedPacket::from_ethernet_frame(&frame, Instant::now()).unwrap();
        assert!(packet.is_ipv4());
        assert!(packet.ipv4.unwrap().transport.is_none());

        // Unclassified protocol (GRE)
        let frame = ipv4_frame(47, [1, 1, 1, 1], [2, 2, 2, 2], &[0u8; 4]);
        let packet = DecodedPacket::from_ethernet_frame(&frame, Instant::now()).unwrap();
        assert!(packet.ipv4.unwrap().transport.is_none());
    }

    #[test]
    fn test_decode_short_frame() {
        let err = DecodedPacket::from_ethernet_frame(&[0u8; 6], Instant::now()).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
