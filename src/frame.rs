//! Link-layer framing for DHCP on a raw interface.
//!
//! Inbound frames are peeled Ethernet → IPv4 → UDP → DHCP with `pnet`
//! packet views. Replies are built the other way round into one buffer,
//! with IPv4 and UDP checksums filled in.
//!
//! # Source Scope
//!
//! Every request is tagged with the address used to find its pool:
//!
//! | Scope     | Address                    | When                                   |
//! |-----------|----------------------------|----------------------------------------|
//! | broadcast | the interface address      | default                                |
//! | unicast   | the IPv4 source            | source set and outside the local net   |
//! | relayed   | giaddr                     | giaddr set (wins over unicast)         |

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::util::MacAddr;

use crate::error::{Error, Result};
use crate::packet::DhcpPacket;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// DSCP 4 with ECN 0, i.e. TOS byte 0x10 (low delay).
const REPLY_DSCP: u8 = 4;
const REPLY_TTL: u8 = 128;

/// A DHCP request together with the headers it arrived in.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub src_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub dhcp: DhcpPacket,
}

fn malformed(layer: &str) -> Error {
    Error::InvalidPacket(format!("Malformed {} header", layer))
}

/// Decodes an Ethernet frame carrying a DHCP message to the server port.
///
/// # Errors
///
/// Returns [`Error::InvalidPacket`] for anything that is not a well-formed
/// IPv4/UDP datagram to port 67 with a valid DHCP payload.
pub fn decode(frame: &[u8]) -> Result<InboundFrame> {
    let ethernet = EthernetPacket::new(frame).ok_or_else(|| malformed("Ethernet"))?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return Err(Error::InvalidPacket(format!(
            "Not IPv4 (ethertype {:#06x})",
            ethernet.get_ethertype().0
        )));
    }

    let ip_bytes = ethernet.payload();
    let ip = Ipv4Packet::new(ip_bytes).ok_or_else(|| malformed("IPv4"))?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    let total_len = usize::from(ip.get_total_length());
    if ip.get_version() != 4
        || header_len < IPV4_HEADER_LEN
        || total_len < header_len
        || total_len > ip_bytes.len()
    {
        return Err(malformed("IPv4"));
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return Err(Error::InvalidPacket("Not UDP".to_string()));
    }

    let udp_bytes = &ip_bytes[header_len..total_len];
    let datagram = UdpPacket::new(udp_bytes).ok_or_else(|| malformed("UDP"))?;
    let udp_len = usize::from(datagram.get_length());
    if udp_len < UDP_HEADER_LEN || udp_len > udp_bytes.len() {
        return Err(malformed("UDP"));
    }
    if datagram.get_destination() != DHCP_SERVER_PORT {
        return Err(Error::InvalidPacket(format!(
            "Not for the DHCP server port ({})",
            datagram.get_destination()
        )));
    }

    let dhcp = DhcpPacket::parse(&udp_bytes[UDP_HEADER_LEN..udp_len])?;

    Ok(InboundFrame {
        src_mac: ethernet.get_source(),
        src_ip: ip.get_source(),
        dst_ip: ip.get_destination(),
        src_port: datagram.get_source(),
        dst_port: datagram.get_destination(),
        dhcp,
    })
}

/// How a request reached this interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Broadcast,
    Unicast,
    Relayed,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Broadcast => "broadcast",
            Self::Unicast => "unicast",
            Self::Relayed => "relayed",
        };
        write!(f, "{}", name)
    }
}

/// The address used to select the pool for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceScope {
    pub ip: Ipv4Addr,
    pub kind: ScopeKind,
}

impl fmt::Display for SourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.ip)
    }
}

/// Picks the source scope for a request received on an interface with
/// address `interface_ip` in network `local_net`.
pub fn classify(
    interface_ip: Ipv4Addr,
    local_net: Option<Ipv4Net>,
    src_ip: Ipv4Addr,
    giaddr: Ipv4Addr,
) -> SourceScope {
    if !giaddr.is_unspecified() {
        return SourceScope {
            ip: giaddr,
            kind: ScopeKind::Relayed,
        };
    }

    let local = local_net.is_some_and(|net| net.contains(&src_ip));
    if !src_ip.is_unspecified() && !local {
        return SourceScope {
            ip: src_ip,
            kind: ScopeKind::Unicast,
        };
    }

    SourceScope {
        ip: interface_ip,
        kind: ScopeKind::Broadcast,
    }
}

/// Link, network and transport addresses of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyAddressing {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ReplyAddressing {
    /// Addresses a reply to `request`, sent from the interface.
    ///
    /// Clients without an address get a limited broadcast to the client
    /// port; everyone else is answered directly on the server port.
    pub fn for_request(
        request: &InboundFrame,
        interface_mac: MacAddr,
        interface_ip: Ipv4Addr,
    ) -> Self {
        let (dst_ip, dst_port) = if request.src_ip.is_unspecified() {
            (Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        } else {
            (request.src_ip, DHCP_SERVER_PORT)
        };

        Self {
            src_mac: interface_mac,
            dst_mac: request.src_mac,
            src_ip: interface_ip,
            dst_ip,
            src_port: DHCP_SERVER_PORT,
            dst_port,
        }
    }
}

/// Builds an Ethernet frame carrying `payload` as a UDP datagram.
pub fn encode(addressing: &ReplyAddressing, payload: &[u8]) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_len = IPV4_HEADER_LEN + udp_len;
    let ip_total = u16::try_from(ip_len)
        .map_err(|_| Error::InvalidPacket(format!("Reply too large ({} bytes)", ip_len)))?;

    let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + ip_len];

    {
        let mut datagram =
            MutableUdpPacket::new(&mut buffer[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..])
                .ok_or_else(|| malformed("UDP"))?;
        datagram.set_source(addressing.src_port);
        datagram.set_destination(addressing.dst_port);
        datagram.set_length(ip_total - IPV4_HEADER_LEN as u16);
        datagram.set_payload(payload);
        let checksum = udp::ipv4_checksum(
            &datagram.to_immutable(),
            &addressing.src_ip,
            &addressing.dst_ip,
        );
        datagram.set_checksum(checksum);
    }

    {
        let mut ip = MutableIpv4Packet::new(&mut buffer[ETHERNET_HEADER_LEN..])
            .ok_or_else(|| malformed("IPv4"))?;
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_dscp(REPLY_DSCP);
        ip.set_ecn(0);
        ip.set_total_length(ip_total);
        ip.set_identification(0);
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_fragment_offset(0);
        ip.set_ttl(REPLY_TTL);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(addressing.src_ip);
        ip.set_destination(addressing.dst_ip);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }

    {
        let mut ethernet =
            MutableEthernetPacket::new(&mut buffer).ok_or_else(|| malformed("Ethernet"))?;
        ethernet.set_destination(addressing.dst_mac);
        ethernet.set_source(addressing.src_mac);
        ethernet.set_ethertype(EtherTypes::Ipv4);
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DhcpOption, MessageType};
    use crate::packet::{BOOTREQUEST, HLEN_ETHERNET, HTYPE_ETHERNET};

    const CLIENT_MAC: MacAddr = MacAddr(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01);
    const SERVER_MAC: MacAddr = MacAddr(0x02, 0x00, 0x00, 0x00, 0x00, 0x02);
    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn discover() -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        DhcpPacket {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0xdead_beef,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![
                DhcpOption::MessageType(MessageType::Discover),
                DhcpOption::ClientIdentifier(vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]),
                DhcpOption::Hostname("esx-01".to_string()),
            ],
        }
    }

    fn client_frame(src_ip: Ipv4Addr, src_port: u16) -> Vec<u8> {
        let addressing = ReplyAddressing {
            src_mac: CLIENT_MAC,
            dst_mac: MacAddr::broadcast(),
            src_ip,
            dst_ip: Ipv4Addr::BROADCAST,
            src_port,
            dst_port: DHCP_SERVER_PORT,
        };
        encode(&addressing, &discover().encode()).unwrap()
    }

    #[test]
    fn test_decode_client_broadcast() {
        let frame = decode(&client_frame(Ipv4Addr::UNSPECIFIED, DHCP_CLIENT_PORT)).unwrap();
        assert_eq!(frame.src_mac, CLIENT_MAC);
        assert_eq!(frame.src_ip, Ipv4Addr::UNSPECIFIED);
        assert_eq!(frame.dst_ip, Ipv4Addr::BROADCAST);
        assert_eq!(frame.src_port, DHCP_CLIENT_PORT);
        assert_eq!(frame.dhcp.xid, 0xdead_beef);
        assert_eq!(frame.dhcp.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn test_decode_rejects_other_traffic() {
        let mut frame = client_frame(Ipv4Addr::UNSPECIFIED, DHCP_CLIENT_PORT);

        let mut arp = frame.clone();
        arp[12..14].copy_from_slice(&[0x08, 0x06]);
        assert!(decode(&arp).is_err());

        let mut tcp = frame.clone();
        tcp[ETHERNET_HEADER_LEN + 9] = 6;
        assert!(decode(&tcp).is_err());

        let mut client_port = frame.clone();
        let dst = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + 2;
        client_port[dst..dst + 2].copy_from_slice(&DHCP_CLIENT_PORT.to_be_bytes());
        assert!(decode(&client_port).is_err());

        frame.truncate(ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + 4);
        assert!(decode(&frame).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_reply_headers_and_checksums() {
        let request = decode(&client_frame(Ipv4Addr::UNSPECIFIED, DHCP_CLIENT_PORT)).unwrap();
        let addressing = ReplyAddressing::for_request(&request, SERVER_MAC, SERVER_IP);
        let bytes = encode(&addressing, b"payload").unwrap();

        let ethernet = EthernetPacket::new(&bytes).unwrap();
        assert_eq!(ethernet.get_destination(), CLIENT_MAC);
        assert_eq!(ethernet.get_source(), SERVER_MAC);

        let ip = Ipv4Packet::new(ethernet.payload()).unwrap();
        assert_eq!(ip.get_source(), SERVER_IP);
        assert_eq!(ip.get_destination(), Ipv4Addr::BROADCAST);
        assert_eq!(ip.get_ttl(), 128);
        assert_eq!((ip.get_dscp() << 2) | ip.get_ecn(), 0x10);
        assert_eq!(ip.get_flags(), Ipv4Flags::DontFragment);
        assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));

        let datagram = UdpPacket::new(ip.payload()).unwrap();
        assert_eq!(datagram.get_source(), DHCP_SERVER_PORT);
        assert_eq!(datagram.get_destination(), DHCP_CLIENT_PORT);
        assert_eq!(datagram.payload(), b"payload");
        assert_eq!(
            datagram.get_checksum(),
            udp::ipv4_checksum(&datagram, &SERVER_IP, &Ipv4Addr::BROADCAST)
        );
    }

    #[test]
    fn test_unicast_reply_uses_server_port() {
        let client = Ipv4Addr::new(10, 0, 0, 10);
        let request = decode(&client_frame(client, DHCP_SERVER_PORT)).unwrap();
        let addressing = ReplyAddressing::for_request(&request, SERVER_MAC, SERVER_IP);
        assert_eq!(addressing.dst_ip, client);
        assert_eq!(addressing.src_port, DHCP_SERVER_PORT);
        assert_eq!(addressing.dst_port, DHCP_SERVER_PORT);
    }

    #[test]
    fn test_classify_scope() {
        let local: Ipv4Net = "10.0.0.0/24".parse().unwrap();

        let broadcast = classify(
            SERVER_IP,
            Some(local),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
        );
        assert_eq!(broadcast.kind, ScopeKind::Broadcast);
        assert_eq!(broadcast.ip, SERVER_IP);

        let renewing = classify(
            SERVER_IP,
            Some(local),
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::UNSPECIFIED,
        );
        assert_eq!(renewing.kind, ScopeKind::Broadcast);

        let remote = Ipv4Addr::new(10, 5, 0, 10);
        let unicast = classify(SERVER_IP, Some(local), remote, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            unicast,
            SourceScope {
                ip: remote,
                kind: ScopeKind::Unicast
            }
        );

        let relay = Ipv4Addr::new(10, 7, 0, 1);
        let relayed = classify(SERVER_IP, Some(local), remote, relay);
        assert_eq!(
            relayed,
            SourceScope {
                ip: relay,
                kind: ScopeKind::Relayed
            }
        );
        assert_eq!(relayed.to_string(), "relayed 10.7.0.1");
    }
}
