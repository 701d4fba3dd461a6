//! DHCP message parsing and encoding (RFC 2131).
//!
//! This is the UDP payload only. The Ethernet/IPv4/UDP framing around it
//! lives in [`crate::frame`].
//!
//! # Layout
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 1    | op                                     |
//! | 1      | 1    | htype                                  |
//! | 2      | 1    | hlen                                   |
//! | 3      | 1    | hops                                   |
//! | 4      | 4    | xid                                    |
//! | 8      | 2    | secs                                   |
//! | 10     | 2    | flags                                  |
//! | 12     | 16   | ciaddr, yiaddr, siaddr, giaddr         |
//! | 28     | 16   | chaddr                                 |
//! | 44     | 64   | sname (option space when overloaded)   |
//! | 108    | 128  | file (option space when overloaded)    |
//! | 236    | 4    | magic cookie 99.130.83.99              |
//! | 240    | ...  | options, terminated by End (255)       |

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode, OverloadFlag};

mod offset {
    pub const OP: usize = 0;
    pub const HTYPE: usize = 1;
    pub const HLEN: usize = 2;
    pub const HOPS: usize = 3;
    pub const XID: usize = 4;
    pub const SECS: usize = 8;
    pub const FLAGS: usize = 10;
    pub const CIADDR: usize = 12;
    pub const YIADDR: usize = 16;
    pub const SIADDR: usize = 20;
    pub const GIADDR: usize = 24;
    pub const CHADDR: usize = 28;
    pub const SNAME: usize = 44;
    pub const FILE: usize = 108;
    pub const COOKIE: usize = 236;
    pub const OPTIONS: usize = 240;
}

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Replies are padded to the BOOTP minimum so old relays forward them.
const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Relay loop guard (RFC 2131 §4.1).
const MAX_HOPS: u8 = 16;

/// Request options a reply carries back unchanged.
const ECHOED_OPTIONS: [OptionCode; 3] = [
    OptionCode::ClientIdentifier,
    OptionCode::Hostname,
    OptionCode::RelayAgentInfo,
];

/// BOOTP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet.
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet.
pub const HLEN_ETHERNET: u8 = 6;

/// A DHCP message, inbound request or outbound reply.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    /// [`BOOTREQUEST`] or [`BOOTREPLY`].
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    /// Incremented by each relay agent.
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    /// Bit 15 asks for a broadcast reply.
    pub flags: u16,
    /// Set by a client that already holds an address (renewing, rebinding).
    pub ciaddr: Ipv4Addr,
    /// The address being handed out.
    pub yiaddr: Ipv4Addr,
    /// Next-server address. PXE clients fetch their boot file from here
    /// when option 66 is absent.
    pub siaddr: Ipv4Addr,
    /// Relay agent address, zero for directly attached clients.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

fn read_addr(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut field = [0u8; N];
    field.copy_from_slice(&data[at..at + N]);
    field
}

/// Reads TLV options from one option area up to End or the area's end.
fn read_options(area: &[u8]) -> Result<Vec<DhcpOption>> {
    let mut options = Vec::new();
    let mut rest = area;

    while let [code, tail @ ..] = rest {
        if *code == OptionCode::Pad as u8 {
            rest = tail;
            continue;
        }
        if *code == OptionCode::End as u8 {
            break;
        }

        let [len, body @ ..] = tail else {
            return Err(Error::InvalidPacket(format!(
                "Option {} has no length",
                code
            )));
        };
        let len = usize::from(*len);
        if body.len() < len {
            return Err(Error::InvalidPacket(format!(
                "Option {} truncated: {} of {} bytes",
                code,
                body.len(),
                len
            )));
        }

        let (data, next) = body.split_at(len);
        options.push(DhcpOption::parse(*code, data)?);
        rest = next;
    }

    Ok(options)
}

impl DhcpPacket {
    /// Parses a DHCP message from a UDP payload.
    ///
    /// Options carried in `file` and `sname` (option 52) are appended after
    /// the main option area, `file` first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for a short packet, a wrong magic
    /// cookie, more than 16 hops, an Ethernet `hlen` other than 6 or a
    /// malformed option.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < offset::OPTIONS {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                offset::OPTIONS
            )));
        }

        if data[offset::COOKIE..offset::OPTIONS] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let hops = data[offset::HOPS];
        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        let (htype, hlen) = (data[offset::HTYPE], data[offset::HLEN]);
        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Invalid hlen {} for Ethernet (expected {})",
                hlen, HLEN_ETHERNET
            )));
        }

        let mut packet = Self {
            op: data[offset::OP],
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes(read_array(data, offset::XID)),
            secs: u16::from_be_bytes(read_array(data, offset::SECS)),
            flags: u16::from_be_bytes(read_array(data, offset::FLAGS)),
            ciaddr: read_addr(data, offset::CIADDR),
            yiaddr: read_addr(data, offset::YIADDR),
            siaddr: read_addr(data, offset::SIADDR),
            giaddr: read_addr(data, offset::GIADDR),
            chaddr: read_array(data, offset::CHADDR),
            sname: read_array(data, offset::SNAME),
            file: read_array(data, offset::FILE),
            options: read_options(&data[offset::OPTIONS..])?,
        };

        if let Some(flag) = packet.overload() {
            if matches!(flag, OverloadFlag::File | OverloadFlag::Both) {
                let extra = read_options(&packet.file)?;
                packet.options.extend(extra);
            }
            if matches!(flag, OverloadFlag::Sname | OverloadFlag::Both) {
                let extra = read_options(&packet.sname)?;
                packet.options.extend(extra);
            }
        }

        Ok(packet)
    }

    /// Encodes the message, End-terminated and padded to 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = vec![0u8; offset::OPTIONS];

        packet[offset::OP] = self.op;
        packet[offset::HTYPE] = self.htype;
        packet[offset::HLEN] = self.hlen;
        packet[offset::HOPS] = self.hops;
        packet[offset::XID..offset::SECS].copy_from_slice(&self.xid.to_be_bytes());
        packet[offset::SECS..offset::FLAGS].copy_from_slice(&self.secs.to_be_bytes());
        packet[offset::FLAGS..offset::CIADDR].copy_from_slice(&self.flags.to_be_bytes());

        for (at, addr) in [
            (offset::CIADDR, self.ciaddr),
            (offset::YIADDR, self.yiaddr),
            (offset::SIADDR, self.siaddr),
            (offset::GIADDR, self.giaddr),
        ] {
            packet[at..at + 4].copy_from_slice(&addr.octets());
        }

        packet[offset::CHADDR..offset::SNAME].copy_from_slice(&self.chaddr);
        packet[offset::SNAME..offset::FILE].copy_from_slice(&self.sname);
        packet[offset::FILE..offset::COOKIE].copy_from_slice(&self.file);
        packet[offset::COOKIE..offset::OPTIONS].copy_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }
        packet
    }

    fn find<'a, T>(&'a self, pick: impl Fn(&'a DhcpOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(pick)
    }

    fn overload(&self) -> Option<OverloadFlag> {
        self.find(|option| match option {
            DhcpOption::OptionOverload(flag) => Some(*flag),
            _ => None,
        })
    }

    /// Option 53. `None` for plain BOOTP.
    pub fn message_type(&self) -> Option<MessageType> {
        self.find(|option| match option {
            DhcpOption::MessageType(message_type) => Some(*message_type),
            _ => None,
        })
    }

    /// Option 50, the address a client asks for.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find(|option| match option {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Option 61.
    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.find(|option| match option {
            DhcpOption::ClientIdentifier(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    /// Option 82, added by relay agents.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.find(|option| match option {
            DhcpOption::RelayAgentInfo(info) => Some(info.as_slice()),
            _ => None,
        })
    }

    /// Option 12.
    pub fn hostname(&self) -> Option<&str> {
        self.find(|option| match option {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Option 55, the codes the client wants back, in its order.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.find(|option| match option {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    /// Option 60 as text. PXE firmware sends strings like
    /// `PXEClient:Arch:00007:UNDI:003016`.
    pub fn vendor_class(&self) -> Option<String> {
        self.find(|option| match option {
            DhcpOption::VendorClassIdentifier(data) => {
                Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => None,
        })
    }

    /// First option with `code`.
    pub fn option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|option| option.option_code() == code)
    }

    /// The first `hlen` bytes of chaddr as lowercase `aa:bb:...`.
    pub fn format_mac(&self) -> String {
        let len = usize::from(self.hlen).min(self.chaddr.len());
        self.chaddr[..len]
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Builds an OFFER, ACK or NAK answering `request`.
    ///
    /// The reply starts with option 53, then `options`. It keeps the
    /// request's xid, flags, giaddr and hardware address. Client-id,
    /// hostname and relay agent information from the request replace any
    /// option with the same code and go last.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut reply_options = Vec::with_capacity(options.len() + 1 + ECHOED_OPTIONS.len());
        reply_options.push(DhcpOption::MessageType(message_type));
        reply_options.extend(options);

        for code in ECHOED_OPTIONS.map(|code| code as u8) {
            if let Some(echoed) = request.option(code) {
                reply_options.retain(|option| option.option_code() != code);
                reply_options.push(echoed.clone());
            }
        }

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: reply_options,
        }
    }
}
