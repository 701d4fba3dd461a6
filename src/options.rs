//! DHCP options on the wire, as defined in RFC 2132.
//!
//! Each option has a code (1 byte), length (1 byte), and variable-length data.
//! The variants here cover what the engine reads from requests and what it
//! synthesizes itself. Everything else, including every option built from
//! stored configuration, travels as [`DhcpOption::Raw`].
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)
//! - RFC 3442: Classless Static Route Option (Option 121)

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Maximum number of IP addresses in a Router (3) option.
///
/// Options have a 1-byte length field, so maximum data is 255 bytes.
/// With 4 bytes per IPv4 address, that's 63 addresses maximum.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Longest payload a single option can carry.
pub const MAX_OPTION_LEN: usize = 255;

/// DHCP option codes the engine handles by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding (no operation). Used for alignment.
    Pad = 0,
    /// Subnet mask (RFC 2132 §3.3).
    SubnetMask = 1,
    /// Router/gateway addresses (RFC 2132 §3.5).
    Router = 3,
    /// Client hostname (RFC 2132 §3.14).
    Hostname = 12,
    /// Broadcast address (RFC 2132 §5.3).
    BroadcastAddress = 28,
    /// Requested IP address (RFC 2132 §9.1).
    RequestedIpAddress = 50,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    LeaseTime = 51,
    /// Option overload - indicates sname/file fields contain options (RFC 2132 §9.3).
    OptionOverload = 52,
    /// DHCP message type (RFC 2132 §9.6).
    MessageType = 53,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
    /// Parameter request list (RFC 2132 §9.8).
    ParameterRequestList = 55,
    /// Renewal time T1 (RFC 2132 §9.11).
    RenewalTime = 58,
    /// Rebinding time T2 (RFC 2132 §9.12).
    RebindingTime = 59,
    /// Vendor class identifier, e.g. "PXEClient:Arch:00007" (RFC 2132 §9.13).
    VendorClassIdentifier = 60,
    /// Client identifier (RFC 2132 §9.14).
    ClientIdentifier = 61,
    /// Relay agent information (RFC 3046).
    RelayAgentInfo = 82,
    /// Classless static route (RFC 3442).
    ClasslessStaticRoute = 121,
    /// End of options marker.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            12 => Ok(Self::Hostname),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            60 => Ok(Self::VendorClassIdentifier),
            61 => Ok(Self::ClientIdentifier),
            82 => Ok(Self::RelayAgentInfo),
            121 => Ok(Self::ClasslessStaticRoute),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with IP offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client releases IP address.
    Release = 7,
    /// Client requests config without IP allocation.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Option overload flags (Option 52) as defined in RFC 2132 §9.3.
///
/// Indicates that the `sname` and/or `file` fields in the DHCP packet
/// header contain DHCP options instead of their normal content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    /// The `file` field contains options.
    File = 1,
    /// The `sname` field contains options.
    Sname = 2,
    /// Both `file` and `sname` fields contain options.
    Both = 3,
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    /// Subnet mask (Option 1).
    SubnetMask(Ipv4Addr),
    /// Router/gateway addresses (Option 3). First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    /// Client hostname (Option 12).
    Hostname(String),
    /// Broadcast address (Option 28).
    BroadcastAddress(Ipv4Addr),
    /// Client's requested IP address (Option 50).
    RequestedIpAddress(Ipv4Addr),
    /// Lease time in seconds (Option 51).
    LeaseTime(u32),
    /// Indicates sname/file fields contain options (Option 52).
    OptionOverload(OverloadFlag),
    /// DHCP message type (Option 53).
    MessageType(MessageType),
    /// Server identifier - IP of the answering interface (Option 54).
    ServerIdentifier(Ipv4Addr),
    /// List of option codes the client wants (Option 55).
    ParameterRequestList(Vec<u8>),
    /// Renewal time T1 in seconds (Option 58).
    RenewalTime(u32),
    /// Rebinding time T2 in seconds (Option 59).
    RebindingTime(u32),
    /// Vendor class identifier (Option 60), kept as raw bytes.
    VendorClassIdentifier(Vec<u8>),
    /// Client identifier (Option 61).
    ClientIdentifier(Vec<u8>),
    /// Relay agent information (Option 82, RFC 3046).
    RelayAgentInfo(Vec<u8>),
    /// Any other option: raw code and payload.
    Raw(u8, Vec<u8>),
}

fn parse_ipv4(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    match data {
        [a, b, c, d] => Ok(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => Err(Error::InvalidPacket(format!("Invalid {} length", what))),
    }
}

fn parse_u32(data: &[u8], what: &str) -> Result<u32> {
    match data {
        [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(Error::InvalidPacket(format!("Invalid {} length", what))),
    }
}

fn tlv(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(MAX_OPTION_LEN);
    let mut result = Vec::with_capacity(len + 2);
    result.push(code);
    result.push(len as u8);
    result.extend_from_slice(&data[..len]);
    result
}

impl DhcpOption {
    /// Returns the RFC 2132 option code for this option.
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::Hostname(_) => OptionCode::Hostname as u8,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::OptionOverload(_) => OptionCode::OptionOverload as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::VendorClassIdentifier(_) => OptionCode::VendorClassIdentifier as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo as u8,
            Self::Raw(code, _) => *code,
        }
    }

    /// Parses a DHCP option from its code and raw data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length is invalid for
    /// the option type (e.g., subnet mask must be exactly 4 bytes).
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(parse_ipv4(data, "subnet mask")?)),
            Ok(OptionCode::Router) => {
                if !data.len().is_multiple_of(4) || data.is_empty() {
                    return Err(Error::InvalidPacket(
                        "Invalid router option length".to_string(),
                    ));
                }
                let routers = data
                    .chunks_exact(4)
                    .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
                    .collect();
                Ok(Self::Router(routers))
            }
            Ok(OptionCode::Hostname) => Ok(Self::Hostname(String::from_utf8_lossy(data).to_string())),
            Ok(OptionCode::BroadcastAddress) => Ok(Self::BroadcastAddress(parse_ipv4(
                data,
                "broadcast address",
            )?)),
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(parse_ipv4(
                data,
                "requested IP address",
            )?)),
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(parse_u32(data, "lease time")?)),
            Ok(OptionCode::OptionOverload) => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(
                        "Invalid option overload length".to_string(),
                    ));
                };
                let flag = OverloadFlag::try_from(*value).map_err(|value| {
                    Error::InvalidPacket(format!("Invalid option overload value: {}", value))
                })?;
                Ok(Self::OptionOverload(flag))
            }
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                };
                let msg_type = MessageType::try_from(*value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(msg_type))
            }
            Ok(OptionCode::ServerIdentifier) => Ok(Self::ServerIdentifier(parse_ipv4(
                data,
                "server identifier",
            )?)),
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::RenewalTime) => Ok(Self::RenewalTime(parse_u32(data, "renewal time")?)),
            Ok(OptionCode::RebindingTime) => {
                Ok(Self::RebindingTime(parse_u32(data, "rebinding time")?))
            }
            Ok(OptionCode::VendorClassIdentifier) => {
                Ok(Self::VendorClassIdentifier(data.to_vec()))
            }
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::RelayAgentInfo) => Ok(Self::RelayAgentInfo(data.to_vec())),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Ok(OptionCode::ClasslessStaticRoute) | Err(_) => Ok(Self::Raw(code, data.to_vec())),
        }
    }

    /// Encodes the option to its wire format (code + length + data).
    ///
    /// Payloads longer than 255 bytes are truncated.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => tlv(code, &addr.octets()),
            Self::Router(addrs) => {
                let data: Vec<u8> = addrs
                    .iter()
                    .take(MAX_ADDRESSES_PER_OPTION)
                    .flat_map(|addr| addr.octets())
                    .collect();
                tlv(code, &data)
            }
            Self::Hostname(name) => tlv(code, name.as_bytes()),
            Self::LeaseTime(time) | Self::RenewalTime(time) | Self::RebindingTime(time) => {
                tlv(code, &time.to_be_bytes())
            }
            Self::OptionOverload(flag) => tlv(code, &[*flag as u8]),
            Self::MessageType(msg_type) => tlv(code, &[*msg_type as u8]),
            Self::ParameterRequestList(data)
            | Self::VendorClassIdentifier(data)
            | Self::ClientIdentifier(data)
            | Self::RelayAgentInfo(data)
            | Self::Raw(_, data) => tlv(code, data),
        }
    }
}
