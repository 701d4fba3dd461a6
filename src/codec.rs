//! Wire encoding for operator-configured option values.
//!
//! Stored options keep their value as text. The op-code decides how that
//! text becomes option bytes, through a fixed table of [`OptionKind`]s.
//! Codes missing from the table are rejected with
//! [`Error::UnsupportedOption`].

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::StoredOption;
use crate::options::{DhcpOption, MAX_OPTION_LEN};

/// Wire representation of an option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Raw bytes of a string (hostname, domain name, boot file, ...).
    Text,
    /// One IPv4 address.
    Ip,
    /// Repeated IPv4 addresses, one per stored row.
    IpList,
    /// Big-endian u16.
    U16,
    /// Repeated big-endian u16, one per stored row.
    U16List,
    /// Big-endian signed 32-bit (time offset).
    I32,
    /// Big-endian unsigned 32-bit (timers).
    U32,
}

impl OptionKind {
    /// Looks up the kind for an op-code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedOption`] for codes with no known kind.
    pub fn of(code: u8) -> Result<Self> {
        match code {
            // host name, merit dump, domain name, root path, extensions path,
            // NIS domain, NetBIOS scope, X font server, X display manager,
            // message, domain search, SIP servers, TFTP server, boot file
            12 | 14 | 15 | 17 | 18 | 40 | 47 | 48 | 49 | 56 | 119 | 120 | 66 | 67 => {
                Ok(Self::Text)
            }
            // subnet mask, broadcast address, router solicitation address
            1 | 28 | 32 => Ok(Self::Ip),
            3..=11 | 16 | 41 | 42 | 44 | 45 => Ok(Self::IpList),
            // boot file size, max reassembly, interface MTU, max message size
            13 | 22 | 26 | 57 => Ok(Self::U16),
            // path MTU plateau table
            25 => Ok(Self::U16List),
            // time offset
            2 => Ok(Self::I32),
            // T1, T2, lease time, PMTU aging, ARP cache timeout, keepalive
            58 | 59 | 51 | 24 | 35 | 38 => Ok(Self::U32),
            other => Err(Error::UnsupportedOption(other)),
        }
    }

    /// List kinds merge every stored row into one option.
    pub fn is_list(self) -> bool {
        matches!(self, Self::IpList | Self::U16List)
    }
}

/// A typed option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Text(String),
    Ip(Ipv4Addr),
    IpList(Vec<Ipv4Addr>),
    U16(u16),
    U16List(Vec<u16>),
    I32(i32),
    U32(u32),
}

fn parse_text<T: FromStr>(code: u8, text: &str) -> Result<T> {
    text.trim().parse().map_err(|_| Error::InvalidOptionValue {
        code,
        value: text.to_string(),
    })
}

fn invalid_length(code: u8, len: usize) -> Error {
    Error::InvalidPacket(format!("Invalid length {} for option {}", len, code))
}

impl OptionValue {
    /// Builds the value for `code` from stored row values.
    ///
    /// Rows must already be in priority order. List kinds take every row;
    /// scalar kinds take the first.
    pub fn from_rows<'a>(code: u8, rows: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let kind = OptionKind::of(code)?;
        let mut rows = rows.into_iter().peekable();
        let first = *rows.peek().ok_or_else(|| Error::InvalidOptionValue {
            code,
            value: String::new(),
        })?;

        let value = match kind {
            OptionKind::Text => Self::Text(first.to_string()),
            OptionKind::Ip => Self::Ip(parse_text(code, first)?),
            OptionKind::IpList => Self::IpList(
                rows.map(|row| parse_text(code, row))
                    .collect::<Result<_>>()?,
            ),
            OptionKind::U16 => Self::U16(parse_text(code, first)?),
            OptionKind::U16List => Self::U16List(
                rows.map(|row| parse_text(code, row))
                    .collect::<Result<_>>()?,
            ),
            OptionKind::I32 => Self::I32(parse_text(code, first)?),
            OptionKind::U32 => Self::U32(parse_text(code, first)?),
        };

        Ok(value)
    }

    /// Option payload bytes (without code and length).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Ip(ip) => ip.octets().to_vec(),
            Self::IpList(ips) => ips.iter().flat_map(|ip| ip.octets()).collect(),
            Self::U16(value) => value.to_be_bytes().to_vec(),
            Self::U16List(values) => values.iter().flat_map(|value| value.to_be_bytes()).collect(),
            Self::I32(value) => value.to_be_bytes().to_vec(),
            Self::U32(value) => value.to_be_bytes().to_vec(),
        }
    }

    /// Interprets an option payload according to the kind of `code`.
    pub fn decode(code: u8, data: &[u8]) -> Result<Self> {
        let kind = OptionKind::of(code)?;
        let value = match kind {
            OptionKind::Text => Self::Text(String::from_utf8_lossy(data).into_owned()),
            OptionKind::Ip => {
                let octets: [u8; 4] = data
                    .try_into()
                    .map_err(|_| invalid_length(code, data.len()))?;
                Self::Ip(Ipv4Addr::from(octets))
            }
            OptionKind::IpList => {
                if data.is_empty() || !data.len().is_multiple_of(4) {
                    return Err(invalid_length(code, data.len()));
                }
                Self::IpList(
                    data.chunks_exact(4)
                        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
                        .collect(),
                )
            }
            OptionKind::U16 => {
                let bytes: [u8; 2] = data
                    .try_into()
                    .map_err(|_| invalid_length(code, data.len()))?;
                Self::U16(u16::from_be_bytes(bytes))
            }
            OptionKind::U16List => {
                if data.is_empty() || !data.len().is_multiple_of(2) {
                    return Err(invalid_length(code, data.len()));
                }
                Self::U16List(
                    data.chunks_exact(2)
                        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                        .collect(),
                )
            }
            OptionKind::I32 => {
                let bytes: [u8; 4] = data
                    .try_into()
                    .map_err(|_| invalid_length(code, data.len()))?;
                Self::I32(i32::from_be_bytes(bytes))
            }
            OptionKind::U32 => {
                let bytes: [u8; 4] = data
                    .try_into()
                    .map_err(|_| invalid_length(code, data.len()))?;
                Self::U32(u32::from_be_bytes(bytes))
            }
        };
        Ok(value)
    }
}

/// Encodes stored rows sharing one op-code into a wire option.
///
/// `rows` must be sorted by priority.
///
/// # Errors
///
/// [`Error::UnsupportedOption`] for unknown codes, [`Error::InvalidOptionValue`]
/// for data that does not parse or does not fit in one option.
pub fn encode(code: u8, rows: &[StoredOption]) -> Result<DhcpOption> {
    let value = OptionValue::from_rows(code, rows.iter().map(|row| row.data.as_str()))?;
    let bytes = value.to_bytes();
    if bytes.len() > MAX_OPTION_LEN {
        return Err(Error::InvalidOptionValue {
            code,
            value: format!("{} bytes", bytes.len()),
        });
    }
    Ok(DhcpOption::Raw(code, bytes))
}
