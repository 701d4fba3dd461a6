//! Error types for the DHCP engine and pool allocator.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

/// Errors that can occur while serving DHCP.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or database files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame or DHCP packet received.
    ///
    /// This includes truncated Ethernet/IPv4/UDP layers, packets that are too
    /// short, invalid magic cookies, invalid option lengths, or other
    /// protocol violations.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Every address in the pool range is leased, reserved or quarantined.
    #[error("No available IP addresses in pool {0}")]
    AddressExhausted(String),

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pool definition rejected on create/update.
    #[error("Invalid pool: {0}")]
    InvalidPool(String),

    /// Raw socket creation, read or write error.
    ///
    /// Typically occurs when opening a link-layer channel without
    /// CAP_NET_RAW.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A configured interface does not exist or has no usable address.
    #[error("Interface error: {0}")]
    Interface(String),

    /// No pool's network contains the request's source scope.
    #[error("No pool matches network of {0}")]
    NoMatchingPool(Ipv4Addr),

    /// The address lies outside the pool's network.
    #[error("Address {0} is outside the pool network")]
    OutOfPool(Ipv4Addr),

    /// The address is the pool's gateway.
    #[error("Address {0} is the pool gateway")]
    GatewayAddress(Ipv4Addr),

    /// The address holds an unexpired lease for another MAC.
    #[error("Address {ip} is leased to {mac}")]
    AlreadyLeased { ip: Ipv4Addr, mac: String },

    /// The address is reserved for another MAC pending reimage.
    #[error("Address {ip} is reserved for {mac}")]
    AlreadyReserved { ip: Ipv4Addr, mac: String },

    /// The op-code has no known wire representation.
    #[error("Unsupported option type for code {0}")]
    UnsupportedOption(u8),

    /// Stored option data could not be interpreted for its kind.
    #[error("Invalid value {value:?} for option {code}")]
    InvalidOptionValue { code: u8, value: String },

    /// A write violated a uniqueness constraint.
    ///
    /// Retryable: the caller should re-read state and re-drive the operation.
    #[error("Conflicting {kind} record: {key}")]
    Conflict { kind: &'static str, key: String },

    /// No record of the given kind exists with that id.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
