//! # pxedhcp
//!
//! The DHCP engine of a bare-metal provisioning appliance: it answers booting
//! hosts on raw interfaces, hands out addresses from CIDR-bounded pools and
//! resolves per-scope DHCP options for their PXE boot.
//!
//! ## Features
//!
//! - DISCOVER/OFFER, REQUEST/ACK/NAK and DECLINE handling (RFC 2131)
//! - Raw Ethernet/IPv4/UDP framing on every configured interface
//! - Broadcast, unicast and relayed (giaddr, Option 82) sources
//! - Reservations, pending-reimage holds and only-reserved pools
//! - Stored options with global, pool, address and device-class precedence
//! - JSON-file persistence behind a [`Repository`] trait
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pxedhcp::{Config, DhcpServer, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> pxedhcp::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let store = Arc::new(MemoryStore::open(&config.database_file).await?);
//!     let server = DhcpServer::new(config, store);
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`codec`] - Stored option text to wire bytes
//! - [`resolve`] - Option precedence and synthesis
//! - [`pool`] / [`store`] - Pool arithmetic, availability and persistence
//! - [`Engine`] - The DHCP message state machine
//! - [`frame`] / [`DhcpServer`] - Raw frames in, replies out

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod models;
pub mod options;
pub mod packet;
pub mod pool;
pub mod resolve;
pub mod server;
pub mod store;

pub use config::{Config, InterfaceConfig};
pub use engine::Engine;
pub use error::{Error, Result};
pub use models::{Address, DeviceClass, Pool, StoredOption};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use pool::PoolSnapshot;
pub use server::DhcpServer;
pub use store::{MemoryStore, Repository};
