//! Persistent records shared by the engine, the store and the CLI.
//!
//! These mirror what the management surface writes: pools, address records
//! (leases and reservations), stored option values and device classes.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key type for every record. Zero means "not yet stored".
pub type Id = u64;

/// Lease duration used when a pool leaves it unset.
pub const DEFAULT_LEASE_SECONDS: u32 = 3600;

/// A contiguous IPv4 range belonging to exactly one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    #[serde(default)]
    pub id: Id,
    pub name: String,
    pub start_address: Ipv4Addr,
    pub end_address: Ipv4Addr,
    /// Prefix length, 1 to 32.
    pub netmask: u8,
    /// Derived from `start_address` and `netmask` by [`Pool::validate`].
    #[serde(default = "unspecified")]
    pub net_address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// Seconds. Zero means [`DEFAULT_LEASE_SECONDS`].
    #[serde(default)]
    pub lease_time: u32,
    /// Only answer MACs that hold a reservation.
    #[serde(default)]
    pub only_serve_reserved: bool,
    #[serde(default)]
    pub authorized_vlan: Option<u16>,
    #[serde(default)]
    pub managed_reference: Option<String>,
}

fn unspecified() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

/// One IPv4 address's assignment state: a lease, a reservation, or a
/// quarantine placeholder left behind by DECLINE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub id: Id,
    pub ip: Ipv4Addr,
    /// Lowercase colon-separated MAC. Empty for declined addresses.
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub hostname: String,
    /// Pre-registered; survives lease expiry.
    #[serde(default)]
    pub reserved: bool,
    /// Host is pending reimage; its reservation blocks other MACs.
    #[serde(default)]
    pub reimage: bool,
    /// `None` until a reservation is matched to a pool.
    #[serde(default)]
    pub pool_id: Option<Id>,
    #[serde(default)]
    pub group_id: Option<Id>,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen_relay: Option<Ipv4Addr>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    /// Comma-separated option codes the client asked for but did not get.
    #[serde(default)]
    pub missing_options: String,
}

impl Address {
    /// A fresh, unsaved record for a first-time client.
    pub fn new(ip: Ipv4Addr, mac: impl Into<String>) -> Self {
        Self {
            id: 0,
            ip,
            mac: mac.into(),
            hostname: "-".to_string(),
            reserved: false,
            reimage: false,
            pool_id: None,
            group_id: None,
            first_seen: None,
            last_seen: None,
            last_seen_relay: None,
            expires: None,
            missing_options: String::new(),
        }
    }

    /// Returns true if the record has no expiry or it lies in the past.
    pub fn is_expired(&self) -> bool {
        self.expires.is_none_or(|expires| expires <= Utc::now())
    }

    /// A non-reserved record past its expiry; safe to reuse or delete.
    pub fn is_stale(&self) -> bool {
        !self.reserved && self.is_expired()
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        self.expires
            .map(|expires| (expires - Utc::now()).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// Precedence of a stored option, from least to most specific.
///
/// When several rows target the same op-code only the rows at the highest
/// level survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionLevel {
    Global,
    Pool,
    Address,
    GlobalClass,
    PoolClass,
    AddressClass,
}

/// A single DHCP option value as configured by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOption {
    #[serde(default)]
    pub id: Id,
    pub op_code: u8,
    /// Text form of the value, interpreted per op-code by [`crate::codec`].
    pub data: String,
    /// Orders rows sharing a code; lower sorts first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub pool_id: Option<Id>,
    #[serde(default)]
    pub address_id: Option<Id>,
    #[serde(default)]
    pub device_class_id: Option<Id>,
}

impl StoredOption {
    pub fn level(&self) -> OptionLevel {
        match (self.device_class_id.is_some(), self.address_id, self.pool_id) {
            (false, None, None) => OptionLevel::Global,
            (false, None, Some(_)) => OptionLevel::Pool,
            (false, Some(_), _) => OptionLevel::Address,
            (true, None, None) => OptionLevel::GlobalClass,
            (true, None, Some(_)) => OptionLevel::PoolClass,
            (true, Some(_), _) => OptionLevel::AddressClass,
        }
    }

    /// Whether this row is in scope for a request answered from `pool_id`,
    /// for the lease `address_id`, by a client of `device_class_id`.
    pub fn applies_to(
        &self,
        pool_id: Id,
        address_id: Option<Id>,
        device_class_id: Option<Id>,
    ) -> bool {
        let global = self.pool_id.is_none() && self.address_id.is_none();
        let scoped = global
            || self.pool_id == Some(pool_id)
            || (self.address_id.is_some() && self.address_id == address_id);
        let classed =
            self.device_class_id.is_none() || self.device_class_id == device_class_id;
        scoped && classed
    }
}

/// A named vendor-class matcher (e.g. a PXE architecture string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClass {
    #[serde(default)]
    pub id: Id,
    pub name: String,
    pub vendor_class: String,
}

impl DeviceClass {
    /// Substring match against the client's option 60. An empty pattern
    /// matches nothing.
    pub fn matches(&self, vendor_class: &str) -> bool {
        !self.vendor_class.is_empty() && vendor_class.contains(&self.vendor_class)
    }
}
