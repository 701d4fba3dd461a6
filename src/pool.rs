//! Pool arithmetic and address availability.
//!
//! A [`PoolSnapshot`] is a pool together with the address records that can
//! block one of its addresses, read from the store in one go. All checks here
//! are pure functions of that snapshot.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};
use crate::models::{Address, DEFAULT_LEASE_SECONDS, Pool};

impl Pool {
    fn net(&self) -> Option<Ipv4Net> {
        Ipv4Net::new(self.start_address, self.netmask)
            .ok()
            .map(|net| net.trunc())
    }

    /// Checks the pool definition and derives `net_address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPool`] if the netmask is outside 1..=32, the
    /// range is reversed, or start and end fall in different networks.
    pub fn validate(&mut self) -> Result<()> {
        if !(1..=32).contains(&self.netmask) {
            return Err(Error::InvalidPool(format!(
                "{}: netmask /{} must be between 1 and 32",
                self.name, self.netmask
            )));
        }

        let prefix = |ip: Ipv4Addr| {
            Ipv4Net::new(ip, self.netmask)
                .map(|net| net.network())
                .map_err(|error| Error::InvalidPool(format!("{}: {}", self.name, error)))
        };
        let start = prefix(self.start_address)?;
        let end = prefix(self.end_address)?;

        if start != end {
            return Err(Error::InvalidPool(format!(
                "{}: {} and {} are not in the same /{} network",
                self.name, self.start_address, self.end_address, self.netmask
            )));
        }

        if u32::from(self.start_address) > u32::from(self.end_address) {
            return Err(Error::InvalidPool(format!(
                "{}: start {} is after end {}",
                self.name, self.start_address, self.end_address
            )));
        }

        self.net_address = start;
        Ok(())
    }

    /// Lease duration in seconds, falling back to one hour.
    pub fn lease_duration(&self) -> u32 {
        if self.lease_time == 0 {
            DEFAULT_LEASE_SECONDS
        } else {
            self.lease_time
        }
    }

    /// True iff `ip` is inside the network given by start address and netmask.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.net().is_some_and(|net| net.contains(&ip))
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.net()
            .map(|net| net.netmask())
            .unwrap_or(Ipv4Addr::BROADCAST)
    }

    /// Network address of the pool, computed from the start address.
    pub fn network(&self) -> Ipv4Addr {
        self.net()
            .map(|net| net.network())
            .unwrap_or(self.net_address)
    }

    /// Broadcast address of the pool network.
    pub fn last_addr(&self) -> Ipv4Addr {
        self.net()
            .map(|net| net.broadcast())
            .unwrap_or(Ipv4Addr::BROADCAST)
    }
}

/// A pool plus every record that can make one of its addresses unavailable.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub pool: Pool,
    /// Address records bound to this pool.
    pub addresses: Vec<Address>,
    /// Reserved, pending-reimage records from any pool.
    pub reservations: Vec<Address>,
}

impl PoolSnapshot {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.pool.contains(ip)
    }

    /// Fails if any other holder blocks `ip`, with no MAC excluded.
    ///
    /// Quarantined addresses (empty MAC, unexpired) are unavailable here.
    pub fn is_available(&self, ip: Ipv4Addr) -> Result<()> {
        self.check(ip, None)
    }

    /// Like [`is_available`](Self::is_available), but records owned by
    /// `mac` do not count against it.
    pub fn is_available_except(&self, ip: Ipv4Addr, mac: &str) -> Result<()> {
        self.check(ip, Some(mac))
    }

    fn check(&self, ip: Ipv4Addr, exclude: Option<&str>) -> Result<()> {
        if !self.pool.contains(ip) {
            return Err(Error::OutOfPool(ip));
        }

        if ip == self.pool.gateway {
            return Err(Error::GatewayAddress(ip));
        }

        let foreign = |address: &&Address| exclude != Some(address.mac.as_str());

        if let Some(holder) = self
            .addresses
            .iter()
            .filter(|address| address.ip == ip && !address.is_expired())
            .find(foreign)
        {
            return Err(Error::AlreadyLeased {
                ip,
                mac: holder.mac.clone(),
            });
        }

        if let Some(holder) = self
            .reservations
            .iter()
            .filter(|address| address.ip == ip && address.reserved && address.reimage)
            .find(foreign)
        {
            return Err(Error::AlreadyReserved {
                ip,
                mac: holder.mac.clone(),
            });
        }

        Ok(())
    }

    /// Lowest free address in `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressExhausted`] if every address is taken.
    pub fn next(&self) -> Result<Ipv4Addr> {
        let start = u32::from(self.pool.start_address);
        let end = u32::from(self.pool.end_address);

        (start..=end)
            .map(Ipv4Addr::from)
            .filter(|ip| !ip.is_multicast() && !ip.is_loopback() && !ip.is_unspecified())
            .find(|ip| self.is_available(*ip).is_ok())
            .ok_or_else(|| Error::AddressExhausted(self.pool.name.clone()))
    }

    pub fn last_addr(&self) -> Ipv4Addr {
        self.pool.last_addr()
    }
}
