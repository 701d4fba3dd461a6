use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

/// Smallest datagram every IPv4 host must accept (RFC 791).
const MIN_MTU: u16 = 576;

fn default_mtu() -> u16 {
    1500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub interfaces: Vec<InterfaceConfig>,
    pub database_file: String,
}

/// One interface to serve DHCP on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    /// Address to answer from. Discovered from the interface when unset.
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: vec![InterfaceConfig {
                name: "eth0".to_string(),
                address: None,
                mtu: default_mtu(),
            }],
            database_file: "pxedhcp.json".to_string(),
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one interface must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for interface in &self.interfaces {
            if interface.name.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "interface name must not be empty".to_string(),
                ));
            }

            if !names.insert(interface.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "interface {} is configured more than once",
                    interface.name
                )));
            }

            if interface.mtu < MIN_MTU {
                return Err(Error::InvalidConfig(format!(
                    "interface {}: mtu {} is below {}",
                    interface.name, interface.mtu, MIN_MTU
                )));
            }

            if let Some(address) = interface.address
                && (address.is_unspecified() || address.is_broadcast() || address.is_multicast())
            {
                return Err(Error::InvalidConfig(format!(
                    "interface {}: {} cannot be used as a server address",
                    interface.name, address
                )));
            }
        }

        if self.database_file.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "database_file must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
