//! Per-request DHCP option resolution.
//!
//! Stored option rows are filtered to the request's scope and shadowed by
//! level. The surviving rows are then laid out in the order the client asked
//! for them. Well-known options without a stored value are synthesized from
//! the pool.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::codec;
use crate::models::{Id, Pool, StoredOption};
use crate::options::{DhcpOption, OptionCode};

/// Codes every reply carries whether or not the client asked for them.
const ALWAYS_SENT: [u8; 4] = [
    OptionCode::RenewalTime as u8,
    OptionCode::RebindingTime as u8,
    OptionCode::LeaseTime as u8,
    OptionCode::ServerIdentifier as u8,
];

/// Who is asking and who is answering.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub pool: &'a Pool,
    /// The client's address record, once it has one.
    pub address_id: Option<Id>,
    pub device_class_id: Option<Id>,
    /// The answering interface address.
    pub server_ip: Ipv4Addr,
}

/// Options for one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub options: Vec<DhcpOption>,
    /// Requested codes that could not be supplied, ascending.
    pub missing: Vec<u8>,
}

impl Resolved {
    /// `missing` as stored on the address record, e.g. `"42,150"`.
    pub fn missing_list(&self) -> String {
        self.missing
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Groups in-scope rows by op-code, keeping only the most specific level of
/// each group, sorted by priority.
fn shadow(rows: &[StoredOption], scope: &Scope) -> BTreeMap<u8, Vec<StoredOption>> {
    let mut groups: BTreeMap<u8, Vec<StoredOption>> = BTreeMap::new();
    for row in rows
        .iter()
        .filter(|row| row.applies_to(scope.pool.id, scope.address_id, scope.device_class_id))
    {
        groups.entry(row.op_code).or_default().push(row.clone());
    }

    for group in groups.values_mut() {
        if let Some(top) = group.iter().map(StoredOption::level).max() {
            group.retain(|row| row.level() == top);
        }
        group.sort_by_key(|row| (row.priority, row.id));
    }

    groups
}

fn synthesize(code: u8, scope: &Scope) -> Option<DhcpOption> {
    let pool = scope.pool;
    let lease = pool.lease_duration();

    let option = match OptionCode::try_from(code).ok()? {
        OptionCode::SubnetMask => DhcpOption::SubnetMask(pool.subnet_mask()),
        OptionCode::ClasslessStaticRoute => {
            let significant = usize::from(pool.netmask).div_ceil(8);
            let mut route = vec![pool.netmask];
            route.extend_from_slice(&pool.network().octets()[..significant]);
            route.extend_from_slice(&pool.gateway.octets());
            DhcpOption::Raw(code, route)
        }
        OptionCode::Router => DhcpOption::Router(vec![pool.gateway]),
        OptionCode::BroadcastAddress => DhcpOption::BroadcastAddress(pool.last_addr()),
        OptionCode::RenewalTime => DhcpOption::RenewalTime(lease / 2),
        OptionCode::RebindingTime => {
            DhcpOption::RebindingTime((u64::from(lease) * 7 / 8) as u32)
        }
        OptionCode::LeaseTime => DhcpOption::LeaseTime(lease),
        OptionCode::ServerIdentifier => DhcpOption::ServerIdentifier(scope.server_ip),
        _ => return None,
    };

    Some(option)
}

/// Resolves the reply options for `scope`.
///
/// `rows` is every stored option; `requested` is the client's parameter
/// request list (option 55), possibly empty.
pub fn resolve(rows: &[StoredOption], scope: &Scope, requested: &[u8]) -> Resolved {
    let mut groups = shadow(rows, scope);

    let mut order: Vec<u8> = Vec::with_capacity(requested.len() + ALWAYS_SENT.len());
    for &code in requested.iter().chain(ALWAYS_SENT.iter()) {
        if code != OptionCode::Pad as u8 && code != OptionCode::End as u8 && !order.contains(&code)
        {
            order.push(code);
        }
    }

    let mut resolved = Resolved::default();

    for code in order {
        if let Some(group) = groups.remove(&code) {
            match codec::encode(code, &group) {
                Ok(option) => resolved.options.push(option),
                Err(e) => {
                    warn!("Skipping option {}: {}", code, e);
                    resolved.missing.push(code);
                }
            }
            continue;
        }

        match synthesize(code, scope) {
            Some(option) => resolved.options.push(option),
            None => {
                debug!("No value for requested option {}", code);
                resolved.missing.push(code);
            }
        }
    }

    for (code, group) in groups {
        match codec::encode(code, &group) {
            Ok(option) => resolved.options.push(option),
            Err(e) => warn!("Skipping option {}: {}", code, e),
        }
    }

    resolved.missing.sort_unstable();
    resolved
}
