//! DHCP message handling.
//!
//! [`Engine::handle`] turns one inbound request into at most one reply. It
//! reads and writes through a [`Repository`] and never touches the network;
//! the listener in [`crate::server`] owns framing and transmission.
//!
//! # Message Flow
//!
//! ```text
//! Client                  Engine
//!   |                        |
//!   |------ DISCOVER ------->|  find pool, pick candidate or Next()
//!   |<------ OFFER ----------|
//!   |                        |
//!   |------ REQUEST -------->|  check, stamp and persist the lease
//!   |<------ ACK/NAK --------|
//!   |                        |
//!   |------ DECLINE -------->|  quarantine the address, no reply
//! ```

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{Address, DeviceClass, Id, Pool, StoredOption};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::pool::PoolSnapshot;
use crate::resolve::{Resolved, Scope, resolve};
use crate::store::Repository;

/// A REQUEST is re-evaluated this many times when the store reports a
/// uniqueness conflict.
const MAX_REQUEST_ATTEMPTS: usize = 3;

/// The DHCP protocol engine.
pub struct Engine<R: Repository> {
    repo: Arc<R>,
    /// Serializes check-and-persist sequences per pool.
    pool_locks: Mutex<HashMap<Id, Arc<Mutex<()>>>>,
}

impl<R: Repository> Engine<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            pool_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handles one request.
    ///
    /// `scope_ip` selects the pool (interface, unicast source or relay
    /// address); `server_ip` is the answering interface address.
    ///
    /// Returns `Ok(None)` when no reply should be sent.
    ///
    /// # Errors
    ///
    /// Lookup and store failures, e.g. [`Error::NoMatchingPool`] or
    /// [`Error::AddressExhausted`]. The request should be dropped.
    pub async fn handle(
        &self,
        packet: &DhcpPacket,
        scope_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
    ) -> Result<Option<DhcpPacket>> {
        let mac = packet.format_mac();

        if packet.op != BOOTREQUEST {
            debug!("Ignoring non-request op {} from {}", packet.op, mac);
            return Ok(None);
        }

        match packet.message_type() {
            Some(MessageType::Discover) => self.discover(packet, &mac, scope_ip, server_ip).await,
            Some(MessageType::Request) => self.request(packet, &mac, scope_ip, server_ip).await,
            Some(MessageType::Decline) => self.decline(packet, &mac, scope_ip).await,
            Some(other) => {
                info!("Ignoring {} from {}", other, mac);
                Ok(None)
            }
            None => {
                info!("Ignoring message without type from {}", mac);
                Ok(None)
            }
        }
    }

    async fn pool_lock(&self, pool_id: Id) -> Arc<Mutex<()>> {
        let mut locks = self.pool_locks.lock().await;
        Arc::clone(locks.entry(pool_id).or_default())
    }

    /// Unbound reservations first, then the pool's own records.
    async fn candidates(&self, snapshot: &PoolSnapshot) -> Result<Vec<Address>> {
        let mut candidates = self
            .repo
            .find::<Address, _>(|address| address.reserved && address.pool_id.is_none())
            .await?;
        candidates.extend(snapshot.addresses.iter().cloned());
        Ok(candidates)
    }

    async fn device_class(&self, packet: &DhcpPacket) -> Result<Option<Id>> {
        let Some(vendor_class) = packet.vendor_class() else {
            return Ok(None);
        };

        let classes = self
            .repo
            .find::<DeviceClass, _>(move |class| class.matches(&vendor_class))
            .await?;
        Ok(classes.first().map(|class| class.id))
    }

    async fn options(
        &self,
        packet: &DhcpPacket,
        pool: &Pool,
        address_id: Option<Id>,
        server_ip: Ipv4Addr,
    ) -> Result<Resolved> {
        let device_class_id = self.device_class(packet).await?;
        let rows = self.repo.find::<StoredOption, _>(|_| true).await?;
        let scope = Scope {
            pool,
            address_id,
            device_class_id,
            server_ip,
        };
        Ok(resolve(
            &rows,
            &scope,
            packet.parameter_request_list().unwrap_or(&[]),
        ))
    }

    async fn discover(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        scope_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
    ) -> Result<Option<DhcpPacket>> {
        let snapshot = self.repo.find_pool(scope_ip).await?;

        let lease = self.candidates(&snapshot).await?.into_iter().find(|candidate| {
            candidate.mac == mac
                && snapshot.contains(candidate.ip)
                && snapshot.is_available_except(candidate.ip, mac).is_ok()
        });

        if snapshot.pool.only_serve_reserved && !lease.as_ref().is_some_and(|lease| lease.reserved)
        {
            info!(
                "Ignoring DISCOVER from {}: pool {} only serves reservations",
                mac, snapshot.pool.name
            );
            return Ok(None);
        }

        let offered_ip = match &lease {
            Some(lease) => lease.ip,
            None => snapshot.next()?,
        };

        let resolved = self
            .options(
                packet,
                &snapshot.pool,
                lease.as_ref().map(|lease| lease.id),
                server_ip,
            )
            .await?;

        info!("OFFER {} to {} from pool {}", offered_ip, mac, snapshot.pool.name);

        Ok(Some(DhcpPacket::create_reply(
            packet,
            MessageType::Offer,
            offered_ip,
            server_ip,
            resolved.options,
        )))
    }

    async fn request(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        scope_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
    ) -> Result<Option<DhcpPacket>> {
        let pool_id = self.repo.find_pool(scope_ip).await?.pool.id;
        let lock = self.pool_lock(pool_id).await;
        let _guard = lock.lock().await;

        let mut attempt = 1;
        loop {
            match self.try_request(packet, mac, scope_ip, server_ip).await {
                Err(Error::Conflict { kind, key }) if attempt < MAX_REQUEST_ATTEMPTS => {
                    warn!(
                        "Conflict on {} {} while serving {}, retrying (attempt {})",
                        kind, key, mac, attempt
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_request(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        scope_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
    ) -> Result<Option<DhcpPacket>> {
        let snapshot = self.repo.find_pool(scope_ip).await?;
        let requested = packet.requested_ip().unwrap_or(packet.ciaddr);

        let mut lease: Option<Address> = None;
        for candidate in self.candidates(&snapshot).await? {
            if candidate.mac != mac {
                continue;
            }

            if candidate.ip != requested
                && (candidate.reserved || !candidate.is_expired())
                && snapshot.contains(candidate.ip)
                && snapshot.is_available_except(candidate.ip, mac).is_ok()
            {
                return Ok(Some(nak(
                    packet,
                    mac,
                    server_ip,
                    &format!("wrong ip requested ({} holds {})", mac, candidate.ip),
                )));
            }

            if candidate.reserved && !snapshot.contains(candidate.ip) {
                continue;
            }

            if lease.is_none() || candidate.ip == requested {
                lease = Some(candidate);
            }
        }

        if lease.as_ref().is_none_or(|lease| lease.ip != requested)
            && let Err(error) = snapshot.is_available(requested)
        {
            return Ok(Some(nak(
                packet,
                mac,
                server_ip,
                &format!("{} not available: {}", requested, error),
            )));
        }

        if lease.is_some()
            && let Err(error) = snapshot.is_available_except(requested, mac)
        {
            return Ok(Some(nak(
                packet,
                mac,
                server_ip,
                &format!("{} used by someone else: {}", requested, error),
            )));
        }

        if snapshot.pool.only_serve_reserved && !lease.as_ref().is_some_and(|lease| lease.reserved)
        {
            info!(
                "Ignoring REQUEST from {}: pool {} only serves reservations",
                mac, snapshot.pool.name
            );
            return Ok(None);
        }

        let mut lease = lease.unwrap_or_else(|| Address::new(requested, mac));
        if let Some(hostname) = packet.hostname() {
            lease.hostname = hostname.to_string();
        }

        let pool = &snapshot.pool;
        let resolved = self
            .options(packet, pool, (lease.id != 0).then_some(lease.id), server_ip)
            .await?;

        let now = Utc::now();
        lease.mac = mac.to_string();
        lease.ip = requested;
        lease.pool_id = Some(pool.id);
        lease.last_seen_relay = (!packet.giaddr.is_unspecified()).then_some(packet.giaddr);
        lease.first_seen.get_or_insert(now);
        lease.last_seen = Some(now);
        lease.expires = Some(now + TimeDelta::seconds(i64::from(pool.lease_duration())));
        lease.missing_options = resolved.missing_list();

        self.repo.delete_stale_addresses(requested, lease.id).await?;
        let lease = if lease.id == 0 {
            self.repo.create(lease).await?
        } else {
            self.repo.save(lease).await?
        };

        info!(
            "ACK {} to {} (lease: {} seconds)",
            requested,
            mac,
            lease.remaining_seconds()
        );

        Ok(Some(DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            requested,
            server_ip,
            resolved.options,
        )))
    }

    async fn decline(
        &self,
        packet: &DhcpPacket,
        mac: &str,
        scope_ip: Ipv4Addr,
    ) -> Result<Option<DhcpPacket>> {
        let Some(declined_ip) = packet.requested_ip() else {
            warn!("DECLINE from {} without a requested address", mac);
            return Ok(None);
        };

        let pool_id = self.repo.find_pool(scope_ip).await?.pool.id;
        let lock = self.pool_lock(pool_id).await;
        let _guard = lock.lock().await;

        let snapshot = self.repo.find_pool(scope_ip).await?;
        let pool = &snapshot.pool;

        let mut record = snapshot
            .addresses
            .iter()
            .find(|address| address.ip == declined_ip && !address.reserved)
            .cloned()
            .unwrap_or_else(|| Address::new(declined_ip, ""));

        let now = Utc::now();
        let expires = now + TimeDelta::seconds(i64::from(pool.lease_duration()));
        record.mac.clear();
        record.pool_id = Some(pool.id);
        record.last_seen_relay = (!packet.giaddr.is_unspecified()).then_some(packet.giaddr);
        record.last_seen = Some(now);
        record.expires = Some(expires);

        self.repo
            .delete_stale_addresses(declined_ip, record.id)
            .await?;
        if record.id == 0 {
            self.repo.create(record).await?;
        } else {
            self.repo.save(record).await?;
        }

        warn!(
            "DECLINE from {} for {}: quarantined until {}",
            mac, declined_ip, expires
        );

        Ok(None)
    }
}

fn nak(packet: &DhcpPacket, mac: &str, server_ip: Ipv4Addr, reason: &str) -> DhcpPacket {
    warn!("NAK to {}: {}", mac, reason);

    DhcpPacket::create_reply(
        packet,
        MessageType::Nak,
        Ipv4Addr::UNSPECIFIED,
        server_ip,
        vec![DhcpOption::ServerIdentifier(server_ip)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{BOOTREPLY, HLEN_ETHERNET, HTYPE_ETHERNET};
    use crate::store::MemoryStore;

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn mac(last: u8) -> String {
        format!("aa:bb:cc:dd:ee:{:02x}", last)
    }

    fn packet(message_type: MessageType, last: u8, options: Vec<DhcpOption>) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, last]);

        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);

        DhcpPacket {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0x1234_5678,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: all_options,
        }
    }

    fn pool(name: &str, third: u8, only_serve_reserved: bool) -> Pool {
        Pool {
            id: 0,
            name: name.to_string(),
            start_address: Ipv4Addr::new(10, 0, third, 10),
            end_address: Ipv4Addr::new(10, 0, third, 20),
            netmask: 24,
            net_address: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::new(10, 0, third, 1),
            lease_time: 3600,
            only_serve_reserved,
            authorized_vlan: None,
            managed_reference: None,
        }
    }

    async fn setup(only_serve_reserved: bool) -> (Engine<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::in_memory());
        store
            .create(pool("rack-a", 0, only_serve_reserved))
            .await
            .unwrap();
        (Engine::new(Arc::clone(&store)), store)
    }

    async fn lease(store: &MemoryStore, ip: [u8; 4], last: u8, ttl: i64) -> Address {
        let mut address = Address::new(Ipv4Addr::from(ip), mac(last));
        address.pool_id = Some(1);
        address.expires = Some(Utc::now() + TimeDelta::seconds(ttl));
        store.create(address).await.unwrap()
    }

    async fn reservation(store: &MemoryStore, ip: [u8; 4], last: u8) -> Address {
        let mut address = Address::new(Ipv4Addr::from(ip), mac(last));
        address.reserved = true;
        store.create(address).await.unwrap()
    }

    async fn address_for(store: &MemoryStore, ip: [u8; 4]) -> Address {
        let ip = Ipv4Addr::from(ip);
        store
            .find::<Address, _>(move |address| address.ip == ip)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
    }

    #[tokio::test]
    async fn test_discover_offers_first_free_address() {
        let (engine, _) = setup(false).await;

        let reply = engine
            .handle(&packet(MessageType::Discover, 1, vec![]), SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.op, BOOTREPLY);
        assert_eq!(reply.message_type(), Some(MessageType::Offer));
        assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(reply.xid, 0x1234_5678);
        assert!(
            reply
                .options
                .contains(&DhcpOption::ServerIdentifier(SERVER_IP))
        );
        assert!(reply.options.contains(&DhcpOption::LeaseTime(3600)));
    }

    #[tokio::test]
    async fn test_request_for_leased_address_is_naked() {
        let (engine, store) = setup(false).await;
        lease(&store, [10, 0, 0, 12], 1, 3600).await;

        let request = packet(
            MessageType::Request,
            2,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 12))],
        );
        let reply = engine
            .handle(&request, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.message_type(), Some(MessageType::Nak));
        assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(address_for(&store, [10, 0, 0, 12]).await.mac, mac(1));
    }

    #[tokio::test]
    async fn test_unbound_reservation_is_offered() {
        let (engine, store) = setup(true).await;
        reservation(&store, [10, 0, 0, 15], 3).await;

        let reply = engine
            .handle(&packet(MessageType::Discover, 3, vec![]), SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.message_type(), Some(MessageType::Offer));
        assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 0, 0, 15));
    }

    #[tokio::test]
    async fn test_only_serve_reserved_ignores_unknown_mac() {
        let (engine, store) = setup(true).await;
        reservation(&store, [10, 0, 0, 15], 3).await;

        let discover = engine
            .handle(&packet(MessageType::Discover, 4, vec![]), SERVER_IP, SERVER_IP)
            .await
            .unwrap();
        assert!(discover.is_none());

        let request = packet(
            MessageType::Request,
            4,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 11))],
        );
        assert!(
            engine
                .handle(&request, SERVER_IP, SERVER_IP)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .find::<Address, _>(|address| !address.reserved)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_decline_quarantines_address() {
        let (engine, store) = setup(false).await;
        let declined = lease(&store, [10, 0, 0, 10], 1, 60).await;

        let decline = packet(
            MessageType::Decline,
            1,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 10))],
        );
        let reply = engine.handle(&decline, SERVER_IP, SERVER_IP).await.unwrap();
        assert!(reply.is_none());

        let record: Address = store.get(declined.id).await.unwrap();
        assert!(record.mac.is_empty());
        let remaining = record.remaining_seconds();
        assert!((3590..=3600).contains(&remaining), "remaining {}", remaining);

        let next = engine
            .handle(&packet(MessageType::Discover, 2, vec![]), SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.yiaddr, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[tokio::test]
    async fn test_decline_without_record_creates_placeholder() {
        let (engine, store) = setup(false).await;

        let decline = packet(
            MessageType::Decline,
            1,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 13))],
        );
        assert!(
            engine
                .handle(&decline, SERVER_IP, SERVER_IP)
                .await
                .unwrap()
                .is_none()
        );

        let record = address_for(&store, [10, 0, 0, 13]).await;
        assert!(record.mac.is_empty());
        assert_eq!(record.pool_id, Some(1));
        assert!(!record.is_expired());

        let without_ip = packet(MessageType::Decline, 1, vec![]);
        assert!(
            engine
                .handle(&without_ip, SERVER_IP, SERVER_IP)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_full_exchange_persists_lease() {
        let (engine, store) = setup(false).await;

        let offer = engine
            .handle(&packet(MessageType::Discover, 1, vec![]), SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();

        let request = packet(
            MessageType::Request,
            1,
            vec![
                DhcpOption::RequestedIpAddress(offer.yiaddr),
                DhcpOption::Hostname("esx-01".to_string()),
                DhcpOption::ParameterRequestList(vec![1, 3, 150]),
            ],
        );
        let ack = engine
            .handle(&request, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(ack.options[1], DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)));

        let record = address_for(&store, [10, 0, 0, 10]).await;
        assert_eq!(record.mac, mac(1));
        assert_eq!(record.hostname, "esx-01");
        assert_eq!(record.pool_id, Some(1));
        assert_eq!(record.missing_options, "150");
        assert!(record.first_seen.is_some());
        assert!(record.remaining_seconds() > 3500);

        // renewal keeps the same record
        let renewed = engine
            .handle(&request, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.message_type(), Some(MessageType::Ack));
        assert_eq!(store.find::<Address, _>(|_| true).await.unwrap().len(), 1);

        let other = engine
            .handle(&packet(MessageType::Discover, 2, vec![]), SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.yiaddr, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[tokio::test]
    async fn test_renewal_updates_hostname() {
        let (engine, store) = setup(false).await;
        let requested = DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 10));

        let first = packet(
            MessageType::Request,
            1,
            vec![requested.clone(), DhcpOption::Hostname("installer".to_string())],
        );
        engine.handle(&first, SERVER_IP, SERVER_IP).await.unwrap().unwrap();
        assert_eq!(address_for(&store, [10, 0, 0, 10]).await.hostname, "installer");

        let second = packet(
            MessageType::Request,
            1,
            vec![requested.clone(), DhcpOption::Hostname("esx-01".to_string())],
        );
        let ack = engine
            .handle(&second, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(address_for(&store, [10, 0, 0, 10]).await.hostname, "esx-01");

        // no option 12 keeps the stored name
        let third = packet(MessageType::Request, 1, vec![requested]);
        engine.handle(&third, SERVER_IP, SERVER_IP).await.unwrap().unwrap();
        let record = address_for(&store, [10, 0, 0, 10]).await;
        assert_eq!(record.hostname, "esx-01");
        assert_eq!(store.find::<Address, _>(|_| true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_request_binds_reservation_to_pool() {
        let (engine, store) = setup(false).await;
        let reserved = reservation(&store, [10, 0, 0, 15], 3).await;

        let request = packet(
            MessageType::Request,
            3,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 15))],
        );
        let ack = engine
            .handle(&request, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));

        let record: Address = store.get(reserved.id).await.unwrap();
        assert!(record.reserved);
        assert_eq!(record.pool_id, Some(1));
    }

    #[tokio::test]
    async fn test_request_for_other_ip_while_holding_lease() {
        let (engine, store) = setup(false).await;
        lease(&store, [10, 0, 0, 10], 1, 3600).await;

        let request = packet(
            MessageType::Request,
            1,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 11))],
        );
        let reply = engine
            .handle(&request, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn test_request_outside_pool_is_naked() {
        let (engine, _) = setup(false).await;

        let request = packet(
            MessageType::Request,
            1,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 9, 0, 10))],
        );
        let reply = engine
            .handle(&request, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));
        assert_eq!(
            reply.options,
            vec![
                DhcpOption::MessageType(MessageType::Nak),
                DhcpOption::ServerIdentifier(SERVER_IP),
            ]
        );
    }

    #[tokio::test]
    async fn test_request_falls_back_to_ciaddr() {
        let (engine, store) = setup(false).await;

        let mut request = packet(MessageType::Request, 1, vec![]);
        request.ciaddr = Ipv4Addr::new(10, 0, 0, 14);
        let reply = engine
            .handle(&request, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.message_type(), Some(MessageType::Ack));
        assert_eq!(address_for(&store, [10, 0, 0, 14]).await.mac, mac(1));
    }

    #[tokio::test]
    async fn test_relayed_request_uses_relay_pool() {
        let (engine, store) = setup(false).await;
        store.create(pool("rack-b", 1, false)).await.unwrap();

        let relay = Ipv4Addr::new(10, 0, 1, 1);
        let mut discover = packet(MessageType::Discover, 1, vec![]);
        discover.giaddr = relay;
        let offer = engine
            .handle(&discover, relay, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 1, 10));
        assert_eq!(offer.giaddr, relay);

        let mut request = packet(
            MessageType::Request,
            1,
            vec![DhcpOption::RequestedIpAddress(offer.yiaddr)],
        );
        request.giaddr = relay;
        engine
            .handle(&request, relay, SERVER_IP)
            .await
            .unwrap()
            .unwrap();

        let record = address_for(&store, [10, 0, 1, 10]).await;
        assert_eq!(record.pool_id, Some(2));
        assert_eq!(record.last_seen_relay, Some(relay));
    }

    #[tokio::test]
    async fn test_no_matching_pool_is_an_error() {
        let (engine, _) = setup(false).await;
        let result = engine
            .handle(
                &packet(MessageType::Discover, 1, vec![]),
                Ipv4Addr::new(192, 168, 1, 1),
                SERVER_IP,
            )
            .await;
        assert!(matches!(result, Err(Error::NoMatchingPool(_))));
    }

    #[tokio::test]
    async fn test_ignored_messages() {
        let (engine, store) = setup(false).await;

        for message_type in [
            MessageType::Release,
            MessageType::Inform,
            MessageType::Offer,
            MessageType::Ack,
            MessageType::Nak,
        ] {
            let reply = engine
                .handle(&packet(message_type, 1, vec![]), SERVER_IP, SERVER_IP)
                .await
                .unwrap();
            assert!(reply.is_none(), "{} was answered", message_type);
        }

        let mut untyped = packet(MessageType::Discover, 1, vec![]);
        untyped.options.clear();
        assert!(
            engine
                .handle(&untyped, SERVER_IP, SERVER_IP)
                .await
                .unwrap()
                .is_none()
        );

        let mut reply = packet(MessageType::Discover, 1, vec![]);
        reply.op = BOOTREPLY;
        assert!(
            engine
                .handle(&reply, SERVER_IP, SERVER_IP)
                .await
                .unwrap()
                .is_none()
        );

        assert!(store.find::<Address, _>(|_| true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stored_options_follow_precedence() {
        let (engine, store) = setup(false).await;
        for (data, pool_id) in [("1.1.1.1", None), ("8.8.8.8", Some(1))] {
            store
                .create(StoredOption {
                    id: 0,
                    op_code: 6,
                    data: data.to_string(),
                    priority: 0,
                    pool_id,
                    address_id: None,
                    device_class_id: None,
                })
                .await
                .unwrap();
        }

        let discover = packet(
            MessageType::Discover,
            1,
            vec![DhcpOption::ParameterRequestList(vec![6])],
        );
        let offer = engine
            .handle(&discover, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        let dns: Vec<_> = offer
            .options
            .iter()
            .filter(|option| option.option_code() == 6)
            .collect();
        assert_eq!(dns, vec![&DhcpOption::Raw(6, vec![8, 8, 8, 8])]);
    }

    #[tokio::test]
    async fn test_device_class_selects_boot_file() {
        let (engine, store) = setup(false).await;
        let uefi = store
            .create(DeviceClass {
                id: 0,
                name: "uefi-x64".to_string(),
                vendor_class: "Arch:00007".to_string(),
            })
            .await
            .unwrap();
        for (data, device_class_id) in [("pxelinux.0", None), ("bootx64.efi", Some(uefi.id))] {
            store
                .create(StoredOption {
                    id: 0,
                    op_code: 67,
                    data: data.to_string(),
                    priority: 0,
                    pool_id: None,
                    address_id: None,
                    device_class_id,
                })
                .await
                .unwrap();
        }

        let boot_file = |reply: &DhcpPacket| reply.option(67).cloned();

        let bios = engine
            .handle(&packet(MessageType::Discover, 1, vec![]), SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            boot_file(&bios),
            Some(DhcpOption::Raw(67, b"pxelinux.0".to_vec()))
        );

        let discover = packet(
            MessageType::Discover,
            1,
            vec![DhcpOption::VendorClassIdentifier(
                b"PXEClient:Arch:00007:UNDI:003016".to_vec(),
            )],
        );
        let efi = engine
            .handle(&discover, SERVER_IP, SERVER_IP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            boot_file(&efi),
            Some(DhcpOption::Raw(67, b"bootx64.efi".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_same_address() {
        let (engine, store) = setup(false).await;
        let requested = Ipv4Addr::new(10, 0, 0, 10);

        let first = packet(
            MessageType::Request,
            1,
            vec![DhcpOption::RequestedIpAddress(requested)],
        );
        let second = packet(
            MessageType::Request,
            2,
            vec![DhcpOption::RequestedIpAddress(requested)],
        );

        let (a, b) = tokio::join!(
            engine.handle(&first, SERVER_IP, SERVER_IP),
            engine.handle(&second, SERVER_IP, SERVER_IP)
        );
        let types = [a.unwrap().unwrap(), b.unwrap().unwrap()].map(|reply| reply.message_type());
        assert!(types.contains(&Some(MessageType::Ack)));
        assert!(types.contains(&Some(MessageType::Nak)));
        assert_eq!(store.find::<Address, _>(|_| true).await.unwrap().len(), 1);
    }
}
