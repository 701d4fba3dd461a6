//! Repository of pools, addresses, options and device classes.
//!
//! The engine only talks to the [`Repository`] trait. [`MemoryStore`] is
//! the implementation shipped with the binary: every record lives in memory
//! and the whole [`Database`] is written to a JSON file.
//!
//! # Thread Safety
//!
//! [`MemoryStore`] uses:
//! - [`RwLock`] for the records (allows concurrent reads)
//! - [`Mutex`] for file save operations (prevents corruption)
//!
//! Each repository call is atomic on its own. Callers that need several
//! calls to act as one (allocate-then-persist) serialize them themselves,
//! and rely on [`Record::conflicts_with`] to catch what slips through.

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::{Error, Result};
use crate::models::{Address, DeviceClass, Id, Pool, StoredOption};
use crate::pool::PoolSnapshot;

/// Minimum interval between database file saves (5 seconds).
///
/// Prevents excessive disk I/O when handling many requests. The dirty flag
/// is checked and cleared on each save.
const SAVE_INTERVAL_MILLIS: u128 = 5000;

/// Everything the store holds; also the on-disk JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub options: Vec<StoredOption>,
    #[serde(default)]
    pub device_classes: Vec<DeviceClass>,
}

/// A storable entity kind.
pub trait Record: Clone + Send + Sync + 'static {
    /// Human-readable kind, used in errors.
    const KIND: &'static str;

    fn id(&self) -> Id;

    fn set_id(&mut self, id: Id);

    /// Normalizes and validates before every write.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether storing `self` next to `other` would break a uniqueness rule.
    fn conflicts_with(&self, _other: &Self) -> bool {
        false
    }

    /// Human-readable unique key, used in conflict errors.
    fn key(&self) -> String {
        self.id().to_string()
    }

    fn rows(database: &Database) -> &Vec<Self>;

    fn rows_mut(database: &mut Database) -> &mut Vec<Self>;
}

impl Record for Pool {
    const KIND: &'static str = "pool";

    fn id(&self) -> Id {
        self.id
    }

    fn set_id(&mut self, id: Id) {
        self.id = id;
    }

    fn prepare(&mut self) -> Result<()> {
        self.validate()
    }

    fn rows(database: &Database) -> &Vec<Self> {
        &database.pools
    }

    fn rows_mut(database: &mut Database) -> &mut Vec<Self> {
        &mut database.pools
    }
}

impl Record for Address {
    const KIND: &'static str = "address";

    fn id(&self) -> Id {
        self.id
    }

    fn set_id(&mut self, id: Id) {
        self.id = id;
    }

    fn prepare(&mut self) -> Result<()> {
        self.mac = self.mac.to_lowercase().replace('-', ":");
        Ok(())
    }

    /// (ip, reserved) is unique.
    fn conflicts_with(&self, other: &Self) -> bool {
        self.ip == other.ip && self.reserved == other.reserved
    }

    fn key(&self) -> String {
        format!("{} (reserved={})", self.ip, self.reserved)
    }

    fn rows(database: &Database) -> &Vec<Self> {
        &database.addresses
    }

    fn rows_mut(database: &mut Database) -> &mut Vec<Self> {
        &mut database.addresses
    }
}

impl Record for StoredOption {
    const KIND: &'static str = "option";

    fn id(&self) -> Id {
        self.id
    }

    fn set_id(&mut self, id: Id) {
        self.id = id;
    }

    fn rows(database: &Database) -> &Vec<Self> {
        &database.options
    }

    fn rows_mut(database: &mut Database) -> &mut Vec<Self> {
        &mut database.options
    }
}

impl Record for DeviceClass {
    const KIND: &'static str = "device class";

    fn id(&self) -> Id {
        self.id
    }

    fn set_id(&mut self, id: Id) {
        self.id = id;
    }

    fn rows(database: &Database) -> &Vec<Self> {
        &database.device_classes
    }

    fn rows_mut(database: &mut Database) -> &mut Vec<Self> {
        &mut database.device_classes
    }
}

/// Persistence capability the DHCP engine is built on.
pub trait Repository: Send + Sync + 'static {
    /// All records of kind `T` accepted by `filter`, in id order.
    fn find<T, F>(&self, filter: F) -> impl Future<Output = Result<Vec<T>>> + Send
    where
        T: Record,
        F: Fn(&T) -> bool + Send;

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no record has that id.
    fn get<T: Record>(&self, id: Id) -> impl Future<Output = Result<T>> + Send;

    /// Inserts a record and returns it with its assigned id.
    fn create<T: Record>(&self, record: T) -> impl Future<Output = Result<T>> + Send;

    /// Replaces the record with the same id.
    fn save<T: Record>(&self, record: T) -> impl Future<Output = Result<T>> + Send;

    fn delete<T: Record>(&self, id: Id) -> impl Future<Output = Result<()>> + Send;

    /// Deletes stale (non-reserved, expired) records for `ip`, except `keep`.
    ///
    /// Returns the number of records removed.
    fn delete_stale_addresses(
        &self,
        ip: Ipv4Addr,
        keep: Id,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// First pool (by id) whose network contains `ip`, with its address
    /// records and every pending-reimage reservation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMatchingPool`] if no pool's network matches.
    fn find_pool(&self, ip: Ipv4Addr) -> impl Future<Output = Result<PoolSnapshot>> + Send {
        async move {
            let pool = self
                .find::<Pool, _>(move |pool| pool.contains(ip))
                .await?
                .into_iter()
                .next()
                .ok_or(Error::NoMatchingPool(ip))?;

            self.snapshot(pool).await
        }
    }

    /// `pool` with its address records and every pending-reimage reservation.
    fn snapshot(&self, pool: Pool) -> impl Future<Output = Result<PoolSnapshot>> + Send {
        async move {
            let pool_id = pool.id;
            let addresses = self
                .find::<Address, _>(move |address| address.pool_id == Some(pool_id))
                .await?;
            let reservations = self
                .find::<Address, _>(|address| address.reserved && address.reimage)
                .await?;

            Ok(PoolSnapshot {
                pool,
                addresses,
                reservations,
            })
        }
    }
}

/// Internal mutable state protected by RwLock.
#[derive(Debug)]
struct State {
    database: Database,
    next_id: Id,
    /// Whether state has changed since last save.
    dirty: bool,
    /// When state was last saved to disk.
    last_save: Instant,
}

impl State {
    fn new(database: Database) -> Self {
        let next_id = [
            database.pools.iter().map(|row| row.id).max(),
            database.addresses.iter().map(|row| row.id).max(),
            database.options.iter().map(|row| row.id).max(),
            database.device_classes.iter().map(|row| row.id).max(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
            + 1;

        Self {
            database,
            next_id,
            dirty: false,
            last_save: Instant::now(),
        }
    }

    fn check_unique<T: Record>(&self, record: &T) -> Result<()> {
        let clash = T::rows(&self.database)
            .iter()
            .any(|other| other.id() != record.id() && record.conflicts_with(other));
        if clash {
            return Err(Error::Conflict {
                kind: T::KIND,
                key: record.key(),
            });
        }
        Ok(())
    }
}

/// In-memory [`Repository`] with optional JSON-file persistence.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<State>,
    path: Option<PathBuf>,
    /// Mutex to prevent concurrent file writes.
    save_lock: Mutex<()>,
}

impl MemoryStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_database(Database::default(), None)
    }

    /// Opens the database file, or starts empty if it does not exist.
    ///
    /// Every pool is validated on load.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// holds an invalid pool.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut database = if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            serde_json::from_str::<Database>(&content)?
        } else {
            Database::default()
        };

        for pool in &mut database.pools {
            pool.validate()?;
        }

        info!(
            "Loaded {} pool(s), {} address(es), {} option(s) from {}",
            database.pools.len(),
            database.addresses.len(),
            database.options.len(),
            path.display()
        );

        Ok(Self::with_database(database, Some(path.to_path_buf())))
    }

    /// Wraps an existing database, persisting to `path` if given.
    pub fn with_database(database: Database, path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(State::new(database)),
            path,
            save_lock: Mutex::new(()),
        }
    }

    async fn maybe_save(&self, state: &mut State) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if state.dirty && state.last_save.elapsed().as_millis() >= SAVE_INTERVAL_MILLIS {
            let snapshot = state.database.clone();
            state.dirty = false;
            state.last_save = Instant::now();

            let _lock = self.save_lock.lock().await;
            let content = serde_json::to_string_pretty(&snapshot)?;
            tokio::fs::write(path, content).await?;
        }
        Ok(())
    }

    /// Forces an immediate save of the database to disk.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let state = self.state.read().await;
        let snapshot = state.database.clone();
        drop(state);

        let _lock = self.save_lock.lock().await;
        let content = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(path, content).await?;

        let mut state = self.state.write().await;
        state.dirty = false;
        state.last_save = Instant::now();

        Ok(())
    }

    /// Removes every stale address record and saves.
    ///
    /// Returns the number of records removed.
    pub async fn cleanup_stale_addresses(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.database.addresses.len();
        state.database.addresses.retain(|address| !address.is_stale());
        let count = before - state.database.addresses.len();

        if count > 0 {
            state.dirty = true;
            drop(state);
            self.flush().await?;
        }

        Ok(count)
    }
}

impl Repository for MemoryStore {
    async fn find<T, F>(&self, filter: F) -> Result<Vec<T>>
    where
        T: Record,
        F: Fn(&T) -> bool + Send,
    {
        let state = self.state.read().await;
        let mut rows: Vec<T> = T::rows(&state.database)
            .iter()
            .filter(|row| filter(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id());
        Ok(rows)
    }

    async fn get<T: Record>(&self, id: Id) -> Result<T> {
        let state = self.state.read().await;
        T::rows(&state.database)
            .iter()
            .find(|row| row.id() == id)
            .cloned()
            .ok_or(Error::NotFound { kind: T::KIND, id })
    }

    async fn create<T: Record>(&self, mut record: T) -> Result<T> {
        record.prepare()?;

        let mut state = self.state.write().await;
        record.set_id(state.next_id);
        state.check_unique(&record)?;

        state.next_id += 1;
        T::rows_mut(&mut state.database).push(record.clone());
        state.dirty = true;
        self.maybe_save(&mut state).await?;

        Ok(record)
    }

    async fn save<T: Record>(&self, mut record: T) -> Result<T> {
        record.prepare()?;

        let mut state = self.state.write().await;
        state.check_unique(&record)?;

        let id = record.id();
        let slot = T::rows_mut(&mut state.database)
            .iter_mut()
            .find(|row| row.id() == id)
            .ok_or(Error::NotFound { kind: T::KIND, id })?;
        *slot = record.clone();
        state.dirty = true;
        self.maybe_save(&mut state).await?;

        Ok(record)
    }

    async fn delete<T: Record>(&self, id: Id) -> Result<()> {
        let mut state = self.state.write().await;
        let rows = T::rows_mut(&mut state.database);
        let before = rows.len();
        rows.retain(|row| row.id() != id);
        if rows.len() == before {
            return Err(Error::NotFound { kind: T::KIND, id });
        }
        state.dirty = true;
        self.maybe_save(&mut state).await
    }

    async fn delete_stale_addresses(&self, ip: Ipv4Addr, keep: Id) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.database.addresses.len();
        state
            .database
            .addresses
            .retain(|address| address.id == keep || address.ip != ip || !address.is_stale());
        let count = before - state.database.addresses.len();
        if count > 0 {
            state.dirty = true;
            self.maybe_save(&mut state).await?;
        }
        Ok(count)
    }
}
