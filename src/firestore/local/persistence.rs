//! Transaction runner over the key-value store, plus the primary lease that
//! decides which of several clients sharing the store talks to the backend.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::firestore::core::types::ListenSequenceNumber;
use crate::firestore::error::{failed_precondition, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::kv_store::{KeyRange, KvStore, KvTransaction, Table};
use crate::firestore::local::local_serializer::{self, DbClientMetadata, DbOwner, DbSchemaVersion};
use crate::firestore::local::{remote_document_cache, target_cache};
use crate::firestore::model::Timestamp;
use crate::firestore::util::{AsyncQueue, BackoffSettings, DelayedOperation, ExponentialBackoff, TimerId};
use crate::platform::runtime;

pub const CLIENT_METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(4);
pub const PRIMARY_LEASE_MAX_AGE: Duration = Duration::from_secs(5);
pub const CLIENT_METADATA_MAX_AGE: Duration = Duration::from_secs(30 * 60);
pub const STORAGE_TRANSACTION_MAX_ATTEMPTS: usize = 3;
pub const SCHEMA_VERSION: u32 = 2;

const PRIMARY_LEASE_LOST_MESSAGE: &str =
    "The client lost its primary lease and cannot run this operation";
const PRIMARY_LEASE_EXCLUSIVE_MESSAGE: &str =
    "Another client holds the primary lease and does not allow multi-tab access";

const OWNER_KEY: &[u8] = b"owner";
const SCHEMA_VERSION_KEY: &[u8] = b"version";

/// True for the error a primary-only transaction fails with once the lease
/// has moved to another client.
pub fn is_primary_lease_lost(error: &FirestoreError) -> bool {
    error.code == FirestoreErrorCode::FailedPrecondition
        && error.message() == PRIMARY_LEASE_LOST_MESSAGE
}

/// Storage access a transaction needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, and only while this client holds the primary lease.
    ReadWritePrimary,
}

/// Client ids that shut down and must not be treated as lease holders, even
/// while their lease record has not expired yet. Shared by every client of a
/// store and updated synchronously, outside of storage transactions.
#[derive(Clone, Debug, Default)]
pub struct ZombieRegistry {
    zombies: Arc<StdMutex<BTreeSet<String>>>,
}

impl ZombieRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_zombied(&self, client_id: &str) {
        self.zombies.lock().unwrap().insert(client_id.to_string());
    }

    pub fn remove(&self, client_id: &str) {
        self.zombies.lock().unwrap().remove(client_id);
    }

    pub fn is_zombied(&self, client_id: &str) -> bool {
        self.zombies.lock().unwrap().contains(client_id)
    }
}

#[derive(Clone, Debug)]
pub struct PersistenceSettings {
    pub client_id: String,
    /// Allows other clients to share the store.
    pub multi_tab: bool,
    pub zombie_registry: ZombieRegistry,
    pub refresh_interval: Duration,
    pub lease_max_age: Duration,
    pub client_metadata_max_age: Duration,
}

impl PersistenceSettings {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            multi_tab: false,
            zombie_registry: ZombieRegistry::new(),
            refresh_interval: CLIENT_METADATA_REFRESH_INTERVAL,
            lease_max_age: PRIMARY_LEASE_MAX_AGE,
            client_metadata_max_age: CLIENT_METADATA_MAX_AGE,
        }
    }

    pub fn with_multi_tab(mut self, multi_tab: bool) -> Self {
        self.multi_tab = multi_tab;
        self
    }

    pub fn with_zombie_registry(mut self, registry: ZombieRegistry) -> Self {
        self.zombie_registry = registry;
        self
    }
}

/// Called with the new value whenever this client gains or loses the lease.
pub type PrimaryStateListener =
    Arc<dyn Fn(bool) -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

/// A storage transaction handed to persistence components.
pub struct PersistenceTransaction<'a> {
    kv: Box<dyn KvTransaction + 'a>,
    mode: TransactionMode,
    sequence_number: Option<ListenSequenceNumber>,
}

impl<'a> PersistenceTransaction<'a> {
    pub(crate) fn new(kv: Box<dyn KvTransaction + 'a>, mode: TransactionMode) -> Self {
        Self {
            kv,
            mode,
            sequence_number: None,
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// The listen sequence number of this transaction, allocated on first use.
    pub fn current_sequence_number(&mut self) -> FirestoreResult<ListenSequenceNumber> {
        if let Some(sequence_number) = self.sequence_number {
            return Ok(sequence_number);
        }
        if self.mode == TransactionMode::ReadOnly {
            return Err(internal_error(
                "Read-only transactions have no sequence number",
            ));
        }
        let sequence_number = target_cache::allocate_sequence_number(self)?;
        self.sequence_number = Some(sequence_number);
        Ok(sequence_number)
    }

    pub fn get(&mut self, table: Table, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        self.kv.get(table, key)
    }

    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) -> FirestoreResult<()> {
        self.ensure_writable()?;
        self.kv.put(table, key, value)
    }

    pub fn delete(&mut self, table: Table, key: &[u8]) -> FirestoreResult<()> {
        self.ensure_writable()?;
        self.kv.delete(table, key)
    }

    pub fn scan(&mut self, table: Table, range: KeyRange) -> FirestoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.kv.scan(table, range)
    }

    fn ensure_writable(&self) -> FirestoreResult<()> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(internal_error("Write in a read-only transaction"));
        }
        Ok(())
    }

    pub(crate) fn commit(self) -> FirestoreResult<()> {
        self.kv.commit()
    }
}

struct PersistenceState {
    started: bool,
    is_primary: bool,
    network_enabled: bool,
    primary_listener: Option<PrimaryStateListener>,
    refresh_op: Option<DelayedOperation>,
}

pub struct Persistence {
    store: Arc<dyn KvStore>,
    settings: PersistenceSettings,
    queue: AsyncQueue,
    state: StdMutex<PersistenceState>,
}

impl Persistence {
    pub fn new(store: Arc<dyn KvStore>, settings: PersistenceSettings, queue: AsyncQueue) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            queue,
            state: StdMutex::new(PersistenceState {
                started: false,
                is_primary: false,
                network_enabled: true,
                primary_listener: None,
                refresh_op: None,
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    pub fn is_primary(&self) -> bool {
        self.state.lock().unwrap().is_primary
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    /// Migrates the schema, takes the lease if possible and starts the
    /// periodic metadata refresh.
    pub async fn start(self: &Arc<Self>) -> FirestoreResult<()> {
        self.run_transaction("Run schema migration", TransactionMode::ReadWrite, |txn| {
            run_schema_migration(txn)
        })
        .await?;

        self.update_client_metadata_and_try_become_primary().await?;
        if !self.settings.multi_tab && !self.is_primary() {
            return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_MESSAGE));
        }
        self.state.lock().unwrap().started = true;
        self.schedule_client_metadata_refresh();
        Ok(())
    }

    /// Registers `listener` and immediately reports the current state to it.
    pub async fn set_primary_state_listener(&self, listener: PrimaryStateListener) -> FirestoreResult<()> {
        let is_primary = {
            let mut state = self.state.lock().unwrap();
            state.primary_listener = Some(Arc::clone(&listener));
            state.is_primary
        };
        listener(is_primary).await
    }

    /// Records whether this client may use the network. Clients with the
    /// network disabled only take the lease when no other client can.
    pub async fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = state.network_enabled != enabled;
            state.network_enabled = enabled;
            changed && state.started
        };
        if changed {
            self.update_client_metadata_and_try_become_primary().await?;
        }
        Ok(())
    }

    /// Writes this client's metadata and acquires, extends or releases the
    /// primary lease, notifying the primary state listener on a change.
    pub async fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<()> {
        let outcome = self
            .run_transaction("Update client metadata", TransactionMode::ReadWrite, |txn| {
                self.write_client_metadata(txn)?;
                let can_act_as_primary = self.can_act_as_primary(txn)?;
                if can_act_as_primary {
                    self.acquire_or_extend_lease(txn)?;
                } else {
                    self.release_lease_if_held(txn)?;
                }
                if can_act_as_primary {
                    self.remove_stale_client_metadata(txn)?;
                }
                Ok(can_act_as_primary)
            })
            .await;

        let is_primary = match outcome {
            Ok(is_primary) => is_primary,
            Err(err) if err.is_storage_transaction() => {
                log::debug!("Failed to extend owner lease: {err}");
                return Ok(());
            }
            Err(err) if !self.settings.multi_tab => return Err(err),
            Err(err) => {
                log::debug!("Releasing owner lease after error during lease refresh: {err}");
                false
            }
        };
        self.update_primary_state(is_primary).await
    }

    /// Gives up the lease and removes this client's metadata.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.settings
            .zombie_registry
            .mark_zombied(&self.settings.client_id);
        let refresh_op = {
            let mut state = self.state.lock().unwrap();
            state.started = false;
            state.is_primary = false;
            state.refresh_op.take()
        };
        if let Some(op) = refresh_op {
            op.cancel();
        }
        self.run_transaction("Shutdown", TransactionMode::ReadWrite, |txn| {
            self.release_lease_if_held(txn)?;
            txn.delete(Table::ClientMetadata, self.settings.client_id.as_bytes())
        })
        .await?;
        self.settings
            .zombie_registry
            .remove(&self.settings.client_id);
        Ok(())
    }

    /// Runs `action` in one storage transaction and commits it.
    ///
    /// Storage transaction failures are retried with backoff up to
    /// [`STORAGE_TRANSACTION_MAX_ATTEMPTS`] times; other errors abort at once.
    /// `action` may run more than once, so it must not have side effects
    /// outside the transaction.
    pub async fn run_transaction<T, F>(
        &self,
        action: &str,
        mode: TransactionMode,
        mut f: F,
    ) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T> + Send,
        T: Send,
    {
        let mut backoff = ExponentialBackoff::new(
            BackoffSettings::default()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(500)),
        );
        let mut attempt = 1;
        loop {
            match self.try_transaction(mode, &mut f) {
                Err(err) if err.is_storage_transaction() && attempt < STORAGE_TRANSACTION_MAX_ATTEMPTS => {
                    log::warn!("Transaction '{action}' failed (attempt {attempt}): {err}");
                    attempt += 1;
                    runtime::sleep(backoff.next_delay()).await;
                }
                Err(err) if is_primary_lease_lost(&err) => {
                    self.handle_lease_lost();
                    return Err(err);
                }
                outcome => return outcome,
            }
        }
    }

    fn try_transaction<T, F>(&self, mode: TransactionMode, f: &mut F) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let kv = self.store.begin()?;
        let mut txn = PersistenceTransaction::new(kv, mode);
        if mode == TransactionMode::ReadWritePrimary {
            if !self.verify_primary_lease(&mut txn)? {
                return Err(failed_precondition(PRIMARY_LEASE_LOST_MESSAGE));
            }
            self.acquire_or_extend_lease(&mut txn)?;
        }
        let result = f(&mut txn)?;
        txn.commit()?;
        Ok(result)
    }

    fn handle_lease_lost(&self) {
        let listener = {
            let mut state = self.state.lock().unwrap();
            if !state.is_primary {
                return;
            }
            state.is_primary = false;
            state.primary_listener.clone()
        };
        log::debug!("Client {} lost its primary lease", self.settings.client_id);
        if let Some(listener) = listener {
            self.queue.enqueue_and_forget(move || listener(false));
        }
    }

    async fn update_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let listener = {
            let mut state = self.state.lock().unwrap();
            if state.is_primary == is_primary {
                return Ok(());
            }
            state.is_primary = is_primary;
            state.primary_listener.clone()
        };
        if is_primary {
            log::debug!("Client {} acquired the primary lease", self.settings.client_id);
        } else {
            log::debug!("Client {} released the primary lease", self.settings.client_id);
        }
        match listener {
            Some(listener) => listener(is_primary).await,
            None => Ok(()),
        }
    }

    fn schedule_client_metadata_refresh(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let op = self.queue.enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            self.settings.refresh_interval,
            move || async move {
                let Some(persistence) = weak.upgrade() else {
                    return Ok(());
                };
                if !persistence.is_started() {
                    return Ok(());
                }
                let outcome = persistence
                    .update_client_metadata_and_try_become_primary()
                    .await;
                persistence.schedule_client_metadata_refresh();
                outcome
            },
        );
        self.state.lock().unwrap().refresh_op = Some(op);
    }

    fn write_client_metadata(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let network_enabled = self.state.lock().unwrap().network_enabled;
        let record = DbClientMetadata {
            client_id: self.settings.client_id.clone(),
            update_time_ms: now_ms(),
            network_enabled,
        };
        txn.put(
            Table::ClientMetadata,
            self.settings.client_id.as_bytes().to_vec(),
            local_serializer::encode(&record)?,
        )
    }

    fn can_act_as_primary(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        let network_enabled = self.state.lock().unwrap().network_enabled;
        if let Some(owner) = self.read_valid_owner(txn)? {
            if owner.owner_id == self.settings.client_id {
                if network_enabled {
                    return Ok(true);
                }
            } else {
                if !owner.allow_tab_synchronization {
                    return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_MESSAGE));
                }
                return Ok(false);
            }
        }
        if network_enabled {
            return Ok(true);
        }

        // Without network access this client only takes the lease when no
        // other live client could use the network instead.
        let max_age = self.settings.lease_max_age.as_millis() as i64;
        let now = now_ms();
        for (_, value) in txn.scan(Table::ClientMetadata, KeyRange::all())? {
            let metadata: DbClientMetadata = local_serializer::decode(&value)?;
            if metadata.client_id != self.settings.client_id
                && metadata.network_enabled
                && now - metadata.update_time_ms < max_age
                && !self.settings.zombie_registry.is_zombied(&metadata.client_id)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn verify_primary_lease(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        Ok(self
            .read_valid_owner(txn)?
            .map(|owner| owner.owner_id == self.settings.client_id)
            .unwrap_or(false))
    }

    /// The lease record, if it has not expired and its owner is alive.
    fn read_valid_owner(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Option<DbOwner>> {
        let Some(bytes) = txn.get(Table::Owner, OWNER_KEY)? else {
            return Ok(None);
        };
        let owner: DbOwner = local_serializer::decode(&bytes)?;
        let age = now_ms() - owner.lease_timestamp_ms;
        let expired = age > self.settings.lease_max_age.as_millis() as i64;
        if expired || self.settings.zombie_registry.is_zombied(&owner.owner_id) {
            return Ok(None);
        }
        Ok(Some(owner))
    }

    fn acquire_or_extend_lease(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let owner = DbOwner {
            owner_id: self.settings.client_id.clone(),
            allow_tab_synchronization: self.settings.multi_tab,
            lease_timestamp_ms: now_ms(),
        };
        txn.put(Table::Owner, OWNER_KEY.to_vec(), local_serializer::encode(&owner)?)
    }

    fn release_lease_if_held(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let Some(bytes) = txn.get(Table::Owner, OWNER_KEY)? else {
            return Ok(());
        };
        let owner: DbOwner = local_serializer::decode(&bytes)?;
        if owner.owner_id == self.settings.client_id {
            txn.delete(Table::Owner, OWNER_KEY)?;
        }
        Ok(())
    }

    fn remove_stale_client_metadata(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let max_age = self.settings.client_metadata_max_age.as_millis() as i64;
        let now = now_ms();
        for (key, value) in txn.scan(Table::ClientMetadata, KeyRange::all())? {
            let metadata: DbClientMetadata = local_serializer::decode(&value)?;
            if now - metadata.update_time_ms > max_age {
                txn.delete(Table::ClientMetadata, &key)?;
            }
        }
        Ok(())
    }
}

/// Brings the stored schema up to [`SCHEMA_VERSION`]. Version 2 adds a GC
/// sentinel row for every cached document that lacks one.
fn run_schema_migration(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
    let current = match txn.get(Table::SchemaVersion, SCHEMA_VERSION_KEY)? {
        Some(bytes) => local_serializer::decode::<DbSchemaVersion>(&bytes)?.version,
        None => 0,
    };
    if current >= SCHEMA_VERSION {
        return Ok(());
    }
    if current < 2 {
        let keys = remote_document_cache::all_document_keys(txn)?;
        let sequence_number = txn.current_sequence_number()?;
        for key in keys {
            if target_cache::sentinel_sequence_number(txn, &key)?.is_none() {
                target_cache::write_sentinel(txn, &key, sequence_number)?;
            }
        }
    }
    txn.put(
        Table::SchemaVersion,
        SCHEMA_VERSION_KEY.to_vec(),
        local_serializer::encode(&DbSchemaVersion {
            version: SCHEMA_VERSION,
        })?,
    )
}

fn now_ms() -> i64 {
    Timestamp::now().to_millis()
}
