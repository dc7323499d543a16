//! Glue between the event manager, the local store and the remote store.
//!
//! The sync engine owns one [`View`] per listened query, tracks documents in
//! limbo and resolves them with dedicated single-document targets, and keeps
//! the user callbacks of pending writes. Every entry point runs on the
//! client's async queue, one at a time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::core::query::Query;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::{
    BatchId, OnlineState, TargetId, User, BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::core::view::{LimboDocumentChange, LimboDocumentChangeType, View};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::local_store::{DocumentMap, LocalStore, LocalViewChanges};
use crate::firestore::local::persistence::is_primary_lease_lost;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::shared_client_state::{
    MutationBatchState, QueryTargetState, SharedClientState, SharedClientStateSyncer,
};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, MaybeDocument, Mutation, MutationBatchResult, NoDocument, SnapshotVersion,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::util::assert::{fail, hard_assert};

/// Resolved once the backend acknowledges or rejects a write.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Receives the events the sync engine raises for listened queries.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The query failed and was removed from the sync engine.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Where an online state change came from. The primary follows its own
/// remote store; secondaries follow the primary through shared state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Set once the limbo target delivered the document. Until then the
    /// aggregator may manufacture a delete for it.
    received_document: bool,
}

/// Work for the remote store that is collected under the state lock and
/// performed after releasing it.
enum RemoteAction {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct SyncEngineState {
    current_user: User,
    /// `None` until the persistence layer reported the primary state.
    is_primary: Option<bool>,
    online_state: OnlineState,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    max_concurrent_limbo_resolutions: usize,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_user_callbacks: BTreeMap<String, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
}

impl SyncEngineState {
    fn is_primary(&self) -> bool {
        self.is_primary == Some(true)
    }

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
        actions: &mut Vec<RemoteAction>,
    ) {
        for change in limbo_changes {
            match change.change_type {
                LimboDocumentChangeType::Added => {
                    self.limbo_document_refs
                        .add_reference(change.key.clone(), target_id);
                    self.track_limbo_change(change.key, actions);
                }
                LimboDocumentChangeType::Removed => {
                    log::debug!("Document no longer in limbo: {}", change.key);
                    self.limbo_document_refs
                        .remove_reference(&change.key, target_id);
                    if !self.limbo_document_refs.contains_key(&change.key) {
                        self.remove_limbo_target(&change.key, actions);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey, actions: &mut Vec<RemoteAction>) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("New document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(actions);
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, actions: &mut Vec<RemoteAction>) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        // The target is already gone if its listen failed.
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        actions.push(RemoteAction::Unlisten(target_id));
        self.active_limbo_resolutions_by_target.remove(&target_id);
        self.pump_enqueued_limbo_resolutions(actions);
    }

    /// Starts resolutions for enqueued limbo documents while fewer than
    /// `max_concurrent_limbo_resolutions` are active.
    fn pump_enqueued_limbo_resolutions(&mut self, actions: &mut Vec<RemoteAction>) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_id_generator.next();
            log::debug!("Resolving limbo document {key} with target {target_id}");
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            actions.push(RemoteAction::Listen(TargetData::new(
                Query::for_document(&key).to_target(),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn reset_limbo_documents(&mut self) -> Vec<RemoteAction> {
        let actions = self
            .active_limbo_resolutions_by_target
            .keys()
            .map(|target_id| RemoteAction::Unlisten(*target_id))
            .collect();
        self.limbo_document_refs.remove_all_references();
        self.active_limbo_resolutions_by_target.clear();
        self.active_limbo_targets_by_key.clear();
        self.enqueued_limbo_resolutions.clear();
        actions
    }
}

pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    shared_client_state: Arc<dyn SharedClientState>,
    listener: StdMutex<Option<Weak<dyn SyncEngineListener>>>,
    state: StdMutex<SyncEngineState>,
}

impl SyncEngine {
    /// Creates the engine and registers it with the remote store and the
    /// shared client state.
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: Arc<RemoteStore>,
        shared_client_state: Arc<dyn SharedClientState>,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
        is_primary: bool,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            local_store,
            remote_store: Arc::clone(&remote_store),
            shared_client_state: Arc::clone(&shared_client_state),
            listener: StdMutex::new(None),
            state: StdMutex::new(SyncEngineState {
                current_user,
                is_primary: is_primary.then_some(true),
                online_state: OnlineState::Unknown,
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                max_concurrent_limbo_resolutions,
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                mutation_user_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
            }),
        });
        let remote_syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&engine) as Weak<dyn RemoteSyncer>;
        remote_store.set_syncer(remote_syncer);
        let shared_syncer: Weak<dyn SharedClientStateSyncer> =
            Arc::downgrade(&engine) as Weak<dyn SharedClientStateSyncer>;
        shared_client_state.set_syncer(shared_syncer);
        engine
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn raise_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
    }

    pub fn is_primary_client(&self) -> bool {
        self.state.lock().unwrap().is_primary()
    }

    pub fn current_user(&self) -> User {
        self.state.lock().unwrap().current_user.clone()
    }

    pub fn online_state(&self) -> OnlineState {
        self.state.lock().unwrap().online_state
    }

    /// Limbo documents with an active resolution target.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state
            .lock()
            .unwrap()
            .active_limbo_targets_by_key
            .clone()
    }

    /// Limbo documents waiting for a resolution slot, oldest first.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.state
            .lock()
            .unwrap()
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    async fn run_remote_actions(&self, actions: Vec<RemoteAction>) -> FirestoreResult<()> {
        for action in actions {
            match action {
                RemoteAction::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteAction::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        Ok(())
    }

    /// Starts listening to `query` and returns its first snapshot. A query
    /// that already has a view reuses it.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let existing = {
            let state = self.state.lock().unwrap();
            state
                .query_views
                .get(&query.canonical_id())
                .map(|query_view| (query_view.target_id, query_view.view.compute_initial_snapshot()))
        };
        if let Some((target_id, snapshot)) = existing {
            // A primary may already hold a view on behalf of another client.
            self.shared_client_state.add_local_query_target(target_id);
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let status = self
            .shared_client_state
            .add_local_query_target(target_data.target_id);
        let snapshot = self
            .initialize_view_and_compute_snapshot(
                query,
                target_data.target_id,
                status == QueryTargetState::Current,
                target_data.resume_token.clone(),
            )
            .await?;
        if self.is_primary_client() {
            self.remote_store.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(&query, true).await?;
        let documents = to_document_map(result.documents);
        let mut actions = Vec::new();
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let mut view = View::new(query.clone(), result.remote_keys);
            let changes = view.compute_doc_changes(&documents, None);
            let synthesized = TargetChange::create_synthesized_target_change_for_current_change(
                current && state.online_state != OnlineState::Offline,
                resume_token,
            );
            let is_primary = state.is_primary();
            let view_change = view.apply_changes(changes, is_primary, Some(&synthesized));
            state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);
            let Some(snapshot) = view_change.snapshot else {
                fail("a new view always produces a snapshot");
            };
            state.query_views.insert(
                query.canonical_id(),
                QueryView {
                    query: query.clone(),
                    target_id,
                    view,
                },
            );
            state
                .queries_by_target
                .entry(target_id)
                .or_default()
                .push(query);
            snapshot
        };
        self.run_remote_actions(actions).await?;
        Ok(snapshot)
    }

    /// Stops listening to `query`. The target is released once no query of
    /// this or another client uses it.
    pub async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
        let query_id = query.canonical_id();
        let target_id = {
            let mut state = self.state.lock().unwrap();
            let Some(target_id) = state.query_views.get(&query_id).map(|view| view.target_id) else {
                return Err(internal_error(format!(
                    "Trying to unlisten on query not found: {query_id}"
                )));
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|each| each.canonical_id() != query_id);
                state.query_views.remove(&query_id);
                return Ok(());
            }
            target_id
        };

        if self.is_primary_client() {
            self.shared_client_state.remove_local_query_target(target_id);
            if self.shared_client_state.is_active_query_target(target_id) {
                return Ok(());
            }
            match self.local_store.release_target(target_id, false).await {
                Ok(()) => {
                    self.shared_client_state.clear_query_state(target_id);
                    self.remote_store.unlisten(target_id).await?;
                    self.remove_and_cleanup_target(target_id, None).await
                }
                Err(err) => ignore_if_primary_lease_loss(err),
            }
        } else {
            self.remove_and_cleanup_target(target_id, None).await?;
            self.local_store.release_target(target_id, true).await
        }
    }

    async fn remove_and_cleanup_target(
        &self,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        self.shared_client_state.remove_local_query_target(target_id);
        let mut actions = Vec::new();
        let queries = {
            let mut state = self.state.lock().unwrap();
            let Some(queries) = state.queries_by_target.remove(&target_id) else {
                log::debug!("No queries mapped to target {target_id}");
                return Ok(());
            };
            for query in &queries {
                state.query_views.remove(&query.canonical_id());
            }
            if state.is_primary() {
                for key in state.limbo_document_refs.remove_references_for_id(target_id) {
                    if !state.limbo_document_refs.contains_key(&key) {
                        state.remove_limbo_target(&key, &mut actions);
                    }
                }
            }
            queries
        };
        if let Some(error) = error {
            if let Some(listener) = self.listener() {
                for query in &queries {
                    listener.on_watch_error(query, error.clone());
                }
            }
        }
        self.run_remote_actions(actions).await
    }

    /// Queues `mutations` as one batch and raises the local changes. The
    /// callback is resolved when the backend acknowledges or rejects the
    /// batch, or right away if the batch could not be stored.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.local_store.write_locally(mutations).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("Failed to persist write: {err}");
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };
        self.shared_client_state.add_pending_mutation(result.batch_id);
        {
            let mut state = self.state.lock().unwrap();
            let user_key = state.current_user.storage_key();
            state
                .mutation_user_callbacks
                .entry(user_key)
                .or_default()
                .insert(result.batch_id, callback);
        }
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)
            .await?;
        self.remote_store.fill_write_pipeline().await
    }

    /// Resolves `callback` once every batch pending right now is
    /// acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self, callback: WriteCallback) -> FirestoreResult<()> {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                "The network is disabled. Waiting for pending writes will not complete until it is enabled"
            );
        }
        let highest_batch_id = match self.local_store.get_highest_unacknowledged_batch_id().await {
            Ok(batch_id) => batch_id,
            Err(err) => {
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return Ok(());
        }
        self.state
            .lock()
            .unwrap()
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
        Ok(())
    }

    fn process_user_callback(&self, batch_id: BatchId, error: Option<FirestoreError>) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            let user_key = state.current_user.storage_key();
            // Batches restored from storage have no callback.
            state
                .mutation_user_callbacks
                .get_mut(&user_key)
                .and_then(|callbacks| {
                    if callbacks.contains_key(&batch_id) {
                        hard_assert(
                            callbacks.keys().next() == Some(&batch_id),
                            "Mutation callbacks processed out-of-order",
                        );
                    }
                    callbacks.remove(&batch_id)
                })
        };
        if let Some(callback) = callback {
            let _ = callback.send(match error {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: BatchId) {
        let callbacks = self
            .state
            .lock()
            .unwrap()
            .pending_writes_callbacks
            .remove(&batch_id)
            .unwrap_or_default();
        for callback in callbacks {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&self, message: &str) {
        let callbacks = std::mem::take(&mut self.state.lock().unwrap().pending_writes_callbacks);
        for callback in callbacks.into_values().flatten() {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    /// Applies a remote event to the local store and raises the resulting
    /// view changes.
    pub async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let outcome = async {
            let changes = self.local_store.apply_remote_event(&event).await?;
            {
                let mut state = self.state.lock().unwrap();
                for (target_id, change) in &event.target_changes {
                    let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                        continue;
                    };
                    hard_assert(
                        change.added_documents.len()
                            + change.modified_documents.len()
                            + change.removed_documents.len()
                            <= 1,
                        "Limbo resolution for single document contains multiple changes",
                    );
                    if !change.added_documents.is_empty() {
                        resolution.received_document = true;
                    } else if !change.modified_documents.is_empty() {
                        hard_assert(
                            resolution.received_document,
                            "Received change for limbo target document without add",
                        );
                    } else if !change.removed_documents.is_empty() {
                        hard_assert(
                            resolution.received_document,
                            "Received remove for limbo target document without add",
                        );
                        resolution.received_document = false;
                    }
                }
            }
            self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
                .await
        }
        .await;
        outcome.or_else(ignore_if_primary_lease_loss)
    }

    /// Applies `online_state` to every view if it comes from the source this
    /// client follows.
    pub fn handle_online_state_change(&self, online_state: OnlineState, source: OnlineStateSource) {
        let (snapshots, is_primary) = {
            let mut state = self.state.lock().unwrap();
            let is_primary = state.is_primary();
            let follows = match source {
                OnlineStateSource::RemoteStore => is_primary,
                OnlineStateSource::SharedClientState => !is_primary,
            };
            if !follows {
                return;
            }
            let mut snapshots = Vec::new();
            for query_view in state.query_views.values_mut() {
                let change = query_view.view.apply_online_state_change(online_state);
                hard_assert(
                    change.limbo_changes.is_empty(),
                    "OnlineState should not affect limbo documents",
                );
                if let Some(snapshot) = change.snapshot {
                    snapshots.push(snapshot);
                }
            }
            state.online_state = online_state;
            (snapshots, is_primary)
        };
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            if !snapshots.is_empty() {
                listener.on_watch_change(snapshots);
            }
        }
        if is_primary {
            self.shared_client_state.set_online_state(online_state);
        }
    }

    /// The backend removed `target_id` with `error`. A limbo target means the
    /// document is gone for this client; any other target fails its queries.
    pub async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected(error.clone()));

        let limbo_key = self
            .state
            .lock()
            .unwrap()
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        let Some(key) = limbo_key else {
            return match self.local_store.release_target(target_id, false).await {
                Ok(()) => self.remove_and_cleanup_target(target_id, Some(error)).await,
                Err(err) => ignore_if_primary_lease_loss(err),
            };
        };

        log::debug!("Limbo resolution for {key} failed: {error}");
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::min(),
            ..RemoteEvent::default()
        };
        event.document_updates.insert(
            key.clone(),
            MaybeDocument::NoDocument(NoDocument::new(key.clone(), SnapshotVersion::min(), false)),
        );
        event.resolved_limbo_documents.insert(key.clone());
        self.apply_remote_event(event).await?;

        // Only forget the target once the event applied; otherwise the
        // restarted watch stream fails it again.
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.active_limbo_targets_by_key.remove(&key);
            state.active_limbo_resolutions_by_target.remove(&target_id);
            state.pump_enqueued_limbo_resolutions(&mut actions);
        }
        self.run_remote_actions(actions).await
    }

    pub async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = match self.local_store.acknowledge_batch(&result).await {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };
        // User callbacks run before listen events.
        self.process_user_callback(batch_id, None);
        self.trigger_pending_writes_callbacks(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
            .or_else(ignore_if_primary_lease_loss)
    }

    pub async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        log::error!("Write batch {batch_id} was rejected: {error}");
        let changes = match self.local_store.reject_batch(batch_id).await {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };
        self.process_user_callback(batch_id, Some(error.clone()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected(error));
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
            .or_else(ignore_if_primary_lease_loss)
    }

    /// Switches to `user`'s mutation queue and raises the documents whose
    /// local view changed.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        if self.current_user() == user {
            return Ok(());
        }
        log::debug!("User change. New user: {:?}", user.uid());
        let result = self.local_store.handle_user_change(&user).await?;
        self.state.lock().unwrap().current_user = user.clone();
        self.reject_outstanding_pending_writes_callbacks(
            "Waiting for pending writes was cancelled by a user change",
        );
        self.shared_client_state.handle_user_change(
            &user,
            &result.removed_batch_ids,
            &result.added_batch_ids,
        );
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
            .await
    }

    /// Keys the backend considers part of `target_id`.
    pub fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.state.lock().unwrap();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return BTreeSet::from([resolution.key.clone()]);
            }
        }
        let mut keys = BTreeSet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    /// Runs every view over `changes` and raises the resulting snapshots,
    /// then records the documents that entered or left views.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let views: Vec<(String, Query, TargetId)> = {
            let state = self.state.lock().unwrap();
            state
                .query_views
                .iter()
                .map(|(id, view)| (id.clone(), view.query.clone(), view.target_id))
                .collect()
        };
        if views.is_empty() {
            return Ok(());
        }

        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut actions = Vec::new();
        for (query_id, query, target_id) in views {
            let computed = {
                let state = self.state.lock().unwrap();
                let Some(query_view) = state.query_views.get(&query_id) else {
                    continue;
                };
                query_view.view.compute_doc_changes(changes, None)
            };
            let computed = if computed.needs_refill {
                // Documents beyond the limit may have to move in.
                let result = self.local_store.execute_query(&query, false).await?;
                let documents = to_document_map(result.documents);
                let state = self.state.lock().unwrap();
                let Some(query_view) = state.query_views.get(&query_id) else {
                    continue;
                };
                query_view.view.compute_doc_changes(&documents, Some(computed))
            } else {
                computed
            };

            let (snapshot, is_primary) = {
                let mut state = self.state.lock().unwrap();
                let is_primary = state.is_primary();
                let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
                let view_change = {
                    let Some(query_view) = state.query_views.get_mut(&query_id) else {
                        continue;
                    };
                    query_view.view.apply_changes(computed, is_primary, target_change)
                };
                state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);
                (view_change.snapshot, is_primary)
            };

            if let Some(snapshot) = snapshot {
                if is_primary {
                    let query_state = if snapshot.from_cache {
                        QueryTargetState::NotCurrent
                    } else {
                        QueryTargetState::Current
                    };
                    self.shared_client_state
                        .update_query_state(target_id, query_state);
                }
                view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        self.raise_snapshots(snapshots);
        self.local_store.notify_local_view_changes(view_changes).await?;
        self.run_remote_actions(actions).await
    }

    /// Reconciles the view of `query` with the remote keys and documents in
    /// storage. Returns the snapshot to raise, if any.
    pub async fn synchronize_view_and_compute_snapshot(
        &self,
        query: &Query,
        track_limbos: bool,
    ) -> FirestoreResult<Option<ViewSnapshot>> {
        let result = self.local_store.execute_query(query, true).await?;
        let documents = to_document_map(result.documents);
        let mut actions = Vec::new();
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let (target_id, view_change) = {
                let Some(query_view) = state.query_views.get_mut(&query.canonical_id()) else {
                    return Ok(None);
                };
                let change = query_view
                    .view
                    .synchronize_with_persisted_state(&documents, result.remote_keys);
                (query_view.target_id, change)
            };
            if track_limbos {
                state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);
            }
            view_change.snapshot
        };
        self.run_remote_actions(actions).await?;
        Ok(snapshot)
    }

    /// Reconciles the views of `targets` with storage and raises their
    /// snapshots. Returns the current target data of every target.
    async fn synchronize_query_views_and_raise_snapshots(
        &self,
        targets: Vec<TargetId>,
        transition_to_primary: bool,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_targets = Vec::new();
        let mut snapshots = Vec::new();
        for target_id in targets {
            let queries = self
                .state
                .lock()
                .unwrap()
                .queries_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();

            let target_data = if let Some(first) = queries.first() {
                // The resume token and snapshot version may have moved on
                // while another client was primary.
                let target_data = self.local_store.allocate_target(first.to_target()).await?;
                for query in &queries {
                    if let Some(snapshot) = self
                        .synchronize_view_and_compute_snapshot(query, transition_to_primary)
                        .await?
                    {
                        snapshots.push(snapshot);
                    }
                }
                target_data
            } else {
                hard_assert(
                    transition_to_primary,
                    "A secondary client should never have an active view without an active target",
                );
                let Some(cached) = self.local_store.get_cached_target(target_id).await? else {
                    return Err(internal_error(format!("Target for id {target_id} not found")));
                };
                let target_data = self.local_store.allocate_target(cached.target.clone()).await?;
                // Targets of other clients never ran here; their queries are
                // rebuilt from the target.
                self.initialize_view_and_compute_snapshot(
                    Query::from_target(&cached.target),
                    target_id,
                    false,
                    target_data.resume_token.clone(),
                )
                .await?;
                target_data
            };
            active_targets.push(target_data);
        }
        self.raise_snapshots(snapshots);
        Ok(active_targets)
    }

    /// Called when this client gains or loses the primary lease.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let was_primary = self.state.lock().unwrap().is_primary;
        if is_primary && was_primary != Some(true) {
            log::debug!("Client became primary");
            let active_targets: Vec<TargetId> = self
                .shared_client_state
                .get_all_active_query_targets()
                .into_iter()
                .collect();
            let active_queries = self
                .synchronize_query_views_and_raise_snapshots(active_targets, true)
                .await?;
            self.state.lock().unwrap().is_primary = Some(true);
            self.remote_store.apply_primary_state(true).await?;
            for target_data in active_queries {
                self.remote_store.listen(target_data).await?;
            }
        } else if !is_primary && was_primary != Some(false) {
            log::debug!("Client became secondary");
            let targets: Vec<TargetId> = self
                .state
                .lock()
                .unwrap()
                .queries_by_target
                .keys()
                .copied()
                .collect();
            let mut local_targets = Vec::new();
            for target_id in targets {
                if self.shared_client_state.is_local_query_target(target_id) {
                    local_targets.push(target_id);
                } else {
                    self.remove_and_cleanup_target(target_id, None).await?;
                    self.local_store.release_target(target_id, true).await?;
                }
                self.remote_store.unlisten(target_id).await?;
            }
            self.synchronize_query_views_and_raise_snapshots(local_targets, false)
                .await?;
            let actions = self.state.lock().unwrap().reset_limbo_documents();
            self.run_remote_actions(actions).await?;
            self.state.lock().unwrap().is_primary = Some(false);
            self.remote_store.apply_primary_state(false).await?;
        }
        Ok(())
    }

    /// Applies the outcome of a batch that another client wrote or that the
    /// primary acknowledged on this client's behalf.
    pub async fn apply_batch_state(&self, batch_id: BatchId, batch_state: MutationBatchState) -> FirestoreResult<()> {
        let Some(documents) = self.local_store.lookup_mutation_documents(batch_id).await? else {
            // The batch completed before this client read it, so it never
            // affected local views.
            log::debug!("Cannot apply mutation batch with id: {batch_id}");
            return Ok(());
        };
        match batch_state {
            MutationBatchState::Pending => {
                // Only the primary sends the batch; secondaries have the
                // network disabled.
                self.remote_store.fill_write_pipeline().await?;
            }
            MutationBatchState::Acknowledged => {
                self.process_user_callback(batch_id, None);
                self.trigger_pending_writes_callbacks(batch_id);
                self.local_store
                    .remove_cached_mutation_batch_metadata(batch_id);
            }
            MutationBatchState::Rejected(error) => {
                self.process_user_callback(batch_id, Some(error));
                self.trigger_pending_writes_callbacks(batch_id);
                self.local_store
                    .remove_cached_mutation_batch_metadata(batch_id);
            }
        }
        self.emit_new_snaps_and_notify_local_store(&documents, None)
            .await
    }

    /// Applies the state the primary published for one of this client's
    /// targets.
    pub async fn apply_target_state(&self, target_id: TargetId, target_state: QueryTargetState) -> FirestoreResult<()> {
        let has_queries = {
            let state = self.state.lock().unwrap();
            if state.is_primary() {
                log::debug!("Ignoring unexpected query state notification");
                return Ok(());
            }
            state
                .queries_by_target
                .get(&target_id)
                .is_some_and(|queries| !queries.is_empty())
        };
        if !has_queries {
            return Ok(());
        }
        match target_state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let changes = self.local_store.get_new_document_changes().await?;
                let event = RemoteEvent::create_synthesized_remote_event_for_current_change(
                    target_id,
                    target_state == QueryTargetState::Current,
                    Vec::new(),
                );
                self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
                    .await
            }
            QueryTargetState::Rejected(error) => {
                self.local_store.release_target(target_id, true).await?;
                self.remove_and_cleanup_target(target_id, Some(error)).await
            }
        }
    }

    /// Listens to targets other clients added and stops listening to the ones
    /// no client uses anymore. Only the primary acts on this.
    pub async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()> {
        if !self.is_primary_client() {
            return Ok(());
        }
        for target_id in added {
            let already_listening = self
                .state
                .lock()
                .unwrap()
                .queries_by_target
                .contains_key(&target_id)
                && self.shared_client_state.is_active_query_target(target_id);
            if already_listening {
                log::debug!("Adding an already active target {target_id}");
                continue;
            }
            let Some(cached) = self.local_store.get_cached_target(target_id).await? else {
                return Err(internal_error(format!(
                    "Query data for active target {target_id} not found"
                )));
            };
            let target_data = self.local_store.allocate_target(cached.target.clone()).await?;
            self.initialize_view_and_compute_snapshot(
                Query::from_target(&cached.target),
                target_data.target_id,
                false,
                target_data.resume_token.clone(),
            )
            .await?;
            self.remote_store.listen(target_data).await?;
        }

        for target_id in removed {
            // A rejected target may already be gone.
            if !self
                .state
                .lock()
                .unwrap()
                .queries_by_target
                .contains_key(&target_id)
            {
                continue;
            }
            match self.local_store.release_target(target_id, false).await {
                Ok(()) => {
                    self.remote_store.unlisten(target_id).await?;
                    self.remove_and_cleanup_target(target_id, None).await?;
                }
                Err(err) => ignore_if_primary_lease_loss(err)?,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        SyncEngine::apply_remote_event(self, event).await
    }

    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        SyncEngine::reject_listen(self, target_id, error).await
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        SyncEngine::apply_successful_write(self, result).await
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        SyncEngine::reject_failed_write(self, batch_id, error).await
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        SyncEngine::get_remote_keys_for_target(self, target_id)
    }

    async fn apply_online_state_change(&self, online_state: OnlineState) {
        self.handle_online_state_change(online_state, OnlineStateSource::RemoteStore);
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        SyncEngine::handle_credential_change(self, user).await
    }
}

#[async_trait]
impl SharedClientStateSyncer for SyncEngine {
    async fn apply_batch_state(&self, batch_id: BatchId, state: MutationBatchState) -> FirestoreResult<()> {
        SyncEngine::apply_batch_state(self, batch_id, state).await
    }

    async fn apply_target_state(&self, target_id: TargetId, state: QueryTargetState) -> FirestoreResult<()> {
        SyncEngine::apply_target_state(self, target_id, state).await
    }

    async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()> {
        SyncEngine::apply_active_targets_change(self, added, removed).await
    }

    async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
        self.handle_online_state_change(online_state, OnlineStateSource::SharedClientState);
        Ok(())
    }
}

fn ignore_if_primary_lease_loss(error: FirestoreError) -> FirestoreResult<()> {
    if is_primary_lease_lost(&error) {
        log::debug!("Unexpectedly lost primary lease");
        Ok(())
    } else {
        Err(error)
    }
}

fn to_document_map(documents: BTreeMap<DocumentKey, Document>) -> DocumentMap {
    documents
        .into_iter()
        .map(|(key, doc)| (key, Some(MaybeDocument::from(doc))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view_snapshot::ChangeType;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::local::lru_garbage_collector::LruParams;
    use crate::firestore::local::persistence::{Persistence, PersistenceSettings};
    use crate::firestore::local::shared_client_state::MemorySharedClientState;
    use crate::firestore::model::{DocumentState, MutationResult, ResourcePath};
    use crate::firestore::remote::connection::{
        InMemoryConnection, ListenBackendStream, ListenRequest, WriteResponse,
    };
    use crate::firestore::remote::datastore::RemoteDatastore;
    use crate::firestore::remote::watch_change::{
        DocumentChange, TargetChangeState, WatchChange, WatchTargetChange,
    };
    use crate::firestore::util::backoff::BackoffSettings;
    use crate::firestore::util::AsyncQueue;
    use crate::firestore::value::MapValue;
    use futures::channel::mpsc;
    use futures::StreamExt;

    enum Raised {
        Snapshots(Vec<ViewSnapshot>),
        Error(Query, FirestoreErrorCode),
    }

    const RAISE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    struct RecordingListener {
        raised: mpsc::UnboundedSender<Raised>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            if !snapshots.is_empty() {
                let _ = self.raised.unbounded_send(Raised::Snapshots(snapshots));
            }
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            let _ = self.raised.unbounded_send(Raised::Error(query.clone(), error.code));
        }

        fn on_online_state_change(&self, _online_state: OnlineState) {}
    }

    struct Fixture {
        connection: Arc<InMemoryConnection>,
        local_store: Arc<LocalStore>,
        remote_store: Arc<RemoteStore>,
        sync_engine: Arc<SyncEngine>,
        raised: mpsc::UnboundedReceiver<Raised>,
        _listener: Arc<RecordingListener>,
    }

    impl Fixture {
        async fn next_raised(&mut self) -> Option<Raised> {
            tokio::time::timeout(RAISE_TIMEOUT, self.raised.next())
                .await
                .expect("no event raised in time")
        }

        async fn next_snapshot(&mut self) -> ViewSnapshot {
            loop {
                match self.next_raised().await {
                    Some(Raised::Snapshots(mut snapshots)) => return snapshots.remove(0),
                    Some(Raised::Error(..)) => continue,
                    None => panic!("listener closed"),
                }
            }
        }

        async fn next_snapshot_for(&mut self, query: &Query) -> ViewSnapshot {
            loop {
                match self.next_raised().await {
                    Some(Raised::Snapshots(snapshots)) => {
                        if let Some(snapshot) =
                            snapshots.into_iter().find(|snapshot| &snapshot.query == query)
                        {
                            return snapshot;
                        }
                    }
                    Some(Raised::Error(..)) => continue,
                    None => panic!("listener closed"),
                }
            }
        }
    }

    async fn fixture(max_limbo_resolutions: usize) -> Fixture {
        let queue = AsyncQueue::new();
        let persistence = Persistence::new(
            Arc::new(MemoryKvStore::new()),
            PersistenceSettings::new("client"),
            queue.clone(),
        );
        persistence.start().await.unwrap();
        let local_store = LocalStore::new(persistence, &User::unauthenticated(), LruParams::default());
        local_store.start().await.unwrap();
        let connection = InMemoryConnection::new();
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            RemoteDatastore::new(connection.clone()),
            queue,
            BackoffSettings::default(),
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            Arc::clone(&remote_store),
            Arc::new(MemorySharedClientState::new()),
            User::unauthenticated(),
            max_limbo_resolutions,
            true,
        );
        let (sender, raised) = mpsc::unbounded();
        let listener = Arc::new(RecordingListener { raised: sender });
        let weak: Weak<dyn SyncEngineListener> = Arc::downgrade(&listener) as Weak<dyn SyncEngineListener>;
        sync_engine.set_listener(weak);
        Fixture {
            connection,
            local_store,
            remote_store,
            sync_engine,
            raised,
            _listener: listener,
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    fn remote_doc(path: &str, version: i64) -> Document {
        Document::new(key(path), SnapshotVersion::from_seconds(version), MapValue::empty(), DocumentState::Synced)
    }

    fn send_target_change(backend: &ListenBackendStream, state: TargetChangeState, ids: Vec<TargetId>) {
        backend.send(WatchChange::TargetChange(WatchTargetChange::new(state, ids)));
    }

    fn send_document(backend: &ListenBackendStream, doc: Document, target_ids: Vec<TargetId>) {
        backend.send(WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: target_ids,
            removed_target_ids: vec![],
            document: doc,
        }));
    }

    fn send_global_snapshot(backend: &ListenBackendStream, seconds: i64) {
        backend.send(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, vec![])
                .with_read_time(SnapshotVersion::from_seconds(seconds)),
        ));
    }

    async fn added_target(backend: &ListenBackendStream) -> TargetData {
        match backend.next_request().await {
            Some(ListenRequest::AddTarget(data)) => data,
            other => panic!("expected a new target, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn listen_raises_backend_documents() {
        let mut f = fixture(100).await;
        f.remote_store.start().await.unwrap();
        let initial = f.sync_engine.listen(rooms()).await.unwrap();
        assert!(initial.docs.is_empty());
        assert!(initial.from_cache);

        let backend = f.connection.next_listen_stream().await.unwrap();
        let target = added_target(&backend).await;
        send_target_change(&backend, TargetChangeState::Added, vec![target.target_id]);
        send_document(&backend, remote_doc("rooms/a", 1), vec![target.target_id]);
        send_target_change(&backend, TargetChangeState::Current, vec![target.target_id]);
        send_global_snapshot(&backend, 1);

        let snapshot = f.next_snapshot().await;
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.doc_changes.len(), 1);
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Added);
        assert_eq!(
            f.sync_engine.get_remote_keys_for_target(target.target_id),
            BTreeSet::from([key("rooms/a")])
        );
    }

    #[tokio::test]
    async fn queries_with_the_same_target_share_it() {
        let f = fixture(100).await;
        let first = f.sync_engine.listen(rooms()).await.unwrap();
        let second = f.sync_engine.listen(rooms()).await.unwrap();
        assert_eq!(first.docs.len(), second.docs.len());
        f.sync_engine.unlisten(rooms()).await.unwrap();
        assert!(f.sync_engine.unlisten(rooms()).await.is_err());
    }

    #[tokio::test]
    async fn write_callback_resolves_on_acknowledgement() {
        let mut f = fixture(100).await;
        f.sync_engine.listen(rooms()).await.unwrap();
        let (callback, acknowledged) = oneshot::channel();
        f.sync_engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())], callback)
            .await
            .unwrap();
        let local = f.next_snapshot().await;
        assert!(local.has_pending_writes());

        f.remote_store.start().await.unwrap();
        let backend = f.connection.next_write_stream().await.unwrap();
        assert!(backend.next_request().await.unwrap().is_handshake());
        backend.send(WriteResponse::default());
        backend.next_request().await.unwrap();
        let version = SnapshotVersion::from_seconds(2);
        backend.send(WriteResponse {
            stream_token: b"token".to_vec(),
            commit_version: version,
            mutation_results: vec![MutationResult::new(version, None)],
        });
        assert!(acknowledged.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn rejected_write_fails_callback() {
        let f = fixture(100).await;
        let (callback, rejected) = oneshot::channel();
        f.sync_engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())], callback)
            .await
            .unwrap();
        f.remote_store.start().await.unwrap();
        let backend = f.connection.next_write_stream().await.unwrap();
        backend.next_request().await.unwrap();
        backend.send(WriteResponse::default());
        backend.next_request().await.unwrap();
        backend.fail(permission_denied("read only"));

        let error = rejected.await.unwrap().unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
        let local = f.local_store.read_document(&key("rooms/a")).await.unwrap();
        assert!(!matches!(local, Some(MaybeDocument::Document(_))));
    }

    #[tokio::test]
    async fn pending_writes_callback_waits_for_acknowledgement() {
        let f = fixture(100).await;
        let (idle, idle_done) = oneshot::channel();
        f.sync_engine.register_pending_writes_callback(idle).await.unwrap();
        assert!(idle_done.await.unwrap().is_ok());

        let (callback, _) = oneshot::channel();
        f.sync_engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())], callback)
            .await
            .unwrap();
        let (waiting, mut waiting_done) = oneshot::channel();
        f.sync_engine.register_pending_writes_callback(waiting).await.unwrap();
        assert!(waiting_done.try_recv().unwrap().is_none());

        f.sync_engine
            .handle_credential_change(User::new("other"))
            .await
            .unwrap();
        let error = waiting_done.await.unwrap().unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::Cancelled);
    }

    /// Puts `rooms/b` in the cache through a document target, then listens
    /// to `rooms` and has the backend confirm only `rooms/a`.
    async fn setup_limbo(f: &mut Fixture) -> ListenBackendStream {
        f.remote_store.start().await.unwrap();
        f.sync_engine
            .listen(Query::for_document(&key("rooms/b")))
            .await
            .unwrap();
        let backend = f.connection.next_listen_stream().await.unwrap();
        let document_target = added_target(&backend).await;
        send_target_change(&backend, TargetChangeState::Added, vec![document_target.target_id]);
        send_document(&backend, remote_doc("rooms/b", 1), vec![document_target.target_id]);
        send_target_change(&backend, TargetChangeState::Current, vec![document_target.target_id]);
        send_global_snapshot(&backend, 1);
        f.next_snapshot().await;

        let cached = f.sync_engine.listen(rooms()).await.unwrap();
        assert_eq!(cached.docs.len(), 1);
        let rooms_target = added_target(&backend).await;
        send_target_change(&backend, TargetChangeState::Added, vec![rooms_target.target_id]);
        send_document(&backend, remote_doc("rooms/a", 2), vec![rooms_target.target_id]);
        send_target_change(&backend, TargetChangeState::Current, vec![rooms_target.target_id]);
        send_global_snapshot(&backend, 2);
        f.next_snapshot_for(&rooms()).await;
        backend
    }

    #[tokio::test]
    async fn limbo_documents_get_resolution_targets() {
        let mut f = fixture(100).await;
        let backend = setup_limbo(&mut f).await;

        let limbo_target = added_target(&backend).await;
        assert_eq!(limbo_target.purpose, TargetPurpose::LimboResolution);
        assert_eq!(limbo_target.target_id % 2, 1);
        assert_eq!(
            f.sync_engine.active_limbo_document_resolutions(),
            BTreeMap::from([(key("rooms/b"), limbo_target.target_id)])
        );

        // A failed resolution counts as a delete.
        backend.send(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Removed, vec![limbo_target.target_id])
                .with_cause(permission_denied("gone")),
        ));
        let snapshot = f.next_snapshot_for(&rooms()).await;
        assert!(!snapshot.docs.has(&key("rooms/b")));
        assert!(f.sync_engine.active_limbo_document_resolutions().is_empty());
    }

    #[tokio::test]
    async fn limbo_resolutions_are_capped() {
        let mut f = fixture(0).await;
        setup_limbo(&mut f).await;
        assert!(f.sync_engine.active_limbo_document_resolutions().is_empty());
        assert_eq!(
            f.sync_engine.enqueued_limbo_document_resolutions(),
            vec![key("rooms/b")]
        );
    }

    #[tokio::test]
    async fn rejected_listen_reports_error() {
        let mut f = fixture(100).await;
        f.remote_store.start().await.unwrap();
        f.sync_engine.listen(rooms()).await.unwrap();
        let backend = f.connection.next_listen_stream().await.unwrap();
        let target = added_target(&backend).await;
        backend.send(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Removed, vec![target.target_id])
                .with_cause(permission_denied("no access")),
        ));
        loop {
            match f.next_raised().await {
                Some(Raised::Error(query, code)) => {
                    assert_eq!(query, rooms());
                    assert_eq!(code, FirestoreErrorCode::PermissionDenied);
                    break;
                }
                Some(Raised::Snapshots(_)) => continue,
                None => panic!("listener closed"),
            }
        }
        assert!(f.sync_engine.get_remote_keys_for_target(target.target_id).is_empty());
    }

    #[tokio::test]
    async fn offline_state_marks_views_from_cache() {
        let mut f = fixture(100).await;
        f.remote_store.start().await.unwrap();
        f.sync_engine.listen(rooms()).await.unwrap();
        let backend = f.connection.next_listen_stream().await.unwrap();
        let target = added_target(&backend).await;
        send_target_change(&backend, TargetChangeState::Added, vec![target.target_id]);
        send_target_change(&backend, TargetChangeState::Current, vec![target.target_id]);
        send_global_snapshot(&backend, 1);
        assert!(!f.next_snapshot().await.from_cache);

        f.sync_engine
            .handle_online_state_change(OnlineState::Offline, OnlineStateSource::RemoteStore);
        assert!(f.next_snapshot().await.from_cache);
        assert_eq!(f.sync_engine.online_state(), OnlineState::Offline);

        // A secondary's view of the network comes from the primary only.
        f.sync_engine
            .handle_online_state_change(OnlineState::Online, OnlineStateSource::SharedClientState);
        assert_eq!(f.sync_engine.online_state(), OnlineState::Offline);
    }
}
