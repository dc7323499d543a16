//! Owns the watch and write streams and keeps them in sync with the
//! targets the sync engine listens to and the batches in the mutation queue.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};

use crate::firestore::core::types::{BatchId, OnlineState, TargetId, User};
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::persistence::is_primary_lease_lost;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::connection::WriteResponse;
use crate::firestore::remote::datastore::RemoteDatastore;
use crate::firestore::remote::online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
use crate::firestore::remote::persistent_stream::{StreamListener, WatchStream, WriteStream};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::util::async_queue::AsyncQueue;
use crate::firestore::util::backoff::BackoffSettings;

/// Batches sent on the write stream without an acknowledgement yet.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps the network down. The network is used
/// only while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    StorageFailure,
    CredentialChange,
    IsSecondary,
    Shutdown,
}

struct ListenMetadata<'a> {
    syncer: &'a dyn RemoteSyncer,
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

#[derive(Default)]
struct RemoteStoreState {
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }
}

pub struct RemoteStore {
    local_store: Arc<LocalStore>,
    queue: AsyncQueue,
    syncer: StdMutex<Option<Weak<dyn RemoteSyncer>>>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    online_state_tracker: Arc<OnlineStateTracker>,
    me: Weak<Self>,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        datastore: Arc<RemoteDatastore>,
        queue: AsyncQueue,
        backoff: BackoffSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let watch_listener: Weak<dyn StreamListener<WatchChange>> = me.clone();
            let write_listener: Weak<dyn StreamListener<WriteResponse>> = me.clone();
            let handler_store = me.clone();
            let handler: OnlineStateHandler = Arc::new(move |online_state| {
                let store = handler_store.clone();
                async move {
                    let syncer = store.upgrade().and_then(|store| store.syncer().ok());
                    if let Some(syncer) = syncer {
                        syncer.apply_online_state_change(online_state).await;
                    }
                }
                .boxed()
            });
            Self {
                local_store,
                watch_stream: WatchStream::new(
                    Arc::clone(&datastore),
                    queue.clone(),
                    backoff,
                    watch_listener,
                ),
                write_stream: WriteStream::new(datastore, queue.clone(), backoff, write_listener),
                online_state_tracker: OnlineStateTracker::new(queue.clone(), handler),
                queue,
                syncer: StdMutex::new(None),
                me: me.clone(),
                state: Mutex::new(RemoteStoreState::default()),
            }
        })
    }

    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *self.syncer.lock().unwrap() = Some(syncer);
    }

    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.syncer
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| internal_error("RemoteStore has no syncer"))
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.online_state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.state.lock().await.can_use_network()
    }

    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    /// Re-enables the network after [`RemoteStore::disable_network`].
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.enable_network_internal().await
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        let start_watch = {
            let state = self.state.lock().await;
            if !state.can_use_network() {
                return Ok(());
            }
            self.should_start_watch_stream(&state)
        };
        if let Err(err) = self.local_store.set_network_enabled(true).await {
            log::debug!("Failed to record network state: {err}");
        }
        if start_watch {
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        self.fill_write_pipeline().await
    }

    /// Closes both streams and reports the client as offline until
    /// [`RemoteStore::enable_network`] is called.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.disable_network_internal().await;
        // Offline lets reads resolve from the cache right away.
        self.online_state_tracker.set(OnlineState::Offline).await;
        Ok(())
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop();
        self.watch_stream.stop();
        {
            let mut state = self.state.lock().await;
            if !state.write_pipeline.is_empty() {
                log::debug!(
                    "Stopping write stream with {} pending writes",
                    state.write_pipeline.len()
                );
                state.write_pipeline.clear();
            }
            state.watch_change_aggregator = None;
        }
        if let Err(err) = self.local_store.set_network_enabled(false).await {
            log::debug!("Failed to record network state: {err}");
        }
    }

    pub async fn shutdown(&self) {
        log::debug!("RemoteStore shutting down");
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.disable_network_internal().await;
        self.online_state_tracker.shutdown();
        // Unknown rather than Offline, so listeners do not get a last
        // from-cache snapshot.
        self.online_state_tracker.set(OnlineState::Unknown).await;
    }

    /// Starts watching `target_data`. Listening to an already watched target
    /// is a no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let start_watch = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_data.target_id) {
                return Ok(());
            }
            state
                .listen_targets
                .insert(target_data.target_id, target_data.clone());
            if self.should_start_watch_stream(&state) {
                true
            } else {
                if self.watch_stream.is_open() {
                    self.send_watch_request(&mut state, target_data)?;
                }
                false
            }
        };
        if start_watch {
            self.start_watch_stream().await;
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let go_unknown = {
            let mut state = self.state.lock().await;
            if state.listen_targets.remove(&target_id).is_none() {
                log::debug!("Unlisten for target {target_id} that is not listened to");
                return Ok(());
            }
            if self.watch_stream.is_open() {
                self.send_unwatch_request(&mut state, target_id)?;
            }
            if !state.listen_targets.is_empty() {
                false
            } else if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
                false
            } else {
                // Without targets the stream will not start, so nothing
                // else would move the state out of Offline.
                state.can_use_network()
            }
        };
        if go_unknown {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        Ok(())
    }

    fn send_watch_request(
        &self,
        state: &mut RemoteStoreState,
        target_data: TargetData,
    ) -> FirestoreResult<()> {
        if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        self.watch_stream.watch(target_data)
    }

    fn send_unwatch_request(
        &self,
        state: &mut RemoteStoreState,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id)
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.watch_stream.is_started()
            && !state.listen_targets.is_empty()
    }

    async fn start_watch_stream(&self) {
        self.state.lock().await.watch_change_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start().await;
    }

    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(&mut state, target_data)?;
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let restart = {
            let mut state = self.state.lock().await;
            state.watch_change_aggregator = None;
            self.should_start_watch_stream(&state)
        };
        match error {
            Some(err) if restart => {
                self.online_state_tracker
                    .handle_watch_stream_failure(&err)
                    .await;
                self.start_watch_stream().await;
            }
            Some(_) => self.online_state_tracker.set(OnlineState::Unknown).await,
            None if restart => self.start_watch_stream().await,
            None => {}
        }
        Ok(())
    }

    async fn on_watch_stream_change(&self, change: WatchChange) -> FirestoreResult<()> {
        // Any message means the backend is reachable.
        self.online_state_tracker.set(OnlineState::Online).await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Removed && target_change.cause.is_some() {
                if let Err(err) = self.handle_target_error(target_change).await {
                    log::debug!("Failed to remove targets {:?}: {err}", target_change.target_ids);
                    self.disable_network_until_recovery(err).await?;
                }
                return Ok(());
            }
        }

        let syncer = self.syncer()?;
        let snapshot_version = {
            let mut state = self.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_change_aggregator,
                ..
            } = &mut *state;
            let Some(aggregator) = watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let snapshot_version = match &change {
                WatchChange::TargetChange(target_change) if target_change.is_global_snapshot() => {
                    target_change.read_time
                }
                _ => None,
            };
            let metadata = ListenMetadata {
                syncer: syncer.as_ref(),
                listen_targets,
            };
            aggregator.handle_watch_change(change, &metadata);
            snapshot_version
        };

        let Some(snapshot_version) = snapshot_version.filter(|version| !version.is_min()) else {
            return Ok(());
        };
        let raised: FirestoreResult<()> = async {
            let last_remote_snapshot_version =
                self.local_store.get_last_remote_snapshot_version().await?;
            if snapshot_version >= last_remote_snapshot_version {
                // Versions can go backwards after a resumed stream; those
                // snapshots were already raised.
                self.raise_watch_snapshot(snapshot_version).await?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = raised {
            log::debug!("Failed to raise snapshot: {err}");
            self.disable_network_until_recovery(err).await?;
        }
        Ok(())
    }

    /// Turns the aggregated changes into a `RemoteEvent` and hands it to the
    /// sync engine. Targets whose existence filter failed are re-listened
    /// without a resume token.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        let event = {
            let mut state = self.state.lock().await;
            let (event, mismatched) = {
                let RemoteStoreState {
                    listen_targets,
                    watch_change_aggregator,
                    ..
                } = &mut *state;
                let Some(aggregator) = watch_change_aggregator.as_mut() else {
                    return Ok(());
                };
                let event = aggregator.create_remote_event(
                    snapshot_version,
                    &ListenMetadata {
                        syncer: syncer.as_ref(),
                        listen_targets,
                    },
                );

                for (target_id, change) in &event.target_changes {
                    if change.resume_token.is_empty() {
                        continue;
                    }
                    if let Some(target_data) = listen_targets.get_mut(target_id) {
                        *target_data =
                            target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                    }
                }

                let mut mismatched = Vec::new();
                for target_id in &event.target_mismatches {
                    let Some(target_data) = listen_targets.get_mut(target_id) else {
                        // The target was removed while the snapshot built up.
                        continue;
                    };
                    *target_data =
                        target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
                    mismatched.push(target_data.clone());
                }
                (event, mismatched)
            };

            for target_data in mismatched {
                self.send_unwatch_request(&mut state, target_data.target_id)?;
                let request = TargetData::new(
                    target_data.target.clone(),
                    target_data.target_id,
                    TargetPurpose::ExistenceFilterMismatch,
                    target_data.sequence_number,
                );
                self.send_watch_request(&mut state, request)?;
            }
            event
        };
        syncer.apply_remote_event(event).await
    }

    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(cause) = change.cause.clone() else {
            return Ok(());
        };
        let syncer = self.syncer()?;
        for target_id in &change.target_ids {
            let removed = {
                let mut state = self.state.lock().await;
                let removed = state.listen_targets.remove(target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                }
                removed
            };
            if removed {
                syncer.reject_listen(*target_id, cause.clone()).await?;
            }
        }
        Ok(())
    }

    /// Reads batches from the mutation queue until the pipeline is full,
    /// sending them if the write stream is ready.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut last_batch_id: Option<BatchId> = self
            .state
            .lock()
            .await
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id);
        loop {
            {
                let state = self.state.lock().await;
                if !state.can_use_network() || state.write_pipeline.len() >= MAX_PENDING_WRITES {
                    break;
                }
            }
            let batch = match self.local_store.next_mutation_batch(last_batch_id).await {
                Ok(batch) => batch,
                Err(err) => {
                    self.disable_network_until_recovery(err).await?;
                    break;
                }
            };
            let Some(batch) = batch else {
                if self.state.lock().await.write_pipeline.is_empty() {
                    self.write_stream.mark_idle();
                }
                break;
            };
            last_batch_id = Some(batch.batch_id);
            self.add_to_write_pipeline(batch).await?;
        }

        if self.should_start_write_stream().await {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        let mutations = batch.mutations.clone();
        self.state.lock().await.write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(mutations)?;
        }
        Ok(())
    }

    async fn should_start_write_stream(&self) -> bool {
        let state = self.state.lock().await;
        state.can_use_network()
            && !self.write_stream.is_started()
            && !state.write_pipeline.is_empty()
    }

    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        match self.local_store.get_last_stream_token().await {
            Ok(token) => self.write_stream.set_last_stream_token(token),
            Err(err) => return self.disable_network_until_recovery(err).await,
        }
        self.write_stream.write_handshake()
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        let token = self.write_stream.last_stream_token();
        if let Err(err) = self.local_store.set_last_stream_token(token).await {
            return self.disable_network_until_recovery(err).await;
        }
        let pending: Vec<_> = self
            .state
            .lock()
            .await
            .write_pipeline
            .iter()
            .map(|batch| batch.mutations.clone())
            .collect();
        for mutations in pending {
            self.write_stream.write_mutations(mutations)?;
        }
        Ok(())
    }

    async fn on_mutation_result(&self, response: WriteResponse) -> FirestoreResult<()> {
        let batch = self.state.lock().await.write_pipeline.pop_front();
        let Some(batch) = batch else {
            return Err(internal_error("Write response without a pending batch"));
        };
        let result = MutationBatchResult::from_results(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        )?;
        self.syncer()?.apply_successful_write(result).await?;
        // The acknowledged batch freed a slot in the pipeline.
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(err) = error {
            let has_pending = !self.state.lock().await.write_pipeline.is_empty();
            if has_pending {
                if self.write_stream.handshake_complete() {
                    self.handle_write_error(err).await?;
                } else {
                    self.handle_handshake_error(err).await?;
                }
            }
        }
        if self.should_start_write_stream().await {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn handle_handshake_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_error(error.code) {
            return Ok(());
        }
        log::debug!("Write stream failed before the handshake completed, resetting stream token: {error}");
        self.write_stream.set_last_stream_token(Vec::new());
        match self.local_store.set_last_stream_token(Vec::new()).await {
            Err(err) if is_primary_lease_lost(&err) => {
                log::debug!("Unable to reset stream token: {err}");
                Ok(())
            }
            other => other,
        }
    }

    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            // Transient errors are retried by restarting the stream.
            return Ok(());
        }
        let batch = self.state.lock().await.write_pipeline.pop_front();
        // The request was bad, not the backend, so the restart need not wait.
        self.write_stream.inhibit_backoff();
        if let Some(batch) = batch {
            self.syncer()?
                .reject_failed_write(batch.batch_id, error)
                .await?;
        }
        self.fill_write_pipeline().await
    }

    /// Restarts both streams for `user`, letting the sync engine switch its
    /// local state while the network is down.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        log::debug!("RemoteStore received new credentials");
        let uses_network = {
            let mut state = self.state.lock().await;
            let uses_network = state.can_use_network();
            state.offline_causes.insert(OfflineCause::CredentialChange);
            uses_network
        };
        self.disable_network_internal().await;
        if uses_network {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        let switched = self.syncer()?.handle_credential_change(user).await;
        self.state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        switched?;
        self.enable_network_internal().await
    }

    /// Only the primary client talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.state
                .lock()
                .await
                .offline_causes
                .remove(&OfflineCause::IsSecondary);
            self.enable_network_internal().await
        } else {
            self.state
                .lock()
                .await
                .offline_causes
                .insert(OfflineCause::IsSecondary);
            self.disable_network_internal().await;
            self.online_state_tracker.set(OnlineState::Unknown).await;
            Ok(())
        }
    }

    // Boxed to break the recursive future type between recovery and
    // `enable_network_internal`.
    fn enable_network_boxed(store: Arc<Self>) -> BoxFuture<'static, FirestoreResult<()>> {
        async move { store.enable_network_internal().await }.boxed()
    }

    /// Takes the network down after a storage failure and probes storage on
    /// the retry queue until it works again. Other errors are returned.
    async fn disable_network_until_recovery(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !error.is_storage_transaction() {
            return Err(error);
        }
        {
            let mut state = self.state.lock().await;
            if !state.offline_causes.insert(OfflineCause::StorageFailure) {
                return Ok(());
            }
        }
        log::debug!("Disabling network after storage failure: {error}");
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline).await;

        let me = self.me.clone();
        self.queue.enqueue_retryable(move || {
            let me = me.clone();
            async move {
                let Some(store) = me.upgrade() else {
                    return Ok(());
                };
                store.local_store.get_last_remote_snapshot_version().await?;
                log::debug!("Storage is available again, re-enabling network");
                store
                    .state
                    .lock()
                    .await
                    .offline_causes
                    .remove(&OfflineCause::StorageFailure);
                Self::enable_network_boxed(store).await
            }
        });
        Ok(())
    }
}

#[async_trait]
impl StreamListener<WatchChange> for RemoteStore {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.on_watch_stream_open().await
    }

    async fn on_message(&self, message: WatchChange) -> FirestoreResult<()> {
        self.on_watch_stream_change(message).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.on_watch_stream_close(error).await
    }
}

#[async_trait]
impl StreamListener<WriteResponse> for RemoteStore {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.on_write_stream_open().await
    }

    async fn on_message(&self, message: WriteResponse) -> FirestoreResult<()> {
        if self.write_stream.handshake_complete() {
            self.write_stream
                .set_last_stream_token(message.stream_token.clone());
            self.on_mutation_result(message).await
        } else {
            self.write_stream.complete_handshake(message.stream_token);
            self.on_write_handshake_complete().await
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.on_write_stream_close(error).await
    }
}
