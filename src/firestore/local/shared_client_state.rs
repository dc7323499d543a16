//! State shared between clients that use the same persistence.
//!
//! Each client publishes its active targets, the state of its pending
//! writes and (as primary) the state of query targets and the online state.
//! Other clients pick these up as events and hand them to their
//! [`SharedClientStateSyncer`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::firestore::core::types::{BatchId, OnlineState, TargetId, User};
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::util::AsyncQueue;
use crate::platform::runtime;

const CLIENT_STATE_PREFIX: &str = "client/";
const MUTATION_STATE_PREFIX: &str = "mutation/";
const TARGET_STATE_PREFIX: &str = "target/";
const ONLINE_STATE_KEY: &str = "online";

#[derive(Clone, Debug, PartialEq)]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected(FirestoreError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected(FirestoreError),
}

/// Receives state changes published by other clients.
#[async_trait]
pub trait SharedClientStateSyncer: Send + Sync {
    async fn apply_batch_state(&self, batch_id: BatchId, state: MutationBatchState) -> FirestoreResult<()>;

    async fn apply_target_state(&self, target_id: TargetId, state: QueryTargetState) -> FirestoreResult<()>;

    /// Targets that became active or inactive across all clients.
    async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()>;

    async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()>;
}

pub trait SharedClientState: Send + Sync {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>);

    fn start(&self) -> FirestoreResult<()>;

    fn shutdown(&self);

    fn add_pending_mutation(&self, batch_id: BatchId);

    /// Publishes the outcome of a batch. Only the primary acknowledges or
    /// rejects batches.
    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState);

    /// Marks `target_id` as listened to by this client and returns its
    /// last published state.
    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState;

    fn remove_local_query_target(&self, target_id: TargetId);

    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    /// True if any client listens to `target_id`.
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId>;

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState);

    fn clear_query_state(&self, target_id: TargetId);

    /// Moves the pending batches published for this client to `user`.
    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    fn set_online_state(&self, online_state: OnlineState);
}

/// Shared state of a client that runs alone.
#[derive(Default)]
pub struct MemorySharedClientState {
    state: StdMutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    local_targets: BTreeSet<TargetId>,
    query_state: BTreeMap<TargetId, QueryTargetState>,
}

impl MemorySharedClientState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedClientState for MemorySharedClientState {
    fn set_syncer(&self, _syncer: Weak<dyn SharedClientStateSyncer>) {}

    fn start(&self) -> FirestoreResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn add_pending_mutation(&self, _batch_id: BatchId) {}

    fn update_mutation_state(&self, _batch_id: BatchId, _state: MutationBatchState) {}

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let mut state = self.state.lock().unwrap();
        state.local_targets.insert(target_id);
        state
            .query_state
            .get(&target_id)
            .cloned()
            .unwrap_or(QueryTargetState::NotCurrent)
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.state.lock().unwrap().local_targets.remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.state.lock().unwrap().local_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.is_local_query_target(target_id)
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.state.lock().unwrap().local_targets.clone()
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState) {
        self.state.lock().unwrap().query_state.insert(target_id, state);
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.state.lock().unwrap().query_state.remove(&target_id);
    }

    fn handle_user_change(&self, _user: &User, _removed: &[BatchId], _added: &[BatchId]) {}

    fn set_online_state(&self, _online_state: OnlineState) {}
}

/// A change to one entry of an [`InProcessChannel`]. `value` is `None` when
/// the entry was removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEvent {
    pub source: String,
    pub key: String,
    pub value: Option<String>,
}

/// Key-value board shared by clients in one process. Every write is
/// broadcast to all subscribers except the writer.
#[derive(Clone, Default)]
pub struct InProcessChannel {
    inner: Arc<StdMutex<ChannelInner>>,
}

#[derive(Default)]
struct ChannelInner {
    entries: BTreeMap<String, String>,
    subscribers: BTreeMap<String, async_channel::Sender<ChannelEvent>>,
}

impl InProcessChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, client_id: &str) -> async_channel::Receiver<ChannelEvent> {
        let (sender, receiver) = async_channel::unbounded();
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .insert(client_id.to_string(), sender);
        receiver
    }

    pub fn unsubscribe(&self, client_id: &str) {
        self.inner.lock().unwrap().subscribers.remove(client_id);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().entries.get(key).cloned()
    }

    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn set(&self, source: &str, key: &str, value: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(key.to_string(), value.clone());
        broadcast(&inner, source, key, Some(value));
    }

    pub fn remove(&self, source: &str, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(key).is_some() {
            broadcast(&inner, source, key, None);
        }
    }
}

fn broadcast(inner: &ChannelInner, source: &str, key: &str, value: Option<String>) {
    for (client_id, sender) in &inner.subscribers {
        if client_id == source {
            continue;
        }
        let _ = sender.try_send(ChannelEvent {
            source: source.to_string(),
            key: key.to_string(),
            value: value.clone(),
        });
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ClientStateRecord {
    active_target_ids: BTreeSet<TargetId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StateRecord {
    state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ErrorRecord {
    code: String,
    message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct OnlineStateRecord {
    client_id: String,
    online_state: String,
}

impl ErrorRecord {
    fn from_error(error: &FirestoreError) -> Self {
        Self {
            code: error.code_str().to_string(),
            message: error.message().to_string(),
        }
    }

    fn into_error(self) -> FirestoreError {
        let code = FirestoreErrorCode::parse(&self.code).unwrap_or(FirestoreErrorCode::Unknown);
        FirestoreError::new(code, self.message)
    }
}

impl From<&MutationBatchState> for StateRecord {
    fn from(state: &MutationBatchState) -> Self {
        match state {
            MutationBatchState::Pending => StateRecord::plain("pending"),
            MutationBatchState::Acknowledged => StateRecord::plain("acknowledged"),
            MutationBatchState::Rejected(err) => StateRecord::rejected(err),
        }
    }
}

impl From<&QueryTargetState> for StateRecord {
    fn from(state: &QueryTargetState) -> Self {
        match state {
            QueryTargetState::NotCurrent => StateRecord::plain("not-current"),
            QueryTargetState::Current => StateRecord::plain("current"),
            QueryTargetState::Rejected(err) => StateRecord::rejected(err),
        }
    }
}

impl StateRecord {
    fn plain(state: &str) -> Self {
        Self {
            state: state.to_string(),
            error: None,
        }
    }

    fn rejected(error: &FirestoreError) -> Self {
        Self {
            state: "rejected".to_string(),
            error: Some(ErrorRecord::from_error(error)),
        }
    }

    fn rejection(self) -> FirestoreError {
        self.error
            .map(ErrorRecord::into_error)
            .unwrap_or_else(|| FirestoreError::new(FirestoreErrorCode::Unknown, "Unknown rejection"))
    }

    fn into_mutation_state(self) -> Option<MutationBatchState> {
        match self.state.as_str() {
            "pending" => Some(MutationBatchState::Pending),
            "acknowledged" => Some(MutationBatchState::Acknowledged),
            "rejected" => Some(MutationBatchState::Rejected(self.rejection())),
            _ => None,
        }
    }

    fn into_target_state(self) -> Option<QueryTargetState> {
        match self.state.as_str() {
            "not-current" => Some(QueryTargetState::NotCurrent),
            "current" => Some(QueryTargetState::Current),
            "rejected" => Some(QueryTargetState::Rejected(self.rejection())),
            _ => None,
        }
    }
}

fn online_state_name(online_state: OnlineState) -> &'static str {
    match online_state {
        OnlineState::Unknown => "unknown",
        OnlineState::Online => "online",
        OnlineState::Offline => "offline",
    }
}

fn parse_online_state(name: &str) -> Option<OnlineState> {
    match name {
        "unknown" => Some(OnlineState::Unknown),
        "online" => Some(OnlineState::Online),
        "offline" => Some(OnlineState::Offline),
        _ => None,
    }
}

fn client_key(client_id: &str) -> String {
    format!("{CLIENT_STATE_PREFIX}{client_id}")
}

fn mutation_key(user: &User, batch_id: BatchId) -> String {
    format!("{MUTATION_STATE_PREFIX}{}/{batch_id}", user.storage_key())
}

fn target_key(target_id: TargetId) -> String {
    format!("{TARGET_STATE_PREFIX}{target_id}")
}

fn encode<T: Serialize>(record: &T) -> Option<String> {
    match serde_json::to_string(record) {
        Ok(json) => Some(json),
        Err(err) => {
            log::error!("Failed to encode shared client state: {err}");
            None
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, json: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(record) => Some(record),
        Err(err) => {
            log::warn!("Failed to parse shared client state for {key}: {err}");
            None
        }
    }
}

/// Shared state over an [`InProcessChannel`].
pub struct ChannelSharedClientState {
    client_id: String,
    channel: InProcessChannel,
    queue: AsyncQueue,
    me: Weak<ChannelSharedClientState>,
    state: StdMutex<ChannelState>,
}

struct ChannelState {
    started: bool,
    user: User,
    local_targets: BTreeSet<TargetId>,
    remote_clients: BTreeMap<String, BTreeSet<TargetId>>,
    syncer: Option<Weak<dyn SharedClientStateSyncer>>,
}

impl ChannelState {
    fn all_targets(&self) -> BTreeSet<TargetId> {
        let mut targets = self.local_targets.clone();
        for client_targets in self.remote_clients.values() {
            targets.extend(client_targets.iter().copied());
        }
        targets
    }
}

impl ChannelSharedClientState {
    pub fn new(
        client_id: impl Into<String>,
        channel: InProcessChannel,
        queue: AsyncQueue,
        user: &User,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            client_id: client_id.into(),
            channel,
            queue,
            me: me.clone(),
            state: StdMutex::new(ChannelState {
                started: false,
                user: user.clone(),
                local_targets: BTreeSet::new(),
                remote_clients: BTreeMap::new(),
                syncer: None,
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn publish_client_state(&self, local_targets: &BTreeSet<TargetId>) {
        let record = ClientStateRecord {
            active_target_ids: local_targets.clone(),
        };
        if let Some(json) = encode(&record) {
            self.channel
                .set(&self.client_id, &client_key(&self.client_id), json);
        }
    }

    fn publish_mutation_state(&self, user: &User, batch_id: BatchId, state: &MutationBatchState) {
        if let Some(json) = encode(&StateRecord::from(state)) {
            self.channel
                .set(&self.client_id, &mutation_key(user, batch_id), json);
        }
    }

    fn syncer(&self) -> Option<Arc<dyn SharedClientStateSyncer>> {
        self.state
            .lock()
            .unwrap()
            .syncer
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn handle_event(&self, event: ChannelEvent) {
        if !self.state.lock().unwrap().started {
            return;
        }
        if let Some(client_id) = event.key.strip_prefix(CLIENT_STATE_PREFIX) {
            self.handle_client_state_event(client_id, event.value.as_deref());
        } else if let Some(rest) = event.key.strip_prefix(MUTATION_STATE_PREFIX) {
            if let Some(value) = &event.value {
                self.handle_mutation_event(&event.key, rest, value);
            }
        } else if let Some(target_id) = event.key.strip_prefix(TARGET_STATE_PREFIX) {
            if let Some(value) = &event.value {
                self.handle_target_event(&event.key, target_id, value);
            }
        } else if event.key == ONLINE_STATE_KEY {
            if let Some(value) = &event.value {
                self.handle_online_state_event(value);
            }
        }
    }

    fn handle_client_state_event(&self, client_id: &str, value: Option<&str>) {
        let targets = match value {
            Some(json) => match decode::<ClientStateRecord>(client_id, json) {
                Some(record) => Some(record.active_target_ids),
                None => return,
            },
            None => None,
        };
        let (added, removed) = {
            let mut state = self.state.lock().unwrap();
            let before = state.all_targets();
            match targets {
                Some(targets) => {
                    state.remote_clients.insert(client_id.to_string(), targets);
                }
                None => {
                    state.remote_clients.remove(client_id);
                }
            }
            let after = state.all_targets();
            let added: Vec<TargetId> = after.difference(&before).copied().collect();
            let removed: Vec<TargetId> = before.difference(&after).copied().collect();
            (added, removed)
        };
        if added.is_empty() && removed.is_empty() {
            return;
        }
        let Some(syncer) = self.syncer() else {
            return;
        };
        self.queue.enqueue_and_forget(move || async move {
            syncer.apply_active_targets_change(added, removed).await
        });
    }

    fn handle_mutation_event(&self, key: &str, rest: &str, value: &str) {
        let Some((user_key, batch_id)) = rest.rsplit_once('/') else {
            return;
        };
        let Ok(batch_id) = batch_id.parse::<BatchId>() else {
            log::warn!("Ignoring malformed mutation state key {key}");
            return;
        };
        if self.state.lock().unwrap().user.storage_key() != user_key {
            return;
        }
        let Some(state) = decode::<StateRecord>(key, value).and_then(StateRecord::into_mutation_state) else {
            return;
        };
        let Some(syncer) = self.syncer() else {
            return;
        };
        self.queue.enqueue_and_forget(move || async move {
            syncer.apply_batch_state(batch_id, state).await
        });
    }

    fn handle_target_event(&self, key: &str, target_id: &str, value: &str) {
        let Ok(target_id) = target_id.parse::<TargetId>() else {
            log::warn!("Ignoring malformed target state key {key}");
            return;
        };
        if !self.is_local_query_target(target_id) {
            return;
        }
        let Some(state) = decode::<StateRecord>(key, value).and_then(StateRecord::into_target_state) else {
            return;
        };
        let Some(syncer) = self.syncer() else {
            return;
        };
        self.queue.enqueue_and_forget(move || async move {
            syncer.apply_target_state(target_id, state).await
        });
    }

    fn handle_online_state_event(&self, value: &str) {
        let Some(record) = decode::<OnlineStateRecord>(ONLINE_STATE_KEY, value) else {
            return;
        };
        let Some(online_state) = parse_online_state(&record.online_state) else {
            return;
        };
        let Some(syncer) = self.syncer() else {
            return;
        };
        self.queue.enqueue_and_forget(move || async move {
            syncer.apply_online_state_change(online_state).await
        });
    }
}

impl SharedClientState for ChannelSharedClientState {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>) {
        self.state.lock().unwrap().syncer = Some(syncer);
    }

    /// Reads the state other clients already published and starts following
    /// their updates.
    fn start(&self) -> FirestoreResult<()> {
        let receiver = self.channel.subscribe(&self.client_id);
        let local_targets = {
            let mut state = self.state.lock().unwrap();
            for (key, json) in self.channel.entries_with_prefix(CLIENT_STATE_PREFIX) {
                let Some(client_id) = key.strip_prefix(CLIENT_STATE_PREFIX) else {
                    continue;
                };
                if client_id == self.client_id {
                    continue;
                }
                if let Some(record) = decode::<ClientStateRecord>(&key, &json) {
                    state
                        .remote_clients
                        .insert(client_id.to_string(), record.active_target_ids);
                }
            }
            state.started = true;
            state.local_targets.clone()
        };
        self.publish_client_state(&local_targets);

        if let Some(json) = self.channel.get(ONLINE_STATE_KEY) {
            self.handle_online_state_event(&json);
        }

        let me = self.me.clone();
        runtime::spawn_detached(async move {
            while let Ok(event) = receiver.recv().await {
                let Some(this) = me.upgrade() else {
                    break;
                };
                this.handle_event(event);
            }
        });
        Ok(())
    }

    fn shutdown(&self) {
        let was_started = std::mem::replace(&mut self.state.lock().unwrap().started, false);
        if was_started {
            self.channel.unsubscribe(&self.client_id);
            self.channel
                .remove(&self.client_id, &client_key(&self.client_id));
        }
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        let user = self.state.lock().unwrap().user.clone();
        self.publish_mutation_state(&user, batch_id, &MutationBatchState::Pending);
    }

    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState) {
        let user = self.state.lock().unwrap().user.clone();
        self.publish_mutation_state(&user, batch_id, &state);
        if state != MutationBatchState::Pending {
            // Final states only need to be seen once.
            self.channel
                .remove(&self.client_id, &mutation_key(&user, batch_id));
        }
    }

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let local_targets = {
            let mut state = self.state.lock().unwrap();
            state.local_targets.insert(target_id);
            state.local_targets.clone()
        };
        self.publish_client_state(&local_targets);
        let key = target_key(target_id);
        self.channel
            .get(&key)
            .and_then(|json| decode::<StateRecord>(&key, &json))
            .and_then(StateRecord::into_target_state)
            .unwrap_or(QueryTargetState::NotCurrent)
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        let local_targets = {
            let mut state = self.state.lock().unwrap();
            state.local_targets.remove(&target_id);
            state.local_targets.clone()
        };
        self.publish_client_state(&local_targets);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.state.lock().unwrap().local_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.state.lock().unwrap().all_targets().contains(&target_id)
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.state.lock().unwrap().all_targets()
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState) {
        if let Some(json) = encode(&StateRecord::from(&state)) {
            self.channel.set(&self.client_id, &target_key(target_id), json);
        }
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.channel.remove(&self.client_id, &target_key(target_id));
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        let old_user = std::mem::replace(&mut self.state.lock().unwrap().user, user.clone());
        for batch_id in removed_batch_ids {
            self.channel
                .remove(&self.client_id, &mutation_key(&old_user, *batch_id));
        }
        for batch_id in added_batch_ids {
            self.publish_mutation_state(user, *batch_id, &MutationBatchState::Pending);
        }
    }

    fn set_online_state(&self, online_state: OnlineState) {
        let record = OnlineStateRecord {
            client_id: self.client_id.clone(),
            online_state: online_state_name(online_state).to_string(),
        };
        if let Some(json) = encode(&record) {
            self.channel.set(&self.client_id, ONLINE_STATE_KEY, json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::permission_denied;
    use futures::channel::mpsc;
    use futures::StreamExt;

    #[derive(Debug, PartialEq)]
    enum Applied {
        Batch(BatchId, MutationBatchState),
        Target(TargetId, QueryTargetState),
        Active(Vec<TargetId>, Vec<TargetId>),
        Online(OnlineState),
    }

    struct RecordingSyncer {
        sender: mpsc::UnboundedSender<Applied>,
    }

    #[async_trait]
    impl SharedClientStateSyncer for RecordingSyncer {
        async fn apply_batch_state(&self, batch_id: BatchId, state: MutationBatchState) -> FirestoreResult<()> {
            let _ = self.sender.unbounded_send(Applied::Batch(batch_id, state));
            Ok(())
        }

        async fn apply_target_state(&self, target_id: TargetId, state: QueryTargetState) -> FirestoreResult<()> {
            let _ = self.sender.unbounded_send(Applied::Target(target_id, state));
            Ok(())
        }

        async fn apply_active_targets_change(
            &self,
            added: Vec<TargetId>,
            removed: Vec<TargetId>,
        ) -> FirestoreResult<()> {
            let _ = self.sender.unbounded_send(Applied::Active(added, removed));
            Ok(())
        }

        async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
            let _ = self.sender.unbounded_send(Applied::Online(online_state));
            Ok(())
        }
    }

    fn client(
        id: &str,
        channel: &InProcessChannel,
    ) -> (Arc<ChannelSharedClientState>, Arc<RecordingSyncer>, mpsc::UnboundedReceiver<Applied>) {
        let shared = ChannelSharedClientState::new(id, channel.clone(), AsyncQueue::new(), &User::unauthenticated());
        let (sender, receiver) = mpsc::unbounded();
        let syncer = Arc::new(RecordingSyncer { sender });
        let weak: Weak<dyn SharedClientStateSyncer> = Arc::downgrade(&syncer) as Weak<dyn SharedClientStateSyncer>;
        shared.set_syncer(weak);
        shared.start().unwrap();
        (shared, syncer, receiver)
    }

    #[tokio::test]
    async fn batch_states_reach_other_clients() {
        let channel = InProcessChannel::new();
        let (primary, _primary_syncer, _) = client("primary", &channel);
        let (_secondary, _syncer, mut applied) = client("secondary", &channel);

        primary.update_mutation_state(3, MutationBatchState::Rejected(permission_denied("nope")));
        assert_eq!(
            applied.next().await,
            Some(Applied::Batch(3, MutationBatchState::Rejected(permission_denied("nope"))))
        );
        assert!(channel.entries_with_prefix(MUTATION_STATE_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn active_targets_are_aggregated_across_clients() {
        let channel = InProcessChannel::new();
        let (primary, _primary_syncer, mut applied) = client("primary", &channel);
        let (secondary, _syncer, _) = client("secondary", &channel);

        secondary.add_local_query_target(2);
        assert_eq!(applied.next().await, Some(Applied::Active(vec![2], vec![])));
        assert!(primary.is_active_query_target(2));
        assert!(!primary.is_local_query_target(2));

        secondary.shutdown();
        assert_eq!(applied.next().await, Some(Applied::Active(vec![], vec![2])));
        assert!(primary.get_all_active_query_targets().is_empty());
    }

    #[tokio::test]
    async fn target_state_only_reaches_listening_clients() {
        let channel = InProcessChannel::new();
        let (primary, _primary_syncer, _) = client("primary", &channel);
        let (secondary, _syncer, mut applied) = client("secondary", &channel);

        primary.update_query_state(4, QueryTargetState::Current);
        primary.set_online_state(OnlineState::Online);
        // Target 4 is not listened to by the secondary, so only the online
        // state arrives.
        assert_eq!(applied.next().await, Some(Applied::Online(OnlineState::Online)));

        assert_eq!(secondary.add_local_query_target(4), QueryTargetState::Current);
        primary.update_query_state(4, QueryTargetState::NotCurrent);
        assert_eq!(
            applied.next().await,
            Some(Applied::Target(4, QueryTargetState::NotCurrent))
        );
    }

    #[test]
    fn memory_state_tracks_local_targets() {
        let shared = MemorySharedClientState::new();
        assert_eq!(shared.add_local_query_target(2), QueryTargetState::NotCurrent);
        shared.update_query_state(2, QueryTargetState::Current);
        assert_eq!(shared.add_local_query_target(2), QueryTargetState::Current);
        assert!(shared.is_active_query_target(2));
        shared.remove_local_query_target(2);
        assert!(shared.get_all_active_query_targets().is_empty());
    }
}
