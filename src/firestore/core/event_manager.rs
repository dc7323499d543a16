//! Fans view snapshots out to user listeners.
//!
//! Several listeners of the same query share one listen in the sync engine.
//! Each listener filters the snapshots it is shown according to its options
//! and holds back the first snapshot until it is worth raising.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

pub type SnapshotCallback = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only change metadata such as `from_cache` or
    /// pending writes.
    pub include_metadata_changes: bool,
    /// Hold back cached results while the client may still be online.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_include_metadata_changes(mut self, include: bool) -> Self {
        self.include_metadata_changes = include;
        self
    }

    pub fn with_wait_for_sync_when_online(mut self, wait: bool) -> Self {
        self.wait_for_sync_when_online = wait;
        self
    }
}

/// One user listener of a query.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    callback: SnapshotCallback,
    state: StdMutex<QueryListenerState>,
}

struct QueryListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new<F>(query: Query, options: ListenOptions, callback: F) -> Arc<Self>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            query,
            options,
            callback: Arc::new(callback),
            state: StdMutex::new(QueryListenerState {
                raised_initial_event: false,
                snapshot: None,
                online_state: OnlineState::Unknown,
            }),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns the snapshot to raise for `snapshot`, if any.
    fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> Option<ViewSnapshot> {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let doc_changes = snapshot
                .doc_changes
                .iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .cloned()
                .collect();
            ViewSnapshot {
                doc_changes,
                exclude_metadata_changes: true,
                ..snapshot
            }
        };

        let mut state = self.state.lock().unwrap();
        let raised = if !state.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, state.online_state) {
                state.raised_initial_event = true;
                Some(initial_event(&snapshot))
            } else {
                None
            }
        } else if self.should_raise_event(state.snapshot.as_ref(), &snapshot) {
            Some(snapshot.clone())
        } else {
            None
        };
        state.snapshot = Some(snapshot);
        raised
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> Option<ViewSnapshot> {
        let mut state = self.state.lock().unwrap();
        state.online_state = online_state;
        let snapshot = state.snapshot.as_ref()?;
        if !state.raised_initial_event && self.should_raise_initial_event(snapshot, online_state) {
            let event = initial_event(snapshot);
            state.raised_initial_event = true;
            return Some(event);
        }
        None
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is not worth raising until the backend had
        // a chance to answer.
        !snapshot.docs.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, previous: Option<&ViewSnapshot>, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed =
            previous.is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise(&self, result: FirestoreResult<ViewSnapshot>) {
        (self.callback)(result);
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    let mut event = ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.docs.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
    );
    event.exclude_metadata_changes = snapshot.exclude_metadata_changes;
    event
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

#[derive(Default)]
struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Routes sync engine events to [`QueryListener`]s.
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: StdMutex<EventManagerState>,
}

type Dispatch = Vec<(Arc<QueryListener>, FirestoreResult<ViewSnapshot>)>;

impl EventManager {
    /// Creates the manager and registers it as the sync engine's listener.
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine: Arc::clone(&sync_engine),
            state: StdMutex::new(EventManagerState::default()),
        });
        let listener: Weak<dyn SyncEngineListener> = Arc::downgrade(&manager) as Weak<dyn SyncEngineListener>;
        sync_engine.set_listener(listener);
        manager
    }

    /// Adds `listener`. The first listener of a query starts the listen in
    /// the sync engine; later ones reuse its latest snapshot.
    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let query_id = listener.query().canonical_id();
        let first_listen = {
            let mut state = self.state.lock().unwrap();
            let online_state = state.online_state;
            let first = !state.queries.contains_key(&query_id);
            let info = state
                .queries
                .entry(query_id.clone())
                .or_insert_with(|| QueryListenersInfo {
                    view_snapshot: None,
                    listeners: Vec::new(),
                });
            info.listeners.push(Arc::clone(&listener));
            // Online state never raises without a snapshot, so this only
            // records it.
            let _ = listener.apply_online_state_change(online_state);
            first
        };

        let mut dispatch = Dispatch::new();
        if first_listen {
            match self.sync_engine.listen(listener.query().clone()).await {
                Ok(snapshot) => {
                    let mut state = self.state.lock().unwrap();
                    if let Some(info) = state.queries.get_mut(&query_id) {
                        info.view_snapshot = Some(snapshot.clone());
                        for each in &info.listeners {
                            if let Some(raised) = each.on_view_snapshot(snapshot.clone()) {
                                dispatch.push((Arc::clone(each), Ok(raised)));
                            }
                        }
                    }
                }
                Err(err) => {
                    let info = self.state.lock().unwrap().queries.remove(&query_id);
                    log::warn!("Failed to listen to {query_id}: {err}");
                    if let Some(info) = info {
                        for each in info.listeners {
                            dispatch.push((each, Err(err.clone())));
                        }
                    }
                }
            }
        } else {
            let state = self.state.lock().unwrap();
            let snapshot = state
                .queries
                .get(&query_id)
                .and_then(|info| info.view_snapshot.clone());
            if let Some(snapshot) = snapshot {
                if let Some(raised) = listener.on_view_snapshot(snapshot) {
                    dispatch.push((Arc::clone(&listener), Ok(raised)));
                }
            }
        }
        raise_all(dispatch);
        Ok(())
    }

    /// Removes `listener`; the last listener of a query stops the listen.
    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let query_id = listener.query().canonical_id();
        let last_listen = {
            let mut state = self.state.lock().unwrap();
            let Some(info) = state.queries.get_mut(&query_id) else {
                return Ok(());
            };
            info.listeners.retain(|each| !Arc::ptr_eq(each, listener));
            if info.listeners.is_empty() {
                state.queries.remove(&query_id);
                true
            } else {
                false
            }
        };
        if last_listen {
            self.sync_engine.unlisten(listener.query().clone()).await?;
        }
        Ok(())
    }

    pub fn listener_count(&self, query: &Query) -> usize {
        self.state
            .lock()
            .unwrap()
            .queries
            .get(&query.canonical_id())
            .map_or(0, |info| info.listeners.len())
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut dispatch = Dispatch::new();
        {
            let mut state = self.state.lock().unwrap();
            for snapshot in snapshots {
                let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                for listener in &info.listeners {
                    if let Some(raised) = listener.on_view_snapshot(snapshot.clone()) {
                        dispatch.push((Arc::clone(listener), Ok(raised)));
                    }
                }
                info.view_snapshot = Some(snapshot);
            }
        }
        raise_all(dispatch);
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let info = self
            .state
            .lock()
            .unwrap()
            .queries
            .remove(&query.canonical_id());
        if let Some(info) = info {
            for listener in info.listeners {
                listener.raise(Err(error.clone()));
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let mut dispatch = Dispatch::new();
        {
            let mut state = self.state.lock().unwrap();
            state.online_state = online_state;
            for info in state.queries.values() {
                for listener in &info.listeners {
                    if let Some(raised) = listener.apply_online_state_change(online_state) {
                        dispatch.push((Arc::clone(listener), Ok(raised)));
                    }
                }
            }
        }
        raise_all(dispatch);
    }
}

fn raise_all(dispatch: Dispatch) {
    for (listener, result) in dispatch {
        listener.raise(result);
    }
}
