//! The client facade: builds every component, wires them together and runs
//! each public operation on the client's async queue.

use std::sync::{Arc, Weak};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};

use crate::firestore::core::event_manager::{EventManager, ListenOptions, QueryListener};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::SyncEngine;
use crate::firestore::core::transaction::{
    Transaction, TransactionRunner, UpdateFunction, DEFAULT_TRANSACTION_MAX_ATTEMPTS,
};
use crate::firestore::core::types::{OnlineState, User};
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, failed_precondition, internal_error, unavailable, FirestoreResult};
use crate::firestore::local::kv_store::KvStore;
use crate::firestore::local::local_store::{DocumentMap, LocalStore};
use crate::firestore::local::lru_garbage_collector::{LruParams, LruScheduler};
use crate::firestore::local::persistence::{
    Persistence, PersistenceSettings, PrimaryStateListener, ZombieRegistry,
};
use crate::firestore::local::shared_client_state::{
    ChannelSharedClientState, InProcessChannel, MemorySharedClientState, SharedClientState,
};
use crate::firestore::model::{Document, DocumentKey, MaybeDocument, Mutation};
use crate::firestore::remote::connection::Connection;
use crate::firestore::remote::datastore::{Datastore, RemoteDatastore};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::util::async_queue::AsyncQueue;
use crate::firestore::util::backoff::BackoffSettings;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub client_id: String,
    /// Lets several clients share one store, with one of them primary.
    pub multi_tab: bool,
    pub lru_params: LruParams,
    pub max_concurrent_limbo_resolutions: usize,
    pub backoff: BackoffSettings,
    pub transaction_max_attempts: usize,
}

impl ClientSettings {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_multi_tab(mut self, multi_tab: bool) -> Self {
        self.multi_tab = multi_tab;
        self
    }

    pub fn with_lru_params(mut self, lru_params: LruParams) -> Self {
        self.lru_params = lru_params;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_transaction_max_attempts(mut self, attempts: usize) -> Self {
        self.transaction_max_attempts = attempts;
        self
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            multi_tab: false,
            lru_params: LruParams::default(),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            backoff: BackoffSettings::default(),
            transaction_max_attempts: DEFAULT_TRANSACTION_MAX_ATTEMPTS,
        }
    }
}

fn generate_client_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

/// The environment a client runs in: its storage, its backend and, for
/// multi-tab clients, the channel and zombie registry shared with the other
/// clients of the same store.
#[derive(Clone)]
pub struct ClientContext {
    pub store: Arc<dyn KvStore>,
    pub connection: Arc<dyn Connection>,
    pub channel: InProcessChannel,
    pub zombie_registry: ZombieRegistry,
    pub user: User,
}

impl ClientContext {
    pub fn new(store: Arc<dyn KvStore>, connection: Arc<dyn Connection>) -> Self {
        Self {
            store,
            connection,
            channel: InProcessChannel::new(),
            zombie_registry: ZombieRegistry::new(),
            user: User::unauthenticated(),
        }
    }

    pub fn with_channel(mut self, channel: InProcessChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_zombie_registry(mut self, registry: ZombieRegistry) -> Self {
        self.zombie_registry = registry;
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = user;
        self
    }
}

#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: ClientSettings,
    queue: AsyncQueue,
    persistence: Arc<Persistence>,
    local_store: Arc<LocalStore>,
    datastore: Arc<RemoteDatastore>,
    remote_store: Arc<RemoteStore>,
    shared_client_state: Arc<dyn SharedClientState>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    lru_scheduler: Arc<LruScheduler>,
}

impl FirestoreClient {
    /// Builds the client and starts it. Resolves once persistence, both
    /// stores and the primary lease are settled.
    pub async fn start(settings: ClientSettings, context: ClientContext) -> FirestoreResult<Self> {
        let queue = AsyncQueue::with_backoff(settings.backoff);
        let user = context.user.clone();
        log::debug!("Initializing client {}. user={:?}", settings.client_id, user.uid());

        let persistence = Persistence::new(
            Arc::clone(&context.store),
            PersistenceSettings::new(settings.client_id.clone())
                .with_multi_tab(settings.multi_tab)
                .with_zombie_registry(context.zombie_registry.clone()),
            queue.clone(),
        );
        let local_store = LocalStore::new(Arc::clone(&persistence), &user, settings.lru_params.clone());
        let datastore = RemoteDatastore::new(Arc::clone(&context.connection));
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            Arc::clone(&datastore),
            queue.clone(),
            settings.backoff,
        );
        let shared_client_state: Arc<dyn SharedClientState> = if settings.multi_tab {
            ChannelSharedClientState::new(
                settings.client_id.clone(),
                context.channel.clone(),
                queue.clone(),
                &user,
            )
        } else {
            Arc::new(MemorySharedClientState::new())
        };
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            Arc::clone(&remote_store),
            Arc::clone(&shared_client_state),
            user,
            settings.max_concurrent_limbo_resolutions,
            false,
        );
        let event_manager = EventManager::new(Arc::clone(&sync_engine));
        let lru_scheduler = LruScheduler::new(&settings.lru_params, queue.clone());

        let client = Self {
            inner: Arc::new(ClientInner {
                settings,
                queue,
                persistence,
                local_store,
                datastore,
                remote_store,
                shared_client_state,
                sync_engine,
                event_manager,
                lru_scheduler,
            }),
        };
        let inner = Arc::clone(&client.inner);
        client
            .inner
            .queue
            .enqueue(move || async move { inner.initialize().await })
            .await?;
        Ok(client)
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.inner.queue.is_shutting_down() {
            Err(failed_precondition("The client has already been terminated."))
        } else {
            Ok(())
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_shutting_down()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.settings.client_id
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    pub fn is_primary(&self) -> bool {
        self.inner.sync_engine.is_primary_client()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.sync_engine.online_state()
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.inner.sync_engine
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local_store
    }

    /// Starts listening to `query`. Snapshots and the final error go to
    /// `callback`. Dropping the registration stops the listen.
    pub fn listen<F>(&self, query: Query, options: ListenOptions, callback: F) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        self.verify_not_terminated()?;
        let listener = QueryListener::new(query, options, callback);
        let event_manager = Arc::clone(&self.inner.event_manager);
        let registered = Arc::clone(&listener);
        self.inner
            .queue
            .enqueue_and_forget(move || async move { event_manager.listen(registered).await });
        Ok(ListenerRegistration {
            client: Arc::downgrade(&self.inner),
            listener: Some(listener),
        })
    }

    fn unlisten(inner: &Arc<ClientInner>, listener: Arc<QueryListener>) {
        // Unlisten after termination is a no-op.
        if inner.queue.is_shutting_down() {
            return;
        }
        let event_manager = Arc::clone(&inner.event_manager);
        inner
            .queue
            .enqueue_and_forget(move || async move { event_manager.unlisten(&listener).await });
    }

    /// Applies `mutations` locally and resolves once the backend accepted or
    /// rejected them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let (callback, result) = oneshot::channel();
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue_and_forget(move || async move { sync_engine.write(mutations, callback).await });
        result
            .await
            .unwrap_or_else(|_| Err(cancelled("The write was dropped before it was acknowledged")))
    }

    /// Resolves once every write pending now has been acknowledged or
    /// rejected. A user change cancels the wait.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let (callback, result) = oneshot::channel();
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner.queue.enqueue_and_forget(move || async move {
            sync_engine.register_pending_writes_callback(callback).await
        });
        result
            .await
            .unwrap_or_else(|_| Err(cancelled("Waiting for pending writes was cancelled")))
    }

    /// The cached document, `None` if it is known not to exist, or
    /// `Unavailable` if the cache does not know.
    pub async fn get_document_from_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.inner.local_store);
        let maybe_doc = self
            .inner
            .queue
            .enqueue(move || async move { local_store.read_document(&key).await })
            .await?;
        match maybe_doc {
            Some(MaybeDocument::Document(doc)) => Ok(Some(doc)),
            Some(MaybeDocument::NoDocument(_)) => Ok(None),
            _ => Err(unavailable(
                "Failed to get document from cache. (However, this document may exist on the server. Run again without reading from the cache to attempt to retrieve the document from the server.)",
            )),
        }
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(move || async move {
                let result = local_store.execute_query(&query, true).await?;
                let documents: DocumentMap = result
                    .documents
                    .into_iter()
                    .map(|(key, doc)| (key, Some(MaybeDocument::from(doc))))
                    .collect();
                let mut view = View::new(query, result.remote_keys);
                let changes = view.compute_doc_changes(&documents, None);
                view.apply_changes(changes, false, None)
                    .snapshot
                    .ok_or_else(|| internal_error("Cache query produced no snapshot"))
            })
            .await
    }

    /// Runs `update_function` in a transaction against the backend, retrying
    /// on contention up to the configured number of attempts.
    pub async fn run_transaction<T, F>(&self, update_function: F) -> FirestoreResult<T>
    where
        T: Send + 'static,
        F: Fn(Arc<Transaction>) -> BoxFuture<'static, FirestoreResult<T>> + Send + Sync + 'static,
    {
        self.verify_not_terminated()?;
        let update_function: UpdateFunction<T> = Arc::new(update_function);
        let datastore: Arc<dyn Datastore> = Arc::clone(&self.inner.datastore) as Arc<dyn Datastore>;
        TransactionRunner::new(
            self.inner.queue.clone(),
            datastore,
            update_function,
            self.inner.settings.transaction_max_attempts,
            self.inner.settings.backoff,
        )
        .run()
        .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = Arc::clone(&self.inner.remote_store);
        self.inner
            .queue
            .enqueue(move || async move { remote_store.enable_network().await })
            .await
    }

    /// Closes the streams. Pending writes stay queued and listeners see
    /// cached results until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = Arc::clone(&self.inner.remote_store);
        self.inner
            .queue
            .enqueue(move || async move { remote_store.disable_network().await })
            .await
    }

    /// Switches the client to `user`.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = Arc::clone(&self.inner.remote_store);
        self.inner
            .queue
            .enqueue(move || async move {
                log::debug!("Credential changed. Current user: {:?}", user.uid());
                remote_store.handle_credential_change(user).await
            })
            .await
    }

    /// Shuts every component down. Later operations fail with
    /// `FailedPrecondition`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Ok(());
        }
        self.inner.queue.enter_restricted_mode();
        let inner = Arc::clone(&self.inner);
        let result = self
            .inner
            .queue
            .enqueue_even_while_restricted(move || async move { inner.shutdown().await })
            .await;
        self.inner.queue.shutdown();
        result
    }
}

impl ClientInner {
    async fn initialize(self: &Arc<Self>) -> FirestoreResult<()> {
        self.persistence.start().await?;
        self.local_store.start().await?;
        self.shared_client_state.start()?;
        self.remote_store.start().await?;

        // Called right away with the current state, so every store must be
        // started first.
        let sync_engine = Arc::downgrade(&self.sync_engine);
        let local_store = Arc::downgrade(&self.local_store);
        let lru_scheduler = Arc::clone(&self.lru_scheduler);
        let listener: PrimaryStateListener = Arc::new(move |is_primary| {
            let sync_engine = sync_engine.clone();
            let local_store = local_store.clone();
            let lru_scheduler = Arc::clone(&lru_scheduler);
            async move {
                let (Some(sync_engine), Some(local_store)) = (sync_engine.upgrade(), local_store.upgrade()) else {
                    return Ok(());
                };
                sync_engine.apply_primary_state(is_primary).await?;
                if is_primary && !lru_scheduler.is_started() {
                    lru_scheduler.start(local_store);
                } else if !is_primary {
                    lru_scheduler.stop();
                }
                Ok(())
            }
            .boxed()
        });
        self.persistence.set_primary_state_listener(listener).await
    }

    async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("Terminating client {}", self.settings.client_id);
        self.lru_scheduler.stop();
        self.remote_store.shutdown().await;
        self.shared_client_state.shutdown();
        self.datastore.terminate();
        self.persistence.shutdown().await
    }
}

/// Handle for a listener added with [`FirestoreClient::listen`]. The listen
/// stops when the handle is dropped or [`ListenerRegistration::remove`] is
/// called.
pub struct ListenerRegistration {
    client: Weak<ClientInner>,
    listener: Option<Arc<QueryListener>>,
}

impl ListenerRegistration {
    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let (Some(listener), Some(client)) = (self.listener.take(), self.client.upgrade()) {
            FirestoreClient::unlisten(&client, listener);
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}
