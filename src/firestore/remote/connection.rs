//! Transport seam between the remote store and the backend.
//!
//! Messages are already decoded: the listen stream yields [`WatchChange`]s
//! and the write stream yields [`WriteResponse`]s. [`InMemoryConnection`]
//! hands the backend side of every opened stream to the test driving it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::firestore::core::types::TargetId;
use crate::firestore::error::{failed_precondition, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DocumentKey, MaybeDocument, Mutation, MutationResult, NoDocument, SnapshotVersion,
};
use crate::firestore::remote::watch_change::WatchChange;

/// Sent on the listen stream.
#[derive(Clone, Debug)]
pub enum ListenRequest {
    AddTarget(TargetData),
    RemoveTarget(TargetId),
}

/// Sent on the write stream. The first request after opening is the
/// handshake and carries no mutations.
#[derive(Clone, Debug, Default)]
pub struct WriteRequest {
    pub stream_token: Vec<u8>,
    pub mutations: Vec<Mutation>,
}

impl WriteRequest {
    pub fn is_handshake(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Received on the write stream, and returned by a unary commit.
#[derive(Clone, Debug, Default)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// Client half of an open duplex stream.
pub struct StreamChannel<Req, Resp> {
    requests: async_channel::Sender<Req>,
    responses: async_channel::Receiver<FirestoreResult<Resp>>,
}

impl<Req, Resp> StreamChannel<Req, Resp> {
    /// Creates a connected client and backend pair.
    pub fn pair() -> (Self, BackendStream<Req, Resp>) {
        let (request_tx, request_rx) = async_channel::unbounded();
        let (response_tx, response_rx) = async_channel::unbounded();
        (
            Self {
                requests: request_tx,
                responses: response_rx,
            },
            BackendStream {
                requests: request_rx,
                responses: response_tx,
            },
        )
    }

    pub fn send(&self, request: Req) -> FirestoreResult<()> {
        self.requests
            .try_send(request)
            .map_err(|_| unavailable("Stream is closed"))
    }

    /// Next message, or `None` once the backend closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Resp>> {
        self.responses.recv().await.ok()
    }

    pub fn close(&self) {
        self.requests.close();
        self.responses.close();
    }
}

/// Backend half of an open duplex stream.
pub struct BackendStream<Req, Resp> {
    requests: async_channel::Receiver<Req>,
    responses: async_channel::Sender<FirestoreResult<Resp>>,
}

impl<Req, Resp> BackendStream<Req, Resp> {
    /// Next request from the client, or `None` once the client closed.
    pub async fn next_request(&self) -> Option<Req> {
        self.requests.recv().await.ok()
    }

    pub fn try_next_request(&self) -> Option<Req> {
        self.requests.try_recv().ok()
    }

    pub fn send(&self, response: Resp) -> bool {
        self.responses.try_send(Ok(response)).is_ok()
    }

    /// Fails the stream with `error` and closes it.
    pub fn fail(&self, error: FirestoreError) {
        let _ = self.responses.try_send(Err(error));
        self.responses.close();
    }

    pub fn close(&self) {
        self.responses.close();
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed() || self.responses.is_closed()
    }
}

pub type ListenStreamChannel = StreamChannel<ListenRequest, WatchChange>;
pub type WriteStreamChannel = StreamChannel<WriteRequest, WriteResponse>;
pub type ListenBackendStream = BackendStream<ListenRequest, WatchChange>;
pub type WriteBackendStream = BackendStream<WriteRequest, WriteResponse>;

/// Opens streams and issues unary calls against the backend.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_listen_stream(&self) -> FirestoreResult<ListenStreamChannel>;

    async fn open_write_stream(&self) -> FirestoreResult<WriteStreamChannel>;

    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteResponse>;

    /// Current state of each key, in no particular order.
    async fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
    ) -> FirestoreResult<Vec<MaybeDocument>>;
}

/// A connection whose backend is the test.
///
/// Every opened stream's backend half is delivered through
/// [`InMemoryConnection::next_listen_stream`] and
/// [`InMemoryConnection::next_write_stream`]. Unary calls run against a
/// small document map with a monotonically increasing commit version.
pub struct InMemoryConnection {
    listen_streams: (
        async_channel::Sender<ListenBackendStream>,
        async_channel::Receiver<ListenBackendStream>,
    ),
    write_streams: (
        async_channel::Sender<WriteBackendStream>,
        async_channel::Receiver<WriteBackendStream>,
    ),
    failed_opens: AtomicUsize,
    backend: StdMutex<BackendState>,
}

#[derive(Default)]
struct BackendState {
    documents: BTreeMap<DocumentKey, MaybeDocument>,
    version: i64,
    commits: usize,
}

impl InMemoryConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listen_streams: async_channel::unbounded(),
            write_streams: async_channel::unbounded(),
            failed_opens: AtomicUsize::new(0),
            backend: StdMutex::new(BackendState::default()),
        })
    }

    /// Backend half of the next listen stream the client opens.
    pub async fn next_listen_stream(&self) -> Option<ListenBackendStream> {
        self.listen_streams.1.recv().await.ok()
    }

    pub async fn next_write_stream(&self) -> Option<WriteBackendStream> {
        self.write_streams.1.recv().await.ok()
    }

    pub fn has_pending_listen_stream(&self) -> bool {
        !self.listen_streams.1.is_empty()
    }

    /// Makes the next `count` stream opens fail with `unavailable`.
    pub fn fail_next_opens(&self, count: usize) {
        self.failed_opens.store(count, Ordering::SeqCst);
    }

    /// Stores a document as the backend's current state for unary reads.
    pub fn set_document(&self, document: MaybeDocument) {
        let mut backend = self.backend.lock().unwrap();
        backend.version = backend.version.max(document.version().to_micros());
        backend
            .documents
            .insert(document.key().clone(), document);
    }

    pub fn document(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        self.backend.lock().unwrap().documents.get(key).cloned()
    }

    pub fn commit_count(&self) -> usize {
        self.backend.lock().unwrap().commits
    }

    fn check_open(&self) -> FirestoreResult<()> {
        let failed = self
            .failed_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok();
        if failed {
            Err(unavailable("Connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn open_listen_stream(&self) -> FirestoreResult<ListenStreamChannel> {
        self.check_open()?;
        let (client, backend) = StreamChannel::pair();
        self.listen_streams
            .0
            .try_send(backend)
            .map_err(|_| unavailable("Backend is gone"))?;
        Ok(client)
    }

    async fn open_write_stream(&self) -> FirestoreResult<WriteStreamChannel> {
        self.check_open()?;
        let (client, backend) = StreamChannel::pair();
        self.write_streams
            .0
            .try_send(backend)
            .map_err(|_| unavailable("Backend is gone"))?;
        Ok(client)
    }

    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteResponse> {
        let mut backend = self.backend.lock().unwrap();
        for mutation in &mutations {
            let current = backend.documents.get(mutation.key());
            if !mutation.precondition().is_valid_for(current) {
                return Err(failed_precondition(format!(
                    "Precondition failed for {}",
                    mutation.key()
                )));
            }
        }
        backend.version += 1_000_000;
        backend.commits += 1;
        let commit_version = SnapshotVersion::from_micros(backend.version);
        let mut mutation_results = Vec::with_capacity(mutations.len());
        for mutation in &mutations {
            if matches!(mutation, Mutation::Verify { .. }) {
                mutation_results.push(MutationResult::new(commit_version, None));
                continue;
            }
            let result = MutationResult::new(commit_version, None);
            let current = backend.documents.get(mutation.key()).cloned();
            if let Some(updated) = mutation.apply_to_remote_document(current.as_ref(), &result) {
                backend.documents.insert(mutation.key().clone(), updated);
            }
            mutation_results.push(result);
        }
        Ok(WriteResponse {
            stream_token: Vec::new(),
            commit_version,
            mutation_results,
        })
    }

    async fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
    ) -> FirestoreResult<Vec<MaybeDocument>> {
        let backend = self.backend.lock().unwrap();
        let read_version = SnapshotVersion::from_micros(backend.version.max(1));
        Ok(keys
            .into_iter()
            .map(|key| match backend.documents.get(&key) {
                Some(doc) => doc.clone(),
                None => NoDocument::new(key, read_version, false).into(),
            })
            .collect())
    }
}
