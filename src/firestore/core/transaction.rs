//! Optimistic read-write transactions against the backend.
//!
//! Reads go straight to the [`Datastore`] and record the version of every
//! document seen. Writes are buffered and sent in a single commit, together
//! with `Verify` mutations that pin the documents that were only read. A
//! commit whose preconditions no longer hold fails and the runner tries the
//! whole update function again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;

use crate::firestore::error::{
    aborted, failed_precondition, invalid_argument, is_permanent_error, FirestoreErrorCode,
    FirestoreError, FirestoreResult,
};
use crate::firestore::model::{
    DocumentKey, FieldMask, MaybeDocument, Mutation, Precondition, SnapshotVersion,
};
use crate::firestore::remote::datastore::Datastore;
use crate::firestore::util::async_queue::{AsyncQueue, TimerId};
use crate::firestore::util::backoff::{BackoffSettings, ExponentialBackoff};
use crate::firestore::value::MapValue;

pub const DEFAULT_TRANSACTION_MAX_ATTEMPTS: usize = 5;

#[derive(Default)]
struct TransactionState {
    /// Version of each document read, `SnapshotVersion::min()` for documents
    /// that did not exist.
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    written_docs: BTreeSet<DocumentKey>,
    committed: bool,
}

/// One attempt of a transaction. Handed to the update function, which reads
/// through [`Transaction::lookup`] and writes through the buffered methods.
pub struct Transaction {
    datastore: Arc<dyn Datastore>,
    state: StdMutex<TransactionState>,
}

impl Transaction {
    pub fn new(datastore: Arc<dyn Datastore>) -> Arc<Self> {
        Arc::new(Self {
            datastore,
            state: StdMutex::new(TransactionState::default()),
        })
    }

    /// Reads `keys` from the backend. All reads must happen before the first
    /// write.
    pub async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>> {
        {
            let state = self.state.lock().unwrap();
            ensure_not_committed(&state)?;
            if !state.mutations.is_empty() {
                return Err(invalid_argument(
                    "Firestore transactions require all reads to be executed before all writes.",
                ));
            }
        }
        let docs = self.datastore.lookup(keys).await?;
        let mut state = self.state.lock().unwrap();
        for doc in &docs {
            record_version(&mut state, doc)?;
        }
        Ok(docs)
    }

    /// Overwrites the document. Fails at commit if a document that was read
    /// has changed since.
    pub fn set(&self, key: DocumentKey, value: MapValue) -> FirestoreResult<()> {
        let mut state = self.state.lock().unwrap();
        ensure_not_committed(&state)?;
        let precondition = precondition(&state, &key);
        write(
            &mut state,
            Mutation::Set {
                key,
                value,
                precondition,
            },
        );
        Ok(())
    }

    /// Updates the fields in `field_mask` of an existing document.
    pub fn update(&self, key: DocumentKey, data: MapValue, field_mask: FieldMask) -> FirestoreResult<()> {
        let mut state = self.state.lock().unwrap();
        ensure_not_committed(&state)?;
        let precondition = precondition_for_update(&state, &key)?;
        write(
            &mut state,
            Mutation::Patch {
                key,
                data,
                field_mask,
                precondition,
            },
        );
        Ok(())
    }

    pub fn delete(&self, key: DocumentKey) -> FirestoreResult<()> {
        let mut state = self.state.lock().unwrap();
        ensure_not_committed(&state)?;
        let precondition = precondition(&state, &key);
        write(&mut state, Mutation::Delete { key, precondition });
        Ok(())
    }

    /// Sends the buffered writes in one commit.
    pub async fn commit(&self) -> FirestoreResult<()> {
        let mutations = {
            let mut state = self.state.lock().unwrap();
            ensure_not_committed(&state)?;
            let mut mutations = std::mem::take(&mut state.mutations);
            // Documents that were read but not written still have to be
            // unchanged when the commit lands.
            let verified: Vec<DocumentKey> = state
                .read_versions
                .keys()
                .filter(|key| !state.written_docs.contains(*key))
                .cloned()
                .collect();
            for key in verified {
                let precondition = precondition(&state, &key);
                mutations.push(Mutation::verify(key, precondition));
            }
            state.committed = true;
            mutations
        };
        self.datastore.commit(mutations).await.map(|_| ())
    }
}

fn ensure_not_committed(state: &TransactionState) -> FirestoreResult<()> {
    if state.committed {
        Err(failed_precondition(
            "A transaction object cannot be used after its update callback has been invoked.",
        ))
    } else {
        Ok(())
    }
}

fn record_version(state: &mut TransactionState, doc: &MaybeDocument) -> FirestoreResult<()> {
    let version = match doc {
        MaybeDocument::Document(doc) => doc.version(),
        MaybeDocument::NoDocument(_) => SnapshotVersion::min(),
        MaybeDocument::UnknownDocument(_) => {
            return Err(failed_precondition(format!(
                "Unexpected document type in transaction: {}",
                doc.key()
            )))
        }
    };
    match state.read_versions.get(doc.key()) {
        Some(existing) if *existing != version => {
            Err(aborted("Document version changed between two reads."))
        }
        Some(_) => Ok(()),
        None => {
            state.read_versions.insert(doc.key().clone(), version);
            Ok(())
        }
    }
}

fn precondition(state: &TransactionState, key: &DocumentKey) -> Precondition {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if version.is_min() {
                Precondition::Exists(false)
            } else {
                Precondition::UpdateTime(*version)
            }
        }
        _ => Precondition::None,
    }
}

fn precondition_for_update(state: &TransactionState, key: &DocumentKey) -> FirestoreResult<Precondition> {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if version.is_min() {
                Err(invalid_argument("Can't update a document that doesn't exist."))
            } else {
                Ok(Precondition::UpdateTime(*version))
            }
        }
        // A document written earlier in the transaction must exist when the
        // update applies.
        _ => Ok(Precondition::Exists(true)),
    }
}

fn write(state: &mut TransactionState, mutation: Mutation) {
    state.written_docs.insert(mutation.key().clone());
    state.mutations.push(mutation);
}

/// The update function of a transaction. Called once per attempt.
pub type UpdateFunction<T> =
    Arc<dyn Fn(Arc<Transaction>) -> BoxFuture<'static, FirestoreResult<T>> + Send + Sync>;

/// Runs an update function until its commit succeeds, a non-retryable error
/// occurs or the attempts run out. Waits between attempts are delayed
/// operations on the queue.
pub struct TransactionRunner<T> {
    queue: AsyncQueue,
    datastore: Arc<dyn Datastore>,
    update_function: UpdateFunction<T>,
    attempts_remaining: usize,
    backoff: ExponentialBackoff,
}

impl<T: Send + 'static> TransactionRunner<T> {
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<dyn Datastore>,
        update_function: UpdateFunction<T>,
        max_attempts: usize,
        backoff: BackoffSettings,
    ) -> Self {
        Self {
            queue,
            datastore,
            update_function,
            attempts_remaining: max_attempts,
            backoff: ExponentialBackoff::new(backoff),
        }
    }

    /// Must not run as a queue operation itself, since it waits for delayed
    /// operations on the same queue.
    pub async fn run(mut self) -> FirestoreResult<T> {
        loop {
            self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
            let transaction = Transaction::new(Arc::clone(&self.datastore));
            let outcome = match (self.update_function)(Arc::clone(&transaction)).await {
                Ok(value) => transaction.commit().await.map(|()| value),
                Err(err) => Err(err),
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if self.attempts_remaining == 0 || !is_retryable_transaction_error(&err) {
                return Err(err);
            }
            let delay = self.backoff.next_delay();
            log::debug!(
                "Transaction failed with {err}, retrying in {delay:?} ({} attempts left)",
                self.attempts_remaining
            );
            self.queue
                .enqueue_after_delay(TimerId::TransactionRetry, delay, || async { Ok(()) })
                .completion()
                .await?;
        }
    }
}

/// `Aborted` and `FailedPrecondition` mean the documents changed under the
/// transaction; transient codes mean the commit never landed.
fn is_retryable_transaction_error(error: &FirestoreError) -> bool {
    matches!(
        error.code,
        FirestoreErrorCode::Aborted | FirestoreErrorCode::FailedPrecondition
    ) || !is_permanent_error(error.code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, unavailable};
    use crate::firestore::model::{Document, DocumentState, NoDocument};
    use crate::firestore::remote::connection::WriteResponse;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend whose lookups and commits return scripted results.
    #[derive(Default)]
    struct ScriptedDatastore {
        documents: StdMutex<BTreeMap<DocumentKey, MaybeDocument>>,
        commit_results: StdMutex<VecDeque<FirestoreResult<()>>>,
        commits: StdMutex<Vec<Vec<Mutation>>>,
    }

    impl ScriptedDatastore {
        fn with_document(self, doc: MaybeDocument) -> Self {
            self.documents
                .lock()
                .unwrap()
                .insert(doc.key().clone(), doc);
            self
        }

        fn fail_commits(self, errors: Vec<FirestoreError>) -> Self {
            self.commit_results
                .lock()
                .unwrap()
                .extend(errors.into_iter().map(Err));
            self
        }

        fn committed(&self) -> Vec<Vec<Mutation>> {
            self.commits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Datastore for ScriptedDatastore {
        async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteResponse> {
            self.commits.lock().unwrap().push(mutations);
            let scripted = self.commit_results.lock().unwrap().pop_front();
            scripted.unwrap_or(Ok(()))?;
            Ok(WriteResponse::default())
        }

        async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>> {
            let documents = self.documents.lock().unwrap();
            Ok(keys
                .into_iter()
                .map(|key| match documents.get(&key) {
                    Some(doc) => doc.clone(),
                    None => NoDocument::new(key, SnapshotVersion::from_seconds(1), false).into(),
                })
                .collect())
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn existing(path: &str, seconds: i64) -> MaybeDocument {
        Document::new(
            key(path),
            SnapshotVersion::from_seconds(seconds),
            MapValue::empty(),
            DocumentState::Synced,
        )
        .into()
    }

    fn runner<T: Send + 'static>(
        datastore: Arc<ScriptedDatastore>,
        update_function: UpdateFunction<T>,
    ) -> TransactionRunner<T> {
        TransactionRunner::new(
            AsyncQueue::new(),
            datastore,
            update_function,
            DEFAULT_TRANSACTION_MAX_ATTEMPTS,
            BackoffSettings::default().with_initial_delay(std::time::Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn read_documents_are_verified_at_commit() {
        let datastore = Arc::new(
            ScriptedDatastore::default()
                .with_document(existing("rooms/a", 3)),
        );
        let transaction = Transaction::new(datastore.clone());
        let docs = transaction
            .lookup(vec![key("rooms/a"), key("rooms/b")])
            .await
            .unwrap();
        assert!(docs[0].is_document());
        assert!(docs[1].is_no_document());
        transaction.set(key("rooms/b"), MapValue::empty()).unwrap();
        transaction.commit().await.unwrap();

        let committed = datastore.committed();
        assert_eq!(
            committed[0],
            vec![
                Mutation::Set {
                    key: key("rooms/b"),
                    value: MapValue::empty(),
                    precondition: Precondition::Exists(false),
                },
                Mutation::verify(
                    key("rooms/a"),
                    Precondition::UpdateTime(SnapshotVersion::from_seconds(3))
                ),
            ]
        );
    }

    #[tokio::test]
    async fn reads_after_writes_are_rejected() {
        let transaction = Transaction::new(Arc::new(ScriptedDatastore::default()));
        transaction.delete(key("rooms/a")).unwrap();
        let err = transaction.lookup(vec![key("rooms/a")]).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn update_of_missing_document_fails() {
        let transaction = Transaction::new(Arc::new(ScriptedDatastore::default()));
        transaction.lookup(vec![key("rooms/a")]).await.unwrap();
        let err = transaction
            .update(key("rooms/a"), MapValue::empty(), FieldMask::default())
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn unread_update_requires_existence() {
        let datastore = Arc::new(ScriptedDatastore::default());
        let transaction = Transaction::new(datastore.clone());
        transaction
            .update(key("rooms/a"), MapValue::empty(), FieldMask::default())
            .unwrap();
        transaction.commit().await.unwrap();
        assert_eq!(
            datastore.committed()[0][0].precondition(),
            Precondition::Exists(true)
        );
        assert!(transaction.commit().await.is_err());
    }

    #[tokio::test]
    async fn runner_retries_aborted_commits() {
        let datastore = Arc::new(
            ScriptedDatastore::default()
                .fail_commits(vec![aborted("contention"), unavailable("flaky")]),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let update: UpdateFunction<usize> = Arc::new(move |transaction: Arc<Transaction>| -> BoxFuture<'static, FirestoreResult<usize>> {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                transaction.lookup(vec![key("rooms/a")]).await?;
                transaction.set(key("rooms/a"), MapValue::empty())?;
                Ok(attempt)
            }
            .boxed()
        });

        let attempt = runner(datastore.clone(), update).run().await.unwrap();
        assert_eq!(attempt, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(datastore.committed().len(), 3);
    }

    #[tokio::test]
    async fn runner_gives_up_on_permanent_errors() {
        let datastore = Arc::new(
            ScriptedDatastore::default().fail_commits(vec![permission_denied("no")]),
        );
        let update: UpdateFunction<()> = Arc::new(|transaction: Arc<Transaction>| -> BoxFuture<'static, FirestoreResult<()>> {
            async move { transaction.delete(key("rooms/a")) }.boxed()
        });
        let err = runner(datastore.clone(), update).run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(datastore.committed().len(), 1);
    }

    #[tokio::test]
    async fn runner_stops_after_max_attempts() {
        let datastore = Arc::new(ScriptedDatastore::default().fail_commits(vec![
            aborted("1"),
            aborted("2"),
            aborted("3"),
            aborted("4"),
            aborted("5"),
        ]));
        let update: UpdateFunction<()> = Arc::new(|transaction: Arc<Transaction>| -> BoxFuture<'static, FirestoreResult<()>> {
            async move { transaction.delete(key("rooms/a")) }.boxed()
        });
        let err = runner(datastore.clone(), update).run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Aborted);
        assert_eq!(datastore.committed().len(), DEFAULT_TRANSACTION_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn user_errors_are_not_retried() {
        let datastore = Arc::new(ScriptedDatastore::default());
        let update: UpdateFunction<()> = Arc::new(|_transaction: Arc<Transaction>| -> BoxFuture<'static, FirestoreResult<()>> {
            async move { Err(invalid_argument("bad input")) }.boxed()
        });
        let err = runner(datastore.clone(), update).run().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert!(datastore.committed().is_empty());
    }
}
