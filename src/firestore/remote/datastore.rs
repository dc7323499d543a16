use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::error::{failed_precondition, internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, MaybeDocument, Mutation};
use crate::firestore::remote::connection::{
    Connection, ListenStreamChannel, WriteResponse, WriteStreamChannel,
};

/// Unary backend calls used by transactions.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteResponse>;

    /// Current backend state of `keys`, in the same order.
    async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>>;
}

/// Datastore backed by a [`Connection`]; also opens the persistent streams.
pub struct RemoteDatastore {
    connection: Arc<dyn Connection>,
    terminated: AtomicBool,
}

impl RemoteDatastore {
    pub fn new(connection: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            terminated: AtomicBool::new(false),
        })
    }

    pub async fn open_listen_stream(&self) -> FirestoreResult<ListenStreamChannel> {
        self.verify_not_terminated()?;
        self.connection.open_listen_stream().await
    }

    pub async fn open_write_stream(&self) -> FirestoreResult<WriteStreamChannel> {
        self.verify_not_terminated()?;
        self.connection.open_write_stream().await
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            Err(failed_precondition(
                "The client has already been terminated.",
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Datastore for RemoteDatastore {
    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteResponse> {
        self.verify_not_terminated()?;
        self.connection.commit(mutations).await
    }

    async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>> {
        self.verify_not_terminated()?;
        let response = self.connection.batch_get_documents(keys.clone()).await?;
        let mut by_key: BTreeMap<DocumentKey, MaybeDocument> = response
            .into_iter()
            .map(|doc| (doc.key().clone(), doc))
            .collect();
        keys.iter()
            .map(|key| {
                by_key.remove(key).ok_or_else(|| {
                    internal_error(format!("Lookup response is missing document {key}"))
                })
            })
            .collect()
    }
}
