use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::firestore::core::types::{BatchId, OnlineState, TargetId, User};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutationBatchResult};
use crate::firestore::remote::remote_event::RemoteEvent;

/// Callbacks from the remote store into the sync engine.
///
/// Every call is made from an operation running on the client's
/// `AsyncQueue`, so implementations may call back into the remote store.
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot of watch changes.
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend removed a target because of `error`.
    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError)
        -> FirestoreResult<()>;

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend refused the batch with a permanent error.
    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError)
        -> FirestoreResult<()>;

    /// Keys the target contained in the last snapshot raised for it.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    async fn apply_online_state_change(&self, online_state: OnlineState);

    /// Switches local state to `user`. The remote store has already taken
    /// the network down and brings it back once this returns.
    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()>;
}
