pub mod event_manager;
pub mod filter;
pub mod firestore_client;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod transaction;
pub mod types;
pub mod view;
pub mod view_snapshot;

#[doc(inline)]
pub use event_manager::{EventManager, ListenOptions, QueryListener};
#[doc(inline)]
pub use firestore_client::{ClientContext, ClientSettings, FirestoreClient, ListenerRegistration};
#[doc(inline)]
pub use query::Query;
#[doc(inline)]
pub use sync_engine::{SyncEngine, SyncEngineListener};
#[doc(inline)]
pub use transaction::{Transaction, TransactionRunner};
#[doc(inline)]
pub use types::{BatchId, OnlineState, TargetId, User};
#[doc(inline)]
pub use view_snapshot::{ChangeType, DocumentViewChange, ViewSnapshot};
