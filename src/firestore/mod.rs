pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod util;
pub mod value;

pub use self::core::{ClientContext, ClientSettings, FirestoreClient, ListenOptions, Query};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
