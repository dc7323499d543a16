/// Identifies a target registered with the watch stream.
pub type TargetId = i32;

/// Identifies a mutation batch in the mutation queue.
pub type BatchId = i32;

/// Monotonic counter used to order target and document activity for LRU GC.
pub type ListenSequenceNumber = i64;

pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Sequence number of targets that are never persisted, such as limbo
/// resolutions.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Connectivity to the backend as reported to listeners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// No watch stream attempt has completed yet.
    #[default]
    Unknown,
    Online,
    Offline,
}

/// The authenticated user a client acts for. Each user has its own mutation
/// queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key for per-user storage; empty for the unauthenticated user.
    pub fn storage_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}
