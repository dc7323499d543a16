//! Client-side sync and consistency engine of an offline-first document
//! database.
//!
//! [`firestore::FirestoreClient`] keeps a local cache of documents and
//! pending writes, raises query snapshots from it immediately, and reconciles
//! it with the backend over a watch stream and a write stream.

pub mod firestore;
pub mod platform;
