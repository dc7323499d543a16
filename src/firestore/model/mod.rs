mod document;
mod document_key;
mod document_set;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod transform_operation;

pub use document::{Document, DocumentState, MaybeDocument, NoDocument, UnknownDocument};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_mask::FieldMask;
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use mutation::{Mutation, MutationResult, Precondition};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use transform_operation::{FieldTransform, TransformOperation};
