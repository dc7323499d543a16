//! Record types persisted in the key-value store and their JSON encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::firestore::core::types::{BatchId, ListenSequenceNumber, TargetId};
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{MaybeDocument, MutationBatch, SnapshotVersion};

pub fn encode<T: Serialize>(record: &T) -> FirestoreResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|err| {
        FirestoreError::new(
            FirestoreErrorCode::Internal,
            format!("Failed to encode record: {err}"),
        )
    })
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> FirestoreResult<T> {
    serde_json::from_slice(bytes).map_err(|err| {
        FirestoreError::new(
            FirestoreErrorCode::DataLoss,
            format!("Failed to decode record: {err}"),
        )
    })
}

/// Stream tokens are stored base64 encoded.
pub fn encode_token(token: &[u8]) -> String {
    STANDARD.encode(token)
}

pub fn decode_token(token: &str) -> FirestoreResult<Vec<u8>> {
    STANDARD.decode(token).map_err(|err| {
        FirestoreError::new(
            FirestoreErrorCode::DataLoss,
            format!("Invalid stored stream token: {err}"),
        )
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbMutationBatch {
    pub user_id: String,
    pub batch: MutationBatch,
}

pub fn encode_mutation_batch(user_id: &str, batch: &MutationBatch) -> FirestoreResult<Vec<u8>> {
    encode(&DbMutationBatch {
        user_id: user_id.to_string(),
        batch: batch.clone(),
    })
}

pub fn decode_mutation_batch(bytes: &[u8]) -> FirestoreResult<DbMutationBatch> {
    decode(bytes)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbMutationQueue {
    pub user_id: String,
    pub last_acknowledged_batch_id: BatchId,
    /// Base64 encoded write stream token.
    pub last_stream_token: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbMutationGlobal {
    pub highest_batch_id: BatchId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbRemoteDocument {
    pub document: MaybeDocument,
    pub read_time: SnapshotVersion,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbRemoteDocumentGlobal {
    /// Sum of the encoded sizes of all cached documents.
    pub byte_size: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbTargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: i64,
}

pub fn encode_target(target_data: &TargetData) -> FirestoreResult<Vec<u8>> {
    encode(target_data)
}

pub fn decode_target(bytes: &[u8]) -> FirestoreResult<TargetData> {
    decode(bytes)
}

/// Value of a target-document association row. Only sentinel rows carry a
/// sequence number.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbTargetDocument {
    pub sequence_number: Option<ListenSequenceNumber>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbOwner {
    pub owner_id: String,
    pub allow_tab_synchronization: bool,
    pub lease_timestamp_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbSchemaVersion {
    pub version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, FieldMask, FieldPath, Mutation, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    #[test]
    fn mutation_batch_survives_encoding() {
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let field = FieldPath::from_dot_separated("count").unwrap();
        let mut data = MapValue::empty();
        data.set(&field, FirestoreValue::from_integer(3));
        let base = Mutation::patch(
            key.clone(),
            data.clone(),
            FieldMask::from_paths(vec![field.clone()]),
        );
        let batch = MutationBatch::new(
            7,
            Timestamp::new(100, 5),
            vec![base],
            vec![Mutation::set(key.clone(), data), Mutation::delete(key)],
        );

        let encoded = encode_mutation_batch("alice", &batch).unwrap();
        let decoded = decode_mutation_batch(&encoded).unwrap();
        assert_eq!(decoded.user_id, "alice");
        assert_eq!(decoded.batch, batch);
    }

    #[test]
    fn corrupt_records_report_data_loss() {
        let err = decode::<DbTargetGlobal>(b"{not json").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::DataLoss);
    }

    #[test]
    fn tokens_round_trip_through_base64() {
        let token = vec![0u8, 1, 2, 250];
        assert_eq!(decode_token(&encode_token(&token)).unwrap(), token);
    }
}
