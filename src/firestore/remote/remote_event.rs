use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::types::TargetId;
use crate::firestore::model::{DocumentKey, MaybeDocument, SnapshotVersion};

/// Changes to one target accumulated between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// A change that only updates the `current` flag, used when a view is
    /// created from cached state or a secondary client learns a target's
    /// state.
    pub fn create_synthesized_target_change_for_current_change(
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        Self {
            resume_token,
            current,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added_documents.is_empty()
            && self.modified_documents.is_empty()
            && self.removed_documents.is_empty()
    }
}

/// A consistent batch of watch changes stamped with a snapshot version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter disagreed with the local count.
    pub target_mismatches: BTreeSet<TargetId>,
    pub document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    /// Documents whose only listening targets are limbo resolutions.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn create_synthesized_remote_event_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::create_synthesized_target_change_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
    }
}
