use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::firestore::core::types::TargetId;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, MaybeDocument, NoDocument, SnapshotVersion};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};
use crate::firestore::util::assert::hard_assert;

/// Gives the aggregator access to state owned by the sync engine and the
/// remote store.
pub trait TargetMetadataProvider {
    /// Keys the target contained as of the last raised snapshot.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for a target that is currently listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug)]
struct TargetState {
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // A fresh target always reports its first change.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..Default::default()
        };
        for (key, kind) in &self.document_changes {
            match kind {
                DocumentChangeKind::Added => change.added_documents.insert(key.clone()),
                DocumentChangeKind::Modified => change.modified_documents.insert(key.clone()),
                DocumentChangeKind::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Turns the stream of watch changes into `RemoteEvent`s.
///
/// Changes for targets with outstanding listen or unlisten requests are
/// dropped, since the backend may still send data for an older registration
/// of the same target id.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeSet<TargetId>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_watch_change(
        &mut self,
        change: WatchChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        match change {
            WatchChange::TargetChange(change) => self.handle_target_change(&change, metadata),
            WatchChange::DocumentChange(change) => self.handle_document_change(change, metadata),
            WatchChange::DocumentDelete(delete) => self.handle_document_delete(delete, metadata),
            WatchChange::DocumentRemove(remove) => self.handle_document_remove(remove, metadata),
            WatchChange::ExistenceFilter(filter) => self.handle_existence_filter(filter, metadata),
        }
    }

    fn handle_document_change(&mut self, change: DocumentChange, metadata: &dyn TargetMetadataProvider) {
        let key = change.document.key().clone();
        let document: MaybeDocument = change.document.into();
        for target_id in change.updated_target_ids {
            self.add_document_to_target(target_id, document.clone(), metadata);
        }
        for target_id in change.removed_target_ids {
            self.remove_document_from_target(target_id, &key, Some(document.clone()), metadata);
        }
    }

    fn handle_document_delete(&mut self, delete: DocumentDelete, metadata: &dyn TargetMetadataProvider) {
        let tombstone: MaybeDocument =
            NoDocument::new(delete.key.clone(), delete.read_time, false).into();
        for target_id in delete.removed_target_ids {
            self.remove_document_from_target(target_id, &delete.key, Some(tombstone.clone()), metadata);
        }
    }

    fn handle_document_remove(&mut self, remove: DocumentRemove, metadata: &dyn TargetMetadataProvider) {
        for target_id in remove.removed_target_ids {
            self.remove_document_from_target(target_id, &remove.key, None, metadata);
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.affected_targets(change, metadata) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // The target may have been removed and re-added before
                        // the backend acknowledged the removal.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        "WatchChangeAggregator does not handle errored targets",
                    );
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(
        &self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, metadata))
            .collect()
    }

    pub fn handle_existence_filter(
        &mut self,
        filter: ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if target_data.target.is_document_target() {
            if filter.count == 0 {
                // The document is gone. Deleting it here saves a round trip
                // through limbo resolution.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let tombstone: MaybeDocument =
                        NoDocument::new(key.clone(), SnapshotVersion::min(), false).into();
                    self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
                }
            } else {
                hard_assert(
                    filter.count == 1,
                    format!("Single document existence filter with count: {}", filter.count),
                );
            }
        } else if self.current_document_count_for_target(target_id, metadata) != filter.count as i64 {
            log::debug!("Existence filter mismatch for target {target_id}, resetting");
            self.reset_target(target_id, metadata);
            self.pending_target_resets.insert(target_id);
        }
    }

    /// Builds the event for `snapshot_version` and clears accumulated state.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current document target whose key never showed up means
                // the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key, metadata)
                    {
                        let tombstone: MaybeDocument =
                            NoDocument::new(key.clone(), snapshot_version, false).into();
                        self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(*target_id, metadata) {
                    Some(data) => data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        };
        self.pending_document_target_mapping.clear();
        event
    }

    /// Called when the remote store sends a listen or unlisten for the
    /// target. Changes are ignored until the backend has answered.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    /// Drops the state of a target that was removed without a backend ack,
    /// e.g. after a listen error.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MaybeDocument,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let kind = if self.target_contains_document(target_id, &key, metadata) {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), kind);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MaybeDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // The add may still be buffered in this target state.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        hard_assert(
            !self
                .target_states
                .get(&target_id)
                .map(TargetState::is_pending)
                .unwrap_or(false),
            "Should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());
        // Every known key is removed; the backend re-adds those that still
        // match before the next consistent snapshot.
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn current_document_count_for_target(
        &mut self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        metadata.get_remote_keys_for_target(target_id).len() as i64
            + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata)
            .is_some()
    }

    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::target::Target;
    use crate::firestore::model::{Document, DocumentState, ResourcePath};
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct TestMetadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn with_query_target(mut self, target_id: TargetId) -> Self {
            let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
            self.targets.insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::Listen, 1),
            );
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, key: &DocumentKey) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(Target::for_document(key), target_id, TargetPurpose::LimboResolution, 1),
            );
            self
        }

        fn with_remote_keys(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            self.remote_keys
                .insert(target_id, keys.iter().map(|k| key(k)).collect());
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> Document {
        Document::new(
            key(path),
            SnapshotVersion::from_seconds(version),
            MapValue::empty(),
            DocumentState::Synced,
        )
    }

    fn target_change(state: TargetChangeState, ids: &[TargetId]) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange::new(state, ids.to_vec()))
    }

    fn doc_change(updated: &[TargetId], removed: &[TargetId], doc: Document) -> WatchChange {
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: updated.to_vec(),
            removed_target_ids: removed.to_vec(),
            document: doc,
        })
    }

    #[test]
    fn added_document_then_current_produces_synced_change() {
        let metadata = TestMetadata::default().with_query_target(2);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);

        aggregator.handle_watch_change(target_change(TargetChangeState::Added, &[2]), &metadata);
        aggregator.handle_watch_change(doc_change(&[2], &[], doc("rooms/a", 3)), &metadata);
        aggregator.handle_watch_change(
            WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![2])
                    .with_resume_token(b"T".to_vec()),
            ),
            &metadata,
        );

        let event = aggregator.create_remote_event(SnapshotVersion::from_seconds(3), &metadata);
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.current);
        assert_eq!(change.resume_token, b"T".to_vec());
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(event.document_updates.contains_key(&key("rooms/a")));

        let second = aggregator.create_remote_event(SnapshotVersion::from_seconds(3), &metadata);
        assert!(second.is_empty());
    }

    #[test]
    fn pending_targets_ignore_changes() {
        let metadata = TestMetadata::default().with_query_target(2);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator.handle_watch_change(doc_change(&[2], &[], doc("rooms/a", 1)), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_seconds(1), &metadata);
        assert!(event.target_changes.is_empty());
        assert!(event.document_updates.is_empty());
    }

    #[test]
    fn known_documents_are_modified_and_removed() {
        let metadata = TestMetadata::default()
            .with_query_target(2)
            .with_remote_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(doc_change(&[2], &[], doc("rooms/a", 2)), &metadata);
        aggregator.handle_watch_change(
            WatchChange::DocumentDelete(DocumentDelete {
                key: key("rooms/b"),
                read_time: SnapshotVersion::from_seconds(2),
                removed_target_ids: vec![2],
            }),
            &metadata,
        );
        let event = aggregator.create_remote_event(SnapshotVersion::from_seconds(2), &metadata);
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.modified_documents.contains(&key("rooms/a")));
        assert!(change.removed_documents.contains(&key("rooms/b")));
        assert!(event.document_updates[&key("rooms/b")].is_no_document());
    }

    #[test]
    fn reset_removes_known_documents() {
        let metadata = TestMetadata::default()
            .with_query_target(2)
            .with_remote_keys(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(target_change(TargetChangeState::Reset, &[2]), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_seconds(2), &metadata);
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.removed_documents.contains(&key("rooms/a")));
        assert!(!change.current);
    }

    #[test]
    fn existence_filter_mismatch_flags_target() {
        let metadata = TestMetadata::default()
            .with_query_target(2)
            .with_remote_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            WatchChange::ExistenceFilter(ExistenceFilterChange { target_id: 2, count: 2 }),
            &metadata,
        );
        assert!(aggregator
            .create_remote_event(SnapshotVersion::from_seconds(2), &metadata)
            .target_mismatches
            .is_empty());

        aggregator.handle_watch_change(
            WatchChange::ExistenceFilter(ExistenceFilterChange { target_id: 2, count: 1 }),
            &metadata,
        );
        let event = aggregator.create_remote_event(SnapshotVersion::from_seconds(3), &metadata);
        assert!(event.target_mismatches.contains(&2));
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let limbo_key = key("rooms/ghost");
        let metadata = TestMetadata::default().with_limbo_target(3, &limbo_key);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(target_change(TargetChangeState::Current, &[3]), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_seconds(4), &metadata);
        let update = event.document_updates.get(&limbo_key).unwrap();
        assert!(update.is_no_document());
        assert_eq!(update.version(), SnapshotVersion::from_seconds(4));
        assert!(event.resolved_limbo_documents.contains(&limbo_key));
    }

    #[test]
    fn global_no_change_applies_resume_token_to_active_targets() {
        let metadata = TestMetadata::default().with_query_target(2);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(doc_change(&[2], &[], doc("rooms/a", 1)), &metadata);
        aggregator.create_remote_event(SnapshotVersion::from_seconds(1), &metadata);
        aggregator.handle_watch_change(
            WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::NoChange, vec![]).with_resume_token(vec![9]),
            ),
            &metadata,
        );
        let event = aggregator.create_remote_event(SnapshotVersion::from_seconds(2), &metadata);
        assert_eq!(event.target_changes[&2].resume_token, vec![9]);
    }
}
