use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, DocumentSet, MaybeDocument,
};
use crate::firestore::remote::remote_event::TargetChange;
use crate::firestore::util::assert::hard_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboDocumentChangeType {
    Added,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimboDocumentChange {
    pub change_type: LimboDocumentChangeType,
    pub key: DocumentKey,
}

impl LimboDocumentChange {
    fn added(key: DocumentKey) -> Self {
        Self {
            change_type: LimboDocumentChangeType::Added,
            key,
        }
    }

    fn removed(key: DocumentKey) -> Self {
        Self {
            change_type: LimboDocumentChangeType::Removed,
            key,
        }
    }
}

/// Result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit boundary moved; the caller must rerun the query against
    /// the local cache and compute again with these changes as the base.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Incrementally maintained result of one query.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    /// Whether the backend reported the target as current.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend has confirmed as part of the target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Classifies every entry of `doc_changes` against the current result.
    ///
    /// `previous` is the outcome of an earlier call that needed a refill.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, Option<MaybeDocument>>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let refilling = previous.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|l| l as usize);
        let last_doc_in_limit = match (self.query.limit_type(), limit) {
            (LimitType::First, Some(limit)) if old_document_set.len() == limit => {
                old_document_set.last().cloned()
            }
            _ => None,
        };
        let first_doc_in_limit = match (self.query.limit_type(), limit) {
            (LimitType::Last, Some(limit)) if old_document_set.len() == limit => {
                old_document_set.first().cloned()
            }
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = entry
                .as_ref()
                .and_then(MaybeDocument::as_document)
                .filter(|doc| self.query.matches(doc));

            let old_doc_had_pending_mutations =
                old_doc.map(|doc| self.mutated_keys.contains(doc.key())).unwrap_or(false);
            let new_doc_has_pending_mutations = new_doc
                .map(|doc| {
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(
                                ChangeType::Modified,
                                new_doc.clone(),
                            ));
                            change_applied = true;

                            let past_last = last_doc_in_limit
                                .as_ref()
                                .map(|last| (self.comparator)(new_doc, last) == Ordering::Greater)
                                .unwrap_or(false);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .map(|first| (self.comparator)(new_doc, first) == Ordering::Less)
                                .unwrap_or(false);
                            if past_last || before_first {
                                // The document moved outside the limit, so a
                                // document we never saw may belong in its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new_doc.clone(),
                        ));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set.add(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key.clone());
                        } else {
                            new_mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_document_set.delete(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let trimmed = match self.query.limit_type() {
                    LimitType::First => new_document_set.last().cloned(),
                    LimitType::Last => new_document_set.first().cloned(),
                };
                let Some(trimmed) = trimmed else {
                    break;
                };
                new_document_set.delete(trimmed.key());
                new_mutated_keys.remove(trimmed.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, trimmed));
            }
        }

        hard_assert(
            !needs_refill || !refilling,
            "View was refilled using docs that themselves needed refilling.",
        );

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    /// Commits `doc_changes` and produces the snapshot to raise, if any.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        hard_assert(
            !doc_changes.needs_refill,
            "Cannot apply changes that need a refill",
        );
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        let comparator = self.comparator.clone();
        changes.sort_by(|left, right| {
            left.change_type
                .rank()
                .cmp(&right.change_type.rank())
                .then_with(|| comparator(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: doc_changes.document_set,
                old_docs,
                doc_changes: changes,
                mutated_keys: doc_changes.mutated_keys,
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                exclude_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline makes a current view non-current so listeners learn the
    /// results may be stale.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None)
        } else {
            ViewChange::default()
        }
    }

    /// Replaces the synced keys with what storage holds and recomputes the
    /// view. Used when this client becomes primary.
    pub fn synchronize_with_persisted_state(
        &mut self,
        documents: &BTreeMap<DocumentKey, Option<MaybeDocument>>,
        remote_keys: BTreeSet<DocumentKey>,
    ) -> ViewChange {
        self.synced_documents = remote_keys;
        self.limbo_documents.clear();
        let changes = self.compute_doc_changes(documents, None);
        self.apply_changes(changes, true, None)
    }

    /// Snapshot of the view as it stands, reporting every document as added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            hard_assert(
                self.synced_documents.contains(key),
                format!("Modified document {key} not found in view."),
            );
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc.key()))
            .map(|doc| doc.key().clone())
            .collect();

        let mut changes = Vec::new();
        for key in old_limbo.difference(&new_limbo) {
            changes.push(LimboDocumentChange::removed(key.clone()));
        }
        for key in new_limbo.difference(&old_limbo) {
            changes.push(LimboDocumentChange::added(key.clone()));
        }
        self.limbo_documents = new_limbo;
        changes
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Documents with only local state are expected to be missing
            // from the backend's view.
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }
}

/// A modification that swaps a local mutation for a committed one is held
/// back until the backend sends the synced document, to avoid flicker.
fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}
