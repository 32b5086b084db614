use std::cmp::Ordering;

use crate::firestore::core::view_snapshot::{
    DocumentChangeSet, DocumentChangeType, DocumentViewChange, OnlineState, SyncState, ViewSnapshot,
};
use crate::firestore::core::{LimitType, Query};
use crate::firestore::local::QueryResult;
use crate::firestore::model::{DocumentComparator, DocumentKey, DocumentKeySet, DocumentMap, DocumentSet, MutableDocument};
use crate::firestore::remote::TargetChange;

/// A document entering or leaving limbo: it is in the local view but the server has not
/// confirmed it belongs to the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// The result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limited view lost documents it cannot replace from the changes alone; the caller
    /// must rerun the query against the cache and compute again.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The client-side results of one query, kept up to date from local and remote changes.
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    /// Whether the server said the target is up to date.
    current: bool,
    document_set: DocumentSet,
    /// Keys the server says are in the target.
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    /// Keys of documents in `document_set` with pending writes.
    mutated_keys: DocumentKeySet,
    comparator: DocumentComparator,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator = query.document_comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
            comparator,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// The view's current contents as a first snapshot for a listener joining late.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    /// Computes what `doc_changes` would do to the view without applying it.
    ///
    /// Pass the previous result as `previous_changes` when computing again after a refill.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous_changes: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous_changes {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let at_limit = self
            .query
            .limit()
            .map_or(false, |limit| old_document_set.len() == limit as usize);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations = old_doc.map_or(false, |doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.map_or(false, |doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: DocumentChangeType::Modified,
                                document: new_doc.clone(),
                            });
                            change_applied = true;

                            let beyond_last = last_doc_in_limit
                                .as_ref()
                                .map_or(false, |last| (self.comparator)(new_doc, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .map_or(false, |first| (self.comparator)(new_doc, first) == Ordering::Less);
                            if beyond_last || before_first {
                                // The document moved past the edge of the limit; what replaces
                                // it is only known to the cache.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: DocumentChangeType::Metadata,
                            document: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: DocumentChangeType::Added,
                        document: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: DocumentChangeType::Removed,
                        document: old_doc.clone(),
                    });
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
                        document_set.add(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while document_set.len() > limit as usize {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: DocumentChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Applies computed changes and an optional target change from the server.
    ///
    /// Returns a snapshot when documents or the sync state changed, and the limbo changes
    /// the caller must act on when `limbo_resolution_enabled`.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        debug_assert!(!doc_changes.needs_refill, "cannot apply changes that need a refill");

        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let comparator = self.comparator.clone();
        let mut changes = doc_changes.change_set.into_changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| comparator(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: doc_changes.document_set,
            old_docs,
            doc_changes: changes,
            mutated_keys: doc_changes.mutated_keys,
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.map_or(false, |change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline marks a current view as stale so listeners see `from_cache`.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    /// Replaces the server-confirmed keys with those from the cache and recomputes the
    /// view, as done when a target is re-synchronized after a reset.
    pub fn synchronize_with_persisted_state(&mut self, query_result: &QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys.clone();
        self.limbo_documents = DocumentKeySet::new();
        let doc_changes = self.compute_doc_changes(&query_result.documents, None);
        self.apply_changes(doc_changes, true, None, false)
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(target_change) = target_change else {
            return;
        };
        for key in &target_change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &target_change.modified_documents {
            debug_assert!(self.synced_documents.contains(key), "modified document {key} not found in view");
        }
        for key in &target_change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = target_change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes explain why the document is in the view.
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo_documents = std::mem::take(&mut self.limbo_documents);
        let new_limbo_documents: DocumentKeySet = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo_documents
            .difference(&new_limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            new_limbo_documents
                .difference(&old_limbo_documents)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = new_limbo_documents;
        changes
    }
}

/// An acknowledged write whose remote document has not arrived yet keeps showing the
/// local version instead of flickering back.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

fn change_type_order(change_type: DocumentChangeType) -> u8 {
    match change_type {
        DocumentChangeType::Removed => 0,
        DocumentChangeType::Added => 1,
        DocumentChangeType::Modified | DocumentChangeType::Metadata => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Direction, OrderBy};
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use bytes::Bytes;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64, order: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("order").unwrap(),
            FirestoreValue::from_integer(order),
        );
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), data)
    }

    fn local_doc(path: &str, order: i64) -> MutableDocument {
        let mut document = doc(path, 0, order);
        document.set_has_local_mutations();
        document
    }

    fn changes(documents: Vec<MutableDocument>) -> DocumentMap {
        documents
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect()
    }

    fn current_change(keys: &[&str]) -> TargetChange {
        TargetChange {
            resume_token: Bytes::from_static(b"token"),
            current: true,
            added_documents: keys.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    fn apply(view: &mut View, documents: Vec<MutableDocument>, target_change: Option<&TargetChange>) -> ViewChange {
        let doc_changes = view.compute_doc_changes(&changes(documents), None);
        view.apply_changes(doc_changes, true, target_change, false)
    }

    fn ordered_query(limit: Option<u32>) -> Query {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::new(FieldPath::from_dot_separated("order").unwrap(), Direction::Ascending));
        match limit {
            Some(limit) => query.with_limit_to_first(limit),
            None => query,
        }
    }

    #[test]
    fn first_snapshot_reports_every_document_as_added() {
        let mut view = View::new(ordered_query(None), DocumentKeySet::new());
        let change = apply(&mut view, vec![doc("rooms/b", 1, 2), doc("rooms/a", 1, 1)], None);
        let snapshot = change.snapshot.unwrap();

        let keys: Vec<_> = snapshot.docs.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/b")]);
        assert!(snapshot
            .doc_changes
            .iter()
            .all(|change| change.change_type == DocumentChangeType::Added));
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn becomes_synced_once_current() {
        let mut view = View::new(ordered_query(None), DocumentKeySet::new());
        apply(&mut view, vec![doc("rooms/a", 1, 1)], None);
        let change = apply(&mut view, vec![], Some(&current_change(&["rooms/a"])));
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
        assert!(snapshot.has_cached_results);
    }

    #[test]
    fn unconfirmed_documents_enter_limbo() {
        let mut view = View::new(ordered_query(None), DocumentKeySet::new());
        apply(&mut view, vec![doc("rooms/a", 1, 1), doc("rooms/b", 1, 2)], None);
        let change = apply(&mut view, vec![], Some(&current_change(&["rooms/a"])));

        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.map_or(true, |snapshot| snapshot.from_cache));

        let resolved = TargetChange {
            current: true,
            removed_documents: DocumentKeySet::new(),
            ..TargetChange::default()
        };
        let deleted = MutableDocument::new_no_document(key("rooms/b"), SnapshotVersion::from_micros(2));
        let change = apply(&mut view, vec![deleted], Some(&resolved));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        assert!(!change.snapshot.unwrap().from_cache);
    }

    #[test]
    fn local_writes_are_never_in_limbo() {
        let mut view = View::new(ordered_query(None), DocumentKeySet::new());
        apply(&mut view, vec![local_doc("rooms/a", 1)], None);
        let change = apply(&mut view, vec![], Some(&current_change(&[])));
        assert!(change.limbo_changes.is_empty());
        assert!(view.limbo_documents().is_empty());
    }

    #[test]
    fn pending_write_flip_is_a_metadata_change() {
        let mut view = View::new(ordered_query(None), DocumentKeySet::new());
        apply(&mut view, vec![local_doc("rooms/a", 1)], None);
        let change = apply(&mut view, vec![doc("rooms/a", 2, 1)], None);
        let snapshot = change.snapshot.unwrap();
        assert_eq!(snapshot.doc_changes.len(), 1);
        assert_eq!(snapshot.doc_changes[0].change_type, DocumentChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn acknowledged_write_keeps_the_local_version_until_synced() {
        let mut view = View::new(ordered_query(None), DocumentKeySet::new());
        apply(&mut view, vec![local_doc("rooms/a", 1)], None);

        let mut committed = doc("rooms/a", 2, 5);
        committed.set_has_committed_mutations();
        let change = apply(&mut view, vec![committed], None);
        assert!(change.snapshot.is_none());
    }

    #[test]
    fn limited_view_drops_documents_past_the_limit() {
        let mut view = View::new(ordered_query(Some(2)), DocumentKeySet::new());
        let change = apply(
            &mut view,
            vec![doc("rooms/a", 1, 1), doc("rooms/b", 1, 2), doc("rooms/c", 1, 3)],
            None,
        );
        let keys: Vec<_> = change.snapshot.unwrap().docs.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/b")]);
    }

    #[test]
    fn removing_from_a_full_limited_view_needs_refill() {
        let mut view = View::new(ordered_query(Some(2)), DocumentKeySet::new());
        apply(&mut view, vec![doc("rooms/a", 1, 1), doc("rooms/b", 1, 2)], None);

        let deleted = MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::from_micros(2));
        let doc_changes = view.compute_doc_changes(&changes(vec![deleted.clone()]), None);
        assert!(doc_changes.needs_refill);

        // The refill reruns the query and feeds the cache results on top.
        let refill = changes(vec![deleted, doc("rooms/b", 1, 2), doc("rooms/c", 1, 3)]);
        let doc_changes = view.compute_doc_changes(&refill, Some(doc_changes));
        assert!(!doc_changes.needs_refill);
        let change = view.apply_changes(doc_changes, true, None, false);
        let keys: Vec<_> = change.snapshot.unwrap().docs.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/b"), key("rooms/c")]);
    }

    #[test]
    fn going_offline_marks_a_current_view_as_from_cache() {
        let mut view = View::new(ordered_query(None), DocumentKeySet::new());
        apply(&mut view, vec![doc("rooms/a", 1, 1)], Some(&current_change(&["rooms/a"])));
        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }

    #[test]
    fn removals_sort_before_additions() {
        let mut view = View::new(ordered_query(None), DocumentKeySet::new());
        apply(&mut view, vec![doc("rooms/a", 1, 1)], None);
        let deleted = MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::from_micros(2));
        let change = apply(&mut view, vec![doc("rooms/b", 2, 0), deleted], None);
        let types: Vec<_> = change
            .snapshot
            .unwrap()
            .doc_changes
            .iter()
            .map(|change| change.change_type)
            .collect();
        assert_eq!(types, vec![DocumentChangeType::Removed, DocumentChangeType::Added]);
    }
}
