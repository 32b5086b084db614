use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use bytes::Bytes;

use crate::firestore::core::TargetId;
use crate::firestore::error::{failed_precondition, internal_error, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, MutableDocument, MutationBatch, Overlay, ResourcePath, SnapshotVersion,
};
use crate::firestore::value::FirestoreValue;

/// How many times a transaction failing with `Aborted` is attempted before the error surfaces.
pub const MAX_TRANSACTION_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write and only allowed while this client holds the primary lease.
    ReadWritePrimary,
}

/// A sorted table whose writes can be undone until the enclosing transaction commits.
pub(crate) struct Table<K: Ord + Clone, V: Clone> {
    rows: BTreeMap<K, V>,
    journal: Vec<(K, Option<V>)>,
}

impl<K: Ord + Clone, V: Clone> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            journal: Vec::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> Table<K, V> {
    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.rows.get(key)
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.rows.insert(key.clone(), value);
        self.journal.push((key, previous.clone()));
        previous
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.rows.remove(key)?;
        self.journal.push((key.clone(), Some(previous.clone())));
        Some(previous)
    }

    pub(crate) fn range<R: RangeBounds<K>>(&self, range: R) -> impl Iterator<Item = (&K, &V)> {
        self.rows.range(range)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.rows.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    fn commit(&mut self) {
        self.journal.clear();
    }

    fn rollback(&mut self) {
        while let Some((key, previous)) = self.journal.pop() {
            match previous {
                Some(value) => {
                    self.rows.insert(key, value);
                }
                None => {
                    self.rows.remove(&key);
                }
            }
        }
    }
}

/// A single journaled value.
#[derive(Default)]
pub(crate) struct Journaled<T: Clone> {
    value: T,
    saved: Option<T>,
}

impl<T: Clone> Journaled<T> {
    pub(crate) fn get(&self) -> &T {
        &self.value
    }

    pub(crate) fn update(&mut self, apply: impl FnOnce(&mut T)) {
        if self.saved.is_none() {
            self.saved = Some(self.value.clone());
        }
        apply(&mut self.value);
    }

    fn commit(&mut self) {
        self.saved = None;
    }

    fn rollback(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.value = saved;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct MutationQueueMetadata {
    pub(crate) next_batch_id: BatchId,
    pub(crate) last_stream_token: Bytes,
}

#[derive(Clone, Debug)]
pub(crate) struct RemoteDocumentEntry {
    pub(crate) document: MutableDocument,
    pub(crate) size: usize,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct TargetGlobals {
    pub(crate) highest_target_id: TargetId,
    pub(crate) highest_listen_sequence_number: ListenSequenceNumber,
    pub(crate) last_remote_snapshot_version: SnapshotVersion,
    pub(crate) next_index_id: i32,
}

/// Index entries are keyed by index, then the indexed values, then the document.
pub(crate) type IndexEntryKey = (i32, Vec<FirestoreValue>, DocumentKey);

/// The logical tables backing the local cache.
///
/// Mutation queues and overlays are keyed by user id; remote documents and target
/// metadata are shared by all users.
#[derive(Default)]
pub(crate) struct LocalTables {
    pub(crate) mutation_queues: Table<String, MutationQueueMetadata>,
    pub(crate) mutation_batches: Table<(String, BatchId), MutationBatch>,
    pub(crate) document_mutations: Table<(String, DocumentKey, BatchId), ()>,
    pub(crate) overlays: Table<(String, DocumentKey), Overlay>,
    pub(crate) overlays_by_batch: Table<(String, BatchId, DocumentKey), ()>,
    pub(crate) remote_documents: Table<DocumentKey, RemoteDocumentEntry>,
    pub(crate) remote_document_size: Journaled<usize>,
    pub(crate) targets: Table<TargetId, TargetData>,
    pub(crate) targets_by_canonical_id: Table<String, TargetId>,
    pub(crate) target_documents: Table<(TargetId, DocumentKey), ()>,
    pub(crate) document_targets: Table<(DocumentKey, TargetId), ()>,
    pub(crate) target_globals: Journaled<TargetGlobals>,
    pub(crate) document_sequence_numbers: Table<DocumentKey, ListenSequenceNumber>,
    pub(crate) collection_parents: Table<(String, ResourcePath), ()>,
    pub(crate) field_indexes: Table<i32, FieldIndex>,
    pub(crate) index_entries: Table<IndexEntryKey, ()>,
    pub(crate) index_entries_by_document: Table<(DocumentKey, i32), Vec<Vec<FirestoreValue>>>,
}

impl LocalTables {
    fn commit(&mut self) {
        self.mutation_queues.commit();
        self.mutation_batches.commit();
        self.document_mutations.commit();
        self.overlays.commit();
        self.overlays_by_batch.commit();
        self.remote_documents.commit();
        self.remote_document_size.commit();
        self.targets.commit();
        self.targets_by_canonical_id.commit();
        self.target_documents.commit();
        self.document_targets.commit();
        self.target_globals.commit();
        self.document_sequence_numbers.commit();
        self.collection_parents.commit();
        self.field_indexes.commit();
        self.index_entries.commit();
        self.index_entries_by_document.commit();
    }

    fn rollback(&mut self) {
        self.mutation_queues.rollback();
        self.mutation_batches.rollback();
        self.document_mutations.rollback();
        self.overlays.rollback();
        self.overlays_by_batch.rollback();
        self.remote_documents.rollback();
        self.remote_document_size.rollback();
        self.targets.rollback();
        self.targets_by_canonical_id.rollback();
        self.target_documents.rollback();
        self.document_targets.rollback();
        self.target_globals.rollback();
        self.document_sequence_numbers.rollback();
        self.collection_parents.rollback();
        self.field_indexes.rollback();
        self.index_entries.rollback();
        self.index_entries_by_document.rollback();
    }
}

/// Handle passed to transaction bodies.
pub struct PersistenceTransaction<'a> {
    tables: &'a mut LocalTables,
    mode: TransactionMode,
    label: &'a str,
    current_sequence_number: ListenSequenceNumber,
}

impl<'a> PersistenceTransaction<'a> {
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn label(&self) -> &str {
        self.label
    }

    /// Sequence number stamped on everything this transaction touches.
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }

    pub(crate) fn tables(&self) -> &LocalTables {
        self.tables
    }

    pub(crate) fn tables_mut(&mut self) -> &mut LocalTables {
        debug_assert!(
            self.mode != TransactionMode::ReadOnly,
            "write attempted in read-only transaction '{}'",
            self.label
        );
        self.tables
    }
}

/// The transactional substrate every local component reads and writes through.
pub trait Persistence: Send + Sync {
    /// Runs `body` atomically. Changes are rolled back if `body` fails.
    fn run_transaction_dyn(
        &self,
        label: &str,
        mode: TransactionMode,
        body: &mut dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()>,
    ) -> FirestoreResult<()>;

    /// Whether this client may run `ReadWritePrimary` transactions.
    fn is_primary(&self) -> bool;

    fn is_started(&self) -> bool;

    fn shutdown(&self);
}

/// Runs a transaction and returns the value produced by `body`.
pub fn run_transaction<T, F>(
    persistence: &dyn Persistence,
    label: &str,
    mode: TransactionMode,
    mut body: F,
) -> FirestoreResult<T>
where
    F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
{
    let mut output = None;
    persistence.run_transaction_dyn(label, mode, &mut |txn| {
        output = Some(body(txn)?);
        Ok(())
    })?;
    output.ok_or_else(|| internal_error(format!("transaction '{label}' completed without a result")))
}

/// Persistence kept entirely in memory.
pub struct MemoryPersistence {
    tables: StdMutex<LocalTables>,
    primary: AtomicBool,
    started: AtomicBool,
}

impl Debug for MemoryPersistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPersistence")
            .field("primary", &self.primary.load(Ordering::SeqCst))
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            tables: StdMutex::new(LocalTables::default()),
            primary: AtomicBool::new(true),
            started: AtomicBool::new(true),
        }
    }

    /// Simulates gaining or losing the primary lease.
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }
}

impl Persistence for MemoryPersistence {
    fn run_transaction_dyn(
        &self,
        label: &str,
        mode: TransactionMode,
        body: &mut dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        if !self.is_started() {
            return Err(failed_precondition(format!(
                "persistence is shut down; cannot run '{label}'"
            )));
        }
        if mode == TransactionMode::ReadWritePrimary && !self.is_primary() {
            return Err(failed_precondition(format!(
                "'{label}' requires the primary lease"
            )));
        }

        let mut tables = match self.tables.lock() {
            Ok(tables) => tables,
            Err(poison) => {
                // A body panicked mid-transaction; its journal was never committed.
                log::debug!("recovering local tables after a panicked transaction");
                let mut tables = poison.into_inner();
                tables.rollback();
                tables
            }
        };
        let mut attempt = 1;
        loop {
            let current_sequence_number = if mode == TransactionMode::ReadOnly {
                tables.target_globals.get().highest_listen_sequence_number
            } else {
                let mut next = 0;
                tables.target_globals.update(|globals| {
                    globals.highest_listen_sequence_number += 1;
                    next = globals.highest_listen_sequence_number;
                });
                next
            };

            let mut txn = PersistenceTransaction {
                tables: &mut tables,
                mode,
                label,
                current_sequence_number,
            };
            match body(&mut txn) {
                Ok(()) => {
                    tables.commit();
                    return Ok(());
                }
                Err(err) => {
                    tables.rollback();
                    if err.code == FirestoreErrorCode::Aborted && attempt < MAX_TRANSACTION_ATTEMPTS {
                        log::debug!("transaction '{label}' aborted (attempt {attempt}), retrying");
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
    }
}
