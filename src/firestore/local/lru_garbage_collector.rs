use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Deserialize;

use crate::firestore::core::{AsyncQueue, DelayedOperation, TargetId, TimerId};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetData, INVALID_SEQUENCE_NUMBER};
use crate::firestore::model::DocumentKey;

pub const COLLECTION_DISABLED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
const DEFAULT_COLLECTION_PERCENTILE: u32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;

const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LruParams {
    /// Cache size in bytes above which collection runs; [`COLLECTION_DISABLED`] turns it off.
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_COLLECTION_PERCENTILE,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(COLLECTION_DISABLED)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != COLLECTION_DISABLED
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.is_enabled() && self.cache_size_collection_threshold < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache size must be at least {MINIMUM_CACHE_SIZE_BYTES} bytes or {COLLECTION_DISABLED} to disable collection"
            )));
        }
        if self.percentile_to_collect > 100 {
            return Err(invalid_argument("percentileToCollect must be between 0 and 100"));
        }
        Ok(())
    }
}

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Keeps per-document sequence numbers current as references come and go, and answers the
/// collector's questions about the cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct LruDelegate {
    target_cache: TargetCache,
    remote_document_cache: RemoteDocumentCache,
}

impl LruDelegate {
    pub fn new(target_cache: TargetCache, remote_document_cache: RemoteDocumentCache) -> Self {
        Self {
            target_cache,
            remote_document_cache,
        }
    }

    pub fn add_reference(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        self.touch(txn, key);
    }

    pub fn remove_reference(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        self.touch(txn, key);
    }

    pub fn remove_mutation_reference(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        self.touch(txn, key);
    }

    pub fn update_limbo_document(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        self.touch(txn, key);
    }

    /// Stamps a released target so it ages from now.
    pub fn remove_target(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) {
        let updated = target_data.with_sequence_number(txn.current_sequence_number());
        self.target_cache.update_target_data(txn, &updated);
    }

    fn touch(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        let sequence_number = txn.current_sequence_number();
        txn.tables_mut()
            .document_sequence_numbers
            .insert(key.clone(), sequence_number);
    }

    pub fn get_cache_size(&self, txn: &PersistenceTransaction<'_>) -> usize {
        self.remote_document_cache.get_size(txn)
    }

    pub fn get_sequence_number_count(&self, txn: &PersistenceTransaction<'_>) -> usize {
        self.target_cache.get_target_count(txn) + txn.tables().document_sequence_numbers.len()
    }

    /// The `n`th smallest sequence number across targets and orphaned documents.
    pub fn nth_sequence_number(&self, txn: &PersistenceTransaction<'_>, n: usize) -> ListenSequenceNumber {
        if n == 0 {
            return INVALID_SEQUENCE_NUMBER;
        }
        let mut sequence_numbers: Vec<ListenSequenceNumber> = Vec::new();
        self.target_cache
            .for_each_target(txn, |target_data| sequence_numbers.push(target_data.sequence_number));
        sequence_numbers.extend(
            txn.tables()
                .document_sequence_numbers
                .iter()
                .map(|(_, sequence_number)| *sequence_number),
        );
        sequence_numbers.sort_unstable();
        sequence_numbers
            .get(n - 1)
            .or_else(|| sequence_numbers.last())
            .copied()
            .unwrap_or(INVALID_SEQUENCE_NUMBER)
    }

    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        self.target_cache.remove_targets(txn, upper_bound, active_target_ids)
    }

    /// Removes cached documents nothing pins any more.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        pins: &ReferenceSet,
    ) -> usize {
        let candidates = self.remote_document_cache.get_all_keys(txn);
        let mut removed = 0;
        for key in candidates {
            if self.is_pinned(txn, &key, upper_bound, pins) {
                continue;
            }
            self.remote_document_cache.remove_entry(txn, &key);
            txn.tables_mut().document_sequence_numbers.remove(&key);
            removed += 1;
        }
        removed
    }

    fn is_pinned(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
        upper_bound: ListenSequenceNumber,
        pins: &ReferenceSet,
    ) -> bool {
        MutationQueue::any_queue_contains_key(txn, key)
            || pins.contains_key(key)
            || self.target_cache.contains_key(txn, key)
            || txn
                .tables()
                .document_sequence_numbers
                .get(key)
                .map_or(false, |sequence_number| *sequence_number > upper_bound)
    }
}

/// Sequence-number based collector: drops the least recently used targets and the
/// documents they leave orphaned.
#[derive(Clone, Copy, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
    delegate: LruDelegate,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams, delegate: LruDelegate) -> Self {
        Self { params, delegate }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    pub fn delegate(&self) -> &LruDelegate {
        &self.delegate
    }

    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pins: &ReferenceSet,
    ) -> LruResults {
        if !self.params.is_enabled() {
            log::debug!("garbage collection skipped; disabled");
            return LruResults::did_not_run();
        }
        let cache_size = self.delegate.get_cache_size(txn);
        if (cache_size as i64) < self.params.cache_size_collection_threshold {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is below threshold {}",
                self.params.cache_size_collection_threshold
            );
            return LruResults::did_not_run();
        }
        self.run_garbage_collection(txn, active_target_ids, pins)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pins: &ReferenceSet,
    ) -> LruResults {
        let mut sequence_numbers_to_collect = self.calculate_target_count(txn, self.params.percentile_to_collect);
        if sequence_numbers_to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "capping garbage collection to {} sequence numbers (wanted {sequence_numbers_to_collect})",
                self.params.maximum_sequence_numbers_to_collect
            );
            sequence_numbers_to_collect = self.params.maximum_sequence_numbers_to_collect;
        }

        let upper_bound = self.delegate.nth_sequence_number(txn, sequence_numbers_to_collect);
        let targets_removed = self.delegate.remove_targets(txn, upper_bound, active_target_ids);
        let documents_removed = self.delegate.remove_orphaned_documents(txn, upper_bound, pins);

        log::debug!(
            "garbage collection removed {targets_removed} targets and {documents_removed} documents \
             (upper bound sequence number {upper_bound})"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        }
    }

    /// How many sequence numbers make up `percentile` of everything collectible.
    pub fn calculate_target_count(&self, txn: &PersistenceTransaction<'_>, percentile: u32) -> usize {
        let count = self.delegate.get_sequence_number_count(txn);
        ((percentile as f64 / 100.0) * count as f64).floor() as usize
    }
}

/// Runs garbage collection against a local store on the async queue, first after a minute
/// and then every five minutes.
pub struct LruScheduler {
    queue: AsyncQueue,
    local_store: Arc<async_lock::Mutex<LocalStore>>,
    garbage_collector: LruGarbageCollector,
    task: Arc<StdMutex<Option<DelayedOperation>>>,
}

impl LruScheduler {
    pub fn new(
        queue: AsyncQueue,
        local_store: Arc<async_lock::Mutex<LocalStore>>,
        garbage_collector: LruGarbageCollector,
    ) -> Self {
        Self {
            queue,
            local_store,
            garbage_collector,
            task: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn start(&self) {
        if !self.garbage_collector.params().is_enabled() {
            return;
        }
        self.schedule(INITIAL_GC_DELAY);
    }

    pub fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|poison| poison.into_inner()).take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .is_some()
    }

    fn schedule(&self, delay: Duration) {
        let next = Self {
            queue: self.queue.clone(),
            local_store: Arc::clone(&self.local_store),
            garbage_collector: self.garbage_collector,
            task: Arc::clone(&self.task),
        };
        log::debug!("garbage collection scheduled in {} s", delay.as_secs());
        let operation = self.queue.enqueue_after_delay(TimerId::LruGarbageCollection, delay, async move {
            {
                let mut local_store = next.local_store.lock().await;
                match local_store.collect_garbage(&next.garbage_collector) {
                    Ok(results) => log::debug!("garbage collection finished: {results:?}"),
                    Err(err) => log::warn!("garbage collection failed: {err}"),
                }
            }
            if next.is_started() {
                next.schedule(REGULAR_GC_DELAY);
            }
            Ok(())
        });
        *self.task.lock().unwrap_or_else(|poison| poison.into_inner()) = Some(operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, TransactionMode};
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::{MutableDocument, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str) -> MutableDocument {
        let mut document =
            MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(1_000), MapValue::empty());
        document.set_read_time(SnapshotVersion::from_micros(1_000));
        document
    }

    fn collector(threshold: i64) -> LruGarbageCollector {
        let params = LruParams {
            cache_size_collection_threshold: threshold,
            percentile_to_collect: 50,
            maximum_sequence_numbers_to_collect: 1_000,
        };
        LruGarbageCollector::new(params, LruDelegate::default())
    }

    #[test]
    fn params_validate_minimum_size() {
        assert!(LruParams::default().validate().is_ok());
        assert!(LruParams::disabled().validate().is_ok());
        assert!(LruParams::with_cache_size(1024).validate().is_err());
    }

    #[test]
    fn params_load_from_camel_case_json() {
        let params: LruParams = serde_json::from_str(r#"{"cacheSizeCollectionThreshold": -1}"#).unwrap();
        assert!(!params.is_enabled());
        assert_eq!(params.percentile_to_collect, 10);
    }

    #[test]
    fn disabled_collector_does_not_run() {
        let persistence = MemoryPersistence::new();
        let results = run_transaction(&persistence, "gc", TransactionMode::ReadWritePrimary, |txn| {
            Ok(collector(COLLECTION_DISABLED).collect(txn, &BTreeSet::new(), &ReferenceSet::new()))
        })
        .unwrap();
        assert!(!results.did_run);
    }

    #[test]
    fn collects_old_targets_and_orphans_but_spares_pins() {
        let persistence = MemoryPersistence::new();
        let target_cache = TargetCache::new();
        let remote_documents = RemoteDocumentCache::default();
        let delegate = LruDelegate::default();

        for (id, collection) in [(2, "old"), (4, "new")] {
            run_transaction(&persistence, "setup", TransactionMode::ReadWrite, |txn| {
                let target = Query::collection(collection).unwrap().to_target();
                let data = TargetData::new(target, id, TargetPurpose::Listen, txn.current_sequence_number());
                target_cache.add_target_data(txn, &data);
                let document_key = key(&format!("{collection}/doc"));
                target_cache.add_matching_keys(txn, &[document_key.clone()], id);
                delegate.add_reference(txn, &document_key);
                let mut buffer = remote_documents.new_change_buffer();
                buffer.add_entry(doc(&format!("{collection}/doc")));
                buffer.add_entry(doc(&format!("{collection}/orphan")));
                buffer.apply(txn);
                Ok(())
            })
            .unwrap();
        }

        let mut pins = ReferenceSet::new();
        pins.add_reference(key("old/orphan"), 2);
        let results = run_transaction(&persistence, "gc", TransactionMode::ReadWritePrimary, |txn| {
            Ok(collector(0).collect(txn, &[4].into_iter().collect(), &pins))
        })
        .unwrap();

        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        run_transaction(&persistence, "verify", TransactionMode::ReadOnly, |txn| {
            assert!(target_cache.get_target_data_for_id(txn, 2).is_none());
            assert!(target_cache.get_target_data_for_id(txn, 4).is_some());
            assert!(!remote_documents.get_entry(txn, &key("old/doc")).is_valid_document());
            assert!(remote_documents.get_entry(txn, &key("old/orphan")).is_valid_document());
            assert!(remote_documents.get_entry(txn, &key("new/doc")).is_valid_document());
            Ok(())
        })
        .unwrap();
    }
}
