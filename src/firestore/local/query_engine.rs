use serde::Deserialize;

use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::index_manager::{IndexManager, IndexType};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    DocumentKeySet, DocumentMap, DocumentSet, IndexOffset, MutableDocument, SnapshotVersion, BATCH_ID_UNKNOWN,
};

/// Default number of scanned documents below which no index is created automatically.
pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
/// Default cost of reading a document through an index relative to a full scan.
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 2.0;

/// Tuning for the query engine's index heuristics.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryEngineSettings {
    pub index_auto_creation_enabled: bool,
    pub index_auto_creation_min_collection_size: usize,
    pub relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngineSettings {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: false,
            index_auto_creation_min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }
}

impl QueryEngineSettings {
    pub fn validate(&self) -> FirestoreResult<()> {
        if !(self.relative_index_read_cost_per_document > 0.0) {
            return Err(invalid_argument(
                "relative_index_read_cost_per_document must be a positive number",
            ));
        }
        Ok(())
    }
}

/// Counters collected while a query runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub document_read_count: usize,
}

/// Which strategy produced a query result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    Index,
    PreviousResults,
    FullScan,
}

/// Picks the cheapest way to answer a query from the local cache.
///
/// Strategies are tried in order: an index lookup, then the keys that matched at the last
/// limbo-free snapshot plus anything changed since, and finally a scan of the collection.
#[derive(Clone, Debug, Default)]
pub struct QueryEngine {
    settings: QueryEngineSettings,
    index_manager: IndexManager,
}

impl QueryEngine {
    pub fn new(settings: QueryEngineSettings, index_manager: IndexManager) -> Self {
        Self {
            settings,
            index_manager,
        }
    }

    pub fn settings(&self) -> &QueryEngineSettings {
        &self.settings
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> DocumentMap {
        self.get_documents_matching_query_with_strategy(txn, view, query, last_limbo_free_snapshot_version, remote_keys)
            .0
    }

    /// Same as [`Self::get_documents_matching_query`] but reports the strategy used.
    pub fn get_documents_matching_query_with_strategy(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> (DocumentMap, QueryStrategy) {
        if let Some(results) = self.perform_query_using_index(txn, view, query) {
            return (results, QueryStrategy::Index);
        }
        if let Some(results) =
            self.perform_query_using_remote_keys(txn, view, query, remote_keys, last_limbo_free_snapshot_version)
        {
            return (results, QueryStrategy::PreviousResults);
        }

        let mut context = QueryContext::default();
        let results = view.get_documents_matching_query(txn, query, IndexOffset::none(), &mut context);
        if self.settings.index_auto_creation_enabled {
            self.create_cache_indexes(txn, query, &context, results.len());
        }
        (results, QueryStrategy::FullScan)
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
    ) -> Option<DocumentMap> {
        if query.matches_all_documents() {
            return None;
        }
        let target = query.to_target();
        if self.index_manager.get_index_type(txn, &target) == IndexType::None {
            return None;
        }
        let keys = self.index_manager.get_documents_matching_target(txn, &target)?;
        let keys: DocumentKeySet = keys.into_iter().collect();
        let indexed = view.get_documents(txn, &keys);
        let previous_results = apply_query(query, &indexed);

        // Index entries track remote documents only; a local write at the limit edge could
        // have pushed a document out of the window.
        if query.has_limit() && needs_refill(query, &previous_results, &keys, SnapshotVersion::max()) {
            return self.perform_query_using_index(txn, view, &query.without_limit());
        }

        // Every remote change is indexed synchronously, so only overlays can add documents.
        let offset = IndexOffset {
            read_time: SnapshotVersion::max(),
            largest_batch_id: BATCH_ID_UNKNOWN,
        };
        Some(append_remaining_results(txn, view, previous_results, query, offset))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
        remote_keys: &DocumentKeySet,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<DocumentMap> {
        // A collection scan is as fast as a lookup for queries without constraints.
        if query.matches_all_documents() {
            return None;
        }
        // Without a limbo-free snapshot the previous results cannot be trusted.
        if last_limbo_free_snapshot_version.is_min() {
            return None;
        }

        let documents = view.get_documents(txn, remote_keys);
        let previous_results = apply_query(query, &documents);
        if query.has_limit() && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version) {
            return None;
        }

        log::debug!(
            "re-using previous result from {last_limbo_free_snapshot_version} to execute query {}",
            query.canonical_id()
        );
        let offset = IndexOffset::from_read_time(last_limbo_free_snapshot_version);
        Some(append_remaining_results(txn, view, previous_results, query, offset))
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) {
        if context.document_read_count < self.settings.index_auto_creation_min_collection_size {
            log::debug!(
                "skipping index creation for {}: scanned {} documents, below the minimum of {}",
                query.canonical_id(),
                context.document_read_count,
                self.settings.index_auto_creation_min_collection_size
            );
            return;
        }
        let scan_cost = context.document_read_count as f64;
        let index_cost = result_size as f64 * self.settings.relative_index_read_cost_per_document;
        if scan_cost > index_cost {
            self.index_manager.create_target_indexes(txn, &query.to_target());
            log::debug!(
                "created cache index for {}: scan read {} documents for {} results",
                query.canonical_id(),
                context.document_read_count,
                result_size
            );
        }
    }
}

/// Documents from `documents` that match `query`, in query order.
fn apply_query(query: &Query, documents: &DocumentMap) -> DocumentSet {
    let mut results = DocumentSet::new(query.document_comparator());
    for document in documents.values() {
        if query.matches(document) {
            results.add(document.clone());
        }
    }
    results
}

/// Whether the limited previous results can no longer be trusted.
///
/// That is the case when a previously matching document no longer matches, or when the
/// document at the limit edge changed since the results were computed: a document that
/// was outside the window could now sort ahead of it.
fn needs_refill(
    query: &Query,
    previous_results: &DocumentSet,
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != previous_results.len() {
        return true;
    }
    let edge: Option<&MutableDocument> = match query.limit_type() {
        LimitType::First => previous_results.last(),
        LimitType::Last => previous_results.first(),
    };
    match edge {
        Some(document) => document.has_pending_writes() || document.version() > limbo_free_snapshot_version,
        None => false,
    }
}

fn append_remaining_results(
    txn: &mut PersistenceTransaction<'_>,
    view: &LocalDocumentsView,
    indexed_results: DocumentSet,
    query: &Query,
    offset: IndexOffset,
) -> DocumentMap {
    let mut remaining = view.get_documents_matching_query(txn, query, offset, &mut QueryContext::default());
    for document in indexed_results.iter() {
        remaining.insert(document.key().clone(), document.clone());
    }
    remaining
}
