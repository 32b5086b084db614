use bytes::Bytes;

use crate::firestore::core::TargetId;
use crate::firestore::error::FirestoreError;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// One decoded message from the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    DocumentChange(DocumentWatchChange),
    TargetChange(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// The global snapshot version carried by this change, or `min` if it carries none.
    ///
    /// Only target changes addressed to no target in particular mark a consistent snapshot.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change) if change.target_ids.is_empty() => change.read_time,
            _ => SnapshotVersion::min(),
        }
    }
}

/// A document entered, changed in, or left one or more targets.
///
/// `new_doc` is a found document for updates, a `NoDocument` for deletes and `None` when the
/// document merely stopped matching.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<MutableDocument>,
}

impl DocumentWatchChange {
    pub fn update(document: MutableDocument, updated_target_ids: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids,
            removed_target_ids: Vec::new(),
            key: document.key().clone(),
            new_doc: Some(document),
        }
    }

    pub fn delete(key: DocumentKey, version: SnapshotVersion, removed_target_ids: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids,
            new_doc: Some(MutableDocument::new_no_document(key.clone(), version)),
            key,
        }
    }

    pub fn remove(key: DocumentKey, removed_target_ids: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids,
            key,
            new_doc: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means the change applies to every active target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Bytes,
    pub read_time: SnapshotVersion,
    /// Only set on `Removed` changes that reject the target.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Bytes::new(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Bytes) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }

    /// A global `NoChange` marking everything received so far as consistent at `read_time`.
    pub fn global_snapshot(resume_token: Bytes, read_time: SnapshotVersion) -> Self {
        Self::new(WatchTargetChangeState::NoChange, Vec::new())
            .with_resume_token(resume_token)
            .with_read_time(read_time)
    }
}

/// The server's document count for a target, optionally with a bloom filter of the names
/// it still holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParams>,
}

impl ExistenceFilterChange {
    pub fn new(target_id: TargetId, count: i32) -> Self {
        Self {
            target_id,
            count,
            unchanged_names: None,
        }
    }

    pub fn with_bloom_filter(mut self, params: BloomFilterParams) -> Self {
        self.unchanged_names = Some(params);
        self
    }
}

/// Bloom filter as transmitted: the base64 bitmap, its padding and the hash count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterParams {
    pub bitmap: String,
    pub padding: i32,
    pub hash_count: i32,
}
