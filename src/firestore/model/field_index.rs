use crate::firestore::model::{BatchId, FieldPath, SnapshotVersion, BATCH_ID_UNKNOWN};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// A client-side index over one or more fields of a collection group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

/// Index id used before the index manager assigns one.
pub const UNKNOWN_INDEX_ID: i32 = -1;

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: UNKNOWN_INDEX_ID,
            collection_group: collection_group.into(),
            segments,
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments.iter().find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments.iter().filter(|segment| segment.kind != IndexKind::Contains)
    }

    /// Two indexes are equivalent if they cover the same group and segments.
    pub fn same_definition(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}

/// A position in the remote document cache and mutation queue.
///
/// Documents read after `read_time`, and overlays from batches after `largest_batch_id`,
/// are past the offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    /// An offset that precedes everything.
    pub fn none() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            largest_batch_id: BATCH_ID_UNKNOWN,
        }
    }

    pub fn from_read_time(read_time: SnapshotVersion) -> Self {
        Self {
            read_time,
            largest_batch_id: BATCH_ID_UNKNOWN,
        }
    }
}
