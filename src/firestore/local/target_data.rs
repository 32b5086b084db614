use bytes::Bytes;

use crate::firestore::core::{Target, TargetId};
use crate::firestore::model::SnapshotVersion;

pub type ListenSequenceNumber = i64;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Why the client is listening to a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after the existence filter count disagreed and no bloom filter could be used.
    ExistenceFilterMismatch,
    /// Re-listen after the bloom filter was applied but the count still disagreed.
    ExistenceFilterMismatchBloom,
    /// A single-document target used to resolve a limbo document.
    LimboResolution,
}

/// Bookkeeping for one watch target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    pub snapshot_version: SnapshotVersion,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Bytes,
    /// Number of documents the target matched when it was last resumed.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(target: Target, target_id: TargetId, purpose: TargetPurpose, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Bytes::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// A new resume point; the expected count is only valid for the previous token.
    pub fn with_resume_token(&self, resume_token: Bytes, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}
