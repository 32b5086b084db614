use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// A server-assigned logical time at which a document or target was observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    pub fn max() -> Self {
        Self {
            timestamp: Timestamp::new(253_402_300_799, 999_999_999),
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(Timestamp::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        ))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.seconds * 1_000_000 + i64::from(self.timestamp.nanos / 1_000)
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.timestamp)
    }
}
