use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(
                "Document keys must point to a document (even number of segments)",
            ));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let resource = ResourcePath::from_string(path)?;
        Self::from_path(resource)
    }

    /// The sentinel key used by empty bounds and placeholder documents.
    pub fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    /// A range bound that sorts before every document nested under `path`.
    pub(crate) fn prefix_start(path: &ResourcePath) -> Self {
        Self { path: path.clone() }
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        path.len() % 2 == 0
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The id of the collection this document lives in (`rooms` for `rooms/eros`).
    pub fn collection_group(&self) -> &str {
        self.path
            .get(self.path.len().saturating_sub(2))
            .unwrap_or_default()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.path.len() >= 2 && self.collection_group() == collection_id
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}
