use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};

const DOCUMENT_ID_FIELD: &str = "__name__";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument(
                "FieldPath must contain at least one non-empty segment",
            ));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        FieldPath::new(path.split('.'))
    }

    pub fn first_segment(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or_default()
    }

    pub fn last_segment(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.len() <= other.len() && other.segments.starts_with(&self.segments)
    }

    /// Drops the last segment; `None` for single segment paths.
    pub fn parent(&self) -> Option<FieldPath> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn document_id() -> Self {
        Self {
            segments: vec![DOCUMENT_ID_FIELD.to_string()],
        }
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_ID_FIELD
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        left.cmp(right)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// Trait that converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self)
    }
}

impl<'a> IntoFieldPath for &'a FieldPath {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl<'a> IntoFieldPath for &'a str {
    fn into_field_path(self) -> FirestoreResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}
