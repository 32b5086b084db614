use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use crate::firestore::error::{invalid_argument, FirestoreResult};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments.into_iter().map(Into::into).collect();
        Self::new(segments)
    }

    pub fn with_offset(segments: Vec<String>, offset: usize) -> Self {
        if offset >= segments.len() {
            return Self::root();
        }
        Self::new(segments[offset..].to_vec())
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Ok(Self::root());
        }

        if path.contains("//") {
            return Err(invalid_argument("Found empty segment in resource path"));
        }

        Ok(Self::from_segments(
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.to_string()),
        ))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(|s| s.as_str())
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut new_segments = self.segments.clone();
        new_segments.extend(segments.into_iter().map(Into::into));
        Self::new(new_segments)
    }

    pub fn pop_last(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self::new(segments))
    }

    pub fn without_last(&self) -> Self {
        self.pop_last().unwrap_or_else(Self::root)
    }

    pub fn pop_first_n(&self, count: usize) -> Self {
        Self::with_offset(self.segments.clone(), count)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.segments.iter().zip(other.segments.iter()).all(|(l, r)| l == r)
    }

    /// True when `other` is exactly one segment longer and starts with `self`.
    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        for (l, r) in left.segments.iter().zip(right.segments.iter()) {
            match compare_segments(l, r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        left.len().cmp(&right.len())
    }
}

/// Segments of the form `__id<n>__` are numeric ids: they sort before every other
/// segment and compare by their numeric value.
fn compare_segments(left: &str, right: &str) -> Ordering {
    match (numeric_id(left), numeric_id(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => left.cmp(right),
    }
}

fn numeric_id(segment: &str) -> Option<i64> {
    segment
        .strip_prefix("__id")
        .and_then(|rest| rest.strip_suffix("__"))
        .and_then(|digits| digits.parse::<i64>().ok())
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}
