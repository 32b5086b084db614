use std::fmt;

/// The identity pending writes and overlays are scoped to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: Some(uid.into()) }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key used to partition per-user local state.
    pub fn to_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => f.write_str("User(anonymous)"),
        }
    }
}
