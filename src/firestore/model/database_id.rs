use std::fmt::{Display, Formatter};

use serde::Deserialize;

use crate::firestore::model::DocumentKey;

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// The project and database a client is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseId {
    pub project_id: String,
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_database() -> String {
    DEFAULT_DATABASE_ID.to_string()
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// Fully qualified resource name of a document, as the backend spells it.
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!("{self}/documents/{}", key.path().canonical_string())
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/databases/{}", self.project_id, self.database)
    }
}
