use serde::Deserialize;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::{LruParams, QueryEngineSettings};
use crate::firestore::model::DatabaseId;

pub use crate::util::backoff::BackoffConfig as BackoffSettings;

/// Default number of limbo documents resolved at the same time.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncEngineSettings {
    /// Limbo documents beyond this count wait in a FIFO queue.
    pub max_concurrent_limbo_resolutions: usize,
    /// How long a target stays watched after its last listener detaches. Zero unlistens
    /// immediately.
    pub unlisten_grace_period_ms: u64,
}

impl Default for SyncEngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            unlisten_grace_period_ms: 0,
        }
    }
}

/// Everything a [`FirestoreClient`](crate::firestore::core::FirestoreClient) can be tuned
/// with. Hosts usually load it from JSON with [`FirestoreSettings::from_json`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FirestoreSettings {
    pub database_id: DatabaseId,
    pub sync_engine: SyncEngineSettings,
    pub query_engine: QueryEngineSettings,
    pub lru: LruParams,
    pub backoff: BackoffSettings,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            database_id: DatabaseId::for_project("demo-project"),
            sync_engine: SyncEngineSettings::default(),
            query_engine: QueryEngineSettings::default(),
            lru: LruParams::default(),
            backoff: BackoffSettings::default(),
        }
    }
}

impl FirestoreSettings {
    /// Parses and validates settings; missing fields take their defaults.
    pub fn from_json(json: &str) -> FirestoreResult<Self> {
        let settings: Self =
            serde_json::from_str(json).map_err(|err| invalid_argument(format!("invalid settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.database_id.project_id.is_empty() {
            return Err(invalid_argument("projectId must not be empty"));
        }
        if self.sync_engine.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument("maxConcurrentLimboResolutions must be at least 1"));
        }
        if !(self.backoff.backoff_factor >= 1.0) {
            return Err(invalid_argument("backoffFactor must be at least 1.0"));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(invalid_argument("initialDelayMs must not exceed maxDelayMs"));
        }
        self.query_engine.validate()?;
        self.lru.validate()
    }
}
