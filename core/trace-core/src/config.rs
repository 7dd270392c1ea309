//! Store tuning knobs, loaded from `<root>/config.json`.
//!
//! Every field has a default, so a missing or partial file is fine. A corrupt
//! file is logged and replaced by defaults; configuration problems must never
//! stop a hook from recording.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::StorageConfig;

/// What the registry does when the directory lock cannot be acquired in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Surface [`crate::TraceError::LockTimeout`] to the caller.
    #[default]
    Require,
    /// Log and proceed without the lock. Creation still goes through
    /// create-if-absent, so concurrent creators converge on one record.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub lock_timeout_ms: u64,
    pub lock_poll_ms: u64,
    /// Markers older than this are reclaimed even if the holder pid is alive
    /// (pid reuse).
    pub stale_lock_secs: u64,
    pub read_retries: u32,
    pub read_backoff_ms: u64,
    pub max_payload_bytes: usize,
    pub temp_file_max_age_secs: u64,
    pub lock_policy: LockPolicy,
    /// Deprecated. Lets a process with no explicit context attach to the most
    /// recently active top-level session, which misattributes work when two
    /// windows run at once.
    pub allow_recent_session_fallback: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            lock_poll_ms: 10,
            stale_lock_secs: 600,
            read_retries: 3,
            read_backoff_ms: 10,
            max_payload_bytes: 4_096,
            temp_file_max_age_secs: 3_600,
            lock_policy: LockPolicy::Require,
            allow_recent_session_fallback: false,
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    pub fn temp_file_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_file_max_age_secs)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

/// Loads the store configuration, returning defaults if the file is missing
/// or unreadable.
pub fn load_store_config(storage: &StorageConfig) -> StoreConfig {
    let path = storage.config_file();
    let content = match fs_err::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StoreConfig::default(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read store config, using defaults");
            return StoreConfig::default();
        }
    };

    serde_json::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!(
            path = %path.display(),
            error = %e,
            "Malformed store config, using defaults"
        );
        StoreConfig::default()
    })
}
