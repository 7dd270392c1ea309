//! Storage configuration and path management for the trace store.
//!
//! Every path the store touches is derived here, so tests can point a whole
//! store at a temp directory with [`StorageConfig::with_root`].
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── config.json              # StoreConfig (optional)
//! ├── sessions/<id>.json       # one registry record per session
//! ├── events/<session>.json    # per-session event log
//! ├── events/index/<id>.json   # event id → owning session
//! ├── orphans/<parent>.json    # records waiting on a missing parent
//! ├── locks/<scope>/           # directory-locker markers
//! └── logs/                    # hook adapter logs
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Result, TraceError};

/// Overrides the store root (absolute path).
pub const STORE_DIR_ENV: &str = "TRACE_STORE_DIR";
/// Scopes the store to a project directory under the root.
pub const PROJECT_DIR_ENV: &str = "TRACE_PROJECT_DIR";

const DEFAULT_ROOT_DIR: &str = ".agent-trace";

/// Central configuration for all trace store paths.
///
/// Production code uses [`StorageConfig::from_env`], which honors
/// `TRACE_STORE_DIR` and `TRACE_PROJECT_DIR` before falling back to
/// `~/.agent-trace`. Tests use [`StorageConfig::with_root`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    /// Creates a StorageConfig with a custom root directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the root from the environment, then the home directory.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var_os(STORE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .map(|home| home.join(DEFAULT_ROOT_DIR))
                .ok_or_else(|| {
                    TraceError::io(
                        "resolving store root",
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "home directory not found",
                        ),
                    )
                })?,
        };

        let storage = Self::with_root(base);
        match std::env::var(PROJECT_DIR_ENV) {
            Ok(project) if !project.trim().is_empty() => Ok(storage.for_project(&project)),
            _ => Ok(storage),
        }
    }

    /// Returns a store rooted under `projects/<encoded-path>/` of this root.
    ///
    /// Windows opened on the same project share this store; unrelated projects
    /// never see each other's sessions.
    pub fn for_project(&self, project_path: &str) -> Self {
        Self {
            root: self
                .root
                .join("projects")
                .join(Self::encode_path(project_path)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn session_file(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{}.json", session_id))
    }

    pub fn event_log_file(&self, session_id: &str) -> PathBuf {
        self.events_dir().join(format!("{}.json", session_id))
    }

    pub fn event_index_file(&self, event_id: &str) -> PathBuf {
        self.event_index_dir().join(format!("{}.json", event_id))
    }

    pub fn orphan_bucket_file(&self, parent_id: &str) -> PathBuf {
        self.orphans_dir().join(format!("{}.json", parent_id))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    pub fn event_index_dir(&self) -> PathBuf {
        self.events_dir().join("index")
    }

    pub fn orphans_dir(&self) -> PathBuf {
        self.root.join("orphans")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn lock_scope_dir(&self, scope: &str) -> PathBuf {
        self.locks_dir().join(scope)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Path Encoding
    // ─────────────────────────────────────────────────────────────────────────────

    /// Encodes a filesystem path for use as a directory name.
    /// Example: `/Users/pete/Code/my-project` -> `-Users-pete-Code-my-project`
    pub fn encode_path(path: &str) -> String {
        let trimmed = path.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
        trimmed.replace(['/', '\\', ':'], "-")
    }

    /// Ensures the root directory and standard subdirectories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.sessions_dir(),
            self.events_dir(),
            self.event_index_dir(),
            self.orphans_dir(),
            self.locks_dir(),
        ] {
            fs_err::create_dir_all(&dir)
                .map_err(|e| TraceError::io("creating store directory", e))?;
        }
        Ok(())
    }
}
