//! # trace-core
//!
//! Durable, process-safe store that attributes agent actions to the session
//! that performed them, including delegated sub-sessions spawned by other
//! processes.
//!
//! ## Design Principles
//!
//! - **Filesystem only**: every record is a JSON file written with an atomic
//!   rename; coordination between processes uses marker-file locks.
//! - **Explicit context**: a process finds its session from an id or a
//!   `(parent, label)` derivation key handed down at spawn time, never from
//!   shared "current session" state.
//! - **No event loss**: events whose parent is not recorded yet are stored as
//!   orphans and adopted when the parent appears.
//! - **Forests, not graphs**: records reference each other by id; parent
//!   loops are rejected at write time.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trace_core::{ContextSource, NewEvent, TraceStore};
//!
//! let store = TraceStore::open_default()?;
//! let key = ContextSource::from_env().session_key(store.registry(), store.config())?;
//! let (session, _) = store.resolve_or_create_session(&key)?;
//! store.append_event(NewEvent::new(&session.id, "bash").with_summary("cargo fmt"))?;
//! ```

pub mod atomic;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod ids;
pub mod lock;
pub mod orphans;
pub mod records;
pub mod registry;
pub mod storage;
pub mod store;
pub mod tree;
pub mod types;

pub use atomic::{
    cleanup_orphaned_temp_files, create_if_absent, generate_unique_temp_path, validate_write,
    write_atomic, write_json_atomic, TempCleanupStats,
};
pub use config::{load_store_config, LockPolicy, StoreConfig};
pub use context::{child_env, ContextSource};
pub use error::{Result, TraceError};
pub use events::EventStore;
pub use ids::derive_delegate_session_id;
pub use lock::{DirLocker, LockGuard, LockKind};
pub use orphans::{OrphanEntry, OrphanIndex, ReconcileReport, Reconciler};
pub use registry::{SessionKey, SessionRegistry};
pub use storage::StorageConfig;
pub use store::TraceStore;
pub use tree::SessionNode;
pub use types::*;
