//! Crash-safe file writes.
//!
//! Every durable record in the store is written through this module. An
//! observer (another process, or this one after a crash) sees either the old
//! complete file or the new complete file, never a prefix of either.
//!
//! # Mechanism
//!
//! ```text
//! content → .<name>.<micros>.<nonce>.tmp   (same directory, create_new, fsync)
//!         → rename over <name>             (write_atomic)
//!         → no-clobber rename onto <name>  (create_if_absent)
//! ```
//!
//! The temp file lives beside the target so the final step is a rename within
//! one filesystem rather than a copy. Until the rename succeeds the temp file
//! is owned by a [`TempPath`], which deletes it on drop; an error anywhere in
//! the sequence leaves the target untouched and removes the temp file.
//!
//! A writer killed between create and rename leaves a stray temp file behind.
//! [`cleanup_orphaned_temp_files`] reclaims those once they are old enough
//! that no live writer can still own them.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tempfile::TempPath;

use crate::error::{Result, TraceError};

pub const TEMP_SUFFIX: &str = ".tmp";

/// Builds a collision-resistant temp path for `target_name` inside `base_dir`.
///
/// The name combines the wall clock in microseconds with a random nonce, so
/// two writers racing on the same target in the same microsecond still get
/// distinct files.
pub fn generate_unique_temp_path(base_dir: &Path, target_name: &str) -> PathBuf {
    let micros = Utc::now().timestamp_micros();
    let nonce: u32 = rand::random();
    base_dir.join(format!(
        ".{}.{}.{:08x}{}",
        target_name, micros, nonce, TEMP_SUFFIX
    ))
}

/// True if `file_name` looks like a temp file produced by this module.
pub fn is_temp_file_name(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(TEMP_SUFFIX) && file_name.len() > 5
}

/// Replaces `path` with `content` atomically.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let staged = stage(path, content)?;
    staged.persist(path).map_err(|e| {
        TraceError::io(format!("committing {}", path.display()), e.error)
    })?;
    sync_parent_dir(path);
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| TraceError::json(format!("serializing {}", path.display()), e))?;
    write_atomic(path, &content)
}

/// Creates `path` with `content` only if nothing exists there yet.
///
/// Returns `Ok(true)` if this call created the file and `Ok(false)` if another
/// writer got there first. Either way the file at `path` is complete: the
/// content is fully written before the no-clobber rename makes it visible.
pub fn create_if_absent(path: &Path, content: &[u8]) -> Result<bool> {
    let staged = stage(path, content)?;
    match staged.persist_noclobber(path) {
        Ok(()) => {
            sync_parent_dir(path);
            Ok(true)
        }
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(TraceError::io(
            format!("creating {}", path.display()),
            e.error,
        )),
    }
}

pub fn create_json_if_absent<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| TraceError::json(format!("serializing {}", path.display()), e))?;
    create_if_absent(path, &content)
}

/// Confirms that `path` holds a non-empty, readable, well-formed JSON document.
///
/// Used by tests and by the `store-check` binary.
pub fn validate_write(path: &Path) -> Result<()> {
    let bytes = fs_err::read(path).map_err(|e| TraceError::io("validating write", e))?;

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(TraceError::InvalidWrite {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }

    serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|e| TraceError::InvalidWrite {
        path: path.to_path_buf(),
        reason: format!("not well-formed JSON: {}", e),
    })?;

    Ok(())
}

/// Results from a temp-file sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TempCleanupStats {
    pub scanned: u32,
    pub removed: u32,
    pub errors: Vec<String>,
}

/// Removes temp files under `base_dir` (recursively) older than `max_age`.
///
/// Younger temp files are left alone: they may belong to a writer that is
/// still between create and rename.
pub fn cleanup_orphaned_temp_files(base_dir: &Path, max_age: Duration) -> TempCleanupStats {
    let mut stats = TempCleanupStats::default();
    if !base_dir.exists() {
        return stats;
    }

    let now = SystemTime::now();
    for entry in walkdir::WalkDir::new(base_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_temp = entry
            .file_name()
            .to_str()
            .map(is_temp_file_name)
            .unwrap_or(false);
        if !is_temp {
            continue;
        }
        stats.scanned += 1;

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match fs_err::remove_file(entry.path()) {
            Ok(()) => {
                tracing::debug!(path = %entry.path().display(), "Removed orphaned temp file");
                stats.removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => stats.errors.push(e.to_string()),
        }
    }

    stats
}

/// Writes `content` to a fresh temp file beside `path`.
fn stage(path: &Path, content: &[u8]) -> Result<TempPath> {
    let dir = path.parent().ok_or_else(|| {
        TraceError::io(
            format!("staging {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            TraceError::io(
                format!("staging {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;

    fs_err::create_dir_all(dir).map_err(|e| TraceError::io("creating parent directory", e))?;

    let temp_path = generate_unique_temp_path(dir, file_name);
    let mut file = fs_err::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .map_err(|e| TraceError::io("opening temp file", e))?;
    let staged = TempPath::from_path(temp_path);

    file.write_all(content)
        .map_err(|e| TraceError::io("writing temp file", e))?;
    file.sync_all()
        .map_err(|e| TraceError::io("syncing temp file", e))?;

    Ok(staged)
}

/// Best-effort fsync of the directory entry so the rename itself is durable.
fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(dir) = path.parent() {
            if let Ok(handle) = std::fs::File::open(dir) {
                let _ = handle.sync_all();
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
