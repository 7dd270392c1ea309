//! Tolerant readers for durable records.
//!
//! Reads retry transient I/O errors a bounded number of times with doubling
//! backoff. A record that is present but unreadable as its schema (empty,
//! truncated by an external tool, wrong version) is logged and reported as
//! corrupt. Callers treat it as absent and recreate it.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::config::StoreConfig;
use crate::error::{Result, TraceError};

/// Reads `path`, retrying transient failures. `Ok(None)` if it does not exist.
pub fn read_with_retry(path: &Path, retries: u32, backoff: Duration) -> Result<Option<Vec<u8>>> {
    read_with_retry_using(path, retries, backoff, |p| fs_err::read(p))
}

/// [`read_with_retry`] through a caller-supplied reader. At most
/// `retries + 1` reads are attempted.
pub fn read_with_retry_using<F>(
    path: &Path,
    retries: u32,
    backoff: Duration,
    mut read: F,
) -> Result<Option<Vec<u8>>>
where
    F: FnMut(&Path) -> std::io::Result<Vec<u8>>,
{
    let mut attempt = 0;
    let mut delay = backoff;

    loop {
        match read(path) {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                let err = TraceError::io("reading record", e);
                if !err.is_transient() || attempt >= retries {
                    return Err(err);
                }
                tracing::debug!(
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "Retrying record read"
                );
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

/// Outcome of loading a record from disk.
#[derive(Debug, Clone, PartialEq)]
pub enum Record<T> {
    Present(T),
    Missing,
    /// Present on disk but unreadable as its schema.
    Corrupt,
}

impl<T> Record<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Record::Present(value) => Some(value),
            Record::Missing | Record::Corrupt => None,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Record::Corrupt)
    }
}

/// Loads a JSON record, classifying it as present, missing or corrupt.
/// Only persistent I/O failures are errors.
pub fn load_record<T: DeserializeOwned>(path: &Path, config: &StoreConfig) -> Result<Record<T>> {
    let Some(bytes) = read_with_retry(path, config.read_retries, config.read_backoff())? else {
        return Ok(Record::Missing);
    };

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        tracing::warn!(path = %path.display(), "Empty record, treating as absent");
        return Ok(Record::Corrupt);
    }

    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Ok(Record::Present(value)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Corrupt record, treating as absent"
            );
            Ok(Record::Corrupt)
        }
    }
}

/// Loads a JSON record. Missing and corrupt records both come back as `None`.
pub fn load_json<T: DeserializeOwned>(path: &Path, config: &StoreConfig) -> Result<Option<T>> {
    load_record(path, config).map(Record::into_option)
}

/// Moves a corrupt record aside (`<name>.corrupt-<micros>`) so it can be
/// recreated without destroying the evidence. Returns the new path.
pub fn quarantine(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?.to_str()?;
    let target = path.with_file_name(format!(
        "{}.corrupt-{}",
        file_name,
        chrono::Utc::now().timestamp_micros()
    ));
    match fs_err::rename(path, &target) {
        Ok(()) => {
            tracing::warn!(
                from = %path.display(),
                to = %target.display(),
                "Quarantined corrupt record"
            );
            Some(target)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to quarantine corrupt record");
            None
        }
    }
}
