//! Advisory shared/exclusive locks built from marker files.
//!
//! OS file locks behave differently across platforms and network
//! filesystems, so coordination here is done with plain files that every
//! process can see.
//!
//! # Marker Layout
//!
//! Location: `<root>/locks/<scope>/`, one file per holder or waiter.
//!
//! ```text
//! locks/sessions/
//! ├── exclusive-00001718000000123456-4242-9f3a1c07.lock
//! └── shared-00001718000000124001-4310-0b6e44d2.lock
//! ```
//!
//! The name encodes kind, creation time (µs), holder pid and a nonce, so a
//! directory listing alone is enough to decide who holds what. The body is a
//! small JSON [`LockMarker`] kept for humans and `store-check`.
//!
//! # Protocol
//!
//! A caller first publishes its own marker (create-if-absent), then lists the
//! directory:
//!
//! - **shared** is granted when no exclusive marker exists. Seeing one, the
//!   shared caller withdraws its marker and retries, so a waiting writer is
//!   never starved by a stream of readers.
//! - **exclusive** is granted when no other marker exists at all. Seeing an
//!   older exclusive marker it withdraws and retries; otherwise it keeps its
//!   marker and waits for the others to leave.
//!
//! Because every caller publishes before it looks, two callers can never both
//! see an empty directory: the later publisher always sees the earlier one.
//!
//! # Stale Markers
//!
//! Markers whose pid is dead, or which are older than the configured stale
//! age (pid reuse), are removed by whoever finds them.
//!
//! Locks are advisory. Code that mutates shared records without going through
//! a locker can still corrupt them.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::atomic;
use crate::config::{LockPolicy, StoreConfig};
use crate::error::{Result, TraceError};
use crate::storage::StorageConfig;

const MARKER_EXTENSION: &str = "lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    fn as_str(self) -> &'static str {
        match self {
            LockKind::Shared => "shared",
            LockKind::Exclusive => "exclusive",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "shared" => Some(LockKind::Shared),
            "exclusive" => Some(LockKind::Exclusive),
            _ => None,
        }
    }
}

/// Body of a marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    pub pid: u32,
    pub kind: LockKind,
    pub scope: String,
    pub created_at: DateTime<Utc>,
}

/// Identity of a marker, parsed from its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerName {
    pub kind: LockKind,
    pub created_micros: i64,
    pub pid: u32,
    pub nonce: u32,
}

impl MarkerName {
    fn file_name(&self) -> String {
        format!(
            "{}-{:020}-{}-{:08x}.{}",
            self.kind.as_str(),
            self.created_micros,
            self.pid,
            self.nonce,
            MARKER_EXTENSION
        )
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{}", MARKER_EXTENSION))?;
        let mut parts = stem.splitn(4, '-');
        let kind = LockKind::parse(parts.next()?)?;
        let created_micros = parts.next()?.parse().ok()?;
        let pid = parts.next()?.parse().ok()?;
        let nonce = u32::from_str_radix(parts.next()?, 16).ok()?;
        Some(MarkerName {
            kind,
            created_micros,
            pid,
            nonce,
        })
    }

    /// Older markers sort first; pid and nonce break same-microsecond ties.
    fn seniority(&self, other: &MarkerName) -> Ordering {
        (self.created_micros, self.pid, self.nonce).cmp(&(
            other.created_micros,
            other.pid,
            other.nonce,
        ))
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        let micros = now.timestamp_micros().saturating_sub(self.created_micros);
        Duration::from_micros(micros.max(0) as u64)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Granted,
    Wait,
    BackOff,
}

fn decide(own: &MarkerName, others: &[MarkerName]) -> Decision {
    match own.kind {
        LockKind::Shared => {
            if others.iter().any(|m| m.kind == LockKind::Exclusive) {
                Decision::BackOff
            } else {
                Decision::Granted
            }
        }
        LockKind::Exclusive => {
            if others.is_empty() {
                Decision::Granted
            } else if others
                .iter()
                .any(|m| m.kind == LockKind::Exclusive && m.seniority(own) == Ordering::Less)
            {
                Decision::BackOff
            } else {
                Decision::Wait
            }
        }
    }
}

/// Coordinates access to one named scope (a directory of registry files,
/// one session's event log, the orphan index).
#[derive(Debug, Clone)]
pub struct DirLocker {
    scope: String,
    scope_dir: PathBuf,
    poll: Duration,
    stale_after: Duration,
}

impl DirLocker {
    pub fn new(storage: &StorageConfig, scope: &str, config: &StoreConfig) -> Self {
        Self {
            scope: scope.to_string(),
            scope_dir: storage.lock_scope_dir(scope),
            poll: config.lock_poll(),
            stale_after: config.stale_lock_age(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Blocks until no other marker exists in the scope, or `timeout` passes.
    pub fn acquire_exclusive(&self, timeout: Duration) -> Result<LockGuard> {
        self.acquire(LockKind::Exclusive, timeout)
    }

    /// Blocks until no exclusive marker exists in the scope, or `timeout`
    /// passes. Other shared holders are fine.
    pub fn acquire_shared(&self, timeout: Duration) -> Result<LockGuard> {
        self.acquire(LockKind::Shared, timeout)
    }

    fn acquire(&self, kind: LockKind, timeout: Duration) -> Result<LockGuard> {
        let start = Instant::now();
        let (mut own, mut own_path) = self.publish(kind)?;

        loop {
            let others = self.live_markers(&own);
            match decide(&own, &others) {
                Decision::Granted => {
                    tracing::trace!(scope = %self.scope, kind = ?kind, "Lock acquired");
                    return Ok(LockGuard {
                        path: own_path,
                        kind,
                        released: false,
                    });
                }
                Decision::Wait => {}
                Decision::BackOff => {
                    release_marker(&own_path);
                    if start.elapsed() >= timeout {
                        return Err(self.timeout_error(start));
                    }
                    self.sleep_with_jitter();
                    (own, own_path) = self.publish(kind)?;
                    continue;
                }
            }

            if start.elapsed() >= timeout {
                release_marker(&own_path);
                return Err(self.timeout_error(start));
            }
            self.sleep_with_jitter();
        }
    }

    /// Exclusive acquisition that honors [`LockPolicy`]. Under
    /// `BestEffort` a timeout is logged and `Ok(None)` is returned; the caller
    /// proceeds unlocked.
    pub fn acquire_exclusive_with_policy(&self, config: &StoreConfig) -> Result<Option<LockGuard>> {
        match self.acquire_exclusive(config.lock_timeout()) {
            Ok(guard) => Ok(Some(guard)),
            Err(err) if err.is_lock_timeout() && config.lock_policy == LockPolicy::BestEffort => {
                tracing::warn!(
                    scope = %self.scope,
                    error = %err,
                    "Lock timed out, proceeding without it"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Lists current holders and waiters, oldest first. Does not reap.
    pub fn markers(&self) -> Vec<MarkerName> {
        let mut markers: Vec<MarkerName> = self
            .marker_entries()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        markers.sort_by(|a, b| a.seniority(b));
        markers
    }

    fn publish(&self, kind: LockKind) -> Result<(MarkerName, PathBuf)> {
        let pid = std::process::id();
        loop {
            let now = Utc::now();
            let name = MarkerName {
                kind,
                created_micros: now.timestamp_micros(),
                pid,
                nonce: rand::random(),
            };
            let path = self.scope_dir.join(name.file_name());
            let marker = LockMarker {
                pid,
                kind,
                scope: self.scope.clone(),
                created_at: now,
            };
            if atomic::create_json_if_absent(&path, &marker)? {
                return Ok((name, path));
            }
        }
    }

    /// Markers other than `own`, with stale ones removed along the way.
    fn live_markers(&self, own: &MarkerName) -> Vec<MarkerName> {
        let now = Utc::now();
        let own_pid = std::process::id();

        self.marker_entries()
            .into_iter()
            .filter(|(name, _)| name != own)
            .filter(|(name, path)| {
                let dead = name.pid != own_pid && !is_pid_alive(name.pid);
                let expired = name.age(now) > self.stale_after;
                if dead || expired {
                    tracing::debug!(
                        scope = %self.scope,
                        pid = name.pid,
                        dead,
                        expired,
                        "Reclaiming stale lock marker"
                    );
                    release_marker(path);
                    false
                } else {
                    true
                }
            })
            .map(|(name, _)| name)
            .collect()
    }

    fn marker_entries(&self) -> Vec<(MarkerName, PathBuf)> {
        let entries = match fs_err::read_dir(&self.scope_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        entries
            .flatten()
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let name = MarkerName::parse(file_name.to_str()?)?;
                Some((name, entry.path()))
            })
            .collect()
    }

    fn sleep_with_jitter(&self) {
        let poll_ms = self.poll.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=poll_ms);
        thread::sleep(Duration::from_millis(poll_ms + jitter));
    }

    fn timeout_error(&self, start: Instant) -> TraceError {
        TraceError::LockTimeout {
            scope: self.scope.clone(),
            waited: start.elapsed(),
        }
    }
}

/// A held lock. Dropping it releases the marker.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    kind: LockKind,
    released: bool,
}

impl LockGuard {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn marker_path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        release_marker(&self.path);
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            release_marker(&self.path);
        }
    }
}

/// Removes a marker. Already-gone markers are fine, so cleanup paths can call
/// this unconditionally.
pub fn release_marker(path: &Path) -> bool {
    match fs_err::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to release lock marker");
            false
        }
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill(pid, 0) sends no signal; it only reports whether the
        // pid exists. EPERM means it exists but belongs to another user.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn locker(root: &Path, scope: &str) -> DirLocker {
        let config = StoreConfig {
            lock_poll_ms: 1,
            ..StoreConfig::default()
        };
        DirLocker::new(&StorageConfig::with_root(root), scope, &config)
    }

    fn plant_marker(locker: &DirLocker, name: &MarkerName) -> PathBuf {
        fs_err::create_dir_all(&locker.scope_dir).unwrap();
        let path = locker.scope_dir.join(name.file_name());
        std::fs::write(&path, "{}").unwrap();
        path
    }

    #[test]
    fn test_marker_name_round_trip() {
        let name = MarkerName {
            kind: LockKind::Exclusive,
            created_micros: 1_718_000_000_123_456,
            pid: 4242,
            nonce: 0x9f3a1c07,
        };
        assert_eq!(
            name.file_name(),
            "exclusive-00001718000000123456-4242-9f3a1c07.lock"
        );
        assert_eq!(MarkerName::parse(&name.file_name()), Some(name));
        assert_eq!(MarkerName::parse("notes.txt"), None);
        assert_eq!(MarkerName::parse("bogus-1-2-3.lock"), None);
    }

    #[test]
    fn test_decide_rules() {
        let mk = |kind, created_micros| MarkerName {
            kind,
            created_micros,
            pid: 1,
            nonce: 0,
        };
        let shared = mk(LockKind::Shared, 10);
        let older_excl = mk(LockKind::Exclusive, 5);
        let newer_excl = mk(LockKind::Exclusive, 20);
        let own_excl = mk(LockKind::Exclusive, 10);

        assert_eq!(decide(&shared, &[]), Decision::Granted);
        assert_eq!(decide(&shared, &[mk(LockKind::Shared, 3)]), Decision::Granted);
        assert_eq!(decide(&shared, &[newer_excl.clone()]), Decision::BackOff);
        assert_eq!(decide(&own_excl, &[]), Decision::Granted);
        assert_eq!(decide(&own_excl, &[older_excl]), Decision::BackOff);
        assert_eq!(decide(&own_excl, &[newer_excl]), Decision::Wait);
        assert_eq!(decide(&own_excl, &[shared]), Decision::Wait);
    }

    #[test]
    fn test_exclusive_acquire_and_release() {
        let temp = tempdir().unwrap();
        let locker = locker(temp.path(), "sessions");

        let guard = locker.acquire_exclusive(Duration::from_millis(200)).unwrap();
        assert_eq!(guard.kind(), LockKind::Exclusive);
        assert!(guard.marker_path().exists());
        assert_eq!(locker.markers().len(), 1);

        let path = guard.marker_path().to_path_buf();
        guard.release();
        assert!(!path.exists());
        assert!(locker.markers().is_empty());
    }

    #[test]
    fn test_exclusive_times_out_while_held() {
        let temp = tempdir().unwrap();
        let holder = locker(temp.path(), "sessions");
        let contender = locker(temp.path(), "sessions");

        let _guard = holder.acquire_exclusive(Duration::from_millis(200)).unwrap();
        let err = contender
            .acquire_exclusive(Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_lock_timeout());
        // The contender withdrew its marker.
        assert_eq!(holder.markers().len(), 1);
    }

    #[test]
    fn test_shared_coexists_but_blocks_exclusive() {
        let temp = tempdir().unwrap();
        let a = locker(temp.path(), "events-s1");
        let b = locker(temp.path(), "events-s1");

        let s1 = a.acquire_shared(Duration::from_millis(200)).unwrap();
        let s2 = b.acquire_shared(Duration::from_millis(200)).unwrap();
        assert!(a.acquire_exclusive(Duration::from_millis(30)).is_err());

        drop(s1);
        drop(s2);
        assert!(a.acquire_exclusive(Duration::from_millis(200)).is_ok());
    }

    #[test]
    fn test_shared_blocked_by_exclusive() {
        let temp = tempdir().unwrap();
        let a = locker(temp.path(), "orphans");
        let _held = a.acquire_exclusive(Duration::from_millis(200)).unwrap();
        assert!(a.acquire_shared(Duration::from_millis(30)).is_err());
    }

    #[test]
    fn test_scopes_are_independent() {
        let temp = tempdir().unwrap();
        let a = locker(temp.path(), "events-s1");
        let b = locker(temp.path(), "events-s2");
        let _ga = a.acquire_exclusive(Duration::from_millis(200)).unwrap();
        assert!(b.acquire_exclusive(Duration::from_millis(200)).is_ok());
    }

    #[test]
    fn test_release_is_noop_when_marker_gone() {
        let temp = tempdir().unwrap();
        let locker = locker(temp.path(), "sessions");
        let guard = locker.acquire_exclusive(Duration::from_millis(200)).unwrap();
        std::fs::remove_file(guard.marker_path()).unwrap();
        assert!(release_marker(guard.marker_path()));
        drop(guard);
    }

    #[test]
    fn test_best_effort_policy_proceeds_unlocked() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path());
        let strict = StoreConfig {
            lock_poll_ms: 1,
            lock_timeout_ms: 20,
            ..StoreConfig::default()
        };
        let lenient = StoreConfig {
            lock_policy: LockPolicy::BestEffort,
            ..strict.clone()
        };
        let holder = DirLocker::new(&storage, "sessions", &strict);
        let _held = holder.acquire_exclusive(Duration::from_millis(200)).unwrap();

        let contender = DirLocker::new(&storage, "sessions", &strict);
        assert!(contender.acquire_exclusive_with_policy(&strict).is_err());
        let contender = DirLocker::new(&storage, "sessions", &lenient);
        assert!(contender
            .acquire_exclusive_with_policy(&lenient)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_dead_pid_marker_is_reclaimed() {
        let temp = tempdir().unwrap();
        let locker = locker(temp.path(), "sessions");
        let dead = plant_marker(
            &locker,
            &MarkerName {
                kind: LockKind::Exclusive,
                created_micros: Utc::now().timestamp_micros(),
                pid: 99_999_999,
                nonce: 1,
            },
        );

        let _guard = locker.acquire_exclusive(Duration::from_millis(200)).unwrap();
        assert!(!dead.exists());
    }

    #[test]
    fn test_expired_marker_is_reclaimed() {
        let temp = tempdir().unwrap();
        let config = StoreConfig {
            lock_poll_ms: 1,
            stale_lock_secs: 60,
            ..StoreConfig::default()
        };
        let locker = DirLocker::new(&StorageConfig::with_root(temp.path()), "sessions", &config);
        let old = plant_marker(
            &locker,
            &MarkerName {
                kind: LockKind::Exclusive,
                created_micros: (Utc::now() - chrono::Duration::hours(2)).timestamp_micros(),
                pid: std::process::id(),
                nonce: 2,
            },
        );

        let _guard = locker.acquire_exclusive(Duration::from_millis(200)).unwrap();
        assert!(!old.exists());
    }

    #[test]
    fn test_exclusive_is_mutually_exclusive_across_threads() {
        let temp = tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let root = root.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    let locker = locker(&root, "sessions");
                    for _ in 0..5 {
                        let guard = locker.acquire_exclusive(Duration::from_secs(10)).unwrap();
                        let now = inside.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, AtomicOrdering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(AtomicOrdering::SeqCst), 1);
    }
}
