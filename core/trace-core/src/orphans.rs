//! Orphan index and adoption.
//!
//! A record whose declared parent does not exist yet is written immediately
//! with `link = orphaned` and registered in a bucket keyed by the missing id:
//!
//! ```text
//! orphans/task-42.json   { parent_id: "task-42", waiting: [E1 (event, s2)] }
//! ```
//!
//! Whoever later creates `task-42` drains that bucket. Registration and
//! draining both run under the `orphans` lock. A child writes its entry first
//! and only then re-checks for the parent, so it either sees the parent or is
//! seen by the parent's drain.
//!
//! Lock order is `orphans` → `events-<id>` / `sessions`. Nothing holding an
//! events or sessions lock ever takes `orphans`.
//!
//! Adoption only rewrites references. Running it twice changes nothing the
//! second time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic;
use crate::config::StoreConfig;
use crate::error::{Result, TraceError};
use crate::events::EventStore;
use crate::lock::{DirLocker, LockGuard};
use crate::records::{self, Record};
use crate::registry::SessionRegistry;
use crate::storage::StorageConfig;
use crate::types::{Link, ReferentKind, RECORD_VERSION};

const LOCK_SCOPE: &str = "orphans";

/// A record waiting for its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanEntry {
    pub kind: ReferentKind,
    pub id: String,
    /// Session holding the record (the session itself for session orphans).
    pub session_id: String,
    pub registered_at: DateTime<Utc>,
}

impl OrphanEntry {
    pub fn event(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            kind: ReferentKind::Event,
            id: id.into(),
            session_id: session_id.into(),
            registered_at: Utc::now(),
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            kind: ReferentKind::Session,
            session_id: id.clone(),
            id,
            registered_at: Utc::now(),
        }
    }

    fn same_record(&self, other: &OrphanEntry) -> bool {
        self.kind == other.kind && self.id == other.id
    }
}

/// `orphans/<parent_id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrphanBucket {
    version: u32,
    parent_id: String,
    waiting: Vec<OrphanEntry>,
}

pub struct OrphanIndex {
    storage: StorageConfig,
    config: StoreConfig,
    locker: DirLocker,
}

impl OrphanIndex {
    pub fn new(storage: StorageConfig, config: StoreConfig) -> Self {
        let locker = DirLocker::new(&storage, LOCK_SCOPE, &config);
        Self {
            storage,
            config,
            locker,
        }
    }

    pub(crate) fn lock(&self) -> Result<LockGuard> {
        self.locker.acquire_exclusive(self.config.lock_timeout())
    }

    /// Records waiting on `parent_id`.
    pub fn waiting_on(&self, parent_id: &str) -> Result<Vec<OrphanEntry>> {
        let path = self.storage.orphan_bucket_file(parent_id);
        Ok(match records::load_record::<OrphanBucket>(&path, &self.config)? {
            Record::Present(bucket) if bucket.version == RECORD_VERSION => bucket.waiting,
            Record::Present(_) | Record::Corrupt => {
                tracing::warn!(parent = %parent_id, "Unreadable orphan bucket");
                Vec::new()
            }
            Record::Missing => Vec::new(),
        })
    }

    /// Missing parent ids that still have waiters.
    pub fn pending_parents(&self) -> Result<Vec<String>> {
        let dir = self.storage.orphans_dir();
        let entries = match fs_err::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TraceError::io("listing orphan buckets", e)),
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                if name.starts_with('.') {
                    return None;
                }
                name.strip_suffix(".json").map(String::from)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Adds `entry` to the bucket for `parent_id`. Caller holds the lock.
    pub(crate) fn register(&self, parent_id: &str, entry: OrphanEntry) -> Result<()> {
        let mut waiting = self.waiting_on(parent_id)?;
        if waiting.iter().any(|w| w.same_record(&entry)) {
            return Ok(());
        }

        tracing::debug!(
            parent = %parent_id,
            orphan = %entry.id,
            kind = ?entry.kind,
            "Registered orphan"
        );
        waiting.push(entry);
        self.save(parent_id, waiting)
    }

    /// Drops `adopted` from the bucket, deleting it once empty. Caller holds
    /// the lock.
    pub(crate) fn remove(&self, parent_id: &str, adopted: &[OrphanEntry]) -> Result<()> {
        let remaining: Vec<OrphanEntry> = self
            .waiting_on(parent_id)?
            .into_iter()
            .filter(|w| !adopted.iter().any(|a| a.same_record(w)))
            .collect();
        self.save(parent_id, remaining)
    }

    fn save(&self, parent_id: &str, waiting: Vec<OrphanEntry>) -> Result<()> {
        let path = self.storage.orphan_bucket_file(parent_id);
        if waiting.is_empty() {
            return match fs_err::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(TraceError::io("removing orphan bucket", e)),
            };
        }

        let bucket = OrphanBucket {
            version: RECORD_VERSION,
            parent_id: parent_id.to_string(),
            waiting,
        };
        atomic::write_json_atomic(&path, &bucket)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────────────────────────

/// Where a parent reference points once it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Referent {
    pub kind: ReferentKind,
    /// Session owning the referent (the session itself for sessions).
    pub session_id: String,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub buckets_scanned: usize,
    pub records_scanned: usize,
    pub adopted: usize,
    pub still_waiting: usize,
}

pub struct Reconciler<'a> {
    registry: &'a SessionRegistry,
    events: &'a EventStore,
    orphans: &'a OrphanIndex,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        registry: &'a SessionRegistry,
        events: &'a EventStore,
        orphans: &'a OrphanIndex,
    ) -> Self {
        Self {
            registry,
            events,
            orphans,
        }
    }

    /// Resolves a parent reference. Events win over sessions when an id
    /// names both.
    pub fn resolve_parent(&self, id: &str) -> Result<Option<Referent>> {
        if let Some(owner) = self.events.owner_of(id)? {
            if self.events.find_in_log(&owner, id)?.is_some() {
                return Ok(Some(Referent {
                    kind: ReferentKind::Event,
                    session_id: owner,
                }));
            }
        }
        if self.registry.exists(id)? {
            return Ok(Some(Referent {
                kind: ReferentKind::Session,
                session_id: id.to_string(),
            }));
        }
        Ok(None)
    }

    /// Adopts everything waiting on `parent_id`, then everything waiting on
    /// each adopted record, depth-first. Returns the number adopted.
    ///
    /// A lock timeout is logged and adopts nothing; [`Reconciler::sweep`]
    /// picks the orphans up later.
    pub fn adopt(&self, parent_id: &str) -> Result<usize> {
        // Waiters register before they re-check for the parent, so a parent
        // that already exists and sees no bucket here has nobody to adopt.
        if self.orphans.waiting_on(parent_id)?.is_empty() {
            return Ok(0);
        }

        let _guard = match self.orphans.lock() {
            Ok(guard) => guard,
            Err(err) if err.is_lock_timeout() => {
                tracing::warn!(parent = %parent_id, error = %err, "Deferring adoption");
                return Ok(0);
            }
            Err(err) => return Err(err),
        };
        self.adopt_locked(parent_id)
    }

    fn adopt_locked(&self, parent_id: &str) -> Result<usize> {
        let mut adopted = 0;
        let mut stack = vec![parent_id.to_string()];
        let mut visited = std::collections::HashSet::new();

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let waiting = self.orphans.waiting_on(&current)?;
            if waiting.is_empty() {
                continue;
            }
            let Some(referent) = self.resolve_parent(&current)? else {
                continue;
            };

            let mut done = Vec::new();
            for entry in waiting {
                if self.adopt_entry(&entry, &referent)? {
                    adopted += 1;
                }
                if self.is_settled(&entry)? {
                    stack.push(entry.id.clone());
                    done.push(entry);
                }
            }
            self.orphans.remove(&current, &done)?;
        }

        Ok(adopted)
    }

    fn adopt_entry(&self, entry: &OrphanEntry, referent: &Referent) -> Result<bool> {
        let adopted = match (entry.kind, referent.kind) {
            (ReferentKind::Event, _) => self.events.attach_parent(
                &entry.session_id,
                &entry.id,
                referent.kind,
                &referent.session_id,
            )?,
            (ReferentKind::Session, ReferentKind::Session) => {
                self.registry.mark_attached(&entry.id)?
            }
            // A session's parent must be a session; keep waiting.
            (ReferentKind::Session, ReferentKind::Event) => false,
        };

        if adopted {
            tracing::debug!(
                orphan = %entry.id,
                kind = ?entry.kind,
                parent_session = %referent.session_id,
                "Adopted orphan"
            );
        }
        Ok(adopted)
    }

    /// An entry can leave the index once its record is attached or gone.
    fn is_settled(&self, entry: &OrphanEntry) -> Result<bool> {
        let link = match entry.kind {
            ReferentKind::Event => self
                .events
                .find_in_log(&entry.session_id, &entry.id)?
                .map(|e| e.link),
            ReferentKind::Session => self.registry.get(&entry.id)?.map(|s| s.link),
        };
        Ok(link != Some(Link::Orphaned))
    }

    /// Full pass: drains every bucket whose parent now exists, then scans all
    /// records for orphans that never made it into a bucket.
    pub fn sweep(&self) -> Result<ReconcileReport> {
        let _guard = self.orphans.lock()?;
        let mut report = ReconcileReport::default();

        for parent_id in self.orphans.pending_parents()? {
            report.buckets_scanned += 1;
            report.adopted += self.adopt_locked(&parent_id)?;
        }

        for session in self.registry.list(None)? {
            report.records_scanned += 1;
            if session.link != Link::Orphaned {
                continue;
            }
            let Some(parent) = session.parent_session_id.as_deref() else {
                continue;
            };
            if self.registry.exists(parent)? {
                if self.registry.mark_attached(&session.id)? {
                    report.adopted += 1;
                }
            } else {
                self.orphans
                    .register(parent, OrphanEntry::session(&session.id))?;
                report.still_waiting += 1;
            }
        }

        for session_id in self.events.logged_sessions()? {
            for event in self.events.list(&session_id)? {
                report.records_scanned += 1;
                if event.link != Link::Orphaned {
                    continue;
                }
                let Some(parent) = event.parent_event_id.as_deref() else {
                    continue;
                };
                match self.resolve_parent(parent)? {
                    Some(referent) => {
                        let entry = OrphanEntry::event(&event.id, &session_id);
                        if self.adopt_entry(&entry, &referent)? {
                            report.adopted += 1;
                        }
                        self.orphans.remove(parent, &[entry])?;
                    }
                    None => {
                        self.orphans
                            .register(parent, OrphanEntry::event(&event.id, &session_id))?;
                        report.still_waiting += 1;
                    }
                }
            }
        }

        tracing::info!(
            buckets = report.buckets_scanned,
            records = report.records_scanned,
            adopted = report.adopted,
            waiting = report.still_waiting,
            "Reconciliation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn index(root: &std::path::Path) -> OrphanIndex {
        let storage = StorageConfig::with_root(root);
        storage.ensure_dirs().unwrap();
        OrphanIndex::new(storage, StoreConfig::default())
    }

    #[test]
    fn test_register_dedupes() {
        let temp = tempdir().unwrap();
        let index = index(temp.path());
        let _guard = index.lock().unwrap();

        index.register("task-42", OrphanEntry::event("E1", "s2")).unwrap();
        index.register("task-42", OrphanEntry::event("E1", "s2")).unwrap();
        index.register("task-42", OrphanEntry::event("E2", "s2")).unwrap();

        let waiting = index.waiting_on("task-42").unwrap();
        assert_eq!(waiting.len(), 2);
        assert_eq!(index.pending_parents().unwrap(), vec!["task-42"]);
    }

    #[test]
    fn test_remove_deletes_empty_bucket() {
        let temp = tempdir().unwrap();
        let index = index(temp.path());
        let _guard = index.lock().unwrap();

        let entry = OrphanEntry::session("child");
        index.register("parent", entry.clone()).unwrap();
        index.remove("parent", &[entry.clone()]).unwrap();
        assert!(index.waiting_on("parent").unwrap().is_empty());
        assert!(index.pending_parents().unwrap().is_empty());

        // Removing again is fine.
        index.remove("parent", &[entry]).unwrap();
    }

    #[test]
    fn test_session_entry_owns_itself() {
        let entry = OrphanEntry::session("d1");
        assert_eq!(entry.session_id, "d1");
        assert_eq!(entry.kind, ReferentKind::Session);
    }
}
