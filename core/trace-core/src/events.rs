//! Per-session append logs.
//!
//! Each session's events live in one file, `events/<session_id>.json`, which
//! is rewritten atomically under the `events-<session_id>` lock. Event ids
//! are claimed store-wide through `events/index/<event_id>.json`, created
//! no-clobber, so a point lookup never has to scan every log.
//!
//! Writes to a log always require the lock: an unlocked read-modify-write
//! could drop a concurrent append, and losing events is worse than waiting.
//!
//! Ordering within a session is `(created_at, seq)`, where `seq` is assigned
//! under the lock from the log's `next_seq` counter.

use chrono::Utc;

use crate::atomic;
use crate::config::StoreConfig;
use crate::error::{Result, TraceError};
use crate::ids::validate_id;
use crate::lock::{DirLocker, LockGuard};
use crate::records::{self, Record};
use crate::storage::StorageConfig;
use crate::types::{
    Event, EventIndexEntry, EventLogFile, EventStatus, Link, ReferentKind, RECORD_VERSION,
};

/// Outcome of claiming an event id in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Claim {
    /// This caller now owns the id.
    Fresh,
    /// The id was already claimed, by this session or another.
    Taken { owner: String },
}

pub struct EventStore {
    storage: StorageConfig,
    config: StoreConfig,
}

impl EventStore {
    pub fn new(storage: StorageConfig, config: StoreConfig) -> Self {
        Self { storage, config }
    }

    fn lock_session(&self, session_id: &str) -> Result<LockGuard> {
        let scope = format!("events-{}", session_id);
        DirLocker::new(&self.storage, &scope, &self.config)
            .acquire_exclusive(self.config.lock_timeout())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    /// Session that claimed `event_id`, if any.
    pub fn owner_of(&self, event_id: &str) -> Result<Option<String>> {
        validate_id(event_id)?;
        let path = self.storage.event_index_file(event_id);
        Ok(records::load_json::<EventIndexEntry>(&path, &self.config)?
            .filter(|entry| entry.version == RECORD_VERSION)
            .map(|entry| entry.session_id))
    }

    pub fn get(&self, event_id: &str) -> Result<Option<Event>> {
        let Some(owner) = self.owner_of(event_id)? else {
            return Ok(None);
        };
        self.find_in_log(&owner, event_id)
    }

    pub(crate) fn find_in_log(&self, session_id: &str, event_id: &str) -> Result<Option<Event>> {
        Ok(self
            .load_log(session_id)?
            .into_option()
            .and_then(|log| log.events.into_iter().find(|e| e.id == event_id)))
    }

    /// Events of one session in creation order.
    pub fn list(&self, session_id: &str) -> Result<Vec<Event>> {
        validate_id(session_id)?;
        let mut events = self
            .load_log(session_id)?
            .into_option()
            .map(|log| log.events)
            .unwrap_or_default();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        Ok(events)
    }

    /// Ids of every session that has an event log.
    pub fn logged_sessions(&self) -> Result<Vec<String>> {
        let dir = self.storage.events_dir();
        let entries = match fs_err::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TraceError::io("listing event logs", e)),
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
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

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    /// Claims `event_id` for `session_id` store-wide.
    pub(crate) fn claim(&self, event_id: &str, session_id: &str) -> Result<Claim> {
        let entry = EventIndexEntry {
            version: RECORD_VERSION,
            session_id: session_id.to_string(),
        };
        let path = self.storage.event_index_file(event_id);
        if atomic::create_json_if_absent(&path, &entry)? {
            return Ok(Claim::Fresh);
        }

        match self.owner_of(event_id)? {
            Some(owner) => Ok(Claim::Taken { owner }),
            None => {
                // Unreadable index entry: take it over.
                records::quarantine(&path);
                atomic::write_json_atomic(&path, &entry)?;
                Ok(Claim::Fresh)
            }
        }
    }

    /// Appends `event` to its session's log, assigning `seq`.
    ///
    /// If an event with the same id is already in the log it is returned
    /// unchanged and nothing is written.
    pub(crate) fn insert(&self, mut event: Event) -> Result<(Event, bool)> {
        let _guard = self.lock_session(&event.session_id)?;

        let mut log = self.load_log_for_write(&event.session_id)?;
        if let Some(existing) = log.events.iter().find(|e| e.id == event.id) {
            return Ok((existing.clone(), false));
        }

        event.seq = log.next_seq;
        log.next_seq += 1;
        log.events.push(event.clone());
        self.save_log(&event.session_id, &log)?;

        tracing::debug!(
            session = %event.session_id,
            event = %event.id,
            seq = event.seq,
            link = ?event.link,
            "Appended event"
        );
        Ok((event, true))
    }

    /// Moves a pending event to a terminal status. Already-resolved events
    /// are returned unchanged. A non-terminal `status` is rejected.
    pub fn resolve(&self, event_id: &str, status: EventStatus) -> Result<Event> {
        if !status.is_terminal() {
            return Err(TraceError::NonTerminalStatus {
                id: event_id.to_string(),
                status: format!("{:?}", status),
            });
        }
        let Some(owner) = self.owner_of(event_id)? else {
            return Err(TraceError::EventNotFound(event_id.to_string()));
        };

        let updated = self.update(&owner, event_id, |event| {
            if event.status.is_terminal() {
                return false;
            }
            event.status = status;
            event.resolved_at = Some(Utc::now());
            true
        })?;

        updated
            .map(|(event, _)| event)
            .ok_or_else(|| TraceError::EventNotFound(event_id.to_string()))
    }

    /// Attaches an orphaned event to its now-existing parent. Returns `false`
    /// if the event is missing or no longer orphaned.
    pub(crate) fn attach_parent(
        &self,
        session_id: &str,
        event_id: &str,
        kind: ReferentKind,
        parent_session_id: &str,
    ) -> Result<bool> {
        let updated = self.update(session_id, event_id, |event| {
            if event.link != Link::Orphaned {
                return false;
            }
            event.link = Link::Attached;
            event.parent_kind = Some(kind);
            event.parent_session_id = Some(parent_session_id.to_string());
            event.adopted_at = Some(Utc::now());
            true
        })?;

        Ok(matches!(updated, Some((_, true))))
    }

    /// Applies `change` to one event under the session lock, writing only
    /// when `change` reports a modification.
    fn update<F>(&self, session_id: &str, event_id: &str, change: F) -> Result<Option<(Event, bool)>>
    where
        F: FnOnce(&mut Event) -> bool,
    {
        let _guard = self.lock_session(session_id)?;

        let Some(mut log) = self.load_log(session_id)?.into_option() else {
            return Ok(None);
        };
        let Some(event) = log.events.iter_mut().find(|e| e.id == event_id) else {
            return Ok(None);
        };

        let changed = change(event);
        let snapshot = event.clone();
        if changed {
            self.save_log(session_id, &log)?;
        }
        Ok(Some((snapshot, changed)))
    }

    fn load_log(&self, session_id: &str) -> Result<Record<EventLogFile>> {
        let path = self.storage.event_log_file(session_id);
        Ok(match records::load_record::<EventLogFile>(&path, &self.config)? {
            Record::Present(log) if log.version == RECORD_VERSION => Record::Present(log),
            Record::Present(log) => {
                tracing::warn!(
                    session = %session_id,
                    version = log.version,
                    "Unsupported event log version, treating as absent"
                );
                Record::Corrupt
            }
            other => other,
        })
    }

    /// Loads the log for a read-modify-write. A corrupt log is moved aside
    /// and replaced by an empty one.
    fn load_log_for_write(&self, session_id: &str) -> Result<EventLogFile> {
        Ok(match self.load_log(session_id)? {
            Record::Present(log) => log,
            Record::Missing => EventLogFile::default(),
            Record::Corrupt => {
                records::quarantine(&self.storage.event_log_file(session_id));
                EventLogFile::default()
            }
        })
    }

    fn save_log(&self, session_id: &str, log: &EventLogFile) -> Result<()> {
        atomic::write_json_atomic(&self.storage.event_log_file(session_id), log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(root: &std::path::Path) -> EventStore {
        let storage = StorageConfig::with_root(root);
        storage.ensure_dirs().unwrap();
        EventStore::new(storage, StoreConfig::default())
    }

    fn event(session_id: &str, id: &str) -> Event {
        Event {
            id: id.to_string(),
            session_id: session_id.to_string(),
            parent_event_id: None,
            link: Link::Root,
            parent_kind: None,
            parent_session_id: None,
            kind: "tool".to_string(),
            payload_summary: String::new(),
            status: EventStatus::Pending,
            seq: 0,
            created_at: Utc::now(),
            resolved_at: None,
            adopted_at: None,
        }
    }

    #[test]
    fn test_insert_assigns_sequence() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());

        let (a, _) = store.insert(event("s1", "e1")).unwrap();
        let (b, _) = store.insert(event("s1", "e2")).unwrap();
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);

        let ids: Vec<String> = store.list("s1").unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn test_same_timestamp_orders_by_sequence() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());
        let now = Utc::now();

        for id in ["first", "second", "third"] {
            let mut e = event("s1", id);
            e.created_at = now;
            store.insert(e).unwrap();
        }

        let ids: Vec<String> = store.list("s1").unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());

        store.insert(event("s1", "e1")).unwrap();
        let mut again = event("s1", "e1");
        again.kind = "different".to_string();
        let (existing, inserted) = store.insert(again).unwrap();
        assert!(!inserted);
        assert_eq!(existing.kind, "tool");
        assert_eq!(store.list("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_claim_is_first_wins() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());

        assert_eq!(store.claim("task-42", "s1").unwrap(), Claim::Fresh);
        assert_eq!(
            store.claim("task-42", "s2").unwrap(),
            Claim::Taken {
                owner: "s1".to_string()
            }
        );
        assert_eq!(store.owner_of("task-42").unwrap().as_deref(), Some("s1"));
    }

    #[test]
    fn test_get_follows_index() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());

        store.claim("e1", "s1").unwrap();
        store.insert(event("s1", "e1")).unwrap();
        assert_eq!(store.get("e1").unwrap().unwrap().session_id, "s1");
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_resolve_is_first_outcome_wins() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());
        store.claim("e1", "s1").unwrap();
        store.insert(event("s1", "e1")).unwrap();

        let done = store.resolve("e1", EventStatus::Failed).unwrap();
        assert_eq!(done.status, EventStatus::Failed);
        assert!(done.resolved_at.is_some());

        let again = store.resolve("e1", EventStatus::Succeeded).unwrap();
        assert_eq!(again.status, EventStatus::Failed);

        assert!(matches!(
            store.resolve("e1", EventStatus::Pending),
            Err(TraceError::NonTerminalStatus { .. })
        ));

        assert!(matches!(
            store.resolve("nope", EventStatus::Succeeded),
            Err(TraceError::EventNotFound(_))
        ));
    }

    #[test]
    fn test_attach_parent_only_from_orphaned() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());

        let mut orphan = event("s2", "child");
        orphan.parent_event_id = Some("task-42".to_string());
        orphan.link = Link::Orphaned;
        store.insert(orphan).unwrap();

        assert!(store
            .attach_parent("s2", "child", ReferentKind::Event, "s1")
            .unwrap());
        assert!(!store
            .attach_parent("s2", "child", ReferentKind::Event, "s1")
            .unwrap());

        let stored = store.find_in_log("s2", "child").unwrap().unwrap();
        assert_eq!(stored.link, Link::Attached);
        assert_eq!(stored.parent_session_id.as_deref(), Some("s1"));
        assert_eq!(stored.parent_kind, Some(ReferentKind::Event));
    }

    #[test]
    fn test_corrupt_log_is_replaced_on_write() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());
        let path = store.storage.event_log_file("s1");
        std::fs::write(&path, "{\"version\": 1, \"events\": [").unwrap();

        assert!(store.list("s1").unwrap().is_empty());
        store.insert(event("s1", "e1")).unwrap();
        assert_eq!(store.list("s1").unwrap().len(), 1);
        atomic::validate_write(&path).unwrap();
    }

    #[test]
    fn test_logged_sessions() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());
        store.insert(event("b", "e1")).unwrap();
        store.insert(event("a", "e2")).unwrap();
        store.claim("e1", "b").unwrap();

        assert_eq!(store.logged_sessions().unwrap(), vec!["a", "b"]);
    }
}
