//! TraceStore - the entry point for recording sessions and events.
//!
//! The store ties the registry, the event logs and the orphan index
//! together. It is:
//! - **Synchronous**: every call is plain filesystem I/O
//! - **Process-safe**: coordination happens through the lock directories, so
//!   any number of processes may open the same root
//! - **Stateless**: nothing is cached between calls
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use trace_core::{NewEvent, SessionKey, TraceStore};
//!
//! let store = TraceStore::open_default()?;
//! let (session, _) = store.resolve_or_create_session(&SessionKey::delegate("S1", "gemini"))?;
//! let event = store.append_event(NewEvent::new(&session.id, "read").with_parent("task-42"))?;
//! ```

use std::collections::HashSet;

use crate::config::{load_store_config, StoreConfig};
use crate::error::{Result, TraceError};
use crate::events::{Claim, EventStore};
use crate::ids::{new_event_id, truncate_summary, validate_id};
use crate::orphans::{OrphanEntry, OrphanIndex, ReconcileReport, Reconciler, Referent};
use crate::registry::{SessionKey, SessionRegistry};
use crate::storage::StorageConfig;
use crate::tree::{build_forest, SessionNode};
use crate::types::{Event, EventStatus, Link, NewEvent, Session, SessionStatus};

/// Bound on event parent-chain walks during cycle checks.
const MAX_EVENT_CHAIN: usize = 256;

pub struct TraceStore {
    storage: StorageConfig,
    config: StoreConfig,
    registry: SessionRegistry,
    events: EventStore,
    orphans: OrphanIndex,
}

impl TraceStore {
    /// Opens the store at `storage`, creating its directories and loading
    /// `config.json` if present.
    pub fn open(storage: StorageConfig) -> Result<Self> {
        storage.ensure_dirs()?;
        let config = load_store_config(&storage);
        Ok(Self::with_config(storage, config))
    }

    /// Opens the store with an explicit config. Directories must exist.
    pub fn with_config(storage: StorageConfig, config: StoreConfig) -> Self {
        Self {
            registry: SessionRegistry::new(storage.clone(), config.clone()),
            events: EventStore::new(storage.clone(), config.clone()),
            orphans: OrphanIndex::new(storage.clone(), config.clone()),
            storage,
            config,
        }
    }

    /// Opens the store named by the environment (`TRACE_STORE_DIR`,
    /// `TRACE_PROJECT_DIR`), defaulting to `~/.agent-trace`.
    pub fn open_default() -> Result<Self> {
        Self::open(StorageConfig::from_env()?)
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.registry, &self.events, &self.orphans)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────

    /// Returns the session for `key`, creating it if needed. The flag is
    /// `true` when this call created the record.
    ///
    /// A delegate whose parent session is not recorded yet is created as an
    /// orphan and attached once the parent shows up.
    pub fn resolve_or_create_session(&self, key: &SessionKey) -> Result<(Session, bool)> {
        let id = key.session_id();
        validate_id(&id)?;
        if let Some(existing) = self.registry.get(&id)? {
            return self.registry.resolve_or_create(key, existing.link);
        }

        let (session, created) = match key.parent_session_id() {
            None => self.registry.resolve_or_create(key, Link::Root)?,
            Some(parent) => self.create_child_session(key, parent)?,
        };

        if created {
            self.reconciler().adopt(&session.id)?;
        }
        Ok((session, created))
    }

    fn create_child_session(&self, key: &SessionKey, parent: &str) -> Result<(Session, bool)> {
        validate_id(parent)?;
        if self.registry.exists(parent)? {
            return self.registry.resolve_or_create(key, Link::Attached);
        }

        let guard = match self.orphans.lock() {
            Ok(guard) => Some(guard),
            Err(err) if err.is_lock_timeout() => {
                tracing::warn!(
                    session = %key.session_id(),
                    parent = %parent,
                    error = %err,
                    "Orphan index busy, leaving session for the next sweep"
                );
                None
            }
            Err(err) => return Err(err),
        };

        // Register before re-checking, as for events.
        let entry = OrphanEntry::session(key.session_id());
        if guard.is_some() {
            self.orphans.register(parent, entry.clone())?;
        }

        let link = if self.registry.exists(parent)? {
            Link::Attached
        } else {
            Link::Orphaned
        };
        let (session, created) = self.registry.resolve_or_create(key, link)?;

        if guard.is_some() && session.link != Link::Orphaned {
            self.orphans.remove(parent, &[entry])?;
        }
        Ok((session, created))
    }

    pub fn complete_session(&self, id: &str, status: SessionStatus) -> Result<Session> {
        self.registry.complete(id, status)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.registry.get(id)
    }

    /// All sessions, or the direct children of `parent_session_id`.
    pub fn list_sessions(&self, parent_session_id: Option<&str>) -> Result<Vec<Session>> {
        self.registry.list(parent_session_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    /// Records one event. Never rejects an event because its parent is
    /// missing: it is stored as an orphan and attached later.
    ///
    /// Appending an id that already exists returns the stored event.
    pub fn append_event(&self, new: NewEvent) -> Result<Event> {
        validate_id(&new.session_id)?;
        let id = match new.id {
            Some(id) => {
                validate_id(&id)?;
                if let Some(existing) = self.events.get(&id)? {
                    return Ok(existing);
                }
                id
            }
            None => new_event_id(),
        };
        if let Some(parent) = new.parent_event_id.as_deref() {
            validate_id(parent)?;
            self.check_event_chain(&id, parent)?;
        }

        if let Claim::Taken { owner } = self.events.claim(&id, &new.session_id)? {
            if owner != new.session_id {
                return match self.events.find_in_log(&owner, &id)? {
                    Some(existing) => Ok(existing),
                    None => Err(TraceError::IdConflict { id, owner }),
                };
            }
        }

        if !self.registry.exists(&new.session_id)? {
            tracing::debug!(
                session = %new.session_id,
                event = %id,
                "Recording event for unregistered session"
            );
        }

        let event = Event {
            id,
            session_id: new.session_id,
            parent_event_id: new.parent_event_id,
            link: Link::Root,
            parent_kind: None,
            parent_session_id: None,
            kind: new.kind,
            payload_summary: truncate_summary(&new.payload_summary, self.config.max_payload_bytes),
            status: EventStatus::Pending,
            seq: 0,
            created_at: chrono::Utc::now(),
            resolved_at: None,
            adopted_at: None,
        };

        let (event, inserted) = match event.parent_event_id.clone() {
            None => self.events.insert(event)?,
            Some(parent) => match self.reconciler().resolve_parent(&parent)? {
                Some(referent) => self.events.insert(attached(event, referent))?,
                None => self.insert_orphan(event, &parent)?,
            },
        };

        if inserted {
            self.reconciler().adopt(&event.id)?;
        }
        Ok(event)
    }

    fn insert_orphan(&self, event: Event, parent: &str) -> Result<(Event, bool)> {
        let guard = match self.orphans.lock() {
            Ok(guard) => Some(guard),
            Err(err) if err.is_lock_timeout() => {
                tracing::warn!(
                    event = %event.id,
                    parent = %parent,
                    error = %err,
                    "Orphan index busy, leaving event for the next sweep"
                );
                None
            }
            Err(err) => return Err(err),
        };

        // Register before re-checking: a parent created after the check
        // below is guaranteed to see this entry when it drains.
        let entry = OrphanEntry::event(&event.id, &event.session_id);
        if guard.is_some() {
            self.orphans.register(parent, entry.clone())?;
        }

        if let Some(referent) = self.reconciler().resolve_parent(parent)? {
            if guard.is_some() {
                self.orphans.remove(parent, &[entry])?;
            }
            return self.events.insert(attached(event, referent));
        }

        let mut orphan = event;
        orphan.link = Link::Orphaned;
        self.events.insert(orphan)
    }

    /// Rejects `id → parent` if the chain above `parent` already reaches `id`.
    fn check_event_chain(&self, id: &str, parent: &str) -> Result<()> {
        let cycle = || TraceError::Cycle {
            id: id.to_string(),
            parent: parent.to_string(),
        };

        let mut cursor = Some(parent.to_string());
        let mut depth = 0;
        while let Some(current) = cursor {
            if current == id {
                return Err(cycle());
            }
            if depth >= MAX_EVENT_CHAIN {
                return Err(cycle());
            }
            cursor = self
                .events
                .get(&current)?
                .and_then(|event| event.parent_event_id);
            depth += 1;
        }
        Ok(())
    }

    pub fn resolve_event(&self, id: &str, status: EventStatus) -> Result<Event> {
        self.events.resolve(id, status)
    }

    pub fn get_event(&self, id: &str) -> Result<Option<Event>> {
        self.events.get(id)
    }

    /// Events of one session, oldest first.
    pub fn list_events(&self, session_id: &str) -> Result<Vec<Event>> {
        self.events.list(session_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Maintenance and views
    // ─────────────────────────────────────────────────────────────────────

    /// Adopts every orphan whose parent now exists. Safe to repeat.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler().sweep()
    }

    /// Parent/child forest of all sessions with their events. Event logs
    /// with no session record appear as unregistered roots.
    pub fn session_tree(&self) -> Result<Vec<SessionNode>> {
        let sessions = self.registry.list(None)?;
        let known: HashSet<String> = sessions.iter().map(|s| s.id.clone()).collect();
        let mut events = Vec::with_capacity(sessions.len());
        for session in &sessions {
            events.push(self.events.list(&session.id)?);
        }
        let mut forest = build_forest(sessions, events);

        for session_id in self.events.logged_sessions()? {
            if known.contains(&session_id) {
                continue;
            }
            let events = self.events.list(&session_id)?;
            if events.is_empty() {
                continue;
            }
            tracing::debug!(session = %session_id, "Events logged without a session record");
            forest.push(SessionNode::unregistered(session_id, events));
        }
        forest.sort_by_key(|node| node.session.created_at);
        Ok(forest)
    }
}

fn attached(mut event: Event, referent: Referent) -> Event {
    event.link = Link::Attached;
    event.parent_kind = Some(referent.kind);
    event.parent_session_id = Some(referent.session_id);
    event
}
