//! Durable registry of sessions.
//!
//! One file per session under `sessions/`. Structural changes (create,
//! complete, adopt) happen under the exclusive `sessions` lock; reads never
//! lock for single records because every write is atomic.
//!
//! # Resolution
//!
//! ```text
//! SessionKey::Explicit { id }            → id as given
//! SessionKey::Delegate { parent, label } → derive_delegate_session_id(parent, label)
//! ```
//!
//! Resolution is idempotent: if a record already exists under the resolved
//! id it is returned unchanged, which is what keeps repeated hook calls within
//! one logical session (and N processes spawned for one delegation) on a
//! single record.
//!
//! Creation is check-then-create under the lock, and the create itself is a
//! no-clobber rename, so a writer that loses the race re-reads and returns the
//! winner's record even when it proceeded without the lock.

use chrono::Utc;

use crate::atomic;
use crate::config::StoreConfig;
use crate::error::{Result, TraceError};
use crate::ids::{derive_delegate_session_id, validate_id};
use crate::lock::DirLocker;
use crate::records::{self, Record};
use crate::storage::StorageConfig;
use crate::types::{Link, Session, SessionFile, SessionStatus, RECORD_VERSION};

const LOCK_SCOPE: &str = "sessions";

/// Upper bound on parent-chain walks; deeper chains are treated as cyclic.
const MAX_CHAIN_DEPTH: usize = 1_024;

/// How a caller identifies the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKey {
    /// A concrete id from the context source (e.g. a hook's session id).
    Explicit {
        id: String,
        parent_session_id: Option<String>,
        owner_label: Option<String>,
    },
    /// A delegate whose id is derived from its parent and owner label.
    Delegate {
        parent_session_id: String,
        owner_label: String,
    },
}

impl SessionKey {
    pub fn explicit(id: impl Into<String>) -> Self {
        SessionKey::Explicit {
            id: id.into(),
            parent_session_id: None,
            owner_label: None,
        }
    }

    pub fn delegate(parent_session_id: impl Into<String>, owner_label: impl Into<String>) -> Self {
        SessionKey::Delegate {
            parent_session_id: parent_session_id.into(),
            owner_label: owner_label.into(),
        }
    }

    pub fn session_id(&self) -> String {
        match self {
            SessionKey::Explicit { id, .. } => id.clone(),
            SessionKey::Delegate {
                parent_session_id,
                owner_label,
            } => derive_delegate_session_id(parent_session_id, owner_label),
        }
    }

    pub fn parent_session_id(&self) -> Option<&str> {
        match self {
            SessionKey::Explicit {
                parent_session_id, ..
            } => parent_session_id.as_deref(),
            SessionKey::Delegate {
                parent_session_id, ..
            } => Some(parent_session_id),
        }
    }

    pub fn owner_label(&self) -> Option<&str> {
        match self {
            SessionKey::Explicit { owner_label, .. } => owner_label.as_deref(),
            SessionKey::Delegate { owner_label, .. } => Some(owner_label),
        }
    }
}

pub struct SessionRegistry {
    storage: StorageConfig,
    config: StoreConfig,
    locker: DirLocker,
}

impl SessionRegistry {
    pub fn new(storage: StorageConfig, config: StoreConfig) -> Self {
        let locker = DirLocker::new(&storage, LOCK_SCOPE, &config);
        Self {
            storage,
            config,
            locker,
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        validate_id(id)?;
        Ok(self.load(id)?.into_option())
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    /// Returns the record for `key`, creating it (status `active`) if absent.
    ///
    /// `link` is the caller's view of the parent: `Attached` if the parent
    /// session exists, `Orphaned` if it does not yet. It only matters when
    /// this call creates the record.
    pub fn resolve_or_create(&self, key: &SessionKey, link: Link) -> Result<(Session, bool)> {
        let id = key.session_id();
        validate_id(&id)?;
        if let Some(parent) = key.parent_session_id() {
            validate_id(parent)?;
        }

        // Fast path: no lock needed to find an existing record.
        if let Some(existing) = self.get(&id)? {
            self.warn_on_parent_conflict(&existing, key);
            return Ok((existing, false));
        }

        self.check_no_cycle(&id, key.parent_session_id())?;

        let _guard = self.locker.acquire_exclusive_with_policy(&self.config)?;

        let was_corrupt = match self.load(&id)? {
            Record::Present(existing) => {
                self.warn_on_parent_conflict(&existing, key);
                return Ok((existing, false));
            }
            Record::Corrupt => true,
            Record::Missing => false,
        };

        let session = Session {
            id: id.clone(),
            parent_session_id: key.parent_session_id().map(String::from),
            is_delegate: key.parent_session_id().is_some(),
            owner_label: key.owner_label().map(String::from),
            status: SessionStatus::Active,
            link: if key.parent_session_id().is_some() {
                link
            } else {
                Link::Root
            },
            created_at: Utc::now(),
            ended_at: None,
            adopted_at: None,
        };
        let file = SessionFile {
            version: RECORD_VERSION,
            session: session.clone(),
        };
        let path = self.storage.session_file(&id);

        if was_corrupt {
            records::quarantine(&path);
            atomic::write_json_atomic(&path, &file)?;
        } else if !atomic::create_json_if_absent(&path, &file)? {
            // Lost the create race (only possible without the lock).
            return match self.load(&id)? {
                Record::Present(existing) => Ok((existing, false)),
                _ => Err(TraceError::SessionNotFound(id)),
            };
        }

        tracing::debug!(
            session = %id,
            parent = ?session.parent_session_id,
            label = ?session.owner_label,
            link = ?session.link,
            "Created session"
        );
        Ok((session, true))
    }

    /// Moves a session to `completed`/`failed` and stamps `ended_at`.
    ///
    /// Completing an already-ended session keeps the first outcome. A
    /// non-terminal `status` is rejected.
    pub fn complete(&self, id: &str, status: SessionStatus) -> Result<Session> {
        validate_id(id)?;
        if !status.is_terminal() {
            return Err(TraceError::NonTerminalStatus {
                id: id.to_string(),
                status: format!("{:?}", status),
            });
        }
        let _guard = self.locker.acquire_exclusive_with_policy(&self.config)?;

        let Some(mut session) = self.load(id)?.into_option() else {
            tracing::warn!(session = %id, "Cannot complete unknown session");
            return Err(TraceError::SessionNotFound(id.to_string()));
        };

        if session.status.is_terminal() {
            tracing::debug!(
                session = %id,
                status = ?session.status,
                "Session already ended"
            );
            return Ok(session);
        }

        session.status = status;
        session.ended_at = Some(Utc::now());
        self.save(&session)?;
        Ok(session)
    }

    /// Marks an orphaned session as attached to its (now existing) parent.
    /// Returns `false` if there was nothing to do.
    pub(crate) fn mark_attached(&self, id: &str) -> Result<bool> {
        let _guard = self.locker.acquire_exclusive_with_policy(&self.config)?;

        let Some(mut session) = self.load(id)?.into_option() else {
            return Ok(false);
        };
        if session.link != Link::Orphaned {
            return Ok(false);
        }

        session.link = Link::Attached;
        session.adopted_at = Some(Utc::now());
        self.save(&session)?;
        Ok(true)
    }

    /// All sessions, or the direct children of `parent_session_id`, oldest
    /// first.
    pub fn list(&self, parent_session_id: Option<&str>) -> Result<Vec<Session>> {
        let _guard = match self.locker.acquire_shared(self.config.lock_timeout()) {
            Ok(guard) => Some(guard),
            Err(err) => {
                tracing::warn!(error = %err, "Listing sessions without lock");
                None
            }
        };

        let mut sessions: Vec<Session> = self
            .session_ids()?
            .into_iter()
            .filter_map(|id| match self.load(&id) {
                Ok(record) => record.into_option(),
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "Skipping unreadable session");
                    None
                }
            })
            .filter(|s| match parent_session_id {
                Some(parent) => s.parent_session_id.as_deref() == Some(parent),
                None => true,
            })
            .collect();

        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// The most recently created active top-level session.
    ///
    /// HAZARD: this is shared state across every window using the store. Two
    /// concurrent top-level sessions make the answer depend on timing, and a
    /// delegate resolved this way can land in the wrong window. Only
    /// [`crate::ContextSource`] calls it, and only when explicitly enabled.
    pub fn most_recent_active(&self) -> Result<Option<Session>> {
        Ok(self
            .list(None)?
            .into_iter()
            .filter(|s| s.is_top_level() && s.status == SessionStatus::Active)
            .max_by(|a, b| a.created_at.cmp(&b.created_at)))
    }

    /// Ids of every session file on disk.
    pub fn session_ids(&self) -> Result<Vec<String>> {
        let dir = self.storage.sessions_dir();
        let entries = match fs_err::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TraceError::io("listing sessions", e)),
        };

        Ok(entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                if name.starts_with('.') {
                    return None;
                }
                name.strip_suffix(".json").map(String::from)
            })
            .collect())
    }

    fn load(&self, id: &str) -> Result<Record<Session>> {
        let path = self.storage.session_file(id);
        Ok(match records::load_record::<SessionFile>(&path, &self.config)? {
            Record::Present(file) if file.version == RECORD_VERSION && file.session.id == id => {
                Record::Present(file.session)
            }
            Record::Present(file) => {
                tracing::warn!(
                    session = %id,
                    version = file.version,
                    "Unsupported or mismatched session record, treating as absent"
                );
                Record::Corrupt
            }
            Record::Missing => Record::Missing,
            Record::Corrupt => Record::Corrupt,
        })
    }

    fn save(&self, session: &Session) -> Result<()> {
        let file = SessionFile {
            version: RECORD_VERSION,
            session: session.clone(),
        };
        atomic::write_json_atomic(&self.storage.session_file(&session.id), &file)
    }

    /// Rejects a parent link that would close a loop. The walk follows
    /// declared parents, including ones that do not exist yet.
    fn check_no_cycle(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let Some(parent) = parent else {
            return Ok(());
        };

        let mut cursor = Some(parent.to_string());
        let mut depth = 0;
        while let Some(current) = cursor {
            if current == id || depth >= MAX_CHAIN_DEPTH {
                return Err(TraceError::Cycle {
                    id: id.to_string(),
                    parent: parent.to_string(),
                });
            }
            cursor = self
                .load(&current)?
                .into_option()
                .and_then(|s| s.parent_session_id);
            depth += 1;
        }
        Ok(())
    }

    /// A second, different parent never replaces the first.
    fn warn_on_parent_conflict(&self, existing: &Session, key: &SessionKey) {
        if let Some(requested) = key.parent_session_id() {
            if existing.parent_session_id.as_deref() != Some(requested) {
                tracing::warn!(
                    session = %existing.id,
                    existing_parent = ?existing.parent_session_id,
                    requested_parent = %requested,
                    "Ignoring conflicting parent for existing session"
                );
            }
        }
    }
}
