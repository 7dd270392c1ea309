//! Record types shared by the registry, the event store and the reconciler.
//!
//! Records reference each other by id only. The registry owns sessions, the
//! event store owns events; neither holds pointers into the other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// On-disk schema version for every record envelope.
pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Succeeded,
    Failed,
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventStatus::Pending)
    }
}

/// Whether a record's declared parent has been found.
///
/// ```text
/// root ─────────────── no parent declared
/// orphaned ─(adopt)──▶ attached
/// ```
///
/// The transition out of `orphaned` happens at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    Root,
    Orphaned,
    Attached,
}

/// What kind of record a parent reference resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentKind {
    Session,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub is_delegate: bool,
    #[serde(default)]
    pub owner_label: Option<String>,
    pub status: SessionStatus,
    pub link: Link,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub adopted_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_top_level(&self) -> bool {
        self.parent_session_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: String,
    /// Declared cause. May name an event or a session, and may not exist yet.
    #[serde(default)]
    pub parent_event_id: Option<String>,
    pub link: Link,
    /// Kind of record `parent_event_id` resolved to, once attached.
    #[serde(default)]
    pub parent_kind: Option<ReferentKind>,
    /// Session owning the resolved parent, once attached.
    #[serde(default)]
    pub parent_session_id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub payload_summary: String,
    pub status: EventStatus,
    /// Per-session insertion sequence; breaks same-timestamp ties.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub adopted_at: Option<DateTime<Utc>>,
}

/// Input to [`crate::TraceStore::append_event`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewEvent {
    pub session_id: String,
    /// Caller-chosen id; a ULID is generated when absent.
    pub id: Option<String>,
    pub parent_event_id: Option<String>,
    pub kind: String,
    pub payload_summary: String,
}

impl NewEvent {
    pub fn new(session_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent_event_id: impl Into<String>) -> Self {
        self.parent_event_id = Some(parent_event_id.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.payload_summary = summary.into();
        self
    }
}

/// `sessions/<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionFile {
    pub version: u32,
    pub session: Session,
}

/// `events/<session_id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EventLogFile {
    pub version: u32,
    pub next_seq: u64,
    pub events: Vec<Event>,
}

impl Default for EventLogFile {
    fn default() -> Self {
        Self {
            version: RECORD_VERSION,
            next_seq: 0,
            events: Vec::new(),
        }
    }
}

/// `events/index/<event_id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EventIndexEntry {
    pub version: u32,
    pub session_id: String,
}
