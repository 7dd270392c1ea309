//! Subcommand bodies.
//!
//! Each returns the text to print on stdout. `main` decides what to do with
//! failures (log and exit 0).

use clap::ValueEnum;
use trace_core::{
    child_env, ContextSource, EventStatus, NewEvent, SessionStatus, TraceError, TraceStore,
};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Store(#[from] TraceError),

    #[error("Failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HookError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SessionOutcome {
    Completed,
    Failed,
}

impl From<SessionOutcome> for SessionStatus {
    fn from(outcome: SessionOutcome) -> Self {
        match outcome {
            SessionOutcome::Completed => SessionStatus::Completed,
            SessionOutcome::Failed => SessionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventOutcome {
    Succeeded,
    Failed,
}

impl From<EventOutcome> for EventStatus {
    fn from(outcome: EventOutcome) -> Self {
        match outcome {
            EventOutcome::Succeeded => EventStatus::Succeeded,
            EventOutcome::Failed => EventStatus::Failed,
        }
    }
}

/// Arguments of `event-start`.
#[derive(Debug, Clone, Default)]
pub struct EventStart {
    pub kind: String,
    pub id: Option<String>,
    pub summary: Option<String>,
    /// Overrides `TRACE_PARENT_EVENT_ID`.
    pub parent: Option<String>,
}

/// Resolves (creating if needed) the session for this process. Prints its id.
pub fn session_start(store: &TraceStore, ctx: &ContextSource) -> Result<String> {
    let key = ctx.session_key(store.registry(), store.config())?;
    let (session, created) = store.resolve_or_create_session(&key)?;
    tracing::info!(
        session = %session.id,
        parent = ?session.parent_session_id,
        created,
        "Session start"
    );
    Ok(session.id)
}

pub fn session_end(
    store: &TraceStore,
    ctx: &ContextSource,
    outcome: SessionOutcome,
) -> Result<String> {
    let key = ctx.session_key(store.registry(), store.config())?;
    let session = store.complete_session(&key.session_id(), outcome.into())?;
    tracing::info!(session = %session.id, status = ?session.status, "Session end");
    Ok(session.id)
}

/// Records an event in this process's session. Prints the event id.
pub fn event_start(store: &TraceStore, ctx: &ContextSource, args: EventStart) -> Result<String> {
    let key = ctx.session_key(store.registry(), store.config())?;
    let (session, _) = store.resolve_or_create_session(&key)?;

    let mut new = NewEvent::new(&session.id, args.kind);
    if let Some(id) = args.id {
        new = new.with_id(id);
    }
    if let Some(parent) = args.parent.or_else(|| ctx.parent_event_id.clone()) {
        new = new.with_parent(parent);
    }
    if let Some(summary) = args.summary {
        new = new.with_summary(summary);
    }

    let event = store.append_event(new)?;
    tracing::debug!(
        session = %session.id,
        event = %event.id,
        link = ?event.link,
        "Event start"
    );
    Ok(event.id)
}

pub fn event_end(store: &TraceStore, id: &str, outcome: EventOutcome) -> Result<String> {
    let event = store.resolve_event(id, outcome.into())?;
    Ok(event.id)
}

/// Prints the reconciliation report as JSON.
pub fn reconcile(store: &TraceStore) -> Result<String> {
    let report = store.reconcile()?;
    Ok(serde_json::to_string(&report)?)
}

/// Prints the session forest as JSON.
pub fn tree(store: &TraceStore) -> Result<String> {
    let forest = store.session_tree()?;
    Ok(serde_json::to_string_pretty(&forest)?)
}

/// Prints `KEY=VALUE` lines a spawner exports into a delegate's environment.
pub fn child_env_lines(
    store: &TraceStore,
    ctx: &ContextSource,
    owner_label: &str,
    parent_event: Option<&str>,
) -> Result<String> {
    let key = ctx.session_key(store.registry(), store.config())?;
    let (session, _) = store.resolve_or_create_session(&key)?;

    let mut lines: Vec<String> = child_env(&session.id, owner_label, parent_event)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    lines.sort();
    Ok(lines.join("\n"))
}
