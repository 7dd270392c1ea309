//! Session forest for dashboards.
//!
//! Built from flat records with an id → index map; nodes own their children
//! and nothing points back up. Sessions whose parent is not recorded are
//! listed as roots so they stay visible, as are event logs with no session
//! record at all.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

use crate::types::{Event, Link, Session, SessionStatus};

#[derive(Debug, Clone, Serialize)]
pub struct SessionNode {
    pub session: Session,
    /// `false` for a placeholder standing in for a missing session record.
    pub registered: bool,
    pub events: Vec<Event>,
    pub children: Vec<SessionNode>,
}

impl SessionNode {
    /// Root for events logged under `session_id` with no session record.
    pub fn unregistered(session_id: impl Into<String>, events: Vec<Event>) -> Self {
        let created_at = events
            .iter()
            .map(|e| e.created_at)
            .min()
            .unwrap_or_else(Utc::now);
        Self {
            session: Session {
                id: session_id.into(),
                parent_session_id: None,
                is_delegate: false,
                owner_label: None,
                status: SessionStatus::Active,
                link: Link::Root,
                created_at,
                ended_at: None,
                adopted_at: None,
            },
            registered: false,
            events,
            children: Vec::new(),
        }
    }

    /// Sessions in this subtree, including this one.
    pub fn session_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(SessionNode::session_count)
            .sum::<usize>()
    }
}

/// Builds the forest. `events[i]` belongs to `sessions[i]`; both are expected
/// in creation order, which the output preserves.
pub fn build_forest(sessions: Vec<Session>, events: Vec<Vec<Event>>) -> Vec<SessionNode> {
    let index: HashMap<String, usize> = sessions
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); sessions.len()];
    let mut roots = Vec::new();
    for (i, session) in sessions.iter().enumerate() {
        match session
            .parent_session_id
            .as_ref()
            .and_then(|p| index.get(p))
        {
            Some(&parent) if parent != i => children[parent].push(i),
            _ => roots.push(i),
        }
    }

    let mut slots: Vec<Option<(Session, Vec<Event>)>> = sessions
        .into_iter()
        .zip(events.into_iter().chain(std::iter::repeat_with(Vec::new)))
        .map(Some)
        .collect();

    roots
        .into_iter()
        .filter_map(|root| take_node(root, &children, &mut slots))
        .collect()
}

/// Each slot is taken once, so a malformed parent loop cannot recurse
/// forever; its members are simply left out.
fn take_node(
    i: usize,
    children: &[Vec<usize>],
    slots: &mut [Option<(Session, Vec<Event>)>],
) -> Option<SessionNode> {
    let (session, events) = slots[i].take()?;
    let children = children[i]
        .iter()
        .filter_map(|&child| take_node(child, children, slots))
        .collect();
    Some(SessionNode {
        session,
        registered: true,
        events,
        children,
    })
}
