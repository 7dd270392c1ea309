//! End-to-end attribution scenarios: delegation, late parents, reconciliation.

use trace_core::{
    child_env, ContextSource, EventStatus, Link, NewEvent, ReferentKind, SessionKey,
    SessionStatus, StorageConfig, TraceStore,
};
use std::collections::HashMap;

use tempfile::tempdir;

fn open(root: &std::path::Path) -> TraceStore {
    TraceStore::open(StorageConfig::with_root(root)).unwrap()
}

/// Context a delegate process would see: the spawner's own environment with
/// `child_env` layered on top.
fn delegate_context(parent: &str, label: &str, parent_event: Option<&str>) -> ContextSource {
    let mut env = HashMap::new();
    env.insert("TRACE_SESSION_ID".to_string(), parent.to_string());
    env.insert("TRACE_PARENT_EVENT_ID".to_string(), "spawner-event".to_string());
    env.extend(child_env(parent, label, parent_event));
    ContextSource::from_lookup(move |name| env.get(name).cloned())
}

#[test]
fn test_delegate_never_records_into_its_spawner() {
    let temp = tempdir().unwrap();
    let store = open(temp.path());

    // The spawner has not recorded S1 yet.
    let ctx = delegate_context("S1", "gemini", None);
    assert!(ctx.parent_event_id.is_none());
    let key = ctx.session_key(store.registry(), store.config()).unwrap();
    let (delegate, _) = store.resolve_or_create_session(&key).unwrap();
    assert_ne!(delegate.id, "S1");
    assert_eq!(delegate.parent_session_id.as_deref(), Some("S1"));
    assert_eq!(delegate.link, Link::Orphaned);

    store
        .append_event(NewEvent::new(&delegate.id, "read").with_id("E1"))
        .unwrap();

    let (s1, _) = store
        .resolve_or_create_session(&SessionKey::explicit("S1"))
        .unwrap();
    assert!(store.list_events(&s1.id).unwrap().is_empty());
    assert_eq!(store.list_events(&delegate.id).unwrap().len(), 1);
    assert_eq!(
        store.get_session(&delegate.id).unwrap().unwrap().link,
        Link::Attached
    );
}

#[test]
fn test_delegate_events_race_the_delegation_request() {
    let temp = tempdir().unwrap();
    let store = open(temp.path());

    let (s1, _) = store
        .resolve_or_create_session(&SessionKey::explicit("S1"))
        .unwrap();

    // The delegate starts and records its first action before task-42 lands.
    let ctx = delegate_context(&s1.id, "gemini", Some("task-42"));
    let key = ctx.session_key(store.registry(), store.config()).unwrap();
    let (delegate, created) = store.resolve_or_create_session(&key).unwrap();
    assert!(created);
    assert_eq!(delegate.link, Link::Attached);
    assert!(delegate.is_delegate);

    let e1 = store
        .append_event(
            NewEvent::new(&delegate.id, "read")
                .with_id("E1")
                .with_parent(ctx.parent_event_id.clone().unwrap()),
        )
        .unwrap();
    assert_eq!(e1.link, Link::Orphaned);
    assert!(e1.parent_session_id.is_none());

    // Now the spawner's delegation request commits.
    store
        .append_event(NewEvent::new(&s1.id, "delegate").with_id("task-42"))
        .unwrap();

    let e1 = store.get_event("E1").unwrap().unwrap();
    assert_eq!(e1.link, Link::Attached);
    assert_eq!(e1.parent_event_id.as_deref(), Some("task-42"));
    assert_eq!(e1.parent_kind, Some(ReferentKind::Event));
    assert_eq!(e1.parent_session_id.as_deref(), Some("S1"));

    // The event stays in the delegate's log and nowhere else.
    assert_eq!(store.list_events(&delegate.id).unwrap().len(), 1);
    assert_eq!(store.list_events("S1").unwrap().len(), 1);
}

#[test]
fn test_repeated_resolution_converges_on_one_record() {
    let temp = tempdir().unwrap();
    let store = open(temp.path());
    store
        .resolve_or_create_session(&SessionKey::explicit("S1"))
        .unwrap();

    let ids: Vec<String> = (0..5)
        .map(|_| {
            let ctx = delegate_context("S1", "gemini", None);
            let key = ctx.session_key(store.registry(), store.config()).unwrap();
            store.resolve_or_create_session(&key).unwrap().0.id
        })
        .collect();

    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.list_sessions(Some("S1")).unwrap().len(), 1);
    assert_eq!(store.list_sessions(None).unwrap().len(), 2);
}

#[test]
fn test_two_windows_do_not_cross_contaminate() {
    let temp = tempdir().unwrap();
    let store = open(temp.path());

    // Window A starts first, window B second: B is "most recent".
    let (a, _) = store
        .resolve_or_create_session(&SessionKey::explicit("window-a"))
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let (b, _) = store
        .resolve_or_create_session(&SessionKey::explicit("window-b"))
        .unwrap();

    // A delegate spawned by window A while B is the most recent session.
    let ctx = delegate_context(&a.id, "codex", None);
    let key = ctx.session_key(store.registry(), store.config()).unwrap();
    let (delegate, _) = store.resolve_or_create_session(&key).unwrap();
    for i in 0..3 {
        store
            .append_event(NewEvent::new(&delegate.id, "edit").with_summary(format!("file-{i}")))
            .unwrap();
    }

    assert_eq!(delegate.parent_session_id.as_deref(), Some("window-a"));
    assert!(store.list_events(&b.id).unwrap().is_empty());
    assert!(store.list_sessions(Some(&b.id)).unwrap().is_empty());
    assert_eq!(store.list_events(&delegate.id).unwrap().len(), 3);
}

#[test]
fn test_deep_delegation_created_bottom_up() {
    let temp = tempdir().unwrap();
    let store = open(temp.path());

    let d1_id = trace_core::derive_delegate_session_id("S1", "planner");
    let (d2, _) = store
        .resolve_or_create_session(&SessionKey::delegate(&d1_id, "worker"))
        .unwrap();
    assert_eq!(d2.link, Link::Orphaned);

    let (d1, _) = store
        .resolve_or_create_session(&SessionKey::delegate("S1", "planner"))
        .unwrap();
    assert_eq!(d1.id, d1_id);
    assert_eq!(d1.link, Link::Orphaned);
    assert_eq!(
        store.get_session(&d2.id).unwrap().unwrap().link,
        Link::Attached
    );

    store
        .resolve_or_create_session(&SessionKey::explicit("S1"))
        .unwrap();
    assert_eq!(
        store.get_session(&d1.id).unwrap().unwrap().link,
        Link::Attached
    );

    let forest = store.session_tree().unwrap();
    assert_eq!(forest.len(), 1);
    assert_eq!(forest[0].session_count(), 3);
}

#[test]
fn test_reconcile_recovers_lost_bucket_and_is_idempotent() {
    let temp = tempdir().unwrap();
    let store = open(temp.path());

    store
        .append_event(NewEvent::new("s2", "read").with_id("E1").with_parent("task-42"))
        .unwrap();

    // Simulate a crash that lost the orphan index entry.
    std::fs::remove_file(store.storage().orphan_bucket_file("task-42")).unwrap();

    store
        .append_event(NewEvent::new("s1", "delegate").with_id("task-42"))
        .unwrap();
    assert_eq!(
        store.get_event("E1").unwrap().unwrap().link,
        Link::Orphaned
    );

    let first = store.reconcile().unwrap();
    assert_eq!(first.adopted, 1);
    let adopted = store.get_event("E1").unwrap().unwrap();
    assert_eq!(adopted.link, Link::Attached);

    let second = store.reconcile().unwrap();
    assert_eq!(second.adopted, 0);
    assert_eq!(second.still_waiting, 0);
    assert_eq!(store.get_event("E1").unwrap().unwrap(), adopted);
}

#[test]
fn test_unresolvable_orphan_is_kept_and_counted() {
    let temp = tempdir().unwrap();
    let store = open(temp.path());

    store
        .append_event(NewEvent::new("s1", "read").with_parent("never-created"))
        .unwrap();

    let report = store.reconcile().unwrap();
    assert_eq!(report.adopted, 0);
    assert_eq!(report.still_waiting, 1);
    assert_eq!(store.list_events("s1").unwrap().len(), 1);
}

#[test]
fn test_lifecycle_statuses() {
    let temp = tempdir().unwrap();
    let store = open(temp.path());
    store
        .resolve_or_create_session(&SessionKey::explicit("S1"))
        .unwrap();

    let event = store
        .append_event(NewEvent::new("S1", "bash").with_summary("cargo fmt"))
        .unwrap();
    assert_eq!(event.status, EventStatus::Pending);

    let resolved = store
        .resolve_event(&event.id, EventStatus::Succeeded)
        .unwrap();
    assert_eq!(resolved.status, EventStatus::Succeeded);
    assert_eq!(
        store.list_events("S1").unwrap()[0].status,
        EventStatus::Succeeded
    );

    let ended = store
        .complete_session("S1", SessionStatus::Completed)
        .unwrap();
    assert_eq!(ended.status, SessionStatus::Completed);
    assert!(ended.ended_at.is_some());
    assert!(store
        .complete_session("missing", SessionStatus::Completed)
        .is_err());
}

#[test]
fn test_project_scoped_stores_are_isolated() {
    let temp = tempdir().unwrap();
    let base = StorageConfig::with_root(temp.path());
    let one = TraceStore::open(base.for_project("/work/one")).unwrap();
    let two = TraceStore::open(base.for_project("/work/two")).unwrap();

    one.resolve_or_create_session(&SessionKey::explicit("S1"))
        .unwrap();
    assert!(two.get_session("S1").unwrap().is_none());
    assert!(two.list_sessions(None).unwrap().is_empty());
}
