//! Explicit context propagation between a spawner and its delegates.
//!
//! A process learns which session it belongs to from its environment, never
//! from shared "current session" state. A spawner injects [`child_env`] into
//! the delegate's environment; the delegate reads it back with
//! [`ContextSource::from_env`].
//!
//! Selection order in [`ContextSource::session_key`]:
//!
//! 1. a concrete session id (`TRACE_SESSION_ID`), unless it equals the
//!    parent id, which means it leaked in from the spawner
//! 2. a derivation key (`TRACE_PARENT_SESSION_ID` + `TRACE_OWNER_LABEL`)
//! 3. only when `allow_recent_session_fallback` is set: the most recently
//!    active top-level session (deprecated, see the hazard note below)

use std::collections::HashMap;

use crate::config::StoreConfig;
use crate::error::{Result, TraceError};
use crate::ids::derive_delegate_session_id;
use crate::registry::{SessionKey, SessionRegistry};

pub const SESSION_ID_ENV: &str = "TRACE_SESSION_ID";
pub const PARENT_SESSION_ID_ENV: &str = "TRACE_PARENT_SESSION_ID";
pub const OWNER_LABEL_ENV: &str = "TRACE_OWNER_LABEL";
pub const PARENT_EVENT_ID_ENV: &str = "TRACE_PARENT_EVENT_ID";

/// Session context inherited by the current process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSource {
    pub session_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub owner_label: Option<String>,
    pub parent_event_id: Option<String>,
}

impl ContextSource {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the context through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            session_id: read(SESSION_ID_ENV),
            parent_session_id: read(PARENT_SESSION_ID_ENV),
            owner_label: read(OWNER_LABEL_ENV),
            parent_event_id: read(PARENT_EVENT_ID_ENV),
        }
    }

    /// Overrides the owner label (e.g. from a command-line flag).
    pub fn with_owner_label(mut self, label: Option<String>) -> Self {
        if let Some(label) = label.filter(|l| !l.trim().is_empty()) {
            self.owner_label = Some(label);
        }
        self
    }

    /// The explicit key for this context, if there is one.
    ///
    /// A concrete id equal to the parent id was inherited from the spawner
    /// rather than set for this process, so it yields to the derivation key.
    pub fn explicit_key(&self) -> Option<SessionKey> {
        let inherited = self.session_id.is_some() && self.session_id == self.parent_session_id;

        if let (Some(parent), Some(label)) = (&self.parent_session_id, &self.owner_label) {
            let derived = derive_delegate_session_id(parent, label);
            if inherited
                || self.session_id.is_none()
                || self.session_id.as_deref() == Some(derived.as_str())
            {
                return Some(SessionKey::delegate(parent, label));
            }
        }

        let id = self.session_id.as_ref()?;
        Some(SessionKey::Explicit {
            id: id.clone(),
            parent_session_id: if inherited {
                None
            } else {
                self.parent_session_id.clone()
            },
            owner_label: self.owner_label.clone(),
        })
    }

    /// Chooses the session key for this process.
    pub fn session_key(&self, registry: &SessionRegistry, config: &StoreConfig) -> Result<SessionKey> {
        if let Some(key) = self.explicit_key() {
            return Ok(key);
        }

        if !config.allow_recent_session_fallback {
            return Err(TraceError::NoContext);
        }

        // HAZARD: "most recent active session" is shared across every window
        // using this store. With two top-level sessions running, a delegate
        // resolved here can be attributed to the wrong one. Kept only behind
        // the deprecated `allow_recent_session_fallback` flag.
        match registry.most_recent_active()? {
            Some(session) => {
                tracing::warn!(
                    session = %session.id,
                    "No explicit context, falling back to most recent active session"
                );
                Ok(SessionKey::explicit(session.id))
            }
            None => Err(TraceError::NoContext),
        }
    }
}

/// Variables a spawner sets on a delegate process so it resolves to the
/// delegate session of `(session_id, owner_label)`.
///
/// Every key is set, overriding what the delegate inherits from the spawner's
/// own environment. A missing parent event is exported as an empty value.
pub fn child_env(
    session_id: &str,
    owner_label: &str,
    parent_event_id: Option<&str>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        SESSION_ID_ENV.to_string(),
        derive_delegate_session_id(session_id, owner_label),
    );
    env.insert(PARENT_SESSION_ID_ENV.to_string(), session_id.to_string());
    env.insert(OWNER_LABEL_ENV.to_string(), owner_label.to_string());
    env.insert(
        PARENT_EVENT_ID_ENV.to_string(),
        parent_event_id.unwrap_or_default().to_string(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use crate::types::Link;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn registry(root: &std::path::Path) -> SessionRegistry {
        let storage = StorageConfig::with_root(root);
        storage.ensure_dirs().unwrap();
        SessionRegistry::new(storage, StoreConfig::default())
    }

    #[test]
    fn test_concrete_id_wins() {
        let ctx = ContextSource::from_lookup(lookup_from(&[
            (SESSION_ID_ENV, "abc"),
            (PARENT_SESSION_ID_ENV, "S1"),
            (OWNER_LABEL_ENV, "gemini"),
        ]));
        match ctx.explicit_key().unwrap() {
            SessionKey::Explicit {
                id,
                parent_session_id,
                ..
            } => {
                assert_eq!(id, "abc");
                assert_eq!(parent_session_id.as_deref(), Some("S1"));
            }
            other => panic!("unexpected key {other:?}"),
        }
    }

    #[test]
    fn test_derivation_key_from_child_env() {
        let env = child_env("S1", "gemini", Some("task-42"));
        let ctx = ContextSource::from_lookup(move |name| env.get(name).cloned());
        assert_eq!(ctx.parent_event_id.as_deref(), Some("task-42"));
        assert_eq!(
            ctx.explicit_key(),
            Some(SessionKey::delegate("S1", "gemini"))
        );
    }

    #[test]
    fn test_blank_values_are_unset() {
        let ctx = ContextSource::from_lookup(lookup_from(&[(SESSION_ID_ENV, "  ")]));
        assert!(ctx.session_id.is_none());
        assert!(ctx.explicit_key().is_none());
    }

    #[test]
    fn test_no_context_without_fallback() {
        let temp = tempdir().unwrap();
        let registry = registry(temp.path());
        registry
            .resolve_or_create(&SessionKey::explicit("A"), Link::Root)
            .unwrap();

        let ctx = ContextSource::default();
        assert!(matches!(
            ctx.session_key(&registry, &StoreConfig::default()),
            Err(TraceError::NoContext)
        ));
    }

    #[test]
    fn test_recent_fallback_when_enabled() {
        let temp = tempdir().unwrap();
        let registry = registry(temp.path());
        registry
            .resolve_or_create(&SessionKey::explicit("A"), Link::Root)
            .unwrap();

        let config = StoreConfig {
            allow_recent_session_fallback: true,
            ..StoreConfig::default()
        };
        let key = ContextSource::default()
            .session_key(&registry, &config)
            .unwrap();
        assert_eq!(key, SessionKey::explicit("A"));
    }

    #[test]
    fn test_label_override() {
        let ctx = ContextSource::from_lookup(lookup_from(&[(PARENT_SESSION_ID_ENV, "S1")]))
            .with_owner_label(Some("codex".to_string()));
        assert_eq!(ctx.explicit_key(), Some(SessionKey::delegate("S1", "codex")));
    }

    fn spawned(spawner: &[(&str, &str)], exported: HashMap<String, String>) -> ContextSource {
        let mut env: HashMap<String, String> = spawner
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.extend(exported);
        ContextSource::from_lookup(move |name| env.get(name).cloned())
    }

    #[test]
    fn test_child_env_overrides_inherited_session_id() {
        let ctx = spawned(
            &[(SESSION_ID_ENV, "S1")],
            child_env("S1", "gemini", Some("task-42")),
        );
        let key = ctx.explicit_key().unwrap();
        assert_eq!(key, SessionKey::delegate("S1", "gemini"));
        assert_eq!(key.session_id(), derive_delegate_session_id("S1", "gemini"));
        assert_ne!(key.session_id(), "S1");
    }

    #[test]
    fn test_session_id_equal_to_parent_yields_to_derivation() {
        let ctx = ContextSource::from_lookup(lookup_from(&[
            (SESSION_ID_ENV, "S1"),
            (PARENT_SESSION_ID_ENV, "S1"),
            (OWNER_LABEL_ENV, "gemini"),
        ]));
        assert_eq!(ctx.explicit_key(), Some(SessionKey::delegate("S1", "gemini")));

        let unlabeled = ContextSource::from_lookup(lookup_from(&[
            (SESSION_ID_ENV, "S1"),
            (PARENT_SESSION_ID_ENV, "S1"),
        ]));
        assert_eq!(unlabeled.explicit_key(), Some(SessionKey::explicit("S1")));
    }

    #[test]
    fn test_grandchild_does_not_inherit_parent_event() {
        let delegate_id = derive_delegate_session_id("S1", "gemini");
        let delegate_env = child_env("S1", "gemini", Some("task-42"));
        let spawner: Vec<(&str, &str)> = delegate_env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let grandchild = spawned(&spawner, child_env(&delegate_id, "codex", None));
        assert!(grandchild.parent_event_id.is_none());
        assert_eq!(grandchild.parent_session_id.as_deref(), Some(delegate_id.as_str()));
        assert_eq!(
            grandchild.explicit_key(),
            Some(SessionKey::delegate(&delegate_id, "codex"))
        );
    }
}
