use std::fmt::Display;
use uuid::Uuid;

/// A unique identifier for a tab. Browsing contexts in the same tab share session storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(Uuid);

impl TabId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unique identifier for a single browsing context (window / frame).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageScope {
    Local,
    Session,
}

/// Native storage mutation notification, as delivered to other contexts.
#[derive(Clone, Debug)]
pub struct StorageEvent {
    /// Mutated key; `None` when the whole area was cleared.
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub scope: StorageScope,
    /// Tab owning the session area. Always `None` for local storage.
    pub tab: Option<TabId>,
    /// Context that performed the write.
    pub source: ContextId,
}

impl StorageEvent {
    /// Whether a context in `tab` observing `scope` should receive this event.
    /// The writing context itself never does.
    pub fn is_visible_to(&self, context: ContextId, tab: TabId, scope: StorageScope) -> bool {
        if self.source == context || self.scope != scope {
            return false;
        }
        match self.scope {
            StorageScope::Local => true,
            StorageScope::Session => self.tab == Some(tab),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(scope: StorageScope, tab: Option<TabId>, source: ContextId) -> StorageEvent {
        StorageEvent {
            key: Some("greeting".into()),
            old_value: None,
            new_value: Some("hello".into()),
            scope,
            tab,
            source,
        }
    }

    #[test]
    fn local_events_reach_other_contexts_only() {
        let writer = ContextId::new();
        let reader = ContextId::new();
        let ev = event(StorageScope::Local, None, writer);

        assert!(ev.is_visible_to(reader, TabId::new(), StorageScope::Local));
        assert!(!ev.is_visible_to(writer, TabId::new(), StorageScope::Local));
        assert!(!ev.is_visible_to(reader, TabId::new(), StorageScope::Session));
    }

    #[test]
    fn session_events_stay_in_their_tab() {
        let tab = TabId::new();
        let ev = event(StorageScope::Session, Some(tab), ContextId::new());

        assert!(ev.is_visible_to(ContextId::new(), tab, StorageScope::Session));
        assert!(!ev.is_visible_to(ContextId::new(), TabId::new(), StorageScope::Session));
    }

    #[test]
    fn clone_event_is_independent() {
        let ev1 = event(StorageScope::Session, Some(TabId::new()), ContextId::new());

        let mut ev2 = ev1.clone();
        ev2.key = Some("k".into());
        ev2.new_value = None;

        // Original unaffected
        assert_eq!(ev1.key.as_deref(), Some("greeting"));
        assert_eq!(ev1.new_value.as_deref(), Some("hello"));

        assert_eq!(ev2.key.as_deref(), Some("k"));
        assert!(ev2.new_value.is_none());
    }

    #[test]
    fn debug_includes_scope_and_key() {
        let ev = event(StorageScope::Local, None, ContextId::new());
        let s = format!("{:?}", ev);
        assert!(s.contains("StorageEvent"));
        assert!(s.contains("Local"));
        assert!(s.contains("key: Some(\"greeting\")"));
    }
}
