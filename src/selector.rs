//! Backend selection with graceful degradation.
//!
//! Candidates are tried in priority order. A synchronous candidate is
//! accepted once a throwaway write and delete succeed on it; the
//! transactional candidate is accepted once its database opens. When nothing
//! works the memory backend is used and flagged as a fallback.

use crate::storage::{
    CookieArea, DatabaseHandle, InMemoryArea, SelectionMode, StorageArea, StorageKind, Window,
};
use anyhow::{anyhow, Result};
use log::debug;
use std::fmt::Debug;
use std::sync::Arc;

/// Prefix of the disposable key written while probing a backend.
pub const PROBE_KEY_PREFIX: &str = "__stosh_test_key__";

/// A backend bound to an instance, tagged by capability.
#[derive(Clone)]
pub enum Backend {
    /// Any synchronous string store.
    Sync {
        kind: StorageKind,
        area: Arc<dyn StorageArea>,
    },
    /// The async transactional store.
    Transactional(DatabaseHandle),
}

impl Backend {
    pub fn kind(&self) -> StorageKind {
        match self {
            Backend::Sync { kind, .. } => *kind,
            Backend::Transactional(_) => StorageKind::Transactional,
        }
    }

    fn memory() -> Self {
        Backend::Sync {
            kind: StorageKind::Memory,
            area: Arc::new(InMemoryArea::new()),
        }
    }
}

impl Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Sync { kind, .. } => f.debug_struct("Sync").field("kind", kind).finish_non_exhaustive(),
            Backend::Transactional(db) => f.debug_tuple("Transactional").field(&db.name()).finish(),
        }
    }
}

/// Outcome of [`select`].
#[derive(Debug, Clone)]
pub struct Selection {
    pub primary: Backend,
    /// Synchronous backend serving `*_sync` calls when the primary is
    /// transactional.
    pub sync_fallback: Option<Backend>,
    /// True when the instance ended up on the memory backend.
    pub is_memory_fallback: bool,
}

impl Selection {
    fn memory() -> Self {
        Self {
            primary: Backend::memory(),
            sync_fallback: None,
            is_memory_fallback: true,
        }
    }
}

/// Inputs the drivers need at construction.
#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub database_name: String,
    pub cookie_max_bytes: usize,
}

/// Picks the first viable backend in `candidates`.
///
/// Without a window (server-side rendering) no probing happens and the memory
/// backend is returned as a fallback.
pub fn select(
    window: Option<&Window>,
    candidates: &[StorageKind],
    mode: SelectionMode,
    settings: &SelectorSettings,
) -> Selection {
    let Some(window) = window else {
        debug!("[stosh] No window available, using memory storage");
        return Selection::memory();
    };

    for &kind in candidates {
        if kind == StorageKind::Transactional {
            if mode == SelectionMode::Sync {
                debug!("[stosh] Skipping {kind} for a sync-only instance");
                continue;
            }
            match window.open_database(&settings.database_name) {
                Ok(db) => {
                    let rest: Vec<StorageKind> = candidates
                        .iter()
                        .copied()
                        .filter(|k| *k != StorageKind::Transactional)
                        .collect();
                    let fallback = select_sync(window, &rest, settings);
                    debug!(
                        "[stosh] Selected {kind} (database '{}'), sync fallback {}",
                        settings.database_name,
                        fallback.kind()
                    );
                    return Selection {
                        primary: Backend::Transactional(db),
                        sync_fallback: Some(fallback),
                        is_memory_fallback: false,
                    };
                }
                Err(e) => {
                    debug!("[stosh] {kind} unavailable: {e}");
                    continue;
                }
            }
        }

        match open_probed(window, kind, settings) {
            Ok(area) => {
                debug!("[stosh] Selected {kind}");
                return Selection {
                    primary: Backend::Sync { kind, area },
                    sync_fallback: None,
                    is_memory_fallback: kind == StorageKind::Memory,
                };
            }
            Err(e) => debug!("[stosh] {kind} failed its probe: {e}"),
        }
    }

    debug!("[stosh] No candidate available, using memory storage");
    Selection::memory()
}

/// First viable synchronous backend, or memory.
fn select_sync(window: &Window, candidates: &[StorageKind], settings: &SelectorSettings) -> Backend {
    for &kind in candidates {
        match open_probed(window, kind, settings) {
            Ok(area) => return Backend::Sync { kind, area },
            Err(e) => debug!("[stosh] Sync fallback {kind} failed its probe: {e}"),
        }
    }
    Backend::memory()
}

fn open_probed(window: &Window, kind: StorageKind, settings: &SelectorSettings) -> Result<Arc<dyn StorageArea>> {
    let area = open_sync(window, kind, settings)?;
    if kind != StorageKind::Memory {
        probe(area.as_ref())?;
    }
    Ok(area)
}

fn open_sync(window: &Window, kind: StorageKind, settings: &SelectorSettings) -> Result<Arc<dyn StorageArea>> {
    match kind {
        StorageKind::Durable => window
            .local_storage()
            .ok_or_else(|| anyhow!("durable storage is not exposed")),
        StorageKind::Session => window
            .session_storage()
            .ok_or_else(|| anyhow!("session storage is not exposed")),
        StorageKind::Cookie => {
            let jar = window.cookie_jar().ok_or_else(|| anyhow!("cookies are not exposed"))?;
            Ok(Arc::new(CookieArea::new(jar, window.clock(), settings.cookie_max_bytes)))
        }
        StorageKind::Memory => Ok(Arc::new(InMemoryArea::new())),
        StorageKind::Transactional => Err(anyhow!("{kind} is not a synchronous backend")),
    }
}

/// Disposable write and delete.
fn probe(area: &dyn StorageArea) -> Result<()> {
    let key = format!("{PROBE_KEY_PREFIX}{}", rand::random::<u64>());
    area.set_item(&key, "1")?;
    area.remove_item(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::StorageService;

    fn settings() -> SelectorSettings {
        SelectorSettings {
            database_name: "stosh_default".into(),
            cookie_max_bytes: 4096,
        }
    }

    fn service() -> StorageService {
        StorageService::in_memory(ManualClock::new(0))
    }

    #[test]
    fn no_window_selects_memory_fallback() {
        let sel = select(None, &StorageKind::ALL, SelectionMode::Async, &settings());
        assert_eq!(sel.primary.kind(), StorageKind::Memory);
        assert!(sel.is_memory_fallback);
        assert!(sel.sync_fallback.is_none());
    }

    #[test]
    fn first_working_candidate_wins() {
        let w = service().window().build();
        let sel = select(
            Some(&w),
            &[StorageKind::Session, StorageKind::Durable],
            SelectionMode::Sync,
            &settings(),
        );
        assert_eq!(sel.primary.kind(), StorageKind::Session);
        assert!(!sel.is_memory_fallback);

        // probe leaves nothing behind
        assert!(w.session_storage().unwrap().is_empty());
    }

    #[test]
    fn failing_candidates_fall_through_to_memory() {
        let w = service()
            .window()
            .failing_local_storage()
            .failing_session_storage()
            .failing_cookies()
            .build();
        let sel = select(
            Some(&w),
            &[StorageKind::Durable, StorageKind::Session, StorageKind::Cookie, StorageKind::Memory],
            SelectionMode::Sync,
            &settings(),
        );
        assert_eq!(sel.primary.kind(), StorageKind::Memory);
        assert!(sel.is_memory_fallback);
    }

    #[test]
    fn exhausted_list_without_memory_still_gets_memory() {
        let w = service().window().without_local_storage().build();
        let sel = select(Some(&w), &[StorageKind::Durable], SelectionMode::Sync, &settings());
        assert_eq!(sel.primary.kind(), StorageKind::Memory);
        assert!(sel.is_memory_fallback);
    }

    #[test]
    fn explicit_memory_is_flagged_as_fallback() {
        let w = service().window().build();
        let sel = select(Some(&w), &[StorageKind::Memory], SelectionMode::Sync, &settings());
        assert!(sel.is_memory_fallback);
    }

    #[test]
    fn transactional_primary_gets_sync_fallback() {
        let w = service().window().failing_local_storage().build();
        let sel = select(Some(&w), &StorageKind::ALL, SelectionMode::Async, &settings());

        assert_eq!(sel.primary.kind(), StorageKind::Transactional);
        assert!(!sel.is_memory_fallback);
        assert_eq!(sel.sync_fallback.unwrap().kind(), StorageKind::Session);
    }

    #[test]
    fn transactional_without_sync_candidates_falls_back_to_memory() {
        let w = service().window().build();
        let sel = select(Some(&w), &[StorageKind::Transactional], SelectionMode::Async, &settings());
        assert_eq!(sel.primary.kind(), StorageKind::Transactional);
        assert_eq!(sel.sync_fallback.unwrap().kind(), StorageKind::Memory);
    }

    #[test]
    fn unavailable_transactional_moves_on() {
        let w = service().window().without_transactional().build();
        let sel = select(Some(&w), &StorageKind::ALL, SelectionMode::Async, &settings());
        assert_eq!(sel.primary.kind(), StorageKind::Durable);
        assert!(sel.sync_fallback.is_none());
    }

    #[test]
    fn sync_mode_skips_transactional() {
        let w = service().window().build();
        let sel = select(
            Some(&w),
            &[StorageKind::Transactional, StorageKind::Cookie],
            SelectionMode::Sync,
            &settings(),
        );
        assert_eq!(sel.primary.kind(), StorageKind::Cookie);
    }
}
