use crate::errors::StoshError;
use std::fmt::Display;
use std::str::FromStr;

/// Identifies one of the supported backend kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Asynchronous transactional store (IndexedDB-like).
    Transactional,
    /// Durable per-origin storage (localStorage-like).
    Durable,
    /// Per-tab storage (sessionStorage-like).
    Session,
    /// `document.cookie`-like storage.
    Cookie,
    /// Process-local map, always available.
    Memory,
}

impl StorageKind {
    pub const ALL: [StorageKind; 5] = [
        StorageKind::Transactional,
        StorageKind::Durable,
        StorageKind::Session,
        StorageKind::Cookie,
        StorageKind::Memory,
    ];

    /// Identifier used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Transactional => "idb",
            StorageKind::Durable => "local",
            StorageKind::Session => "session",
            StorageKind::Cookie => "cookie",
            StorageKind::Memory => "memory",
        }
    }

    /// Only durable and session areas emit native cross-context events.
    pub fn has_native_events(&self) -> bool {
        matches!(self, StorageKind::Durable | StorageKind::Session)
    }
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = StoshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoshError::InvalidConfig(format!("Unsupported storage type: {s}")))
    }
}

/// Priority used when async operations are allowed.
pub const DEFAULT_PRIORITY: [StorageKind; 5] = StorageKind::ALL;

/// Priority used for sync-only instances and sync fallbacks.
pub const DEFAULT_PRIORITY_SYNC: [StorageKind; 4] = [
    StorageKind::Durable,
    StorageKind::Session,
    StorageKind::Cookie,
    StorageKind::Memory,
];

/// Whether a selection may bind the asynchronous transactional kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SelectionMode {
    Sync,
    Async,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_identifiers() {
        for kind in StorageKind::ALL {
            assert_eq!(kind.as_str().parse::<StorageKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_identifier_is_config_error() {
        let err = "floppy".parse::<StorageKind>().unwrap_err();
        assert!(matches!(err, StoshError::InvalidConfig(_)));
        assert!(err.to_string().contains("floppy"));
    }

    #[test]
    fn sync_priority_excludes_transactional() {
        assert!(!DEFAULT_PRIORITY_SYNC.contains(&StorageKind::Transactional));
        assert_eq!(DEFAULT_PRIORITY[0], StorageKind::Transactional);
    }

    #[test]
    fn native_events_only_for_durable_and_session() {
        let with_events: Vec<_> = StorageKind::ALL.into_iter().filter(|k| k.has_native_events()).collect();
        assert_eq!(with_events, vec![StorageKind::Durable, StorageKind::Session]);
    }
}
