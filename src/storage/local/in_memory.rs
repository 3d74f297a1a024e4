use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::storage::area::StorageArea;

/// In-memory storage area (no persistence).
///
/// Used for the memory backend and as the default durable store when the UA
/// does not provide a persistent one. It can be switched into a failing mode
/// to emulate a blocked or full platform store.
#[derive(Default)]
pub struct InMemoryArea {
    map: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl InMemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Area whose writes fail, like storage disabled by privacy settings.
    pub fn unavailable() -> Self {
        let area = Self::default();
        area.set_unavailable(true);
        area
    }

    pub fn set_unavailable(&self, on: bool) {
        self.unavailable.store(on, Ordering::SeqCst);
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("storage area is not available"));
        }
        Ok(())
    }
}

impl StorageArea for InMemoryArea {
    fn get_item(&self, key: &str) -> Option<String> {
        self.map().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.map().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.map().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.check_available()?;
        self.map().clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.map().len()
    }

    fn keys(&self) -> Vec<String> {
        let mut v: Vec<String> = self.map().keys().cloned().collect();
        v.sort_unstable(); // stable order for deterministic iteration
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_contract() {
        let area = InMemoryArea::new();

        assert_eq!(area.len(), 0);
        assert!(area.get_item("missing").is_none());

        area.set_item("a", "1").unwrap();
        area.set_item("b", "2").unwrap();
        assert_eq!(area.len(), 2);
        assert_eq!(area.get_item("a").as_deref(), Some("1"));
        assert_eq!(area.get_item("b").as_deref(), Some("2"));

        // overwrite keeps len
        area.set_item("a", "ONE").unwrap();
        assert_eq!(area.len(), 2);
        assert_eq!(area.get_item("a").as_deref(), Some("ONE"));

        // keys are sorted
        assert_eq!(area.keys(), vec!["a".to_string(), "b".to_string()]);

        // remove
        area.remove_item("b").unwrap();
        assert_eq!(area.len(), 1);
        assert!(area.get_item("b").is_none());

        // clear
        area.clear().unwrap();
        assert_eq!(area.len(), 0);
        assert!(area.keys().is_empty());
    }

    #[test]
    fn unavailable_area_rejects_writes_but_allows_reads() {
        let area = InMemoryArea::new();
        area.set_item("k", "v").unwrap();
        area.set_unavailable(true);

        assert!(area.set_item("x", "1").is_err());
        assert!(area.remove_item("k").is_err());
        assert!(area.clear().is_err());
        assert_eq!(area.get_item("k").as_deref(), Some("v"));

        area.set_unavailable(false);
        area.set_item("x", "1").unwrap();
        assert_eq!(area.len(), 2);
    }

    #[test]
    fn constructed_unavailable() {
        let area = InMemoryArea::unavailable();
        assert!(area.set_item("k", "v").is_err());
        assert!(area.is_empty());
    }
}
