use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use anyhow::Result;

use crate::storage::area::StorageArea;
use crate::storage::event::TabId;

type SessionMap = Arc<RwLock<HashMap<TabId, HashMap<String, String>>>>;

// In memory storage, one area per tab
#[derive(Default)]
pub struct InMemorySessionStore {
    data: SessionMap,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session area of `tab`. All handles for the same tab share state.
    pub fn area(&self, tab: TabId) -> Arc<dyn StorageArea> {
        write(&self.data).entry(tab).or_default();

        Arc::new(SessionArea {
            data: Arc::clone(&self.data),
            tab,
        })
    }

    /// Drops all session storage for the given tab.
    pub fn drop_tab(&self, tab: TabId) {
        write(&self.data).remove(&tab);
    }
}

fn read(data: &SessionMap) -> RwLockReadGuard<'_, HashMap<TabId, HashMap<String, String>>> {
    data.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(data: &SessionMap) -> RwLockWriteGuard<'_, HashMap<TabId, HashMap<String, String>>> {
    data.write().unwrap_or_else(PoisonError::into_inner)
}

struct SessionArea {
    data: SessionMap,
    tab: TabId,
}

impl StorageArea for SessionArea {
    fn get_item(&self, k: &str) -> Option<String> {
        read(&self.data)
            .get(&self.tab)
            .and_then(|m| m.get(k).cloned())
    }

    fn set_item(&self, k: &str, v: &str) -> Result<()> {
        write(&self.data)
            .entry(self.tab)
            .or_default()
            .insert(k.to_string(), v.to_string());
        Ok(())
    }

    fn remove_item(&self, k: &str) -> Result<()> {
        if let Some(m) = write(&self.data).get_mut(&self.tab) {
            m.remove(k);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        write(&self.data).insert(self.tab, HashMap::new());
        Ok(())
    }

    fn len(&self) -> usize {
        read(&self.data)
            .get(&self.tab)
            .map(|m| m.len()).unwrap_or(0)
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = read(&self.data)
            .get(&self.tab)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }
}
