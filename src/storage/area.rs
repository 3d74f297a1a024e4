use crate::config::CookieOptions;
use anyhow::Result;

/// Extra attributes for a single write or delete.
///
/// Only cookie-backed areas act on these. Every other area ignores them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteAttributes {
    /// Resolved cookie attributes (instance defaults overlaid by the call).
    pub cookie: CookieOptions,
    /// Absolute expiry of the entry in epoch milliseconds.
    pub expires_at: Option<i64>,
}

/// Object-safe synchronous key/value storage area (DOM's Storage).
pub trait StorageArea: Send + Sync {
    /// Retrieves the value associated with the given key, or `None` if not found.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Sets the value for the given key, overwriting any existing value.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Removes the item with the given key.
    fn remove_item(&self, key: &str) -> Result<()>;

    /// Clears all items in the storage area.
    fn clear(&self) -> Result<()>;

    /// Returns the number of items in the storage area.
    fn len(&self) -> usize;

    /// Returns a vector of all keys in the storage area.
    fn keys(&self) -> Vec<String>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets an item with per-write attributes.
    fn set_item_with(&self, key: &str, value: &str, _attrs: &WriteAttributes) -> Result<()> {
        self.set_item(key, value)
    }

    /// Removes an item with per-write attributes.
    fn remove_item_with(&self, key: &str, _attrs: &WriteAttributes) -> Result<()> {
        self.remove_item(key)
    }
}

/// Keys of `area` that start with `prefix`.
pub(crate) fn namespace_keys(area: &dyn StorageArea, prefix: &str) -> Vec<String> {
    area.keys().into_iter().filter(|k| k.starts_with(prefix)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::session::in_memory::InMemorySessionStore;
    use crate::storage::TabId;
    use std::sync::Arc;

    fn set(area: &Arc<dyn StorageArea>, k: &str, v: &str) {
        area.set_item(k, v).unwrap();
    }

    #[test]
    fn storagearea_basic_contract() {
        let store = InMemorySessionStore::new();
        let area = store.area(TabId::new());

        // starts empty
        assert_eq!(area.len(), 0);
        assert!(area.is_empty());
        assert!(area.get_item("missing").is_none());

        // set + get
        set(&area, "a", "1");
        set(&area, "b", "2");
        assert_eq!(area.len(), 2);
        assert_eq!(area.get_item("a").as_deref(), Some("1"));
        assert_eq!(area.get_item("b").as_deref(), Some("2"));

        // overwrite keeps len()
        set(&area, "a", "ONE");
        assert_eq!(area.len(), 2);
        assert_eq!(area.get_item("a").as_deref(), Some("ONE"));

        // attributes are ignored by plain areas
        area.set_item_with("c", "3", &WriteAttributes::default()).unwrap();
        assert_eq!(area.get_item("c").as_deref(), Some("3"));
        area.remove_item_with("c", &WriteAttributes::default()).unwrap();

        // remove
        area.remove_item("b").unwrap();
        assert_eq!(area.len(), 1);
        assert!(area.get_item("b").is_none());

        // clear
        area.clear().unwrap();
        assert_eq!(area.len(), 0);
    }

    #[test]
    fn namespace_keys_filters_by_prefix() {
        let store = InMemorySessionStore::new();
        let area = store.area(TabId::new());
        set(&area, "app:a", "1");
        set(&area, "app:b", "2");
        set(&area, "other:a", "3");

        let mut keys = namespace_keys(area.as_ref(), "app:");
        keys.sort();
        assert_eq!(keys, vec!["app:a".to_string(), "app:b".to_string()]);
        assert_eq!(namespace_keys(area.as_ref(), "").len(), 3);
    }
}
