//! Asynchronous transactional store (IndexedDB-like).
//!
//! Unlike [`StorageArea`](crate::storage::StorageArea), every call is a
//! suspension point, and multi-key reads/writes/deletes run as one
//! transaction. The pipeline only ever reaches this store through the async
//! surface.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Backend trait for the transactional store.
///
/// All implementations must be `Send + Sync` for use with tokio. Batch
/// methods are expected to be atomic: either every key is applied or none.
#[async_trait]
pub trait TransactionalStore: Send + Sync + 'static {
    /// Name of the database this handle is bound to.
    fn name(&self) -> &str;

    /// Returns `Ok(None)` if the key doesn't exist.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn remove_item(&self, key: &str) -> Result<()>;

    /// Reads several keys in one transaction. Results follow `keys` order.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Writes several entries in one transaction.
    async fn batch_set(&self, entries: &[(String, String)]) -> Result<()>;

    /// Deletes several keys in one transaction.
    async fn batch_remove(&self, keys: &[String]) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Full cursor scan over the object store.
    async fn entries(&self) -> Result<Vec<(String, String)>>;

    async fn clear(&self) -> Result<()>;
}

/// Shared handle to an open database.
pub type DatabaseHandle = Arc<dyn TransactionalStore>;

/// In-memory transactional store.
///
/// Each method takes the lock once, so batches are atomic with respect to
/// other callers of the same database.
pub struct InMemoryDatabase {
    name: String,
    data: RwLock<BTreeMap<String, String>>,
    failing: AtomicBool,
}

impl InMemoryDatabase {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every request fail, like an aborted transaction.
    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("transaction aborted on database '{}'", self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for InMemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.data.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.check()?;
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    async fn batch_set(&self, entries: &[(String, String)]) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        for (k, v) in entries {
            data.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn batch_remove(&self, keys: &[String]) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        for k in keys {
            data.remove(k);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.data.read().await.keys().cloned().collect())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        self.check()?;
        Ok(self
            .data
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        self.data.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ks: &[&str]) -> Vec<String> {
        ks.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn single_key_operations() {
        let db = InMemoryDatabase::new("test");
        assert_eq!(db.name(), "test");
        assert!(db.get_item("a").await.unwrap().is_none());

        db.set_item("a", "1").await.unwrap();
        assert_eq!(db.get_item("a").await.unwrap().as_deref(), Some("1"));

        db.remove_item("a").await.unwrap();
        db.remove_item("a").await.unwrap();
        assert!(db.get_item("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batches_and_scan() {
        let db = InMemoryDatabase::new("test");
        db.batch_set(&[("b".into(), "2".into()), ("a".into(), "1".into())])
            .await
            .unwrap();

        let got = db.batch_get(&keys(&["a", "missing", "b"])).await.unwrap();
        assert_eq!(got, vec![Some("1".to_string()), None, Some("2".to_string())]);

        // scan is ordered by key
        assert_eq!(db.keys().await.unwrap(), keys(&["a", "b"]));
        assert_eq!(db.entries().await.unwrap()[1], ("b".to_string(), "2".to_string()));

        db.batch_remove(&keys(&["a"])).await.unwrap();
        assert_eq!(db.keys().await.unwrap(), keys(&["b"]));

        db.clear().await.unwrap();
        assert!(db.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_database_rejects_requests() {
        let db = InMemoryDatabase::new("test");
        db.set_item("a", "1").await.unwrap();
        db.set_failing(true);

        assert!(db.get_item("a").await.is_err());
        assert!(db.batch_set(&[("b".into(), "2".into())]).await.is_err());

        db.set_failing(false);
        assert_eq!(db.keys().await.unwrap(), keys(&["a"]));
    }
}
