//! Terminal steps and single-key operations.

use super::{Storable, Stosh};
use crate::codec::{validate_storable, StoredEntry};
use crate::config::{RemoveOptions, SetOptions};
use crate::errors::{Result, StoshError};
use crate::middleware::{run_chain, MiddlewareContext, MiddlewareKind, Terminal};
use crate::storage::area::namespace_keys;
use crate::storage::{DatabaseHandle, InMemoryArea, StorageArea, StorageKind, WriteAttributes};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use log::{error, trace};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A JSON `null` result reads as missing.
fn present<T: Storable>(value: Option<T>) -> Option<T> {
    value.filter(|v| !(v as &dyn Any).downcast_ref::<Value>().is_some_and(Value::is_null))
}

/// The synchronous backend of an instance.
#[derive(Clone)]
pub(super) struct SyncBackend {
    pub(super) kind: StorageKind,
    pub(super) area: Arc<dyn StorageArea>,
}

impl SyncBackend {
    pub(super) fn memory() -> Self {
        Self {
            kind: StorageKind::Memory,
            area: Arc::new(InMemoryArea::new()),
        }
    }
}

/// Backend an operation runs against.
#[derive(Clone, Copy)]
pub(super) enum Route<'s> {
    Sync(&'s SyncBackend),
    Transactional(&'s DatabaseHandle),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Op {
    Set,
    Get,
    Remove,
    /// Keeps the pre-filled result (batch reads).
    Keep,
    /// Records the final write or delete instead of performing it.
    Stage,
}

/// A write or delete recorded by [`Op::Stage`]. `raw` is `None` for deletes.
pub(super) struct Staged<T> {
    pub(super) key: String,
    pub(super) raw: Option<String>,
    pub(super) value: Option<T>,
}

pub(super) struct Step<'s, T> {
    stosh: &'s Stosh<T>,
    route: Route<'s>,
    op: Op,
    staged: Mutex<Vec<Staged<T>>>,
}

impl<'s, T: Storable> Step<'s, T> {
    pub(super) fn new(stosh: &'s Stosh<T>, route: Route<'s>, op: Op) -> Self {
        Self {
            stosh,
            route,
            op,
            staged: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn into_staged(self) -> Vec<Staged<T>> {
        self.staged.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage(&self, ctx: &MiddlewareContext<T>) -> Result<()> {
        let raw = match &ctx.value {
            Some(value) => Some(self.stosh.encode(value, &ctx.options)?.0),
            None => None,
        };
        self.staged.lock().unwrap_or_else(PoisonError::into_inner).push(Staged {
            key: ctx.key.clone(),
            raw,
            value: ctx.value.clone(),
        });
        Ok(())
    }
}

impl<'s, T: Storable> Terminal<T> for Step<'s, T> {
    fn call<'c>(&'c self, ctx: &'c mut MiddlewareContext<T>) -> BoxFuture<'c, Result<()>> {
        match self.op {
            Op::Set => self.stosh.persist(self.route, ctx).boxed(),
            Op::Get => async move {
                ctx.result = self.stosh.read(self.route, &ctx.key).await?;
                Ok(())
            }
            .boxed(),
            Op::Remove => self.stosh.delete(self.route, ctx).boxed(),
            Op::Keep => future::ready(Ok(())).boxed(),
            Op::Stage => future::ready(self.stage(ctx)).boxed(),
        }
    }
}

fn backend_err(err: anyhow::Error) -> StoshError {
    StoshError::from_backend(err)
}

impl<T: Storable> Stosh<T> {
    pub(super) fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Encodes `value` with its absolute expiry.
    pub(super) fn encode(&self, value: &T, options: &SetOptions) -> Result<(String, Option<i64>)> {
        let expires_at = options.expires_at(self.clock.now_millis());
        let raw = self.codec.encode(&StoredEntry::new(value.clone(), expires_at))?;
        Ok((raw, expires_at))
    }

    fn write_attributes(&self, options: &SetOptions, expires_at: Option<i64>) -> WriteAttributes {
        WriteAttributes {
            cookie: options.cookie.over(&self.cookie_defaults),
            expires_at,
        }
    }

    pub(super) async fn set_entry(
        &self,
        route: Route<'_>,
        key: &str,
        value: Option<T>,
        options: SetOptions,
        is_sync: bool,
    ) -> Result<()> {
        if let Some(value) = &value {
            validate_storable(value)?;
        }
        trace!("[stosh] set '{key}'");
        let chain = self.middleware.snapshot(MiddlewareKind::Set);
        let mut ctx = MiddlewareContext::new(key, is_sync).with_value(value).with_options(options);
        run_chain(&chain, &mut ctx, &Step::new(self, route, Op::Set)).await
    }

    pub(super) async fn get_entry(&self, route: Route<'_>, key: &str, is_sync: bool) -> Result<Option<T>> {
        trace!("[stosh] get '{key}'");
        let chain = self.middleware.snapshot(MiddlewareKind::Get);
        let mut ctx = MiddlewareContext::new(key, is_sync);
        run_chain(&chain, &mut ctx, &Step::new(self, route, Op::Get)).await?;
        Ok(present(ctx.result))
    }

    pub(super) async fn remove_entry(
        &self,
        route: Route<'_>,
        key: &str,
        options: RemoveOptions,
        is_sync: bool,
    ) -> Result<()> {
        trace!("[stosh] remove '{key}'");
        let chain = self.middleware.snapshot(MiddlewareKind::Remove);
        let options = SetOptions {
            expire: None,
            cookie: options.cookie,
        };
        let mut ctx = MiddlewareContext::new(key, is_sync).with_options(options);
        run_chain(&chain, &mut ctx, &Step::new(self, route, Op::Remove)).await
    }

    /// Removes every namespaced key, each through the remove chain.
    pub(super) async fn clear_entries(&self, route: Route<'_>, is_sync: bool) -> Result<()> {
        match route {
            Route::Sync(backend) => {
                for full in namespace_keys(backend.area.as_ref(), &self.prefix) {
                    let key = &full[self.prefix.len()..];
                    self.remove_entry(route, key, RemoveOptions::default(), is_sync).await?;
                }
                Ok(())
            }
            Route::Transactional(_) => {
                let keys = self.transactional_keys(route).await?;
                self.batch_remove_entries(route, &keys, RemoveOptions::default(), is_sync).await
            }
        }
    }

    /// Every live entry, passed through the get chain. `None` results are left out.
    pub(super) async fn collect_all(&self, route: Route<'_>, is_sync: bool) -> Result<BTreeMap<String, T>> {
        let mut out = BTreeMap::new();
        match route {
            Route::Sync(backend) => {
                for full in namespace_keys(backend.area.as_ref(), &self.prefix) {
                    let key = &full[self.prefix.len()..];
                    if let Some(v) = self.get_entry(route, key, is_sync).await? {
                        out.insert(key.to_string(), v);
                    }
                }
            }
            Route::Transactional(db) => {
                let rows = db.entries().await.map_err(backend_err)?;
                for (full, raw) in rows {
                    let Some(key) = full.strip_prefix(self.prefix.as_str()) else {
                        continue;
                    };
                    let value = self.decode_live(route, &full, &raw).await?;
                    if let Some(v) = self.filter_read(route, key, value, is_sync).await? {
                        out.insert(key.to_string(), v);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Runs the get chain over an already-read value.
    pub(super) async fn filter_read(
        &self,
        route: Route<'_>,
        key: &str,
        value: Option<T>,
        is_sync: bool,
    ) -> Result<Option<T>> {
        let chain = self.middleware.snapshot(MiddlewareKind::Get);
        let mut ctx = MiddlewareContext::new(key, is_sync).with_result(value);
        run_chain(&chain, &mut ctx, &Step::new(self, route, Op::Keep)).await?;
        Ok(present(ctx.result))
    }

    /// Logical keys of this namespace in the transactional store.
    pub(super) async fn transactional_keys(&self, route: Route<'_>) -> Result<Vec<String>> {
        let Route::Transactional(db) = route else {
            return Ok(Vec::new());
        };
        let keys = db.keys().await.map_err(backend_err)?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(self.prefix.as_str()).map(str::to_string))
            .collect())
    }

    async fn persist(&self, route: Route<'_>, ctx: &mut MiddlewareContext<T>) -> Result<()> {
        let Some(value) = &ctx.value else {
            // a write without value is a delete
            let options = RemoveOptions {
                cookie: ctx.options.cookie.clone(),
            };
            return self.remove_entry(route, &ctx.key, options, ctx.is_sync).await;
        };

        let (raw, expires_at) = self.encode(value, &ctx.options)?;
        let full = self.namespaced(&ctx.key);
        match route {
            Route::Sync(backend) => {
                let attrs = self.write_attributes(&ctx.options, expires_at);
                backend.area.set_item_with(&full, &raw, &attrs)
            }
            Route::Transactional(db) => db.set_item(&full, &raw).await,
        }
        .map_err(backend_err)?;

        self.notifier.emit(&ctx.key, ctx.value.as_ref());
        Ok(())
    }

    async fn read(&self, route: Route<'_>, key: &str) -> Result<Option<T>> {
        let full = self.namespaced(key);
        let raw = match route {
            Route::Sync(backend) => backend.area.get_item(&full),
            Route::Transactional(db) => db.get_item(&full).await.map_err(backend_err)?,
        };
        match raw {
            Some(raw) => self.decode_live(route, &full, &raw).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, route: Route<'_>, ctx: &mut MiddlewareContext<T>) -> Result<()> {
        let full = self.namespaced(&ctx.key);
        match route {
            Route::Sync(backend) => {
                let attrs = self.write_attributes(&ctx.options, None);
                backend.area.remove_item_with(&full, &attrs)
            }
            Route::Transactional(db) => db.remove_item(&full).await,
        }
        .map_err(backend_err)?;

        self.notifier.emit(&ctx.key, None);
        Ok(())
    }

    /// Decodes a raw entry. Expired entries are purged and unreadable ones
    /// are logged; both read as `None`.
    pub(super) async fn decode_live(&self, route: Route<'_>, full: &str, raw: &str) -> Result<Option<T>> {
        let entry = match self.codec.decode(raw) {
            Ok(entry) => entry,
            Err(e) => {
                error!("[stosh] Failed to deserialize storage value: {e}");
                return Ok(None);
            }
        };
        if !entry.is_expired(self.clock.now_millis()) {
            return Ok(Some(entry.v));
        }

        trace!("[stosh] '{full}' expired, purging");
        match route {
            Route::Sync(backend) => {
                let attrs = self.write_attributes(&SetOptions::default(), None);
                backend.area.remove_item_with(full, &attrs).map_err(backend_err)?;
            }
            Route::Transactional(db) => {
                if let Err(e) = db.remove_item(full).await {
                    error!("[stosh] Failed to purge expired entry '{full}': {e:#}");
                }
            }
        }
        Ok(None)
    }
}
