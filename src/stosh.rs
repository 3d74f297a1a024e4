//! The [`Stosh`] instance: one namespace on one selected backend.
//!
//! Every operation exists twice. The async methods (`set`, `get`, ...) await
//! the middleware chain and use the transactional store when it is the
//! primary backend. The `*_sync` methods run to completion without ever
//! suspending, against the synchronous backend; when the primary is
//! transactional that is the sync fallback picked at construction.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use stosh::clock::SystemClock;
//! use stosh::config::{SetOptions, StoshOptions};
//! use stosh::storage::StorageService;
//! use stosh::Stosh;
//!
//! # async fn run() -> Result<(), stosh::StoshError> {
//! let service = StorageService::in_memory(Arc::new(SystemClock));
//! let window = service.window().build();
//!
//! let store: Stosh = Stosh::new(
//!     Some(&window),
//!     StoshOptions::builder().namespace("app").build()?,
//! )?;
//!
//! store.set_with("session", json!({"user": 1}), SetOptions::expire_millis(60_000)).await?;
//! assert_eq!(store.get("session").await?, Some(json!({"user": 1})));
//! # Ok(()) }
//! ```

mod batch;
mod pipeline;

use crate::clock::{ClockHandle, SystemClock};
use crate::codec::{CodecHandle, JsonCodec};
use crate::config::{validate, CookieOptions, RemoveOptions, SetOptions, StoshOptions};
use crate::errors::{Result, StoshError};
use crate::handle::Unsubscribe;
use crate::middleware::{Middleware, MiddlewareKind, MiddlewareOptions, MiddlewareRegistry};
use crate::notifier::{ChangeNotifier, NativeForwarder};
use crate::selector::{select, Backend, SelectorSettings};
use crate::storage::{DatabaseHandle, StorageArea, StorageKind, StorageScope, Window};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

pub use batch::BatchEntry;
use pipeline::{Route, SyncBackend};

/// Bounds every stored value type satisfies.
pub trait Storable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Storable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Namespaced key/value store over the best available backend.
pub struct Stosh<T = Value> {
    transactional: Option<DatabaseHandle>,
    sync: SyncBackend,
    is_memory_fallback: bool,
    namespace: Option<String>,
    prefix: String,
    codec: CodecHandle<T>,
    clock: ClockHandle,
    strict_sync_fallback: bool,
    cookie_defaults: CookieOptions,
    middleware: MiddlewareRegistry<T>,
    notifier: ChangeNotifier<T>,
    _forwarder: Option<NativeForwarder>,
}

impl Stosh {
    /// True when there is no browsing context (server-side rendering).
    pub fn is_ssr(window: Option<&Window>) -> bool {
        window.is_none()
    }
}

impl<T: Storable> Stosh<T> {
    /// Selects a backend and builds the instance.
    ///
    /// `window` is the browsing context; `None` means there is none (server
    /// side rendering) and the memory backend is used.
    pub fn new(window: Option<&Window>, options: StoshOptions<T>) -> Result<Self> {
        validate(&options)?;

        let candidates = options.resolved_priority();
        let settings = SelectorSettings {
            database_name: options.resolved_database_name(),
            cookie_max_bytes: options.cookie_max_bytes,
        };
        let selection = select(window, &candidates, options.selection_mode(), &settings);

        let (transactional, sync) = match (selection.primary, selection.sync_fallback) {
            (Backend::Transactional(db), Some(Backend::Sync { kind, area })) => (Some(db), SyncBackend { kind, area }),
            (Backend::Transactional(db), _) => (Some(db), SyncBackend::memory()),
            (Backend::Sync { kind, area }, _) => (None, SyncBackend { kind, area }),
        };

        let clock: ClockHandle = match window {
            Some(w) => w.clock(),
            None => Arc::new(SystemClock),
        };
        let codec: CodecHandle<T> = match &options.codec {
            Some(codec) => codec.clone(),
            None => Arc::new(JsonCodec::new()),
        };
        let prefix = options.namespace_prefix();
        let notifier = ChangeNotifier::new();

        let forwarder = window.filter(|_| sync.kind.has_native_events()).and_then(|w| {
            let scope = if sync.kind == StorageKind::Session {
                StorageScope::Session
            } else {
                StorageScope::Local
            };
            let fwd = NativeForwarder::spawn(w, scope, prefix.clone(), codec.clone(), clock.clone(), notifier.clone());
            if fwd.is_none() {
                debug!("[stosh] No async runtime, cross-context events are disabled");
            }
            fwd
        });

        debug!(
            "[stosh] Instance ready (namespace '{}', primary {}, sync {})",
            options.namespace.as_deref().unwrap_or(""),
            if transactional.is_some() { StorageKind::Transactional } else { sync.kind },
            sync.kind
        );

        Ok(Self {
            transactional,
            sync,
            is_memory_fallback: selection.is_memory_fallback,
            namespace: options.namespace.clone().filter(|ns| !ns.is_empty()),
            prefix,
            codec,
            clock,
            strict_sync_fallback: options.strict_sync_fallback,
            cookie_defaults: options.cookie.clone(),
            middleware: MiddlewareRegistry::new(),
            notifier,
            _forwarder: forwarder,
        })
    }

    /// Instance with default options.
    pub fn with_defaults(window: Option<&Window>) -> Result<Self> {
        Self::new(window, StoshOptions::default())
    }

    /// True when the instance ended up on the in-memory backend.
    pub fn is_memory_fallback(&self) -> bool {
        self.is_memory_fallback
    }

    /// Kind of the primary backend.
    pub fn backend_kind(&self) -> StorageKind {
        if self.transactional.is_some() {
            StorageKind::Transactional
        } else {
            self.sync.kind
        }
    }

    /// Kind of the backend serving `*_sync` calls.
    pub fn sync_backend_kind(&self) -> StorageKind {
        self.sync.kind
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Registers a middleware for `kind`.
    pub fn use_middleware(&self, kind: MiddlewareKind, middleware: Middleware<T>, options: MiddlewareOptions) -> Unsubscribe {
        self.middleware.register(kind, middleware, options)
    }

    /// Registers a change listener. `None` means the key was removed.
    pub fn on_change<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(&str, Option<&T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.notifier.on_change(f)
    }

    /// Registers a change listener that returns a future.
    pub fn on_change_async<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(String, Option<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.notifier.on_change_async(f)
    }

    // ---- async surface ----

    pub async fn set(&self, key: &str, value: impl Into<Option<T>>) -> Result<()> {
        self.set_with(key, value, SetOptions::default()).await
    }

    /// Writes `value` under `key`. A `None` value removes the key.
    pub async fn set_with(&self, key: &str, value: impl Into<Option<T>>, options: SetOptions) -> Result<()> {
        let value = value.into();
        let route = self.async_route().await;
        self.set_entry(route, key, value, options, false).await
    }

    /// Reads `key`. Missing, expired and unreadable entries are `None`.
    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        let route = self.async_route().await;
        self.get_entry(route, key, false).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.remove_with(key, RemoveOptions::default()).await
    }

    pub async fn remove_with(&self, key: &str, options: RemoveOptions) -> Result<()> {
        let route = self.async_route().await;
        self.remove_entry(route, key, options, false).await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Removes every key of this namespace.
    pub async fn clear(&self) -> Result<()> {
        let route = self.async_route().await;
        self.clear_entries(route, false).await
    }

    /// All live entries of this namespace, keyed without the namespace.
    pub async fn get_all(&self) -> Result<BTreeMap<String, T>> {
        let route = self.async_route().await;
        self.collect_all(route, false).await
    }

    pub async fn batch_set(&self, entries: Vec<BatchEntry<T>>) -> Result<()> {
        self.batch_set_with(entries, None).await
    }

    /// Writes several entries. Entry options win over `common`.
    pub async fn batch_set_with(&self, entries: Vec<BatchEntry<T>>, common: Option<SetOptions>) -> Result<()> {
        let route = self.async_route().await;
        self.batch_set_entries(route, entries, common, false).await
    }

    /// Reads several keys. Results follow `keys` order.
    pub async fn batch_get<K: AsRef<str> + Sync>(&self, keys: &[K]) -> Result<Vec<Option<T>>> {
        let route = self.async_route().await;
        self.batch_get_entries(route, keys, false).await
    }

    pub async fn batch_remove<K: AsRef<str> + Sync>(&self, keys: &[K]) -> Result<()> {
        self.batch_remove_with(keys, RemoveOptions::default()).await
    }

    pub async fn batch_remove_with<K: AsRef<str> + Sync>(&self, keys: &[K], options: RemoveOptions) -> Result<()> {
        let route = self.async_route().await;
        self.batch_remove_entries(route, keys, options, false).await
    }

    // ---- sync surface ----

    pub fn set_sync(&self, key: &str, value: impl Into<Option<T>>) -> Result<()> {
        self.set_sync_with(key, value, SetOptions::default())
    }

    pub fn set_sync_with(&self, key: &str, value: impl Into<Option<T>>, options: SetOptions) -> Result<()> {
        const METHOD: &str = "set_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Set])?;
        let value = value.into();
        drive(METHOD, self.set_entry(self.sync_route(), key, value, options, true))
    }

    pub fn get_sync(&self, key: &str) -> Result<Option<T>> {
        const METHOD: &str = "get_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Get])?;
        drive(METHOD, self.get_entry(self.sync_route(), key, true))
    }

    pub fn remove_sync(&self, key: &str) -> Result<()> {
        self.remove_sync_with(key, RemoveOptions::default())
    }

    pub fn remove_sync_with(&self, key: &str, options: RemoveOptions) -> Result<()> {
        const METHOD: &str = "remove_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Remove])?;
        drive(METHOD, self.remove_entry(self.sync_route(), key, options, true))
    }

    pub fn has_sync(&self, key: &str) -> Result<bool> {
        const METHOD: &str = "has_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Get])?;
        Ok(drive(METHOD, self.get_entry(self.sync_route(), key, true))?.is_some())
    }

    pub fn clear_sync(&self) -> Result<()> {
        const METHOD: &str = "clear_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Remove])?;
        drive(METHOD, self.clear_entries(self.sync_route(), true))
    }

    pub fn get_all_sync(&self) -> Result<BTreeMap<String, T>> {
        const METHOD: &str = "get_all_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Get])?;
        drive(METHOD, self.collect_all(self.sync_route(), true))
    }

    pub fn batch_set_sync(&self, entries: Vec<BatchEntry<T>>) -> Result<()> {
        self.batch_set_sync_with(entries, None)
    }

    pub fn batch_set_sync_with(&self, entries: Vec<BatchEntry<T>>, common: Option<SetOptions>) -> Result<()> {
        const METHOD: &str = "batch_set_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Set])?;
        drive(METHOD, self.batch_set_entries(self.sync_route(), entries, common, true))
    }

    pub fn batch_get_sync<K: AsRef<str> + Sync>(&self, keys: &[K]) -> Result<Vec<Option<T>>> {
        const METHOD: &str = "batch_get_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Get])?;
        drive(METHOD, self.batch_get_entries(self.sync_route(), keys, true))
    }

    pub fn batch_remove_sync<K: AsRef<str> + Sync>(&self, keys: &[K]) -> Result<()> {
        self.batch_remove_sync_with(keys, RemoveOptions::default())
    }

    pub fn batch_remove_sync_with<K: AsRef<str> + Sync>(&self, keys: &[K], options: RemoveOptions) -> Result<()> {
        const METHOD: &str = "batch_remove_sync";
        self.sync_guard(METHOD, &[MiddlewareKind::Remove])?;
        drive(METHOD, self.batch_remove_entries(self.sync_route(), keys, options, true))
    }

    /// Route for the async surface. Synchronous backends are reached after a
    /// yield so both backend families resolve asynchronously.
    async fn async_route(&self) -> Route<'_> {
        match &self.transactional {
            Some(db) => Route::Transactional(db),
            None => {
                tokio::task::yield_now().await;
                Route::Sync(&self.sync)
            }
        }
    }

    fn sync_route(&self) -> Route<'_> {
        Route::Sync(&self.sync)
    }

    /// Applies the sync fallback policy and warns about async middleware.
    fn sync_guard(&self, method: &'static str, kinds: &[MiddlewareKind]) -> Result<()> {
        if self.transactional.is_some() {
            if self.strict_sync_fallback {
                return Err(StoshError::SyncNotSupported { method });
            }
            warn!(
                "[stosh] {method} called when IndexedDB is the primary storage. Operation will use the synchronous fallback storage ({}).",
                self.sync.kind
            );
        }
        if kinds.iter().any(|k| self.middleware.has_async(*k)) {
            warn!("[stosh] An async middleware is registered to a sync method. {method} fails if it suspends.");
        }
        Ok(())
    }

    /// Raw access to the synchronous backend, for inspection.
    pub fn sync_area(&self) -> Arc<dyn StorageArea> {
        self.sync.area.clone()
    }
}

/// Polls `fut` once. Sync calls never wait: a chain that suspends fails.
fn drive<R>(method: &'static str, fut: impl Future<Output = Result<R>>) -> Result<R> {
    fut.now_or_never().unwrap_or(Err(StoshError::Suspended { method }))
}
