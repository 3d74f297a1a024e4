//! Change notification.
//!
//! Listeners are fed from two independent producers:
//!
//! - the pipeline itself, after every local set/remove/clear (all backends);
//! - a native forwarder task, for durable and session backends only, that
//!   relays writes made by *other* browsing contexts.
//!
//! A failing listener (error, panic, failed future) is logged and never
//! affects other listeners or the operation that triggered it.

use crate::clock::ClockHandle;
use crate::codec::CodecHandle;
use crate::handle::Unsubscribe;
use crate::selector::PROBE_KEY_PREFIX;
use crate::storage::{StorageScope, Window};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, trace, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

type SyncListener<T> = dyn Fn(&str, Option<&T>) -> anyhow::Result<()> + Send + Sync;
type AsyncListener<T> = dyn Fn(String, Option<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

enum Listener<T> {
    Sync(Arc<SyncListener<T>>),
    Async(Arc<AsyncListener<T>>),
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        match self {
            Listener::Sync(f) => Listener::Sync(f.clone()),
            Listener::Async(f) => Listener::Async(f.clone()),
        }
    }
}

struct Listeners<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

fn lock<T>(state: &Mutex<Listeners<T>>) -> MutexGuard<'_, Listeners<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of change listeners. Clones share the same registry.
pub struct ChangeNotifier<T> {
    state: Arc<Mutex<Listeners<T>>>,
}

impl<T> Clone for ChangeNotifier<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for ChangeNotifier<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ChangeNotifier<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener called synchronously with `(key, value)`.
    /// `None` means the key was removed.
    pub fn on_change<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(&str, Option<&T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(Listener::Sync(Arc::new(f)))
    }

    /// Registers a listener whose future runs in the background.
    pub fn on_change_async<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(String, Option<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.add(Listener::Async(Arc::new(f)))
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&self, listener: Listener<T>) -> Unsubscribe {
        let id = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            state.entries.push((id, listener));
            id
        };

        let weak: Weak<Mutex<Listeners<T>>> = Arc::downgrade(&self.state);
        Unsubscribe::new(move || {
            if let Some(state) = weak.upgrade() {
                lock(&state).entries.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Calls every listener with `(key, value)`.
    pub fn emit(&self, key: &str, value: Option<&T>) {
        // listeners may (un)subscribe from inside the callback
        let listeners: Vec<Listener<T>> = lock(&self.state).entries.iter().map(|(_, l)| l.clone()).collect();
        trace!("[stosh] change '{key}' -> {} listener(s)", listeners.len());

        for listener in listeners {
            match listener {
                Listener::Sync(f) => match catch_unwind(AssertUnwindSafe(|| f(key, value))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("[stosh] onChange listener failed: {e:#}"),
                    Err(_) => error!("[stosh] onChange listener panicked"),
                },
                Listener::Async(f) => {
                    let fut = match catch_unwind(AssertUnwindSafe(|| f(key.to_string(), value.cloned()))) {
                        Ok(fut) => fut,
                        Err(_) => {
                            error!("[stosh] onChange listener panicked");
                            continue;
                        }
                    };
                    spawn_listener(fut);
                }
            }
        }
    }
}

fn spawn_listener(fut: BoxFuture<'static, anyhow::Result<()>>) {
    let fut = AssertUnwindSafe(fut).catch_unwind().map(|res| match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("[stosh] async onChange listener failed: {e:#}"),
        Err(_) => error!("[stosh] async onChange listener panicked"),
    });
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => futures::executor::block_on(fut),
    }
}

/// Background task relaying native storage events to a notifier.
///
/// Aborted on drop.
pub(crate) struct NativeForwarder {
    task: JoinHandle<()>,
}

impl Drop for NativeForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl NativeForwarder {
    /// Starts relaying events for `scope` from other contexts of `window`.
    ///
    /// Returns `None` outside a tokio runtime.
    pub(crate) fn spawn<T: Clone + Send + Sync + 'static>(
        window: &Window,
        scope: StorageScope,
        prefix: String,
        codec: CodecHandle<T>,
        clock: ClockHandle,
        notifier: ChangeNotifier<T>,
    ) -> Option<Self> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let context = window.context_id();
        let tab = window.tab_id();
        let mut rx = window.subscribe();

        let task = handle.spawn(async move {
            loop {
                let ev = match rx.recv().await {
                    Ok(ev) => ev,
                    Err(RecvError::Lagged(n)) => {
                        warn!("[stosh] Missed {n} storage event(s)");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !ev.is_visible_to(context, tab, scope) {
                    continue;
                }
                // clear() events carry no key
                let Some(raw_key) = ev.key else { continue };
                if raw_key.starts_with(PROBE_KEY_PREFIX) {
                    continue;
                }
                let Some(key) = raw_key.strip_prefix(prefix.as_str()) else {
                    continue;
                };

                let value = ev.new_value.and_then(|raw| match codec.decode(&raw) {
                    Ok(entry) if !entry.is_expired(clock.now_millis()) => Some(entry.v),
                    Ok(_) => None,
                    Err(e) => {
                        error!("[stosh] Failed to deserialize storage event value: {e}");
                        None
                    }
                });
                notifier.emit(key, value.as_ref());
            }
        });

        Some(Self { task })
    }
}
