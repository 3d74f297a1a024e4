//! Middleware chain for `get`, `set` and `remove` operations.
//!
//! A middleware receives the mutable [`MiddlewareContext`] and a [`Next`]
//! continuation. Awaiting `next.run(ctx)` hands control to the following
//! middleware, and after the last one to the terminal step that talks to the
//! backend. A middleware that returns without running `next` vetoes the
//! operation: nothing is persisted and no change is emitted.
//!
//! Chains are futures. The async surface awaits them; the sync surface polls
//! them exactly once and fails with [`StoshError::Suspended`] if they do not
//! complete, so a sync call never blocks.
//!
//! ```
//! use stosh::middleware::{Middleware, MiddlewareContext};
//! use serde_json::{json, Value};
//!
//! // Upper-cases every string written through `set`
//! let upper: Middleware<Value> = Middleware::before(|ctx: &mut MiddlewareContext<Value>| {
//!     if let Some(Value::String(s)) = &ctx.value {
//!         ctx.value = Some(json!(s.to_uppercase()));
//!     }
//!     Ok(())
//! });
//! # let _ = upper;
//! ```

use crate::config::SetOptions;
use crate::errors::{Result, StoshError};
use crate::handle::Unsubscribe;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use log::{error, warn};
use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Operation a middleware is registered for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MiddlewareKind {
    Get,
    Set,
    Remove,
}

impl MiddlewareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MiddlewareKind::Get => "get",
            MiddlewareKind::Set => "set",
            MiddlewareKind::Remove => "remove",
        }
    }
}

impl Display for MiddlewareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call state shared by every middleware and the terminal step.
#[derive(Debug, Clone)]
pub struct MiddlewareContext<T> {
    /// Logical key, without namespace.
    pub key: String,
    /// Value to write. `None` on a `set` turns it into a delete.
    pub value: Option<T>,
    /// Write options (expiry, cookie attributes). For `remove` only the
    /// cookie attributes matter.
    pub options: SetOptions,
    /// Read result, filled in by the terminal `get` step.
    pub result: Option<T>,
    /// True when the call came through the `*_sync` surface.
    pub is_sync: bool,
}

impl<T> MiddlewareContext<T> {
    pub fn new<S: Into<String>>(key: S, is_sync: bool) -> Self {
        Self {
            key: key.into(),
            value: None,
            options: SetOptions::default(),
            result: None,
            is_sync,
        }
    }

    pub fn with_value(mut self, value: Option<T>) -> Self {
        self.value = value;
        self
    }

    pub fn with_options(mut self, options: SetOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_result(mut self, result: Option<T>) -> Self {
        self.result = result;
        self
    }
}

type Handler<T> = dyn for<'a> Fn(&'a mut MiddlewareContext<T>, Next<'a, T>) -> BoxFuture<'a, anyhow::Result<()>>
    + Send
    + Sync;

/// A registered interceptor. Cloning yields the same middleware: identity is
/// shared, so a clone is rejected as a duplicate.
pub struct Middleware<T> {
    handler: Arc<Handler<T>>,
    is_async: bool,
}

impl<T> Clone for Middleware<T> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            is_async: self.is_async,
        }
    }
}

impl<T> Middleware<T> {
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    fn identity(&self) -> *const () {
        Arc::as_ptr(&self.handler) as *const ()
    }
}

impl<T> Debug for Middleware<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("id", &self.identity())
            .field("is_async", &self.is_async)
            .finish()
    }
}

impl<T: Send + 'static> Middleware<T> {
    /// Full form: the handler decides when (and whether) to run `next`.
    ///
    /// ```
    /// use futures::FutureExt;
    /// use stosh::middleware::Middleware;
    ///
    /// let mw: Middleware<i64> = Middleware::new(|ctx, mut next| {
    ///     async move {
    ///         next.run(ctx).await?;
    ///         if let Some(n) = ctx.result {
    ///             ctx.result = Some(n * 2);
    ///         }
    ///         Ok(())
    ///     }
    ///     .boxed()
    /// });
    /// # let _ = mw;
    /// ```
    pub fn new<F>(handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut MiddlewareContext<T>, Next<'a, T>) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
            is_async: false,
        }
    }

    /// Same as [`Middleware::new`], declared as suspending. Sync calls that
    /// reach an asynchronous middleware log a warning.
    pub fn asynchronous<F>(handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut MiddlewareContext<T>, Next<'a, T>) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            is_async: true,
            ..Self::new(handler)
        }
    }

    /// Runs `f` and then continues the chain. An error stops the chain.
    pub fn before<F>(f: F) -> Self
    where
        F: Fn(&mut MiddlewareContext<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(move |ctx, mut next| {
            let res = f(ctx);
            async move {
                res?;
                next.run(ctx).await?;
                Ok(())
            }
            .boxed()
        })
    }

    /// Continues the chain and then runs `f`, e.g. to post-process a read.
    pub fn after<F>(f: F) -> Self
    where
        F: Fn(&mut MiddlewareContext<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |ctx, mut next| {
            let f = f.clone();
            async move {
                next.run(ctx).await?;
                f(ctx)
            }
            .boxed()
        })
    }
}

/// Where a middleware is inserted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MiddlewareOptions {
    /// Run before everything registered so far.
    pub prepend: bool,
    /// Run after every default middleware.
    pub append: bool,
}

impl MiddlewareOptions {
    pub fn prepend() -> Self {
        Self { prepend: true, append: false }
    }

    pub fn append() -> Self {
        Self { prepend: false, append: true }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Placement {
    Prepend,
    Default,
    Append,
}

impl From<MiddlewareOptions> for Placement {
    fn from(opts: MiddlewareOptions) -> Self {
        if opts.prepend {
            Placement::Prepend
        } else if opts.append {
            Placement::Append
        } else {
            Placement::Default
        }
    }
}

/// One slot of a chain.
pub struct Entry<T> {
    id: u64,
    middleware: Middleware<T>,
    placement: Placement,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            middleware: self.middleware.clone(),
            placement: self.placement,
        }
    }
}

struct State<T> {
    next_id: u64,
    chains: HashMap<MiddlewareKind, Vec<Entry<T>>>,
}

/// Ordered middleware lists for every [`MiddlewareKind`].
pub struct MiddlewareRegistry<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Default for MiddlewareRegistry<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_id: 0,
                chains: HashMap::new(),
            })),
        }
    }
}

fn lock<T>(state: &Mutex<State<T>>) -> MutexGuard<'_, State<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> MiddlewareRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `middleware` for `kind`.
    ///
    /// Prepended entries go first (latest first), appended entries last (in
    /// order), defaults just before the first appended entry. Registering the
    /// same middleware twice for one kind is ignored with a warning.
    pub fn register(&self, kind: MiddlewareKind, middleware: Middleware<T>, options: MiddlewareOptions) -> Unsubscribe {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;

        let chain = state.chains.entry(kind).or_default();
        if chain.iter().any(|e| e.middleware.identity() == middleware.identity()) {
            warn!("[stosh] The same middleware has already been registered.");
            return Unsubscribe::noop();
        }

        let placement = Placement::from(options);
        let entry = Entry { id, middleware, placement };
        match placement {
            Placement::Prepend => chain.insert(0, entry),
            Placement::Append => chain.push(entry),
            Placement::Default => match chain.iter().position(|e| e.placement == Placement::Append) {
                Some(idx) => chain.insert(idx, entry),
                None => chain.push(entry),
            },
        }

        let weak: Weak<Mutex<State<T>>> = Arc::downgrade(&self.state);
        Unsubscribe::new(move || {
            if let Some(state) = weak.upgrade() {
                if let Some(chain) = lock(&state).chains.get_mut(&kind) {
                    chain.retain(|e| e.id != id);
                }
            }
        })
    }

    /// Copy of the chain as it is right now.
    pub fn snapshot(&self, kind: MiddlewareKind) -> Vec<Entry<T>> {
        lock(&self.state).chains.get(&kind).cloned().unwrap_or_default()
    }

    /// Whether any middleware declared as asynchronous is registered for `kind`.
    pub fn has_async(&self, kind: MiddlewareKind) -> bool {
        lock(&self.state)
            .chains
            .get(&kind)
            .is_some_and(|c| c.iter().any(|e| e.middleware.is_async()))
    }

    pub fn len(&self, kind: MiddlewareKind) -> usize {
        lock(&self.state).chains.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, kind: MiddlewareKind) -> bool {
        self.len(kind) == 0
    }
}

/// The step after the last middleware: the actual backend operation.
pub trait Terminal<T>: Send + Sync {
    fn call<'c>(&'c self, ctx: &'c mut MiddlewareContext<T>) -> BoxFuture<'c, Result<()>>;
}

/// Continuation handed to a middleware. Runs at most once.
pub struct Next<'a, T> {
    chain: &'a [Entry<T>],
    index: usize,
    terminal: &'a dyn Terminal<T>,
    called: bool,
}

impl<'a, T: Send + 'static> Next<'a, T> {
    /// Runs the rest of the chain. A second call fails with
    /// [`StoshError::NextCalledTwice`].
    pub fn run<'b>(&'b mut self, ctx: &'b mut MiddlewareContext<T>) -> BoxFuture<'b, Result<()>>
    where
        'a: 'b,
    {
        if self.called {
            error!("[stosh] next() called multiple times in middleware");
            return future::ready(Err(StoshError::NextCalledTwice)).boxed();
        }
        self.called = true;
        dispatch(self.chain, self.index, self.terminal, ctx)
    }
}

/// Runs `chain` over `ctx`, ending in `terminal`.
pub fn run_chain<'a, T: Send + 'static>(
    chain: &'a [Entry<T>],
    ctx: &'a mut MiddlewareContext<T>,
    terminal: &'a dyn Terminal<T>,
) -> BoxFuture<'a, Result<()>> {
    dispatch(chain, 0, terminal, ctx)
}

fn dispatch<'a, T: Send + 'static>(
    chain: &'a [Entry<T>],
    index: usize,
    terminal: &'a dyn Terminal<T>,
    ctx: &'a mut MiddlewareContext<T>,
) -> BoxFuture<'a, Result<()>> {
    let Some(entry) = chain.get(index) else {
        return terminal.call(ctx);
    };
    let next = Next {
        chain,
        index: index + 1,
        terminal,
        called: false,
    };
    let fut = (entry.middleware.handler)(ctx, next);
    async move { fut.await.map_err(into_stosh_error) }.boxed()
}

/// Errors that already are [`StoshError`]s (backend failures, a nested
/// middleware error) pass through untouched; anything else was raised by the
/// middleware itself and is logged here, once.
fn into_stosh_error(err: anyhow::Error) -> StoshError {
    match err.downcast::<StoshError>() {
        Ok(e) => e,
        Err(e) => {
            error!("[stosh] Middleware error: {e:#}");
            StoshError::middleware(format!("{e:#}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Ctx = MiddlewareContext<i64>;

    /// Terminal that records it ran and stores the value as result.
    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    impl Terminal<i64> for Echo {
        fn call<'c>(&'c self, ctx: &'c mut Ctx) -> BoxFuture<'c, Result<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.result = ctx.value;
            future::ready(Ok(())).boxed()
        }
    }

    fn run(registry: &MiddlewareRegistry<i64>, ctx: &mut Ctx, terminal: &Echo) -> Result<()> {
        let chain = registry.snapshot(MiddlewareKind::Set);
        block_on(run_chain(&chain, ctx, terminal))
    }

    fn tagger(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Middleware<i64> {
        let log = log.clone();
        Middleware::before(move |_ctx| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    #[test]
    fn empty_chain_runs_terminal() {
        let registry = MiddlewareRegistry::new();
        let terminal = Echo::default();
        let mut ctx = Ctx::new("k", true).with_value(Some(7));

        run(&registry, &mut ctx, &terminal).unwrap();
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.result, Some(7));
    }

    #[test]
    fn ordering_prepend_default_append() {
        let registry = MiddlewareRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = MiddlewareKind::Set;

        registry.register(set, tagger(&log, "a1"), MiddlewareOptions::append());
        registry.register(set, tagger(&log, "d1"), MiddlewareOptions::default());
        registry.register(set, tagger(&log, "d2"), MiddlewareOptions::default());
        registry.register(set, tagger(&log, "a2"), MiddlewareOptions::append());
        registry.register(set, tagger(&log, "d3"), MiddlewareOptions::default());
        registry.register(set, tagger(&log, "p1"), MiddlewareOptions::prepend());
        registry.register(set, tagger(&log, "p2"), MiddlewareOptions::prepend());

        let terminal = Echo::default();
        run(&registry, &mut Ctx::new("k", true), &terminal).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["p2", "p1", "d1", "d2", "d3", "a1", "a2"]
        );
    }

    #[test]
    fn duplicate_registration_runs_once() {
        let registry = MiddlewareRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mw: Middleware<i64> = Middleware::before(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let first = registry.register(MiddlewareKind::Set, mw.clone(), MiddlewareOptions::default());
        let second = registry.register(MiddlewareKind::Set, mw.clone(), MiddlewareOptions::append());
        assert!(second.is_spent());
        assert_eq!(registry.len(MiddlewareKind::Set), 1);

        // other kinds are independent
        registry.register(MiddlewareKind::Get, mw, MiddlewareOptions::default());
        assert_eq!(registry.len(MiddlewareKind::Get), 1);

        run(&registry, &mut Ctx::new("k", true), &Echo::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // the no-op handle from the duplicate must not remove the original
        second.unsubscribe();
        assert_eq!(registry.len(MiddlewareKind::Set), 1);
        first.unsubscribe();
        first.unsubscribe();
        assert!(registry.is_empty(MiddlewareKind::Set));
    }

    #[test]
    fn unsubscribe_removes_exact_entry() {
        let registry = MiddlewareRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = registry.register(MiddlewareKind::Set, tagger(&log, "a"), MiddlewareOptions::default());
        let b = registry.register(MiddlewareKind::Set, tagger(&log, "b"), MiddlewareOptions::default());

        b.unsubscribe();
        run(&registry, &mut Ctx::new("k", true), &Echo::default()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn mutations_reach_terminal() {
        let registry = MiddlewareRegistry::new();
        registry.register(
            MiddlewareKind::Set,
            Middleware::before(|ctx: &mut Ctx| {
                ctx.value = ctx.value.map(|v| v + 1);
                ctx.key = format!("{}!", ctx.key);
                Ok(())
            }),
            MiddlewareOptions::default(),
        );

        let mut ctx = Ctx::new("k", true).with_value(Some(1));
        run(&registry, &mut ctx, &Echo::default()).unwrap();
        assert_eq!(ctx.result, Some(2));
        assert_eq!(ctx.key, "k!");
    }

    #[test]
    fn after_sees_terminal_result() {
        let registry = MiddlewareRegistry::new();
        registry.register(
            MiddlewareKind::Set,
            Middleware::after(|ctx: &mut Ctx| {
                ctx.result = ctx.result.map(|v| v * 10);
                Ok(())
            }),
            MiddlewareOptions::default(),
        );

        let mut ctx = Ctx::new("k", true).with_value(Some(3));
        run(&registry, &mut ctx, &Echo::default()).unwrap();
        assert_eq!(ctx.result, Some(30));
    }

    #[test]
    fn not_calling_next_vetoes() {
        let registry = MiddlewareRegistry::new();
        registry.register(
            MiddlewareKind::Set,
            Middleware::new(|_ctx, _next| future::ready(Ok(())).boxed()),
            MiddlewareOptions::default(),
        );

        let terminal = Echo::default();
        let mut ctx = Ctx::new("k", true).with_value(Some(1));
        run(&registry, &mut ctx, &terminal).unwrap();
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.result, None);
    }

    #[test]
    fn next_twice_is_an_error() {
        let registry = MiddlewareRegistry::new();
        registry.register(
            MiddlewareKind::Set,
            Middleware::new(|ctx, mut next| {
                async move {
                    next.run(ctx).await?;
                    next.run(ctx).await?;
                    Ok(())
                }
                .boxed()
            }),
            MiddlewareOptions::default(),
        );

        let terminal = Echo::default();
        let err = run(&registry, &mut Ctx::new("k", true), &terminal).unwrap_err();
        assert!(matches!(err, StoshError::NextCalledTwice));
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn middleware_error_stops_chain() {
        let registry = MiddlewareRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(
            MiddlewareKind::Set,
            Middleware::before(|_| Err(anyhow::anyhow!("denied"))),
            MiddlewareOptions::default(),
        );
        registry.register(MiddlewareKind::Set, tagger(&log, "later"), MiddlewareOptions::default());

        let terminal = Echo::default();
        let err = run(&registry, &mut Ctx::new("k", true), &terminal).unwrap_err();
        match err {
            StoshError::Middleware(msg) => assert!(msg.contains("denied")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn terminal_errors_pass_through_unchanged() {
        struct Failing;
        impl Terminal<i64> for Failing {
            fn call<'c>(&'c self, _ctx: &'c mut Ctx) -> BoxFuture<'c, Result<()>> {
                future::ready(Err(StoshError::Codec("broken".into()))).boxed()
            }
        }

        let registry = MiddlewareRegistry::new();
        registry.register(MiddlewareKind::Set, Middleware::before(|_| Ok(())), MiddlewareOptions::default());
        let chain = registry.snapshot(MiddlewareKind::Set);
        let err = block_on(run_chain(&chain, &mut Ctx::new("k", true), &Failing)).unwrap_err();
        assert!(matches!(err, StoshError::Codec(_)));
    }

    #[test]
    fn suspending_chain_does_not_complete_in_one_poll() {
        let registry = MiddlewareRegistry::new();
        let mw: Middleware<i64> = Middleware::asynchronous(|ctx, mut next| {
            async move {
                futures::pending!();
                next.run(ctx).await?;
                Ok(())
            }
            .boxed()
        });
        assert!(mw.is_async());
        registry.register(MiddlewareKind::Set, mw, MiddlewareOptions::default());
        assert!(registry.has_async(MiddlewareKind::Set));
        assert!(!registry.has_async(MiddlewareKind::Get));

        let chain = registry.snapshot(MiddlewareKind::Set);
        let terminal = Echo::default();
        let mut ctx = Ctx::new("k", true);
        assert!(run_chain(&chain, &mut ctx, &terminal).now_or_never().is_none());

        // awaited, the same chain completes
        let mut ctx = Ctx::new("k", false).with_value(Some(5));
        block_on(run_chain(&chain, &mut ctx, &terminal)).unwrap();
        assert_eq!(ctx.result, Some(5));
    }
}
