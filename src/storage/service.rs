use super::area::StorageArea;
use super::cookie::{CookieJarHandle, InMemoryCookieJar};
use super::event::{ContextId, StorageEvent, StorageScope, TabId};
use super::local::in_memory::InMemoryArea;
use super::session::in_memory::InMemorySessionStore;
use super::transactional::{DatabaseHandle, InMemoryDatabase};
use crate::clock::{ClockHandle, SystemClock};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Capacity of the storage event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A handle for receiving storage change notifications.
pub type Subscription = broadcast::Receiver<StorageEvent>;

#[derive(Debug)]
struct StorageBus {
    tx: broadcast::Sender<StorageEvent>,
}

impl Default for StorageBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl StorageBus {
    fn subscribe(&self) -> Subscription {
        self.tx.subscribe()
    }
    fn publish(&self, ev: StorageEvent) {
        // send() only fails when nobody is subscribed
        let _ = self.tx.send(ev);
    }
}

/// Platform storage shared by every browsing context of one origin.
///
/// Owns the durable area, the per-tab session areas, the cookie jar, the
/// transactional databases, the event bus and the clock. Contexts get their
/// handles through [`Window`]s created with [`StorageService::window`].
#[derive(Clone)]
pub struct StorageService {
    local: Arc<dyn StorageArea>,
    session: Arc<InMemorySessionStore>,
    cookies: CookieJarHandle,
    databases: Arc<Mutex<HashMap<String, DatabaseHandle>>>,
    bus: Arc<StorageBus>,
    clock: ClockHandle,
}

impl Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService").finish_non_exhaustive()
    }
}

impl Default for StorageService {
    fn default() -> Self {
        Self::in_memory(Arc::new(SystemClock))
    }
}

impl StorageService {
    pub fn new(local: Arc<dyn StorageArea>, session: Arc<InMemorySessionStore>, clock: ClockHandle) -> Self {
        Self {
            local,
            session,
            cookies: Arc::new(InMemoryCookieJar::new(clock.clone())),
            databases: Arc::new(Mutex::new(HashMap::new())),
            bus: Arc::new(StorageBus::default()),
            clock,
        }
    }

    /// Service where every primitive lives in memory.
    pub fn in_memory(clock: ClockHandle) -> Self {
        Self::new(Arc::new(InMemoryArea::new()), Arc::new(InMemorySessionStore::new()), clock)
    }

    /// Replaces the cookie jar.
    pub fn with_cookie_jar(mut self, jar: CookieJarHandle) -> Self {
        self.cookies = jar;
        self
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn clock(&self) -> ClockHandle {
        self.clock.clone()
    }

    pub fn cookie_jar(&self) -> CookieJarHandle {
        self.cookies.clone()
    }

    /// Durable area as seen by `source`. Writes are published on the bus.
    pub fn local_for(&self, source: ContextId) -> Arc<dyn StorageArea> {
        self.wrap_notifying(self.local.clone(), source, None, StorageScope::Local)
    }

    /// Session area of `tab` as seen by `source`.
    pub fn session_for(&self, source: ContextId, tab: TabId) -> Arc<dyn StorageArea> {
        self.wrap_notifying(self.session.area(tab), source, Some(tab), StorageScope::Session)
    }

    /// Opens (or creates) the database called `name`. All opens of one name
    /// share the same data.
    pub fn database(&self, name: &str) -> DatabaseHandle {
        let mut dbs = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
        dbs.entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryDatabase::new(name)))
            .clone()
    }

    /// Registers an externally built database under its name.
    pub fn insert_database(&self, db: DatabaseHandle) {
        let mut dbs = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
        dbs.insert(db.name().to_string(), db);
    }

    pub fn drop_tab(&self, tab: TabId) {
        self.session.drop_tab(tab);
    }

    /// Starts building a new browsing context on this service.
    pub fn window(&self) -> WindowBuilder {
        WindowBuilder::new(self.clone())
    }

    fn wrap_notifying(
        &self,
        inner: Arc<dyn StorageArea>,
        source: ContextId,
        tab: Option<TabId>,
        scope: StorageScope,
    ) -> Arc<dyn StorageArea> {
        Arc::new(NotifyingArea {
            inner,
            source,
            tab,
            bus: self.bus.clone(),
            scope,
        })
    }
}

struct NotifyingArea {
    inner: Arc<dyn StorageArea>,
    source: ContextId,
    tab: Option<TabId>,
    bus: Arc<StorageBus>,
    scope: StorageScope,
}

impl NotifyingArea {
    fn publish(&self, key: Option<&str>, old_value: Option<String>, new_value: Option<String>) {
        self.bus.publish(StorageEvent {
            key: key.map(str::to_string),
            old_value,
            new_value,
            scope: self.scope,
            tab: self.tab,
            source: self.source,
        });
    }
}

impl StorageArea for NotifyingArea {
    fn get_item(&self, key: &str) -> Option<String> {
        self.inner.get_item(key)
    }
    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let old = self.inner.get_item(key);
        self.inner.set_item(key, value)?;
        self.publish(Some(key), old, Some(value.to_string()));
        Ok(())
    }
    fn remove_item(&self, key: &str) -> Result<()> {
        let old = self.inner.get_item(key);
        self.inner.remove_item(key)?;
        // removing a missing key is not a mutation
        if old.is_some() {
            self.publish(Some(key), old, None);
        }
        Ok(())
    }
    fn clear(&self) -> Result<()> {
        self.inner.clear()?;
        self.publish(None, None, None);
        Ok(())
    }
    fn len(&self) -> usize {
        self.inner.len()
    }
    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }
}

/// Availability of one platform primitive inside a [`Window`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Primitive {
    Available,
    /// Not exposed at all (constructing a backend on it fails).
    Missing,
    /// Exposed, but every write fails.
    Failing,
}

/// One browsing context (window, frame, tab page).
///
/// Every primitive handle is optional so that contexts without a given
/// storage API can be modelled. `None` at the [`Stosh`](crate::Stosh) level
/// stands for "no window at all" (server-side rendering).
#[derive(Clone)]
pub struct Window {
    context: ContextId,
    tab: TabId,
    service: StorageService,
    local: Option<Arc<dyn StorageArea>>,
    session: Option<Arc<dyn StorageArea>>,
    cookies: Option<CookieJarHandle>,
    transactional: bool,
}

impl Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("context", &self.context)
            .field("tab", &self.tab)
            .finish_non_exhaustive()
    }
}

impl Window {
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn tab_id(&self) -> TabId {
        self.tab
    }

    pub fn service(&self) -> &StorageService {
        &self.service
    }

    pub fn clock(&self) -> ClockHandle {
        self.service.clock()
    }

    pub fn local_storage(&self) -> Option<Arc<dyn StorageArea>> {
        self.local.clone()
    }

    pub fn session_storage(&self) -> Option<Arc<dyn StorageArea>> {
        self.session.clone()
    }

    pub fn cookie_jar(&self) -> Option<CookieJarHandle> {
        self.cookies.clone()
    }

    /// Opens the named transactional database.
    pub fn open_database(&self, name: &str) -> Result<DatabaseHandle> {
        if !self.transactional {
            return Err(anyhow!("transactional storage is not available in this context"));
        }
        Ok(self.service.database(name))
    }

    /// Native storage events, as delivered to every context of the service.
    pub fn subscribe(&self) -> Subscription {
        self.service.subscribe()
    }
}

/// Builder for [`Window`].
pub struct WindowBuilder {
    service: StorageService,
    tab: Option<TabId>,
    local: Primitive,
    session: Primitive,
    cookies: Primitive,
    transactional: bool,
}

impl WindowBuilder {
    fn new(service: StorageService) -> Self {
        Self {
            service,
            tab: None,
            local: Primitive::Available,
            session: Primitive::Available,
            cookies: Primitive::Available,
            transactional: true,
        }
    }

    /// Places the context in an existing tab (shares its session area).
    pub fn tab(mut self, tab: TabId) -> Self {
        self.tab = Some(tab);
        self
    }

    pub fn without_local_storage(mut self) -> Self {
        self.local = Primitive::Missing;
        self
    }

    pub fn failing_local_storage(mut self) -> Self {
        self.local = Primitive::Failing;
        self
    }

    pub fn without_session_storage(mut self) -> Self {
        self.session = Primitive::Missing;
        self
    }

    pub fn failing_session_storage(mut self) -> Self {
        self.session = Primitive::Failing;
        self
    }

    pub fn without_cookies(mut self) -> Self {
        self.cookies = Primitive::Missing;
        self
    }

    pub fn failing_cookies(mut self) -> Self {
        self.cookies = Primitive::Failing;
        self
    }

    pub fn without_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    pub fn build(self) -> Window {
        let context = ContextId::new();
        let tab = self.tab.unwrap_or_default();
        let service = self.service;

        let local = match self.local {
            Primitive::Available => Some(service.local_for(context)),
            Primitive::Failing => Some(failing_area()),
            Primitive::Missing => None,
        };
        let session = match self.session {
            Primitive::Available => Some(service.session_for(context, tab)),
            Primitive::Failing => Some(failing_area()),
            Primitive::Missing => None,
        };
        let cookies = match self.cookies {
            Primitive::Available => Some(service.cookie_jar()),
            Primitive::Failing => {
                let jar = InMemoryCookieJar::new(service.clock());
                jar.set_unavailable(true);
                Some(Arc::new(jar) as CookieJarHandle)
            }
            Primitive::Missing => None,
        };

        Window {
            context,
            tab,
            local,
            session,
            cookies,
            transactional: self.transactional,
            service,
        }
    }
}

fn failing_area() -> Arc<dyn StorageArea> {
    Arc::new(InMemoryArea::unavailable())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn service() -> StorageService {
        StorageService::in_memory(ManualClock::new(0))
    }

    #[test]
    fn windows_share_local_storage() {
        let svc = service();
        let a = svc.window().build();
        let b = svc.window().build();

        a.local_storage().unwrap().set_item("k", "v").unwrap();
        assert_eq!(b.local_storage().unwrap().get_item("k").as_deref(), Some("v"));
        assert_ne!(a.context_id(), b.context_id());
    }

    #[test]
    fn session_storage_is_per_tab() {
        let svc = service();
        let a = svc.window().build();
        let same_tab = svc.window().tab(a.tab_id()).build();
        let other_tab = svc.window().build();

        a.session_storage().unwrap().set_item("k", "v").unwrap();
        assert_eq!(same_tab.session_storage().unwrap().get_item("k").as_deref(), Some("v"));
        assert!(other_tab.session_storage().unwrap().get_item("k").is_none());

        svc.drop_tab(a.tab_id());
        assert!(same_tab.session_storage().unwrap().get_item("k").is_none());
    }

    #[test]
    fn mutations_are_published_with_source() {
        let svc = service();
        let mut rx = svc.subscribe();
        let w = svc.window().build();
        let area = w.local_storage().unwrap();

        area.set_item("k", "1").unwrap();
        area.set_item("k", "2").unwrap();
        area.remove_item("k").unwrap();
        area.remove_item("k").unwrap();
        area.clear().unwrap();

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.key.as_deref(), Some("k"));
        assert_eq!(ev.new_value.as_deref(), Some("1"));
        assert_eq!(ev.source, w.context_id());
        assert_eq!(ev.scope, StorageScope::Local);

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.old_value.as_deref(), Some("1"));
        assert_eq!(ev.new_value.as_deref(), Some("2"));

        let ev = rx.try_recv().unwrap();
        assert!(ev.new_value.is_none());

        // second remove was a no-op, next is the clear
        let ev = rx.try_recv().unwrap();
        assert!(ev.key.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn session_events_carry_tab() {
        let svc = service();
        let mut rx = svc.subscribe();
        let w = svc.window().build();
        w.session_storage().unwrap().set_item("k", "v").unwrap();

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.scope, StorageScope::Session);
        assert_eq!(ev.tab, Some(w.tab_id()));
    }

    #[test]
    fn builder_controls_primitives() {
        let svc = service();
        let w = svc
            .window()
            .without_local_storage()
            .failing_session_storage()
            .failing_cookies()
            .without_transactional()
            .build();

        assert!(w.local_storage().is_none());
        assert!(w.session_storage().unwrap().set_item("k", "v").is_err());
        assert!(w.cookie_jar().unwrap().set_cookie("a=1").is_err());
        assert!(w.open_database("db").is_err());

        let w = svc.window().without_cookies().build();
        assert!(w.cookie_jar().is_none());
    }

    #[tokio::test]
    async fn databases_are_shared_by_name() {
        let svc = service();
        let a = svc.window().build().open_database("app").unwrap();
        let b = svc.window().build().open_database("app").unwrap();
        let other = svc.database("other");

        a.set_item("k", "v").await.unwrap();
        assert_eq!(b.get_item("k").await.unwrap().as_deref(), Some("v"));
        assert!(other.get_item("k").await.unwrap().is_none());
    }
}
