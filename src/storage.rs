//! Storage backends and the platform primitives they run on.
//!
//! This module holds everything below the operation pipeline: the string
//! key/value drivers, the browser-like primitives they wrap, and the event
//! plumbing that lets one browsing context observe another's writes.
//!
//! # Concepts
//!
//! - **Durable storage** (localStorage-like): one area per service, shared by
//!   every window. Backed by an [`InMemoryArea`] or, with the `sqlite`
//!   feature, a [`SqliteLocalStore`].
//! - **Session storage**: one area per [`TabId`], provided by
//!   [`InMemorySessionStore`].
//! - **Cookies**: a [`CookieJar`] exposed through the [`CookieArea`] driver.
//! - **Transactional storage** (IndexedDB-like): an async
//!   [`TransactionalStore`] with batch and scan primitives.
//! - **Memory**: a private [`InMemoryArea`] per instance.
//!
//! All synchronous drivers implement [`StorageArea`]. Durable and session
//! areas handed out by the [`StorageService`] publish a [`StorageEvent`] on
//! every mutation, which other windows receive through a [`Subscription`].
//!
//! # Example: two windows on one service
//!
//! ```no_run
//! use std::sync::Arc;
//! use stosh::clock::SystemClock;
//! use stosh::storage::StorageService;
//!
//! let service = StorageService::in_memory(Arc::new(SystemClock));
//! let first = service.window().build();
//! let second = service.window().without_transactional().build();
//!
//! first.local_storage().unwrap().set_item("k", "v").unwrap();
//! assert_eq!(second.local_storage().unwrap().get_item("k").as_deref(), Some("v"));
//! ```

/// Storage area module, defining the key/value storage interface.
pub mod area;
/// Cookie jar primitive and cookie driver.
pub mod cookie;
/// Event module, providing storage change events and context ids.
pub mod event;
/// Shared platform storage and browsing contexts.
pub mod service;
/// Async transactional store.
pub mod transactional;
/// Backend kinds and priorities.
pub mod types;

/// Durable storage implementations.
pub mod local {
    /// In-memory area, also used for the memory backend.
    pub mod in_memory;
    /// SQLite-backed durable storage implementation.
    #[cfg(feature = "sqlite")]
    pub mod sqlite_store;
}

/// Session storage module, providing in-memory session storage.
pub mod session {
    /// In-memory session storage implementation.
    pub mod in_memory;
}

pub use area::{StorageArea, WriteAttributes};
pub use cookie::{CookieArea, CookieJar, CookieJarHandle, InMemoryCookieJar};
pub use event::{ContextId, StorageEvent, StorageScope, TabId};
pub use local::in_memory::InMemoryArea;
#[cfg(feature = "sqlite")]
pub use local::sqlite_store::SqliteLocalStore;
pub use service::{StorageService, Subscription, Window, WindowBuilder};
pub use session::in_memory::InMemorySessionStore;
pub use transactional::{DatabaseHandle, InMemoryDatabase, TransactionalStore};
pub use types::{SelectionMode, StorageKind, DEFAULT_PRIORITY, DEFAULT_PRIORITY_SYNC};
