//! Unified key/value storage over browser-like backends.
//!
//! A [`Stosh`] instance picks the best available backend (transactional,
//! durable, session, cookie or memory), prefixes its keys with a namespace,
//! wraps values with an optional expiry and runs every `get`, `set` and
//! `remove` through a middleware chain. Listeners registered with
//! [`Stosh::on_change`] see local writes and, on durable and session
//! backends, writes made by other browsing contexts.
//!
//! The browser primitives themselves live in [`storage`] and are shared
//! through a [`StorageService`]; each [`Window`] is one browsing context.

pub mod clock;
pub mod codec;
pub mod config;
pub mod errors;
pub mod handle;
pub mod middleware;
pub mod notifier;
pub mod selector;
pub mod storage;
pub mod stosh;

pub use config::{CookieOptions, RemoveOptions, SameSite, SetOptions, StoshOptions};
pub use errors::{Result, StoshError};
pub use handle::Unsubscribe;
pub use middleware::{Middleware, MiddlewareContext, MiddlewareKind, MiddlewareOptions, Next};
pub use storage::{StorageKind, StorageService, Window};
pub use stosh::{BatchEntry, Storable, Stosh};
