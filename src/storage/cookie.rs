//! Cookie storage: the [`CookieJar`] primitive and the [`CookieArea`] driver.
//!
//! The jar models `document.cookie`: reading returns `"a=1; b=2"`, writing
//! takes a single `Set-Cookie`-style line. [`CookieArea`] adapts a jar to the
//! [`StorageArea`](crate::storage::StorageArea) contract so the pipeline can
//! treat cookies like any other synchronous backend.
//!
//! ## Notes & limitations
//! - Names and values are percent-encoded the same way `encodeURIComponent`
//!   does, so `;` and `=` inside values are safe.
//! - Writes whose encoded `name=value` exceeds the configured limit are
//!   rejected with [`StoshError::QuotaExceeded`](crate::StoshError::QuotaExceeded)
//!   instead of being silently truncated or dropped.
//! - Entry expiry is mirrored into `max-age` so the jar drops stale cookies
//!   on its own.

mod area;
mod jar;

pub use area::CookieArea;
pub use jar::{Cookie, CookieJar, CookieJarHandle, InMemoryCookieJar};
