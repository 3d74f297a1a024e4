//! Instance and per-call configuration.
//!
//! `StoshOptions` controls how a [`Stosh`](crate::Stosh) instance picks its
//! backend, prefixes its keys and encodes its entries. Defaults come from
//! [`Default`]; [`StoshOptions::builder()`] validates custom settings.
//!
//! # Examples
//!
//! ```rust
//! use stosh::config::{SameSite, StoshOptions};
//! use stosh::StorageKind;
//! # fn main() -> Result<(), stosh::StoshError> {
//! let opts = StoshOptions::<serde_json::Value>::builder()
//!     .namespace("app")
//!     .priority([StorageKind::Durable, StorageKind::Memory])
//!     .cookie_path("/")
//!     .cookie_same_site(SameSite::Lax)
//!     .build()?;
//! assert_eq!(opts.namespace_prefix(), "app:");
//! # Ok(()) }
//! ```
//!
//! # Errors
//!
//! [`StoshOptionsBuilder::build`] returns [`StoshError::InvalidConfig`] when the
//! `kind` shorthand names an unknown backend, when `priority` is empty, or
//! when `cookie_max_bytes` is zero.

use crate::codec::CodecHandle;
use crate::errors::{Result, StoshError};
use crate::storage::types::{SelectionMode, StorageKind, DEFAULT_PRIORITY, DEFAULT_PRIORITY_SYNC};
use std::fmt;
use std::time::Duration;

/// Separator between the namespace and the caller's key.
pub const NAMESPACE_SEPARATOR: &str = ":";
/// Database used by the transactional backend when no namespace is set.
pub const DEFAULT_DATABASE_NAME: &str = "stosh_default";
/// Largest encoded `name=value` pair accepted by the cookie backend.
pub const DEFAULT_COOKIE_MAX_BYTES: usize = 4096;

/// Cookie `SameSite` attribute.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SameSite::Strict => write!(f, "Strict"),
            SameSite::Lax => write!(f, "Lax"),
            SameSite::None => write!(f, "None"),
        }
    }
}

/// Cookie attributes. Unset fields fall back to the instance defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: Option<bool>,
    pub same_site: Option<SameSite>,
}

impl CookieOptions {
    /// Field-wise overlay: values set on `self` win over `base`.
    pub fn over(&self, base: &CookieOptions) -> CookieOptions {
        CookieOptions {
            path: self.path.clone().or_else(|| base.path.clone()),
            domain: self.domain.clone().or_else(|| base.domain.clone()),
            secure: self.secure.or(base.secure),
            same_site: self.same_site.or(base.same_site),
        }
    }
}

/// Options for a single `set` call (or batch entry).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Relative lifetime of the entry. Zero means no expiry.
    pub expire: Option<Duration>,
    pub cookie: CookieOptions,
}

impl SetOptions {
    pub fn expire(duration: Duration) -> Self {
        Self {
            expire: Some(duration),
            ..Default::default()
        }
    }

    pub fn expire_millis(millis: u64) -> Self {
        Self::expire(Duration::from_millis(millis))
    }

    /// Merges batch-wide options with entry options; the entry wins.
    pub fn merge(common: Option<&SetOptions>, entry: Option<&SetOptions>) -> Option<SetOptions> {
        match (common, entry) {
            (None, None) => None,
            (Some(c), None) => Some(c.clone()),
            (None, Some(e)) => Some(e.clone()),
            (Some(c), Some(e)) => Some(SetOptions {
                expire: e.expire.or(c.expire),
                cookie: e.cookie.over(&c.cookie),
            }),
        }
    }

    /// Absolute expiry in epoch milliseconds, if any.
    pub(crate) fn expires_at(&self, now_millis: i64) -> Option<i64> {
        self.expire
            .filter(|d| !d.is_zero())
            .map(|d| now_millis.saturating_add(d.as_millis().min(i64::MAX as u128) as i64))
    }
}

/// Options for a `remove` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub cookie: CookieOptions,
}

impl From<SetOptions> for RemoveOptions {
    fn from(opts: SetOptions) -> Self {
        Self { cookie: opts.cookie }
    }
}

/// Options for constructing a [`Stosh`](crate::Stosh) instance.
pub struct StoshOptions<T> {
    /// Backend kinds to probe, in order.
    pub priority: Option<Vec<StorageKind>>,
    /// Shorthand for a single-element priority list.
    pub kind: Option<StorageKind>,
    pub namespace: Option<String>,
    /// Entry codec. JSON when unset.
    pub codec: Option<CodecHandle<T>>,
    /// Fail `*_sync` calls instead of using the fallback when the primary is transactional.
    pub strict_sync_fallback: bool,
    /// Defaults applied to every cookie write.
    pub cookie: CookieOptions,
    pub cookie_max_bytes: usize,
    /// Transactional database name. Defaults to the namespace.
    pub database_name: Option<String>,
}

impl<T> Default for StoshOptions<T> {
    fn default() -> Self {
        Self {
            priority: None,
            kind: None,
            namespace: None,
            codec: None,
            strict_sync_fallback: false,
            cookie: CookieOptions::default(),
            cookie_max_bytes: DEFAULT_COOKIE_MAX_BYTES,
            database_name: None,
        }
    }
}

impl<T> Clone for StoshOptions<T> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority.clone(),
            kind: self.kind,
            namespace: self.namespace.clone(),
            codec: self.codec.clone(),
            strict_sync_fallback: self.strict_sync_fallback,
            cookie: self.cookie.clone(),
            cookie_max_bytes: self.cookie_max_bytes,
            database_name: self.database_name.clone(),
        }
    }
}

impl<T> fmt::Debug for StoshOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoshOptions")
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("namespace", &self.namespace)
            .field("custom_codec", &self.codec.is_some())
            .field("strict_sync_fallback", &self.strict_sync_fallback)
            .field("cookie", &self.cookie)
            .field("cookie_max_bytes", &self.cookie_max_bytes)
            .field("database_name", &self.database_name)
            .finish()
    }
}

impl<T> StoshOptions<T> {
    pub fn builder() -> StoshOptionsBuilder<T> {
        StoshOptionsBuilder::default()
    }

    /// Namespace plus separator, or empty when no namespace is set.
    pub fn namespace_prefix(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{ns}{NAMESPACE_SEPARATOR}"),
            _ => String::new(),
        }
    }

    /// An instance is sync-only when it names a non-transactional kind, or an
    /// explicit priority list without the transactional kind.
    pub fn selection_mode(&self) -> SelectionMode {
        let requires_sync = match (&self.kind, &self.priority) {
            (Some(kind), _) => *kind != StorageKind::Transactional,
            (None, Some(priority)) => !priority.contains(&StorageKind::Transactional),
            (None, None) => false,
        };
        if requires_sync {
            SelectionMode::Sync
        } else {
            SelectionMode::Async
        }
    }

    /// Candidate list handed to the selector.
    pub fn resolved_priority(&self) -> Vec<StorageKind> {
        if let Some(priority) = &self.priority {
            return priority.clone();
        }
        if let Some(kind) = self.kind {
            return vec![kind];
        }
        match self.selection_mode() {
            SelectionMode::Sync => DEFAULT_PRIORITY_SYNC.to_vec(),
            SelectionMode::Async => DEFAULT_PRIORITY.to_vec(),
        }
    }

    pub fn resolved_database_name(&self) -> String {
        self.database_name
            .clone()
            .or_else(|| self.namespace.clone().filter(|ns| !ns.is_empty()))
            .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string())
    }
}

/// Builder for [`StoshOptions`].
pub struct StoshOptionsBuilder<T> {
    inner: StoshOptions<T>,
    raw_kind: Option<String>,
}

impl<T> Default for StoshOptionsBuilder<T> {
    fn default() -> Self {
        Self {
            inner: StoshOptions::default(),
            raw_kind: None,
        }
    }
}

impl<T> StoshOptionsBuilder<T> {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut StoshOptions<T>)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn priority(self, kinds: impl IntoIterator<Item = StorageKind>) -> Self {
        let kinds: Vec<_> = kinds.into_iter().collect();
        self.map(|c| c.priority = Some(kinds))
    }

    /// Single backend by identifier (`"idb"`, `"local"`, `"session"`, `"cookie"`, `"memory"`).
    pub fn kind<S: Into<String>>(mut self, kind: S) -> Self {
        self.raw_kind = Some(kind.into());
        self
    }

    pub fn storage_kind(self, kind: StorageKind) -> Self { self.map(|c| c.kind = Some(kind)) }
    pub fn namespace<S: Into<String>>(self, ns: S) -> Self { self.map(|c| c.namespace = Some(ns.into())) }
    pub fn codec(self, codec: CodecHandle<T>) -> Self { self.map(|c| c.codec = Some(codec)) }
    pub fn strict_sync_fallback(self, on: bool) -> Self { self.map(|c| c.strict_sync_fallback = on) }
    pub fn cookie_path<S: Into<String>>(self, path: S) -> Self { self.map(|c| c.cookie.path = Some(path.into())) }
    pub fn cookie_domain<S: Into<String>>(self, domain: S) -> Self { self.map(|c| c.cookie.domain = Some(domain.into())) }
    pub fn cookie_secure(self, on: bool) -> Self { self.map(|c| c.cookie.secure = Some(on)) }
    pub fn cookie_same_site(self, same_site: SameSite) -> Self { self.map(|c| c.cookie.same_site = Some(same_site)) }
    pub fn cookie_max_bytes(self, n: usize) -> Self { self.map(|c| c.cookie_max_bytes = n) }
    pub fn database_name<S: Into<String>>(self, name: S) -> Self { self.map(|c| c.database_name = Some(name.into())) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut StoshOptions<T>)) -> Self { self.map(f) }

    /// Validate and build the final options.
    pub fn build(mut self) -> Result<StoshOptions<T>> {
        if let Some(raw) = self.raw_kind.take() {
            self.inner.kind = Some(raw.parse()?);
        }
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

pub(crate) fn validate<T>(c: &StoshOptions<T>) -> Result<()> {
    if c.priority.as_ref().is_some_and(|p| p.is_empty()) {
        return Err(StoshError::InvalidConfig("priority must name at least one storage type".into()));
    }
    if c.cookie_max_bytes == 0 {
        return Err(StoshError::InvalidConfig("cookie_max_bytes must be at least 1".into()));
    }
    Ok(())
}
