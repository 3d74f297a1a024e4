use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

use crate::clock::ClockHandle;
use crate::config::SameSite;

/// The `document.cookie` primitive.
///
/// Implementations must be `Send + Sync` and internally synchronized, since
/// callers only hold `&self`.
pub trait CookieJar: Send + Sync {
    /// Returns all live cookies as `"name=value"` pairs joined by `"; "`.
    fn cookie_string(&self) -> String;

    /// Applies one `Set-Cookie`-style line (`name=value; path=/; max-age=10`).
    ///
    /// A line whose expiry lies in the past deletes the cookie.
    fn set_cookie(&self, line: &str) -> Result<()>;
}

/// A shared handle to a cookie jar.
pub type CookieJarHandle = Arc<dyn CookieJar>;

/// A cookie as held by [`InMemoryCookieJar`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name (case-sensitive, still encoded).
    pub name: String,
    /// Raw cookie value (not URL-decoded).
    pub value: String,
    pub path: Option<String>,
    /// Domain scoping (host-only if `None`). Leading dot stripped.
    pub domain: Option<String>,
    pub secure: bool,
    pub same_site: Option<SameSite>,
    /// Expiry in epoch milliseconds; `None` for session cookies.
    pub expires_at: Option<i64>,
}

impl Cookie {
    fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at.is_some_and(|e| e <= now_millis)
    }

    fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.path == other.path && self.domain == other.domain
    }
}

/// In-memory cookie jar with minimal `Set-Cookie` attribute parsing.
///
/// Handles `Path`, `Domain`, `Secure`, `SameSite`, `Max-Age` and `Expires`
/// (RFC 2822 dates). `Max-Age` wins over `Expires` when both are present.
pub struct InMemoryCookieJar {
    cookies: RwLock<Vec<Cookie>>,
    clock: ClockHandle,
    unavailable: AtomicBool,
}

impl InMemoryCookieJar {
    pub fn new(clock: ClockHandle) -> Self {
        Self {
            cookies: RwLock::new(Vec::new()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Emulates cookies being blocked: every write fails.
    pub fn set_unavailable(&self, on: bool) {
        self.unavailable.store(on, Ordering::SeqCst);
    }

    /// Snapshot of live cookies, for inspection.
    pub fn cookies(&self) -> Vec<Cookie> {
        let now = self.clock.now_millis();
        self.read().iter().filter(|c| !c.is_expired(now)).cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Cookie>> {
        self.cookies.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Cookie>> {
        self.cookies.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn parse(&self, line: &str) -> Result<Cookie> {
        let mut parts = line.split(';');
        let (name, value) = parts
            .next()
            .and_then(|pair| pair.split_once('='))
            .ok_or_else(|| anyhow!("malformed cookie line: {line}"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("cookie name must not be empty"));
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            path: None,
            domain: None,
            secure: false,
            same_site: None,
            expires_at: None,
        };

        let now = self.clock.now_millis();
        let mut max_age: Option<i64> = None;

        for part in parts {
            let part = part.trim();
            if let Some((k, v)) = part.split_once('=') {
                let v = v.trim();
                match k.trim().to_ascii_lowercase().as_str() {
                    "path" => cookie.path = Some(v.to_string()),
                    "domain" => cookie.domain = Some(v.trim_start_matches('.').to_string()),
                    "max-age" => max_age = v.parse().ok(),
                    "expires" => {
                        if let Ok(at) = OffsetDateTime::parse(v, &Rfc2822) {
                            cookie.expires_at = Some((at.unix_timestamp_nanos() / 1_000_000) as i64);
                        }
                    }
                    "samesite" => {
                        cookie.same_site = if v.eq_ignore_ascii_case("lax") {
                            Some(SameSite::Lax)
                        } else if v.eq_ignore_ascii_case("strict") {
                            Some(SameSite::Strict)
                        } else if v.eq_ignore_ascii_case("none") {
                            Some(SameSite::None)
                        } else {
                            None
                        };
                    }
                    _ => {}
                }
            } else if part.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            }
        }

        if let Some(secs) = max_age {
            cookie.expires_at = Some(now.saturating_add(secs.saturating_mul(1000)));
        }

        Ok(cookie)
    }
}

impl CookieJar for InMemoryCookieJar {
    fn cookie_string(&self) -> String {
        self.cookies()
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn set_cookie(&self, line: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("cookies are disabled"));
        }

        let cookie = self.parse(line)?;
        let now = self.clock.now_millis();
        let mut jar = self.write();

        // Drop stale cookies while we hold the lock
        jar.retain(|c| !c.is_expired(now));

        let expired = cookie.is_expired(now);
        // Replace existing cookie with same name/path/domain
        if let Some(idx) = jar.iter().position(|c| c.same_slot(&cookie)) {
            if expired {
                jar.remove(idx);
            } else {
                jar[idx] = cookie;
            }
        } else if !expired {
            jar.push(cookie);
        }
        Ok(())
    }
}
