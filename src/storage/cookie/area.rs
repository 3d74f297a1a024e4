use anyhow::Result;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::clock::ClockHandle;
use crate::errors::StoshError;
use crate::storage::area::{StorageArea, WriteAttributes};
use crate::storage::cookie::CookieJarHandle;

/// Characters escaped by `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const EPOCH: &str = "Thu, 01 Jan 1970 00:00:00 GMT";
const DEFAULT_PATH: &str = "/";

fn encode(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

fn decode(s: &str) -> Option<String> {
    percent_decode_str(s).decode_utf8().ok().map(|c| c.into_owned())
}

/// Storage area on top of a cookie jar.
pub struct CookieArea {
    jar: CookieJarHandle,
    clock: ClockHandle,
    max_bytes: usize,
}

impl CookieArea {
    pub fn new(jar: CookieJarHandle, clock: ClockHandle, max_bytes: usize) -> Self {
        Self { jar, clock, max_bytes }
    }

    /// Raw `(encoded name, encoded value)` pairs currently visible.
    fn pairs(&self) -> Vec<(String, String)> {
        self.jar
            .cookie_string()
            .split(';')
            .filter_map(|c| {
                let (name, value) = c.trim().split_once('=')?;
                Some((name.trim().to_string(), value.to_string()))
            })
            .collect()
    }

    fn attributes(&self, attrs: &WriteAttributes) -> String {
        let cookie = &attrs.cookie;
        let mut line = format!("; path={}", cookie.path.as_deref().unwrap_or(DEFAULT_PATH));
        if let Some(domain) = &cookie.domain {
            line.push_str(&format!("; domain={domain}"));
        }
        if cookie.secure == Some(true) {
            line.push_str("; secure");
        }
        if let Some(same_site) = cookie.same_site {
            line.push_str(&format!("; samesite={same_site}"));
        }
        line
    }
}

impl StorageArea for CookieArea {
    fn get_item(&self, key: &str) -> Option<String> {
        let name = encode(key);
        self.pairs()
            .into_iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| decode(&v))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.set_item_with(key, value, &WriteAttributes::default())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.remove_item_with(key, &WriteAttributes::default())
    }

    fn clear(&self) -> Result<()> {
        for key in self.keys() {
            self.remove_item(&key)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.pairs().len()
    }

    fn keys(&self) -> Vec<String> {
        self.pairs().into_iter().filter_map(|(n, _)| decode(&n)).collect()
    }

    fn set_item_with(&self, key: &str, value: &str, attrs: &WriteAttributes) -> Result<()> {
        let pair = format!("{}={}", encode(key), encode(value));
        if pair.len() > self.max_bytes {
            return Err(StoshError::QuotaExceeded {
                key: key.to_string(),
                size: pair.len(),
                limit: self.max_bytes,
            }
            .into());
        }

        let mut line = pair;
        line.push_str(&self.attributes(attrs));
        if let Some(expires_at) = attrs.expires_at {
            let remaining = expires_at - self.clock.now_millis();
            // round up so the cookie never dies before the entry does
            let secs = (remaining.max(0) + 999) / 1000;
            line.push_str(&format!("; max-age={secs}"));
        }
        self.jar.set_cookie(&line)
    }

    fn remove_item_with(&self, key: &str, attrs: &WriteAttributes) -> Result<()> {
        let line = format!("{}=; expires={EPOCH}; max-age=0{}", encode(key), self.attributes(attrs));
        self.jar.set_cookie(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CookieOptions, SameSite};
    use crate::storage::cookie::{CookieJar, InMemoryCookieJar};
    use std::sync::Arc;

    fn area(max_bytes: usize) -> (Arc<ManualClock>, Arc<InMemoryCookieJar>, CookieArea) {
        let clock = ManualClock::new(0);
        let jar = Arc::new(InMemoryCookieJar::new(clock.clone()));
        let area = CookieArea::new(jar.clone(), clock.clone(), max_bytes);
        (clock, jar, area)
    }

    #[test]
    fn values_are_percent_encoded() {
        let (_clock, jar, area) = area(4096);
        area.set_item("ns:key", r#"{"v":"a; b=c"}"#).unwrap();

        assert_eq!(area.get_item("ns:key").as_deref(), Some(r#"{"v":"a; b=c"}"#));
        assert_eq!(area.keys(), vec!["ns:key".to_string()]);
        // raw jar never sees a bare separator
        assert!(jar.cookie_string().starts_with("ns%3Akey="));
        assert!(!jar.cookie_string().contains(' '));
    }

    #[test]
    fn attributes_are_applied() {
        let (_clock, jar, area) = area(4096);
        let attrs = WriteAttributes {
            cookie: CookieOptions {
                path: Some("/app".into()),
                domain: Some("example.com".into()),
                secure: Some(true),
                same_site: Some(SameSite::Strict),
            },
            expires_at: None,
        };
        area.set_item_with("k", "v", &attrs).unwrap();

        let cookie = jar.cookies().pop().unwrap();
        assert_eq!(cookie.path.as_deref(), Some("/app"));
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert!(cookie.secure);
        assert_eq!(cookie.same_site, Some(SameSite::Strict));

        // removal must target the same path/domain
        area.remove_item("k").unwrap();
        assert_eq!(area.len(), 1);
        area.remove_item_with("k", &attrs).unwrap();
        assert_eq!(area.len(), 0);
    }

    #[test]
    fn expiry_maps_to_max_age() {
        let (clock, _jar, area) = area(4096);
        let attrs = WriteAttributes {
            expires_at: Some(1_500),
            ..Default::default()
        };
        area.set_item_with("k", "v", &attrs).unwrap();
        assert!(area.get_item("k").is_some());

        clock.set(2_000);
        assert!(area.get_item("k").is_none());
    }

    #[test]
    fn oversized_write_is_rejected() {
        let (_clock, _jar, area) = area(16);
        let err = area.set_item("key", &"x".repeat(32)).unwrap_err();
        let err = err.downcast::<StoshError>().unwrap();
        assert!(matches!(err, StoshError::QuotaExceeded { limit: 16, .. }));
        assert!(area.get_item("key").is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let (_clock, _jar, area) = area(4096);
        area.set_item("a", "1").unwrap();
        area.set_item("b", "2").unwrap();
        assert_eq!(area.len(), 2);
        area.clear().unwrap();
        assert!(area.is_empty());
    }
}
