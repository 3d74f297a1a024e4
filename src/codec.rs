//! Entry envelope and the codecs that turn it into a backend string.
//!
//! Every key is persisted as a [`StoredEntry`]: the value under `v` and an
//! optional absolute expiry (epoch milliseconds) under `e`. The default
//! [`JsonCodec`] writes `{"v":...,"e":...}`; [`FnCodec`] lets callers plug in
//! their own format (compression, encryption, ...).

use crate::errors::{Result, StoshError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

/// The unit persisted for a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry<T> {
    pub v: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<i64>,
}

impl<T> StoredEntry<T> {
    pub fn new(v: T, e: Option<i64>) -> Self {
        Self { v, e }
    }

    /// An entry is expired once its expiry instant is at or before `now`.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.e.is_some_and(|e| e <= now_millis)
    }
}

/// Converts entries to and from their persisted string form.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, entry: &StoredEntry<T>) -> Result<String>;
    fn decode(&self, raw: &str) -> Result<StoredEntry<T>>;
}

/// Shared handle to a codec.
pub type CodecHandle<T> = Arc<dyn Codec<T>>;

/// Default JSON codec.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, entry: &StoredEntry<T>) -> Result<String> {
        serde_json::to_string(entry).map_err(|e| StoshError::Codec(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<StoredEntry<T>> {
        serde_json::from_str(raw).map_err(|e| StoshError::Codec(e.to_string()))
    }
}

type EncodeFn<T> = dyn Fn(&StoredEntry<T>) -> anyhow::Result<String> + Send + Sync;
type DecodeFn<T> = dyn Fn(&str) -> anyhow::Result<StoredEntry<T>> + Send + Sync;

/// Codec assembled from a pair of closures.
pub struct FnCodec<T> {
    serialize: Box<EncodeFn<T>>,
    deserialize: Box<DecodeFn<T>>,
}

impl<T> FnCodec<T> {
    pub fn new(
        serialize: impl Fn(&StoredEntry<T>) -> anyhow::Result<String> + Send + Sync + 'static,
        deserialize: impl Fn(&str) -> anyhow::Result<StoredEntry<T>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            serialize: Box::new(serialize),
            deserialize: Box::new(deserialize),
        }
    }
}

impl<T> Codec<T> for FnCodec<T> {
    fn encode(&self, entry: &StoredEntry<T>) -> Result<String> {
        (self.serialize)(entry).map_err(|e| StoshError::Codec(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<StoredEntry<T>> {
        (self.deserialize)(raw).map_err(|e| StoshError::Codec(e.to_string()))
    }
}

/// Checks that `value` survives serialization before any middleware sees it.
pub(crate) fn validate_storable<T: Serialize>(value: &T) -> Result<()> {
    serde_json::to_string(value)
        .map(|_| ())
        .map_err(|e| StoshError::Validation(format!("Value cannot be stored: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn json_codec_omits_missing_expiry() {
        let codec = JsonCodec::<Value>::new();
        let raw = codec.encode(&StoredEntry::new(json!({"a": 1}), None)).unwrap();
        assert_eq!(raw, r#"{"v":{"a":1}}"#);

        let raw = codec.encode(&StoredEntry::new(json!(0), Some(42))).unwrap();
        assert_eq!(raw, r#"{"v":0,"e":42}"#);
    }

    #[test]
    fn json_codec_rejects_garbage() {
        let codec = JsonCodec::<Value>::new();
        assert!(matches!(codec.decode("not json"), Err(StoshError::Codec(_))));
        assert!(matches!(codec.decode(r#"{"x":1}"#), Err(StoshError::Codec(_))));
    }

    #[test]
    fn expiry_is_inclusive() {
        let entry = StoredEntry::new(1, Some(100));
        assert!(!entry.is_expired(99));
        assert!(entry.is_expired(100));
        assert!(entry.is_expired(101));
        assert!(!StoredEntry::new(1, None).is_expired(i64::MAX));
    }

    #[test]
    fn fn_codec_wraps_closures() {
        let codec = FnCodec::<Value>::new(
            |entry| Ok(format!("x{}", serde_json::to_string(entry)?)),
            |raw| {
                let body = raw.strip_prefix('x').ok_or_else(|| anyhow::anyhow!("missing marker"))?;
                Ok(serde_json::from_str(body)?)
            },
        );

        let raw = codec.encode(&StoredEntry::new(json!("hi"), None)).unwrap();
        assert_eq!(raw, r#"x{"v":"hi"}"#);
        assert_eq!(codec.decode(&raw).unwrap().v, json!("hi"));
        assert!(codec.decode(r#"{"v":"hi"}"#).is_err());
    }

    #[test]
    fn validate_storable_rejects_non_string_map_keys() {
        use std::collections::BTreeMap;

        let mut map = BTreeMap::new();
        map.insert((1, 2), "pair");
        assert!(matches!(validate_storable(&map), Err(StoshError::Validation(_))));
        assert!(validate_storable(&json!({"ok": true})).is_ok());
    }
}
