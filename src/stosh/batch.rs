//! Multi-key operations.
//!
//! On a synchronous backend a batch is a loop over the single-key operations.
//! On the transactional backend every key still runs its own middleware
//! chain, but the chains only stage their outcome and the store is hit once.

use super::pipeline::{Op, Route, Staged, Step};
use super::{Storable, Stosh};
use crate::codec::validate_storable;
use crate::config::{RemoveOptions, SetOptions};
use crate::errors::{Result, StoshError};
use crate::middleware::{run_chain, MiddlewareContext, MiddlewareKind};

/// One entry of a batch write. A `None` value deletes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry<T> {
    pub key: String,
    pub value: Option<T>,
    pub options: Option<SetOptions>,
}

impl<T> BatchEntry<T> {
    pub fn new<S: Into<String>>(key: S, value: impl Into<Option<T>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            options: None,
        }
    }

    pub fn with_options(mut self, options: SetOptions) -> Self {
        self.options = Some(options);
        self
    }
}

impl<T: Storable> Stosh<T> {
    pub(super) async fn batch_set_entries(
        &self,
        route: Route<'_>,
        entries: Vec<BatchEntry<T>>,
        common: Option<SetOptions>,
        is_sync: bool,
    ) -> Result<()> {
        let Route::Transactional(db) = route else {
            for entry in entries {
                let options = SetOptions::merge(common.as_ref(), entry.options.as_ref()).unwrap_or_default();
                self.set_entry(route, &entry.key, entry.value, options, is_sync).await?;
            }
            return Ok(());
        };

        // nothing is staged unless every value can be stored
        for entry in &entries {
            if let Some(value) = &entry.value {
                validate_storable(value)?;
            }
        }

        let chain = self.middleware.snapshot(MiddlewareKind::Set);
        let step = Step::new(self, route, Op::Stage);
        for entry in entries {
            let options = SetOptions::merge(common.as_ref(), entry.options.as_ref()).unwrap_or_default();
            let mut ctx = MiddlewareContext::new(entry.key, is_sync)
                .with_value(entry.value)
                .with_options(options);
            run_chain(&chain, &mut ctx, &step).await?;
        }
        let staged = step.into_staged();

        let (writes, deletes): (Vec<&Staged<T>>, Vec<&Staged<T>>) = staged.iter().partition(|s| s.raw.is_some());
        let writes: Vec<(String, String)> = writes
            .into_iter()
            .filter_map(|s| s.raw.as_ref().map(|raw| (self.namespaced(&s.key), raw.clone())))
            .collect();
        let deletes: Vec<String> = deletes.into_iter().map(|s| self.namespaced(&s.key)).collect();

        if !writes.is_empty() {
            db.batch_set(&writes).await.map_err(StoshError::from_backend)?;
        }
        if !deletes.is_empty() {
            db.batch_remove(&deletes).await.map_err(StoshError::from_backend)?;
        }

        for s in &staged {
            self.notifier.emit(&s.key, s.value.as_ref());
        }
        Ok(())
    }

    pub(super) async fn batch_get_entries<K: AsRef<str> + Sync>(
        &self,
        route: Route<'_>,
        keys: &[K],
        is_sync: bool,
    ) -> Result<Vec<Option<T>>> {
        let mut out = Vec::with_capacity(keys.len());
        let Route::Transactional(db) = route else {
            for key in keys {
                out.push(self.get_entry(route, key.as_ref(), is_sync).await?);
            }
            return Ok(out);
        };

        let full: Vec<String> = keys.iter().map(|k| self.namespaced(k.as_ref())).collect();
        let raws = db.batch_get(&full).await.map_err(StoshError::from_backend)?;
        for ((key, full), raw) in keys.iter().zip(&full).zip(raws) {
            let value = match raw {
                Some(raw) => self.decode_live(route, full, &raw).await?,
                None => None,
            };
            out.push(self.filter_read(route, key.as_ref(), value, is_sync).await?);
        }
        Ok(out)
    }

    pub(super) async fn batch_remove_entries<K: AsRef<str> + Sync>(
        &self,
        route: Route<'_>,
        keys: &[K],
        options: RemoveOptions,
        is_sync: bool,
    ) -> Result<()> {
        let Route::Transactional(db) = route else {
            for key in keys {
                self.remove_entry(route, key.as_ref(), options.clone(), is_sync).await?;
            }
            return Ok(());
        };

        let chain = self.middleware.snapshot(MiddlewareKind::Remove);
        let step = Step::new(self, route, Op::Stage);
        for key in keys {
            let options = SetOptions {
                expire: None,
                cookie: options.cookie.clone(),
            };
            let mut ctx = MiddlewareContext::new(key.as_ref(), is_sync).with_options(options);
            run_chain(&chain, &mut ctx, &step).await?;
        }
        let staged = step.into_staged();
        if staged.is_empty() {
            return Ok(());
        }

        let full: Vec<String> = staged.iter().map(|s| self.namespaced(&s.key)).collect();
        db.batch_remove(&full).await.map_err(StoshError::from_backend)?;
        for s in &staged {
            self.notifier.emit(&s.key, None);
        }
        Ok(())
    }
}
