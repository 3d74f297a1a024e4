use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

type Action = Box<dyn FnOnce() + Send>;

/// Handle returned by registrations (middleware, change listeners).
///
/// Calling [`Unsubscribe::unsubscribe`] removes exactly the registration it
/// was created for. Further calls do nothing. Dropping the handle keeps the
/// registration alive.
pub struct Unsubscribe {
    action: Mutex<Option<Action>>,
}

impl Unsubscribe {
    pub(crate) fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// A handle that has nothing to remove.
    pub fn noop() -> Self {
        Self {
            action: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        let action = self.action.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(action) = action {
            action();
        }
    }

    /// True once the registration has been removed (or never existed).
    pub fn is_spent(&self) -> bool {
        self.action.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

impl Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe").field("spent", &self.is_spent()).finish()
    }
}
