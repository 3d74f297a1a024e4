/// Errors produced by a [`Stosh`](crate::Stosh) instance and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoshError {
    #[error("[stosh] Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("[stosh] {0}")]
    Validation(String),

    #[error("[stosh] Codec error: {0}")]
    Codec(String),

    #[error("[stosh] Backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("[stosh] Quota exceeded for key '{key}': {size} bytes > {limit} bytes")]
    QuotaExceeded { key: String, size: usize, limit: usize },

    #[error("[stosh] Middleware error: {0}")]
    Middleware(String),

    #[error("[stosh] next() called multiple times in middleware")]
    NextCalledTwice,

    #[error("[stosh] {method} is not supported with IndexedDB storage.")]
    SyncNotSupported { method: &'static str },

    #[error("[stosh] A middleware suspended during {method}; synchronous calls cannot await")]
    Suspended { method: &'static str },
}

impl StoshError {
    /// Wraps an arbitrary error raised inside a middleware.
    pub fn middleware(err: impl std::fmt::Display) -> Self {
        StoshError::Middleware(err.to_string())
    }

    /// Converts a driver error, keeping a [`StoshError`] raised by the driver
    /// itself (e.g. [`StoshError::QuotaExceeded`]).
    pub(crate) fn from_backend(err: anyhow::Error) -> Self {
        match err.downcast::<StoshError>() {
            Ok(e) => e,
            Err(e) => StoshError::Backend(e),
        }
    }
}

pub type Result<T, E = StoshError> = std::result::Result<T, E>;
