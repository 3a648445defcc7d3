use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Coarse classification of a provider failure.
///
/// Providers decide the kind when they build the error. The cache only looks at the kind
/// to decide whether a retry is worth it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ErrorKind {
    /// Network failures, timeouts, overloaded upstreams. Worth retrying.
    Transient,
    /// Validation failures, missing resources, undecodable payloads.
    Permanent,
    /// Authentication or authorization was refused.
    Auth,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed when attempted again
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Auth => write!(f, "auth"),
        }
    }
}

/// Error returned by a [`DataProvider`](crate::data_providers::data_provider::DataProvider)
/// or [`DataWriter`](crate::data_providers::data_provider::DataWriter).
#[derive(Debug, Error)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl ProviderError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ProviderError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a [`ErrorKind::Transient`] error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Shorthand for a [`ErrorKind::Permanent`] error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// Shorthand for a [`ErrorKind::Auth`] error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    /// Error produced when an attempt exceeded the configured fetch timeout
    pub fn timeout(after: Duration) -> Self {
        Self::transient(format!("fetch timed out after {}ms", after.as_millis()))
    }

    /// Attach the underlying cause
    pub fn with_source(mut self, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Clonable record of the last failure, retained inside cache entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Wall-clock time of the failure
    pub at: SystemTime,
}

impl From<&ProviderError> for ErrorInfo {
    fn from(value: &ProviderError) -> Self {
        ErrorInfo {
            kind: value.kind,
            message: value.to_string(),
            at: SystemTime::now(),
        }
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Errors surfaced by [`RemoteCache`](crate::cache::RemoteCache) operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("fetch failed: {0}")]
    Provider(ErrorInfo),

    #[error("fetching is disabled for this cache")]
    Disabled,

    /// The entry was removed or evicted while the caller was waiting on it.
    #[error("cache entry was detached while waiting for a fetch")]
    Detached,
}

/// Errors raised by a local preference mirror.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "json")]
    #[error("mirror serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}
