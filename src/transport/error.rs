//! Error types for transport strategies.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::command::CommandError;

/// Errors raised while moving bytes between hosts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when an optional binary or native library is missing. Never
    /// retried.
    #[error("backend unavailable: {backend}: {reason}")]
    BackendUnavailable {
        /// Strategy or program that could not be used.
        backend: String,
        /// Why the backend is unusable.
        reason: String,
    },
    /// Raised for non-2xx responses, connection failures, timeouts, and
    /// non-zero subprocess exits. Eligible for retry.
    #[error("transient transport error for {url}: {reason}")]
    Transient {
        /// Location being transferred.
        url: String,
        /// Failure description, including any status or exit code.
        reason: String,
    },
    /// Raised when a request cannot be expressed by the chosen strategy.
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),
    /// Raised when a local file cannot be read or written.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Local path involved in the transfer.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

impl TransportError {
    /// Returns `true` when the failure may succeed on a later attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns `true` when the failure stems from a missing dependency.
    #[must_use]
    pub const fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    pub(crate) fn transient(url: &str, reason: impl Into<String>) -> Self {
        Self::Transient {
            url: url.to_owned(),
            reason: reason.into(),
        }
    }

    /// Maps a helper process that could not be started. Only a missing
    /// executable makes the backend unavailable; other spawn failures, such
    /// as process or descriptor limits, may clear.
    pub(crate) fn from_command(backend: &str, location: &str, err: &CommandError) -> Self {
        match err {
            CommandError::NotFound { .. } => Self::BackendUnavailable {
                backend: backend.to_owned(),
                reason: err.to_string(),
            },
            CommandError::Spawn { .. } => Self::transient(location, err.to_string()),
        }
    }

    pub(crate) fn io(path: impl Into<Utf8PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
