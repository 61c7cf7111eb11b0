//! Error types for the remote job client.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors raised while talking to a remote job server.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClientError {
    /// Staging a file failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The server refused the submission.
    #[error("job submission rejected (status {status}): {message}")]
    Submission {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// A control or status request returned an error status.
    #[error("API error (status {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The request could not be sent or its response not read.
    #[error("request failed: {0}")]
    Request(String),
    /// A manifest path cannot be mapped to a remote location.
    #[error("invalid staging path: {0}")]
    InvalidPath(String),
    /// The client settings are unusable.
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns `true` when a later attempt may succeed: transient transfer
    /// failures, connection errors, timeouts, and 5xx responses.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retryable(),
            Self::Request(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Submission { .. } | Self::InvalidPath(_) | Self::Config(_) => false,
        }
    }

    /// Returns `true` when a required binary or library is missing.
    #[must_use]
    pub const fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_backend_unavailable())
    }

    pub(crate) fn request(err: &reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}
