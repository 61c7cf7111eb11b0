//! Error types for dispatch and the orchestrator API.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use super::{JobId, JobState, TransitionError};
use crate::client::ClientError;
use crate::config::ConfigError;
use crate::drmaa::DrmaaError;
use crate::environment::EnvironmentError;
use crate::transport::TransportError;

/// Coarse category of a dispatch failure, recorded in job history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A required binary or native library is missing.
    BackendUnavailable,
    /// The failure may clear on a later attempt.
    Transient,
    /// The backend refused the job.
    Submission,
    /// Anything else.
    Fatal,
}

impl ErrorClass {
    /// Name used as the prefix of history info strings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BackendUnavailable => "backend_unavailable",
            Self::Transient => "transient",
            Self::Submission => "submission",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by backends while running a job.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The remote job client failed.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// The DRMAA session failed.
    #[error(transparent)]
    Drmaa(#[from] DrmaaError),
    /// A transport could not be built or used.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Runner configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An environment statement could not be rendered.
    #[error("invalid environment: {0}")]
    Environment(#[from] EnvironmentError),
    /// The destination names no registered runner.
    #[error("unknown runner: {0}")]
    UnknownRunner(String),
    /// The backend has no record of the external job.
    #[error("unknown external job: {0}")]
    UnknownExternalJob(String),
    /// The job cannot run on this backend as described.
    #[error("invalid job: {0}")]
    InvalidJob(String),
    /// A local file could not be written or a process spawned.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// A backend call did not finish in time.
    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        /// Call that timed out.
        operation: &'static str,
        /// Bound that was exceeded.
        timeout: Duration,
    },
    /// Some outputs could not be collected.
    #[error("output collection failed: {0}")]
    PartialCollection(String),
}

impl DispatchError {
    /// Classifies the failure.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Client(err) if err.is_backend_unavailable() => ErrorClass::BackendUnavailable,
            Self::Client(ClientError::Submission { .. }) => ErrorClass::Submission,
            Self::Client(err) if err.is_retryable() => ErrorClass::Transient,
            Self::Drmaa(err) if err.is_backend_unavailable() => ErrorClass::BackendUnavailable,
            Self::Drmaa(DrmaaError::Native {
                call: "drmaa_run_job",
                ..
            }) => ErrorClass::Submission,
            Self::Transport(err) if err.is_backend_unavailable() => ErrorClass::BackendUnavailable,
            Self::Transport(err) if err.is_retryable() => ErrorClass::Transient,
            Self::Timeout { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// History info string: `<class>: <message>`.
    #[must_use]
    pub fn history_info(&self) -> String {
        format!("{}: {self}", self.class())
    }

    pub(crate) fn io(path: impl Into<Utf8PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors returned to callers of [`super::JobRunner`] for misuse. Per-job
/// failures are recorded in history instead.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// No job has this id.
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
    /// The action does not apply in the job's current state.
    #[error("cannot {action} job {job_id} in state {state}")]
    InvalidAction {
        /// Job acted on.
        job_id: JobId,
        /// State the job was in.
        state: JobState,
        /// Requested action.
        action: &'static str,
    },
    /// An operator transition was refused.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}
