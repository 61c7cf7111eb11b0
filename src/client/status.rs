//! Remote status vocabulary.

use serde::{Deserialize, Serialize};

use crate::runner::JobState;

/// Result of one status probe.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteStatus {
    /// Mapped state.
    pub state: JobState,
    /// Server-supplied detail, or the raw text of an unrecognised state.
    pub info: Option<String>,
}

impl RemoteStatus {
    /// Maps a server status string. Unknown strings become `Error` with the
    /// raw text preserved in `info`.
    #[must_use]
    pub fn from_remote(raw: &str, info: Option<String>) -> Self {
        let state = match raw.trim().to_ascii_lowercase().as_str() {
            "new" | "queued" | "preprocessing" => JobState::Queued,
            "running" => JobState::Running,
            "complete" | "ok" | "finished" => JobState::Ok,
            "failed" | "error" => JobState::Error,
            "cancelled" | "deleted" => JobState::Deleted,
            "paused" => JobState::Paused,
            _ => {
                return Self {
                    state: JobState::Error,
                    info: Some(format!("unrecognized remote state: {raw}")),
                };
            }
        };
        Self { state, info }
    }
}

/// Wire form of `GET /jobs/{id}/status`.
#[derive(Debug, Deserialize)]
pub(super) struct StatusResponse {
    pub(super) status: String,
    #[serde(default)]
    pub(super) info: Option<String>,
}
