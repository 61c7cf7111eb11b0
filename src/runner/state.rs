//! Job states, legal transitions, and the append-only history.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a job.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet routed.
    New,
    /// Handed to a backend, waiting to start.
    Queued,
    /// Executing.
    Running,
    /// Finished and outputs collected.
    Ok,
    /// Failed; the history holds the diagnostic.
    Error,
    /// Cancellation in progress.
    Deleting,
    /// Cancelled.
    Deleted,
    /// Held by the backend or an operator.
    Paused,
}

impl JobState {
    /// Lower-case name used in history and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Paused => "paused",
        }
    }

    /// `Ok`, `Error` and `Deleted` admit no automatic transition.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Deleted)
    }

    /// States a poll should still probe.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }

    /// Whether the orchestrator may move from `self` to `next` on its own.
    ///
    /// A paused job moves on when the backend reports it running or
    /// finished; returning it to `Queued` is left to an operator.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::New, Self::Queued | Self::Paused | Self::Error)
            | (Self::Queued, Self::Running | Self::Ok | Self::Error | Self::Paused)
            | (Self::Paused | Self::Running, Self::Ok | Self::Error)
            | (Self::Paused, Self::Running)
            | (Self::Deleting, Self::Deleted) => true,
            (Self::New | Self::Queued | Self::Running | Self::Paused, Self::Deleting) => true,
            _ => false,
        }
    }

    /// Whether an operator may move from `self` to `next`.
    #[must_use]
    pub const fn can_operator_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Error | Self::Paused, Self::Queued)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a transition is not allowed.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("illegal job state transition from {from} to {to}")]
pub struct TransitionError {
    /// Current state.
    pub from: JobState,
    /// Requested state.
    pub to: JobState,
}

/// One recorded transition.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// State entered.
    pub state: JobState,
    /// When it was entered.
    pub timestamp: DateTime<Utc>,
    /// Diagnostic or context for the transition.
    pub info: Option<String>,
}

/// Append-only log of a job's transitions.
///
/// The first entry is always `New`. Entries can only be added through
/// [`JobStateHistory::transition`] and friends, which enforce the transition
/// rules.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct JobStateHistory {
    entries: Vec<HistoryEntry>,
}

impl Default for JobStateHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStateHistory {
    /// Starts a history in `New`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![HistoryEntry {
                state: JobState::New,
                timestamp: Utc::now(),
                info: None,
            }],
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> JobState {
        self.entries
            .last()
            .map_or(JobState::New, |entry| entry.state)
    }

    /// All entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// The sequence of states entered.
    #[must_use]
    pub fn states(&self) -> Vec<JobState> {
        self.entries.iter().map(|entry| entry.state).collect()
    }

    /// Most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Records an automatic transition.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when `next` is not reachable from the
    /// current state.
    pub fn transition(&mut self, next: JobState, info: Option<String>) -> Result<(), TransitionError> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(TransitionError {
                from: current,
                to: next,
            });
        }
        self.push(next, info);
        Ok(())
    }

    /// Records an operator transition (`Error → Queued`, `Paused → Queued`).
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] for any other pair.
    pub fn operator_transition(
        &mut self,
        next: JobState,
        info: Option<String>,
    ) -> Result<(), TransitionError> {
        let current = self.current();
        if !current.can_operator_transition_to(next) {
            return Err(TransitionError {
                from: current,
                to: next,
            });
        }
        self.push(next, info);
        Ok(())
    }

    fn push(&mut self, state: JobState, info: Option<String>) {
        self.entries.push(HistoryEntry {
            state,
            timestamp: Utc::now(),
            info,
        });
    }
}
