//! Per-file outcomes of output collection.

use camino::{Utf8Path, Utf8PathBuf};

use super::ClientError;

/// Outcome of downloading one manifest output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputOutcome {
    /// Local destination.
    pub path: Utf8PathBuf,
    /// Path relative to the remote job directory.
    pub remote_path: String,
    /// Whether the download succeeded.
    pub result: Result<(), ClientError>,
}

impl OutputOutcome {
    /// Returns `true` when the file was collected.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Every outcome of a collection pass, in manifest order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionReport {
    outcomes: Vec<OutputOutcome>,
}

impl CollectionReport {
    pub(crate) fn push(&mut self, outcome: OutputOutcome) {
        self.outcomes.push(outcome);
    }

    /// All outcomes.
    #[must_use]
    pub fn outcomes(&self) -> &[OutputOutcome] {
        &self.outcomes
    }

    /// Number of outcomes, equal to the number of manifest outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns `true` when the manifest had no outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Number of collected files.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.is_success()).count()
    }

    /// Outcomes that failed.
    pub fn failures(&self) -> impl Iterator<Item = &OutputOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_success())
    }

    /// Returns `true` when at least one output was not collected.
    #[must_use]
    pub fn is_partial_failure(&self) -> bool {
        self.failures().next().is_some()
    }

    /// Local paths of the collected files.
    pub fn collected_paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_success())
            .map(|outcome| outcome.path.as_path())
    }

    /// One line per failed output: `<remote path>: <error>`.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|outcome| {
                let reason = outcome
                    .result
                    .as_ref()
                    .err()
                    .map_or_else(String::new, ToString::to_string);
                format!("{}: {reason}", outcome.remote_path)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
