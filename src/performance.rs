//! Structured job lifecycle events.
//!
//! The orchestrator emits one [`PerformanceEventKind::JobStarted`] event when
//! a job first enters `Running` and one [`PerformanceEventKind::JobFinished`]
//! event when it reaches a terminal state. Events go to an [`EventSink`];
//! [`TracingSink`] logs them under the `jobrelay::performance` target with
//! the full event serialised as JSON in the `payload` field.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle point an event describes.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerformanceEventKind {
    /// The job entered `Running`.
    JobStarted,
    /// The job reached `Ok`, `Error` or `Deleted`.
    JobFinished,
}

impl PerformanceEventKind {
    /// Wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobStarted => "JOB_STARTED",
            Self::JobFinished => "JOB_FINISHED",
        }
    }
}

impl fmt::Display for PerformanceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle or performance record.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PerformanceEvent {
    /// Event kind.
    pub event: PerformanceEventKind,
    /// Orchestrator job identifier.
    pub job_id: String,
    /// Runner the job was dispatched to.
    pub runner: String,
    /// When the event was built.
    pub timestamp: DateTime<Utc>,
    /// Milliseconds between start and finish. Finish events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Command the job ran.
    pub command_line: String,
    /// Size in bytes of each collected output, keyed by local path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_sizes: BTreeMap<String, u64>,
    /// Terminal state name. Finish events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<String>,
}

impl PerformanceEvent {
    /// Builds a `JOB_STARTED` event stamped now.
    #[must_use]
    pub fn started(job_id: &str, runner: &str, command_line: &str) -> Self {
        Self {
            event: PerformanceEventKind::JobStarted,
            job_id: job_id.to_owned(),
            runner: runner.to_owned(),
            timestamp: Utc::now(),
            duration_ms: None,
            command_line: command_line.to_owned(),
            output_sizes: BTreeMap::new(),
            final_state: None,
        }
    }

    /// Builds a `JOB_FINISHED` event stamped now.
    ///
    /// The duration is measured from `started_at`; a clock that went
    /// backwards yields zero.
    #[must_use]
    pub fn finished(
        job: &JobSummary<'_>,
        started_at: DateTime<Utc>,
        output_sizes: BTreeMap<String, u64>,
        final_state: &str,
    ) -> Self {
        let timestamp = Utc::now();
        let elapsed = timestamp.signed_duration_since(started_at).num_milliseconds();
        Self {
            event: PerformanceEventKind::JobFinished,
            job_id: job.job_id.to_owned(),
            runner: job.runner.to_owned(),
            timestamp,
            duration_ms: Some(u64::try_from(elapsed).unwrap_or(0)),
            command_line: job.command_line.to_owned(),
            output_sizes,
            final_state: Some(final_state.to_owned()),
        }
    }

    /// Sum of all recorded output sizes.
    #[must_use]
    pub fn total_output_bytes(&self) -> u64 {
        self.output_sizes.values().sum()
    }
}

/// Identity of the job an event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobSummary<'a> {
    /// Orchestrator job identifier.
    pub job_id: &'a str,
    /// Runner name.
    pub runner: &'a str,
    /// Command the job ran.
    pub command_line: &'a str,
}

/// Destination for performance events.
pub trait EventSink: Send + Sync {
    /// Records one event. Must not block.
    fn record(&self, event: &PerformanceEvent);
}

/// Logs events through `tracing` at `INFO`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &PerformanceEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        tracing::info!(
            target: "jobrelay::performance",
            event = event.event.as_str(),
            job_id = %event.job_id,
            runner = %event.runner,
            duration_ms = ?event.duration_ms,
            output_bytes = event.total_output_bytes(),
            final_state = ?event.final_state,
            command_line = %event.command_line,
            %payload,
            "{}",
            event.event
        );
    }
}

/// Builds events and hands them to a sink.
#[derive(Clone)]
pub struct PerformanceLogger {
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for PerformanceLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceLogger").finish_non_exhaustive()
    }
}

impl Default for PerformanceLogger {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl PerformanceLogger {
    /// Creates a logger writing to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Records `JOB_STARTED` and returns the event's timestamp, which the
    /// caller keeps to measure the duration at finish.
    pub fn job_started(&self, job: &JobSummary<'_>) -> DateTime<Utc> {
        let event = PerformanceEvent::started(job.job_id, job.runner, job.command_line);
        self.sink.record(&event);
        event.timestamp
    }

    /// Records `JOB_FINISHED`.
    pub fn job_finished(
        &self,
        job: &JobSummary<'_>,
        started_at: DateTime<Utc>,
        output_sizes: BTreeMap<String, u64>,
        final_state: &str,
    ) {
        let event = PerformanceEvent::finished(job, started_at, output_sizes, final_state);
        self.sink.record(&event);
    }
}

/// Reads the size of every existing file in `paths`. Missing files are
/// skipped.
pub async fn measure_outputs<'a, I>(paths: I) -> BTreeMap<String, u64>
where
    I: IntoIterator<Item = &'a Utf8Path>,
{
    let mut sizes = BTreeMap::new();
    for path in paths {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {
                sizes.insert(path.to_string(), metadata.len());
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(path = %path, error = %err, "output missing when measuring size");
            }
        }
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemorySink;
    use chrono::Duration;
    use rstest::{fixture, rstest};

    const JOB: JobSummary<'static> = JobSummary {
        job_id: "job-1",
        runner: "cluster",
        command_line: "bwa mem ref.fa reads.fq",
    };

    #[fixture]
    fn sink() -> MemorySink {
        MemorySink::new()
    }

    #[rstest]
    fn started_event_carries_identity(sink: MemorySink) {
        let logger = PerformanceLogger::new(Arc::new(sink.clone()));

        let started_at = logger.job_started(&JOB);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = events.first().expect("one event");
        assert_eq!(event.event, PerformanceEventKind::JobStarted);
        assert_eq!(event.job_id, "job-1");
        assert_eq!(event.timestamp, started_at);
        assert_eq!(event.duration_ms, None);
    }

    #[rstest]
    fn finished_event_measures_duration_and_outputs(sink: MemorySink) {
        let logger = PerformanceLogger::new(Arc::new(sink.clone()));
        let started_at = Utc::now() - Duration::milliseconds(1500);
        let sizes = BTreeMap::from([
            (String::from("/out/a.bam"), 100),
            (String::from("/out/b.log"), 23),
        ]);

        logger.job_finished(&JOB, started_at, sizes, "ok");

        let events = sink.events();
        let event = events.first().expect("one event");
        assert_eq!(event.event, PerformanceEventKind::JobFinished);
        assert!(event.duration_ms.is_some_and(|ms| ms >= 1500), "{event:?}");
        assert_eq!(event.total_output_bytes(), 123);
        assert_eq!(event.final_state.as_deref(), Some("ok"));
        assert_eq!(event.command_line, "bwa mem ref.fa reads.fq");
    }

    #[rstest]
    fn future_start_time_yields_zero_duration() {
        let event =
            PerformanceEvent::finished(&JOB, Utc::now() + Duration::hours(1), BTreeMap::new(), "ok");
        assert_eq!(event.duration_ms, Some(0));
    }

    #[rstest]
    fn events_serialise_with_wire_names() {
        let event = PerformanceEvent::started("j", "r", "true");
        let json = serde_json::to_value(&event).expect("serialise");
        assert_eq!(json["event"], "JOB_STARTED");
        assert!(json.get("duration_ms").is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn measure_outputs_skips_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let present = camino::Utf8PathBuf::from_path_buf(dir.path().join("out.txt"))
            .expect("utf8 temp path");
        std::fs::write(&present, b"12345").expect("write output");
        let missing = present.with_file_name("missing.txt");

        let sizes = measure_outputs([present.as_path(), missing.as_path()]).await;

        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes.get(present.as_str()), Some(&5));
    }
}
