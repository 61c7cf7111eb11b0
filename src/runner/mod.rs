//! Job orchestration.
//!
//! [`JobRunner`] owns one record per job: the descriptor, the append-only
//! [`JobStateHistory`], and the backend the job was dispatched to. A job
//! moves `New → Queued` when its destination resolves, stays `Queued` while
//! the backend stages and submits it, then follows what status probes report
//! until it reaches `Ok`, `Error` or `Deleted`. Per-job failures never
//! surface as `Err`; they are recorded in history with an
//! [`ErrorClass`] prefix. Every terminal state emits `JOB_FINISHED`, and a
//! job that reached a backend is cleaned up there afterwards.
//!
//! Records sit behind their own mutex so a slow backend call on one job
//! never blocks another. [`JobRunner::poll_all`] fans probes out across a
//! semaphore sized by `max_workers`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::drmaa::DrmaaSessionFactory;
use crate::performance::{JobSummary, PerformanceLogger, measure_outputs};
use crate::transport::RemoteCopyConfig;

mod backend;
mod drmaa;
mod error;
mod job;
mod local;
mod registry;
mod remote;
mod state;

pub use backend::{BackendStatus, CollectFuture, DispatchFuture, JobBackend};
pub use drmaa::{DrmaaBackend, NATIVE_SPECIFICATION_PARAM, map_status};
pub use error::{DispatchError, ErrorClass, RunnerError};
pub use job::{Destination, FileManifest, JobDescriptor, JobId, ResourceRequest, StagedFile};
pub use local::LocalBackend;
pub use registry::{BackendContext, BackendRegistry};
pub use remote::RemoteBackend;
pub use state::{HistoryEntry, JobState, JobStateHistory, TransitionError};

/// A state change pushed to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdate {
    /// Job that changed.
    pub job_id: JobId,
    /// State entered.
    pub state: JobState,
    /// Info recorded with the transition.
    pub info: Option<String>,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Tuning for [`JobRunner`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Concurrent dispatches and probes.
    pub max_workers: usize,
    /// Consecutive failed probes tolerated before a job ends `Error`.
    pub max_retries: u32,
    /// Bound on one status probe or cancel request.
    pub probe_timeout: Duration,
    /// Delay between passes of [`JobRunner::run`].
    pub poll_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_retries: 3,
            probe_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&DispatchConfig> for RunnerOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            max_retries: config.max_retries,
            probe_timeout: config.probe_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

struct JobRecord {
    descriptor: JobDescriptor,
    history: JobStateHistory,
    backend: Option<Arc<dyn JobBackend>>,
    probe_failures: u32,
    submitted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn new(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            history: JobStateHistory::new(),
            backend: None,
            probe_failures: 0,
            submitted_at: None,
            started_at: None,
        }
    }

    fn is_pending(&self) -> bool {
        match self.history.current() {
            JobState::New => true,
            JobState::Queued => self.descriptor.external_job_id.is_none(),
            _ => false,
        }
    }

    fn is_probeable(&self) -> bool {
        self.history.current().is_active() && self.descriptor.external_job_id.is_some()
    }
}

struct RunnerInner {
    registry: BackendRegistry,
    options: RunnerOptions,
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
    workers: Arc<Semaphore>,
    performance: PerformanceLogger,
    updates: std::sync::Mutex<Option<mpsc::Sender<StateUpdate>>>,
}

/// Dispatches jobs to backends and tracks them to a terminal state.
///
/// Cloning shares the same job table.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("registry", &self.inner.registry)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    /// Creates a runner over `registry`.
    #[must_use]
    pub fn new(
        registry: BackendRegistry,
        options: RunnerOptions,
        performance: PerformanceLogger,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                registry,
                options,
                jobs: RwLock::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(options.max_workers.max(1))),
                performance,
                updates: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Builds a runner from process settings: loads the runner table named
    /// by `runners_file` and creates the native DRMAA factory, which loads
    /// nothing until a DRMAA job is dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] when the settings or runner table
    /// are invalid, or a backend construction failure.
    pub fn from_config(
        config: &DispatchConfig,
        remote_copy: RemoteCopyConfig,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let runners = config.load_runners()?.unwrap_or_default();
        let drmaa = DrmaaSessionFactory::native(config.drmaa_contact.clone());
        let context = BackendContext::from_config(config, remote_copy, drmaa);
        let registry = BackendRegistry::from_config(&runners, context)?;
        Ok(Self::new(
            registry,
            RunnerOptions::from(config),
            PerformanceLogger::default(),
        ))
    }

    /// Starts pushing state updates into a channel of `capacity` slots,
    /// replacing any earlier subscriber. Updates are dropped while the
    /// channel is full.
    #[must_use]
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<StateUpdate> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        *self
            .inner
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
        receiver
    }

    /// Adds a job in `New`.
    pub async fn enqueue(&self, descriptor: JobDescriptor) -> JobId {
        let id = JobId::new();
        let record = JobRecord::new(descriptor);
        if let Some(entry) = record.history.last() {
            self.publish(id, entry);
        }
        tracing::debug!(job_id = %id, runner = %record.descriptor.destination.runner, "job enqueued");
        self.inner
            .jobs
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(record)));
        id
    }

    /// Resolves the destination and submits the job.
    ///
    /// Returns the state afterwards: `Queued` on success, `Error` when the
    /// destination is unknown or staging or submission failed.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnknownJob`] or, when the job was already
    /// submitted, [`RunnerError::InvalidAction`].
    pub async fn dispatch(&self, id: JobId) -> Result<JobState, RunnerError> {
        let record = self.record(id).await?;
        let mut job = record.lock().await;
        if !job.is_pending() {
            return Err(RunnerError::InvalidAction {
                job_id: id,
                state: job.history.current(),
                action: "dispatch",
            });
        }

        let backend = match self.inner.registry.resolve(&job.descriptor.destination) {
            Ok(backend) => backend,
            Err(err) => {
                self.fail(id, &mut job, &err).await;
                return Ok(job.history.current());
            }
        };
        if job.history.current() == JobState::New {
            let info = format!("runner {}", job.descriptor.destination.runner);
            self.advance(id, &mut job, JobState::Queued, Some(info));
        }

        let submitted = backend.submit(&job.descriptor).await;
        match submitted {
            Ok(external_id) => {
                tracing::info!(
                    job_id = %id,
                    external_job_id = %external_id,
                    backend = backend.name(),
                    "job submitted"
                );
                job.descriptor.external_job_id = Some(external_id);
                job.backend = Some(backend);
                job.submitted_at = Some(Utc::now());
            }
            Err(err) => self.fail(id, &mut job, &err).await,
        }
        Ok(job.history.current())
    }

    /// Probes the job once and applies the reported state.
    ///
    /// Jobs that are terminal, cancelled, or not yet submitted are left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnknownJob`].
    pub async fn poll(&self, id: JobId) -> Result<JobState, RunnerError> {
        let record = self.record(id).await?;
        let mut job = record.lock().await;
        if !job.is_probeable() {
            return Ok(job.history.current());
        }
        let (Some(backend), Some(external_id)) =
            (job.backend.clone(), job.descriptor.external_job_id.clone())
        else {
            return Ok(job.history.current());
        };

        let timeout = self.inner.options.probe_timeout;
        let probe = tokio::time::timeout(timeout, backend.check_status(&external_id))
            .await
            .unwrap_or(Err(DispatchError::Timeout {
                operation: "status probe",
                timeout,
            }));
        match probe {
            Ok(status) => {
                job.probe_failures = 0;
                self.apply(id, &mut job, backend.as_ref(), &external_id, status)
                    .await;
            }
            Err(err) => self.probe_failed(id, &mut job, &err).await,
        }
        Ok(job.history.current())
    }

    /// Dispatches every job waiting for submission. Returns how many were
    /// attempted.
    pub async fn dispatch_pending(&self) -> usize {
        let ids = self.select(JobRecord::is_pending).await;
        self.fan_out(ids, |runner, id| async move {
            if let Err(err) = runner.dispatch(id).await {
                tracing::debug!(job_id = %id, error = %err, "skipped dispatch");
            }
        })
        .await
    }

    /// Probes every submitted, active job concurrently, at most
    /// `max_workers` at a time. Returns how many were probed.
    pub async fn poll_all(&self) -> usize {
        let ids = self.select(JobRecord::is_probeable).await;
        self.fan_out(ids, |runner, id| async move {
            if let Err(err) = runner.poll(id).await {
                tracing::debug!(job_id = %id, error = %err, "skipped poll");
            }
        })
        .await
    }

    /// Dispatches and polls every `poll_interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = u64::try_from(self.inner.options.poll_interval.as_millis())
                .unwrap_or(u64::MAX),
            max_workers = self.inner.options.max_workers,
            "job runner started"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch_pending().await;
                    self.poll_all().await;
                }
            }
        }
        tracing::info!("job runner stopped");
    }

    /// Cancels the job: `Deleting`, a best-effort backend cancel, then
    /// `Deleted`. Outputs are never collected afterwards.
    ///
    /// Terminal jobs are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnknownJob`].
    pub async fn cancel(&self, id: JobId) -> Result<JobState, RunnerError> {
        let record = self.record(id).await?;
        let mut job = record.lock().await;
        let current = job.history.current();
        if current.is_terminal() {
            return Ok(current);
        }
        if !self.advance(
            id,
            &mut job,
            JobState::Deleting,
            Some(String::from("cancellation requested")),
        ) {
            return Err(RunnerError::InvalidAction {
                job_id: id,
                state: current,
                action: "cancel",
            });
        }

        if let (Some(backend), Some(external_id)) =
            (job.backend.clone(), job.descriptor.external_job_id.clone())
        {
            let timeout = self.inner.options.probe_timeout;
            match tokio::time::timeout(timeout, backend.cancel(&external_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(job_id = %id, error = %err, "backend cancel failed");
                }
                Err(_) => {
                    tracing::warn!(job_id = %id, timeout_secs = timeout.as_secs(), "backend cancel timed out");
                }
            }
        }
        self.advance(id, &mut job, JobState::Deleted, None);
        self.finish(id, &job, BTreeMap::new()).await;
        Ok(job.history.current())
    }

    /// Operator resubmission of a failed job: `Error → Queued`. The job is
    /// submitted afresh by the next [`JobRunner::dispatch`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::InvalidAction`] unless the job is in `Error`.
    pub async fn resubmit(&self, id: JobId) -> Result<(), RunnerError> {
        let record = self.record(id).await?;
        let mut job = record.lock().await;
        let current = job.history.current();
        if current != JobState::Error {
            return Err(RunnerError::InvalidAction {
                job_id: id,
                state: current,
                action: "resubmit",
            });
        }
        job.history
            .operator_transition(JobState::Queued, Some(String::from("resubmitted by operator")))?;
        job.descriptor.external_job_id = None;
        job.backend = None;
        job.probe_failures = 0;
        job.submitted_at = None;
        job.started_at = None;
        self.operator_changed(id, &job);
        Ok(())
    }

    /// Operator resume of a paused job: `Paused → Queued`. A submitted job
    /// keeps its backend and is probed again.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::InvalidAction`] unless the job is `Paused`.
    pub async fn resume(&self, id: JobId) -> Result<(), RunnerError> {
        let record = self.record(id).await?;
        let mut job = record.lock().await;
        let current = job.history.current();
        if current != JobState::Paused {
            return Err(RunnerError::InvalidAction {
                job_id: id,
                state: current,
                action: "resume",
            });
        }
        job.history
            .operator_transition(JobState::Queued, Some(String::from("resumed by operator")))?;
        job.probe_failures = 0;
        self.operator_changed(id, &job);
        Ok(())
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnknownJob`].
    pub async fn state(&self, id: JobId) -> Result<JobState, RunnerError> {
        let record = self.record(id).await?;
        let job = record.lock().await;
        Ok(job.history.current())
    }

    /// Snapshot of the history.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnknownJob`].
    pub async fn history(&self, id: JobId) -> Result<JobStateHistory, RunnerError> {
        let record = self.record(id).await?;
        let job = record.lock().await;
        Ok(job.history.clone())
    }

    /// Snapshot of the descriptor, including the external id once
    /// submitted.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnknownJob`].
    pub async fn descriptor(&self, id: JobId) -> Result<JobDescriptor, RunnerError> {
        let record = self.record(id).await?;
        let job = record.lock().await;
        Ok(job.descriptor.clone())
    }

    async fn record(&self, id: JobId) -> Result<Arc<Mutex<JobRecord>>, RunnerError> {
        self.inner
            .jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RunnerError::UnknownJob(id))
    }

    /// Ids of jobs matching `filter`. Jobs busy in another call are skipped.
    async fn select(&self, filter: fn(&JobRecord) -> bool) -> Vec<JobId> {
        let jobs = self.inner.jobs.read().await;
        let mut ids: Vec<JobId> = jobs
            .iter()
            .filter(|(_, record)| record.try_lock().is_ok_and(|job| filter(&job)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    async fn fan_out<F, Fut>(&self, ids: Vec<JobId>, task: F) -> usize
    where
        F: Fn(Self, JobId) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let count = ids.len();
        let mut tasks = JoinSet::new();
        for id in ids {
            let workers = Arc::clone(&self.inner.workers);
            let work = task(self.clone(), id);
            tasks.spawn(async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    return;
                };
                work.await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "job worker task failed");
            }
        }
        count
    }

    async fn apply(
        &self,
        id: JobId,
        job: &mut JobRecord,
        backend: &dyn JobBackend,
        external_id: &str,
        status: BackendStatus,
    ) {
        let Some(next) = status.state else {
            tracing::debug!(job_id = %id, "backend status undetermined");
            return;
        };
        if next == job.history.current() {
            return;
        }
        match next {
            JobState::Running => {
                self.start(id, job, status.info);
            }
            JobState::Ok => self.complete(id, job, backend, external_id, status.info).await,
            JobState::Error => {
                let info = status
                    .info
                    .unwrap_or_else(|| String::from("job failed on backend"));
                if self.advance(id, job, JobState::Error, Some(info)) {
                    self.finish(id, job, BTreeMap::new()).await;
                }
            }
            JobState::Deleted => {
                if self.advance(
                    id,
                    job,
                    JobState::Deleting,
                    Some(String::from("cancelled by backend")),
                ) {
                    self.advance(id, job, JobState::Deleted, status.info);
                    self.finish(id, job, BTreeMap::new()).await;
                }
            }
            other => {
                self.advance(id, job, other, status.info);
            }
        }
    }

    async fn complete(
        &self,
        id: JobId,
        job: &mut JobRecord,
        backend: &dyn JobBackend,
        external_id: &str,
        info: Option<String>,
    ) {
        // Completion always passes through Running.
        let current = job.history.current();
        if current != JobState::Running && !self.start(id, job, None) {
            tracing::warn!(job_id = %id, from = %current, "ignoring completion report");
            return;
        }
        let report = backend
            .collect_outputs(external_id, &job.descriptor.manifest)
            .await;
        let sizes = measure_outputs(report.collected_paths()).await;
        if report.is_partial_failure() {
            let err = DispatchError::PartialCollection(report.failure_summary());
            tracing::warn!(
                job_id = %id,
                collected = report.success_count(),
                expected = report.len(),
                "output collection incomplete"
            );
            self.advance(id, job, JobState::Error, Some(err.history_info()));
        } else {
            self.advance(id, job, JobState::Ok, info);
        }
        self.finish(id, job, sizes).await;
    }

    /// Records `Running` and emits `JOB_STARTED`.
    fn start(&self, id: JobId, job: &mut JobRecord, info: Option<String>) -> bool {
        if !self.advance(id, job, JobState::Running, info) {
            return false;
        }
        let job_id = id.to_string();
        let started_at = self.inner.performance.job_started(&summary(&job_id, job));
        job.started_at = Some(started_at);
        true
    }

    async fn probe_failed(&self, id: JobId, job: &mut JobRecord, err: &DispatchError) {
        job.probe_failures = job.probe_failures.saturating_add(1);
        let limit = self.inner.options.max_retries.max(1);
        if err.class() == ErrorClass::BackendUnavailable || job.probe_failures >= limit {
            let info = format!(
                "{}: status probe failed {} consecutive times: {err}",
                err.class(),
                job.probe_failures
            );
            if self.advance(id, job, JobState::Error, Some(info)) {
                self.finish(id, job, BTreeMap::new()).await;
            }
            return;
        }
        tracing::warn!(
            job_id = %id,
            failures = job.probe_failures,
            limit,
            error = %err,
            "status probe failed"
        );
    }

    async fn fail(&self, id: JobId, job: &mut JobRecord, err: &DispatchError) {
        tracing::warn!(job_id = %id, class = %err.class(), error = %err, "job dispatch failed");
        if self.advance(id, job, JobState::Error, Some(err.history_info())) {
            self.finish(id, job, BTreeMap::new()).await;
        }
    }

    /// Records an automatic transition. Reports the history does not allow
    /// are logged and dropped.
    fn advance(&self, id: JobId, job: &mut JobRecord, next: JobState, info: Option<String>) -> bool {
        let from = job.history.current();
        match job.history.transition(next, info) {
            Ok(()) => {
                tracing::info!(job_id = %id, from = %from, to = %next, "job state changed");
                if let Some(entry) = job.history.last() {
                    self.publish(id, entry);
                }
                true
            }
            Err(err) => {
                tracing::warn!(job_id = %id, error = %err, "ignoring state report");
                false
            }
        }
    }

    fn operator_changed(&self, id: JobId, job: &JobRecord) {
        if let Some(entry) = job.history.last() {
            tracing::info!(job_id = %id, to = %entry.state, "operator changed job state");
            self.publish(id, entry);
        }
    }

    /// Cleans the job up on its backend, best effort, then emits
    /// `JOB_FINISHED`. Jobs that never started are timed from submission,
    /// or from enqueue when they never reached a backend.
    async fn finish(&self, id: JobId, job: &JobRecord, output_sizes: BTreeMap<String, u64>) {
        if let (Some(backend), Some(external_id)) =
            (job.backend.as_ref(), job.descriptor.external_job_id.as_deref())
        {
            let timeout = self.inner.options.probe_timeout;
            match tokio::time::timeout(timeout, backend.clean(external_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(job_id = %id, error = %err, "cleanup failed");
                }
                Err(_) => {
                    tracing::warn!(job_id = %id, timeout_secs = timeout.as_secs(), "cleanup timed out");
                }
            }
        }
        let started_at = job
            .started_at
            .or(job.submitted_at)
            .or_else(|| job.history.entries().first().map(|entry| entry.timestamp))
            .unwrap_or_else(Utc::now);
        let job_id = id.to_string();
        self.inner.performance.job_finished(
            &summary(&job_id, job),
            started_at,
            output_sizes,
            job.history.current().as_str(),
        );
    }

    fn publish(&self, id: JobId, entry: &HistoryEntry) {
        let guard = self
            .inner
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return;
        };
        let update = StateUpdate {
            job_id: id,
            state: entry.state,
            info: entry.info.clone(),
            timestamp: entry.timestamp,
        };
        if let Err(TrySendError::Full(update)) = sender.try_send(update) {
            tracing::debug!(job_id = %update.job_id, state = %update.state, "update channel full");
        }
    }
}

fn summary<'a>(job_id: &'a str, job: &'a JobRecord) -> JobSummary<'a> {
    JobSummary {
        job_id,
        runner: &job.descriptor.destination.runner,
        command_line: &job.descriptor.command_line,
    }
}

/// Waits up to `timeout` for the next state update. Returns `None` on
/// timeout or when the runner is gone.
pub async fn next_update(
    updates: &mut mpsc::Receiver<StateUpdate>,
    timeout: Duration,
) -> Option<StateUpdate> {
    tokio::time::timeout(timeout, updates.recv())
        .await
        .ok()
        .flatten()
}
