//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

use crate::client::{ClientError, CollectionReport, OutputOutcome};
use crate::command::{CommandError, CommandFuture, CommandOutput, CommandRunner};
use crate::drmaa::{
    ControlAction, DrmaaError, DrmaaJobStatus, DrmaaLibrary, LibraryLoader, TemplateHandle,
};
use crate::performance::{EventSink, PerformanceEvent};
use crate::runner::{
    BackendStatus, CollectFuture, DispatchError, DispatchFuture, FileManifest, JobBackend,
    JobDescriptor, JobState,
};
use crate::transport::{
    TransferRequest, Transport, TransportError, TransportFuture, TransportKind,
};

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// An empty queue behaves like a missing executable.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<StdMutex<VecDeque<Result<CommandOutput, CommandError>>>>,
    invocations: Arc<StdMutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Makes the next invocation fail to start for a reason other than a
    /// missing executable.
    pub fn push_spawn_error(&self, message: impl Into<String>) {
        let message = message.into();
        lock(&self.responses).push_back(Err(CommandError::Spawn {
            program: String::new(),
            message,
        }));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        let response = lock(&self.responses).pop_front();
        Box::pin(async move {
            match response {
                Some(Ok(output)) => Ok(output),
                Some(Err(CommandError::Spawn { message, .. })) => Err(CommandError::Spawn {
                    program: program.to_owned(),
                    message,
                }),
                Some(Err(err)) => Err(err),
                None => Err(CommandError::NotFound {
                    program: program.to_owned(),
                }),
            }
        })
    }
}

/// Transport failing transiently a fixed number of times, then returning
/// `b"payload"`.
#[derive(Clone, Debug)]
pub struct FlakyTransport {
    failures: u32,
    unavailable: bool,
    attempts: Arc<AtomicU32>,
}

impl FlakyTransport {
    /// Fails the first `failures` calls with a transient error whose reason
    /// names the attempt number.
    #[must_use]
    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures,
            unavailable: false,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fails every call with a backend-unavailable error.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::failing_times(0)
        }
    }

    /// Calls made so far, across clones.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for FlakyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            if self.unavailable {
                return Err(TransportError::BackendUnavailable {
                    backend: String::from("flaky"),
                    reason: String::from("simulated missing dependency"),
                });
            }
            if attempt <= self.failures {
                return Err(TransportError::transient(
                    request.url,
                    format!("simulated failure on attempt {attempt}"),
                ));
            }
            Ok(Some(b"payload".to_vec()))
        })
    }
}

/// Event sink keeping every event in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    events: Arc<StdMutex<Vec<PerformanceEvent>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<PerformanceEvent> {
        lock(&self.events).clone()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &PerformanceEvent) {
        lock(&self.events).push(event.clone());
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum RunJobBehaviour {
    #[default]
    Succeed,
    Fail,
    Panic,
}

#[derive(Debug, Default)]
struct SpyState {
    next_template: usize,
    next_job: u32,
    allocated: Vec<TemplateHandle>,
    deleted: Vec<TemplateHandle>,
    attributes: Vec<(String, String)>,
    init_calls: u32,
    exit_calls: u32,
    contact: Option<String>,
    jobs: BTreeMap<String, DrmaaJobStatus>,
    controls: Vec<(String, ControlAction)>,
}

/// In-memory [`DrmaaLibrary`] recording every call.
///
/// Clones share state, so a test keeps one clone while the factory owns
/// another. Job ids start at `1001`.
#[derive(Clone, Debug, Default)]
pub struct SpyDrmaaLibrary {
    state: Arc<StdMutex<SpyState>>,
    run_job: RunJobBehaviour,
}

impl SpyDrmaaLibrary {
    /// A library whose calls all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A library whose `drmaa_run_job` fails.
    #[must_use]
    pub fn failing_run_job() -> Self {
        Self {
            run_job: RunJobBehaviour::Fail,
            ..Self::default()
        }
    }

    /// A library whose `drmaa_run_job` panics.
    #[must_use]
    pub fn panicking_run_job() -> Self {
        Self {
            run_job: RunJobBehaviour::Panic,
            ..Self::default()
        }
    }

    /// A loader handing out clones of this library.
    #[must_use]
    pub fn loader(&self) -> Box<dyn LibraryLoader> {
        Box::new(SpyLoader {
            library: self.clone(),
        })
    }

    /// Templates allocated, in order.
    #[must_use]
    pub fn allocated(&self) -> Vec<TemplateHandle> {
        lock(&self.state).allocated.clone()
    }

    /// Templates deleted, in order.
    #[must_use]
    pub fn deleted(&self) -> Vec<TemplateHandle> {
        lock(&self.state).deleted.clone()
    }

    /// Attributes set, as `(name, value)`. Vector values are joined with
    /// spaces.
    #[must_use]
    pub fn attributes(&self) -> Vec<(String, String)> {
        lock(&self.state).attributes.clone()
    }

    /// Value of the last attribute called `name`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<String> {
        lock(&self.state)
            .attributes
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    /// `drmaa_init` calls.
    #[must_use]
    pub fn init_calls(&self) -> u32 {
        lock(&self.state).init_calls
    }

    /// `drmaa_exit` calls.
    #[must_use]
    pub fn exit_calls(&self) -> u32 {
        lock(&self.state).exit_calls
    }

    /// Contact string passed to `drmaa_init`.
    #[must_use]
    pub fn contact(&self) -> Option<String> {
        lock(&self.state).contact.clone()
    }

    /// Control actions applied, in order.
    #[must_use]
    pub fn controls(&self) -> Vec<(String, ControlAction)> {
        lock(&self.state).controls.clone()
    }

    /// Sets the status `drmaa_job_ps` reports for `job_id`.
    pub fn set_status(&self, job_id: &str, status: DrmaaJobStatus) {
        lock(&self.state).jobs.insert(job_id.to_owned(), status);
    }

    /// Makes the scheduler forget `job_id`.
    pub fn forget(&self, job_id: &str) {
        lock(&self.state).jobs.remove(job_id);
    }
}

fn unknown_job(job_id: &str) -> DrmaaError {
    DrmaaError::InvalidJob {
        job_id: job_id.to_owned(),
        message: String::from("job does not exist"),
    }
}

impl DrmaaLibrary for SpyDrmaaLibrary {
    fn init(&mut self, contact: Option<&str>) -> Result<(), DrmaaError> {
        let mut state = lock(&self.state);
        state.init_calls += 1;
        state.contact = contact.map(str::to_owned);
        Ok(())
    }

    fn exit(&mut self) -> Result<(), DrmaaError> {
        lock(&self.state).exit_calls += 1;
        Ok(())
    }

    fn allocate_job_template(&mut self) -> Result<TemplateHandle, DrmaaError> {
        let mut state = lock(&self.state);
        state.next_template += 1;
        let handle = TemplateHandle(state.next_template);
        state.allocated.push(handle);
        Ok(handle)
    }

    fn set_attribute(
        &mut self,
        _template: TemplateHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DrmaaError> {
        lock(&self.state)
            .attributes
            .push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    fn set_vector_attribute(
        &mut self,
        _template: TemplateHandle,
        name: &str,
        values: &[String],
    ) -> Result<(), DrmaaError> {
        lock(&self.state)
            .attributes
            .push((name.to_owned(), values.join(" ")));
        Ok(())
    }

    fn run_job(&mut self, _template: TemplateHandle) -> Result<String, DrmaaError> {
        match self.run_job {
            RunJobBehaviour::Succeed => {
                let mut state = lock(&self.state);
                let job_id = (1001 + state.next_job).to_string();
                state.next_job += 1;
                state
                    .jobs
                    .insert(job_id.clone(), DrmaaJobStatus::QueuedActive);
                Ok(job_id)
            }
            RunJobBehaviour::Fail => Err(DrmaaError::Native {
                call: "drmaa_run_job",
                code: 17,
                message: String::from("simulated submission refusal"),
            }),
            RunJobBehaviour::Panic => panic!("simulated native crash in drmaa_run_job"),
        }
    }

    fn delete_job_template(&mut self, template: TemplateHandle) -> Result<(), DrmaaError> {
        lock(&self.state).deleted.push(template);
        Ok(())
    }

    fn control(&mut self, job_id: &str, action: ControlAction) -> Result<(), DrmaaError> {
        let mut state = lock(&self.state);
        if !state.jobs.contains_key(job_id) {
            return Err(unknown_job(job_id));
        }
        state.controls.push((job_id.to_owned(), action));
        Ok(())
    }

    fn job_ps(&mut self, job_id: &str) -> Result<DrmaaJobStatus, DrmaaError> {
        lock(&self.state)
            .jobs
            .get(job_id)
            .copied()
            .ok_or_else(|| unknown_job(job_id))
    }
}

struct SpyLoader {
    library: SpyDrmaaLibrary,
}

impl LibraryLoader for SpyLoader {
    fn load(&self) -> Result<Box<dyn DrmaaLibrary>, DrmaaError> {
        Ok(Box::new(self.library.clone()))
    }
}

/// Loader that always fails, counting attempts.
#[derive(Clone, Debug)]
pub struct FailingLoader {
    reason: String,
    attempts: Arc<AtomicU32>,
}

impl FailingLoader {
    /// Fails with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Load attempts so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl LibraryLoader for FailingLoader {
    fn load(&self) -> Result<Box<dyn DrmaaLibrary>, DrmaaError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DrmaaError::BackendUnavailable(self.reason.clone()))
    }
}

/// A call received by [`ScriptedBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    /// `submit` for the command line.
    Submit(String),
    /// `check_status` for the external id.
    CheckStatus(String),
    /// `collect_outputs` for the external id.
    Collect(String),
    /// `cancel` for the external id.
    Cancel(String),
    /// `clean` for the external id.
    Clean(String),
}

#[derive(Debug, Default)]
struct ScriptedBackendState {
    submit_errors: VecDeque<DispatchError>,
    statuses: VecDeque<Result<BackendStatus, DispatchError>>,
    failing_outputs: BTreeSet<String>,
    calls: Vec<BackendCall>,
    next_id: u32,
}

/// Backend replaying scripted probe results.
///
/// Submissions succeed with ids `scripted-1`, `scripted-2`, ... unless an
/// error was queued. Probes pop the status queue and report no change once
/// it is empty.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    state: Arc<StdMutex<ScriptedBackendState>>,
}

impl ScriptedBackend {
    /// Creates a backend with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a probe reporting `state`.
    pub fn push_status(&self, state: JobState) {
        lock(&self.state)
            .statuses
            .push_back(Ok(BackendStatus::new(state, None)));
    }

    /// Queues a probe reporting `state` with `info`.
    pub fn push_status_with_info(&self, state: JobState, info: impl Into<String>) {
        lock(&self.state)
            .statuses
            .push_back(Ok(BackendStatus::new(state, Some(info.into()))));
    }

    /// Queues a failed probe.
    pub fn push_probe_error(&self, err: DispatchError) {
        lock(&self.state).statuses.push_back(Err(err));
    }

    /// Makes the next submission fail with `err`.
    pub fn push_submit_error(&self, err: DispatchError) {
        lock(&self.state).submit_errors.push_back(err);
    }

    /// Makes collection of `remote_path` fail.
    pub fn fail_output(&self, remote_path: impl Into<String>) {
        lock(&self.state).failing_outputs.insert(remote_path.into());
    }

    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.state).calls.clone()
    }

    /// Number of calls matching `filter`.
    #[must_use]
    pub fn count(&self, filter: impl Fn(&BackendCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|call| filter(call)).count()
    }
}

impl JobBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn submit<'a>(&'a self, job: &'a JobDescriptor) -> DispatchFuture<'a, String> {
        let result = {
            let mut state = lock(&self.state);
            state.calls.push(BackendCall::Submit(job.command_line.clone()));
            match state.submit_errors.pop_front() {
                Some(err) => Err(err),
                None => {
                    state.next_id += 1;
                    Ok(format!("scripted-{}", state.next_id))
                }
            }
        };
        Box::pin(async move { result })
    }

    fn check_status<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, BackendStatus> {
        let result = {
            let mut state = lock(&self.state);
            state
                .calls
                .push(BackendCall::CheckStatus(external_id.to_owned()));
            state
                .statuses
                .pop_front()
                .unwrap_or_else(|| Ok(BackendStatus::undetermined()))
        };
        Box::pin(async move { result })
    }

    fn collect_outputs<'a>(
        &'a self,
        external_id: &'a str,
        manifest: &'a FileManifest,
    ) -> CollectFuture<'a> {
        let failing = {
            let mut state = lock(&self.state);
            state.calls.push(BackendCall::Collect(external_id.to_owned()));
            state.failing_outputs.clone()
        };
        Box::pin(async move {
            let mut report = CollectionReport::default();
            for output in &manifest.outputs {
                let result = if failing.contains(&output.remote_path) {
                    Err(ClientError::Transport(TransportError::transient(
                        &output.remote_path,
                        "simulated missing output",
                    )))
                } else {
                    Ok(())
                };
                report.push(OutputOutcome {
                    path: output.local_path.clone(),
                    remote_path: output.remote_path.clone(),
                    result,
                });
            }
            report
        })
    }

    fn cancel<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()> {
        lock(&self.state)
            .calls
            .push(BackendCall::Cancel(external_id.to_owned()));
        Box::pin(async { Ok(()) })
    }

    fn clean<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()> {
        lock(&self.state)
            .calls
            .push(BackendCall::Clean(external_id.to_owned()));
        Box::pin(async { Ok(()) })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push((key.to_string(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
