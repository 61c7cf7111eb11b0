//! Backend running jobs as local subprocesses.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use tokio::process::{Child, Command};
use uuid::Uuid;

use super::backend::{
    BackendStatus, CollectFuture, DispatchFuture, JobBackend, collect_from_directory,
};
use super::{DispatchError, FileManifest, JobDescriptor, JobState};

struct LocalProcess {
    child: Child,
    exit: Option<ExitStatus>,
    working_directory: Option<Utf8PathBuf>,
}

/// Spawns `sh -c <job script>` and probes it with `try_wait`.
pub struct LocalBackend {
    shell: String,
    processes: Mutex<HashMap<String, LocalProcess>>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    /// Creates a backend using `/bin/sh`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shell("/bin/sh")
    }

    /// Creates a backend using `shell` as the interpreter.
    #[must_use]
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn spawn(&self, job: &JobDescriptor) -> Result<String, DispatchError> {
        let script = job.job_script()?;
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(ref dir) = job.working_directory {
            command.current_dir(dir);
        }
        let child = command
            .spawn()
            .map_err(|err| DispatchError::io(self.shell.as_str(), &err))?;
        let external_id = format!("local-{}", Uuid::new_v4().simple());
        tracing::debug!(external_id = %external_id, pid = ?child.id(), "spawned local job");
        self.guard().insert(
            external_id.clone(),
            LocalProcess {
                child,
                exit: None,
                working_directory: job.working_directory.clone(),
            },
        );
        Ok(external_id)
    }

    fn probe(&self, external_id: &str) -> Result<BackendStatus, DispatchError> {
        let mut processes = self.guard();
        let process = processes
            .get_mut(external_id)
            .ok_or_else(|| DispatchError::UnknownExternalJob(external_id.to_owned()))?;
        if process.exit.is_none() {
            process.exit = process
                .child
                .try_wait()
                .map_err(|err| DispatchError::io(self.shell.as_str(), &err))?;
        }
        Ok(match process.exit {
            None => BackendStatus::new(JobState::Running, None),
            Some(status) if status.success() => BackendStatus::new(JobState::Ok, None),
            Some(status) => BackendStatus::new(JobState::Error, Some(exit_text(status))),
        })
    }

    fn terminate(&self, external_id: &str) -> Result<(), DispatchError> {
        let mut processes = self.guard();
        let Some(process) = processes.get_mut(external_id) else {
            return Ok(());
        };
        if process.exit.is_some() {
            return Ok(());
        }
        process
            .child
            .start_kill()
            .map_err(|err| DispatchError::io(self.shell.as_str(), &err))
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, LocalProcess>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn exit_text(status: ExitStatus) -> String {
    status.code().map_or_else(
        || String::from("terminated by signal"),
        |code| format!("exit status {code}"),
    )
}

impl JobBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit<'a>(&'a self, job: &'a JobDescriptor) -> DispatchFuture<'a, String> {
        Box::pin(async move { self.spawn(job) })
    }

    fn check_status<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, BackendStatus> {
        Box::pin(async move { self.probe(external_id) })
    }

    fn collect_outputs<'a>(
        &'a self,
        external_id: &'a str,
        manifest: &'a FileManifest,
    ) -> CollectFuture<'a> {
        Box::pin(async move {
            let dir = self
                .guard()
                .get(external_id)
                .and_then(|process| process.working_directory.clone());
            collect_from_directory(dir.as_deref(), manifest).await
        })
    }

    fn cancel<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()> {
        Box::pin(async move { self.terminate(external_id) })
    }

    fn clean<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()> {
        Box::pin(async move {
            self.guard().remove(external_id);
            Ok(())
        })
    }
}
