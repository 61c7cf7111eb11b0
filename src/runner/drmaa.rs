//! Backend submitting job scripts to a DRM through DRMAA.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use super::backend::{
    BackendStatus, CollectFuture, DispatchFuture, JobBackend, collect_from_directory,
};
use super::{DispatchError, FileManifest, JobDescriptor, JobState};
use crate::drmaa::{DrmaaError, DrmaaJobStatus, DrmaaSessionFactory, JobTemplateAttributes};

/// Connection parameter passed through as the native specification.
pub const NATIVE_SPECIFICATION_PARAM: &str = "native_specification";

struct SubmittedScript {
    script: Utf8PathBuf,
    working_directory: Utf8PathBuf,
}

/// Writes each job as a shell script in its working directory and submits
/// `/bin/sh <script>` through the shared session.
pub struct DrmaaBackend {
    factory: DrmaaSessionFactory,
    native_specification: Option<String>,
    scripts: Mutex<HashMap<String, SubmittedScript>>,
}

impl std::fmt::Debug for DrmaaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmaaBackend")
            .field("factory", &self.factory)
            .field("native_specification", &self.native_specification)
            .finish_non_exhaustive()
    }
}

impl DrmaaBackend {
    /// Creates a backend submitting through `factory`.
    #[must_use]
    pub fn new(factory: DrmaaSessionFactory, native_specification: Option<String>) -> Self {
        Self {
            factory,
            native_specification,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    /// Template attributes for a script written to `script`.
    #[must_use]
    pub fn template_for(
        &self,
        job: &JobDescriptor,
        script: &Utf8Path,
        working_directory: &Utf8Path,
    ) -> JobTemplateAttributes {
        let stem = script.file_stem().unwrap_or("jobrelay");
        JobTemplateAttributes {
            remote_command: String::from("/bin/sh"),
            args: vec![script.to_string()],
            job_name: job.job_name.clone(),
            working_directory: Some(working_directory.to_string()),
            output_path: Some(working_directory.join(format!("{stem}.o")).into_string()),
            error_path: Some(working_directory.join(format!("{stem}.e")).into_string()),
            join_files: false,
            native_specification: self.native_specification.clone(),
            environment: Vec::new(),
        }
    }

    async fn submit_job(&self, job: &JobDescriptor) -> Result<String, DispatchError> {
        let Some(working_directory) = job.working_directory.clone() else {
            return Err(DispatchError::InvalidJob(String::from(
                "DRMAA jobs need a working directory",
            )));
        };
        let script = working_directory.join(format!("jobrelay_{}.sh", Uuid::new_v4().simple()));
        let body = job.job_script()?;
        tokio::fs::write(&script, body)
            .await
            .map_err(|err| DispatchError::io(&script, &err))?;

        let attributes = self.template_for(job, &script, &working_directory);
        let external_id = match self.factory.run_job(attributes).await {
            Ok(id) => id,
            Err(err) => {
                remove_script(&script).await;
                return Err(err.into());
            }
        };
        self.scripts_guard().insert(
            external_id.clone(),
            SubmittedScript {
                script,
                working_directory,
            },
        );
        Ok(external_id)
    }

    async fn probe(&self, external_id: &str) -> Result<BackendStatus, DispatchError> {
        match self.factory.job_status(external_id).await {
            Ok(status) => Ok(map_status(status)),
            Err(DrmaaError::InvalidJob { .. }) => Ok(BackendStatus::new(
                JobState::Ok,
                Some(String::from("job no longer known to the scheduler")),
            )),
            Err(err) => Err(err.into()),
        }
    }

    fn working_directory(&self, external_id: &str) -> Option<Utf8PathBuf> {
        self.scripts_guard()
            .get(external_id)
            .map(|submitted| submitted.working_directory.clone())
    }

    fn scripts_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, SubmittedScript>> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Maps a scheduler status onto a job state. `Undetermined` leaves the job
/// where it is.
#[must_use]
pub fn map_status(status: DrmaaJobStatus) -> BackendStatus {
    match status {
        DrmaaJobStatus::Undetermined => BackendStatus::undetermined(),
        DrmaaJobStatus::QueuedActive => BackendStatus::new(JobState::Queued, None),
        DrmaaJobStatus::OnHold => BackendStatus::new(JobState::Paused, Some(String::from("held"))),
        DrmaaJobStatus::Suspended => {
            BackendStatus::new(JobState::Paused, Some(String::from("suspended")))
        }
        DrmaaJobStatus::Running => BackendStatus::new(JobState::Running, None),
        DrmaaJobStatus::Done => BackendStatus::new(JobState::Ok, None),
        DrmaaJobStatus::Failed => BackendStatus::new(
            JobState::Error,
            Some(String::from("scheduler reported failure")),
        ),
    }
}

async fn remove_script(script: &Utf8Path) {
    if let Err(err) = tokio::fs::remove_file(script).await {
        tracing::debug!(script = %script, error = %err, "failed to remove job script");
    }
}

impl JobBackend for DrmaaBackend {
    fn name(&self) -> &'static str {
        "drmaa"
    }

    fn submit<'a>(&'a self, job: &'a JobDescriptor) -> DispatchFuture<'a, String> {
        Box::pin(self.submit_job(job))
    }

    fn check_status<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, BackendStatus> {
        Box::pin(self.probe(external_id))
    }

    fn collect_outputs<'a>(
        &'a self,
        external_id: &'a str,
        manifest: &'a FileManifest,
    ) -> CollectFuture<'a> {
        Box::pin(async move {
            let dir = self.working_directory(external_id);
            collect_from_directory(dir.as_deref(), manifest).await
        })
    }

    fn cancel<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()> {
        Box::pin(async move { Ok(self.factory.kill(external_id).await?) })
    }

    fn clean<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()> {
        Box::pin(async move {
            let submitted = self.scripts_guard().remove(external_id);
            if let Some(submitted) = submitted {
                remove_script(&submitted.script).await;
            }
            Ok(())
        })
    }
}
