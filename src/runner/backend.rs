//! The seam between the orchestrator and execution backends.

use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};

use super::{DispatchError, FileManifest, JobDescriptor, JobState};
use crate::client::{ClientError, CollectionReport, OutputOutcome, RemoteStatus};
use crate::transport::TransportError;

/// Future returned by fallible [`JobBackend`] methods.
pub type DispatchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DispatchError>> + Send + 'a>>;

/// Future returned by [`JobBackend::collect_outputs`].
pub type CollectFuture<'a> = Pin<Box<dyn Future<Output = CollectionReport> + Send + 'a>>;

/// Result of one status probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendStatus {
    /// Reported state, or `None` when the backend cannot tell.
    pub state: Option<JobState>,
    /// Backend detail.
    pub info: Option<String>,
}

impl BackendStatus {
    /// A status reporting `state`.
    #[must_use]
    pub const fn new(state: JobState, info: Option<String>) -> Self {
        Self {
            state: Some(state),
            info,
        }
    }

    /// A status that leaves the job where it is.
    #[must_use]
    pub const fn undetermined() -> Self {
        Self {
            state: None,
            info: None,
        }
    }
}

impl From<RemoteStatus> for BackendStatus {
    fn from(status: RemoteStatus) -> Self {
        Self::new(status.state, status.info)
    }
}

/// An execution backend.
///
/// Implementations keep any per-job bookkeeping keyed by the external id
/// they return from [`JobBackend::submit`].
pub trait JobBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Stages inputs and submits the job, returning the external id.
    fn submit<'a>(&'a self, job: &'a JobDescriptor) -> DispatchFuture<'a, String>;

    /// Probes the job once.
    fn check_status<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, BackendStatus>;

    /// Brings every output to its local path, reporting each outcome.
    fn collect_outputs<'a>(
        &'a self,
        external_id: &'a str,
        manifest: &'a FileManifest,
    ) -> CollectFuture<'a>;

    /// Stops the job.
    fn cancel<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()>;

    /// Releases whatever the backend keeps for the job.
    fn clean<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()>;
}

/// Collects outputs produced on a shared filesystem.
///
/// An output already at its local path counts as collected. Otherwise the
/// file is copied from `<working_directory>/<remote_path>`.
pub(crate) async fn collect_from_directory(
    working_directory: Option<&Utf8Path>,
    manifest: &FileManifest,
) -> CollectionReport {
    let mut report = CollectionReport::default();
    for output in &manifest.outputs {
        let result = match tokio::fs::metadata(&output.local_path).await {
            Ok(metadata) if metadata.is_file() => Ok(()),
            _ => copy_output(working_directory, &output.remote_path, &output.local_path).await,
        };
        report.push(OutputOutcome {
            path: output.local_path.clone(),
            remote_path: output.remote_path.clone(),
            result,
        });
    }
    report
}

async fn copy_output(
    working_directory: Option<&Utf8Path>,
    remote_path: &str,
    local_path: &Utf8Path,
) -> Result<(), ClientError> {
    let Some(dir) = working_directory else {
        return Err(missing_output(local_path));
    };
    let source: Utf8PathBuf = dir.join(remote_path);
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| TransportError::io(parent, &err))?;
    }
    tokio::fs::copy(&source, local_path)
        .await
        .map(|_| ())
        .map_err(|err| TransportError::io(source, &err).into())
}

fn missing_output(local_path: &Utf8Path) -> ClientError {
    ClientError::Transport(TransportError::Io {
        path: local_path.to_owned(),
        message: String::from("output was not produced"),
    })
}
