//! Client for remote job servers.
//!
//! A job moves through stage-in, submit, poll, stage-out and cleanup:
//!
//! - files go through the configured [`Transport`], to
//!   `<base>/jobs/{id}/files/{path}` over HTTP or to
//!   `<staging_root>/{id}/{path}` for remote copy;
//! - control requests go through `reqwest`: `POST /jobs`,
//!   `GET /jobs/{id}/status`, `POST /jobs/{id}/cancel`, and
//!   `DELETE /jobs/{id}`.
//!
//! The job id is generated here, so inputs are staged under it before the
//! server learns about the job and a failed stage-in never leaves a
//! submitted job behind. A submission that fails after staging began is
//! discarded with `DELETE /jobs/{id}`, and a server that answers with a
//! different id is refused, since staged files live under the generated one.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RemoteSettings;
use crate::runner::{FileManifest, JobDescriptor, ResourceRequest};
use crate::transport::{TransferRequest, Transport, TransportKind};

mod collect;
mod error;
mod status;

pub use collect::{CollectionReport, OutputOutcome};
pub use error::ClientError;
pub use status::RemoteStatus;

use status::StatusResponse;

/// Drives jobs on one remote job server.
#[derive(Clone)]
pub struct RemoteJobClient {
    http: Client,
    base_url: Url,
    staging_root: Option<String>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RemoteJobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteJobClient")
            .field("base_url", &self.base_url.as_str())
            .field("staging_root", &self.staging_root)
            .field("transport", &self.transport.kind())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    id: &'a str,
    command_line: &'a str,
    environment: Vec<String>,
    inputs: Vec<&'a str>,
    outputs: Vec<&'a str>,
    resources: &'a ResourceRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_name: Option<&'a str>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: Option<String>,
}

impl RemoteJobClient {
    /// Creates a client for the server in `settings`. Control requests time
    /// out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when the URL does not parse, when
    /// remote copy is selected without a staging root, or when the HTTP
    /// client cannot be built.
    pub fn new(
        settings: &RemoteSettings,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| ClientError::Config(err.to_string()))?;
        Self::with_http_client(settings, transport, http)
    }

    /// Creates a client around a preconfigured `reqwest` client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when the URL does not parse or remote
    /// copy is selected without a staging root.
    pub fn with_http_client(
        settings: &RemoteSettings,
        transport: Arc<dyn Transport>,
        http: Client,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(settings.url.trim_end_matches('/'))
            .map_err(|err| ClientError::Config(format!("invalid url {}: {err}", settings.url)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Config(format!(
                "url {} cannot carry a path",
                settings.url
            )));
        }
        let staging_root = settings
            .staging_root
            .as_ref()
            .map(|root| root.trim_end_matches('/').to_owned());
        if transport.kind() == TransportKind::RemoteCopy && staging_root.is_none() {
            return Err(ClientError::Config(String::from(
                "remote copy staging needs a staging_root",
            )));
        }
        Ok(Self {
            http,
            base_url,
            staging_root,
            transport,
        })
    }

    /// Base URL of the job server.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Location a manifest path is staged to for job `job_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidPath`] for empty or absolute paths and
    /// paths containing `.` or `..` components.
    pub fn file_location(&self, job_id: &str, remote_path: &str) -> Result<String, ClientError> {
        let segments = path_segments(remote_path)?;
        if let (TransportKind::RemoteCopy, Some(root)) = (self.transport.kind(), &self.staging_root)
        {
            return Ok(format!("{root}/{job_id}/{}", segments.join("/")));
        }
        let mut url = self.endpoint(&["jobs", job_id, "files"]);
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        Ok(url.into())
    }

    /// Stages every input, then submits the job.
    ///
    /// Returns the generated job id. The server may echo it back or omit it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] when an input cannot be staged, in
    /// which case no submit request is sent, and [`ClientError::Submission`]
    /// when the server rejects the job or assigns it another id. Either way
    /// whatever was staged is removed, best effort.
    pub async fn submit(&self, job: &JobDescriptor) -> Result<String, ClientError> {
        let job_id = Uuid::new_v4().to_string();
        let environment = job
            .environment_lines()
            .map_err(|err| ClientError::Request(format!("invalid environment: {err}")))?;
        let locations = job
            .manifest
            .inputs
            .iter()
            .map(|input| self.file_location(&job_id, &input.remote_path))
            .collect::<Result<Vec<_>, _>>()?;
        for output in &job.manifest.outputs {
            self.file_location(&job_id, &output.remote_path)?;
        }

        let submitted = self
            .stage_and_submit(&job_id, job, environment, &locations)
            .await;
        if submitted.is_err() {
            self.discard(&job_id).await;
        }
        submitted
    }

    async fn stage_and_submit(
        &self,
        job_id: &str,
        job: &JobDescriptor,
        environment: Vec<String>,
        locations: &[String],
    ) -> Result<String, ClientError> {
        for (input, location) in job.manifest.inputs.iter().zip(locations) {
            tracing::debug!(job_id = %job_id, location = %location, "staging input");
            self.transport
                .execute(TransferRequest::upload_file(location, &input.local_path))
                .await?;
        }

        let body = SubmitRequest {
            id: job_id,
            command_line: &job.command_line,
            environment,
            inputs: job.manifest.inputs.iter().map(|f| f.remote_path.as_str()).collect(),
            outputs: job.manifest.outputs.iter().map(|f| f.remote_path.as_str()).collect(),
            resources: &job.resources,
            job_name: job.job_name.as_deref(),
        };
        let response = self
            .http
            .post(self.endpoint(&["jobs"]))
            .json(&body)
            .send()
            .await
            .map_err(|err| ClientError::request(&err))?;
        let status = response.status();
        let text = response.text().await.map_err(|err| ClientError::request(&err))?;
        if !status.is_success() {
            return Err(ClientError::Submission {
                status: status.as_u16(),
                message: text.trim().to_owned(),
            });
        }

        let echoed = serde_json::from_str::<SubmitResponse>(&text)
            .ok()
            .and_then(|response| response.id)
            .filter(|id| !id.trim().is_empty());
        if let Some(echoed) = echoed.filter(|echoed| echoed != job_id) {
            self.discard(&echoed).await;
            return Err(ClientError::Submission {
                status: status.as_u16(),
                message: format!("server assigned id {echoed} to job {job_id}"),
            });
        }
        tracing::info!(external_job_id = %job_id, "submitted remote job");
        Ok(job_id.to_owned())
    }

    async fn discard(&self, job_id: &str) {
        if let Err(err) = self.clean(job_id).await {
            tracing::warn!(job_id, error = %err, "failed to discard remote job");
        }
    }

    /// Probes the job once. Safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Api`] for error statuses and
    /// [`ClientError::Request`] for connection failures or unreadable
    /// bodies.
    pub async fn check_status(&self, external_job_id: &str) -> Result<RemoteStatus, ClientError> {
        let response = self
            .http
            .get(self.endpoint(&["jobs", external_job_id, "status"]))
            .send()
            .await
            .map_err(|err| ClientError::request(&err))?;
        let response = api_result(response).await?;
        let body: StatusResponse = response
            .json()
            .await
            .map_err(|err| ClientError::request(&err))?;
        Ok(RemoteStatus::from_remote(&body.status, body.info))
    }

    /// Downloads every output, continuing past failures.
    pub async fn collect_outputs(
        &self,
        external_job_id: &str,
        manifest: &FileManifest,
    ) -> CollectionReport {
        let mut report = CollectionReport::default();
        for output in &manifest.outputs {
            let result = match self.file_location(external_job_id, &output.remote_path) {
                Ok(location) => self
                    .transport
                    .execute(TransferRequest::download(&location).to_file(&output.local_path))
                    .await
                    .map(|_| ())
                    .map_err(ClientError::from),
                Err(err) => Err(err),
            };
            if let Err(ref err) = result {
                tracing::warn!(
                    external_job_id,
                    path = %output.remote_path,
                    error = %err,
                    "failed to collect output"
                );
            }
            report.push(OutputOutcome {
                path: output.local_path.clone(),
                remote_path: output.remote_path.clone(),
                result,
            });
        }
        report
    }

    /// Asks the server to stop the job. A job that is unknown or already
    /// finished counts as cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Api`] for other error statuses and
    /// [`ClientError::Request`] for connection failures.
    pub async fn cancel(&self, external_job_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint(&["jobs", external_job_id, "cancel"]))
            .send()
            .await
            .map_err(|err| ClientError::request(&err))?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE
        ) {
            tracing::debug!(external_job_id, status = %response.status(), "job already finished");
            return Ok(());
        }
        api_result(response).await.map(|_| ())
    }

    /// Removes the job and its staged files from the server.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Api`] for error statuses other than 404 and
    /// [`ClientError::Request`] for connection failures.
    pub async fn clean(&self, external_job_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.endpoint(&["jobs", external_job_id]))
            .send()
            .await
            .map_err(|err| ClientError::request(&err))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        api_result(response).await.map(|_| ())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

async fn api_result(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message: message.trim().to_owned(),
    })
}

fn path_segments(remote_path: &str) -> Result<Vec<&str>, ClientError> {
    let invalid = || ClientError::InvalidPath(remote_path.to_owned());
    if remote_path.trim().is_empty() || remote_path.starts_with('/') {
        return Err(invalid());
    }
    let segments: Vec<&str> = remote_path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.iter().any(|segment| matches!(*segment, "." | "..")) {
        return Err(invalid());
    }
    Ok(segments)
}

#[cfg(test)]
mod tests;
