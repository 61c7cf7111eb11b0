//! Backend for remote job servers.

use super::backend::{BackendStatus, CollectFuture, DispatchFuture, JobBackend};
use super::{FileManifest, JobDescriptor};
use crate::client::RemoteJobClient;

/// Runs jobs through a [`RemoteJobClient`].
#[derive(Clone, Debug)]
pub struct RemoteBackend {
    client: RemoteJobClient,
}

impl RemoteBackend {
    /// Wraps `client`.
    #[must_use]
    pub const fn new(client: RemoteJobClient) -> Self {
        Self { client }
    }

    /// The wrapped client.
    #[must_use]
    pub const fn client(&self) -> &RemoteJobClient {
        &self.client
    }
}

impl JobBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn submit<'a>(&'a self, job: &'a JobDescriptor) -> DispatchFuture<'a, String> {
        Box::pin(async move { Ok(self.client.submit(job).await?) })
    }

    fn check_status<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, BackendStatus> {
        Box::pin(async move {
            let status = self.client.check_status(external_id).await?;
            Ok(status.into())
        })
    }

    fn collect_outputs<'a>(
        &'a self,
        external_id: &'a str,
        manifest: &'a FileManifest,
    ) -> CollectFuture<'a> {
        Box::pin(self.client.collect_outputs(external_id, manifest))
    }

    fn cancel<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()> {
        Box::pin(async move { Ok(self.client.cancel(external_id).await?) })
    }

    fn clean<'a>(&'a self, external_id: &'a str) -> DispatchFuture<'a, ()> {
        Box::pin(async move { Ok(self.client.clean(external_id).await?) })
    }
}
