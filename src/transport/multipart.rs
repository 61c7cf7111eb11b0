//! Multipart/form-data upload strategy.

use std::time::Duration;

use reqwest::Client;
use reqwest::multipart::{Form, Part};

use super::http::{build_client, deliver, ensure_success, file_body};
use super::{TransferRequest, Transport, TransportError, TransportFuture, TransportKind};

/// Form field carrying the uploaded file.
const FILE_FIELD: &str = "file";

/// Uploads as a single-part multipart form; downloads are streamed like
/// [`super::HttpTransport`].
#[derive(Clone, Debug)]
pub struct MultipartTransport {
    client: Client,
}

impl MultipartTransport {
    /// Creates a transport whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BackendUnavailable`] when the TLS backend
    /// cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(timeout, "multipart")?,
        })
    }

    /// Creates a transport around a preconfigured client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn perform(
        &self,
        request: TransferRequest<'_>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let url = request.url;
        let part = if let Some(path) = request.input_path {
            let (body, length) = file_body(path).await?;
            let name = path.file_name().unwrap_or(FILE_FIELD).to_owned();
            Some(Part::stream_with_length(body, length).file_name(name))
        } else {
            request
                .data
                .map(|data| Part::bytes(data).file_name(FILE_FIELD))
        };

        let Some(part) = part else {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| TransportError::transient(url, err.to_string()))?;
            let response = ensure_success(url, response).await?;
            return deliver(url, response, request.output_path).await;
        };

        let form = Form::new().part(FILE_FIELD, part);
        let response = self
            .client
            .put(url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| TransportError::transient(url, err.to_string()))?;
        ensure_success(url, response).await?;
        Ok(None)
    }
}

impl Transport for MultipartTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Multipart
    }

    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a> {
        Box::pin(self.perform(request))
    }
}
