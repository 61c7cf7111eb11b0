//! Standard HTTP strategy and the streaming helpers shared with multipart.

use std::time::Duration;

use camino::Utf8Path;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Response};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;

use super::{TransferRequest, Transport, TransportError, TransportFuture, TransportKind};

/// Size of the write buffer used when streaming downloads to disk.
pub(super) const CHUNK_SIZE: usize = 64 * 1024;

/// Uploads with `PUT` and downloads with `GET`.
///
/// Input files are streamed from disk rather than read into memory first.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BackendUnavailable`] when the TLS backend
    /// cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(timeout, "http")?,
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
        let is_upload = request.is_upload();
        let builder = if let Some(path) = request.input_path {
            let (body, length) = file_body(path).await?;
            self.client
                .put(url)
                .header(CONTENT_LENGTH, length)
                .body(body)
        } else if let Some(data) = request.data {
            self.client.put(url).body(data)
        } else {
            self.client.get(url)
        };

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::transient(url, err.to_string()))?;
        let response = ensure_success(url, response).await?;
        if is_upload {
            return Ok(None);
        }
        deliver(url, response, request.output_path).await
    }
}

impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a> {
        Box::pin(self.perform(request))
    }
}

pub(super) fn build_client(timeout: Duration, backend: &str) -> Result<Client, TransportError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| TransportError::BackendUnavailable {
            backend: backend.to_owned(),
            reason: err.to_string(),
        })
}

/// Opens `path` as a streaming request body and reports its length.
pub(super) async fn file_body(path: &Utf8Path) -> Result<(Body, u64), TransportError> {
    let file = File::open(path)
        .await
        .map_err(|err| TransportError::io(path, &err))?;
    let length = file
        .metadata()
        .await
        .map_err(|err| TransportError::io(path, &err))?
        .len();
    Ok((Body::wrap_stream(ReaderStream::new(file)), length))
}

/// Maps non-2xx statuses to [`TransportError::Transient`].
pub(super) async fn ensure_success(
    url: &str,
    response: Response,
) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::transient(
        url,
        format!("HTTP {}: {}", status.as_u16(), body.trim()),
    ))
}

/// Streams the body to `output_path`, or buffers it when no path is given.
pub(super) async fn deliver(
    url: &str,
    response: Response,
    output_path: Option<&Utf8Path>,
) -> Result<Option<Vec<u8>>, TransportError> {
    let Some(path) = output_path else {
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::transient(url, err.to_string()))?;
        return Ok(Some(bytes.to_vec()));
    };
    stream_to_file(url, response, path).await?;
    Ok(None)
}

async fn stream_to_file(
    url: &str,
    mut response: Response,
    path: &Utf8Path,
) -> Result<(), TransportError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| TransportError::io(parent, &err))?;
    }
    let file = File::create(path)
        .await
        .map_err(|err| TransportError::io(path, &err))?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| TransportError::transient(url, err.to_string()))?
    {
        writer
            .write_all(&chunk)
            .await
            .map_err(|err| TransportError::io(path, &err))?;
    }
    writer
        .flush()
        .await
        .map_err(|err| TransportError::io(path, &err))
}
