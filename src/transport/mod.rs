//! Pluggable byte and file transfer strategies.
//!
//! Every strategy implements [`Transport`]: a single `execute` call either
//! uploads (when the request carries data or an input path) or downloads.
//! Downloads stream to disk when an output path is given and are buffered
//! otherwise. Strategies hold no per-call mutable state, so one instance can
//! be shared by every worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::command::ProcessCommandRunner;

mod error;
mod http;
mod multipart;
mod native;
mod remote_copy;
mod retry;

pub use error::TransportError;
pub use http::HttpTransport;
pub use multipart::MultipartTransport;
pub use native::{DEFAULT_CURL_BIN, NativeHttpTransport};
pub use remote_copy::{RemoteCopyConfig, RemoteCopyTransport, RemoteLocation};
pub use retry::{RetryPolicy, RetryingTransport};

/// Protocol used to stage files for a destination.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Plain HTTP with streamed bodies.
    #[default]
    Http,
    /// HTTP through the `curl` executable.
    #[serde(alias = "curl")]
    NativeHttp,
    /// HTTP multipart/form-data uploads.
    Multipart,
    /// `rsync` or `scp` over SSH.
    #[serde(alias = "rsync", alias = "scp")]
    RemoteCopy,
}

impl TransportKind {
    /// Stable configuration name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::NativeHttp => "native_http",
            Self::Multipart => "multipart",
            Self::RemoteCopy => "remote_copy",
        }
    }

    /// Parses a configuration name, accepting the same aliases as serde.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "native_http" | "curl" => Some(Self::NativeHttp),
            "multipart" => Some(Self::Multipart),
            "remote_copy" | "rsync" | "scp" => Some(Self::RemoteCopy),
            _ => None,
        }
    }
}

/// Direction of a staged file relative to the local host.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local file to remote location.
    Upload,
    /// Remote location to local file.
    Download,
}

/// One file needing staging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSpec {
    /// Local path for uploads, remote location for downloads.
    pub source: String,
    /// Remote location for uploads, local path for downloads.
    pub destination: String,
    /// Whether the file moves to or from the remote side.
    pub direction: Direction,
    /// Strategy expected to carry the file.
    pub transport_kind: TransportKind,
}

impl TransferSpec {
    /// Describes an upload of `local` to `remote`.
    #[must_use]
    pub fn upload(
        local: impl Into<String>,
        remote: impl Into<String>,
        kind: TransportKind,
    ) -> Self {
        Self {
            source: local.into(),
            destination: remote.into(),
            direction: Direction::Upload,
            transport_kind: kind,
        }
    }

    /// Describes a download of `remote` into `local`.
    #[must_use]
    pub fn download(
        remote: impl Into<String>,
        local: impl Into<String>,
        kind: TransportKind,
    ) -> Self {
        Self {
            source: remote.into(),
            destination: local.into(),
            direction: Direction::Download,
            transport_kind: kind,
        }
    }

    /// Builds the request that carries this file.
    #[must_use]
    pub fn to_request(&self) -> TransferRequest<'_> {
        match self.direction {
            Direction::Upload => {
                TransferRequest::upload_file(&self.destination, Utf8Path::new(&self.source))
            }
            Direction::Download => {
                TransferRequest::download(&self.source).to_file(Utf8Path::new(&self.destination))
            }
        }
    }
}

/// Arguments of a single [`Transport::execute`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest<'a> {
    /// Remote location, either a URL or an SSH `host:/path` spec.
    pub url: &'a str,
    /// In-memory body to upload.
    pub data: Option<Vec<u8>>,
    /// Local file to upload.
    pub input_path: Option<&'a Utf8Path>,
    /// Local file receiving a download.
    pub output_path: Option<&'a Utf8Path>,
}

impl<'a> TransferRequest<'a> {
    /// Starts a buffered download of `url`.
    #[must_use]
    pub const fn download(url: &'a str) -> Self {
        Self {
            url,
            data: None,
            input_path: None,
            output_path: None,
        }
    }

    /// Starts an upload of the file at `path`.
    #[must_use]
    pub const fn upload_file(url: &'a str, path: &'a Utf8Path) -> Self {
        Self {
            url,
            data: None,
            input_path: Some(path),
            output_path: None,
        }
    }

    /// Starts an upload of `data`.
    #[must_use]
    pub const fn upload_bytes(url: &'a str, data: Vec<u8>) -> Self {
        Self {
            url,
            data: Some(data),
            input_path: None,
            output_path: None,
        }
    }

    /// Streams the response to `path` instead of buffering it.
    #[must_use]
    pub const fn to_file(mut self, path: &'a Utf8Path) -> Self {
        self.output_path = Some(path);
        self
    }

    /// Returns `true` when the request sends a body.
    #[must_use]
    pub const fn is_upload(&self) -> bool {
        self.data.is_some() || self.input_path.is_some()
    }
}

/// Future returned by [`Transport::execute`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + 'a>>;

/// A file transfer strategy.
pub trait Transport: Send + Sync {
    /// Kind used for logging and staging location decisions.
    fn kind(&self) -> TransportKind;

    /// Performs one transfer.
    ///
    /// Returns `Ok(None)` when the body went to `output_path` or the request
    /// was an upload, and the buffered bytes otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] describing whether the failure is
    /// transient or fatal.
    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a> {
        (**self).execute(request)
    }
}

/// Settings shared by every strategy built through [`build_transport`].
#[derive(Clone, Debug)]
pub struct TransportSettings {
    /// Upper bound for one transfer.
    pub timeout: Duration,
    /// SSH settings used by the remote copy strategy.
    pub remote_copy: RemoteCopyConfig,
}

/// Builds the strategy for `kind`.
///
/// Optional dependencies are not probed here; a missing `curl`, `rsync` or
/// `ssh` surfaces as [`TransportError::BackendUnavailable`] on first use.
///
/// # Errors
///
/// Returns [`TransportError::BackendUnavailable`] when the HTTP client
/// cannot be constructed, or [`TransportError::InvalidRequest`] when the
/// SSH settings fail validation.
pub fn build_transport(
    kind: TransportKind,
    settings: &TransportSettings,
) -> Result<Arc<dyn Transport>, TransportError> {
    let transport: Arc<dyn Transport> = match kind {
        TransportKind::Http => Arc::new(HttpTransport::new(settings.timeout)?),
        TransportKind::NativeHttp => Arc::new(NativeHttpTransport::new(
            DEFAULT_CURL_BIN,
            ProcessCommandRunner,
            settings.timeout,
        )),
        TransportKind::Multipart => Arc::new(MultipartTransport::new(settings.timeout)?),
        TransportKind::RemoteCopy => Arc::new(
            RemoteCopyTransport::new(
                settings.remote_copy.clone(),
                ProcessCommandRunner,
                settings.timeout,
            )
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?,
        ),
    };
    Ok(transport)
}
