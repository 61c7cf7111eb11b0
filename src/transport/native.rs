//! Accelerated HTTP strategy backed by libcurl through the `curl` binary.
//!
//! `curl --upload-file` sends the file without staging it in this process,
//! and `--output` writes responses straight to disk. The binary is optional:
//! its presence is probed once, on first use, and a missing binary surfaces
//! as [`TransportError::BackendUnavailable`] instead of a spawn failure on
//! every call.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8Path;
use tempfile::NamedTempFile;
use tokio::sync::OnceCell;
use tokio::time::timeout;

use crate::command::{CommandRunner, ProcessCommandRunner};

use super::{TransferRequest, Transport, TransportError, TransportFuture, TransportKind};

/// Default name of the curl executable.
pub const DEFAULT_CURL_BIN: &str = "curl";

const BACKEND: &str = "native_http";

/// HTTP transfers delegated to `curl`.
#[derive(Debug)]
pub struct NativeHttpTransport<R: CommandRunner = ProcessCommandRunner> {
    curl_bin: String,
    runner: R,
    timeout: Duration,
    probe: OnceCell<Result<(), TransportError>>,
}

impl<R: CommandRunner> NativeHttpTransport<R> {
    /// Creates a transport invoking `curl_bin` through `runner`.
    pub fn new(curl_bin: impl Into<String>, runner: R, timeout: Duration) -> Self {
        Self {
            curl_bin: curl_bin.into(),
            runner,
            timeout,
            probe: OnceCell::new(),
        }
    }

    /// Checks that `curl` can be executed, caching the answer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BackendUnavailable`] when the binary is
    /// missing or `curl --version` fails, and [`TransportError::Transient`]
    /// when `curl` could not be started for another reason. Only the first
    /// two outcomes are cached.
    pub async fn ensure_available(&self) -> Result<(), TransportError> {
        self.probe
            .get_or_try_init(|| async {
                let args = [OsString::from("--version")];
                match self.runner.run(&self.curl_bin, &args).await {
                    Ok(output) if output.is_success() => Ok(Ok(())),
                    Ok(output) => Ok(Err(unavailable(
                        output.failure_reason(&format!("{} --version", self.curl_bin)),
                    ))),
                    Err(err) => {
                        let mapped = TransportError::from_command(BACKEND, &self.curl_bin, &err);
                        if mapped.is_backend_unavailable() {
                            Ok(Err(mapped))
                        } else {
                            Err(mapped)
                        }
                    }
                }
            })
            .await?
            .clone()
    }

    async fn perform(
        &self,
        request: TransferRequest<'_>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.ensure_available().await?;
        let url = request.url;

        if let Some(path) = request.input_path {
            self.run_curl(url, upload_args(path, url)).await?;
            return Ok(None);
        }

        if let Some(data) = request.data {
            let staged = NamedTempFile::new().map_err(|err| temp_error(&err))?;
            let staged_path = utf8_temp_path(&staged)?;
            tokio::fs::write(staged_path, &data)
                .await
                .map_err(|err| TransportError::io(staged_path, &err))?;
            self.run_curl(url, upload_args(staged_path, url)).await?;
            return Ok(None);
        }

        if let Some(path) = request.output_path {
            self.run_curl(url, download_args(path, url)).await?;
            return Ok(None);
        }

        let buffer = NamedTempFile::new().map_err(|err| temp_error(&err))?;
        let buffer_path = utf8_temp_path(&buffer)?;
        self.run_curl(url, download_args(buffer_path, url)).await?;
        let bytes = tokio::fs::read(buffer_path)
            .await
            .map_err(|err| TransportError::io(buffer_path, &err))?;
        Ok(Some(bytes))
    }

    async fn run_curl(&self, url: &str, mut args: Vec<OsString>) -> Result<(), TransportError> {
        let mut command = vec![
            OsString::from("--fail"),
            OsString::from("--silent"),
            OsString::from("--show-error"),
            OsString::from("--max-time"),
            OsString::from(self.timeout.as_secs().max(1).to_string()),
        ];
        command.append(&mut args);

        let output = timeout(self.timeout, self.runner.run(&self.curl_bin, &command))
            .await
            .map_err(|_| {
                TransportError::transient(
                    url,
                    format!("curl timed out after {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|err| TransportError::from_command(BACKEND, url, &err))?;

        if output.is_success() {
            return Ok(());
        }
        Err(TransportError::transient(
            url,
            output.failure_reason(&self.curl_bin),
        ))
    }
}

impl<R: CommandRunner> Transport for NativeHttpTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::NativeHttp
    }

    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a> {
        Box::pin(self.perform(request))
    }
}

fn upload_args(path: &Utf8Path, url: &str) -> Vec<OsString> {
    vec![
        OsString::from("--upload-file"),
        OsString::from(path.as_str()),
        OsString::from(url),
    ]
}

fn download_args(path: &Utf8Path, url: &str) -> Vec<OsString> {
    vec![
        OsString::from("--create-dirs"),
        OsString::from("--output"),
        OsString::from(path.as_str()),
        OsString::from(url),
    ]
}

fn unavailable(reason: String) -> TransportError {
    TransportError::BackendUnavailable {
        backend: BACKEND.to_owned(),
        reason,
    }
}

pub(super) fn temp_error(err: &std::io::Error) -> TransportError {
    TransportError::io(std::env::temp_dir().to_string_lossy().into_owned(), err)
}

pub(super) fn utf8_temp_path(file: &NamedTempFile) -> Result<&Utf8Path, TransportError> {
    Utf8Path::from_path(file.path()).ok_or_else(|| {
        TransportError::InvalidRequest(format!(
            "temporary path {} is not valid UTF-8",
            file.path().display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};

    #[fixture]
    fn runner() -> ScriptedRunner {
        ScriptedRunner::new()
    }

    fn transport(runner: &ScriptedRunner) -> NativeHttpTransport<ScriptedRunner> {
        NativeHttpTransport::new("curl", runner.clone(), Duration::from_secs(30))
    }

    #[rstest]
    #[tokio::test]
    async fn missing_curl_is_backend_unavailable(runner: ScriptedRunner) {
        let transport = transport(&runner);

        let err = transport
            .execute(TransferRequest::download("http://example.invalid/file"))
            .await
            .expect_err("probe should fail");

        assert!(err.is_backend_unavailable(), "unexpected error: {err:?}");
    }

    #[rstest]
    #[tokio::test]
    async fn probe_runs_once(runner: ScriptedRunner) {
        runner.push_success();
        runner.push_success();
        runner.push_success();
        let transport = transport(&runner);
        let output = Utf8Path::new("/tmp/jobrelay-native-out.dat");

        for _ in 0..2 {
            transport
                .execute(TransferRequest::download("http://h/f").to_file(output))
                .await
                .expect("download should succeed");
        }

        let versions = runner
            .invocations()
            .iter()
            .filter(|call| call.command_string().contains("--version"))
            .count();
        assert_eq!(versions, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn upload_uses_upload_file(runner: ScriptedRunner) {
        runner.push_success();
        runner.push_success();
        let transport = transport(&runner);

        transport
            .execute(TransferRequest::upload_file(
                "http://h/jobs/1/files/in.dat",
                Utf8Path::new("/data/in.dat"),
            ))
            .await
            .expect("upload should succeed");

        let calls = runner.invocations();
        let upload = calls.last().expect("upload invocation").command_string();
        assert_eq!(
            upload,
            "curl --fail --silent --show-error --max-time 30 --upload-file /data/in.dat \
             http://h/jobs/1/files/in.dat"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn spawn_failures_are_retryable_and_not_cached(runner: ScriptedRunner) {
        runner.push_spawn_error("Resource temporarily unavailable (os error 11)");
        runner.push_success();
        runner.push_spawn_error("Too many open files (os error 24)");
        runner.push_success();
        let transport = transport(&runner);
        let output = Utf8Path::new("/tmp/jobrelay-native-retry.dat");
        let download = || TransferRequest::download("http://h/f").to_file(output);

        let probe = transport
            .execute(download())
            .await
            .expect_err("version probe could not start");
        assert!(probe.is_retryable(), "{probe:?}");

        let copy = transport
            .execute(download())
            .await
            .expect_err("download could not start");
        assert!(copy.is_retryable(), "{copy:?}");
        assert!(copy.to_string().contains("failed to spawn curl"), "{copy}");

        transport
            .execute(download())
            .await
            .expect("probe result is cached after it succeeds");
        let versions = runner
            .invocations()
            .iter()
            .filter(|call| call.command_string().contains("--version"))
            .count();
        assert_eq!(versions, 2);
    }

    #[rstest]
    #[tokio::test]
    async fn non_zero_exit_is_transient(runner: ScriptedRunner) {
        runner.push_success();
        runner.push_failure(22);
        let transport = transport(&runner);

        let request = TransferRequest::download("http://h/missing").to_file(Utf8Path::new("/tmp/x"));
        let err = transport
            .execute(request)
            .await
            .expect_err("curl failure should surface");

        assert!(err.is_retryable());
        assert!(err.to_string().contains("status 22"), "{err}");
    }
}
