//! File staging over SSH with `rsync` or `scp`.
//!
//! Remote locations use the `[user@]host:/absolute/path` form. Uploads
//! create the remote parent directory with `ssh ... mkdir -p` before the
//! copy; downloads create the local parent directory. Host key checking is
//! disabled and authentication is restricted to public keys, so the
//! strategy never blocks on an interactive prompt.

use std::ffi::OsString;
use std::fmt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;
use tokio::time::timeout;

use crate::command::{CommandRunner, ProcessCommandRunner, expand_tilde};

use super::native::{temp_error, utf8_temp_path};
use super::{TransferRequest, Transport, TransportError, TransportFuture, TransportKind};

mod config;

pub use config::{RemoteCopyConfig, RemoteCopyConfigError};

const BACKEND: &str = "remote_copy";

const HARDENED_SSH_OPTIONS: [&str; 3] = [
    "StrictHostKeyChecking=no",
    "PreferredAuthentications=publickey",
    "PubkeyAuthentication=yes",
];

/// A parsed `[user@]host:/path` location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteLocation {
    /// Login name, when given.
    pub user: Option<String>,
    /// Host name or address.
    pub host: String,
    /// Path on the remote host.
    pub path: Utf8PathBuf,
}

impl RemoteLocation {
    /// Parses an SSH location.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidRequest`] when the value is a URL,
    /// lacks a host, or lacks a path.
    pub fn parse(spec: &str) -> Result<Self, TransportError> {
        let invalid = || {
            TransportError::InvalidRequest(format!(
                "expected [user@]host:/path remote location, got {spec:?}"
            ))
        };
        if spec.contains("://") {
            return Err(invalid());
        }
        let (authority, path) = spec.split_once(':').ok_or_else(invalid)?;
        let (user, host) = match authority.rsplit_once('@') {
            Some((user, host)) if !user.is_empty() => (Some(user.to_owned()), host),
            Some(_) => return Err(invalid()),
            None => (None, authority),
        };
        if host.is_empty() || path.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            user,
            host: host.to_owned(),
            path: Utf8PathBuf::from(path),
        })
    }

    /// The `[user@]host` part passed to `ssh`.
    #[must_use]
    pub fn target(&self) -> String {
        self.user.as_ref().map_or_else(
            || self.host.clone(),
            |user| format!("{user}@{}", self.host),
        )
    }

    /// The full `[user@]host:path` operand passed to `rsync` or `scp`.
    #[must_use]
    pub fn spec(&self) -> String {
        format!("{}:{}", self.target(), self.path)
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec())
    }
}

/// Copies files to and from SSH hosts.
#[derive(Clone, Debug)]
pub struct RemoteCopyTransport<R: CommandRunner = ProcessCommandRunner> {
    config: RemoteCopyConfig,
    runner: R,
    timeout: Duration,
}

impl RemoteCopyTransport<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteCopyConfigError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(
        config: RemoteCopyConfig,
        timeout: Duration,
    ) -> Result<Self, RemoteCopyConfigError> {
        Self::new(config, ProcessCommandRunner, timeout)
    }
}

impl<R: CommandRunner> RemoteCopyTransport<R> {
    /// Creates a transport using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteCopyConfigError::InvalidConfig`] when configuration
    /// validation fails.
    pub fn new(
        config: RemoteCopyConfig,
        runner: R,
        timeout: Duration,
    ) -> Result<Self, RemoteCopyConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            runner,
            timeout,
        })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &RemoteCopyConfig {
        &self.config
    }

    async fn perform(
        &self,
        request: TransferRequest<'_>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let location = RemoteLocation::parse(request.url)?;

        if let Some(path) = request.input_path {
            self.upload(path, &location).await?;
            return Ok(None);
        }

        if let Some(data) = request.data {
            let staged = NamedTempFile::new().map_err(|err| temp_error(&err))?;
            let staged_path = utf8_temp_path(&staged)?;
            tokio::fs::write(staged_path, &data)
                .await
                .map_err(|err| TransportError::io(staged_path, &err))?;
            self.upload(staged_path, &location).await?;
            return Ok(None);
        }

        if let Some(path) = request.output_path {
            self.download(&location, path).await?;
            return Ok(None);
        }

        let buffer = NamedTempFile::new().map_err(|err| temp_error(&err))?;
        let buffer_path = utf8_temp_path(&buffer)?;
        self.download(&location, buffer_path).await?;
        let bytes = tokio::fs::read(buffer_path)
            .await
            .map_err(|err| TransportError::io(buffer_path, &err))?;
        Ok(Some(bytes))
    }

    async fn upload(&self, local: &Utf8Path, remote: &RemoteLocation) -> Result<(), TransportError> {
        if let Some(parent) = remote.path.parent().filter(|p| !p.as_str().is_empty()) {
            let mut args = self.ssh_options("-p");
            args.push(OsString::from(remote.target()));
            args.push(OsString::from(format!(
                "mkdir -p {}",
                shell_escape::unix::escape(parent.as_str().into())
            )));
            self.run(&self.config.ssh_bin, &args, &remote.spec()).await?;
        }
        let args = self.copy_args(local.as_str(), &remote.spec());
        self.run(self.config.copy_bin(), &args, &remote.spec()).await
    }

    async fn download(
        &self,
        remote: &RemoteLocation,
        local: &Utf8Path,
    ) -> Result<(), TransportError> {
        if let Some(parent) = local.parent().filter(|p| !p.as_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| TransportError::io(parent, &err))?;
        }
        let args = self.copy_args(&remote.spec(), local.as_str());
        self.run(self.config.copy_bin(), &args, &remote.spec()).await
    }

    fn copy_args(&self, source: &str, destination: &str) -> Vec<OsString> {
        let mut args = if self.config.use_rsync {
            vec![
                OsString::from("-az"),
                OsString::from("-e"),
                OsString::from(self.remote_shell()),
            ]
        } else {
            let mut args = vec![OsString::from("-q")];
            args.extend(self.ssh_options("-P"));
            args
        };
        args.push(OsString::from(source));
        args.push(OsString::from(destination));
        args
    }

    fn ssh_options(&self, port_flag: &str) -> Vec<OsString> {
        let mut args = Vec::with_capacity(10);
        for option in HARDENED_SSH_OPTIONS {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from(port_flag));
        args.push(OsString::from(self.config.ssh_port.to_string()));
        if let Some(ref identity_file) = self.config.ssh_identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }
        args
    }

    /// The `rsync -e` command, which rsync splits like a shell would.
    fn remote_shell(&self) -> String {
        let escape = |word: String| shell_escape::unix::escape(word.into()).into_owned();
        let mut words = vec![escape(self.config.ssh_bin.clone())];
        words.extend(
            self.ssh_options("-p")
                .into_iter()
                .map(|arg| escape(arg.to_string_lossy().into_owned())),
        );
        words.join(" ")
    }

    async fn run(&self, program: &str, args: &[OsString], location: &str) -> Result<(), TransportError> {
        let output = timeout(self.timeout, self.runner.run(program, args))
            .await
            .map_err(|_| {
                TransportError::transient(
                    location,
                    format!("{program} timed out after {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|err| TransportError::from_command(BACKEND, location, &err))?;

        if output.is_success() {
            return Ok(());
        }
        Err(TransportError::transient(
            location,
            output.failure_reason(program),
        ))
    }
}

impl<R: CommandRunner> Transport for RemoteCopyTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::RemoteCopy
    }

    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a> {
        Box::pin(self.perform(request))
    }
}
