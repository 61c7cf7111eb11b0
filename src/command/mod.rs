//! Helper process execution for the `curl`, `rsync`, `scp` and `ssh` backed
//! transports.
//!
//! Transports hand argument vectors to a [`CommandRunner`]; the scripted
//! runner in [`crate::test_support`] stands in for it in tests.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

mod util;

pub use util::expand_tilde;

/// Exit code and captured streams of a finished helper process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` for exit code zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Describes a failed run of `program` for transfer error messages,
    /// e.g. `rsync exited with status 12: connection unexpectedly closed`.
    #[must_use]
    pub fn failure_reason(&self, program: &str) -> String {
        let status = self.code.map_or_else(
            || format!("{program} was terminated by a signal"),
            |code| format!("{program} exited with status {code}"),
        );
        match self.stderr.trim() {
            "" => status,
            stderr => format!("{status}: {stderr}"),
        }
    }
}

/// Raised when a helper process cannot be started at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// The executable does not exist or is not on `PATH`.
    #[error("{program} not found")]
    NotFound {
        /// Executable that was looked up.
        program: String,
    },
    /// Any other spawn failure.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Executable that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

impl CommandError {
    fn from_spawn(program: &str, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound {
                program: program.to_owned(),
            };
        }
        Self::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        }
    }
}

/// Future returned by [`CommandRunner::run`].
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, CommandError>> + Send + 'a>>;

/// Runs helper processes to completion.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and no stdin, capturing both output
    /// streams. A non-zero exit is reported through [`CommandOutput::code`].
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the process cannot be started.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a>;
}

/// Spawns real processes with `tokio::process`.
///
/// Dropping the returned future does not kill the child, so a copy that
/// outlives its transfer timeout still runs to completion.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|err| CommandError::from_spawn(program, &err))?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}
