//! Configuration loading via `ortho-config` and runner definition files.
//!
//! Process-level settings live in [`DispatchConfig`], merged from defaults,
//! `jobrelay.toml`, and `JOBRELAY_*` environment variables. The table of
//! runners is a separate YAML, JSON or INI file read by [`RunnersConfig`].

use std::time::Duration;

use camino::Utf8Path;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::transport::RetryPolicy;

mod runners;

pub use runners::{ConfigFormat, RemoteSettings, RunnerDefinition, RunnerKind, RunnersConfig};

/// Orchestrator settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "JOBRELAY",
    discovery(
        app_name = "jobrelay",
        env_var = "JOBRELAY_CONFIG_PATH",
        config_file_name = "jobrelay.toml",
        dotfile_name = ".jobrelay.toml",
        project_file_name = "jobrelay.toml"
    )
)]
pub struct DispatchConfig {
    /// Runner definition file (YAML, JSON or INI).
    pub runners_file: Option<String>,
    /// Upper bound on concurrent status probes.
    #[ortho_config(default = 4)]
    pub max_workers: usize,
    /// Delay between polling passes of [`crate::runner::JobRunner::run`].
    #[ortho_config(default = 1000)]
    pub poll_interval_ms: u64,
    /// Retries for transient transfer failures, and consecutive failed
    /// probes tolerated before a job is failed.
    #[ortho_config(default = 3)]
    pub max_retries: u32,
    /// First retry delay.
    #[ortho_config(default = 500)]
    pub retry_base_delay_ms: u64,
    /// Cap on the retry delay.
    #[ortho_config(default = 30000)]
    pub retry_max_delay_ms: u64,
    /// Upper bound on a single file transfer.
    #[ortho_config(default = 300)]
    pub transfer_timeout_secs: u64,
    /// Upper bound on a single status probe or control request.
    #[ortho_config(default = 30)]
    pub probe_timeout_secs: u64,
    /// DRMAA contact string passed to `drmaa_init`.
    pub drmaa_contact: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            runners_file: None,
            max_workers: 4,
            poll_interval_ms: 1000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            transfer_timeout_secs: 300,
            probe_timeout_secs: 30,
            drmaa_contact: None,
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its accepted range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a runner file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// File that could not be read.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a runner file is not valid in its detected format.
    #[error("failed to parse {format} runner file {path}: {message}")]
    Format {
        /// File being parsed.
        path: String,
        /// Format chosen from the extension.
        format: ConfigFormat,
        /// Parser diagnostic.
        message: String,
    },
    /// Raised when a runner definition is incomplete or contradictory.
    #[error("invalid runner {runner}: {reason}")]
    InvalidRunner {
        /// Runner name.
        runner: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl DispatchConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("jobrelay")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that numeric settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a zero worker count, poll
    /// interval or timeout, or a base retry delay above the cap, and
    /// [`ConfigError::MissingField`] for a blank `runners_file`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .runners_file
            .as_deref()
            .is_some_and(|path| path.trim().is_empty())
        {
            return Err(ConfigError::MissingField(String::from(
                "runners_file: set JOBRELAY_RUNNERS_FILE or add runners_file to jobrelay.toml",
            )));
        }
        Self::require_positive("max_workers", self.max_workers as u64)?;
        Self::require_positive("poll_interval_ms", self.poll_interval_ms)?;
        Self::require_positive("transfer_timeout_secs", self.transfer_timeout_secs)?;
        Self::require_positive("probe_timeout_secs", self.probe_timeout_secs)?;
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: String::from("retry_base_delay_ms"),
                reason: format!(
                    "{} exceeds retry_max_delay_ms ({})",
                    self.retry_base_delay_ms, self.retry_max_delay_ms
                ),
            });
        }
        Ok(())
    }

    /// Reads the runner table named by `runners_file`, if any.
    ///
    /// # Errors
    ///
    /// Returns any [`RunnersConfig::load`] error.
    pub fn load_runners(&self) -> Result<Option<RunnersConfig>, ConfigError> {
        self.runners_file
            .as_deref()
            .map(|path| RunnersConfig::load(Utf8Path::new(path)))
            .transpose()
    }

    /// Delay between polling passes.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound on a single file transfer.
    #[must_use]
    pub const fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Upper bound on a single probe or control request.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Backoff policy for transient transfer failures.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                field: field.to_owned(),
                reason: String::from("must be greater than zero"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
