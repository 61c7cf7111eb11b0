//! SSH copy configuration structures and validation.
//!
//! [`RemoteCopyConfig`] holds the binaries and connection options used by
//! the remote copy strategy. Configuration is loaded via `ortho-config`,
//! which merges defaults, configuration files, and environment variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Binaries and connection options for `rsync`/`scp` over SSH.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "JOBRELAY_SSH",
    discovery(
        app_name = "jobrelay",
        env_var = "JOBRELAY_CONFIG_PATH",
        config_file_name = "jobrelay.toml",
        dotfile_name = ".jobrelay.toml",
        project_file_name = "jobrelay.toml"
    )
)]
pub struct RemoteCopyConfig {
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Copy with `rsync` when true, `scp` otherwise.
    #[ortho_config(default = true)]
    pub use_rsync: bool,
    /// TCP port of the remote SSH daemon.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key used for public-key authentication. Supports tilde
    /// expansion. When absent SSH falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
}

/// Errors raised when the SSH copy settings are unusable.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteCopyConfigError {
    /// Raised when configuration is missing required values.
    #[error(
        "missing {field}: set JOBRELAY_SSH_{env_suffix} or add {field} to jobrelay.toml",
        env_suffix = field.to_uppercase()
    )]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Indicates that parsing or merging configuration layers failed.
    #[error("remote copy configuration parsing failed: {0}")]
    Parse(String),
}

impl Default for RemoteCopyConfig {
    fn default() -> Self {
        Self {
            rsync_bin: String::from("rsync"),
            scp_bin: String::from("scp"),
            ssh_bin: String::from("ssh"),
            use_rsync: true,
            ssh_port: DEFAULT_SSH_PORT,
            ssh_identity_file: None,
        }
    }
}

impl RemoteCopyConfig {
    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteCopyConfigError::InvalidConfig`] when any required
    /// field is empty.
    pub fn validate(&self) -> Result<(), RemoteCopyConfigError> {
        Self::require_value(&self.rsync_bin, "rsync_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        if self.ssh_port == 0 {
            return Err(RemoteCopyConfigError::InvalidConfig {
                field: String::from("ssh_port"),
            });
        }
        Ok(())
    }

    /// Loads configuration from defaults, configuration files, and
    /// environment variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteCopyConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, RemoteCopyConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("jobrelay")])
            .map_err(|err| RemoteCopyConfigError::Parse(err.to_string()))
    }

    /// Program performing the copy.
    #[must_use]
    pub fn copy_bin(&self) -> &str {
        if self.use_rsync {
            &self.rsync_bin
        } else {
            &self.scp_bin
        }
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), RemoteCopyConfigError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(RemoteCopyConfigError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), RemoteCopyConfigError> {
        Self::require_optional_value(Some(value), field)
    }
}
