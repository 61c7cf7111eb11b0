//! Job identity and the description of the work to run.

use std::collections::BTreeMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::{EnvironmentError, EnvironmentStatement};

/// Orchestrator-side job identifier.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A file moved between the local host and the execution side.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StagedFile {
    /// Path on this host.
    pub local_path: Utf8PathBuf,
    /// Path relative to the job's remote staging directory.
    pub remote_path: String,
}

impl StagedFile {
    /// Pairs a local path with its remote-relative name.
    #[must_use]
    pub fn new(local_path: impl Into<Utf8PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
        }
    }
}

/// Inputs staged before submission and outputs collected after success.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileManifest {
    /// Files uploaded before the job is submitted.
    #[serde(default)]
    pub inputs: Vec<StagedFile>,
    /// Files downloaded once the job finishes.
    #[serde(default)]
    pub outputs: Vec<StagedFile>,
}

impl FileManifest {
    /// Local paths of all outputs.
    pub fn output_paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.outputs.iter().map(|file| file.local_path.as_path())
    }
}

/// Requested compute resources.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResourceRequest {
    /// CPU cores.
    pub cores: u32,
    /// Memory in megabytes; zero means unspecified.
    pub memory_mb: u64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cores: 1,
            memory_mb: 0,
        }
    }
}

/// Where a job runs: a runner name plus per-job parameter overrides.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Destination {
    /// Key into the runner table.
    pub runner: String,
    /// Overrides layered over the runner's connection parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Destination {
    /// Targets `runner` with no overrides.
    #[must_use]
    pub fn new(runner: impl Into<String>) -> Self {
        Self {
            runner: runner.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds one override.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Everything needed to run one job.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Backend handle; absent until submitted.
    #[serde(default)]
    pub external_job_id: Option<String>,
    /// Runner and overrides.
    pub destination: Destination,
    /// Shell command to run.
    pub command_line: String,
    /// Directory the command starts in.
    #[serde(default)]
    pub working_directory: Option<Utf8PathBuf>,
    /// Files to stage.
    #[serde(default)]
    pub manifest: FileManifest,
    /// Statements run before the command.
    #[serde(default)]
    pub environment: Vec<EnvironmentStatement>,
    /// Compute request.
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Human-readable name passed to schedulers.
    #[serde(default)]
    pub job_name: Option<String>,
}

impl JobDescriptor {
    /// Describes `command_line` to run on `destination`.
    #[must_use]
    pub fn new(destination: Destination, command_line: impl Into<String>) -> Self {
        Self {
            external_job_id: None,
            destination,
            command_line: command_line.into(),
            working_directory: None,
            manifest: FileManifest::default(),
            environment: Vec::new(),
            resources: ResourceRequest::default(),
            job_name: None,
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Adds an input file.
    #[must_use]
    pub fn with_input(mut self, local: impl Into<Utf8PathBuf>, remote: impl Into<String>) -> Self {
        self.manifest.inputs.push(StagedFile::new(local, remote));
        self
    }

    /// Adds an output file.
    #[must_use]
    pub fn with_output(mut self, local: impl Into<Utf8PathBuf>, remote: impl Into<String>) -> Self {
        self.manifest.outputs.push(StagedFile::new(local, remote));
        self
    }

    /// Adds an environment statement.
    #[must_use]
    pub fn with_environment(mut self, statement: EnvironmentStatement) -> Self {
        self.environment.push(statement);
        self
    }

    /// Sets the resource request.
    #[must_use]
    pub const fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the scheduler-visible name.
    #[must_use]
    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    /// Renders every environment statement as one shell line.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] for a value statement without a name.
    pub fn environment_lines(&self) -> Result<Vec<String>, EnvironmentError> {
        self.environment
            .iter()
            .map(EnvironmentStatement::to_shell)
            .collect()
    }

    /// Renders a POSIX shell script that prepares the environment, changes
    /// into the working directory, and runs the command.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] for a value statement without a name.
    pub fn job_script(&self) -> Result<String, EnvironmentError> {
        let mut script = String::from("#!/bin/sh\n");
        for line in self.environment_lines()? {
            script.push_str(&line);
            script.push('\n');
        }
        if let Some(ref dir) = self.working_directory {
            script.push_str("cd ");
            script.push_str(&shell_escape::unix::escape(dir.as_str().into()));
            script.push_str(" || exit 1\n");
        }
        script.push_str(&self.command_line);
        script.push('\n');
        Ok(script)
    }
}
