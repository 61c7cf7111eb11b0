//! Typed job template attributes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{DrmaaError, DrmaaLibrary, TemplateHandle};

/// Keys accepted by [`JobTemplateAttributes::from_mapping`].
pub const ALLOWED_ATTRIBUTES: [&str; 9] = [
    "remote_command",
    "args",
    "job_name",
    "working_directory",
    "output_path",
    "error_path",
    "join_files",
    "native_specification",
    "environment",
];

/// Attributes applied to a DRMAA job template before submission.
///
/// Only the fields below can be set; the native template is never touched
/// with caller-chosen attribute names.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JobTemplateAttributes {
    /// Executable or script submitted to the scheduler.
    pub remote_command: String,
    /// Arguments passed to `remote_command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Scheduler-visible job name.
    #[serde(default)]
    pub job_name: Option<String>,
    /// Directory the job starts in.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// File receiving standard output.
    #[serde(default)]
    pub output_path: Option<String>,
    /// File receiving standard error.
    #[serde(default)]
    pub error_path: Option<String>,
    /// Merge standard error into standard output.
    #[serde(default)]
    pub join_files: bool,
    /// Scheduler-specific submission flags, passed through untouched.
    #[serde(default)]
    pub native_specification: Option<String>,
    /// `NAME=value` pairs exported to the job.
    #[serde(default)]
    pub environment: Vec<String>,
}

impl JobTemplateAttributes {
    /// Creates attributes running `remote_command` with no other settings.
    #[must_use]
    pub fn new(remote_command: impl Into<String>) -> Self {
        Self {
            remote_command: remote_command.into(),
            ..Self::default()
        }
    }

    /// Builds attributes from a loosely typed configuration mapping.
    ///
    /// # Errors
    ///
    /// Returns [`DrmaaError::UnknownAttribute`] for a key outside
    /// [`ALLOWED_ATTRIBUTES`], or [`DrmaaError::InvalidAttribute`] when a
    /// value has the wrong type or `remote_command` is missing.
    pub fn from_mapping(mapping: &Map<String, Value>) -> Result<Self, DrmaaError> {
        if let Some(key) = mapping
            .keys()
            .find(|key| !ALLOWED_ATTRIBUTES.contains(&key.as_str()))
        {
            return Err(DrmaaError::UnknownAttribute(key.clone()));
        }
        let attributes: Self = serde_json::from_value(Value::Object(mapping.clone()))
            .map_err(|err| DrmaaError::InvalidAttribute(err.to_string()))?;
        if attributes.remote_command.trim().is_empty() {
            return Err(DrmaaError::InvalidAttribute(String::from(
                "remote_command must not be empty",
            )));
        }
        Ok(attributes)
    }

    pub(super) fn apply(
        &self,
        library: &mut dyn DrmaaLibrary,
        template: TemplateHandle,
    ) -> Result<(), DrmaaError> {
        library.set_attribute(template, "drmaa_remote_command", &self.remote_command)?;
        if !self.args.is_empty() {
            library.set_vector_attribute(template, "drmaa_v_argv", &self.args)?;
        }
        if let Some(ref name) = self.job_name {
            library.set_attribute(template, "drmaa_job_name", name)?;
        }
        if let Some(ref dir) = self.working_directory {
            library.set_attribute(template, "drmaa_wd", dir)?;
        }
        if let Some(ref path) = self.output_path {
            library.set_attribute(template, "drmaa_output_path", &format!(":{path}"))?;
        }
        if let Some(ref path) = self.error_path {
            library.set_attribute(template, "drmaa_error_path", &format!(":{path}"))?;
        }
        if self.join_files {
            library.set_attribute(template, "drmaa_join_files", "y")?;
        }
        if let Some(ref spec) = self.native_specification {
            library.set_attribute(template, "drmaa_native_specification", spec)?;
        }
        if !self.environment.is_empty() {
            library.set_vector_attribute(template, "drmaa_v_env", &self.environment)?;
        }
        Ok(())
    }
}
