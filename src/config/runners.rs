//! Runner definition files.
//!
//! The schema is `runner_name -> {type, connection_params, transport_kind}`.
//! YAML and JSON files hold that mapping directly. INI files use one section
//! per runner: `type` and `transport_kind` are read from the section and
//! every other key becomes a connection parameter.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use camino::Utf8Path;
use ini::Ini;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::transport::TransportKind;

use super::ConfigError;

/// Runner file syntax.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.yaml`, `.yml`, and anything unrecognised.
    Yaml,
    /// `.json`.
    Json,
    /// `.ini` and `.cfg`.
    Ini,
}

impl ConfigFormat {
    /// Picks the format from the file extension, defaulting to YAML.
    #[must_use]
    pub fn from_path(path: &Utf8Path) -> Self {
        match path
            .extension()
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Self::Json,
            Some("ini" | "cfg") => Self::Ini,
            _ => Self::Yaml,
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Yaml => "YAML",
            Self::Json => "JSON",
            Self::Ini => "INI",
        })
    }
}

/// Backend family a runner dispatches to.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// `sh -c` on this host.
    Local,
    /// A DRM scheduler through DRMAA.
    Drmaa,
    /// A remote job server over HTTP.
    Remote,
}

impl RunnerKind {
    /// Parses a configuration name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "drmaa" => Some(Self::Drmaa),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }

    /// Stable configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Drmaa => "drmaa",
            Self::Remote => "remote",
        }
    }
}

/// One entry of the runner table.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RunnerDefinition {
    /// Backend family.
    #[serde(rename = "type")]
    pub kind: RunnerKind,
    /// Backend-specific parameters. Scalars of any type are kept as strings.
    #[serde(default, deserialize_with = "scalar_params")]
    pub connection_params: BTreeMap<String, String>,
    /// Strategy used to stage files.
    #[serde(default)]
    pub transport_kind: TransportKind,
}

/// Connection settings of a `remote` runner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSettings {
    /// Base URL of the job server, without a trailing slash.
    pub url: String,
    /// `[user@]host:/path` root for remote copy staging.
    pub staging_root: Option<String>,
    /// Per-runner transfer timeout override.
    pub timeout: Option<Duration>,
    /// Strategy used to stage files.
    pub transport_kind: TransportKind,
}

impl RunnerDefinition {
    /// Creates a definition with no parameters.
    #[must_use]
    pub const fn new(kind: RunnerKind, transport_kind: TransportKind) -> Self {
        Self {
            kind,
            connection_params: BTreeMap::new(),
            transport_kind,
        }
    }

    /// Adds one connection parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_params.insert(key.into(), value.into());
        self
    }

    /// Returns a copy whose parameters are overlaid with `overrides`.
    #[must_use]
    pub fn with_overrides(&self, overrides: &BTreeMap<String, String>) -> Self {
        let mut merged = self.clone();
        merged
            .connection_params
            .extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Looks up a parameter, treating blank values as absent.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.connection_params
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Extracts the settings of a `remote` runner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRunner`] when `url` is missing,
    /// `staging_root` is missing for remote copy, or `timeout_secs` is not a
    /// positive integer.
    pub fn remote_settings(&self, runner: &str) -> Result<RemoteSettings, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRunner {
            runner: runner.to_owned(),
            reason: reason.to_owned(),
        };
        let url = self
            .param("url")
            .ok_or_else(|| invalid("connection_params.url is required for remote runners"))?
            .trim_end_matches('/')
            .to_owned();
        let staging_root = self.param("staging_root").map(str::to_owned);
        if self.transport_kind == TransportKind::RemoteCopy && staging_root.is_none() {
            return Err(invalid(
                "connection_params.staging_root is required with transport_kind remote_copy",
            ));
        }
        let timeout = self
            .param("timeout_secs")
            .map(|raw| match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
                _ => Err(invalid("connection_params.timeout_secs must be a positive integer")),
            })
            .transpose()?;
        Ok(RemoteSettings {
            url,
            staging_root,
            timeout,
            transport_kind: self.transport_kind,
        })
    }

    /// Checks the parameters the runner kind requires.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRunner`] describing the first problem.
    pub fn validate(&self, runner: &str) -> Result<(), ConfigError> {
        match self.kind {
            RunnerKind::Remote => self.remote_settings(runner).map(|_| ()),
            RunnerKind::Local | RunnerKind::Drmaa => Ok(()),
        }
    }
}

/// The runner table.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RunnersConfig {
    /// Definitions keyed by runner name.
    pub runners: BTreeMap<String, RunnerDefinition>,
}

impl RunnersConfig {
    /// Reads and validates a runner file, choosing the parser from the
    /// extension.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read,
    /// [`ConfigError::Format`] when it does not parse, and
    /// [`ConfigError::InvalidRunner`] when a definition is incomplete.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        let format = ConfigFormat::from_path(path);
        let config = Self::parse_str(&contents, format).map_err(|message| ConfigError::Format {
            path: path.to_string(),
            format,
            message,
        })?;
        config.validate()?;
        tracing::debug!(path = %path, %format, runners = config.runners.len(), "loaded runner table");
        Ok(config)
    }

    /// Parses runner definitions without validating them.
    ///
    /// # Errors
    ///
    /// Returns the parser diagnostic.
    pub fn parse_str(contents: &str, format: ConfigFormat) -> Result<Self, String> {
        match format {
            ConfigFormat::Yaml => {
                if contents.trim().is_empty() {
                    return Ok(Self::default());
                }
                serde_yaml::from_str(contents).map_err(|err| err.to_string())
            }
            ConfigFormat::Json => serde_json::from_str(contents).map_err(|err| err.to_string()),
            ConfigFormat::Ini => parse_ini(contents),
        }
    }

    /// Validates every definition.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::InvalidRunner`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runners
            .iter()
            .try_for_each(|(name, definition)| definition.validate(name))
    }

    /// Looks up a runner by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RunnerDefinition> {
        self.runners.get(name)
    }

    /// Adds or replaces a runner.
    pub fn insert(&mut self, name: impl Into<String>, definition: RunnerDefinition) {
        self.runners.insert(name.into(), definition);
    }
}

fn parse_ini(contents: &str) -> Result<RunnersConfig, String> {
    let ini = Ini::load_from_str(contents).map_err(|err| err.to_string())?;
    let mut config = RunnersConfig::default();
    for (section, properties) in ini.iter() {
        let Some(name) = section else {
            if properties.iter().next().is_none() {
                continue;
            }
            return Err(String::from("keys outside a [runner] section are not allowed"));
        };
        let raw_kind = properties
            .get("type")
            .ok_or_else(|| format!("section [{name}] is missing the type key"))?;
        let kind = RunnerKind::parse(raw_kind)
            .ok_or_else(|| format!("section [{name}] has unknown type {raw_kind:?}"))?;
        let transport_kind = match properties.get("transport_kind") {
            Some(raw) => TransportKind::parse(raw)
                .ok_or_else(|| format!("section [{name}] has unknown transport_kind {raw:?}"))?,
            None => TransportKind::default(),
        };
        let connection_params = properties
            .iter()
            .filter(|(key, _)| !matches!(*key, "type" | "transport_kind"))
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        config.insert(
            name,
            RunnerDefinition {
                kind,
                connection_params,
                transport_kind,
            },
        );
    }
    Ok(config)
}

fn scalar_params<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    raw.into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                Value::Null => String::new(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(D::Error::custom(format!(
                        "connection parameter {key} must be a scalar"
                    )));
                }
            };
            Ok((key, text))
        })
        .collect()
}
