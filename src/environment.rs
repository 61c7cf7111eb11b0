//! Declarative environment statements rendered as shell lines.
//!
//! A statement either sources a file, runs a command verbatim, or exports a
//! named value. Rendering is pure: the same statement always yields the same
//! line and nothing is read from or written to the host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of a job's environment specification.
///
/// Exactly one of `file`, `execute` and `value` is authoritative, with
/// precedence `file` > `execute` > `value`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentStatement {
    /// Variable name; required when the statement exports a value.
    pub name: Option<String>,
    /// Value to export.
    pub value: Option<String>,
    /// Emit `value` without quoting or escaping.
    pub raw: bool,
    /// Script to source with `.`.
    pub file: Option<String>,
    /// Shell command emitted verbatim.
    pub execute: Option<String>,
}

/// Errors raised while rendering environment statements.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EnvironmentError {
    /// Raised when a value statement carries no variable name.
    #[error("environment statement exports a value but has no name")]
    MissingName,
}

impl EnvironmentStatement {
    /// Builds a statement exporting `name=value`.
    #[must_use]
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Builds a statement sourcing `file`.
    #[must_use]
    pub fn source(file: impl Into<String>) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::default()
        }
    }

    /// Builds a statement emitting `command` verbatim.
    #[must_use]
    pub fn execute(command: impl Into<String>) -> Self {
        Self {
            execute: Some(command.into()),
            ..Self::default()
        }
    }

    /// Marks the value as raw so it is emitted without quoting.
    #[must_use]
    pub const fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// Renders the statement as a single shell line.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::MissingName`] when neither `file` nor
    /// `execute` is set and `name` is absent or blank.
    pub fn to_shell(&self) -> Result<String, EnvironmentError> {
        if let Some(file) = &self.file {
            return Ok(format!(". \"{file}\""));
        }
        if let Some(command) = &self.execute {
            return Ok(command.clone());
        }

        let name = self
            .name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .ok_or(EnvironmentError::MissingName)?;
        let value = self.value.as_deref().unwrap_or_default();
        let rendered = if self.raw {
            value.to_owned()
        } else {
            quote_value(value)
        };
        Ok(format!("{name}={rendered}; export {name}"))
    }
}

/// Renders several statements, one per line, in order.
///
/// # Errors
///
/// Returns the first [`EnvironmentError`] raised by a statement.
pub fn render_statements(statements: &[EnvironmentStatement]) -> Result<String, EnvironmentError> {
    let lines = statements
        .iter()
        .map(EnvironmentStatement::to_shell)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}

fn quote_value(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if matches!(ch, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("plain", "FOO=\"plain\"; export FOO")]
    #[case("with space", "FOO=\"with space\"; export FOO")]
    #[case("say \"hi\"", "FOO=\"say \\\"hi\\\"\"; export FOO")]
    #[case("C:\\dir", "FOO=\"C:\\\\dir\"; export FOO")]
    #[case("", "FOO=\"\"; export FOO")]
    fn value_statements_are_quoted(#[case] value: &str, #[case] expected: &str) {
        let line = EnvironmentStatement::value("FOO", value)
            .to_shell()
            .expect("statement should render");
        assert_eq!(line, expected);
    }

    #[rstest]
    fn raw_values_are_emitted_untouched() {
        let line = EnvironmentStatement::value("PATH", "$PATH:/opt/bin")
            .raw()
            .to_shell()
            .expect("statement should render");
        assert_eq!(line, "PATH=$PATH:/opt/bin; export PATH");
    }

    #[rstest]
    fn file_wins_over_value() {
        let statement = EnvironmentStatement {
            file: Some(String::from("/opt/env.sh")),
            ..EnvironmentStatement::value("FOO", "bar")
        };
        assert_eq!(
            statement.to_shell().expect("statement should render"),
            ". \"/opt/env.sh\""
        );
    }

    #[rstest]
    fn file_wins_over_execute() {
        let statement = EnvironmentStatement {
            execute: Some(String::from("module load samtools")),
            ..EnvironmentStatement::source("/opt/env.sh")
        };
        assert_eq!(
            statement.to_shell().expect("statement should render"),
            ". \"/opt/env.sh\""
        );
    }

    #[rstest]
    fn execute_wins_over_value() {
        let statement = EnvironmentStatement {
            execute: Some(String::from("module load samtools")),
            ..EnvironmentStatement::value("FOO", "bar")
        };
        assert_eq!(
            statement.to_shell().expect("statement should render"),
            "module load samtools"
        );
    }

    #[rstest]
    #[case(None)]
    #[case(Some(String::from("  ")))]
    fn value_statements_require_a_name(#[case] name: Option<String>) {
        let statement = EnvironmentStatement {
            name,
            value: Some(String::from("x")),
            ..EnvironmentStatement::default()
        };
        assert_eq!(statement.to_shell(), Err(EnvironmentError::MissingName));
    }

    #[rstest]
    fn missing_value_exports_empty_string() {
        let statement = EnvironmentStatement {
            name: Some(String::from("EMPTY")),
            ..EnvironmentStatement::default()
        };
        assert_eq!(
            statement.to_shell().expect("statement should render"),
            "EMPTY=\"\"; export EMPTY"
        );
    }

    #[rstest]
    fn render_statements_joins_lines_in_order() {
        let rendered = render_statements(&[
            EnvironmentStatement::source("/etc/profile.d/tools.sh"),
            EnvironmentStatement::value("THREADS", "4"),
        ])
        .expect("statements should render");
        assert_eq!(
            rendered,
            ". \"/etc/profile.d/tools.sh\"\nTHREADS=\"4\"; export THREADS"
        );
    }

    #[rstest]
    fn deserializes_from_mapping_keys() {
        let statement: EnvironmentStatement =
            serde_json::from_str(r#"{"name": "A", "value": "b", "raw": true}"#)
                .expect("statement should parse");
        assert_eq!(statement, EnvironmentStatement::value("A", "b").raw());
    }

    #[rstest]
    #[tokio::test]
    async fn quoted_value_round_trips_through_sh() {
        use crate::command::{CommandRunner, ProcessCommandRunner};
        use std::ffi::OsString;

        let tricky = "a \"quoted\" \\ value";
        let line = EnvironmentStatement::value("TRICKY", tricky)
            .to_shell()
            .expect("statement should render");
        let script = format!("{line}\n{line}\nprintf '%s' \"$TRICKY\"");
        let output = ProcessCommandRunner
            .run("sh", &[OsString::from("-c"), OsString::from(script)])
            .await
            .expect("sh should run");
        assert_eq!(output.stdout, tricky);
    }
}
