//! Dispatch settings and runner file tests.

use super::*;
use crate::test_support::EnvGuard;
use crate::transport::TransportKind;
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const YAML_RUNNERS: &str = r"
cluster:
  type: drmaa
pulsar:
  type: remote
  transport_kind: native_http
  connection_params:
    url: http://jobs.example.org:8913/
    timeout_secs: 45
scratch:
  type: local
";

const JSON_RUNNERS: &str = r#"{
  "cluster": {"type": "drmaa"},
  "pulsar": {
    "type": "remote",
    "transport_kind": "native_http",
    "connection_params": {"url": "http://jobs.example.org:8913/", "timeout_secs": 45}
  },
  "scratch": {"type": "local"}
}"#;

const INI_RUNNERS: &str = "
[cluster]
type = drmaa

[pulsar]
type = remote
transport_kind = native_http
url = http://jobs.example.org:8913/
timeout_secs = 45

[scratch]
type = local
";

#[fixture]
fn dir() -> TempDir {
    tempfile::tempdir().expect("tempdir")
}

fn write(dir: &TempDir, name: &str, contents: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).expect("utf8 temp path");
    std::fs::write(&path, contents).expect("write runner file");
    path
}

fn expected_runners() -> RunnersConfig {
    let mut expected = RunnersConfig::default();
    expected.insert(
        "cluster",
        RunnerDefinition::new(RunnerKind::Drmaa, TransportKind::Http),
    );
    expected.insert(
        "pulsar",
        RunnerDefinition::new(RunnerKind::Remote, TransportKind::NativeHttp)
            .with_param("url", "http://jobs.example.org:8913/")
            .with_param("timeout_secs", "45"),
    );
    expected.insert(
        "scratch",
        RunnerDefinition::new(RunnerKind::Local, TransportKind::Http),
    );
    expected
}

#[rstest]
#[case("runners.yaml", YAML_RUNNERS)]
#[case("runners.yml", YAML_RUNNERS)]
#[case("runners.json", JSON_RUNNERS)]
#[case("runners.ini", INI_RUNNERS)]
#[case("runners.conf", YAML_RUNNERS)]
fn every_format_yields_the_same_table(dir: TempDir, #[case] name: &str, #[case] contents: &str) {
    let path = write(&dir, name, contents);

    let runners = RunnersConfig::load(&path).expect("runner file should load");

    assert_eq!(runners, expected_runners());
}

#[rstest]
#[case("a.yaml", ConfigFormat::Yaml)]
#[case("a.JSON", ConfigFormat::Json)]
#[case("a.cfg", ConfigFormat::Ini)]
#[case("a", ConfigFormat::Yaml)]
fn detects_format_from_extension(#[case] name: &str, #[case] expected: ConfigFormat) {
    assert_eq!(ConfigFormat::from_path(Utf8Path::new(name)), expected);
}

#[rstest]
fn remote_settings_trim_url_and_parse_timeout() {
    let runners = expected_runners();
    let pulsar = runners.get("pulsar").expect("pulsar runner");

    let settings = pulsar.remote_settings("pulsar").expect("valid settings");

    assert_eq!(settings.url, "http://jobs.example.org:8913");
    assert_eq!(settings.timeout, Some(Duration::from_secs(45)));
    assert_eq!(settings.transport_kind, TransportKind::NativeHttp);
}

#[rstest]
#[case(RunnerDefinition::new(RunnerKind::Remote, TransportKind::Http), "url")]
#[case(
    RunnerDefinition::new(RunnerKind::Remote, TransportKind::RemoteCopy).with_param("url", "http://h"),
    "staging_root"
)]
#[case(
    RunnerDefinition::new(RunnerKind::Remote, TransportKind::Http)
        .with_param("url", "http://h")
        .with_param("timeout_secs", "soon"),
    "timeout_secs"
)]
fn incomplete_remote_runners_are_rejected(#[case] definition: RunnerDefinition, #[case] needle: &str) {
    let err = definition.validate("pulsar").expect_err("definition should be rejected");

    let ConfigError::InvalidRunner { runner, reason } = err else {
        panic!("expected InvalidRunner, got {err:?}");
    };
    assert_eq!(runner, "pulsar");
    assert!(reason.contains(needle), "{reason}");
}

#[rstest]
fn per_job_overrides_replace_runner_params() {
    let runners = expected_runners();
    let pulsar = runners.get("pulsar").expect("pulsar runner");
    let overrides = std::collections::BTreeMap::from([(
        String::from("url"),
        String::from("http://other:9000"),
    )]);

    let merged = pulsar.with_overrides(&overrides);

    assert_eq!(merged.param("url"), Some("http://other:9000"));
    assert_eq!(merged.param("timeout_secs"), Some("45"));
    assert_eq!(pulsar.param("url"), Some("http://jobs.example.org:8913/"));
}

#[rstest]
fn ini_section_without_type_is_a_format_error(dir: TempDir) {
    let path = write(&dir, "runners.ini", "[pulsar]\nurl = http://h\n");

    let err = RunnersConfig::load(&path).expect_err("type is required");

    let ConfigError::Format { format, message, .. } = err else {
        panic!("expected Format, got {err:?}");
    };
    assert_eq!(format, ConfigFormat::Ini);
    assert!(message.contains("type"), "{message}");
}

#[rstest]
fn unknown_runner_type_is_a_format_error(dir: TempDir) {
    let path = write(&dir, "runners.yaml", "pulsar:\n  type: kubernetes\n");

    let err = RunnersConfig::load(&path).expect_err("kubernetes is not a runner type");

    assert!(matches!(err, ConfigError::Format { format: ConfigFormat::Yaml, .. }), "{err:?}");
}

#[rstest]
fn missing_runner_file_is_an_io_error(dir: TempDir) {
    let path = Utf8PathBuf::from_path_buf(dir.path().join("absent.yaml")).expect("utf8 temp path");

    let err = RunnersConfig::load(&path).expect_err("file is absent");

    assert!(matches!(err, ConfigError::Io { .. }), "{err:?}");
}

#[rstest]
fn dispatch_defaults_validate() {
    let config = DispatchConfig::default();

    config.validate().expect("defaults should validate");
    assert_eq!(config.poll_interval(), Duration::from_secs(1));
    assert_eq!(
        config.retry_policy(),
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    );
}

#[rstest]
#[case(DispatchConfig { max_workers: 0, ..DispatchConfig::default() }, "max_workers")]
#[case(DispatchConfig { poll_interval_ms: 0, ..DispatchConfig::default() }, "poll_interval_ms")]
#[case(DispatchConfig { probe_timeout_secs: 0, ..DispatchConfig::default() }, "probe_timeout_secs")]
#[case(
    DispatchConfig { retry_base_delay_ms: 60_000, ..DispatchConfig::default() },
    "retry_base_delay_ms"
)]
fn dispatch_validation_rejects_unusable_values(#[case] config: DispatchConfig, #[case] field: &str) {
    let err = config.validate().expect_err("value should be rejected");

    let ConfigError::InvalidValue { field: rejected, .. } = err else {
        panic!("expected InvalidValue, got {err:?}");
    };
    assert_eq!(rejected, field);
}

#[tokio::test]
async fn dispatch_config_reads_environment_overrides() {
    let _guard = EnvGuard::set_vars(&[
        ("JOBRELAY_MAX_WORKERS", "8"),
        ("JOBRELAY_DRMAA_CONTACT", "sge-cell"),
    ])
    .await;

    let config = DispatchConfig::load_without_cli_args().expect("config should load");

    assert_eq!(config.max_workers, 8);
    assert_eq!(config.drmaa_contact.as_deref(), Some("sge-cell"));
    assert_eq!(config.poll_interval_ms, 1000);
}

#[tokio::test]
async fn dispatch_config_loads_named_runner_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write(&dir, "runners.json", JSON_RUNNERS);
    let config = DispatchConfig {
        runners_file: Some(path.to_string()),
        ..DispatchConfig::default()
    };

    let runners = config
        .load_runners()
        .expect("runner file should load")
        .expect("runner file is configured");

    assert_eq!(runners, expected_runners());
}
