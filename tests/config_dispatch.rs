//! Runner construction from settings and a runner file.

#[path = "common/fake_server.rs"]
mod fake_server;

use std::time::Duration;

use camino::Utf8PathBuf;
use fake_server::{Call, FakeJobServer};
use jobrelay::runner::{Destination, DispatchError, JobDescriptor, JobId, JobRunner, JobState};
use jobrelay::transport::RemoteCopyConfig;
use jobrelay::{ConfigError, DispatchConfig};
use tempfile::TempDir;

fn workspace() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non UTF-8 temp dir: {}", path.display()));
    (dir, root)
}

fn config_with_runners(root: &Utf8PathBuf, file: &str, contents: &str) -> DispatchConfig {
    let path = root.join(file);
    std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write {path}: {err}"));
    DispatchConfig {
        runners_file: Some(path.to_string()),
        poll_interval_ms: 10,
        probe_timeout_secs: 5,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..DispatchConfig::default()
    }
}

async fn wait_for_terminal(runner: &JobRunner, id: JobId) -> JobState {
    for _ in 0..250 {
        let state = runner
            .poll(id)
            .await
            .unwrap_or_else(|err| panic!("poll: {err}"));
        if state.is_terminal() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} did not finish");
}

#[tokio::test]
async fn runners_from_yaml_dispatch_local_and_remote_jobs() {
    let server = FakeJobServer::start().await;
    server.script_statuses(&["complete"]);
    let (_dir, root) = workspace();
    let runners = format!(
        "scratch:\n  type: local\ncluster:\n  type: remote\n  connection_params:\n    url: {}/\n",
        server.base_url
    );
    let config = config_with_runners(&root, "runners.yaml", &runners);
    let runner = JobRunner::from_config(&config, RemoteCopyConfig::default())
        .unwrap_or_else(|err| panic!("runner: {err}"));

    let local = runner
        .enqueue(
            JobDescriptor::new(Destination::new("scratch"), "printf done > marker")
                .with_working_directory(root.clone())
                .with_output(root.join("marker"), "marker"),
        )
        .await;
    let remote = runner
        .enqueue(JobDescriptor::new(Destination::new("cluster"), "hostname"))
        .await;

    assert_eq!(runner.dispatch_pending().await, 2);
    assert_eq!(wait_for_terminal(&runner, local).await, JobState::Ok);
    assert_eq!(wait_for_terminal(&runner, remote).await, JobState::Ok);
    assert_eq!(
        std::fs::read_to_string(root.join("marker")).unwrap_or_default(),
        "done"
    );
    assert_eq!(server.count(|call| matches!(call, Call::Submit(_))), 1);
    assert_eq!(server.count(|call| matches!(call, Call::Clean(_))), 1);
}

#[tokio::test]
async fn ini_runner_file_is_accepted() {
    let (_dir, root) = workspace();
    let config = config_with_runners(&root, "runners.ini", "[scratch]\ntype = local\n");
    let runner = JobRunner::from_config(&config, RemoteCopyConfig::default())
        .unwrap_or_else(|err| panic!("runner: {err}"));
    let id = runner
        .enqueue(JobDescriptor::new(Destination::new("scratch"), "true"))
        .await;

    assert_eq!(runner.dispatch(id).await, Ok(JobState::Queued));
    assert_eq!(wait_for_terminal(&runner, id).await, JobState::Ok);
}

#[tokio::test]
async fn remote_runner_without_url_is_rejected() {
    let (_dir, root) = workspace();
    let config = config_with_runners(&root, "runners.json", r#"{"cluster": {"type": "remote"}}"#);

    let result = JobRunner::from_config(&config, RemoteCopyConfig::default());

    assert!(
        matches!(
            result,
            Err(DispatchError::Config(ConfigError::InvalidRunner { ref runner, .. })) if runner == "cluster"
        ),
        "unexpected result: {result:?}"
    );
}

#[tokio::test]
async fn invalid_settings_are_rejected_before_loading_runners() {
    let config = DispatchConfig {
        max_workers: 0,
        runners_file: Some(String::from("/nonexistent/runners.yaml")),
        ..DispatchConfig::default()
    };

    let result = JobRunner::from_config(&config, RemoteCopyConfig::default());

    assert!(
        matches!(result, Err(DispatchError::Config(ConfigError::InvalidValue { .. }))),
        "unexpected result: {result:?}"
    );
}
