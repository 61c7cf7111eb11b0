//! Unit tests for the remote job client.

use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::runner::JobState;
use crate::transport::{TransportError, TransportFuture};

struct StubTransport(TransportKind);

impl Transport for StubTransport {
    fn kind(&self) -> TransportKind {
        self.0
    }

    fn execute<'a>(&'a self, request: TransferRequest<'a>) -> TransportFuture<'a> {
        Box::pin(async move { Err(TransportError::transient(request.url, "unreachable in tests")) })
    }
}

fn settings(url: &str, staging_root: Option<&str>, kind: TransportKind) -> RemoteSettings {
    RemoteSettings {
        url: url.to_owned(),
        staging_root: staging_root.map(str::to_owned),
        timeout: None,
        transport_kind: kind,
    }
}

fn client_for(settings: &RemoteSettings) -> Result<RemoteJobClient, ClientError> {
    RemoteJobClient::new(
        settings,
        Arc::new(StubTransport(settings.transport_kind)),
        Duration::from_secs(5),
    )
}

#[fixture]
fn http_client() -> RemoteJobClient {
    client_for(&settings("http://jobs.example:8080/api/", None, TransportKind::Http))
        .expect("client should build")
}

#[rstest]
#[case("queued", JobState::Queued)]
#[case("NEW", JobState::Queued)]
#[case("preprocessing", JobState::Queued)]
#[case("running", JobState::Running)]
#[case("complete", JobState::Ok)]
#[case("ok", JobState::Ok)]
#[case("failed", JobState::Error)]
#[case("cancelled", JobState::Deleted)]
#[case(" paused ", JobState::Paused)]
fn maps_remote_states(#[case] raw: &str, #[case] expected: JobState) {
    let status = RemoteStatus::from_remote(raw, Some(String::from("detail")));
    assert_eq!(status.state, expected);
    assert_eq!(status.info.as_deref(), Some("detail"));
}

#[rstest]
fn unknown_remote_state_becomes_error_with_raw_text() {
    let status = RemoteStatus::from_remote("teleported", None);
    assert_eq!(status.state, JobState::Error);
    assert_eq!(
        status.info.as_deref(),
        Some("unrecognized remote state: teleported")
    );
}

#[rstest]
fn http_locations_nest_under_job_files(http_client: RemoteJobClient) {
    assert_eq!(http_client.base_url(), "http://jobs.example:8080/api");
    let location = http_client
        .file_location("abc", "inputs/data set.csv")
        .expect("path should map");
    assert_eq!(
        location,
        "http://jobs.example:8080/api/jobs/abc/files/inputs/data%20set.csv"
    );
}

#[rstest]
#[case("")]
#[case("   ")]
#[case("/etc/passwd")]
#[case("../escape.txt")]
#[case("inputs/./data.csv")]
fn rejects_unsafe_staging_paths(http_client: RemoteJobClient, #[case] path: &str) {
    let err = http_client
        .file_location("abc", path)
        .expect_err("path should be rejected");
    assert!(matches!(err, ClientError::InvalidPath(_)), "got {err:?}");
    assert!(!err.is_retryable());
}

#[rstest]
fn remote_copy_locations_use_staging_root() {
    let client = client_for(&settings(
        "http://hpc01:9000",
        Some("builder@hpc01:/scratch/staging/"),
        TransportKind::RemoteCopy,
    ))
    .expect("client should build");

    let location = client
        .file_location("job-7", "results//out.dat")
        .expect("path should map");
    assert_eq!(location, "builder@hpc01:/scratch/staging/job-7/results/out.dat");
}

#[rstest]
fn remote_copy_without_staging_root_is_rejected() {
    let err = client_for(&settings("http://hpc01:9000", None, TransportKind::RemoteCopy))
        .expect_err("staging root is required");
    assert!(matches!(err, ClientError::Config(_)), "got {err:?}");
}

#[rstest]
fn invalid_base_url_is_rejected() {
    let err = client_for(&settings("not a url", None, TransportKind::Http))
        .expect_err("url should not parse");
    assert!(matches!(err, ClientError::Config(_)), "got {err:?}");
}

#[rstest]
#[case(ClientError::Request(String::from("connection reset")), true)]
#[case(ClientError::Api { status: 503, message: String::new() }, true)]
#[case(ClientError::Api { status: 404, message: String::new() }, false)]
#[case(ClientError::Submission { status: 500, message: String::new() }, false)]
#[case(ClientError::Transport(TransportError::transient("http://h", "reset")), true)]
#[case(ClientError::Transport(TransportError::InvalidRequest(String::from("bad"))), false)]
fn classifies_retryable_errors(#[case] err: ClientError, #[case] expected: bool) {
    assert_eq!(err.is_retryable(), expected);
}

#[rstest]
#[tokio::test]
async fn collection_continues_past_failures(http_client: RemoteJobClient) {
    let manifest = FileManifest {
        inputs: Vec::new(),
        outputs: vec![
            crate::runner::StagedFile::new("/tmp/a.txt", "a.txt"),
            crate::runner::StagedFile::new("/tmp/b.txt", "../b.txt"),
        ],
    };

    let report = http_client.collect_outputs("abc", &manifest).await;

    assert_eq!(report.len(), 2);
    assert_eq!(report.success_count(), 0);
    assert!(report.is_partial_failure());
    let summary = report.failure_summary();
    assert!(summary.contains("a.txt: "), "summary: {summary}");
    assert!(summary.contains("../b.txt: invalid staging path"), "summary: {summary}");
}
