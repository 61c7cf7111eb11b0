//! Multipart uploads and streamed downloads against an in-process server.

#[path = "common/fake_server.rs"]
mod fake_server;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use fake_server::{Call, FakeJobServer};
use jobrelay::RemoteJobClient;
use jobrelay::config::{RunnerDefinition, RunnerKind};
use jobrelay::runner::{Destination, JobDescriptor};
use jobrelay::transport::{MultipartTransport, TransferRequest, Transport, TransportKind};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

#[fixture]
fn transport() -> MultipartTransport {
    MultipartTransport::new(TIMEOUT).unwrap_or_else(|err| panic!("transport: {err}"))
}

fn workspace() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non UTF-8 temp dir: {}", path.display()));
    (dir, root)
}

#[rstest]
#[tokio::test]
async fn file_upload_is_sent_as_a_form(transport: MultipartTransport) {
    let server = FakeJobServer::start().await;
    let (_dir, root) = workspace();
    let input = root.join("reads.fq");
    std::fs::write(&input, b"@r1\nACGT\n").unwrap_or_else(|err| panic!("write input: {err}"));
    let url = format!("{}/jobs/job-3/files/inputs/reads.fq", server.base_url);

    let result = transport
        .execute(TransferRequest::upload_file(&url, &input))
        .await;

    assert_eq!(result, Ok(None));
    assert_eq!(
        server.file("job-3", "inputs/reads.fq").as_deref(),
        Some(b"@r1\nACGT\n".as_slice())
    );
    assert_eq!(server.form_file_names(), vec![Some(String::from("reads.fq"))]);
}

#[rstest]
#[tokio::test]
async fn byte_upload_uses_the_field_name_as_file_name(transport: MultipartTransport) {
    let server = FakeJobServer::start().await;
    let url = format!("{}/jobs/job-4/files/params.json", server.base_url);

    transport
        .execute(TransferRequest::upload_bytes(&url, b"{}".to_vec()))
        .await
        .unwrap_or_else(|err| panic!("upload: {err}"));

    assert_eq!(server.file("job-4", "params.json").as_deref(), Some(b"{}".as_slice()));
    assert_eq!(server.form_file_names(), vec![Some(String::from("file"))]);
}

#[rstest]
#[tokio::test]
async fn download_streams_to_disk(transport: MultipartTransport) {
    let server = FakeJobServer::start().await;
    let payload: Vec<u8> = b"ACGTN\n".iter().copied().cycle().take(200_000).collect();
    server.put_file("job-5", "out/result.bin", &payload);
    let (_dir, root) = workspace();
    let output = root.join("collected/result.bin");
    let url = format!("{}/jobs/job-5/files/out/result.bin", server.base_url);

    let result = transport
        .execute(TransferRequest::download(&url).to_file(&output))
        .await;

    assert_eq!(result, Ok(None));
    let written = std::fs::read(&output).unwrap_or_else(|err| panic!("read output: {err}"));
    assert_eq!(written, payload);
}

#[rstest]
#[tokio::test]
async fn download_without_a_path_returns_the_body(transport: MultipartTransport) {
    let server = FakeJobServer::start().await;
    server.put_file("job-6", "log.txt", b"done\n");
    let url = format!("{}/jobs/job-6/files/log.txt", server.base_url);

    let result = transport.execute(TransferRequest::download(&url)).await;

    assert_eq!(result, Ok(Some(b"done\n".to_vec())));
}

#[rstest]
#[tokio::test]
async fn missing_remote_file_is_transient(transport: MultipartTransport) {
    let server = FakeJobServer::start().await;
    let url = format!("{}/jobs/job-7/files/absent.txt", server.base_url);

    let err = transport
        .execute(TransferRequest::download(&url))
        .await
        .expect_err("missing file should fail");

    assert!(err.is_retryable(), "{err:?}");
    assert!(err.to_string().contains("HTTP 404"), "{err}");
}

#[tokio::test]
async fn remote_client_stages_inputs_through_forms() {
    let server = FakeJobServer::start().await;
    let settings = RunnerDefinition::new(RunnerKind::Remote, TransportKind::Multipart)
        .with_param("url", server.base_url.as_str())
        .remote_settings("forms")
        .unwrap_or_else(|err| panic!("settings: {err}"));
    let transport: Arc<dyn Transport> = Arc::new(
        MultipartTransport::new(TIMEOUT).unwrap_or_else(|err| panic!("transport: {err}")),
    );
    let client = RemoteJobClient::new(&settings, transport, TIMEOUT)
        .unwrap_or_else(|err| panic!("client: {err}"));
    let (_dir, root) = workspace();
    let input = root.join("ref.fa");
    std::fs::write(&input, b">chr1\nACGT\n").unwrap_or_else(|err| panic!("write input: {err}"));
    let job = JobDescriptor::new(Destination::new("forms"), "index ref.fa")
        .with_input(input, "ref/ref.fa");

    let job_id = client
        .submit(&job)
        .await
        .unwrap_or_else(|err| panic!("submit: {err}"));

    assert_eq!(
        server.calls(),
        vec![
            Call::Upload(job_id.clone(), String::from("ref/ref.fa")),
            Call::Submit(job_id.clone()),
        ]
    );
    assert_eq!(
        server.file(&job_id, "ref/ref.fa").as_deref(),
        Some(b">chr1\nACGT\n".as_slice())
    );
    assert_eq!(server.form_file_names(), vec![Some(String::from("ref.fa"))]);
}
