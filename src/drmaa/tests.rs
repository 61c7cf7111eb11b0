//! Unit tests for the DRMAA session wrapper.

use super::*;
use crate::test_support::{FailingLoader, SpyDrmaaLibrary};
use rstest::{fixture, rstest};
use serde_json::json;

#[fixture]
fn spy() -> SpyDrmaaLibrary {
    SpyDrmaaLibrary::new()
}

fn factory(spy: &SpyDrmaaLibrary) -> DrmaaSessionFactory {
    DrmaaSessionFactory::new(spy.loader(), Some(String::from("cluster-a")))
}

fn attributes() -> JobTemplateAttributes {
    JobTemplateAttributes {
        job_name: Some(String::from("align")),
        working_directory: Some(String::from("/scratch/jobs/1")),
        args: vec![String::from("--threads"), String::from("4")],
        ..JobTemplateAttributes::new("/scratch/jobs/1/run.sh")
    }
}

#[rstest]
#[tokio::test]
async fn template_is_deleted_when_submission_fails() {
    let spy = SpyDrmaaLibrary::failing_run_job();
    let factory = factory(&spy);

    let err = factory
        .run_job(attributes())
        .await
        .expect_err("submission should fail");

    assert!(matches!(err, DrmaaError::Native { call: "drmaa_run_job", .. }), "{err:?}");
    assert_eq!(spy.allocated().len(), 1);
    assert_eq!(spy.deleted(), spy.allocated());
}

#[rstest]
#[tokio::test]
async fn template_is_deleted_when_submission_panics() {
    let spy = SpyDrmaaLibrary::panicking_run_job();
    let factory = factory(&spy);

    let err = factory
        .run_job(attributes())
        .await
        .expect_err("panic should surface as a worker error");

    assert!(matches!(err, DrmaaError::Worker(_)), "{err:?}");
    assert_eq!(spy.deleted(), spy.allocated());
}

#[rstest]
#[tokio::test]
async fn successful_submission_applies_attributes_and_releases_template(spy: SpyDrmaaLibrary) {
    let factory = factory(&spy);

    let job_id = factory
        .run_job(attributes())
        .await
        .expect("submission should succeed");

    assert_eq!(job_id, "1001");
    assert_eq!(spy.deleted(), spy.allocated());
    let names: Vec<String> = spy.attributes().into_iter().map(|(name, _)| name).collect();
    assert_eq!(
        names,
        vec![
            "drmaa_remote_command",
            "drmaa_v_argv",
            "drmaa_job_name",
            "drmaa_wd",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn session_is_initialised_once_on_first_use(spy: SpyDrmaaLibrary) {
    let factory = factory(&spy);
    assert_eq!(factory.state(), SessionState::Uninitialized);
    assert_eq!(spy.init_calls(), 0);

    factory.run_job(attributes()).await.expect("first job");
    factory.run_job(attributes()).await.expect("second job");

    assert_eq!(factory.state(), SessionState::Ready);
    assert_eq!(spy.init_calls(), 1);
    assert_eq!(spy.contact().as_deref(), Some("cluster-a"));
}

#[rstest]
#[tokio::test]
async fn missing_library_is_sticky_backend_unavailable() {
    let loader = FailingLoader::new("libdrmaa.so: cannot open shared object file");
    let factory = DrmaaSessionFactory::new(Box::new(loader.clone()), None);

    for _ in 0..2 {
        let err = factory
            .job_status("42")
            .await
            .expect_err("library is missing");
        assert!(err.is_backend_unavailable(), "{err:?}");
    }

    assert_eq!(factory.state(), SessionState::Unavailable);
    assert_eq!(loader.attempts(), 1);
}

#[rstest]
#[tokio::test]
async fn killing_a_finished_job_succeeds(spy: SpyDrmaaLibrary) {
    let factory = factory(&spy);

    factory
        .kill("no-such-job")
        .await
        .expect("unknown job should count as terminated");
}

#[rstest]
#[tokio::test]
async fn status_reports_scheduler_state(spy: SpyDrmaaLibrary) {
    let factory = factory(&spy);
    let job_id = factory.run_job(attributes()).await.expect("submit");
    spy.set_status(&job_id, DrmaaJobStatus::Running);

    let status = factory.job_status(&job_id).await.expect("status");

    assert_eq!(status, DrmaaJobStatus::Running);
}

#[rstest]
#[tokio::test]
async fn closed_session_rejects_calls(spy: SpyDrmaaLibrary) {
    let factory = factory(&spy);
    factory.run_job(attributes()).await.expect("submit");

    factory.close().await.expect("close should succeed");
    let err = factory
        .job_status("1001")
        .await
        .expect_err("session is closed");

    assert_eq!(err, DrmaaError::Closed);
    assert_eq!(factory.state(), SessionState::Closed);
    assert_eq!(spy.exit_calls(), 1);
}

#[rstest]
fn mapping_with_unknown_key_is_rejected() {
    let mapping = json!({"remote_command": "/bin/true", "hard_wallclock": "1:00:00"});
    let serde_json::Value::Object(mapping) = mapping else {
        panic!("json! object literal");
    };

    let err = JobTemplateAttributes::from_mapping(&mapping).expect_err("unknown key");

    assert_eq!(err, DrmaaError::UnknownAttribute(String::from("hard_wallclock")));
}

#[rstest]
fn mapping_with_allowed_keys_is_typed() {
    let mapping = json!({
        "remote_command": "/bin/run.sh",
        "args": ["a", "b"],
        "join_files": true,
        "native_specification": "-l h_vmem=4G",
    });
    let serde_json::Value::Object(mapping) = mapping else {
        panic!("json! object literal");
    };

    let attributes = JobTemplateAttributes::from_mapping(&mapping).expect("valid mapping");

    assert_eq!(attributes.remote_command, "/bin/run.sh");
    assert_eq!(attributes.args, vec!["a", "b"]);
    assert!(attributes.join_files);
    assert_eq!(attributes.native_specification.as_deref(), Some("-l h_vmem=4G"));
}

#[rstest]
#[case(json!({"args": ["a"]}))]
#[case(json!({"remote_command": "  "}))]
#[case(json!({"remote_command": "/bin/x", "join_files": "sometimes"}))]
fn invalid_values_are_rejected(#[case] mapping: serde_json::Value) {
    let serde_json::Value::Object(mapping) = mapping else {
        panic!("json! object literal");
    };

    let err = JobTemplateAttributes::from_mapping(&mapping).expect_err("invalid mapping");

    assert!(matches!(err, DrmaaError::InvalidAttribute(_)), "{err:?}");
}

#[rstest]
#[case(0x00, DrmaaJobStatus::Undetermined)]
#[case(0x10, DrmaaJobStatus::QueuedActive)]
#[case(0x12, DrmaaJobStatus::OnHold)]
#[case(0x20, DrmaaJobStatus::Running)]
#[case(0x22, DrmaaJobStatus::Suspended)]
#[case(0x30, DrmaaJobStatus::Done)]
#[case(0x40, DrmaaJobStatus::Failed)]
#[case(0x99, DrmaaJobStatus::Undetermined)]
fn maps_job_ps_codes(#[case] code: i32, #[case] expected: DrmaaJobStatus) {
    assert_eq!(DrmaaJobStatus::from_code(code), expected);
}

#[rstest]
fn native_loader_reports_missing_library() {
    let loader = NativeLibraryLoader::new("/nonexistent/libdrmaa-missing.so");

    let err = loader.load().map(|_| ()).expect_err("library should not load");

    assert!(err.is_backend_unavailable(), "{err:?}");
}
