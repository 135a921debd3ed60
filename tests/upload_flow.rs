mod common;

use common::{MockApi, Submit, coordinator};
use formatdesk::api::FormatResponse;
use formatdesk::config::Upload as UploadConfig;
use formatdesk::error::{UploadError, ValidationError};
use formatdesk::record::OptionSet;
use formatdesk::store::MemoryStore;
use formatdesk::upload::{FileRules, UploadOutcome, UploadRequest, UploadStage, Uploader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

type TestUploader = Uploader<Arc<MemoryStore>, MockApi, MockApi>;

fn uploader(api: &Arc<MockApi>, cfg: &UploadConfig) -> Arc<TestUploader> {
    let coord = Arc::new(coordinator(Arc::clone(api)));
    let rules = FileRules::new(cfg).expect("rules");
    Arc::new(Uploader::new(coord, Arc::clone(api), rules))
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn request(path: PathBuf) -> UploadRequest {
    UploadRequest {
        path,
        template: "ieee".into(),
        options: ["fix_citations"].into_iter().collect::<OptionSet>(),
    }
}

fn response(job_id: &str, download: Option<&str>) -> Submit {
    Submit::Respond(FormatResponse {
        job_id: job_id.into(),
        warnings: Vec::new(),
        download_location: download.map(str::to_string),
    })
}

#[tokio::test]
async fn completed_upload_is_visible_when_remote_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "paper.zip", b"PK\x03\x04fake");
    let api = MockApi::unreachable();
    api.push_submit(response("abc123", Some("http://formatter.test/download/abc123")));
    let up = uploader(&api, &UploadConfig::default());

    let outcome = up.submit(request(path)).await.expect("upload");
    assert!(matches!(outcome, UploadOutcome::Completed(_)));
    assert_eq!(up.stage(), UploadStage::Done);

    let jobs = up.coordinator().get_jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "abc123");
    assert_eq!(jobs[0].filename.as_deref(), Some("paper.zip"));
    assert_eq!(jobs[0].template, "ieee");
    assert!(jobs[0].options.contains("fix_citations"));
    assert_eq!(jobs[0].size, Some(8));
}

#[tokio::test]
async fn missing_download_location_is_derived() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.tex", b"\\documentclass{article}");
    let api = MockApi::unreachable();
    api.push_submit(response("j1", None));
    let up = uploader(&api, &UploadConfig::default());

    match up.submit(request(path)).await.expect("upload") {
        UploadOutcome::Completed(rec) => assert_eq!(
            rec.download_url.as_deref(),
            Some("http://formatter.test/download/j1")
        ),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_upload_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "paper.zip", b"PK");
    let api = MockApi::unreachable();
    api.push_submit(Submit::Hang);
    let up = uploader(&api, &UploadConfig::default());

    let handle = tokio::spawn({
        let up = Arc::clone(&up);
        async move { up.submit(request(path)).await }
    });
    api.started.notified().await;
    assert!(matches!(up.stage(), UploadStage::Uploading { .. }));

    up.cancel();
    let outcome = handle.await.unwrap().expect("cancel is not an error");
    assert_eq!(outcome, UploadOutcome::Cancelled);
    assert_eq!(up.stage(), UploadStage::Cancelled);
    assert!(up.coordinator().get_jobs().await.is_empty());
}

#[tokio::test]
async fn new_upload_supersedes_the_one_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_file(dir.path(), "first.zip", b"PK1");
    let second = write_file(dir.path(), "second.zip", b"PK2");
    let api = MockApi::unreachable();
    api.push_submit(Submit::Hang);
    api.push_submit(response("second-job", None));
    let up = uploader(&api, &UploadConfig::default());

    let handle = tokio::spawn({
        let up = Arc::clone(&up);
        async move { up.submit(request(first)).await }
    });
    api.started.notified().await;

    let outcome = up.submit(request(second)).await.expect("second upload");
    assert!(matches!(outcome, UploadOutcome::Completed(ref r) if r.id == "second-job"));
    assert_eq!(handle.await.unwrap().unwrap(), UploadOutcome::Cancelled);

    assert_eq!(up.stage(), UploadStage::Done);
    let jobs = up.coordinator().get_jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "second-job");
}

#[tokio::test]
async fn validation_fails_before_any_network_call() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockApi::unreachable();
    let up = uploader(&api, &UploadConfig::default());

    let pdf = write_file(dir.path(), "paper.pdf", b"%PDF");
    let err = up.submit(request(pdf)).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::Validation(ValidationError::UnsupportedExtension(_))
    ));

    let err = up.submit(request(dir.path().join("ghost.zip"))).await.unwrap_err();
    assert!(matches!(err, UploadError::Validation(ValidationError::NotFound(_))));

    let err = up.submit(request(PathBuf::new())).await.unwrap_err();
    assert!(matches!(err, UploadError::Validation(ValidationError::MissingFile)));

    assert_eq!(api.submit_calls.load(Ordering::SeqCst), 0);
    assert!(matches!(up.stage(), UploadStage::Error { .. }));
}

#[tokio::test]
async fn invalid_file_does_not_disturb_the_upload_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_file(dir.path(), "paper.zip", b"PK");
    let bad = write_file(dir.path(), "notes.txt", b"hi");
    let api = MockApi::unreachable();
    api.push_submit(Submit::Hang);
    let up = uploader(&api, &UploadConfig::default());

    let handle = tokio::spawn({
        let up = Arc::clone(&up);
        async move { up.submit(request(good)).await }
    });
    api.started.notified().await;

    let err = up.submit(request(bad)).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::Validation(ValidationError::UnsupportedExtension(_))
    ));
    assert_eq!(up.stage(), UploadStage::Uploading { percent: 50 });

    up.cancel();
    assert_eq!(handle.await.unwrap().unwrap(), UploadOutcome::Cancelled);
    assert_eq!(up.stage(), UploadStage::Cancelled);
}

#[tokio::test]
async fn oversized_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "big.ZIP", &[0u8; 64]);
    let api = MockApi::unreachable();
    let cfg = UploadConfig {
        max_bytes: 16,
        ..UploadConfig::default()
    };
    let up = uploader(&api, &cfg);

    let err = up.submit(request(path)).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::Validation(ValidationError::TooLarge { size: 64, max: 16 })
    ));
    assert_eq!(api.submit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_upload_sets_error_stage_and_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "paper.zip", b"PK");
    let api = MockApi::unreachable();
    api.push_submit(Submit::Fail {
        status: 413,
        detail: "Request Entity Too Large".into(),
    });
    let up = uploader(&api, &UploadConfig::default());

    let err = up.submit(request(path)).await.unwrap_err();
    assert!(matches!(err, UploadError::Api(_)));
    match up.stage() {
        UploadStage::Error { error } => {
            assert_eq!(error.title, "File too large");
            assert_eq!(error.status, Some(413));
        }
        other => panic!("unexpected stage {other:?}"),
    }
    assert!(up.coordinator().get_jobs().await.is_empty());
}
