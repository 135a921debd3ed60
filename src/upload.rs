//! Upload flow: validate a project file, submit it, and record the finished job.
//!
//! Each attempt owns its own cancellation token. Starting a new attempt cancels
//! the previous one, and a cancelled attempt never records a job.

use crate::api::{FormatRequest, FormatService, JobApi, ProgressFn};
use crate::config::Upload as UploadConfig;
use crate::coordinator::JobCoordinator;
use crate::error::{ApiError, FriendlyError, UploadError, ValidationError, humanize};
use crate::record::{JobRecord, OptionSet, Timestamp};
use crate::store::KeyValueStore;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum UploadStage {
    Idle,
    Uploading { percent: u8 },
    Processing,
    Done,
    Error { error: FriendlyError },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: PathBuf,
    pub template: String,
    pub options: OptionSet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Completed(JobRecord),
    Cancelled,
}

/// Client-side file checks run before anything touches the network.
#[derive(Debug, Clone)]
pub struct FileRules {
    max_bytes: u64,
    extension: Regex,
}

impl FileRules {
    pub fn new(cfg: &UploadConfig) -> Result<Self> {
        let exts = cfg
            .allowed_extensions
            .iter()
            .map(|e| regex::escape(e.trim_start_matches('.')))
            .collect::<Vec<_>>()
            .join("|");
        let extension = Regex::new(&format!(r"(?i)\.({exts})$"))
            .with_context(|| "building allowed-extension pattern")?;
        Ok(Self {
            max_bytes: cfg.max_bytes,
            extension,
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Returns the file size on success.
    pub fn check(&self, path: &Path) -> Result<u64, ValidationError> {
        if path.as_os_str().is_empty() {
            return Err(ValidationError::MissingFile);
        }
        let shown = path.display().to_string();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if !self.extension.is_match(name) {
            return Err(ValidationError::UnsupportedExtension(shown));
        }
        let meta = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(ValidationError::NotFound(shown)),
        };
        let size = meta.len();
        if size == 0 {
            return Err(ValidationError::Empty(shown));
        }
        if size > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        Ok(size)
    }
}

pub struct Uploader<S: KeyValueStore, A: JobApi, F: FormatService> {
    coordinator: Arc<JobCoordinator<S, A>>,
    service: Arc<F>,
    rules: FileRules,
    current: Mutex<Option<CancellationToken>>,
    attempt: Arc<AtomicU64>,
    stage: Arc<watch::Sender<UploadStage>>,
}

impl<S: KeyValueStore, A: JobApi, F: FormatService> Uploader<S, A, F> {
    pub fn new(coordinator: Arc<JobCoordinator<S, A>>, service: Arc<F>, rules: FileRules) -> Self {
        let (stage, _) = watch::channel(UploadStage::Idle);
        Self {
            coordinator,
            service,
            rules,
            current: Mutex::new(None),
            attempt: Arc::new(AtomicU64::new(0)),
            stage: Arc::new(stage),
        }
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator<S, A>> {
        &self.coordinator
    }

    pub fn stage(&self) -> UploadStage {
        self.stage.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadStage> {
        self.stage.subscribe()
    }

    /// Cancel whatever upload is in flight. No-op when idle.
    pub fn cancel(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(token) = current.as_ref() {
                info!("cancelling upload");
                token.cancel();
            }
        }
    }

    pub fn reset(&self) {
        self.cancel();
        self.stage.send_replace(UploadStage::Idle);
    }

    fn in_flight(&self) -> bool {
        self.current.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Start a new attempt, cancelling the previous one.
    fn begin(&self) -> (u64, CancellationToken) {
        let token = CancellationToken::new();
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut current) = self.current.lock() {
            if let Some(prev) = current.replace(token.clone()) {
                debug!("superseding previous upload");
                prev.cancel();
            }
        }
        (attempt, token)
    }

    fn finish(&self, attempt: u64) {
        if self.attempt.load(Ordering::SeqCst) != attempt {
            return;
        }
        if let Ok(mut current) = self.current.lock() {
            current.take();
        }
    }

    fn set_stage(&self, attempt: u64, stage: UploadStage) {
        set_stage_if_current(&self.stage, &self.attempt, attempt, stage);
    }

    pub async fn submit(&self, req: UploadRequest) -> Result<UploadOutcome, UploadError> {
        let size = match self.rules.check(&req.path) {
            Ok(size) => size,
            Err(err) => {
                let err = UploadError::from(err);
                // An upload in flight keeps the stage; the caller still gets the error.
                if self.in_flight() {
                    debug!("rejected file while an upload is in flight: {err}");
                } else {
                    self.stage.send_replace(UploadStage::Error {
                        error: humanize(&err, self.rules.max_bytes()),
                    });
                }
                return Err(err);
            }
        };

        let (attempt, token) = self.begin();
        self.set_stage(attempt, UploadStage::Uploading { percent: 1 });

        let filename = req
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = match tokio::fs::read(&req.path).await {
            Ok(bytes) => bytes,
            Err(source) => {
                let err = UploadError::Io {
                    path: req.path.display().to_string(),
                    source,
                };
                self.fail(attempt, &err);
                return Err(err);
            }
        };

        if token.is_cancelled() {
            self.set_stage(attempt, UploadStage::Cancelled);
            self.finish(attempt);
            return Ok(UploadOutcome::Cancelled);
        }

        info!(%filename, template = %req.template, bytes = size, "uploading");
        let progress = self.progress_fn(attempt);
        let format_req = FormatRequest {
            filename: filename.clone(),
            bytes,
            template: req.template.clone(),
            options: req.options.clone(),
        };
        let result = self
            .service
            .submit_archive(format_req, progress, token.clone())
            .await;

        if token.is_cancelled() || matches!(result, Err(ApiError::Cancelled)) {
            info!(%filename, "upload cancelled");
            self.set_stage(attempt, UploadStage::Cancelled);
            self.finish(attempt);
            return Ok(UploadOutcome::Cancelled);
        }

        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                let err = UploadError::Api(err);
                self.fail(attempt, &err);
                return Err(err);
            }
        };

        self.set_stage(attempt, UploadStage::Processing);
        let download_url = resp
            .download_location
            .clone()
            .unwrap_or_else(|| self.service.download_url(&resp.job_id));
        if !resp.warnings.is_empty() {
            warn!(job_id = %resp.job_id, warnings = ?resp.warnings, "service reported warnings");
        }
        let record = JobRecord {
            id: resp.job_id,
            created_at: Timestamp::now(),
            filename: Some(filename),
            size: Some(size),
            template: req.template,
            options: req.options,
            warnings: resp.warnings,
            download_url: Some(download_url),
        };
        self.coordinator.record_completed_job(record.clone());
        self.set_stage(attempt, UploadStage::Done);
        self.finish(attempt);
        Ok(UploadOutcome::Completed(record))
    }

    fn fail(&self, attempt: u64, err: &UploadError) {
        warn!("upload failed: {err}");
        self.set_stage(
            attempt,
            UploadStage::Error {
                error: humanize(err, self.rules.max_bytes()),
            },
        );
        self.finish(attempt);
    }

    fn progress_fn(&self, attempt: u64) -> ProgressFn {
        let stage = Arc::clone(&self.stage);
        let generation = Arc::clone(&self.attempt);
        Arc::new(move |percent| {
            set_stage_if_current(&stage, &generation, attempt, UploadStage::Uploading { percent });
        })
    }
}

fn set_stage_if_current(
    stage: &watch::Sender<UploadStage>,
    generation: &AtomicU64,
    attempt: u64,
    next: UploadStage,
) {
    if generation.load(Ordering::SeqCst) == attempt {
        stage.send_replace(next);
    }
}
