#![allow(dead_code)]

use async_trait::async_trait;
use formatdesk::api::{FormatRequest, FormatResponse, FormatService, JobApi, ProgressFn};
use formatdesk::cache::LocalJobCache;
use formatdesk::coordinator::JobCoordinator;
use formatdesk::error::ApiError;
use formatdesk::record::{JobRecord, Timestamp};
use formatdesk::store::MemoryStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub fn job(id: &str, created_at: i64) -> JobRecord {
    let mut rec = JobRecord::new(id, Timestamp(created_at), "aastex");
    rec.filename = Some(format!("{id}.zip"));
    rec
}

pub fn ids(records: &[JobRecord]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
}

#[derive(Debug, Clone)]
pub enum Submit {
    Respond(FormatResponse),
    Fail { status: u16, detail: String },
    /// Never answers; only cancellation ends the call.
    Hang,
}

/// In-process stand-in for the formatting service and the remote job store.
pub struct MockApi {
    /// `None` makes `list_jobs` fail with a network error.
    pub listing: Mutex<Option<Vec<JobRecord>>>,
    /// Makes `list_jobs` stall briefly and then report a timeout.
    pub listing_times_out: AtomicBool,
    pub mutations_fail: Mutex<bool>,
    pub created: Mutex<Vec<JobRecord>>,
    pub deleted: Mutex<Vec<String>>,
    pub clear_calls: AtomicUsize,
    pub submits: Mutex<VecDeque<Submit>>,
    pub submit_calls: AtomicUsize,
    pub started: Notify,
}

impl MockApi {
    pub fn reachable(listing: Vec<JobRecord>) -> Arc<Self> {
        Arc::new(Self::with_listing(Some(listing)))
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self::with_listing(None))
    }

    fn with_listing(listing: Option<Vec<JobRecord>>) -> Self {
        Self {
            listing: Mutex::new(listing),
            listing_times_out: AtomicBool::new(false),
            mutations_fail: Mutex::new(false),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            clear_calls: AtomicUsize::new(0),
            submits: Mutex::new(VecDeque::new()),
            submit_calls: AtomicUsize::new(0),
            started: Notify::new(),
        }
    }

    pub fn time_out_listing(&self) {
        self.listing_times_out.store(true, Ordering::SeqCst);
    }

    pub fn fail_mutations(&self) {
        *self.mutations_fail.lock().unwrap() = true;
    }

    pub fn push_submit(&self, behavior: Submit) {
        self.submits.lock().unwrap().push_back(behavior);
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created.lock().unwrap().iter().map(|r| r.id.clone()).collect()
    }

    fn mutation_result(&self) -> Result<(), ApiError> {
        if *self.mutations_fail.lock().unwrap() {
            Err(ApiError::Status {
                status: 503,
                detail: "unavailable".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobApi for MockApi {
    async fn list_jobs(&self) -> Result<Vec<JobRecord>, ApiError> {
        if self.listing_times_out.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(ApiError::Network("operation timed out".into()));
        }
        self.listing
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ApiError::Network("connection refused".into()))
    }

    async fn create_job(&self, record: &JobRecord) -> Result<(), ApiError> {
        self.mutation_result()?;
        self.created.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<(), ApiError> {
        self.mutation_result()?;
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn clear_jobs(&self) -> Result<(), ApiError> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        self.mutation_result()
    }
}

#[async_trait]
impl FormatService for MockApi {
    async fn submit_archive(
        &self,
        _req: FormatRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FormatResponse, ApiError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.submits.lock().unwrap().pop_front().unwrap_or(Submit::Hang);
        progress(50);
        self.started.notify_one();
        match behavior {
            Submit::Respond(resp) => {
                progress(100);
                Ok(resp)
            }
            Submit::Fail { status, detail } => Err(ApiError::Status { status, detail }),
            Submit::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        Err(ApiError::Network("timed out".into()))
                    }
                }
            }
        }
    }

    fn download_url(&self, job_id: &str) -> String {
        format!("http://formatter.test/download/{job_id}")
    }
}

pub fn coordinator(api: Arc<MockApi>) -> JobCoordinator<Arc<MemoryStore>, MockApi> {
    coordinator_with_store(api, Arc::new(MemoryStore::new()))
}

pub fn coordinator_with_store(
    api: Arc<MockApi>,
    store: Arc<MemoryStore>,
) -> JobCoordinator<Arc<MemoryStore>, MockApi> {
    JobCoordinator::new(LocalJobCache::new(store), api)
}
