//! Job source coordinator: one read model over the remote job store and the
//! local job cache.
//!
//! Reads are remote-first. A reachable remote is authoritative even when it
//! returns nothing; only a failed remote call falls back to the cache. The two
//! lists are never merged.
//!
//! Writes hit the cache synchronously and are mirrored to the remote store on a
//! detached task whose outcome is only logged.

use crate::api::JobApi;
use crate::cache::LocalJobCache;
use crate::record::JobRecord;
use crate::store::KeyValueStore;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Where the last `get_jobs` answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Remote,
    Local,
}

pub struct JobCoordinator<S: KeyValueStore, A: JobApi> {
    cache: LocalJobCache<S>,
    remote: Arc<A>,
    write_through: bool,
    tasks: TaskTracker,
}

impl<S: KeyValueStore, A: JobApi> JobCoordinator<S, A> {
    pub fn new(cache: LocalJobCache<S>, remote: Arc<A>) -> Self {
        Self {
            cache,
            remote,
            write_through: false,
            tasks: TaskTracker::new(),
        }
    }

    /// Whether records from a successful remote listing are upserted into the cache.
    pub fn with_write_through(mut self, enabled: bool) -> Self {
        self.write_through = enabled;
        self
    }

    pub fn cache(&self) -> &LocalJobCache<S> {
        &self.cache
    }

    pub async fn get_jobs(&self) -> Vec<JobRecord> {
        self.get_jobs_with_source().await.0
    }

    pub async fn get_jobs_with_source(&self) -> (Vec<JobRecord>, JobSource) {
        match self.remote.list_jobs().await {
            Ok(mut jobs) => {
                jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                debug!(count = jobs.len(), "jobs from remote");
                if self.write_through {
                    self.cache.save_all(jobs.clone());
                }
                (jobs, JobSource::Remote)
            }
            Err(err) => {
                warn!("remote job list failed, using local cache: {err}");
                (self.cache.list(), JobSource::Local)
            }
        }
    }

    /// Record a finished upload. The cache write is done when this returns.
    pub fn record_completed_job(&self, record: JobRecord) {
        info!(id = %record.id, template = %record.template, "recording job");
        self.cache.save(record.clone());

        let remote = Arc::clone(&self.remote);
        self.tasks.spawn(async move {
            match remote.create_job(&record).await {
                Ok(()) => debug!(id = %record.id, "job mirrored to remote"),
                Err(err) => warn!(id = %record.id, "job mirror failed: {err}"),
            }
        });
    }

    /// Remove a job from the cache now, and from the remote store if it cooperates.
    pub fn delete_job(&self, id: &str) {
        self.cache.remove(id);

        let remote = Arc::clone(&self.remote);
        let id = id.to_string();
        self.tasks.spawn(async move {
            match remote.delete_job(&id).await {
                Ok(()) => debug!(id = %id, "remote job deleted"),
                Err(err) => warn!(id = %id, "remote job delete failed: {err}"),
            }
        });
    }

    /// Clears the local cache only. Remote history is left alone.
    pub fn clear_all(&self) {
        info!("clearing local job cache");
        self.cache.clear();
    }

    /// Wait for detached remote mutations started so far.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
