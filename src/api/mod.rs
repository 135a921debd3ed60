pub mod http;
pub mod types;

use crate::error::ApiError;
use crate::record::JobRecord;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use http::HttpApi;
pub use types::{FormatRequest, FormatResponse, ProgressFn};

/// The remote job store. Callers treat every mutation as best-effort.
#[async_trait]
pub trait JobApi: Send + Sync + 'static {
    /// Authoritative server-side list. Unreachable or non-success is an error, never empty.
    async fn list_jobs(&self) -> Result<Vec<JobRecord>, ApiError>;
    async fn create_job(&self, record: &JobRecord) -> Result<(), ApiError>;
    async fn delete_job(&self, id: &str) -> Result<(), ApiError>;
    async fn clear_jobs(&self) -> Result<(), ApiError>;
}

/// The formatting engine's submission endpoint.
#[async_trait]
pub trait FormatService: Send + Sync + 'static {
    /// Upload an archive. Returns [`ApiError::Cancelled`] once `cancel` fires.
    async fn submit_archive(
        &self,
        req: FormatRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FormatResponse, ApiError>;

    /// Download location for a job when the service did not return one.
    fn download_url(&self, job_id: &str) -> String;
}
