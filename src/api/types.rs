use crate::record::{OptionSet, normalize_warnings};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Upload progress in percent.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FormatRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub template: String,
    pub options: OptionSet,
}

/// Normalized result of a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatResponse {
    pub job_id: String,
    pub warnings: Vec<String>,
    pub download_location: Option<String>,
}

/// Submission response as the service sends it.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawFormatResponse {
    #[serde(alias = "jobId")]
    pub job_id: String,
    #[serde(default)]
    pub warnings: Option<serde_json::Value>,
    #[serde(default, alias = "downloadUrl")]
    pub download_url: Option<String>,
}

impl RawFormatResponse {
    pub(crate) fn normalize(self, base: &Url) -> FormatResponse {
        FormatResponse {
            job_id: self.job_id.trim().to_string(),
            warnings: normalize_warnings(self.warnings),
            download_location: self
                .download_url
                .filter(|u| !u.trim().is_empty())
                .map(|u| resolve_location(base, &u)),
        }
    }
}

/// Resolve a location the service handed back (absolute, `/download/x`,
/// `download/x` or `//host/x`) against the service base URL.
pub fn resolve_location(base: &Url, location: &str) -> String {
    let location = location.trim();
    match base.join(location) {
        Ok(url) => url.into(),
        Err(_) => location.to_string(),
    }
}

/// Percent for `sent` of `total` bytes while the transfer is still open.
pub fn transfer_percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 99;
    }
    let pct = ((sent as f64 / total as f64) * 100.0).round() as u64;
    pct.clamp(1, 99) as u8
}
