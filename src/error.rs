//! Error taxonomy for the formatting service and the upload flow.

use serde::Serialize;
use thiserror::Error;

/// Failures talking to the formatting service or the remote job store.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Connection refused, DNS failure, timeout, dropped transfer.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status.
    #[error("request failed with status {status}: {detail}")]
    Status { status: u16, detail: String },

    /// The response body was not the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

impl ApiError {
    /// HTTP status, with 0 standing in for "no response".
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Status { status, .. } => *status,
            _ => 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ApiError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return ApiError::Status {
                status: status.as_u16(),
                detail: err.to_string(),
            };
        }
        ApiError::Network(err.to_string())
    }
}

/// Problems with the selected file, caught before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no file selected")]
    MissingFile,

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("unsupported file type: {0} (expected a .zip project or a single .tex file)")]
    UnsupportedExtension(String),

    #[error("file too large ({size} bytes, max {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("file is empty: {0}")]
    Empty(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A user-facing title and message for a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendlyError {
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl FriendlyError {
    fn new(title: &str, message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            title: title.to_string(),
            message: message.into(),
            status,
        }
    }
}

pub fn humanize_api(err: &ApiError, max_upload_bytes: u64) -> FriendlyError {
    let status = err.status();
    match status {
        413 => FriendlyError::new(
            "File too large",
            format!(
                "Max upload size is {} MB. Please split the project or upload a smaller file.",
                max_upload_bytes / (1024 * 1024)
            ),
            Some(413),
        ),
        429 => FriendlyError::new(
            "Too many requests",
            "You've hit the rate limit. Please try again in a minute.",
            Some(429),
        ),
        s if s >= 500 => FriendlyError::new("Server error", detail_of(err), Some(s)),
        s if s >= 400 => FriendlyError::new("Request error", detail_of(err), Some(s)),
        _ => {
            let mut message = detail_of(err);
            if matches!(err, ApiError::Network(_)) {
                message.push_str(" (Check the API URL and that the service is reachable)");
            }
            FriendlyError::new("Request failed", message, None)
        }
    }
}

pub fn humanize(err: &UploadError, max_upload_bytes: u64) -> FriendlyError {
    match err {
        UploadError::Validation(ValidationError::MissingFile) => FriendlyError::new(
            "No file selected",
            "Please choose a .zip project or a .tex file.",
            None,
        ),
        UploadError::Validation(ValidationError::TooLarge { max, .. }) => {
            let mb = (*max as f64 / (1024.0 * 1024.0) * 10.0).round() / 10.0;
            FriendlyError::new(
                "File too large",
                format!("File too large (max {mb} MB). Consider splitting the project."),
                None,
            )
        }
        UploadError::Validation(v) => FriendlyError::new("Invalid file", v.to_string(), None),
        UploadError::Api(api) => humanize_api(api, max_upload_bytes),
        UploadError::Io { .. } => FriendlyError::new("Invalid file", err.to_string(), None),
    }
}

fn detail_of(err: &ApiError) -> String {
    match err {
        ApiError::Status { detail, .. } if !detail.is_empty() => detail.clone(),
        ApiError::Network(msg) | ApiError::Decode(msg) => msg.clone(),
        other => other.to_string(),
    }
}
