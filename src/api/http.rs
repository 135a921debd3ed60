use super::types::{FormatRequest, FormatResponse, ProgressFn, RawFormatResponse, transfer_percent};
use super::{FormatService, JobApi};
use crate::config::Api as ApiConfig;
use crate::error::ApiError;
use crate::record::JobRecord;
use crate::util::truncate_for_log;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Formatting service and job store over HTTP.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base: Url,
    request_timeout: Option<Duration>,
    upload_timeout: Option<Duration>,
}

impl HttpApi {
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_seconds.max(1)))
            .build()
            .with_context(|| "building HTTP client")?;
        Ok(Self {
            client,
            base: parse_base(&cfg.base_url)?,
            request_timeout: secs(cfg.request_timeout_seconds),
            upload_timeout: secs(cfg.upload_timeout_seconds),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    pub async fn health(&self) -> Result<serde_json::Value, ApiError> {
        let req = self.with_timeout(self.client.get(self.endpoint(&["health"])), self.request_timeout);
        let resp = send(req).await?;
        read_json(resp).await
    }

    /// `segments` are appended to the base path, each percent-encoded on its own.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn with_timeout(&self, req: RequestBuilder, timeout: Option<Duration>) -> RequestBuilder {
        match timeout {
            Some(t) => req.timeout(t),
            None => req,
        }
    }
}

/// Parse the configured base URL into directory form (`.../`) so relative joins
/// land under it.
fn parse_base(raw: &str) -> Result<Url> {
    let mut base = Url::parse(raw.trim()).with_context(|| format!("invalid api.base_url: {raw:?}"))?;
    if base.cannot_be_a_base() {
        return Err(anyhow!("api.base_url is not an http(s) URL: {raw:?}"));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.set_query(None);
    base.set_fragment(None);
    Ok(base)
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

/// `POST /jobs` body. The job store keeps the body as sent and echoes it from
/// `GET /jobs`, so the download location goes out under one spelling only.
fn create_job_body(record: &JobRecord) -> Result<serde_json::Value, ApiError> {
    let mut body = serde_json::to_value(record).map_err(|e| ApiError::Decode(e.to_string()))?;
    if let Some(obj) = body.as_object_mut() {
        obj.remove("downloadUrl");
        if let Some(url) = &record.download_url {
            obj.insert("download_url".into(), serde_json::Value::String(url.clone()));
        }
    }
    Ok(body)
}

/// `GET /jobs` payload: a bare array or `{"jobs": [...]}`. Anything else is an
/// error, never an empty list.
fn decode_listing(body: &str) -> Result<Vec<JobRecord>, ApiError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Listing {
        Bare(Vec<JobRecord>),
        Wrapped { jobs: Vec<JobRecord> },
    }

    match serde_json::from_str::<Listing>(body) {
        Ok(Listing::Bare(jobs) | Listing::Wrapped { jobs }) => Ok(jobs),
        Err(e) => Err(ApiError::Decode(format!(
            "job listing: {e}: {}",
            truncate_for_log(body, MAX_ERROR_BODY_LENGTH)
        ))),
    }
}

#[async_trait]
impl JobApi for HttpApi {
    async fn list_jobs(&self) -> Result<Vec<JobRecord>, ApiError> {
        let req = self
            .client
            .get(self.endpoint(&["jobs"]))
            .header(reqwest::header::CACHE_CONTROL, "no-store");
        let resp = send(self.with_timeout(req, self.request_timeout)).await?;
        let text = resp.text().await.map_err(ApiError::from_reqwest)?;
        decode_listing(&text)
    }

    async fn create_job(&self, record: &JobRecord) -> Result<(), ApiError> {
        let body = create_job_body(record)?;
        let req = self.client.post(self.endpoint(&["jobs"])).json(&body);
        send(self.with_timeout(req, self.request_timeout)).await?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<(), ApiError> {
        let req = self.client.delete(self.endpoint(&["jobs", id]));
        send(self.with_timeout(req, self.request_timeout)).await?;
        Ok(())
    }

    async fn clear_jobs(&self) -> Result<(), ApiError> {
        let req = self.client.delete(self.endpoint(&["jobs"]));
        send(self.with_timeout(req, self.request_timeout)).await?;
        Ok(())
    }
}

#[async_trait]
impl FormatService for HttpApi {
    async fn submit_archive(
        &self,
        req: FormatRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FormatResponse, ApiError> {
        let total = req.bytes.len() as u64;
        let mime = mime_for(&req.filename);
        let body = progress_body(req.bytes, progress.clone());
        let part = Part::stream_with_length(body, total)
            .file_name(req.filename.clone())
            .mime_str(mime)
            .map_err(ApiError::from_reqwest)?;
        let form = Form::new()
            .part("archive", part)
            .text("template", req.template.clone())
            .text("options", req.options.to_csv());

        debug!(
            filename = %req.filename,
            template = %req.template,
            bytes = total,
            "submitting archive"
        );

        let request = self.with_timeout(
            self.client.post(self.endpoint(&["format"])).multipart(form),
            self.upload_timeout,
        );
        let exchange = async {
            let resp = send(request).await?;
            read_json::<RawFormatResponse>(resp).await
        };

        // Dropping the exchange future aborts the transfer.
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            res = exchange => res?,
        };
        if raw.job_id.trim().is_empty() {
            return Err(ApiError::Decode("response has an empty job_id".into()));
        }
        progress(100);
        Ok(raw.normalize(&self.base))
    }

    fn download_url(&self, job_id: &str) -> String {
        self.endpoint(&["download", job_id]).into()
    }
}

fn progress_body(bytes: Vec<u8>, progress: ProgressFn) -> Body {
    let total = bytes.len() as u64;
    let chunks: Vec<Vec<u8>> = bytes.chunks(UPLOAD_CHUNK_BYTES).map(<[u8]>::to_vec).collect();
    let mut sent = 0u64;
    let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len() as u64;
        progress(transfer_percent(sent, total));
        Ok::<_, std::io::Error>(chunk)
    }));
    Body::wrap_stream(stream)
}

fn mime_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        "application/zip"
    } else if lower.ends_with(".tex") {
        "application/x-tex"
    } else {
        "application/octet-stream"
    }
}

async fn send(req: RequestBuilder) -> Result<Response, ApiError> {
    let resp = req.send().await.map_err(ApiError::from_reqwest)?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn status_error(status: StatusCode, body: &str) -> ApiError {
    let detail = error_detail(body);
    warn!(status = status.as_u16(), detail = %detail, "request failed");
    ApiError::Status {
        status: status.as_u16(),
        detail,
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(resp: Response) -> Result<T, ApiError> {
    let text = resp.text().await.map_err(ApiError::from_reqwest)?;
    serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Pull a message out of `{"detail": ...}` / `{"message": ...}`, else the raw body.
fn error_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "message"] {
            match value.get(key) {
                Some(serde_json::Value::String(s)) => return truncate_for_log(s, MAX_ERROR_BODY_LENGTH),
                Some(serde_json::Value::Null) | None => {}
                Some(other) => return truncate_for_log(&other.to_string(), MAX_ERROR_BODY_LENGTH),
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Unexpected error".to_string()
    } else {
        truncate_for_log(trimmed, MAX_ERROR_BODY_LENGTH)
    }
}
