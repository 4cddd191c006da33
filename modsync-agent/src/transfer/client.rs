//! HTTP client for the file server.
//!
//! Endpoints consumed:
//! - `GET /manifest` → `{ "<path>": { "size": n, "hash": "<hex>" | null } }`
//! - `HEAD /file/{path}` → `Content-Length`, `Accept-Ranges`, `X-File-Hash`
//! - `GET /file/{path}` with optional `Range: bytes=start-[end]`

use crate::{Result, SyncError};
use bytes::Bytes;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Response, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

const FILE_HASH_HEADER: &str = "x-file-hash";

/// Metadata returned by `HEAD /file/{path}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHead {
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
    pub hash: Option<String>,
}

/// Byte range `start..=end`; `end = None` means "to the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn span(start: u64, end: u64) -> Self {
        Self { start, end: Some(end) }
    }

    fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Thin wrapper over a shared `reqwest::Client` bound to one server.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base: Url,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl RemoteClient {
    /// `request_timeout` bounds connects and metadata requests; `stream_timeout`
    /// bounds whole streaming bodies.
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        stream_timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("invalid server url {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::Config(format!("server url {} cannot be a base", base_url)));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .user_agent(concat!("modsync-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base,
            request_timeout,
            stream_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("server url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// URL of `/file/{key}`, each path segment percent-encoded.
    pub fn file_url(&self, key: &str) -> Result<Url> {
        let mut segments = vec!["file"];
        segments.extend(key.split('/'));
        self.endpoint(&segments)
    }

    /// Fetch the raw manifest body. Transport failures and error statuses are
    /// `RemoteUnavailable`.
    pub async fn fetch_manifest(&self) -> Result<Bytes> {
        let url = self.endpoint(&["manifest"])?;
        let resp = self
            .http
            .get(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        if !resp.status().is_success() {
            return Err(SyncError::RemoteUnavailable(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }

        resp.bytes().await.map_err(|e| unavailable(&url, e))
    }

    /// `HEAD /file/{key}`.
    pub async fn head_file(&self, key: &str) -> Result<FileHead> {
        let url = self.file_url(key)?;
        let resp = self
            .http
            .head(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        if !resp.status().is_success() {
            return Err(SyncError::RemoteUnavailable(format!(
                "HEAD {} returned {}",
                url,
                resp.status()
            )));
        }

        let headers = resp.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("bytes"))
            .unwrap_or(false);
        let hash = headers
            .get(FILE_HASH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        Ok(FileHead {
            content_length,
            accepts_ranges,
            hash,
        })
    }

    /// Whether the server answers a HEAD for `key` at all.
    pub async fn is_reachable(&self, key: &str) -> bool {
        match self.head_file(key).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Reachability check for {} failed: {}", key, e);
                false
            }
        }
    }

    /// `GET /file/{key}`, optionally ranged. Non-success statuses are errors;
    /// callers inspect `200` vs `206` themselves.
    pub async fn get_file(&self, key: &str, range: Option<ByteRange>) -> Result<Response> {
        let url = self.file_url(key)?;
        let mut request = self.http.get(url.clone()).timeout(self.stream_timeout);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let resp = request.send().await.map_err(|e| unavailable(&url, e))?;
        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(SyncError::RemoteUnavailable(format!("{} rejected range request", url)));
        }
        if !status.is_success() {
            return Err(SyncError::RemoteUnavailable(format!("GET {} returned {}", url, status)));
        }
        Ok(resp)
    }

    /// Plain GET of an arbitrary server path (used by the speed probe).
    pub async fn get_path(&self, path: &str) -> Result<Response> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let url = self.endpoint(&segments)?;
        let resp = self
            .http
            .get(url.clone())
            .timeout(self.stream_timeout)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;
        resp.error_for_status().map_err(|e| unavailable(&url, e))
    }
}

fn unavailable(url: &Url, e: reqwest::Error) -> SyncError {
    SyncError::RemoteUnavailable(format!("{}: {}", url, e))
}

/// Parse `Content-Range: bytes start-end/total` into `(start, end, total)`.
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    if end < start {
        return None;
    }
    Some((start, end, total))
}

/// Start offset a `206` response actually serves, if it declares one.
pub fn served_range_start(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
        .map(|(start, _, _)| start)
}
