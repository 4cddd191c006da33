//! In-process file server and fixtures shared by the integration tests.

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, StreamExt};
use modsync_agent::fs::hash::hash_bytes;
use modsync_agent::fs::is_transfer_artifact;
use modsync_agent::transfer::{ConnectionQuality, StrategyMode};
use modsync_agent::Config;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Default)]
struct ServerState {
    files: Mutex<BTreeMap<String, Bytes>>,
    unhashed: Mutex<HashSet<String>>,
    manifest_body: Mutex<Option<String>>,
    no_ranges: AtomicBool,
    ignore_ranges: AtomicBool,
    truncated: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    corrupted: Mutex<HashSet<String>>,
    failing_heads: Mutex<HashSet<String>>,
    /// (key, Range header) of every GET
    gets: Mutex<Vec<(String, Option<String>)>>,
    /// key of every HEAD
    heads: Mutex<Vec<String>>,
}

/// Serves `/manifest` and `/file/{path}` from memory on an ephemeral port.
pub struct TestServer {
    url: String,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/manifest", get(manifest))
            .route("/file/{*path}", get(get_file).head(head_file))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
            state,
            handle,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn put(&self, key: &str, content: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::copy_from_slice(content));
    }

    /// List `key` in the manifest with `"hash": null`.
    pub fn without_hash(&self, key: &str) {
        self.state.unhashed.lock().unwrap().insert(key.to_string());
    }

    /// Replace the manifest body verbatim.
    pub fn set_manifest_body(&self, body: &str) {
        *self.state.manifest_body.lock().unwrap() = Some(body.to_string());
    }

    /// Ignore `Range` headers and never advertise `Accept-Ranges`.
    pub fn disable_ranges(&self) {
        self.state.no_ranges.store(true, Ordering::SeqCst);
    }

    /// Keep advertising `Accept-Ranges` but answer every GET with a full `200`.
    pub fn ignore_ranges(&self) {
        self.state.ignore_ranges.store(true, Ordering::SeqCst);
    }

    /// Serve only the first half of every response body for `key`.
    pub fn truncate(&self, key: &str) {
        self.state.truncated.lock().unwrap().insert(key.to_string());
    }

    /// Send the first KiB of `key` and then hang.
    pub fn stall(&self, key: &str) {
        self.state.stalled.lock().unwrap().insert(key.to_string());
    }

    /// Flip the first byte of every response body for `key`; HEAD still
    /// advertises the hash of the real content.
    pub fn corrupt(&self, key: &str) {
        self.state.corrupted.lock().unwrap().insert(key.to_string());
    }

    /// Answer every HEAD for `key` with `503`.
    pub fn fail_heads(&self, key: &str) {
        self.state.failing_heads.lock().unwrap().insert(key.to_string());
    }

    /// Number of HEAD requests seen for `key`.
    pub fn heads(&self, key: &str) -> usize {
        self.state.heads.lock().unwrap().iter().filter(|k| *k == key).count()
    }

    /// Range headers of every GET for `key`, in arrival order.
    pub fn gets(&self, key: &str) -> Vec<Option<String>> {
        self.state
            .gets
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, range)| range.clone())
            .collect()
    }

    pub fn total_gets(&self) -> usize {
        self.state.gets.lock().unwrap().len()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn manifest(State(state): State<Arc<ServerState>>) -> Response {
    if let Some(body) = state.manifest_body.lock().unwrap().clone() {
        return body.into_response();
    }

    let unhashed = state.unhashed.lock().unwrap().clone();
    let files = state.files.lock().unwrap();
    let entries: serde_json::Map<String, serde_json::Value> = files
        .iter()
        .map(|(key, content)| {
            let hash = if unhashed.contains(key) {
                serde_json::Value::Null
            } else {
                serde_json::Value::String(hash_bytes(content))
            };
            (key.clone(), serde_json::json!({ "size": content.len(), "hash": hash }))
        })
        .collect();
    axum::Json(serde_json::Value::Object(entries)).into_response()
}

async fn head_file(
    State(state): State<Arc<ServerState>>,
    UrlPath(key): UrlPath<String>,
) -> Response {
    state.heads.lock().unwrap().push(key.clone());
    if state.failing_heads.lock().unwrap().contains(&key) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let Some(content) = state.files.lock().unwrap().get(&key).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, content.len())
        .header("x-file-hash", hash_bytes(&content));
    if !state.no_ranges.load(Ordering::SeqCst) {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }
    builder.body(Body::empty()).unwrap()
}

async fn get_file(
    State(state): State<Arc<ServerState>>,
    UrlPath(key): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.gets.lock().unwrap().push((key.clone(), range_header));

    let Some(content) = state.files.lock().unwrap().get(&key).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let total = content.len() as u64;

    let full_only =
        state.no_ranges.load(Ordering::SeqCst) || state.ignore_ranges.load(Ordering::SeqCst);
    let ranged = if full_only {
        None
    } else {
        parse_range(&headers, total)
    };
    let (status, mut body) = match ranged {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            content.slice(start as usize..=end as usize),
        ),
        None => (StatusCode::OK, content.clone()),
    };

    if state.truncated.lock().unwrap().contains(&key) {
        body = body.slice(..body.len() / 2);
    }
    if state.corrupted.lock().unwrap().contains(&key) && !body.is_empty() {
        let mut flipped = body.to_vec();
        flipped[0] ^= 0xff;
        body = Bytes::from(flipped);
    }

    let mut builder = Response::builder().status(status);
    if !state.no_ranges.load(Ordering::SeqCst) {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }
    if let Some((start, end)) = ranged {
        let value = format!("bytes {}-{}/{}", start, end, total);
        builder = builder.header(header::CONTENT_RANGE, value);
    }

    if state.stalled.lock().unwrap().contains(&key) {
        let head = body.slice(..body.len().min(1024));
        let stream = stream::once(async move { Ok::<Bytes, std::io::Error>(head) })
            .chain(stream::pending());
        return builder.body(Body::from_stream(stream)).unwrap();
    }
    builder.body(Body::from(body)).unwrap()
}

fn parse_range(headers: &HeaderMap, total: u64) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        total.checked_sub(1)?
    } else {
        end.parse::<u64>().ok()?.min(total.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}

/// Config pointed at `server` with a fixed profile, fast retries and no
/// free-space margin.
pub fn config_for(server: &TestServer) -> Config {
    let mut config = Config::default();
    config.server.url = server.url().to_string();
    config.strategy.mode = StrategyMode::Custom;
    config.strategy.connection_quality = Some(ConnectionQuality::Fast);
    config.sync.retry_delay_ms = 10;
    config.sync.timeout_secs = 5;
    config.sync.stream_timeout_secs = 30;
    config.backup.safety_margin_bytes = 0;
    config
}

/// Deterministic pseudo-random content.
pub fn content(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

pub fn write(root: &Path, key: &str, content: &[u8]) {
    let path = root.join(key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn read(root: &Path, key: &str) -> Option<Vec<u8>> {
    std::fs::read(root.join(key)).ok()
}

/// Visible files under `root`, relative and `/`-separated.
pub fn visible_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

/// Temp and part files left anywhere under `root`.
pub fn transfer_artifacts(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| is_transfer_artifact(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect()
}
