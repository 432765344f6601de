//! Persistence and outbound HTTP plumbing: the datastore client, the paced
//! HTTP fetcher shared by adapters and the image resolver, and the
//! content-addressed snapshot store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use url::Url;
use uuid::Uuid;

pub mod datastore;

pub use datastore::{
    query_all, Condition, Datastore, DatastoreError, Filter, MemoryDatastore, RestDatastore, Row,
    RowId, DEFAULT_PAGE_SIZE,
};

pub const CRATE_NAME: &str = "ainews-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once snapshot store addressed by content hash.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYmmdd_HHMMSS>/<source>/<sha256>.<ext>`
    pub fn snapshot_relative_path(
        captured_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            other => other,
        };
        PathBuf::from(captured_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Serializes `value` as pretty JSON and stores it as a snapshot.
    pub async fn store_json<T: Serialize + ?Sized>(
        &self,
        captured_at: DateTime<Utc>,
        source: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {source} snapshot"))?;
        self.store_bytes(captured_at, source, "json", &bytes).await
    }

    /// Stores bytes once; a second store of identical content is reported as
    /// deduplicated and leaves the existing file untouched.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::snapshot_relative_path(captured_at, source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = write_once(&absolute_path, bytes).await?;
        debug!(
            path = %absolute_path.display(),
            bytes = bytes.len(),
            deduplicated,
            "stored snapshot"
        );

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Writes through a sibling temp file and renames into place. Returns `true`
/// when the destination already existed.
async fn write_once(dest: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = dest
        .parent()
        .with_context(|| format!("snapshot path {} has no parent", dest.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    if fs::try_exists(dest)
        .await
        .with_context(|| format!("checking snapshot path {}", dest.display()))?
    {
        return Ok(true);
    }

    let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, dest).await {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(true)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| format!("renaming snapshot into {}", dest.display()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Minimum spacing between two requests to the same host.
    pub host_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 8,
            host_delay: Duration::from_millis(500),
        }
    }
}

/// Spaces out requests per host. Each caller reserves the next free slot
/// before sleeping, so concurrent callers queue instead of bursting.
#[derive(Debug)]
pub struct HostPacer {
    min_interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub async fn wait_turn(&self, host: &str) {
        if self.min_interval.is_zero() {
            return;
        }
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(host).copied().filter(|at| *at > now).unwrap_or(now);
            slots.insert(host.to_string(), slot + self.min_interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url:?}")]
    InvalidUrl { url: String },
    #[error("http client is shutting down")]
    Closed,
}

/// Shared outbound HTTP client. One attempt per call; failures are returned
/// to the caller, which decides whether to skip or degrade.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    pacer: HostPacer,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            pacer: HostPacer::new(config.host_delay),
        })
    }

    async fn admit(&self, url: &str) -> Result<tokio::sync::SemaphorePermit<'_>, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| FetchError::InvalidUrl {
                url: url.to_string(),
            })?;
        let permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        self.pacer.wait_turn(&host).await;
        Ok(permit)
    }

    /// GET `url`; any non-success status is an error.
    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.admit(url).await?;
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }

    /// Header-only existence check; `Ok` only on a success status.
    pub async fn probe(&self, url: &str) -> Result<StatusCode, FetchError> {
        let _permit = self.admit(url).await?;
        async {
            let resp = self.client.head(url).send().await?;
            let status = resp.status();
            debug!(status = status.as_u16(), "probed");
            if status.is_success() {
                Ok(status)
            } else {
                Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                })
            }
        }
        .instrument(info_span!("http_probe", url))
        .await
    }
}
