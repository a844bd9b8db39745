//! Stage artifact storage and HTTP fetch utilities. The SQLite news store lives in `db`.

mod db;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub use db::{Appended, NewsStore, StoredNews};

pub const CRATE_NAME: &str = "newsflow-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once storage for the batches each stage hands forward.
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
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Directory holding everything a single run wrote.
    pub fn run_dir(&self, run_started_at: DateTime<Utc>) -> PathBuf {
        self.root.join(Self::run_stamp(run_started_at))
    }

    fn run_stamp(run_started_at: DateTime<Utc>) -> String {
        run_started_at.format("%Y%m%d_%H%M%S").to_string()
    }

    pub fn artifact_relative_path(
        &self,
        run_started_at: DateTime<Utc>,
        partition: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(Self::run_stamp(run_started_at))
            .join(partition)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write a stage batch under its content hash. Identical bytes for the same run and
    /// stage resolve to the existing file and come back marked `deduplicated`.
    pub async fn store_bytes(
        &self,
        run_started_at: DateTime<Utc>,
        partition: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(run_started_at, partition, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let written = write_once(&absolute_path, bytes).await?;
        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }

    pub async fn store_json<T: Serialize + ?Sized>(
        &self,
        run_started_at: DateTime<Utc>,
        partition: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {partition} artifact"))?;
        self.store_bytes(run_started_at, partition, "json", &bytes).await
    }
}

/// Publish `bytes` at `target` through a sibling temp file and a rename, so readers never
/// see a partial file. Returns `false` when `target` already exists.
async fn write_once(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let dir = target
        .parent()
        .with_context(|| format!("artifact path {} has no parent", target.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating artifact directory {}", dir.display()))?;
    if fs::try_exists(target)
        .await
        .with_context(|| format!("checking artifact path {}", target.display()))?
    {
        return Ok(false);
    }

    let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
    fs::write(&staging, bytes)
        .await
        .with_context(|| format!("staging artifact {}", staging.display()))?;
    let published = fs::rename(&staging, target).await;
    if published.is_err() {
        let _ = fs::remove_file(&staging).await;
    }
    match published {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("publishing artifact {}", target.display())),
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("api error {code}: {message}")]
    Api { code: String, message: String },
}

/// Thin JSON-over-HTTP client. Never retries; the orchestrator owns retry policy.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;
            decode_json(resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &B,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_post", url);
        async {
            let resp = self.send_post(url, bearer_token, body).await?;
            decode_json(resp).await
        }
        .instrument(span)
        .await
    }

    /// POST a JSON body and only check the status; the response body is ignored.
    pub async fn post_json_unit<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<(), FetchError> {
        let resp = self.send_post(url, None, body).await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: redact_query(resp.url().as_str()),
            })
        }
    }

    async fn send_post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &B,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|err| FetchError::Request(err.without_url()))
    }
}

async fn decode_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: redact_query(&final_url),
        });
    }
    let body = resp
        .bytes()
        .await
        .map_err(|err| FetchError::Request(err.without_url()))?;
    serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
        url: redact_query(&final_url),
        source,
    })
}

/// Query strings carry API keys; keep them out of error messages and logs.
fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let started_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_json(started_at, "normalize", &["row-a", "row-b"])
            .await
            .expect("first store");
        let second = store
            .store_json(started_at, "normalize", &["row-a", "row-b"])
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20260224_120000").join("normalize")));
    }

    #[tokio::test]
    async fn write_once_leaves_no_staging_files_behind() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("classify").join("abc.json");

        assert!(write_once(&target, b"first").await.expect("first write"));
        assert!(!write_once(&target, b"second").await.expect("second write"));
        assert_eq!(std::fs::read(&target).expect("read"), b"first");

        let names: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("abc.json")]);
    }

    #[test]
    fn api_keys_never_reach_error_urls() {
        assert_eq!(
            redact_query("https://newsapi.org/v2/everything?q=tech&apiKey=secret"),
            "https://newsapi.org/v2/everything?<redacted>"
        );
        assert_eq!(redact_query("http://localhost/x"), "http://localhost/x");
    }
}
