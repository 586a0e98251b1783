//! Target system of record: grant lookup and persistence backends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pgl_core::{Grant, SyncError};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pgl-storage";

/// Lookup and persistence of grants in the system of record.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn find_by_local_key(&self, local_key: &str) -> Result<Option<Grant>, SyncError>;

    /// Persists a new grant and returns the identifier the store assigned to it.
    async fn create(&self, grant: &Grant) -> Result<String, SyncError>;

    /// Replaces a stored grant; `grant.id` must name an existing record.
    async fn update(&self, grant: &Grant) -> Result<(), SyncError>;
}

/// Grants keyed by `local_key`, held in memory.
#[derive(Debug, Default)]
pub struct InMemoryGrantStore {
    grants: Mutex<BTreeMap<String, Grant>>,
    writes: Mutex<usize>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store; grants without an id are given one.
    pub fn with_grants(grants: impl IntoIterator<Item = Grant>) -> Self {
        let map = grants
            .into_iter()
            .map(|mut grant| {
                grant.id.get_or_insert_with(new_grant_id);
                (grant.local_key.clone(), grant)
            })
            .collect();
        Self {
            grants: Mutex::new(map),
            writes: Mutex::new(0),
        }
    }

    pub async fn get(&self, local_key: &str) -> Option<Grant> {
        self.grants.lock().await.get(local_key).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Grant> {
        self.grants.lock().await.values().cloned().collect()
    }

    /// Number of successful create/update calls.
    pub async fn write_count(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl TargetStore for InMemoryGrantStore {
    async fn find_by_local_key(&self, local_key: &str) -> Result<Option<Grant>, SyncError> {
        Ok(self.get(local_key).await)
    }

    async fn create(&self, grant: &Grant) -> Result<String, SyncError> {
        let id = new_grant_id();
        let mut stored = grant.clone();
        stored.id = Some(id.clone());
        self.grants
            .lock()
            .await
            .insert(stored.local_key.clone(), stored);
        *self.writes.lock().await += 1;
        Ok(id)
    }

    async fn update(&self, grant: &Grant) -> Result<(), SyncError> {
        let mut grants = self.grants.lock().await;
        replace_by_id(&mut grants, grant)?;
        drop(grants);
        *self.writes.lock().await += 1;
        Ok(())
    }
}

fn new_grant_id() -> String {
    format!("grant-{}", Uuid::new_v4())
}

fn replace_by_id(grants: &mut BTreeMap<String, Grant>, grant: &Grant) -> Result<(), SyncError> {
    let id = grant
        .id
        .as_deref()
        .ok_or_else(|| SyncError::NotFound(format!("grant {} has no store id", grant.local_key)))?;
    let existing_key = grants
        .iter()
        .find(|(_, stored)| stored.id.as_deref() == Some(id))
        .map(|(key, _)| key.clone())
        .ok_or_else(|| SyncError::NotFound(format!("no stored grant with id {id}")))?;
    grants.remove(&existing_key);
    grants.insert(grant.local_key.clone(), grant.clone());
    Ok(())
}

/// Reads through to another store and discards writes.
pub struct DryRunStore {
    inner: Arc<dyn TargetStore>,
}

impl DryRunStore {
    pub fn new(inner: Arc<dyn TargetStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TargetStore for DryRunStore {
    async fn find_by_local_key(&self, local_key: &str) -> Result<Option<Grant>, SyncError> {
        self.inner.find_by_local_key(local_key).await
    }

    async fn create(&self, grant: &Grant) -> Result<String, SyncError> {
        debug!(local_key = %grant.local_key, "dry run: skipping create");
        Ok("dry-run".to_string())
    }

    async fn update(&self, grant: &Grant) -> Result<(), SyncError> {
        debug!(local_key = %grant.local_key, "dry run: skipping update");
        Ok(())
    }
}

/// Grants persisted as a JSON array; every write replaces the file atomically.
#[derive(Debug)]
pub struct JsonFileGrantStore {
    path: PathBuf,
    grants: Mutex<BTreeMap<String, Grant>>,
}

impl JsonFileGrantStore {
    /// Opens the store, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let grants = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking grant store {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading grant store {}", path.display()))?;
            let list: Vec<Grant> = serde_json::from_str(&text)
                .with_context(|| format!("parsing grant store {}", path.display()))?;
            list.into_iter()
                .map(|grant| (grant.local_key.clone(), grant))
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            grants: Mutex::new(grants),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, grants: &BTreeMap<String, Grant>) -> Result<(), SyncError> {
        let list = grants.values().collect::<Vec<_>>();
        let bytes = serde_json::to_vec_pretty(&list)
            .map_err(|err| SyncError::StoreUnavailable(format!("serializing grants: {err}")))?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|err| SyncError::StoreUnavailable(format!("{err:#}")))
    }
}

#[async_trait]
impl TargetStore for JsonFileGrantStore {
    async fn find_by_local_key(&self, local_key: &str) -> Result<Option<Grant>, SyncError> {
        Ok(self.grants.lock().await.get(local_key).cloned())
    }

    async fn create(&self, grant: &Grant) -> Result<String, SyncError> {
        let id = new_grant_id();
        let mut stored = grant.clone();
        stored.id = Some(id.clone());

        let mut grants = self.grants.lock().await;
        let mut next = grants.clone();
        next.insert(stored.local_key.clone(), stored);
        self.persist(&next).await?;
        *grants = next;
        Ok(id)
    }

    async fn update(&self, grant: &Grant) -> Result<(), SyncError> {
        let mut grants = self.grants.lock().await;
        let mut next = grants.clone();
        replace_by_id(&mut next, grant)?;
        self.persist(&next).await?;
        *grants = next;
        Ok(())
    }
}

/// Writes through a uniquely named temp file in the target directory, then renames it into place.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating store directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp store file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// What to do after a PASS request came back unsuccessful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassRetry {
    /// Send again. Carries the server's `Retry-After` hint when one was given.
    After(Option<Duration>),
    GiveUp,
}

/// Gateway errors, request timeouts and throttling are transient. Every other status is
/// final, including 500, which PASS returns for a grant body it refuses.
pub fn pass_retry_for_status(status: StatusCode, headers: &HeaderMap) -> PassRetry {
    match status {
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => PassRetry::After(retry_after(headers)),
        _ => PassRetry::GiveUp,
    }
}

/// Only failures to reach PASS at all are retried; a body or redirect error will repeat.
pub fn pass_retry_for_error(err: &reqwest::Error) -> PassRetry {
    if err.is_timeout() || err.is_connect() {
        PassRetry::After(None)
    } else {
        PassRetry::GiveUp
    }
}

/// `Retry-After` in delay-seconds form; the HTTP-date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (zero-based). A server hint replaces the doubling
    /// schedule; both are capped at `max_delay`.
    pub fn delay_before(&self, retry: u32, hint: Option<Duration>) -> Duration {
        hint.unwrap_or_else(|| self.base_delay.saturating_mul(2u32.saturating_pow(retry)))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct PassClientConfig {
    pub base_url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for PassClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/data".to_string(),
            user: None,
            password: None,
            timeout: Duration::from_secs(20),
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PassRequestError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

impl PassRequestError {
    fn into_sync_error(self, context: &str) -> SyncError {
        match self {
            Self::HttpStatus { status: 404, url } => {
                SyncError::NotFound(format!("{context}: {url} returned 404"))
            }
            other => SyncError::StoreUnavailable(format!("{context}: {other}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedGrant {
    id: String,
}

/// PASS grant endpoints over HTTP:
/// `GET {base}/grants?localKey=`, `POST {base}/grants`, `PUT {base}/grants/{id}`.
#[derive(Debug)]
pub struct PassHttpStore {
    client: reqwest::Client,
    base_url: Url,
    user: Option<String>,
    password: Option<String>,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl PassHttpStore {
    pub fn new(config: PassClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url =
            Url::parse(&base).with_context(|| format!("parsing PASS base url {}", config.base_url))?;

        Ok(Self {
            client,
            base_url,
            user: config.user,
            password: config.password,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn search_url(&self, local_key: &str) -> anyhow::Result<Url> {
        let mut url = self.base_url.join("grants").context("joining grants path")?;
        url.query_pairs_mut().append_pair("localKey", local_key);
        Ok(url)
    }

    pub fn collection_url(&self) -> anyhow::Result<Url> {
        self.base_url.join("grants").context("joining grants path")
    }

    pub fn grant_url(&self, id: &str) -> anyhow::Result<Url> {
        let mut url = self.collection_url()?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("PASS base url cannot carry path segments"))?
            .push(id);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, PassRequestError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| PassRequestError::LimiterClosed)?;

        let mut retries = 0;
        loop {
            let (retry, failure) = match self.authorize(build()).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    (
                        pass_retry_for_status(status, resp.headers()),
                        PassRequestError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        },
                    )
                }
                Err(err) => (pass_retry_for_error(&err), PassRequestError::Request(err)),
            };
            match retry {
                PassRetry::After(hint) if retries < self.backoff.max_retries => {
                    let delay = self.backoff.delay_before(retries, hint);
                    warn!(error = %failure, retries, ?delay, "retrying PASS request");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                _ => return Err(failure),
            }
        }
    }
}

fn url_error(err: anyhow::Error) -> SyncError {
    SyncError::StoreUnavailable(format!("{err:#}"))
}

#[async_trait]
impl TargetStore for PassHttpStore {
    async fn find_by_local_key(&self, local_key: &str) -> Result<Option<Grant>, SyncError> {
        let url = self.search_url(local_key).map_err(url_error)?;
        let span = info_span!("pass_find_grant", local_key);
        async {
            let resp = self
                .send_with_retry(|| self.client.get(url.clone()))
                .await
                .map_err(|err| err.into_sync_error("searching grants"))?;
            let mut found: Vec<Grant> = resp.json().await.map_err(|err| {
                SyncError::StoreUnavailable(format!("decoding grant search response: {err}"))
            })?;
            if found.len() > 1 {
                warn!(matches = found.len(), "several stored grants share a local key; using the first");
            }
            debug!(matches = found.len(), "searched stored grants");
            Ok::<_, SyncError>((!found.is_empty()).then(|| found.swap_remove(0)))
        }
        .instrument(span)
        .await
    }

    async fn create(&self, grant: &Grant) -> Result<String, SyncError> {
        let url = self.collection_url().map_err(url_error)?;
        let resp = self
            .send_with_retry(|| self.client.post(url.clone()).json(grant))
            .await
            .map_err(|err| err.into_sync_error("creating grant"))?;
        let created: CreatedGrant = resp.json().await.map_err(|err| {
            SyncError::StoreUnavailable(format!("decoding grant creation response: {err}"))
        })?;
        Ok(created.id)
    }

    async fn update(&self, grant: &Grant) -> Result<(), SyncError> {
        let id = grant.id.as_deref().ok_or_else(|| {
            SyncError::NotFound(format!("grant {} has no store id", grant.local_key))
        })?;
        let url = self.grant_url(id).map_err(url_error)?;
        self.send_with_retry(|| self.client.put(url.clone()).json(grant))
            .await
            .map_err(|err| err.into_sync_error("updating grant"))?;
        Ok(())
    }
}
