//! Durable storage for the historical issue store (Parquet, atomic replace),
//! the raw snapshot archive and the retrying HTTP fetcher.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, ListArray, RecordBatch, StringArray, StructArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, FieldRef, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use insights_core::{
    repo_slug, HistoricalStore, IdentityKey, IssueId, IssueRecord, PipelineError, PipelineResult,
    StoreMetadata, STORE_SCHEMA_VERSION,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "insights-storage";

const STORE_META_KEY: &str = "insights.store";
const UTC_TZ: &str = "UTC";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMeta {
    schema_version: u32,
    metadata: StoreMetadata,
}

/// Parquet-backed historical store. Writes go to a temp file in the same
/// directory and are renamed over the live file, so readers only ever see a
/// complete store.
#[derive(Debug, Clone)]
pub struct ColumnarStore {
    path: PathBuf,
}

impl ColumnarStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling_path(&self.path, |name| format!("{name}.lock"))
    }

    /// Reads the live store. A missing file is a fresh, empty store; anything
    /// present but undecodable is `StoreCorrupt`.
    pub fn read(&self) -> PipelineResult<HistoricalStore> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no store on disk yet; starting empty");
                return Ok(HistoricalStore::empty());
            }
            Err(err) => {
                return Err(PipelineError::io(
                    format!("opening store {}", self.path.display()),
                    err,
                ))
            }
        };
        decode_store(&self.path, file)
    }

    pub fn write(&self, store: &HistoricalStore) -> PipelineResult<()> {
        self.stage(store)?.commit()
    }

    /// Encodes `store` into a synced temp file next to the live store without
    /// touching the live file. Dropping the result without `commit` removes
    /// the temp file.
    pub fn stage(&self, store: &HistoricalStore) -> PipelineResult<StagedWrite> {
        let batch = encode_store(store)?;
        let dir = parent_dir(&self.path);
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::io(format!("creating store directory {}", dir.display()), e))?;

        let temp_path = sibling_path(&self.path, |name| format!(".{name}.{}.tmp", Uuid::new_v4()));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .map_err(|e| PipelineError::io(format!("opening temp store file {}", temp_path.display()), e))?;
        let staged = StagedWrite {
            temp_path,
            final_path: self.path.clone(),
            committed: false,
        };

        let encode_err = |e: parquet::errors::ParquetError| PipelineError::Encode(e.to_string());
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).map_err(encode_err)?;
        writer.write(&batch).map_err(encode_err)?;
        let file = writer.into_inner().map_err(encode_err)?;
        file.sync_all().map_err(|e| {
            PipelineError::io(format!("syncing temp store file {}", staged.temp_path.display()), e)
        })?;
        Ok(staged)
    }

    /// Exclusive writer guard for the duration of an ingest.
    ///
    /// The guard is an OS advisory lock on `<store>.lock`, released by the
    /// kernel when the holder exits, so a writer that crashed never blocks the
    /// next run. The file itself is left in place between runs.
    pub fn lock(&self) -> PipelineResult<StoreLock> {
        let lock_path = self.lock_path();
        let dir = parent_dir(&lock_path);
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::io(format!("creating store directory {}", dir.display()), e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| PipelineError::io(format!("opening lock file {}", lock_path.display()), e))?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(PipelineError::StoreLocked {
                    path: self.path.clone(),
                })
            }
            Err(TryLockError::Error(err)) => {
                return Err(PipelineError::io(
                    format!("locking {}", lock_path.display()),
                    err,
                ))
            }
        }
        // Holder note for operators only.
        let _ = file
            .set_len(0)
            .and_then(|()| writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339()));
        debug!(path = %lock_path.display(), "store lock acquired");
        Ok(StoreLock {
            path: lock_path,
            _file: file,
        })
    }
}

#[derive(Debug)]
pub struct StagedWrite {
    temp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Atomically swaps the staged file into place.
    pub fn commit(mut self) -> PipelineResult<()> {
        std::fs::rename(&self.temp_path, &self.final_path).map_err(|e| {
            PipelineError::io(
                format!(
                    "atomically renaming {} -> {}",
                    self.temp_path.display(),
                    self.final_path.display()
                ),
                e,
            )
        })?;
        self.committed = true;
        // Persist the rename itself; not supported on every platform.
        if let Ok(dir) = File::open(parent_dir(&self.final_path)) {
            let _ = dir.sync_all();
        }
        info!(path = %self.final_path.display(), "store replaced");
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Held for as long as the value lives; dropping it closes the file and
/// releases the lock.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    _file: File,
}

impl StoreLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn sibling_path(path: &Path, name: impl FnOnce(&str) -> String) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    parent_dir(path).join(name(&file_name))
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some(UTC_TZ.into()))
}

fn encode_store(store: &HistoricalStore) -> PipelineResult<RecordBatch> {
    let records = store.records.values().collect::<Vec<_>>();

    let mut metric_keys = store.metadata.metric_keys.clone();
    metric_keys.extend(records.iter().flat_map(|r| r.metrics.keys().cloned()));
    let extension_keys = records
        .iter()
        .flat_map(|r| r.extensions.keys().cloned())
        .collect::<BTreeSet<_>>();

    let mut fields = vec![
        ArrowField::new("repo", DataType::Utf8, false),
        ArrowField::new("issue_id", DataType::Utf8, false),
        ArrowField::new("created_at", timestamp_type(), false),
        ArrowField::new("closed_at", timestamp_type(), true),
        ArrowField::new("captured_at", timestamp_type(), false),
        ArrowField::new_list("labels", ArrowField::new("item", DataType::Utf8, true), false),
        ArrowField::new("is_pull_request", DataType::Boolean, false),
    ];

    let repos = StringArray::from(records.iter().map(|r| r.repo.as_str()).collect::<Vec<_>>());
    let issue_ids = StringArray::from(
        records
            .iter()
            .map(|r| r.issue_id.to_string())
            .collect::<Vec<_>>(),
    );
    let created = TimestampMicrosecondArray::from(
        records
            .iter()
            .map(|r| r.created_at.timestamp_micros())
            .collect::<Vec<_>>(),
    )
    .with_timezone(UTC_TZ);
    let closed = TimestampMicrosecondArray::from(
        records
            .iter()
            .map(|r| r.closed_at.map(|ts| ts.timestamp_micros()))
            .collect::<Vec<_>>(),
    )
    .with_timezone(UTC_TZ);
    let captured = TimestampMicrosecondArray::from(
        records
            .iter()
            .map(|r| r.captured_at.timestamp_micros())
            .collect::<Vec<_>>(),
    )
    .with_timezone(UTC_TZ);
    let mut labels = ListBuilder::new(StringBuilder::new());
    for record in &records {
        for label in &record.labels {
            labels.values().append_value(label);
        }
        labels.append(true);
    }
    let pull_requests = BooleanArray::from(records.iter().map(|r| r.is_pull_request).collect::<Vec<_>>());

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(repos),
        Arc::new(issue_ids),
        Arc::new(created),
        Arc::new(closed),
        Arc::new(captured),
        Arc::new(labels.finish()),
        Arc::new(pull_requests),
    ];

    // Parquet cannot hold empty structs, so both bags are omitted when empty.
    if !metric_keys.is_empty() {
        let children = metric_keys
            .iter()
            .map(|key| {
                let values = Float64Array::from(
                    records
                        .iter()
                        .map(|r| r.metrics.get(key).copied())
                        .collect::<Vec<_>>(),
                );
                let field: FieldRef = Arc::new(ArrowField::new(key.as_str(), DataType::Float64, true));
                (field, Arc::new(values) as ArrayRef)
            })
            .collect::<Vec<_>>();
        let metrics = StructArray::from(children);
        fields.push(ArrowField::new("metrics", metrics.data_type().clone(), false));
        columns.push(Arc::new(metrics));
    }

    if !extension_keys.is_empty() {
        let mut children = Vec::with_capacity(extension_keys.len());
        for key in &extension_keys {
            let mut encoded = Vec::with_capacity(records.len());
            for record in &records {
                encoded.push(match record.extensions.get(key) {
                    Some(value) => Some(
                        serde_json::to_string(value)
                            .map_err(|e| PipelineError::Encode(format!("extension {key}: {e}")))?,
                    ),
                    None => None,
                });
            }
            let field: FieldRef = Arc::new(ArrowField::new(key.as_str(), DataType::Utf8, true));
            children.push((field, Arc::new(StringArray::from(encoded)) as ArrayRef));
        }
        let extensions = StructArray::from(children);
        fields.push(ArrowField::new("extensions", extensions.data_type().clone(), false));
        columns.push(Arc::new(extensions));
    }

    let meta = serde_json::to_string(&PersistedMeta {
        schema_version: STORE_SCHEMA_VERSION,
        metadata: store.metadata.clone(),
    })
    .map_err(|e| PipelineError::Encode(format!("store metadata: {e}")))?;
    let schema = Schema::new_with_metadata(fields, HashMap::from([(STORE_META_KEY.to_string(), meta)]));

    RecordBatch::try_new(Arc::new(schema), columns)
        .map_err(|e| PipelineError::Encode(format!("building store record batch: {e}")))
}

fn decode_store(path: &Path, file: File) -> PipelineResult<HistoricalStore> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| PipelineError::corrupt(path, format!("reading parquet footer: {e}")))?;

    let raw_meta = builder
        .schema()
        .metadata()
        .get(STORE_META_KEY)
        .cloned()
        .ok_or_else(|| PipelineError::corrupt(path, "missing store metadata"))?;
    let persisted: PersistedMeta = serde_json::from_str(&raw_meta)
        .map_err(|e| PipelineError::corrupt(path, format!("store metadata: {e}")))?;
    if persisted.schema_version != STORE_SCHEMA_VERSION {
        return Err(PipelineError::corrupt(
            path,
            format!(
                "unsupported schema version {} (expected {STORE_SCHEMA_VERSION})",
                persisted.schema_version
            ),
        ));
    }

    let reader = builder
        .build()
        .map_err(|e| PipelineError::corrupt(path, format!("opening record reader: {e}")))?;
    let mut records = BTreeMap::new();
    for batch in reader {
        let batch = batch.map_err(|e| PipelineError::corrupt(path, format!("decoding record batch: {e}")))?;
        decode_batch(path, &batch, &mut records)?;
    }

    Ok(HistoricalStore {
        records,
        metadata: persisted.metadata,
    })
}

fn column<'a, T: Array + 'static>(path: &Path, batch: &'a RecordBatch, name: &str) -> PipelineResult<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::corrupt(path, format!("missing column {name}")))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| PipelineError::corrupt(path, format!("column {name} has unexpected type")))
}

fn struct_children<'a, T: Array + 'static>(
    path: &Path,
    batch: &'a RecordBatch,
    name: &str,
) -> PipelineResult<Vec<(String, &'a T)>> {
    let Some(array) = batch.column_by_name(name) else {
        return Ok(Vec::new());
    };
    let array = array
        .as_any()
        .downcast_ref::<StructArray>()
        .ok_or_else(|| PipelineError::corrupt(path, format!("column {name} is not a struct")))?;
    array
        .fields()
        .iter()
        .zip(array.columns())
        .map(|(field, child)| {
            child
                .as_any()
                .downcast_ref::<T>()
                .map(|typed| (field.name().clone(), typed))
                .ok_or_else(|| {
                    PipelineError::corrupt(path, format!("{name}.{} has unexpected type", field.name()))
                })
        })
        .collect()
}

fn decode_timestamp(path: &Path, micros: i64, column: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| PipelineError::corrupt(path, format!("{column} value {micros} out of range")))
}

fn decode_batch(
    path: &Path,
    batch: &RecordBatch,
    records: &mut BTreeMap<IdentityKey, IssueRecord>,
) -> PipelineResult<()> {
    let repos = column::<StringArray>(path, batch, "repo")?;
    let issue_ids = column::<StringArray>(path, batch, "issue_id")?;
    let created = column::<TimestampMicrosecondArray>(path, batch, "created_at")?;
    let closed = column::<TimestampMicrosecondArray>(path, batch, "closed_at")?;
    let captured = column::<TimestampMicrosecondArray>(path, batch, "captured_at")?;
    let labels = column::<ListArray>(path, batch, "labels")?;
    let pull_requests = column::<BooleanArray>(path, batch, "is_pull_request")?;
    let metrics = struct_children::<Float64Array>(path, batch, "metrics")?;
    let extensions = struct_children::<StringArray>(path, batch, "extensions")?;

    for row in 0..batch.num_rows() {
        if repos.is_null(row) || issue_ids.is_null(row) || created.is_null(row) || captured.is_null(row) {
            return Err(PipelineError::corrupt(path, format!("row {row} has a null key column")));
        }
        let issue_id = IssueId::parse(issue_ids.value(row))
            .ok_or_else(|| PipelineError::corrupt(path, format!("row {row} has an empty issue_id")))?;

        let row_labels = labels.value(row);
        let row_labels = row_labels
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| PipelineError::corrupt(path, "labels are not strings"))?;

        let mut record_metrics = BTreeMap::new();
        for (name, values) in &metrics {
            if !values.is_null(row) {
                let value = values.value(row);
                if !value.is_finite() {
                    return Err(PipelineError::corrupt(path, format!("row {row} metric {name} is not finite")));
                }
                record_metrics.insert(name.clone(), value);
            }
        }

        let mut record_extensions = BTreeMap::new();
        for (name, values) in &extensions {
            if !values.is_null(row) {
                let value = serde_json::from_str(values.value(row)).map_err(|e| {
                    PipelineError::corrupt(path, format!("row {row} extension {name}: {e}"))
                })?;
                record_extensions.insert(name.clone(), value);
            }
        }

        let record = IssueRecord {
            repo: repos.value(row).to_string(),
            issue_id,
            created_at: decode_timestamp(path, created.value(row), "created_at")?,
            closed_at: if closed.is_null(row) {
                None
            } else {
                Some(decode_timestamp(path, closed.value(row), "closed_at")?)
            },
            labels: (0..row_labels.len())
                .filter(|i| !row_labels.is_null(*i))
                .map(|i| row_labels.value(i).to_string())
                .collect(),
            is_pull_request: pull_requests.value(row),
            metrics: record_metrics,
            extensions: record_extensions,
            captured_at: decode_timestamp(path, captured.value(row), "captured_at")?,
        };

        let key = record.key();
        if records.insert(key.clone(), record).is_some() {
            return Err(PipelineError::corrupt(path, format!("duplicate identity key {key}")));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of raw snapshot documents.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
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

    pub fn relative_path(&self, captured_at: DateTime<Utc>, repo: &str, content_hash: &str) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(repo_slug(repo))
            .join(format!("{content_hash}.json"))
    }

    pub async fn archive(
        &self,
        captured_at: DateTime<Utc>,
        repo: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(captured_at, repo, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let dir = parent_dir(&absolute_path);

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let archived = |deduplicated| ArchivedSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub auth_token: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            auth_token: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Request { attempts, .. } | Self::HttpStatus { attempts, .. } => *attempts,
        }
    }
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
        if let Some(token) = &config.auth_token {
            let mut headers = HeaderMap::new();
            let mut value =
                HeaderValue::from_str(&format!("token {token}")).context("encoding auth token header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET with bounded exponential backoff on retryable failures.
    pub async fn fetch_bytes(&self, label: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("http_fetch", label, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let attempts = attempt + 1;
            let can_retry = attempt < self.backoff.max_retries;

            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                    attempts,
                                })
                            }
                            Err(err) => err,
                        }
                    } else {
                        if classify_status(status) == RetryDisposition::Retryable && can_retry {
                            warn!(attempt = attempts, %status, "retryable status; backing off");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            attempts,
                        });
                    }
                }
                Err(err) => err,
            };

            if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                warn!(attempt = attempts, error = %err, "request failed; backing off");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
                continue;
            }
            return Err(FetchError::Request { attempts, source: err });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use insights_core::{Period, RepoExtensions};
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
    }

    fn record(repo: &str, id: u64) -> IssueRecord {
        IssueRecord {
            repo: repo.to_string(),
            issue_id: IssueId::Number(id),
            created_at: ts(2024, 1, 1),
            closed_at: None,
            labels: BTreeSet::new(),
            is_pull_request: false,
            metrics: BTreeMap::new(),
            extensions: BTreeMap::new(),
            captured_at: ts(2024, 1, 10),
        }
    }

    fn sample_store() -> HistoricalStore {
        let empty_metrics = record("holoviz/panel", 1);

        let mut with_extensions = record("holoviz/panel", 2);
        with_extensions.closed_at = Some(ts(2024, 1, 5));
        with_extensions.labels = ["bug".to_string(), "triage".to_string()].into();
        with_extensions.metrics.insert("time_to_close".into(), 345_600.0);
        with_extensions.metrics.insert("time_to_first_response".into(), 90.5);
        with_extensions.extensions.insert("title".into(), json!("Widget crash"));
        with_extensions
            .extensions
            .insert("assignees".into(), json!(["philippjfr", "hoxbro"]));
        with_extensions
            .extensions
            .insert("milestone".into(), json!({"title": "v1.5", "number": 3}));

        let mut text_id = record("holoviz/hvplot", 0);
        text_id.issue_id = IssueId::Text("discussion-9".into());
        text_id.is_pull_request = true;
        text_id.metrics.insert("time_in_draft".into(), 60.0);

        let mut store = HistoricalStore::empty();
        for r in [empty_metrics, with_extensions, text_id] {
            store.records.insert(r.key(), r);
        }
        store.metadata = StoreMetadata {
            last_merged_at: Some(ts(2024, 1, 10)),
            covered_period: Some("2024-01-01..2024-01-31".parse::<Period>().unwrap()),
            revision: 3,
            metric_keys: ["time_to_close", "time_to_first_response", "time_in_draft", "time_to_answer"]
                .into_iter()
                .map(String::from)
                .collect(),
            repo_extensions: BTreeMap::from([(
                "holoviz/panel".to_string(),
                RepoExtensions {
                    captured_at: ts(2024, 1, 10),
                    values: BTreeMap::from([("average_time_to_close".to_string(), json!("2 days, 1:00:00"))]),
                },
            )]),
        };
        store
    }

    #[test]
    fn write_then_read_round_trips_every_field() {
        let dir = tempdir().expect("tempdir");
        let store_file = ColumnarStore::new(dir.path().join("data/issues.parquet"));
        let store = sample_store();

        store_file.write(&store).expect("write");
        let read_back = store_file.read().expect("read");
        assert_eq!(read_back, store);
    }

    #[test]
    fn empty_store_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store_file = ColumnarStore::new(dir.path().join("issues.parquet"));
        store_file.write(&HistoricalStore::empty()).expect("write");
        assert_eq!(store_file.read().expect("read"), HistoricalStore::empty());
    }

    #[test]
    fn missing_file_reads_as_empty_store() {
        let dir = tempdir().expect("tempdir");
        let store_file = ColumnarStore::new(dir.path().join("never-written.parquet"));
        assert!(store_file.read().expect("read").is_empty());
    }

    #[test]
    fn garbage_file_is_store_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("issues.parquet");
        std::fs::write(&path, b"definitely not parquet").unwrap();
        let err = ColumnarStore::new(&path).read().unwrap_err();
        assert!(matches!(err, PipelineError::StoreCorrupt { .. }), "{err}");
    }

    #[test]
    fn parquet_without_store_metadata_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("issues.parquet");
        let schema = Arc::new(Schema::new(vec![ArrowField::new("repo", DataType::Utf8, false)]));
        let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(StringArray::from(vec!["x"]))]).unwrap();
        let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let err = ColumnarStore::new(&path).read().unwrap_err();
        assert!(matches!(err, PipelineError::StoreCorrupt { .. }), "{err}");
    }

    #[test]
    fn crash_before_commit_leaves_previous_store_intact() {
        let dir = tempdir().expect("tempdir");
        let store_file = ColumnarStore::new(dir.path().join("issues.parquet"));
        let before = sample_store();
        store_file.write(&before).expect("first write");

        let mut after = before.clone();
        after.records.clear();
        after.metadata.revision += 1;
        let staged = store_file.stage(&after).expect("stage");
        // Simulate a torn write followed by a crash: the temp file is truncated
        // and the process never reaches the rename.
        let temp = staged.temp_path().to_path_buf();
        std::fs::write(&temp, b"PAR1 torn").unwrap();
        std::mem::forget(staged);

        assert_eq!(store_file.read().expect("read"), before);
        assert!(temp.exists(), "stray temp file is left behind, but never read");
    }

    #[test]
    fn dropped_stage_cleans_up_temp_file() {
        let dir = tempdir().expect("tempdir");
        let store_file = ColumnarStore::new(dir.path().join("issues.parquet"));
        let staged = store_file.stage(&sample_store()).expect("stage");
        let temp = staged.temp_path().to_path_buf();
        assert!(temp.exists());
        drop(staged);
        assert!(!temp.exists());
        assert!(!store_file.path().exists());
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = tempdir().expect("tempdir");
        let store_file = ColumnarStore::new(dir.path().join("issues.parquet"));
        let guard = store_file.lock().expect("first lock");
        assert!(guard.path().exists());
        let err = store_file.lock().unwrap_err();
        assert!(matches!(err, PipelineError::StoreLocked { .. }));
        drop(guard);
        store_file.lock().expect("lock after release");
    }

    #[test]
    fn lock_left_behind_by_a_dead_writer_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let store_file = ColumnarStore::new(dir.path().join("issues.parquet"));
        // What a crashed writer leaves: the file, but no live holder.
        std::fs::write(store_file.lock_path(), "pid=4194303 at=2024-01-01T00:00:00+00:00\n").unwrap();

        let guard = store_file.lock().expect("stale lock file does not block");
        let note = std::fs::read_to_string(guard.path()).unwrap();
        assert!(note.starts_with(&format!("pid={} ", std::process::id())), "{note}");
        assert!(matches!(
            store_file.lock().unwrap_err(),
            PipelineError::StoreLocked { .. }
        ));
    }

    #[test]
    fn extension_floats_round_trip_bit_for_bit() {
        let dir = tempdir().expect("tempdir");
        let store_file = ColumnarStore::new(dir.path().join("issues.parquet"));

        let mut state = 0x9E37_79B9_7F4A_7C15_u64;
        let mut next_float = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 11) as f64 / (1_u64 << 53) as f64 * 1e4 - 5e3
        };
        let mut store = HistoricalStore::empty();
        for id in 0..2000 {
            let mut r = record("holoviz/panel", id);
            r.extensions.insert(
                "label_metrics".into(),
                json!({"nested": {"score": next_float()}, "ratio": next_float()}),
            );
            store.records.insert(r.key(), r);
        }
        store.metadata.repo_extensions.insert(
            "holoviz/panel".into(),
            RepoExtensions {
                captured_at: ts(2024, 1, 10),
                values: BTreeMap::from([("mean_score".to_string(), json!(next_float()))]),
            },
        );

        store_file.write(&store).expect("write");
        assert_eq!(store_file.read().expect("read"), store);
    }

    #[test]
    fn archive_hashing_is_stable() {
        let hash = SnapshotArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_snapshots() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());
        let captured_at = ts(2024, 2, 24);

        let first = archive
            .archive(captured_at, "holoviz/panel", br#"{"issues":[]}"#)
            .await
            .expect("first archive");
        let second = archive
            .archive(captured_at, "holoviz/panel", br#"{"issues":[]}"#)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20240224_120000/holoviz__panel"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    /// Serves `failures` 503 responses, then 200 with `body`.
    async fn flaky_server(failures: usize, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => buf.extend_from_slice(&chunk[..read]),
                    }
                }
                let response = if n < failures {
                    "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string()
                } else {
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/metrics.json"), hits)
    }

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn fetch_retries_transient_failures() {
        let (url, hits) = flaky_server(2, r#"{"issues":[]}"#).await;
        let resp = fast_fetcher(3).fetch_bytes("x/y", &url).await.expect("fetch");
        assert_eq!(resp.body, br#"{"issues":[]}"#);
        assert_eq!(resp.attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_gives_up_after_bounded_attempts() {
        let (url, hits) = flaky_server(usize::MAX, "").await;
        let err = fast_fetcher(2).fetch_bytes("x/y", &url).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(err.attempts(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
