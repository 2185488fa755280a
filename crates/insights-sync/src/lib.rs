//! Ingest orchestration: config, repository registry, the single-store ingest
//! pipeline and the multi-repository sync run with its reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use insights_adapters::{
    parse_snapshot, FetchedSnapshot, FileSnapshotSource, HttpSnapshotSource, Normalizer,
    SnapshotOverrides, SnapshotSource,
};
use insights_core::{HistoricalStore, IngestWarning, NormalizedBatch, PipelineError, PipelineResult};
use insights_storage::{BackoffPolicy, ColumnarStore, HttpClientConfig, HttpFetcher, SnapshotArchive};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod merge;

pub use merge::{merge, MergeOutcome, MergeStats};

pub const CRATE_NAME: &str = "insights-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub repos_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub fetch_concurrency: usize,
    pub gh_token: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            store_path: path("INSIGHTS_STORE_PATH", "./data/issues.parquet"),
            artifacts_dir: path("INSIGHTS_ARTIFACTS_DIR", "./artifacts"),
            reports_dir: path("INSIGHTS_REPORTS_DIR", "./reports"),
            repos_file: path("INSIGHTS_REPOS_FILE", "./repos.yaml"),
            user_agent: lookup("INSIGHTS_USER_AGENT").unwrap_or_else(|| "insights-bot/0.1".to_string()),
            http_timeout_secs: number("INSIGHTS_HTTP_TIMEOUT_SECS", 20),
            max_retries: number("INSIGHTS_MAX_RETRIES", 3) as usize,
            fetch_concurrency: number("INSIGHTS_FETCH_CONCURRENCY", 4) as usize,
            gh_token: lookup("GH_TOKEN").filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            auth_token: self.gh_token.clone(),
            concurrency: self.fetch_concurrency,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoRegistry {
    pub repos: Vec<RepoConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub repo: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub snapshot_url: Option<String>,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

fn enabled_by_default() -> bool {
    true
}

impl RepoRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for repo in &registry.repos {
            if repo.snapshot_url.is_some() == repo.snapshot_path.is_some() {
                bail!(
                    "{}: repo {} must set exactly one of snapshot_url or snapshot_path",
                    path.display(),
                    repo.repo
                );
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &RepoConfig> {
        self.repos.iter().filter(|r| r.enabled)
    }
}

impl RepoConfig {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.repo)
    }

    /// Relative snapshot paths resolve against `base_dir` (the registry's
    /// directory).
    pub fn source(&self, http: &Arc<HttpFetcher>, base_dir: &Path) -> Box<dyn SnapshotSource> {
        match (&self.snapshot_url, &self.snapshot_path) {
            (Some(url), _) => Box::new(HttpSnapshotSource::new(Arc::clone(http), url.clone())),
            (None, Some(path)) if path.is_absolute() => Box::new(FileSnapshotSource::new(path)),
            (None, Some(path)) => Box::new(FileSnapshotSource::new(base_dir.join(path))),
            (None, None) => Box::new(FileSnapshotSource::new(base_dir.join(format!(
                "{}_metrics.json",
                insights_core::repo_slug(&self.repo)
            )))),
        }
    }
}

/// One raw document queued for ingestion.
#[derive(Debug, Clone)]
pub struct SnapshotDocument {
    pub origin: String,
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub overrides: SnapshotOverrides,
}

impl SnapshotDocument {
    pub fn from_fetched(fetched: FetchedSnapshot, overrides: SnapshotOverrides) -> Self {
        Self {
            origin: fetched.origin,
            bytes: fetched.bytes,
            fetched_at: fetched.fetched_at,
            overrides,
        }
    }
}

/// Parse, resolve context and normalize one document. Pure.
pub fn prepare_batch(normalizer: &Normalizer, doc: &SnapshotDocument) -> PipelineResult<NormalizedBatch> {
    let parse_err = |source| PipelineError::Parse {
        origin: doc.origin.clone(),
        source,
    };
    let parsed = parse_snapshot(&doc.bytes).map_err(parse_err)?;
    let context = parsed
        .resolve_context(&doc.overrides, doc.fetched_at)
        .map_err(parse_err)?;
    Ok(normalizer.normalize(&parsed, &context))
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub origin: String,
    pub repo: String,
    pub records: usize,
    pub warnings: usize,
    pub stats: MergeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub batches: Vec<BatchReport>,
    pub warnings: Vec<IngestWarning>,
    pub store_records: usize,
    pub revision: u64,
    pub written: bool,
}

/// Parse → normalize → merge → write against one store.
#[derive(Debug, Clone)]
pub struct IngestPipeline {
    store: ColumnarStore,
    normalizer: Normalizer,
}

impl IngestPipeline {
    pub fn new(store: ColumnarStore) -> Self {
        Self::with_normalizer(store, Normalizer::default())
    }

    pub fn with_normalizer(store: ColumnarStore, normalizer: Normalizer) -> Self {
        Self { store, normalizer }
    }

    pub fn store(&self) -> &ColumnarStore {
        &self.store
    }

    pub fn ingest_snapshot(&self, doc: SnapshotDocument) -> Result<IngestReport, IngestError> {
        self.ingest_documents(vec![doc])
    }

    /// All documents are parsed before the store is touched; any document
    /// level error aborts the run with the store unchanged. The store is
    /// written at most once, after every batch merged cleanly.
    ///
    /// Warnings from every document that did parse are logged up front and
    /// travel with the error if the run is aborted later.
    pub fn ingest_documents(&self, docs: Vec<SnapshotDocument>) -> Result<IngestReport, IngestError> {
        let mut prepared = Vec::with_capacity(docs.len());
        let mut failure = None;
        for doc in &docs {
            match prepare_batch(&self.normalizer, doc) {
                Ok(batch) => prepared.push((doc.origin.clone(), batch)),
                Err(err) => {
                    warn!(origin = %doc.origin, error = %err, "snapshot rejected");
                    failure.get_or_insert(err);
                }
            }
        }
        let warnings = merge::collect_warnings(prepared.iter().map(|(_, b)| b));
        log_warnings(&warnings);
        if let Some(error) = failure {
            return Err(IngestError { error, warnings });
        }

        match self.merge_and_write(&prepared) {
            Ok((batches, store, written)) => Ok(IngestReport {
                batches,
                warnings,
                store_records: store.len(),
                revision: store.metadata.revision,
                written,
            }),
            Err(error) => Err(IngestError { error, warnings }),
        }
    }

    fn merge_and_write(
        &self,
        prepared: &[(String, NormalizedBatch)],
    ) -> PipelineResult<(Vec<BatchReport>, HistoricalStore, bool)> {
        let _lock = self.store.lock()?;
        let mut store = self.store.read()?;
        let base_revision = store.metadata.revision;

        let mut batches = Vec::with_capacity(prepared.len());
        for (origin, batch) in prepared {
            let outcome = merge::merge(&store, batch)?;
            store = outcome.store;
            batches.push(BatchReport {
                origin: origin.clone(),
                repo: batch.source_repo.clone(),
                records: batch.records.len(),
                warnings: batch.warnings.len(),
                stats: outcome.stats,
            });
        }

        let written = store.metadata.revision != base_revision;
        if written {
            self.store.write(&store)?;
        } else {
            info!(path = %self.store.path().display(), "store unchanged; skipping write");
        }
        Ok((batches, store, written))
    }
}

/// A failed ingest together with the warnings gathered before it failed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct IngestError {
    pub error: PipelineError,
    pub warnings: Vec<IngestWarning>,
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

fn log_warnings(warnings: &[IngestWarning]) {
    for warning in warnings {
        warn!(%warning, "ingest warning");
    }
    if !warnings.is_empty() {
        warn!(count = warnings.len(), "snapshots carried warnings");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Merged,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoRunOutcome {
    pub repo: String,
    pub display_name: String,
    pub status: RepoStatus,
    pub origin: Option<String>,
    pub attempts: usize,
    pub records: usize,
    pub warnings: usize,
    pub archived_path: Option<String>,
    pub stats: Option<MergeStats>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl RepoRunOutcome {
    fn failed(repo: &RepoConfig, kind: &str, error: String) -> Self {
        Self {
            repo: repo.repo.clone(),
            display_name: repo.label().to_string(),
            status: RepoStatus::Failed,
            origin: None,
            attempts: 0,
            records: 0,
            warnings: 0,
            archived_path: None,
            stats: None,
            error_kind: Some(kind.to_string()),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_repos: usize,
    pub merged_repos: usize,
    pub failed_repos: usize,
    pub store_path: String,
    pub store_records: usize,
    pub revision: u64,
    pub store_written: bool,
    pub repos: Vec<RepoRunOutcome>,
    pub warnings: Vec<IngestWarning>,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed_repos > 0
    }
}

struct FetchedBatch {
    origin: String,
    attempts: usize,
    archived_path: String,
    batch: NormalizedBatch,
}

/// Fetches every enabled repository concurrently, then merges the successful
/// batches one by one under the writer lock and writes the store once.
/// A repository that fails to fetch, parse or merge is reported and skipped.
pub async fn run_sync_once(config: &PipelineConfig) -> Result<SyncRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let registry = RepoRegistry::load(&config.repos_file)?;
    let base_dir = config
        .repos_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let archive = SnapshotArchive::new(config.artifacts_dir.clone());
    let normalizer = Normalizer::default();

    let enabled = registry.enabled().cloned().collect::<Vec<_>>();
    info!(%run_id, repos = enabled.len(), "sync run started");

    let mut tasks = JoinSet::new();
    for repo in enabled.iter().cloned() {
        let source = repo.source(&http, &base_dir);
        let archive = archive.clone();
        let normalizer = normalizer.clone();
        let span = info_span!("sync_repo", repo = %repo.repo);
        tasks.spawn(
            async move {
                let result = fetch_and_prepare(&repo, source.as_ref(), &archive, &normalizer).await;
                (repo, result)
            }
            .instrument(span),
        );
    }

    let mut fetched = BTreeMap::new();
    let mut outcomes = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (repo, result) = joined.context("sync task panicked")?;
        match result {
            Ok(batch) => {
                fetched.insert(repo.repo.clone(), (repo, batch));
            }
            Err((kind, err)) => {
                warn!(repo = %repo.repo, kind, error = %err, "repository failed");
                outcomes.insert(repo.repo.clone(), RepoRunOutcome::failed(&repo, kind, err));
            }
        }
    }

    // Reported whether or not the batch survives the merge.
    let warnings = merge::collect_warnings(fetched.values().map(|(_, item)| &item.batch));
    log_warnings(&warnings);

    let store_handle = ColumnarStore::new(config.store_path.clone());
    let _lock = store_handle.lock()?;
    let mut store = store_handle.read()?;
    let base_revision = store.metadata.revision;

    for (name, (repo, item)) in fetched {
        match merge::merge(&store, &item.batch) {
            Ok(outcome) => {
                store = outcome.store;
                outcomes.insert(
                    name,
                    RepoRunOutcome {
                        repo: repo.repo.clone(),
                        display_name: repo.label().to_string(),
                        status: RepoStatus::Merged,
                        origin: Some(item.origin),
                        attempts: item.attempts,
                        records: item.batch.records.len(),
                        warnings: item.batch.warnings.len(),
                        archived_path: Some(item.archived_path),
                        stats: Some(outcome.stats),
                        error_kind: None,
                        error: None,
                    },
                );
            }
            Err(err) => {
                warn!(repo = %repo.repo, error = %err, "batch rejected");
                let mut outcome = RepoRunOutcome::failed(&repo, err.kind(), err.to_string());
                outcome.origin = Some(item.origin);
                outcome.attempts = item.attempts;
                outcome.warnings = item.batch.warnings.len();
                outcome.archived_path = Some(item.archived_path);
                outcomes.insert(name, outcome);
            }
        }
    }

    let store_written = store.metadata.revision != base_revision;
    if store_written {
        store_handle.write(&store)?;
    }

    let repos = outcomes.into_values().collect::<Vec<_>>();
    let failed_repos = repos.iter().filter(|r| r.status == RepoStatus::Failed).count();
    let reports_dir = config.reports_dir.join(run_id.to_string());
    let summary = SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        enabled_repos: enabled.len(),
        merged_repos: repos.len() - failed_repos,
        failed_repos,
        store_path: config.store_path.display().to_string(),
        store_records: store.len(),
        revision: store.metadata.revision,
        store_written,
        repos,
        warnings,
        reports_dir: reports_dir.display().to_string(),
    };
    write_reports(&reports_dir, &summary).await?;
    info!(
        %run_id,
        merged = summary.merged_repos,
        failed = summary.failed_repos,
        records = summary.store_records,
        "sync run finished"
    );
    Ok(summary)
}

async fn fetch_and_prepare(
    repo: &RepoConfig,
    source: &dyn SnapshotSource,
    archive: &SnapshotArchive,
    normalizer: &Normalizer,
) -> std::result::Result<FetchedBatch, (&'static str, String)> {
    let fetched = source
        .fetch(&repo.repo)
        .await
        .map_err(|e| (e.kind(), e.to_string()))?;
    let archived = archive
        .archive(fetched.fetched_at, &repo.repo, &fetched.bytes)
        .await
        .map_err(|e| ("archive", format!("{e:#}")))?;
    let attempts = fetched.attempts;
    let overrides = SnapshotOverrides {
        repo: Some(repo.repo.clone()),
        ..Default::default()
    };
    let doc = SnapshotDocument::from_fetched(fetched, overrides);
    let batch = prepare_batch(normalizer, &doc).map_err(|e| (e.kind(), e.to_string()))?;
    Ok(FetchedBatch {
        origin: doc.origin,
        attempts,
        archived_path: archived.relative_path.display().to_string(),
        batch,
    })
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;
    Ok(())
}

pub fn render_brief(summary: &SyncRunSummary) -> String {
    let repo_lines = summary
        .repos
        .iter()
        .map(|r| match r.status {
            RepoStatus::Merged => format!(
                "- {} (`{}`): {} records, {} warnings",
                r.display_name, r.repo, r.records, r.warnings
            ),
            RepoStatus::Failed => format!(
                "- {} (`{}`): FAILED [{}] {}",
                r.display_name,
                r.repo,
                r.error_kind.as_deref().unwrap_or("unknown"),
                r.error.as_deref().unwrap_or_default()
            ),
        })
        .collect::<Vec<_>>()
        .join("\n");
    let warning_lines = if summary.warnings.is_empty() {
        "- none".to_string()
    } else {
        summary
            .warnings
            .iter()
            .map(|w| format!("- {w}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Issue Insights Sync Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Enabled repositories: {}\n- Merged: {}\n- Failed: {}\n- Store: `{}` ({} records, revision {}{})\n\n## Repositories\n{}\n\n## Warnings\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.enabled_repos,
        summary.merged_repos,
        summary.failed_repos,
        summary.store_path,
        summary.store_records,
        summary.revision,
        if summary.store_written { "" } else { ", unchanged" },
        repo_lines,
        warning_lines,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use insights_core::{IdentityKey, IssueId};
    use tempfile::tempdir;

    fn doc(origin: &str, repo: &str, day: u32, body: &str) -> SnapshotDocument {
        SnapshotDocument {
            origin: origin.to_string(),
            bytes: body.as_bytes().to_vec(),
            fetched_at: Utc.with_ymd_and_hms(2024, 2, day, 0, 0, 0).single().unwrap(),
            overrides: SnapshotOverrides {
                repo: Some(repo.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = PipelineConfig::from_lookup(|_| None);
        assert_eq!(defaults.store_path, PathBuf::from("./data/issues.parquet"));
        assert_eq!(defaults.max_retries, 3);
        assert!(defaults.gh_token.is_none());

        let env = BTreeMap::from([
            ("INSIGHTS_STORE_PATH", "/tmp/s.parquet"),
            ("INSIGHTS_MAX_RETRIES", "5"),
            ("INSIGHTS_FETCH_CONCURRENCY", "nope"),
            ("GH_TOKEN", "secret"),
        ]);
        let config = PipelineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.store_path, PathBuf::from("/tmp/s.parquet"));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.fetch_concurrency, 4);
        let http = config.http_client_config();
        assert_eq!(http.auth_token.as_deref(), Some("secret"));
        assert_eq!(http.backoff.max_retries, 5);
    }

    #[test]
    fn registry_requires_one_snapshot_location() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repos.yaml");
        std::fs::write(
            &path,
            "repos:\n  - repo: holoviz/panel\n    snapshot_path: panel.json\n  - repo: holoviz/hvplot\n    enabled: false\n    snapshot_url: https://example.invalid/hvplot.json\n",
        )
        .unwrap();
        let registry = RepoRegistry::load(&path).unwrap();
        assert_eq!(registry.enabled().count(), 1);
        assert_eq!(registry.repos[0].label(), "holoviz/panel");

        std::fs::write(
            &path,
            "repos:\n  - repo: a/b\n    snapshot_path: a.json\n    snapshot_url: https://example.invalid/a.json\n",
        )
        .unwrap();
        assert!(RepoRegistry::load(&path).is_err());
    }

    #[test]
    fn closing_snapshot_updates_the_open_record() {
        let dir = tempdir().unwrap();
        let pipeline = IngestPipeline::new(ColumnarStore::new(dir.path().join("issues.parquet")));

        let a = doc("a.json", "x", 1, r#"{"issues":[{"id":1,"created_at":"2024-01-01","closed_at":null}]}"#);
        let b = doc("b.json", "x", 2, r#"{"issues":[{"id":1,"created_at":"2024-01-01","closed_at":"2024-01-05"}]}"#);
        pipeline.ingest_snapshot(a).unwrap();
        let report = pipeline.ingest_snapshot(b).unwrap();
        assert_eq!(report.batches[0].stats.replaced, 1);

        let store = pipeline.store().read().unwrap();
        assert_eq!(store.len(), 1);
        let record = store.get(&IdentityKey::new("x", IssueId::Number(1))).unwrap();
        assert_eq!(
            record.closed_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).single().unwrap())
        );
        assert_eq!(store.metadata.revision, 2);
    }

    #[test]
    fn reingesting_the_same_snapshot_skips_the_write() {
        let dir = tempdir().unwrap();
        let pipeline = IngestPipeline::new(ColumnarStore::new(dir.path().join("issues.parquet")));
        let body = r#"{"issues":[{"id":1,"created_at":"2024-01-01","time_to_close":"1 day, 0:00:00"}]}"#;
        assert!(pipeline.ingest_snapshot(doc("a.json", "x", 1, body)).unwrap().written);
        let again = pipeline.ingest_snapshot(doc("a.json", "x", 1, body)).unwrap();
        assert!(!again.written);
        assert_eq!(again.revision, 1);
        drop(pipeline.store().lock().expect("writer lock released after ingest"));
    }

    #[test]
    fn parse_error_aborts_before_the_store_is_touched() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("issues.parquet");
        let pipeline = IngestPipeline::new(ColumnarStore::new(&store_path));
        let good = doc("good.json", "x", 1, r#"{"issues":[{"id":1,"created_at":"2024-01-01"}]}"#);
        let bad = doc("bad.json", "x", 1, r#"{"items":[]}"#);
        let err = pipeline.ingest_documents(vec![good, bad]).unwrap_err();
        assert!(matches!(err.error, PipelineError::Parse { ref origin, .. } if origin == "bad.json"));
        assert!(!store_path.exists());
    }

    #[test]
    fn source_mismatch_leaves_the_store_untouched() {
        let dir = tempdir().unwrap();
        let pipeline = IngestPipeline::new(ColumnarStore::new(dir.path().join("issues.parquet")));
        pipeline
            .ingest_snapshot(doc("a.json", "holoviz/panel", 1, r#"{"issues":[{"id":1,"created_at":"2024-01-01"}]}"#))
            .unwrap();
        let before = pipeline.store().read().unwrap();

        let foreign = r#"{"issues":[{"html_url":"https://github.com/holoviz/hvplot/issues/9","created_at":"2024-01-02"}]}"#;
        let err = pipeline
            .ingest_snapshot(doc("b.json", "holoviz/panel", 2, foreign))
            .unwrap_err();
        assert!(matches!(err.error, PipelineError::SourceMismatch { .. }));
        assert_eq!(pipeline.store().read().unwrap(), before);
    }

    #[test]
    fn warnings_survive_a_rejected_batch() {
        let dir = tempdir().unwrap();
        let pipeline = IngestPipeline::new(ColumnarStore::new(dir.path().join("issues.parquet")));
        let body = r#"{"issues":[
            {"html_url":"https://github.com/holoviz/panel/issues/1","created_at":"not a date"},
            {"html_url":"https://github.com/holoviz/hvplot/issues/2","created_at":"2024-01-02"}
        ]}"#;
        let err = pipeline
            .ingest_snapshot(doc("b.json", "holoviz/panel", 2, body))
            .unwrap_err();
        assert_eq!(err.kind(), "source_mismatch");
        assert_eq!(err.warnings.len(), 1);
        assert!(matches!(err.warnings[0], IngestWarning::MalformedRecord { .. }));
    }

    #[test]
    fn crashed_writer_does_not_block_the_next_ingest() {
        let dir = tempdir().unwrap();
        let store = ColumnarStore::new(dir.path().join("issues.parquet"));
        std::fs::write(store.lock_path(), "pid=4194303\n").unwrap();
        let report = IngestPipeline::new(store)
            .ingest_snapshot(doc("a.json", "x", 1, r#"{"issues":[{"id":1,"created_at":"2024-01-01"}]}"#))
            .unwrap();
        assert!(report.written);
    }

    #[test]
    fn corrupt_store_is_never_replaced() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("issues.parquet");
        std::fs::write(&store_path, b"definitely not parquet").unwrap();
        let pipeline = IngestPipeline::new(ColumnarStore::new(&store_path));
        let err = pipeline
            .ingest_snapshot(doc("a.json", "x", 1, r#"{"issues":[{"id":1,"created_at":"2024-01-01"}]}"#))
            .unwrap_err();
        assert!(matches!(err.error, PipelineError::StoreCorrupt { .. }));
        assert_eq!(std::fs::read(&store_path).unwrap(), b"definitely not parquet");
    }

    #[test]
    fn concurrent_writer_is_refused() {
        let dir = tempdir().unwrap();
        let store = ColumnarStore::new(dir.path().join("issues.parquet"));
        let _held = store.lock().unwrap();
        let err = IngestPipeline::new(store)
            .ingest_snapshot(doc("a.json", "x", 1, r#"{"issues":[]}"#))
            .unwrap_err();
        assert!(matches!(err.error, PipelineError::StoreLocked { .. }));
    }

    #[tokio::test]
    async fn sync_run_merges_good_repos_and_reports_failures() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::write(
            root.join("panel.json"),
            r#"{"search_query":"repo:holoviz/panel is:issue","issues":[
                {"html_url":"https://github.com/holoviz/panel/issues/1","created_at":"2024-01-01T00:00:00Z"},
                {"html_url":"https://github.com/holoviz/panel/issues/2","created_at":"2024-01-03T00:00:00Z","closed_at":"2024-01-04T00:00:00Z"},
                {"html_url":"https://github.com/holoviz/panel/issues/3"}
            ]}"#,
        )
        .unwrap();
        std::fs::write(root.join("lumen.json"), b"{ not json").unwrap();
        std::fs::write(
            root.join("datashader.json"),
            r#"{"issues":[
                {"html_url":"https://github.com/holoviz/hvplot/issues/7","created_at":"2024-01-02T00:00:00Z"},
                {"html_url":"https://github.com/holoviz/datashader/issues/8","created_at":"yesterday"}
            ]}"#,
        )
        .unwrap();
        std::fs::write(
            root.join("repos.yaml"),
            "repos:\n  - repo: holoviz/panel\n    display_name: Panel\n    snapshot_path: panel.json\n  - repo: holoviz/lumen\n    snapshot_path: lumen.json\n  - repo: holoviz/datashader\n    snapshot_path: datashader.json\n  - repo: holoviz/param\n    snapshot_path: missing.json\n  - repo: holoviz/colorcet\n    enabled: false\n    snapshot_path: missing.json\n",
        )
        .unwrap();

        let config = PipelineConfig {
            store_path: root.join("data/issues.parquet"),
            artifacts_dir: root.join("artifacts"),
            reports_dir: root.join("reports"),
            repos_file: root.join("repos.yaml"),
            ..PipelineConfig::from_lookup(|_| None)
        };
        let summary = run_sync_once(&config).await.unwrap();
        assert_eq!(summary.enabled_repos, 4);
        assert_eq!(summary.merged_repos, 1);
        assert_eq!(summary.failed_repos, 3);
        assert!(summary.has_failures());
        assert_eq!(summary.store_records, 2);
        // One from panel, one from the rejected datashader batch.
        assert_eq!(summary.warnings.len(), 2);

        let kinds = summary
            .repos
            .iter()
            .map(|r| (r.repo.as_str(), r.error_kind.as_deref()))
            .collect::<BTreeMap<_, _>>();
        assert_eq!(kinds["holoviz/panel"], None);
        assert_eq!(kinds["holoviz/lumen"], Some("parse_error"));
        assert_eq!(kinds["holoviz/param"], Some("io"));
        assert_eq!(kinds["holoviz/datashader"], Some("source_mismatch"));
        let datashader = summary.repos.iter().find(|r| r.repo == "holoviz/datashader").unwrap();
        assert_eq!(datashader.warnings, 1);
        assert!(datashader.archived_path.is_some());

        let reports = PathBuf::from(&summary.reports_dir);
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(reports.join("run_summary.json")).unwrap()).unwrap();
        assert_eq!(json["failed_repos"], 3);
        let brief = std::fs::read_to_string(reports.join("brief.md")).unwrap();
        assert!(brief.contains("Panel (`holoviz/panel`): 2 records"));
        assert!(brief.contains("FAILED [parse_error]"));

        let store = ColumnarStore::new(&config.store_path).read().unwrap();
        assert_eq!(store.repos().into_iter().collect::<Vec<_>>(), vec!["holoviz/panel"]);
        assert!(std::fs::read_dir(root.join("artifacts")).unwrap().next().is_some());
    }
}
