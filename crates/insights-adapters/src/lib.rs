//! Snapshot sources, the snapshot parser and the schema normalizer.
//!
//! A snapshot is one issue-metrics JSON document for one repository. Parsing
//! only checks the document shape and splits core fields from everything else;
//! [`normalize::Normalizer`] turns the result into canonical records.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use insights_core::{
    json_kind, IssueId, ParseError, Period, PipelineError, PipelineResult, SnapshotContext,
};
use insights_storage::HttpFetcher;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

pub mod normalize;

pub use normalize::{parse_duration_secs, parse_timestamp, Normalizer, NormalizerConfig};

pub const CRATE_NAME: &str = "insights-adapters";

/// Keys consumed by the parser; every other per-issue key is passed through.
const CORE_ISSUE_KEYS: &[&str] = &[
    "id",
    "created_at",
    "closed_at",
    "labels",
    "is_pull_request",
    "repo",
    "repository",
];

/// One issue entry after shape checks, before type coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedIssue {
    pub position: usize,
    pub id: Option<IssueId>,
    pub repo_hint: Option<String>,
    pub created_at: Option<JsonValue>,
    pub closed_at: Option<JsonValue>,
    pub labels: Vec<String>,
    pub is_pull_request: bool,
    pub fields: BTreeMap<String, JsonValue>,
}

/// Entry that could not be turned into a [`ParsedIssue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    pub position: usize,
    pub issue_id: Option<String>,
    pub reason: String,
}

/// Values a document can carry about its own provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentHints {
    pub repo: Option<String>,
    pub period: Option<Period>,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSnapshot {
    pub issues: Vec<ParsedIssue>,
    pub rejected: Vec<RejectedEntry>,
    /// Top-level fields other than `issues`, kept verbatim.
    pub extensions: BTreeMap<String, JsonValue>,
    pub hints: DocumentHints,
}

/// Explicit context supplied by the caller; wins over document hints.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOverrides {
    pub repo: Option<String>,
    pub period: Option<Period>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl ParsedSnapshot {
    /// Resolves the declared context: overrides, then document hints, then the
    /// repository named by the entries' URLs, then `captured_fallback`.
    pub fn resolve_context(
        &self,
        overrides: &SnapshotOverrides,
        captured_fallback: DateTime<Utc>,
    ) -> Result<SnapshotContext, ParseError> {
        let source_repo = overrides
            .repo
            .clone()
            .or_else(|| self.hints.repo.clone())
            .or_else(|| self.issues.iter().find_map(|i| i.repo_hint.clone()))
            .ok_or(ParseError::UnknownRepository)?;
        Ok(SnapshotContext {
            source_repo,
            period: overrides.period.or(self.hints.period),
            captured_at: overrides
                .captured_at
                .or(self.hints.captured_at)
                .unwrap_or(captured_fallback),
        })
    }
}

/// Decodes one raw snapshot document. Pure; document-level problems are a
/// [`ParseError`], entry-level problems end up in `rejected`.
pub fn parse_snapshot(bytes: &[u8]) -> Result<ParsedSnapshot, ParseError> {
    let mut root = match serde_json::from_slice::<JsonValue>(bytes)? {
        JsonValue::Object(root) => root,
        other => return Err(ParseError::NotAnObject(json_kind(&other))),
    };
    let issues = match root.remove("issues") {
        Some(JsonValue::Array(items)) => items,
        Some(other) => return Err(ParseError::IssuesNotAList(json_kind(&other))),
        None => return Err(ParseError::MissingIssues),
    };

    let hints = document_hints(&root);
    let mut parsed = Vec::with_capacity(issues.len());
    let mut rejected = Vec::new();
    for (position, entry) in issues.into_iter().enumerate() {
        match parse_issue(position, entry) {
            Ok(issue) => parsed.push(issue),
            Err(entry) => rejected.push(entry),
        }
    }
    debug!(issues = parsed.len(), rejected = rejected.len(), "parsed snapshot");

    Ok(ParsedSnapshot {
        issues: parsed,
        rejected,
        extensions: root.into_iter().collect(),
        hints,
    })
}

fn document_hints(root: &JsonMap<String, JsonValue>) -> DocumentHints {
    let search_query = root.get("search_query").and_then(JsonValue::as_str).unwrap_or_default();
    let query_token = |prefix: &str| {
        search_query
            .split_whitespace()
            .find_map(|token| token.strip_prefix(prefix))
            .map(str::to_string)
    };

    let repo = ["repo", "repository"]
        .iter()
        .find_map(|k| root.get(*k).and_then(JsonValue::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| query_token("repo:"));
    let period = root
        .get("period")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .or_else(|| query_token("created:"))
        .and_then(|raw| raw.parse::<Period>().ok());
    let captured_at = ["captured_at", "generated_at"]
        .iter()
        .find_map(|k| root.get(*k))
        .and_then(normalize::timestamp_from_json);

    DocumentHints {
        repo,
        period,
        captured_at,
    }
}

fn parse_issue(position: usize, entry: JsonValue) -> Result<ParsedIssue, RejectedEntry> {
    let mut fields = match entry {
        JsonValue::Object(fields) => fields,
        other => {
            return Err(RejectedEntry {
                position,
                issue_id: None,
                reason: format!("entry is a {}, not an object", json_kind(&other)),
            })
        }
    };
    let html_url = fields
        .get("html_url")
        .and_then(JsonValue::as_str)
        .map(str::to_string);

    let id = match fields.get("id") {
        Some(value) if !value.is_null() => IssueId::from_json(value),
        _ => html_url.as_deref().and_then(issue_number_from_url),
    };
    let reject = |reason: String| RejectedEntry {
        position,
        issue_id: id.as_ref().map(ToString::to_string),
        reason,
    };

    let labels = match fields.get("labels") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items.iter().filter_map(label_name).collect(),
        Some(other) => return Err(reject(format!("labels must be a list, found {}", json_kind(other)))),
    };
    let is_pull_request = match fields.get("is_pull_request") {
        Some(JsonValue::Bool(b)) => *b,
        None | Some(JsonValue::Null) => {
            fields.contains_key("pull_request")
                || html_url.as_deref().is_some_and(|u| u.contains("/pull/"))
        }
        Some(other) => {
            return Err(reject(format!(
                "is_pull_request must be a bool, found {}",
                json_kind(other)
            )))
        }
    };
    let repo_hint = ["repo", "repository"]
        .iter()
        .find_map(|k| fields.get(*k).and_then(JsonValue::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| html_url.as_deref().and_then(repo_from_url))
        .or_else(|| {
            fields
                .get("url")
                .and_then(JsonValue::as_str)
                .and_then(repo_from_url)
        });

    let created_at = fields.remove("created_at");
    let closed_at = fields.remove("closed_at");
    for key in CORE_ISSUE_KEYS {
        fields.remove(*key);
    }

    Ok(ParsedIssue {
        position,
        id,
        repo_hint,
        created_at,
        closed_at,
        labels,
        is_pull_request,
        fields: fields.into_iter().collect(),
    })
}

fn label_name(value: &JsonValue) -> Option<String> {
    let name = match value {
        JsonValue::String(s) => s.as_str(),
        JsonValue::Object(obj) => obj.get("name")?.as_str()?,
        _ => return None,
    };
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// `https://github.com/org/name/issues/12` → `org/name`. REST API URLs
/// (`https://api.github.com/repos/org/name/...`, or `/api/v3/repos/...` on
/// Enterprise hosts) name the repository after the `repos` segment.
fn repo_from_url(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let (host, path) = rest.split_once('/')?;
    let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
    if host.starts_with("api.") || segments.peek() == Some(&"api") {
        segments.by_ref().find(|s| *s == "repos")?;
    }
    let org = segments.next()?;
    let name = segments.next()?;
    Some(format!("{org}/{name}"))
}

fn issue_number_from_url(url: &str) -> Option<IssueId> {
    let last = url.trim_end_matches('/').rsplit('/').next()?;
    last.parse::<u64>().ok().map(IssueId::Number)
}

/// Raw snapshot bytes as handed over by a source.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub origin: String,
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub attempts: usize,
}

/// Where snapshots for one repository come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self, repo: &str) -> PipelineResult<FetchedSnapshot>;
}

#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self, _repo: &str) -> PipelineResult<FetchedSnapshot> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| PipelineError::io(format!("reading {}", self.path.display()), e))?;
        // The file's mtime stands in for capture time so re-ingesting an
        // unchanged file is a no-op.
        let fetched_at = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(FetchedSnapshot {
            origin: self.describe(),
            bytes,
            fetched_at,
            attempts: 1,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    http: Arc<HttpFetcher>,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self, repo: &str) -> PipelineResult<FetchedSnapshot> {
        let resp = self
            .http
            .fetch_bytes(repo, &self.url)
            .await
            .map_err(|err| PipelineError::NetworkFailure {
                repo: repo.to_string(),
                attempts: err.attempts(),
                message: err.to_string(),
            })?;
        Ok(FetchedSnapshot {
            origin: resp.final_url,
            bytes: resp.body,
            fetched_at: Utc::now(),
            attempts: resp.attempts,
        })
    }
}
