//! Core domain model for issue-activity ingestion: records, identity keys, the
//! historical store and the error taxonomy shared by every pipeline stage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "insights-core";

/// Version of the persisted store layout. Bumped on incompatible changes.
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// Issue identifier as emitted by the collector. Numeric strings are
/// canonicalized to `Number` so the same issue never gets two identities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IssueId {
    Number(u64),
    Text(String),
}

impl IssueId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse::<u64>() {
            Ok(n) => Some(Self::Number(n)),
            Err(_) => Some(Self::Text(trimmed.to_string())),
        }
    }

    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n.as_u64().map(Self::Number).or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                    .map(|f| Self::Number(f as u64))
            }),
            JsonValue::String(s) => Self::parse(s),
            _ => None,
        }
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// `(repo, issue_id)`: at most one live record per key in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub repo: String,
    pub issue_id: IssueId,
}

impl IdentityKey {
    pub fn new(repo: impl Into<String>, issue_id: IssueId) -> Self {
        Self {
            repo: repo.into(),
            issue_id,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.issue_id)
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(a: NaiveDate, b: NaiveDate) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn union(&self, other: &Period) -> Period {
        Period {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn contains_date(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.contains_date(ts.date_naive())
    }

    /// Smallest period covering every date in `days`.
    pub fn spanning(days: impl IntoIterator<Item = NaiveDate>) -> Option<Period> {
        days.into_iter().fold(None, |acc: Option<Period>, day| {
            Some(match acc {
                Some(p) => p.union(&Period::single(day)),
                None => Period::single(day),
            })
        })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid period {input:?}: expected YYYY-MM-DD or YYYY-MM-DD..YYYY-MM-DD")]
pub struct PeriodParseError {
    pub input: String,
}

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PeriodParseError {
            input: s.to_string(),
        };
        let parse_day = |raw: &str| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| err());
        match s.split_once("..") {
            Some((a, b)) => Ok(Period::new(parse_day(a)?, parse_day(b)?)),
            None => Ok(Period::single(parse_day(s)?)),
        }
    }
}

/// Canonical timestamp precision for the store (microseconds, UTC).
pub fn canonical_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// One tracked issue or pull request.
///
/// `metrics` only holds keys that were computed for this record; an absent key
/// is not the same as zero. `extensions` keeps every non-core, non-numeric
/// field the collector emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub repo: String,
    pub issue_id: IssueId,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub labels: BTreeSet<String>,
    pub is_pull_request: bool,
    pub metrics: BTreeMap<String, f64>,
    pub extensions: BTreeMap<String, JsonValue>,
    pub captured_at: DateTime<Utc>,
}

impl IssueRecord {
    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(self.repo.clone(), self.issue_id.clone())
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

/// Top-level snapshot fields kept per repository; the latest capture wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoExtensions {
    pub captured_at: DateTime<Utc>,
    pub values: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub last_merged_at: Option<DateTime<Utc>>,
    pub covered_period: Option<Period>,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub metric_keys: BTreeSet<String>,
    #[serde(default)]
    pub repo_extensions: BTreeMap<String, RepoExtensions>,
}

/// Cache key for derived views: changes whenever a merge changes the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreStamp {
    pub last_merged_at: Option<DateTime<Utc>>,
    pub revision: u64,
}

/// The durable merged record set. Single source of truth; only the merge
/// engine produces new versions of it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoricalStore {
    pub records: BTreeMap<IdentityKey, IssueRecord>,
    pub metadata: StoreMetadata,
}

impl HistoricalStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&IssueRecord> {
        self.records.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IssueRecord> {
        self.records.values()
    }

    pub fn repos(&self) -> BTreeSet<String> {
        self.records.keys().map(|k| k.repo.clone()).collect()
    }

    pub fn metric_keys(&self) -> &BTreeSet<String> {
        &self.metadata.metric_keys
    }

    pub fn stamp(&self) -> StoreStamp {
        StoreStamp {
            last_merged_at: self.metadata.last_merged_at,
            revision: self.metadata.revision,
        }
    }
}

/// Declared context of one ingestion unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotContext {
    pub source_repo: String,
    pub period: Option<Period>,
    pub captured_at: DateTime<Utc>,
}

/// Output of the normalizer for one snapshot, ready for the merge engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub source_repo: String,
    pub period: Option<Period>,
    pub captured_at: DateTime<Utc>,
    pub records: Vec<IssueRecord>,
    pub metric_keys: BTreeSet<String>,
    pub extensions: BTreeMap<String, JsonValue>,
    pub warnings: Vec<IngestWarning>,
}

impl NormalizedBatch {
    pub fn empty(context: &SnapshotContext) -> Self {
        Self {
            source_repo: context.source_repo.clone(),
            period: context.period,
            captured_at: canonical_timestamp(context.captured_at),
            records: Vec::new(),
            metric_keys: BTreeSet::new(),
            extensions: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// Non-fatal findings collected during a run and reported at its end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestWarning {
    MalformedRecord {
        repo: String,
        position: usize,
        issue_id: Option<String>,
        reason: String,
    },
    DuplicateEntry {
        repo: String,
        issue_id: String,
        occurrences: usize,
    },
    UnparsableMetric {
        repo: String,
        issue_id: String,
        field: String,
        value: String,
    },
}

impl fmt::Display for IngestWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedRecord {
                repo,
                position,
                issue_id,
                reason,
            } => match issue_id {
                Some(id) => write!(f, "{repo}: malformed record #{position} (issue {id}) skipped: {reason}"),
                None => write!(f, "{repo}: malformed record #{position} skipped: {reason}"),
            },
            Self::DuplicateEntry {
                repo,
                issue_id,
                occurrences,
            } => write!(
                f,
                "{repo}: issue {issue_id} appeared {occurrences} times in one snapshot; kept the last"
            ),
            Self::UnparsableMetric {
                repo,
                issue_id,
                field,
                value,
            } => write!(f, "{repo}: issue {issue_id} has unparsable {field} {value:?}; left absent"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document root must be a JSON object, found {0}")]
    NotAnObject(&'static str),
    #[error("document has no \"issues\" list")]
    MissingIssues,
    #[error("\"issues\" must be a list, found {0}")]
    IssuesNotAList(&'static str),
    #[error("cannot determine the source repository; declare it explicitly")]
    UnknownRepository,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("parse error in {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: ParseError,
    },
    #[error("source mismatch: batch declared {declared} but issue {issue_id} belongs to {found}")]
    SourceMismatch {
        declared: String,
        found: String,
        issue_id: String,
    },
    #[error("store at {} is corrupt: {reason}", path.display())]
    StoreCorrupt { path: PathBuf, reason: String },
    #[error("store at {} is locked by another writer", path.display())]
    StoreLocked { path: PathBuf },
    #[error("fetching snapshot for {repo} failed after {attempts} attempt(s): {message}")]
    NetworkFailure {
        repo: String,
        attempts: usize,
        message: String,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding store: {0}")]
    Encode(String),
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::StoreCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Short taxonomy name used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::SourceMismatch { .. } => "source_mismatch",
            Self::StoreCorrupt { .. } => "store_corrupt",
            Self::StoreLocked { .. } => "store_locked",
            Self::NetworkFailure { .. } => "network_failure",
            Self::Io { .. } => "io",
            Self::Encode(_) => "encode",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// `org/name` → `org__name`, for use as a single path component.
pub fn repo_slug(repo: &str) -> String {
    repo.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' { c } else { '_' })
        .collect::<String>()
        .replace('_', "__")
        .trim_matches('_')
        .to_string()
}
