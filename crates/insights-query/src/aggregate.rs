//! Pure rollups over a [`HistoricalStore`]. Nothing here is authoritative;
//! every view can be recomputed from the store at any time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use insights_core::{HistoricalStore, IssueRecord, Period};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const UNLABELED: &str = "(unlabeled)";
pub const NO_MILESTONE: &str = "(no milestone)";
const SECS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {param} {value:?}: expected {expected}")]
pub struct QueryParamError {
    pub param: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl QueryParamError {
    fn new(param: &'static str, value: &str, expected: &'static str) -> Self {
        Self {
            param,
            value: value.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    All,
    Repo,
    Label,
    Kind,
    Milestone,
}

impl FromStr for GroupBy {
    type Err = QueryParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "repo" => Ok(Self::Repo),
            "label" => Ok(Self::Label),
            "kind" => Ok(Self::Kind),
            "milestone" => Ok(Self::Milestone),
            _ => Err(QueryParamError::new("group_by", s, "all, repo, label, kind or milestone")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodBucket {
    All,
    Day,
    Week,
    Month,
    Year,
}

impl FromStr for PeriodBucket {
    type Err = QueryParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(QueryParamError::new("bucket", s, "all, day, week, month or year")),
        }
    }
}

impl PeriodBucket {
    /// First day of the bucket containing `day`.
    pub fn start_of(self, day: NaiveDate) -> NaiveDate {
        match self {
            Self::All | Self::Day => day,
            Self::Week => day - Days::new(u64::from(day.weekday().num_days_from_monday())),
            Self::Month => day.with_day(1).unwrap_or(day),
            Self::Year => NaiveDate::from_ymd_opt(day.year(), 1, 1).unwrap_or(day),
        }
    }

    fn next_start(self, start: NaiveDate) -> Option<NaiveDate> {
        match self {
            Self::All => None,
            Self::Day => start.checked_add_days(Days::new(1)),
            Self::Week => start.checked_add_days(Days::new(7)),
            Self::Month => start.checked_add_months(Months::new(1)),
            Self::Year => start.checked_add_months(Months::new(12)),
        }
    }

    pub fn label(self, day: NaiveDate) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Day => day.format("%Y-%m-%d").to_string(),
            Self::Week => {
                let week = day.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Self::Month => day.format("%Y-%m").to_string(),
            Self::Year => day.format("%Y").to_string(),
        }
    }
}

/// What each `(group, bucket)` cell reports. Distribution metrics name the
/// metrics key they summarize, e.g. `median:time_to_close`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregateMetric {
    Count,
    Open,
    Closed,
    ClosedRate,
    ClosedInPeriod,
    Mean(String),
    Median(String),
    P90(String),
    Min(String),
    Max(String),
}

impl FromStr for AggregateMetric {
    type Err = QueryParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const EXPECTED: &str =
            "count, open, closed, closed_rate, closed_in_period or mean|median|p90|min|max:<metric key>";
        let trimmed = s.trim();
        if let Some((stat, key)) = trimmed.split_once(':') {
            let key = key.trim();
            if key.is_empty() {
                return Err(QueryParamError::new("metric", s, EXPECTED));
            }
            let key = key.to_string();
            return match stat.trim().to_ascii_lowercase().as_str() {
                "mean" | "avg" => Ok(Self::Mean(key)),
                "median" => Ok(Self::Median(key)),
                "p90" => Ok(Self::P90(key)),
                "min" => Ok(Self::Min(key)),
                "max" => Ok(Self::Max(key)),
                _ => Err(QueryParamError::new("metric", s, EXPECTED)),
            };
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "count" => Ok(Self::Count),
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "closed_rate" => Ok(Self::ClosedRate),
            "closed_in_period" => Ok(Self::ClosedInPeriod),
            _ => Err(QueryParamError::new("metric", s, EXPECTED)),
        }
    }
}

impl fmt::Display for AggregateMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => f.write_str("count"),
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
            Self::ClosedRate => f.write_str("closed_rate"),
            Self::ClosedInPeriod => f.write_str("closed_in_period"),
            Self::Mean(key) => write!(f, "mean:{key}"),
            Self::Median(key) => write!(f, "median:{key}"),
            Self::P90(key) => write!(f, "p90:{key}"),
            Self::Min(key) => write!(f, "min:{key}"),
            Self::Max(key) => write!(f, "max:{key}"),
        }
    }
}

impl AggregateMetric {
    pub fn metric_key(&self) -> Option<&str> {
        match self {
            Self::Mean(key) | Self::Median(key) | Self::P90(key) | Self::Min(key) | Self::Max(key) => {
                Some(key)
            }
            _ => None,
        }
    }

    fn compute(&self, records: &[&IssueRecord]) -> Option<f64> {
        let values = || -> Vec<f64> {
            let key = self.metric_key().unwrap_or_default();
            records.iter().filter_map(|r| r.metrics.get(key).copied()).collect()
        };
        match self {
            Self::Count | Self::ClosedInPeriod => Some(records.len() as f64),
            Self::Open => Some(records.iter().filter(|r| r.is_open()).count() as f64),
            Self::Closed => Some(records.iter().filter(|r| r.is_closed()).count() as f64),
            Self::ClosedRate => {
                let closed = records.iter().filter(|r| r.is_closed()).count();
                (!records.is_empty()).then(|| closed as f64 / records.len() as f64)
            }
            Self::Mean(_) => mean(&values()),
            Self::Median(_) => quantile(values(), 0.5),
            Self::P90(_) => quantile(values(), 0.9),
            Self::Min(_) => values().into_iter().reduce(f64::min),
            Self::Max(_) => values().into_iter().reduce(f64::max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateQuery {
    pub group_by: GroupBy,
    pub metric: AggregateMetric,
    pub bucket: PeriodBucket,
    pub repo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub group: String,
    pub bucket: String,
    pub value: f64,
}

/// Rows sorted by `(group, bucket)`. Cells where a distribution metric has
/// no observations are omitted rather than reported as zero.
pub fn aggregate(store: &HistoricalStore, query: &AggregateQuery) -> Vec<AggregateRow> {
    let by_closed = query.metric == AggregateMetric::ClosedInPeriod;
    let mut cells: BTreeMap<(String, NaiveDate), Vec<&IssueRecord>> = BTreeMap::new();
    for record in filtered(store, query.repo.as_deref(), None) {
        let anchor = if by_closed {
            match record.closed_at {
                Some(ts) => ts,
                None => continue,
            }
        } else {
            record.created_at
        };
        let bucket_start = query.bucket.start_of(anchor.date_naive());
        for group in groups_of(record, query.group_by) {
            cells.entry((group, bucket_start)).or_default().push(record);
        }
    }

    let mut rows: BTreeMap<(String, String), f64> = BTreeMap::new();
    for ((group, start), records) in cells {
        if let Some(value) = query.metric.compute(&records) {
            rows.insert((group, query.bucket.label(start)), value);
        }
    }
    rows.into_iter()
        .map(|((group, bucket), value)| AggregateRow { group, bucket, value })
        .collect()
}

fn groups_of(record: &IssueRecord, group_by: GroupBy) -> Vec<String> {
    match group_by {
        GroupBy::All => vec!["all".to_string()],
        GroupBy::Repo => vec![record.repo.clone()],
        GroupBy::Kind => vec![kind_of(record).to_string()],
        GroupBy::Label if record.labels.is_empty() => vec![UNLABELED.to_string()],
        GroupBy::Label => record.labels.iter().cloned().collect(),
        GroupBy::Milestone => vec![milestone_of(record).unwrap_or(NO_MILESTONE).to_string()],
    }
}

/// Milestone title from the `milestone` extension, which collectors emit
/// either as a plain title or as the GitHub milestone object.
pub fn milestone_of(record: &IssueRecord) -> Option<&str> {
    let title = match record.extensions.get("milestone")? {
        JsonValue::String(title) => title.as_str(),
        JsonValue::Object(obj) => obj
            .get("title")
            .or_else(|| obj.get("name"))
            .and_then(JsonValue::as_str)?,
        _ => return None,
    };
    let title = title.trim();
    (!title.is_empty()).then_some(title)
}

fn maintainer_responded(record: &IssueRecord) -> Option<bool> {
    record
        .extensions
        .get("maintainer_responded")
        .map(|v| v.as_bool().unwrap_or(false))
}

pub fn kind_of(record: &IssueRecord) -> &'static str {
    if record.is_pull_request {
        "pull_request"
    } else {
        "issue"
    }
}

pub fn list_repos(store: &HistoricalStore) -> BTreeSet<String> {
    store.repos()
}

/// Records for `repo` (all when `None`) created inside `period`, in key order.
pub fn records<'a>(
    store: &'a HistoricalStore,
    repo: Option<&'a str>,
    period: Option<Period>,
) -> Vec<&'a IssueRecord> {
    filtered(store, repo, period).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    #[default]
    All,
    Open,
    Closed,
}

impl FromStr for StatusFilter {
    type Err = QueryParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(QueryParamError::new("status", s, "all, open or closed")),
        }
    }
}

/// Table filter behind the dashboard's record listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub repo: Option<String>,
    pub period: Option<Period>,
    pub status: StatusFilter,
    /// `Some(false)` keeps items without a maintainer response, including
    /// those where the flag is null. Ignored when no candidate record carries
    /// `maintainer_responded` at all.
    pub maintainer_responded: Option<bool>,
}

pub fn parse_flag(param: &'static str, raw: &str) -> Result<bool, QueryParamError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(QueryParamError::new(param, raw, "true or false")),
    }
}

pub fn filter_records<'a>(store: &'a HistoricalStore, filter: &RecordFilter) -> Vec<&'a IssueRecord> {
    let mut matched = filtered(store, filter.repo.as_deref(), filter.period)
        .filter(|r| match filter.status {
            StatusFilter::All => true,
            StatusFilter::Open => r.is_open(),
            StatusFilter::Closed => r.is_closed(),
        })
        .collect::<Vec<_>>();
    if let Some(wanted) = filter.maintainer_responded {
        if matched.iter().any(|r| maintainer_responded(r).is_some()) {
            matched.retain(|r| maintainer_responded(r).unwrap_or(false) == wanted);
        }
    }
    matched
}

fn filtered<'a, 'q>(
    store: &'a HistoricalStore,
    repo: Option<&'q str>,
    period: Option<Period>,
) -> impl Iterator<Item = &'a IssueRecord> + 'q
where
    'a: 'q,
{
    store
        .iter()
        .filter(move |r| repo.map_or(true, |repo| r.repo.eq_ignore_ascii_case(repo)))
        .filter(move |r| period.map_or(true, |p| p.contains(r.created_at)))
}

/// Headline numbers per repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoSummary {
    pub repo: String,
    pub total: usize,
    pub issues: usize,
    pub pull_requests: usize,
    pub open: usize,
    pub closed: usize,
    pub mean_days_to_close: Option<f64>,
    pub median_days_to_close: Option<f64>,
    pub first_month: Option<String>,
    pub last_month: Option<String>,
    /// Open items nobody on the maintainer list answered yet; `None` when the
    /// snapshots never carried `maintainer_responded`.
    pub open_without_maintainer_response: Option<usize>,
    pub open_with_milestone: usize,
    pub open_without_milestone: usize,
    pub last_captured_at: Option<DateTime<Utc>>,
}

pub fn summaries(store: &HistoricalStore) -> Vec<RepoSummary> {
    let mut per_repo: BTreeMap<&str, Vec<&IssueRecord>> = BTreeMap::new();
    for record in store.iter() {
        per_repo.entry(record.repo.as_str()).or_default().push(record);
    }
    per_repo
        .into_iter()
        .map(|(repo, records)| summarize(repo, &records))
        .collect()
}

fn summarize(repo: &str, records: &[&IssueRecord]) -> RepoSummary {
    let open = records.iter().filter(|r| r.is_open()).count();
    let open_with_milestone = records
        .iter()
        .filter(|r| r.is_open() && milestone_of(r).is_some())
        .count();
    let pull_requests = records.iter().filter(|r| r.is_pull_request).count();
    let close_days = records
        .iter()
        .filter_map(|r| {
            let closed = r.closed_at?;
            Some((closed - r.created_at).num_seconds() as f64 / SECS_PER_DAY)
        })
        .collect::<Vec<_>>();
    let month = |ts: Option<DateTime<Utc>>| ts.map(|t| t.format("%B %Y").to_string());

    let tracks_response = records
        .iter()
        .any(|r| r.extensions.contains_key("maintainer_responded"));
    let open_without_maintainer_response = tracks_response.then(|| {
        records
            .iter()
            .filter(|r| r.is_open())
            .filter(|r| maintainer_responded(r) != Some(true))
            .count()
    });

    RepoSummary {
        repo: repo.to_string(),
        total: records.len(),
        issues: records.len() - pull_requests,
        pull_requests,
        open,
        closed: records.len() - open,
        mean_days_to_close: mean(&close_days),
        median_days_to_close: quantile(close_days, 0.5),
        first_month: month(records.iter().map(|r| r.created_at).min()),
        last_month: month(records.iter().map(|r| r.created_at).max()),
        open_without_maintainer_response,
        open_with_milestone,
        open_without_milestone: open - open_with_milestone,
        last_captured_at: records.iter().map(|r| r.captured_at).max(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BacklogPoint {
    pub bucket: String,
    pub open: usize,
}

/// Number of items open at the end of each bucket, from the bucket of the
/// earliest creation to the bucket of the latest creation or close.
pub fn backlog(store: &HistoricalStore, repo: Option<&str>, bucket: PeriodBucket) -> Vec<BacklogPoint> {
    let records = filtered(store, repo, None).collect::<Vec<_>>();
    let first = records.iter().map(|r| r.created_at.date_naive()).min();
    let last = records
        .iter()
        .flat_map(|r| std::iter::once(r.created_at).chain(r.closed_at))
        .map(|ts| ts.date_naive())
        .max();
    let (Some(first), Some(last)) = (first, last) else {
        return Vec::new();
    };

    let open_at_end_of = |end: NaiveDate| {
        records
            .iter()
            .filter(|r| r.created_at.date_naive() <= end)
            .filter(|r| r.closed_at.map_or(true, |c| c.date_naive() > end))
            .count()
    };

    let mut points = Vec::new();
    let mut start = bucket.start_of(first);
    loop {
        let next = bucket.next_start(start);
        let end = next
            .and_then(|n| n.pred_opt())
            .filter(|end| *end < last)
            .unwrap_or(last);
        points.push(BacklogPoint {
            bucket: bucket.label(start),
            open: open_at_end_of(end),
        });
        match next {
            Some(n) if n <= last => start = n,
            _ => break,
        }
    }
    points
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Linear interpolation between closest ranks.
fn quantile(mut values: Vec<f64>, q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let rank = q.clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(values[lower] + (values[upper] - values[lower]) * weight)
}
