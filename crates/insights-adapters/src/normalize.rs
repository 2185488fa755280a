//! Schema normalization: type coercion, metric/extension split and
//! within-snapshot deduplication.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use insights_core::{
    canonical_timestamp, IdentityKey, IngestWarning, IssueRecord, NormalizedBatch, Period,
    SnapshotContext,
};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{ParsedIssue, ParsedSnapshot};

/// Duration columns the issue-metrics collector emits.
pub const DEFAULT_DURATION_FIELDS: &[&str] = &[
    "time_to_first_response",
    "time_to_close",
    "time_to_answer",
    "time_in_draft",
];

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"];
const ABSENT_MARKERS: &[&str] = &["", "none", "nat", "nan", "null"];

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Always treated as metrics; values are seconds or duration strings.
    pub duration_fields: BTreeSet<String>,
    /// Metric used to fill a missing `closed_at` as `created_at + value`.
    pub derive_closed_at_from: Option<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            duration_fields: DEFAULT_DURATION_FIELDS.iter().map(|s| s.to_string()).collect(),
            derive_closed_at_from: Some("time_to_close".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn normalize(&self, parsed: &ParsedSnapshot, context: &SnapshotContext) -> NormalizedBatch {
        let mut batch = NormalizedBatch::empty(context);
        batch.extensions = parsed.extensions.clone();

        for rejected in &parsed.rejected {
            batch.warnings.push(IngestWarning::MalformedRecord {
                repo: context.source_repo.clone(),
                position: rejected.position,
                issue_id: rejected.issue_id.clone(),
                reason: rejected.reason.clone(),
            });
        }

        let mut latest: BTreeMap<IdentityKey, (IssueRecord, usize)> = BTreeMap::new();
        for issue in &parsed.issues {
            let record = match self.normalize_issue(issue, context, batch.captured_at, &mut batch.warnings) {
                Ok(record) => record,
                Err(reason) => {
                    batch.warnings.push(IngestWarning::MalformedRecord {
                        repo: context.source_repo.clone(),
                        position: issue.position,
                        issue_id: issue.id.as_ref().map(ToString::to_string),
                        reason,
                    });
                    continue;
                }
            };
            batch.metric_keys.extend(record.metrics.keys().cloned());
            let entry = latest.entry(record.key()).or_insert_with(|| (record.clone(), 0));
            entry.0 = record;
            entry.1 += 1;
        }

        for (key, (record, occurrences)) in latest {
            if occurrences > 1 {
                batch.warnings.push(IngestWarning::DuplicateEntry {
                    repo: key.repo.clone(),
                    issue_id: key.issue_id.to_string(),
                    occurrences,
                });
            }
            batch.records.push(record);
        }

        if batch.period.is_none() {
            batch.period = Period::spanning(batch.records.iter().map(|r| r.created_at.date_naive()));
        }
        debug!(
            repo = %batch.source_repo,
            records = batch.records.len(),
            warnings = batch.warnings.len(),
            "normalized snapshot"
        );
        batch
    }

    fn normalize_issue(
        &self,
        issue: &ParsedIssue,
        context: &SnapshotContext,
        captured_at: DateTime<Utc>,
        warnings: &mut Vec<IngestWarning>,
    ) -> Result<IssueRecord, String> {
        let issue_id = issue.id.clone().ok_or_else(|| "missing issue id".to_string())?;
        let created_at = match issue.created_at.as_ref().filter(|v| !v.is_null()) {
            None => return Err("missing created_at".to_string()),
            Some(raw) => timestamp_from_json(raw).ok_or_else(|| format!("unparsable created_at {raw}"))?,
        };
        let mut closed_at = match issue.closed_at.as_ref().filter(|v| !is_absent(v)) {
            None => None,
            Some(raw) => Some(timestamp_from_json(raw).ok_or_else(|| format!("unparsable closed_at {raw}"))?),
        };

        let mut metrics = BTreeMap::new();
        let mut extensions = BTreeMap::new();
        for (key, value) in &issue.fields {
            if is_absent(value) {
                continue;
            }
            if self.config.duration_fields.contains(key) {
                match duration_from_json(value) {
                    Some(secs) => {
                        metrics.insert(key.clone(), secs);
                    }
                    None => warnings.push(IngestWarning::UnparsableMetric {
                        repo: context.source_repo.clone(),
                        issue_id: issue_id.to_string(),
                        field: key.clone(),
                        value: value.to_string(),
                    }),
                }
                continue;
            }
            match value.as_f64().filter(|f| f.is_finite()) {
                Some(number) if value.is_number() => {
                    metrics.insert(key.clone(), number);
                }
                _ => {
                    extensions.insert(key.clone(), value.clone());
                }
            }
        }

        if closed_at.is_none() {
            if let Some(secs) = self
                .config
                .derive_closed_at_from
                .as_ref()
                .and_then(|field| metrics.get(field))
            {
                let millis = (secs * 1000.0).round() as i64;
                closed_at = Duration::try_milliseconds(millis)
                    .and_then(|d| created_at.checked_add_signed(d))
                    .map(canonical_timestamp);
            }
        }

        Ok(IssueRecord {
            // Repository names are case-insensitive; only a genuinely
            // different repository survives as a foreign hint.
            repo: issue
                .repo_hint
                .clone()
                .filter(|hint| !hint.eq_ignore_ascii_case(&context.source_repo))
                .unwrap_or_else(|| context.source_repo.clone()),
            issue_id,
            created_at,
            closed_at,
            labels: issue.labels.iter().cloned().collect(),
            is_pull_request: issue.is_pull_request,
            metrics,
            extensions,
            captured_at,
        })
    }
}

fn is_absent(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => ABSENT_MARKERS.contains(&s.trim().to_ascii_lowercase().as_str()),
        _ => false,
    }
}

/// Accepts RFC 3339, naive date-times (taken as UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(canonical_timestamp(ts.with_timezone(&Utc)));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(canonical_timestamp(ts.with_timezone(&Utc)));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(canonical_timestamp(ts.and_utc()));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

/// Strings go through [`parse_timestamp`]; numbers are unix seconds.
pub fn timestamp_from_json(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_timestamp(s),
        JsonValue::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
        }
        _ => None,
    }
}

/// Parses `timedelta`-style durations into seconds: `"3 days, 4:05:06.5"`,
/// `"1 day"`, `"0:12:00"`, or a bare number of seconds.
pub fn parse_duration_secs(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (days, clock) = match raw.find("day") {
        Some(idx) => {
            let days = raw[..idx].trim().parse::<f64>().ok()?;
            let rest = raw[idx..]
                .trim_start_matches("days")
                .trim_start_matches("day")
                .trim_start_matches(',')
                .trim();
            (days, rest)
        }
        None => (0.0, raw),
    };

    let clock_secs = if clock.is_empty() {
        0.0
    } else {
        let parts = clock.split(':').collect::<Vec<_>>();
        match parts.as_slice() {
            [secs] if raw.find("day").is_none() => secs.trim().parse::<f64>().ok()?,
            [h, m, s] => {
                let h = h.trim().parse::<f64>().ok()?;
                let m = m.trim().parse::<f64>().ok()?;
                let s = s.trim().parse::<f64>().ok()?;
                h * 3600.0 + m * 60.0 + s
            }
            _ => return None,
        }
    };

    let total = days * 86_400.0 + clock_secs;
    total.is_finite().then_some(total)
}

fn duration_from_json(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        JsonValue::String(s) => parse_duration_secs(s),
        _ => None,
    }
}
