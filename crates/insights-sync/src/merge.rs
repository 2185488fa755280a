//! Merge/dedup of a normalized batch into the historical store.
//!
//! Conflicts on one identity key are resolved by a total order over records:
//! closed beats open, a later `closed_at` beats an earlier one, then the later
//! `captured_at` wins, and identical-looking candidates fall back to comparing
//! their canonical JSON. Because the winner is a maximum under that order the
//! merge is idempotent and does not depend on ingestion order.

use std::borrow::Cow;
use std::cmp::Ordering;

use insights_core::{
    HistoricalStore, IngestWarning, IssueRecord, NormalizedBatch, PipelineError, PipelineResult,
    RepoExtensions,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    pub kept_existing: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub store: HistoricalStore,
    pub stats: MergeStats,
    pub changed: bool,
}

/// Produces the store that results from folding `batch` into `store`.
///
/// Fails with `SourceMismatch`, leaving nothing changed, if any record in the
/// batch belongs to a repository other than the declared one.
pub fn merge(store: &HistoricalStore, batch: &NormalizedBatch) -> PipelineResult<MergeOutcome> {
    if let Some(stray) = batch
        .records
        .iter()
        .find(|r| !r.repo.eq_ignore_ascii_case(&batch.source_repo))
    {
        return Err(PipelineError::SourceMismatch {
            declared: batch.source_repo.clone(),
            found: stray.repo.clone(),
            issue_id: stray.issue_id.to_string(),
        });
    }

    // Repository names compare case-insensitively; the spelling already in
    // the store wins so one repository never splits into two key ranges.
    let repo = store
        .repos()
        .into_iter()
        .find(|known| known.eq_ignore_ascii_case(&batch.source_repo))
        .unwrap_or_else(|| batch.source_repo.clone());

    let mut next = store.clone();
    let mut stats = MergeStats::default();
    for incoming in &batch.records {
        let incoming = if incoming.repo == repo {
            Cow::Borrowed(incoming)
        } else {
            Cow::Owned(IssueRecord {
                repo: repo.clone(),
                ..incoming.clone()
            })
        };
        let key = incoming.key();
        match next.records.get(&key) {
            None => {
                next.records.insert(key, incoming.into_owned());
                stats.inserted += 1;
            }
            Some(existing) if *existing == *incoming => stats.unchanged += 1,
            Some(existing) => {
                if precedence(&incoming, existing) == Ordering::Greater {
                    next.records.insert(key, incoming.into_owned());
                    stats.replaced += 1;
                } else {
                    stats.kept_existing += 1;
                }
            }
        }
    }

    let meta = &mut next.metadata;
    meta.metric_keys.extend(batch.metric_keys.iter().cloned());
    for record in &batch.records {
        meta.metric_keys.extend(record.metrics.keys().cloned());
    }
    meta.covered_period = match (meta.covered_period, batch.period) {
        (Some(a), Some(b)) => Some(a.union(&b)),
        (a, b) => a.or(b),
    };
    meta.last_merged_at = meta.last_merged_at.max(Some(batch.captured_at));
    if !batch.extensions.is_empty() {
        let candidate = RepoExtensions {
            captured_at: batch.captured_at,
            values: batch.extensions.clone(),
        };
        let replace = match meta.repo_extensions.get(&repo) {
            None => true,
            Some(current) => extensions_precedence(&candidate, current) == Ordering::Greater,
        };
        if replace {
            meta.repo_extensions.insert(repo.clone(), candidate);
        }
    }

    let changed = next.records != store.records || next.metadata != store.metadata;
    if changed {
        next.metadata.revision = store.metadata.revision + 1;
    }
    debug!(
        repo = %batch.source_repo,
        inserted = stats.inserted,
        replaced = stats.replaced,
        kept_existing = stats.kept_existing,
        unchanged = stats.unchanged,
        changed,
        "merged batch"
    );
    Ok(MergeOutcome {
        store: next,
        stats,
        changed,
    })
}

/// Total order used to pick the surviving record for one identity key.
pub fn precedence(a: &IssueRecord, b: &IssueRecord) -> Ordering {
    a.is_closed()
        .cmp(&b.is_closed())
        .then_with(|| a.closed_at.cmp(&b.closed_at))
        .then_with(|| a.captured_at.cmp(&b.captured_at))
        .then_with(|| fingerprint(a).cmp(&fingerprint(b)))
}

fn extensions_precedence(a: &RepoExtensions, b: &RepoExtensions) -> Ordering {
    a.captured_at
        .cmp(&b.captured_at)
        .then_with(|| fingerprint(&a.values).cmp(&fingerprint(&b.values)))
}

fn fingerprint<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .map(|v| canonical_json(&v))
        .unwrap_or_default()
}

fn canonical_json(value: &JsonValue) -> String {
    // serde_json maps are sorted unless `preserve_order` is enabled somewhere
    // in the graph; sort explicitly so the tie-break never depends on it.
    match value {
        JsonValue::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", JsonValue::String(k.clone()), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        JsonValue::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

/// Folds several batches in order, stopping at the first rejected one.
pub fn merge_all<'a>(
    store: &HistoricalStore,
    batches: impl IntoIterator<Item = &'a NormalizedBatch>,
) -> PipelineResult<(HistoricalStore, Vec<MergeStats>)> {
    let mut current = store.clone();
    let mut stats = Vec::new();
    for batch in batches {
        let outcome = merge(&current, batch)?;
        current = outcome.store;
        stats.push(outcome.stats);
    }
    Ok((current, stats))
}

/// Warnings across batches, in batch order.
pub fn collect_warnings<'a>(batches: impl IntoIterator<Item = &'a NormalizedBatch>) -> Vec<IngestWarning> {
    batches
        .into_iter()
        .flat_map(|b| b.warnings.iter().cloned())
        .collect()
}
