//! Read-only query contract over the historical store: repository listing,
//! record filtering and cached aggregate views.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use insights_core::{HistoricalStore, IssueRecord, Period, PipelineError, StoreStamp};
use insights_storage::ColumnarStore;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};

pub mod aggregate;

pub use aggregate::{
    parse_flag, AggregateMetric, AggregateQuery, AggregateRow, BacklogPoint, GroupBy, PeriodBucket,
    QueryParamError, RecordFilter, RepoSummary, StatusFilter, NO_MILESTONE,
};

pub const CRATE_NAME: &str = "insights-query";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    InvalidParam(#[from] QueryParamError),
    #[error(transparent)]
    Store(#[from] PipelineError),
}

/// Identity of the store file as last seen on disk. The writer renames a
/// fresh temp file over the store, so every commit brings a new inode even
/// when size and mtime happen to match the previous file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

impl FileStamp {
    fn observe(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode: inode(&meta),
        })
    }
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

#[derive(Debug)]
struct Loaded {
    file: Option<FileStamp>,
    store: Arc<HistoricalStore>,
}

/// Derived views for one store stamp.
#[derive(Debug, Default)]
struct ViewCache {
    stamp: Option<StoreStamp>,
    aggregates: HashMap<AggregateQuery, Arc<Vec<AggregateRow>>>,
    backlogs: HashMap<(Option<String>, PeriodBucket), Arc<Vec<BacklogPoint>>>,
    summaries: HashMap<(), Arc<Vec<RepoSummary>>>,
}

impl ViewCache {
    fn len(&self) -> usize {
        self.aggregates.len() + self.backlogs.len() + self.summaries.len()
    }
}

/// Dashboard-facing handle. Holds a read-only snapshot of the store and
/// reloads it when the file on disk changes; derived views are cached per
/// [`StoreStamp`].
#[derive(Debug)]
pub struct QueryService {
    source: ColumnarStore,
    loaded: RwLock<Option<Loaded>>,
    views: Mutex<ViewCache>,
}

impl QueryService {
    pub fn new(source: ColumnarStore) -> Self {
        Self {
            source,
            loaded: RwLock::new(None),
            views: Mutex::new(ViewCache::default()),
        }
    }

    pub fn store_path(&self) -> &Path {
        self.source.path()
    }

    /// Current store, re-read only if the file changed since the last call.
    pub fn snapshot(&self) -> Result<Arc<HistoricalStore>, QueryError> {
        let file = FileStamp::observe(self.source.path());
        if let Some(loaded) = self.loaded.read().as_ref() {
            if loaded.file == file {
                return Ok(Arc::clone(&loaded.store));
            }
        }

        let mut guard = self.loaded.write();
        if let Some(loaded) = guard.as_ref() {
            if loaded.file == file {
                return Ok(Arc::clone(&loaded.store));
            }
        }
        let store = Arc::new(self.source.read()?);
        info!(
            path = %self.source.path().display(),
            records = store.len(),
            revision = store.metadata.revision,
            "loaded store"
        );
        *guard = Some(Loaded {
            file,
            store: Arc::clone(&store),
        });
        Ok(store)
    }

    pub fn list_repos(&self) -> Result<BTreeSet<String>, QueryError> {
        let store = self.snapshot()?;
        Ok(aggregate::list_repos(&store))
    }

    pub fn records(&self, repo: Option<&str>, period: Option<Period>) -> Result<Vec<IssueRecord>, QueryError> {
        let store = self.snapshot()?;
        Ok(aggregate::records(&store, repo, period)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn filter_records(&self, filter: &RecordFilter) -> Result<Vec<IssueRecord>, QueryError> {
        let store = self.snapshot()?;
        Ok(aggregate::filter_records(&store, filter)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn aggregate(&self, query: &AggregateQuery) -> Result<Arc<Vec<AggregateRow>>, QueryError> {
        self.cached(
            |views| &mut views.aggregates,
            query.clone(),
            |store| aggregate::aggregate(store, query),
        )
    }

    pub fn summaries(&self) -> Result<Arc<Vec<RepoSummary>>, QueryError> {
        self.cached(|views| &mut views.summaries, (), aggregate::summaries)
    }

    pub fn backlog(&self, repo: Option<&str>, bucket: PeriodBucket) -> Result<Arc<Vec<BacklogPoint>>, QueryError> {
        self.cached(
            |views| &mut views.backlogs,
            (repo.map(str::to_string), bucket),
            |store| aggregate::backlog(store, repo, bucket),
        )
    }

    fn cached<K, V>(
        &self,
        table: impl Fn(&mut ViewCache) -> &mut HashMap<K, Arc<V>>,
        key: K,
        compute: impl FnOnce(&HistoricalStore) -> V,
    ) -> Result<Arc<V>, QueryError>
    where
        K: Eq + Hash + fmt::Debug,
    {
        let store = self.snapshot()?;
        let stamp = store.stamp();
        {
            let mut views = self.views.lock();
            if views.stamp != Some(stamp) {
                *views = ViewCache {
                    stamp: Some(stamp),
                    ..Default::default()
                };
            } else if let Some(view) = table(&mut *views).get(&key) {
                debug!(?key, "view cache hit");
                return Ok(Arc::clone(view));
            }
        }

        let view = Arc::new(compute(&store));
        let mut views = self.views.lock();
        if views.stamp == Some(stamp) {
            table(&mut *views).insert(key, Arc::clone(&view));
        }
        Ok(view)
    }

    #[cfg(test)]
    fn cached_views(&self) -> usize {
        self.views.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use insights_core::IssueId;
    use tempfile::tempdir;

    fn record(id: u64, closed: bool) -> IssueRecord {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        IssueRecord {
            repo: "holoviz/panel".to_string(),
            issue_id: IssueId::Number(id),
            created_at: created,
            closed_at: closed.then(|| created + chrono::Duration::days(2)),
            labels: Default::default(),
            is_pull_request: false,
            metrics: BTreeMap::new(),
            extensions: BTreeMap::new(),
            captured_at: created,
        }
    }

    fn write(store: &ColumnarStore, records: Vec<IssueRecord>, revision: u64) {
        let mut hs = HistoricalStore::empty();
        for r in records {
            hs.records.insert(r.key(), r);
        }
        hs.metadata.revision = revision;
        hs.metadata.last_merged_at = Some(Utc::now());
        store.write(&hs).unwrap();
    }

    fn count_query() -> AggregateQuery {
        AggregateQuery {
            group_by: GroupBy::All,
            metric: AggregateMetric::Closed,
            bucket: PeriodBucket::All,
            repo: None,
        }
    }

    #[test]
    fn missing_store_reads_as_empty() {
        let dir = tempdir().unwrap();
        let service = QueryService::new(ColumnarStore::new(dir.path().join("issues.parquet")));
        assert!(service.list_repos().unwrap().is_empty());
        assert!(service.aggregate(&count_query()).unwrap().is_empty());
    }

    #[test]
    fn views_are_cached_until_the_store_changes() {
        let dir = tempdir().unwrap();
        let columnar = ColumnarStore::new(dir.path().join("issues.parquet"));
        write(&columnar, vec![record(1, true)], 1);

        let service = QueryService::new(columnar.clone());
        let first = service.aggregate(&count_query()).unwrap();
        let again = service.aggregate(&count_query()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        service.summaries().unwrap();
        assert_eq!(service.cached_views(), 2);

        write(&columnar, vec![record(1, true), record(2, true), record(3, false)], 2);
        let refreshed = service.aggregate(&count_query()).unwrap();
        assert_eq!(refreshed[0].value, 2.0);
        assert_eq!(service.cached_views(), 1);
        assert_eq!(service.records(None, None).unwrap().len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn replacement_within_one_mtime_tick_is_noticed() {
        let dir = tempdir().unwrap();
        let columnar = ColumnarStore::new(dir.path().join("issues.parquet"));
        write(&columnar, vec![record(1, true)], 1);
        let service = QueryService::new(columnar.clone());
        assert_eq!(service.snapshot().unwrap().metadata.revision, 1);

        let modified = std::fs::metadata(columnar.path()).unwrap().modified().unwrap();
        write(&columnar, vec![record(1, false)], 2);
        std::fs::File::options()
            .write(true)
            .open(columnar.path())
            .unwrap()
            .set_modified(modified)
            .unwrap();

        assert_eq!(service.snapshot().unwrap().metadata.revision, 2);
        assert_eq!(service.records(None, None).unwrap()[0].closed_at, None);
    }

    #[test]
    fn corrupt_store_surfaces_as_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.parquet");
        std::fs::write(&path, b"garbage").unwrap();
        let service = QueryService::new(ColumnarStore::new(&path));
        assert!(matches!(
            service.summaries().unwrap_err(),
            QueryError::Store(PipelineError::StoreCorrupt { .. })
        ));
    }
}
