//! Axum + Askama dashboard surface over the read-only query service.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use insights_core::Period;
use insights_query::{
    parse_flag, AggregateMetric, AggregateQuery, GroupBy, PeriodBucket, QueryError, QueryParamError,
    QueryService, RecordFilter, RepoSummary, StatusFilter,
};
use insights_storage::ColumnarStore;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "insights-web";

pub struct AppState {
    pub title: String,
    pub query: QueryService,
}

impl AppState {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            title: "Issue Insights".to_string(),
            query: QueryService::new(ColumnarStore::new(store_path)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RecordsParams {
    repo: Option<String>,
    period: Option<String>,
    status: Option<String>,
    maintainer_responded: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregateParams {
    group_by: Option<String>,
    metric: Option<String>,
    bucket: Option<String>,
    repo: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BacklogParams {
    repo: Option<String>,
    bucket: Option<String>,
}

/// Display-ready row for the summary table.
struct SummaryRow {
    repo: String,
    total: usize,
    open: usize,
    closed: usize,
    pull_requests: usize,
    mean_days_to_close: String,
    median_days_to_close: String,
    months: String,
    awaiting_maintainer: String,
    milestone_coverage: String,
}

impl From<&RepoSummary> for SummaryRow {
    fn from(s: &RepoSummary) -> Self {
        let days = |v: Option<f64>| v.map(|d| format!("{d:.1}")).unwrap_or_else(|| "n/a".into());
        Self {
            repo: s.repo.clone(),
            total: s.total,
            open: s.open,
            closed: s.closed,
            pull_requests: s.pull_requests,
            mean_days_to_close: days(s.mean_days_to_close),
            median_days_to_close: days(s.median_days_to_close),
            months: match (&s.first_month, &s.last_month) {
                (Some(first), Some(last)) if first == last => first.clone(),
                (Some(first), Some(last)) => format!("{first} to {last}"),
                _ => "n/a".into(),
            },
            awaiting_maintainer: s
                .open_without_maintainer_response
                .map(|n| n.to_string())
                .unwrap_or_else(|| "n/a".into()),
            milestone_coverage: format!("{} of {}", s.open_with_milestone, s.open),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    title: String,
    store_path: String,
    revision: u64,
    last_merged_at: String,
    covered_period: String,
    metric_keys: Vec<String>,
    rows: Vec<SummaryRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/repos", get(repos_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/records", get(records_handler))
        .route("/api/aggregate", get(aggregate_handler))
        .route("/api/backlog", get(backlog_handler))
        .route("/api/chart", get(chart_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, store = %state.query.store_path().display(), "serving dashboard");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("INSIGHTS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let store_path = std::env::var("INSIGHTS_STORE_PATH").unwrap_or_else(|_| "./data/issues.parquet".to_string());
    serve(AppState::new(store_path), port).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let loaded = state
        .query
        .snapshot()
        .and_then(|store| Ok((store, state.query.summaries()?)));
    match loaded {
        Ok((store, summaries)) => {
            let meta = &store.metadata;
            render_html(IndexTemplate {
                title: state.title.clone(),
                store_path: state.query.store_path().display().to_string(),
                revision: meta.revision,
                last_merged_at: meta
                    .last_merged_at
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "never".into()),
                covered_period: meta
                    .covered_period
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "n/a".into()),
                metric_keys: meta.metric_keys.iter().cloned().collect(),
                rows: summaries.iter().map(SummaryRow::from).collect(),
            })
        }
        Err(err) => api_error(err),
    }
}

async fn repos_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.query.list_repos() {
        Ok(repos) => Json(repos).into_response(),
        Err(err) => api_error(err),
    }
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.query.summaries() {
        Ok(rows) => Json(rows.as_ref().clone()).into_response(),
        Err(err) => api_error(err),
    }
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecordsParams>,
) -> Response {
    let period = match non_empty(&params.period).map(str::parse::<Period>).transpose() {
        Ok(period) => period,
        Err(err) => return bad_request(err.to_string()),
    };
    let filter = match record_filter(&params, period) {
        Ok(filter) => filter,
        Err(err) => return api_error(err.into()),
    };
    match state.query.filter_records(&filter) {
        Ok(records) => Json(records).into_response(),
        Err(err) => api_error(err),
    }
}

async fn aggregate_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AggregateParams>,
) -> Response {
    let query = match aggregate_query(&params) {
        Ok(query) => query,
        Err(err) => return api_error(err.into()),
    };
    match state.query.aggregate(&query) {
        Ok(rows) => Json(rows.as_ref().clone()).into_response(),
        Err(err) => api_error(err),
    }
}

async fn backlog_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BacklogParams>,
) -> Response {
    let bucket = match parse_or_default::<PeriodBucket>(&params.bucket, PeriodBucket::Month) {
        Ok(bucket) => bucket,
        Err(err) => return api_error(err.into()),
    };
    match state.query.backlog(non_empty(&params.repo), bucket) {
        Ok(points) => Json(points.as_ref().clone()).into_response(),
        Err(err) => api_error(err),
    }
}

/// Plotly figure: one line per group over time, or a single bar trace
/// across groups when the bucket is `all`.
async fn chart_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AggregateParams>,
) -> Response {
    let query = match aggregate_query(&AggregateParams {
        group_by: params.group_by.or_else(|| Some("repo".into())),
        bucket: params.bucket.or_else(|| Some("month".into())),
        ..params
    }) {
        Ok(query) => query,
        Err(err) => return api_error(err.into()),
    };
    let rows = match state.query.aggregate(&query) {
        Ok(rows) => rows,
        Err(err) => return api_error(err),
    };

    let data = if query.bucket == PeriodBucket::All {
        vec![serde_json::json!({
            "type": "bar",
            "name": query.metric.to_string(),
            "x": rows.iter().map(|r| r.group.as_str()).collect::<Vec<_>>(),
            "y": rows.iter().map(|r| r.value).collect::<Vec<_>>(),
        })]
    } else {
        let mut series: BTreeMap<&str, (Vec<&str>, Vec<f64>)> = BTreeMap::new();
        for row in rows.iter() {
            let entry = series.entry(row.group.as_str()).or_default();
            entry.0.push(row.bucket.as_str());
            entry.1.push(row.value);
        }
        series
            .into_iter()
            .map(|(name, (x, y))| {
                serde_json::json!({
                    "type": "scatter",
                    "mode": "lines+markers",
                    "name": name,
                    "x": x,
                    "y": y,
                })
            })
            .collect::<Vec<_>>()
    };
    Json(serde_json::json!({
        "data": data,
        "layout": {
            "title": format!("{} per {}", query.metric, bucket_name(query.bucket)),
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    }))
    .into_response()
}

fn aggregate_query(params: &AggregateParams) -> Result<AggregateQuery, QueryParamError> {
    Ok(AggregateQuery {
        group_by: parse_or_default(&params.group_by, GroupBy::All)?,
        metric: parse_or_default(&params.metric, AggregateMetric::Count)?,
        bucket: parse_or_default(&params.bucket, PeriodBucket::All)?,
        repo: non_empty(&params.repo).map(str::to_string),
    })
}

fn record_filter(params: &RecordsParams, period: Option<Period>) -> Result<RecordFilter, QueryParamError> {
    Ok(RecordFilter {
        repo: non_empty(&params.repo).map(str::to_string),
        period,
        status: parse_or_default(&params.status, StatusFilter::All)?,
        maintainer_responded: non_empty(&params.maintainer_responded)
            .filter(|raw| !raw.eq_ignore_ascii_case("all"))
            .map(|raw| parse_flag("maintainer_responded", raw))
            .transpose()?,
    })
}

fn parse_or_default<T>(raw: &Option<String>, default: T) -> Result<T, QueryParamError>
where
    T: std::str::FromStr<Err = QueryParamError>,
{
    match non_empty(raw) {
        Some(raw) => raw.parse(),
        None => Ok(default),
    }
}

fn non_empty(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn bucket_name(bucket: PeriodBucket) -> &'static str {
    match bucket {
        PeriodBucket::All => "all time",
        PeriodBucket::Day => "day",
        PeriodBucket::Week => "week",
        PeriodBucket::Month => "month",
        PeriodBucket::Year => "year",
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn api_error(err: QueryError) -> Response {
    match err {
        QueryError::InvalidParam(err) => bad_request(err.to_string()),
        QueryError::Store(err) => server_error(err.into()),
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
