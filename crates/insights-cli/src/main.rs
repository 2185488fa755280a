use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use insights_adapters::{parse_timestamp, FileSnapshotSource, SnapshotOverrides, SnapshotSource};
use insights_core::{Period, PipelineError};
use insights_query::QueryService;
use insights_storage::ColumnarStore;
use insights_sync::{IngestPipeline, PipelineConfig, SnapshotDocument};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "insights")]
#[command(about = "Issue Insights: ingest issue-metrics snapshots into a columnar store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse, normalize and merge snapshot files into the store.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, env = "INSIGHTS_STORE_PATH", default_value = "./data/issues.parquet")]
        store: PathBuf,
        /// Source repository (org/name) when the documents do not say.
        #[arg(long)]
        repo: Option<String>,
        /// Covered period, `YYYY-MM-DD..YYYY-MM-DD`.
        #[arg(long)]
        period: Option<Period>,
        #[arg(long, value_parser = parse_captured_at)]
        captured_at: Option<DateTime<Utc>>,
    },
    /// Fetch every enabled repository from the registry and merge the results.
    Sync {
        #[arg(long)]
        repos_file: Option<PathBuf>,
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Serve the dashboard and JSON API.
    Serve {
        #[arg(long, env = "INSIGHTS_WEB_PORT", default_value_t = 8000)]
        port: u16,
        #[arg(long, env = "INSIGHTS_STORE_PATH", default_value = "./data/issues.parquet")]
        store: PathBuf,
    },
    /// Print per-repository headline numbers.
    Summary {
        #[arg(long, env = "INSIGHTS_STORE_PATH", default_value = "./data/issues.parquet")]
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn parse_captured_at(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).ok_or_else(|| format!("unrecognized timestamp {raw:?}"))
}

/// `ingest` exit status for bad input documents (parse error, source mismatch).
const EXIT_BAD_INPUT: u8 = 2;
/// `ingest` exit status when the store cannot be used (corrupt, locked).
const EXIT_STORE: u8 = 3;

/// Runs one `ingest` and maps the outcome to a process exit status; the store
/// is only written on status 0.
async fn run_ingest(files: &[PathBuf], store: &Path, overrides: SnapshotOverrides) -> u8 {
    info!(files = files.len(), store = %store.display(), "ingesting snapshot files");
    let mut docs = Vec::with_capacity(files.len());
    for file in files {
        let source = FileSnapshotSource::new(file);
        match source.fetch(overrides.repo.as_deref().unwrap_or_default()).await {
            Ok(fetched) => docs.push(SnapshotDocument::from_fetched(fetched, overrides.clone())),
            Err(err) => {
                error!(file = %file.display(), error = %err, "cannot read snapshot");
                return 1;
            }
        }
    }

    let pipeline = IngestPipeline::new(ColumnarStore::new(store));
    let report = match pipeline.ingest_documents(docs) {
        Ok(report) => report,
        Err(err) => {
            error!(
                store = %store.display(),
                kind = err.kind(),
                warnings = err.warnings.len(),
                error = %err,
                "ingest failed"
            );
            return match err.error {
                PipelineError::Parse { .. } | PipelineError::SourceMismatch { .. } => EXIT_BAD_INPUT,
                PipelineError::StoreCorrupt { .. } | PipelineError::StoreLocked { .. } => EXIT_STORE,
                _ => 1,
            };
        }
    };

    for batch in &report.batches {
        println!(
            "{} -> {}: {} records (inserted={} replaced={} kept={} unchanged={}), {} warnings",
            batch.origin,
            batch.repo,
            batch.records,
            batch.stats.inserted,
            batch.stats.replaced,
            batch.stats.kept_existing,
            batch.stats.unchanged,
            batch.warnings
        );
    }
    println!(
        "store {}: {} records, revision {}{}",
        store.display(),
        report.store_records,
        report.revision,
        if report.written { "" } else { " (unchanged)" }
    );
    0
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        repos_file: None,
        store: None,
    });

    match command {
        Commands::Ingest {
            files,
            store,
            repo,
            period,
            captured_at,
        } => {
            let overrides = SnapshotOverrides {
                repo,
                period,
                captured_at,
            };
            return Ok(ExitCode::from(run_ingest(&files, &store, overrides).await));
        }
        Commands::Sync { repos_file, store } => {
            let mut config = PipelineConfig::from_env();
            if let Some(path) = repos_file {
                config.repos_file = path;
            }
            if let Some(path) = store {
                config.store_path = path;
            }
            let summary = insights_sync::run_sync_once(&config).await?;
            println!(
                "sync complete: run_id={} merged={} failed={} records={} revision={} reports={}",
                summary.run_id,
                summary.merged_repos,
                summary.failed_repos,
                summary.store_records,
                summary.revision,
                summary.reports_dir
            );
            if summary.has_failures() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Serve { port, store } => {
            insights_web::serve(insights_web::AppState::new(store), port).await?;
        }
        Commands::Summary { store, json } => {
            let service = QueryService::new(ColumnarStore::new(&store));
            let summaries = service.summaries()?;
            if json {
                println!("{}", serde_json::to_string_pretty(summaries.as_ref())?);
            } else {
                for s in summaries.iter() {
                    println!(
                        "{}: total={} open={} closed={} prs={} mean_days_to_close={} median_days_to_close={}",
                        s.repo,
                        s.total,
                        s.open,
                        s.closed,
                        s.pull_requests,
                        s.mean_days_to_close.map(|d| format!("{d:.1}")).unwrap_or_else(|| "n/a".into()),
                        s.median_days_to_close.map(|d| format!("{d:.1}")).unwrap_or_else(|| "n/a".into()),
                    );
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn overrides(repo: &str) -> SnapshotOverrides {
        SnapshotOverrides {
            repo: Some(repo.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ingest_exit_status_follows_the_error_kind() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("data/issues.parquet");
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"issues":[{"id":1,"created_at":"2024-01-01"}]}"#).unwrap();
        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, b"{ nope").unwrap();
        let foreign = dir.path().join("foreign.json");
        std::fs::write(
            &foreign,
            r#"{"issues":[{"html_url":"https://github.com/holoviz/hvplot/issues/2","created_at":"2024-01-02"}]}"#,
        )
        .unwrap();

        assert_eq!(run_ingest(&[broken.clone()], &store, overrides("holoviz/panel")).await, EXIT_BAD_INPUT);
        assert!(!store.exists());

        assert_eq!(run_ingest(&[good.clone()], &store, overrides("holoviz/panel")).await, 0);
        let before = std::fs::read(&store).unwrap();

        assert_eq!(run_ingest(&[foreign], &store, overrides("holoviz/panel")).await, EXIT_BAD_INPUT);
        assert_eq!(
            run_ingest(&[dir.path().join("missing.json")], &store, overrides("holoviz/panel")).await,
            1
        );
        assert_eq!(std::fs::read(&store).unwrap(), before);

        std::fs::write(&store, b"not parquet").unwrap();
        assert_eq!(run_ingest(&[good], &store, overrides("holoviz/panel")).await, EXIT_STORE);
        assert_eq!(std::fs::read(&store).unwrap(), b"not parquet");
    }
}
