//! Command line interface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;

use crate::config::{CONFIG_ENV, Config};
use crate::coordinator::Coordinator;
use crate::integration::{LocalIntegration, WATERMARK_DB};
use crate::job::SyncServices;
use crate::model::SpaceKey;
use crate::ports::RemoteSource;
use crate::search::tantivy::index_dir;
use crate::search::{JsonDocumentMapper, SearchHit, SpaceIndex};
use crate::sources::HttpRemoteSource;
use crate::status::{IndexStatus, RunOutcome, SpaceRunInfo};
use crate::watermark::{WatermarkPurpose, WatermarkStore};

#[derive(Parser, Debug)]
#[command(
    name = "space-indexer",
    version,
    about = "Keep a search index in sync with the spaces of a remote document service"
)]
pub struct Cli {
    /// Configuration file (default: <config dir>/space-indexer/config.toml)
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Directory holding the watermark store, the index and the status file
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the synchronization service until Ctrl-C
    Run,
    /// Show the last run and the watermarks of every known space
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Make the next pass run a full update (with delete sweep) of a space
    #[command(name = "force-full")]
    ForceFull { space: String },
    /// Cancel a pending full update; the space gets an incremental update next
    #[command(name = "force-incremental")]
    ForceIncremental { space: String },
    /// Query the index
    Search {
        query: String,
        #[arg(long)]
        space: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}

pub async fn execute(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(crate::default_data_dir);
    tracing::debug!(data_dir = %data_dir.display(), "resolved data directory");

    match cli.command {
        Commands::Run => run_service(config, data_dir).await,
        Commands::Status { json } => show_status(&data_dir, json),
        Commands::ForceFull { space } => force_full(&data_dir, &SpaceKey::new(space)),
        Commands::ForceIncremental { space } => force_incremental(&data_dir, &SpaceKey::new(space)),
        Commands::Search {
            query,
            space,
            limit,
            json,
        } => search(&data_dir, &query, space.map(SpaceKey::new), limit, json),
    }
}

/// The running service. Built and torn down on a blocking thread, since the
/// blocking HTTP client must not be created or dropped inside the runtime.
struct Service {
    coordinator: Coordinator,
    integration: Arc<LocalIntegration>,
    handle: JoinHandle<()>,
}

impl Service {
    fn start(config: Config, data_dir: PathBuf) -> Result<Self> {
        let remote_config = config.require_remote()?;
        let remote: Arc<dyn RemoteSource> = Arc::new(
            HttpRemoteSource::new(remote_config).context("creating HTTP client")?,
        );
        let integration = Arc::new(
            LocalIntegration::open(&data_dir, Arc::clone(&remote))
                .with_context(|| format!("opening data directory {}", data_dir.display()))?
                .with_spaces(config.spaces.include_keys(), config.spaces.exclude_keys()),
        );
        let writer = Arc::new(JsonDocumentMapper::new(config.mapping.clone()));
        let services = SyncServices::new(integration.clone(), remote, writer);
        let schedule = config.schedule.to_schedule()?;

        let coordinator = Coordinator::new(services, schedule, Some(data_dir));
        let handle = coordinator.spawn().context("starting coordinator")?;
        Ok(Self {
            coordinator,
            integration,
            handle,
        })
    }

    fn stop(self) -> Result<()> {
        self.integration.request_shutdown();
        self.coordinator.wake();
        self.handle
            .join()
            .map_err(|_| anyhow!("coordinator thread panicked"))
    }
}

async fn run_service(config: Config, data_dir: PathBuf) -> Result<()> {
    let service = tokio::task::spawn_blocking(move || Service::start(config, data_dir)).await??;
    tracing::info!("service running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");

    tokio::task::spawn_blocking(move || service.stop()).await??;
    Ok(())
}

fn open_store(data_dir: &Path) -> Result<WatermarkStore> {
    let path = data_dir.join(WATERMARK_DB);
    WatermarkStore::open(&path).with_context(|| format!("opening {}", path.display()))
}

fn force_full(data_dir: &Path, key: &SpaceKey) -> Result<()> {
    open_store(data_dir)?.write(key, WatermarkPurpose::ForcedFullUpdate, Utc::now())?;
    println!("Full update of {} requested", key.as_str().bold());
    Ok(())
}

fn force_incremental(data_dir: &Path, key: &SpaceKey) -> Result<()> {
    let store = open_store(data_dir)?;
    let was_forced = store.delete(key, WatermarkPurpose::ForcedFullUpdate)?;
    store.delete(key, WatermarkPurpose::LastSchedulingStart)?;
    if was_forced {
        println!("Pending full update of {} cancelled", key.as_str().bold());
    }
    println!("Incremental update of {} requested", key.as_str().bold());
    Ok(())
}

#[derive(Debug, Serialize)]
struct SpaceStatus {
    space: String,
    #[serde(flatten)]
    run: Option<SpaceRunInfo>,
    watermarks: BTreeMap<String, DateTime<Utc>>,
}

fn collect_status(data_dir: &Path) -> Result<Vec<SpaceStatus>> {
    let store = open_store(data_dir)?;
    let status = IndexStatus::load(data_dir).context("reading status file")?;

    let mut keys: Vec<SpaceKey> = store.spaces()?;
    keys.extend(status.spaces.keys().map(|k| SpaceKey::new(k.as_str())));
    keys.sort();
    keys.dedup();

    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let watermarks = store
            .list(&key)?
            .into_iter()
            .map(|(purpose, at)| (purpose.to_string(), at))
            .collect();
        out.push(SpaceStatus {
            space: key.to_string(),
            run: status.get(&key).cloned(),
            watermarks,
        });
    }
    Ok(out)
}

fn show_status(data_dir: &Path, json: bool) -> Result<()> {
    let spaces = collect_status(data_dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&spaces)?);
        return Ok(());
    }
    if spaces.is_empty() {
        println!("No spaces indexed yet.");
        return Ok(());
    }
    for space in &spaces {
        println!("{}", space.space.bold());
        match &space.run {
            Some(run) => {
                let outcome = match &run.last_result {
                    RunOutcome::Success => "success".green().to_string(),
                    RunOutcome::PartialFailure(msg) => format!("{} ({msg})", "partial failure".yellow()),
                    RunOutcome::Failed(msg) => format!("{} ({msg})", "failed".red()),
                    RunOutcome::Skipped => "skipped".dimmed().to_string(),
                };
                let started = run
                    .last_run
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "-".into());
                let kind = if run.full_update { "full" } else { "incremental" };
                println!("  last run   {started} {kind}: {outcome}");
                println!(
                    "  counters   updated {} deleted {} (+{} comments) errors {} in {} ms",
                    run.updated, run.deleted, run.deleted_secondary, run.with_error, run.duration_ms
                );
            }
            None => println!("  last run   {}", "never".dimmed()),
        }
        for (purpose, at) in &space.watermarks {
            println!("  {purpose:<22} {}", at.to_rfc3339());
        }
    }
    Ok(())
}

fn search(
    data_dir: &Path,
    query: &str,
    space: Option<SpaceKey>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let hits: Vec<SearchHit> = match SpaceIndex::open_reader(&index_dir(data_dir)?)
        .context("opening index")?
    {
        Some(index) => index.search(query, space.as_ref(), limit)?,
        None => Vec::new(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        let title = hit.title.as_deref().unwrap_or(&hit.record_id);
        println!(
            "{}. [{}] {} {}",
            i + 1,
            hit.space_key.cyan(),
            title.bold(),
            format!("({} {}, score {:.2})", hit.kind, hit.record_id, hit.score).dimmed()
        );
        if !hit.preview.is_empty() {
            println!("   {}", hit.preview.replace('\n', " "));
        }
    }
    Ok(())
}
