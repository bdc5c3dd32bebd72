use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fedsync_core::{SyncMode, SyncStatus, SyncType};
use fedsync_source::{FileSource, HttpClientConfig, PacerConfig, RecordSource, SamGovHttpSource};
use fedsync_storage::{EntityStore, MemoryStore, PgStore, PoolConfig, SyncRunQuery, SyncRunStore};
use fedsync_sync::{SourceBackend, StoreBackend, SyncConfig, SyncService, SyncTypeRegistry};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fedsync")]
#[command(about = "Federal contracting data sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync to completion in the foreground.
    Sync {
        sync_type: SyncType,
        /// Full resync with soft-delete reconciliation instead of an incremental fetch.
        #[arg(long)]
        full: bool,
    },
    Migrate,
    /// Serve the admin API; also runs the scheduler when FEDSYNC_SCHEDULER_ENABLED is set.
    Serve,
    /// Print recent audit rows.
    Logs {
        #[arg(long)]
        sync_type: Option<SyncType>,
        #[arg(long)]
        status: Option<SyncStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("reading configuration from environment")?;

    match cli.command {
        Commands::Sync { sync_type, full } => {
            let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
            let service = build_service(&config).await?;
            let Some(summary) = service.run_now(sync_type, mode).await? else {
                bail!("{sync_type} sync not started: disabled or already running");
            };
            println!(
                "sync complete: run_id={} status={} processed={} created={} updated={} unchanged={} skipped={} failed={} deactivated={}",
                summary.run.id,
                summary.run.status,
                summary.run.records_processed,
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.skipped,
                summary.failed,
                summary.deactivated
            );
            if summary.run.status == SyncStatus::Failed {
                let reason = summary
                    .run
                    .error_detail
                    .map(|detail| detail.message)
                    .unwrap_or_default();
                bail!("sync run {} failed: {reason}", summary.run.id);
            }
        }
        Commands::Migrate => {
            let store = connect_pg(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let service = build_service(&config).await?;
            let recovered = service
                .recover_all_stale()
                .await
                .context("recovering stale runs")?;
            if recovered > 0 {
                warn!(recovered, "stale runs marked failed at startup");
            }
            let _scheduler = if config.scheduler_enabled {
                let scheduler = service.build_scheduler().await?;
                scheduler.start().await.context("starting scheduler")?;
                info!("scheduler started");
                Some(scheduler)
            } else {
                None
            };
            fedsync_web::serve(service, config.web_port).await?;
        }
        Commands::Logs {
            sync_type,
            status,
            limit,
        } => {
            let service = build_service(&config).await?;
            let query = SyncRunQuery {
                sync_type,
                statuses: status.into_iter().collect(),
                limit: Some(limit),
                ..Default::default()
            };
            for run in service.audit().list(&query).await? {
                println!(
                    "{} {:<13} {:<11} {:<7} started={} completed={} processed={} errors={}",
                    run.id,
                    run.sync_type,
                    run.mode,
                    run.status,
                    run.started_at.to_rfc3339(),
                    run.completed_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "-".into()),
                    run.records_processed,
                    run.error_count
                );
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FEDSYNC_LOG_JSON")
        .map(|v| matches!(v.trim(), "1" | "true"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn build_service(config: &SyncConfig) -> Result<SyncService> {
    let registry = SyncTypeRegistry::load(&config.sync_types_file)
        .with_context(|| format!("loading {}", config.sync_types_file.display()))?;
    registry.validate().context("validating sync type settings")?;
    let (entities, runs) = open_store(config).await?;
    let source = open_source(config)?;
    Ok(SyncService::new(entities, runs, source, registry))
}

async fn connect_pg(config: &SyncConfig) -> Result<PgStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for the postgres store")?;
    PgStore::connect(url, PoolConfig::default())
        .await
        .context("connecting to postgres")
}

async fn open_store(config: &SyncConfig) -> Result<(Arc<dyn EntityStore>, Arc<dyn SyncRunStore>)> {
    match config.store {
        StoreBackend::Postgres => {
            let store = Arc::new(connect_pg(config).await?);
            let entities: Arc<dyn EntityStore> = store.clone();
            let runs: Arc<dyn SyncRunStore> = store;
            Ok((entities, runs))
        }
        StoreBackend::Memory => {
            warn!("using the in-memory store; nothing will be persisted");
            let store = Arc::new(MemoryStore::new());
            let entities: Arc<dyn EntityStore> = store.clone();
            let runs: Arc<dyn SyncRunStore> = store;
            Ok((entities, runs))
        }
    }
}

fn open_source(config: &SyncConfig) -> Result<Arc<dyn RecordSource>> {
    match config.source {
        SourceBackend::Api => {
            if config.sam_api_key.is_none() {
                warn!("SAM_API_KEY is not set; requests will likely be rejected");
            }
            let source = SamGovHttpSource::new(HttpClientConfig {
                base_url: config.sam_api_base_url.clone(),
                api_key: config.sam_api_key.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: config.user_agent.clone(),
                pacer: Some(PacerConfig {
                    capacity: 4,
                    refill_every: Duration::from_millis(250),
                }),
            })
            .context("building SAM.gov client")?;
            Ok(Arc::new(source))
        }
        SourceBackend::File => Ok(Arc::new(FileSource::new(config.data_dir.clone()))),
    }
}
