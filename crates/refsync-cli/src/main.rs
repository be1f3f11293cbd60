use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use refsync_storage::{MemoryStore, PgStore, Store};
use refsync_sync::{
    catalog_source_for, maybe_build_scheduler, run_bootstrap, run_nightly_sync,
    MaintenanceOutcome, SyncConfig, SyncServices,
};
use refsync_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "refsync")]
#[command(about = "Reference catalog sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Run the HTTP API with the startup bootstrap and the nightly scheduler.
    Serve,
    /// Apply the embedded database migrations.
    Migrate,
    /// Load the initial dataset once and exit.
    Bootstrap,
    /// Run one delta sync and exit.
    Sync,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("REFSYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    let initialized = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    initialized.context("initializing tracing")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve);

    let config = SyncConfig::from_env();
    for warning in config.warnings() {
        warn!(%warning, "configuration check");
    }

    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to postgres")?;
            run(command, &config, Arc::new(store)).await
        }
        None => run(command, &config, Arc::new(MemoryStore::new())).await,
    }
}

async fn run<S: Store>(command: Commands, config: &SyncConfig, store: Arc<S>) -> Result<()> {
    info!(backend = store.backend_name(), ?command, "starting");
    match command {
        Commands::Migrate => {
            store.migrate().await.context("running migrations")?;
            println!("migrations applied ({})", store.backend_name());
        }
        Commands::Serve => serve(config, store).await?,
        Commands::Bootstrap => {
            let services = SyncServices::new(store, config.status_ttl);
            let source = catalog_source_for(config)?;
            let outcome =
                run_bootstrap(&services, source.as_ref(), &cancel_on_ctrl_c()).await?;
            report(outcome)?;
        }
        Commands::Sync => {
            let services = SyncServices::new(store, config.status_ttl);
            let source = catalog_source_for(config)?;
            let outcome =
                run_nightly_sync(&services, source.as_ref(), &cancel_on_ctrl_c()).await?;
            report(outcome)?;
        }
    }
    Ok(())
}

fn report(outcome: MaintenanceOutcome) -> Result<()> {
    match outcome {
        MaintenanceOutcome::NotNeeded => println!("lookups already populated; nothing to do"),
        MaintenanceOutcome::LockNotAcquired => {
            println!("another maintenance run holds the lock; skipped")
        }
        MaintenanceOutcome::Succeeded(report) => println!(
            "done: tags +{} groups +{} items inserted={} updated={} skipped={} failed={} rejected={}",
            report.tags.inserted,
            report.category_groups.inserted,
            report.batch.inserted_count,
            report.batch.updated_count,
            report.batch.skipped_count,
            report.batch.failed_count,
            report.rejected,
        ),
        MaintenanceOutcome::Failed(message) => bail!("maintenance run failed: {message}"),
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current item");
            token.cancel();
        }
    });
    cancel
}

async fn serve<S: Store>(config: &SyncConfig, store: Arc<S>) -> Result<()> {
    if config.auto_migrate {
        store.migrate().await.context("running migrations")?;
    }
    let services = SyncServices::new(store, config.status_ttl);
    let source = catalog_source_for(config)?;
    let shutdown = CancellationToken::new();

    let bootstrap = {
        let services = services.clone();
        let source = Arc::clone(&source);
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            match run_bootstrap(&services, source.as_ref(), &cancel).await {
                Ok(outcome) => info!(?outcome, "startup bootstrap finished"),
                Err(err) => error!(error = %format!("{err:#}"), "startup bootstrap errored"),
            }
        })
    };

    let mut scheduler = maybe_build_scheduler(
        config,
        services.clone(),
        Arc::clone(&source),
        shutdown.child_token(),
    )
    .await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.nightly_cron, "nightly sync scheduled");
    }

    let served = refsync_web::serve(
        &config.bind_addr,
        AppState::new(services, config),
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    if let Err(err) = bootstrap.await {
        warn!(error = %err, "startup bootstrap task did not finish cleanly");
    }
    served
}
