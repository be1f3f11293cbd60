use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use refsync_core::{BatchResult, CatalogItem, NewCategoryGroup};
use refsync_upstream::{CatalogSource, HttpCatalogSource, HttpClientConfig, HttpFetcher, SeedFileSource};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{BootstrapMode, SyncConfig};
use crate::coordinator::Completion;
use crate::keyed::{upsert_category_groups, upsert_tags, KeyUpsertOutcome};
use crate::SyncServices;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub tags: KeyUpsertOutcome,
    pub category_groups: KeyUpsertOutcome,
    pub batch: BatchResult,
    /// Items from the source that failed validation and were not merged.
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MaintenanceOutcome {
    /// Bootstrap only: both lookup tables already hold rows.
    NotNeeded,
    LockNotAcquired,
    Succeeded(MaintenanceReport),
    Failed(String),
}

pub fn catalog_source_for(config: &SyncConfig) -> Result<Arc<dyn CatalogSource>> {
    match config.bootstrap_mode {
        BootstrapMode::Seed => Ok(Arc::new(SeedFileSource::new(config.seed_path.clone()))),
        BootstrapMode::Upstream => {
            let Some(base_url) = &config.upstream_url else {
                bail!("REFSYNC_BOOTSTRAP_MODE=upstream requires REFSYNC_UPSTREAM_URL");
            };
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                ..Default::default()
            })?;
            Ok(Arc::new(HttpCatalogSource::new(base_url.clone(), fetcher)))
        }
    }
}

/// Splits off items that fail field validation, logging each one.
fn accept_valid(items: Vec<CatalogItem>) -> (Vec<CatalogItem>, usize) {
    let mut accepted = Vec::with_capacity(items.len());
    let mut rejected = 0;
    for item in items {
        let item = item.normalized();
        let errors = item.validate();
        if errors.is_empty() {
            accepted.push(item);
        } else {
            warn!(external_id = item.external_id, errors = ?errors, "skipping invalid upstream item");
            rejected += 1;
        }
    }
    (accepted, rejected)
}

pub async fn run_bootstrap(
    services: &SyncServices,
    source: &dyn CatalogSource,
    cancel: &CancellationToken,
) -> Result<MaintenanceOutcome> {
    bootstrap_guarded(services, source, cancel)
        .instrument(info_span!("bootstrap", source = source.name()))
        .await
}

async fn bootstrap_guarded(
    services: &SyncServices,
    source: &dyn CatalogSource,
    cancel: &CancellationToken,
) -> Result<MaintenanceOutcome> {
    let lookups = services
        .catalog
        .load_lookups()
        .await
        .context("reading lookup tables")?;
    if lookups.has_tags() && lookups.has_category_groups() {
        info!("lookup tables already populated; bootstrap not needed");
        return Ok(MaintenanceOutcome::NotNeeded);
    }

    if !services
        .coordinator
        .try_begin_bootstrap()
        .await
        .context("acquiring bootstrap lock")?
    {
        warn!("bootstrap already running or system ready; skipping");
        return Ok(MaintenanceOutcome::LockNotAcquired);
    }

    let run = bootstrap_body(services, source, cancel).await;
    let (completion, outcome) = settle(run);
    services
        .coordinator
        .complete_bootstrap(completion)
        .await
        .context("releasing bootstrap lock")?;
    Ok(outcome)
}

async fn bootstrap_body(
    services: &SyncServices,
    source: &dyn CatalogSource,
    cancel: &CancellationToken,
) -> Result<MaintenanceReport> {
    let seed = source
        .initial_load()
        .await
        .with_context(|| format!("loading initial dataset from {}", source.name()))?;

    let tag_names: Vec<String> = seed.tags.iter().map(|t| t.name.clone()).collect();
    let tags = upsert_tags(services.tags.as_ref(), &tag_names)
        .await
        .context("ingesting tags")?;
    let groups: Vec<NewCategoryGroup> = seed
        .category_groups
        .iter()
        .map(|g| NewCategoryGroup {
            number: g.number,
            name: g.name.clone(),
        })
        .collect();
    let category_groups = upsert_category_groups(services.category_groups.as_ref(), &groups)
        .await
        .context("ingesting category groups")?;

    let (items, rejected) = accept_valid(seed.items);
    let batch = services
        .engine
        .upsert_batch(&items, cancel)
        .await
        .context("reconciling seed items")?;
    if batch.cancelled {
        bail!("bootstrap cancelled after {} items", batch.items.len());
    }

    Ok(MaintenanceReport {
        tags,
        category_groups,
        batch,
        rejected,
    })
}

pub async fn run_nightly_sync(
    services: &SyncServices,
    source: &dyn CatalogSource,
    cancel: &CancellationToken,
) -> Result<MaintenanceOutcome> {
    nightly_guarded(services, source, cancel)
        .instrument(info_span!("nightly_sync", source = source.name()))
        .await
}

async fn nightly_guarded(
    services: &SyncServices,
    source: &dyn CatalogSource,
    cancel: &CancellationToken,
) -> Result<MaintenanceOutcome> {
    if !services
        .coordinator
        .try_begin_nightly_sync()
        .await
        .context("acquiring nightly sync lock")?
    {
        warn!("nightly sync not started: bootstrap pending or another sync running");
        return Ok(MaintenanceOutcome::LockNotAcquired);
    }

    let run = nightly_body(services, source, cancel).await;
    let (completion, outcome) = settle(run);
    services
        .coordinator
        .complete_nightly_sync(completion)
        .await
        .context("releasing nightly sync lock")?;
    Ok(outcome)
}

async fn nightly_body(
    services: &SyncServices,
    source: &dyn CatalogSource,
    cancel: &CancellationToken,
) -> Result<MaintenanceReport> {
    let since = services
        .coordinator
        .current_state()
        .await
        .context("reading system state")?
        .last_sync_at;
    let delta = source
        .delta(since)
        .await
        .with_context(|| format!("fetching delta from {}", source.name()))?;
    info!(items = delta.len(), since = ?since, "fetched upstream delta");

    let (items, rejected) = accept_valid(delta);
    let batch = services
        .engine
        .upsert_batch(&items, cancel)
        .await
        .context("reconciling delta")?;
    if batch.cancelled {
        bail!("nightly sync cancelled after {} items", batch.items.len());
    }

    Ok(MaintenanceReport {
        batch,
        rejected,
        ..Default::default()
    })
}

/// Per-item failures inside the batch still count as a successful run.
fn settle(run: Result<MaintenanceReport>) -> (Completion, MaintenanceOutcome) {
    match run {
        Ok(report) => {
            info!(
                inserted = report.batch.inserted_count,
                updated = report.batch.updated_count,
                failed = report.batch.failed_count,
                rejected = report.rejected,
                "maintenance run succeeded"
            );
            (Completion::Success, MaintenanceOutcome::Succeeded(report))
        }
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "maintenance run failed");
            (
                Completion::Failure(message.clone()),
                MaintenanceOutcome::Failed(message),
            )
        }
    }
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    services: SyncServices,
    source: Arc<dyn CatalogSource>,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>> {
    if !config.nightly_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.nightly_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let services = services.clone();
        let source = Arc::clone(&source);
        let cancel = cancel.clone();
        Box::pin(async move {
            match run_nightly_sync(&services, source.as_ref(), &cancel).await {
                Ok(outcome) => info!(?outcome, "scheduled nightly sync finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled nightly sync errored"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
