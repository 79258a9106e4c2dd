//! Scrape, reconcile and drift-control pipeline for the partner monitor.

use std::sync::Arc;

use anyhow::Result;
use pmon_storage::{HttpFetcher, PgNotifier, PgSettings, PgStore};

mod config;
mod drift;
mod escalation;
mod jobs;
mod orchestrator;
mod reconcile;

pub const CRATE_NAME: &str = "pmon-sync";

pub use config::MonitorConfig;
pub use drift::{
    CountryAuditSummary, CountryReprocessSummary, DriftDetector, PartnerAuditSummary,
    PartnerReprocessSummary,
};
pub use escalation::{Escalator, DEFAULT_RETRY_DELAY, MAX_DELIVERY_ATTEMPTS};
pub use jobs::{build_scheduler, maybe_build_scheduler, JobKind, JobOutcome, Jobs};
pub use orchestrator::{
    page_url, pool_size, FetchMode, Orchestrator, RunSummary, ScrapeRunner, Targets,
    TargetResolutionError, FULL_CRAWL_WORKERS, MAX_WORKERS,
};
pub use reconcile::{ReconcileSummary, Reconciler};

/// Wire the jobs against PostgreSQL and the live directory.
pub async fn jobs_from_config(config: &MonitorConfig) -> Result<Jobs> {
    let pool = pmon_storage::connect(&config.database_url).await?;
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    Ok(Jobs::new(
        config,
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(PgSettings::new(pool.clone())),
        Arc::new(PgNotifier::new(pool)),
        Arc::new(fetcher),
    ))
}
