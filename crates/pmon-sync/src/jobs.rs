use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use pmon_storage::{MonitorStore, Notifier, PageFetcher, SettingsStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::MonitorConfig;
use crate::drift::{
    CountryAuditSummary, CountryReprocessSummary, DriftDetector, PartnerAuditSummary,
    PartnerReprocessSummary,
};
use crate::escalation::Escalator;
use crate::orchestrator::{FetchMode, Orchestrator, RunSummary, TargetResolutionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FetchPartnerData,
    ValidateCountries,
    ValidatePartners,
    ReprocessFlaggedCountries,
    ReprocessFlaggedPartners,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::FetchPartnerData,
        JobKind::ValidateCountries,
        JobKind::ValidatePartners,
        JobKind::ReprocessFlaggedCountries,
        JobKind::ReprocessFlaggedPartners,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::FetchPartnerData => "fetch_partner_data",
            JobKind::ValidateCountries => "validate_countries",
            JobKind::ValidatePartners => "validate_partners",
            JobKind::ReprocessFlaggedCountries => "reprocess_flagged_countries",
            JobKind::ReprocessFlaggedPartners => "reprocess_flagged_partners",
        }
    }

    pub fn cron<'a>(self, config: &'a MonitorConfig) -> &'a str {
        match self {
            JobKind::FetchPartnerData => &config.cron_fetch,
            JobKind::ValidateCountries => &config.cron_validate_countries,
            JobKind::ValidatePartners => &config.cron_validate_partners,
            JobKind::ReprocessFlaggedCountries => &config.cron_reprocess_countries,
            JobKind::ReprocessFlaggedPartners => &config.cron_reprocess_partners,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .with_context(|| format!("unknown job `{s}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobOutcome {
    Fetch(RunSummary),
    /// The stored fetch settings did not describe a valid target.
    FetchSkipped { reason: String },
    CountryAudit(CountryAuditSummary),
    PartnerAudit(PartnerAuditSummary),
    CountryReprocess(CountryReprocessSummary),
    PartnerReprocess(PartnerReprocessSummary),
}

/// The periodic jobs, each run under error escalation.
pub struct Jobs {
    orchestrator: Arc<Orchestrator>,
    drift: DriftDetector,
    settings: Arc<dyn SettingsStore>,
    escalator: Escalator,
}

impl Jobs {
    pub fn new(
        config: &MonitorConfig,
        store: Arc<dyn MonitorStore>,
        settings: Arc<dyn SettingsStore>,
        notifier: Arc<dyn Notifier>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(config, Arc::clone(&fetcher), Arc::clone(&store)));
        let drift = DriftDetector::new(
            store,
            Arc::clone(&settings),
            orchestrator.clone(),
            fetcher,
        );
        let escalator = Escalator::new(notifier, Arc::clone(&settings));
        Self {
            orchestrator,
            drift,
            settings,
            escalator,
        }
    }

    pub async fn run(&self, kind: JobKind) -> Result<JobOutcome> {
        self.escalator.guard(kind.name(), self.run_inner(kind, None)).await
    }

    /// Run a fetch with an explicit mode instead of the stored settings.
    pub async fn run_fetch(&self, mode: FetchMode) -> Result<JobOutcome> {
        let kind = JobKind::FetchPartnerData;
        self.escalator.guard(kind.name(), self.run_inner(kind, Some(mode))).await
    }

    /// Read the stored mode under the settings lease, so a targeted reprocess
    /// in flight is waited out instead of read.
    async fn mode_from_settings(&self) -> Result<FetchMode, TargetResolutionError> {
        let _lease = self.settings.lease().await?;
        FetchMode::from_settings(self.settings.as_ref()).await
    }

    async fn run_inner(&self, kind: JobKind, mode: Option<FetchMode>) -> Result<JobOutcome> {
        info!(job = %kind, "job started");
        let outcome = match kind {
            JobKind::FetchPartnerData => {
                let mode = match mode {
                    Some(mode) => mode,
                    None => match self.mode_from_settings().await {
                        Ok(mode) => mode,
                        Err(TargetResolutionError::Settings(err)) => {
                            return Err(err).context("reading fetch settings");
                        }
                        Err(err) => {
                            error!(job = %kind, error = %err, "fetch target could not be resolved");
                            return Ok(JobOutcome::FetchSkipped {
                                reason: err.to_string(),
                            });
                        }
                    },
                };
                JobOutcome::Fetch(self.orchestrator.run(mode).await?)
            }
            JobKind::ValidateCountries => JobOutcome::CountryAudit(
                self.drift
                    .audit_countries()
                    .await
                    .context("auditing country partner counts")?,
            ),
            JobKind::ValidatePartners => JobOutcome::PartnerAudit(
                self.drift
                    .audit_partners()
                    .await
                    .context("auditing partner reference counts")?,
            ),
            JobKind::ReprocessFlaggedCountries => {
                JobOutcome::CountryReprocess(self.drift.reprocess_flagged_countries().await?)
            }
            JobKind::ReprocessFlaggedPartners => {
                JobOutcome::PartnerReprocess(self.drift.reprocess_flagged_partners().await?)
            }
        };
        info!(job = %kind, "job finished");
        Ok(outcome)
    }
}

/// Register every job on a cron scheduler. Job errors are already escalated
/// by [`Jobs::run`]; the scheduler only logs them.
pub async fn build_scheduler(jobs: Arc<Jobs>, config: &MonitorConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for kind in JobKind::ALL {
        let cron = kind.cron(config);
        let jobs = Arc::clone(&jobs);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let jobs = Arc::clone(&jobs);
            Box::pin(async move {
                if let Err(err) = jobs.run(kind).await {
                    error!(job = %kind, error = %format!("{err:#}"), "scheduled job failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job {kind} for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(job = %kind, cron, "job scheduled");
    }
    Ok(sched)
}

pub async fn maybe_build_scheduler(jobs: Arc<Jobs>, config: &MonitorConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(jobs, config).await.map(Some)
}
