//! Drift audits and targeted reprocessing.
//!
//! Audits compare stored aggregates with what the store actually holds and
//! raise `to_reprocess` flags; the reprocess passes re-scrape only the flagged
//! countries or partners and clear their flags on success.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures::FutureExt;
use pmon_adapters::parse_profile;
use pmon_core::{Country, Partner};
use pmon_storage::{
    CountryPatch, MonitorStore, PageFetcher, PartnerFilter, SettingsStore, StoreError,
    KEY_FETCH_MODE, KEY_TARGET_COUNTRY,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::orchestrator::{FetchMode, RunSummary, ScrapeRunner};
use crate::reconcile::Reconciler;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountryAuditSummary {
    pub checked: usize,
    pub flagged: usize,
    pub cleared: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartnerAuditSummary {
    pub checked: usize,
    pub flagged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountryReprocessSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartnerReprocessSummary {
    pub attempted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_no_url: usize,
    pub empty: usize,
    pub failed: usize,
}

pub struct DriftDetector {
    store: Arc<dyn MonitorStore>,
    settings: Arc<dyn SettingsStore>,
    runner: Arc<dyn ScrapeRunner>,
    fetcher: Arc<dyn PageFetcher>,
    reconciler: Reconciler,
}

impl DriftDetector {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        settings: Arc<dyn SettingsStore>,
        runner: Arc<dyn ScrapeRunner>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&store)),
            store,
            settings,
            runner,
            fetcher,
        }
    }

    /// Recount partners per country. A mismatch overwrites the stored total
    /// and flags the country; a match clears any earlier flag.
    pub async fn audit_countries(&self) -> Result<CountryAuditSummary, StoreError> {
        let mut summary = CountryAuditSummary::default();

        for country in self.store.list_countries(None).await? {
            summary.checked += 1;
            let filter = PartnerFilter {
                country_id: Some(country.id),
                ..Default::default()
            };
            let actual = self.store.count_partners(&filter).await?;

            if actual != country.total_partner_count {
                let patch = CountryPatch {
                    total_partner_count: Some(actual),
                    to_reprocess: Some(true),
                    ..Default::default()
                };
                self.store.update_country(country.id, &patch).await?;
                summary.flagged += 1;
                info!(
                    country = %country.name,
                    stored = country.total_partner_count,
                    actual,
                    "country flagged for reprocess"
                );
            } else if country.to_reprocess {
                let patch = CountryPatch {
                    to_reprocess: Some(false),
                    ..Default::default()
                };
                self.store.update_country(country.id, &patch).await?;
                summary.cleared += 1;
            }
        }
        Ok(summary)
    }

    /// Flag partners whose active reference history disagrees with their
    /// stored reference count. Counts are left untouched.
    pub async fn audit_partners(&self) -> Result<PartnerAuditSummary, StoreError> {
        let mut summary = PartnerAuditSummary::default();

        for partner in self.store.list_partners(&PartnerFilter::default()).await? {
            summary.checked += 1;
            let active = self.store.count_active_references(partner.id).await?;
            if active != partner.total_references {
                self.store.set_partner_reprocess(partner.id, true).await?;
                summary.flagged += 1;
                info!(
                    partner = %partner.name,
                    stored = partner.total_references,
                    active,
                    "partner flagged for reprocess"
                );
            }
        }
        Ok(summary)
    }

    /// Run a country-scoped scrape for each flagged country. Failed countries
    /// keep their flag and are reported together once every country was tried.
    pub async fn reprocess_flagged_countries(&self) -> anyhow::Result<CountryReprocessSummary> {
        let flagged = self
            .store
            .list_countries(Some(true))
            .await
            .context("listing flagged countries")?;
        let mut summary = CountryReprocessSummary::default();
        if flagged.is_empty() {
            info!("no countries flagged for reprocessing");
            return Ok(summary);
        }

        for country in flagged {
            summary.attempted += 1;
            match self.reprocess_country(&country).await {
                Ok(run) => {
                    summary.succeeded += 1;
                    info!(
                        country = %country.name,
                        records = run.records_scraped,
                        "country reprocessed"
                    );
                }
                Err(err) => {
                    error!(country = %country.name, error = %format!("{err:#}"), "country reprocess failed");
                    summary.failed.push(country.name.clone());
                }
            }
        }

        if !summary.failed.is_empty() {
            return Err(anyhow!(
                "{} of {} flagged countries failed to reprocess: {}",
                summary.failed.len(),
                summary.attempted,
                summary.failed.join(", ")
            ));
        }
        Ok(summary)
    }

    /// Holds the settings lease from the override until the restore. No other
    /// lease holder observes or saves the temporary target.
    async fn reprocess_country(&self, country: &Country) -> anyhow::Result<RunSummary> {
        let lease = self
            .settings
            .lease()
            .await
            .context("waiting for the fetch settings lease")?;
        let overrides = [
            (KEY_FETCH_MODE, "specific_country"),
            (KEY_TARGET_COUNTRY, country.name.as_str()),
        ];
        let saved = self.override_settings(&overrides).await;

        let outcome = match saved {
            Ok(_) => {
                let mode = FetchMode::SpecificCountry {
                    country: country.name.clone(),
                };
                match AssertUnwindSafe(self.runner.run(mode)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(anyhow!("scrape run panicked: {}", panic_message(&*panic))),
                }
            }
            Err(ref err) => Err(anyhow!("could not set temporary fetch settings: {err:#}")),
        };

        // A failed override has already rolled itself back.
        let restored = match saved {
            Ok(previous) => self.restore_settings(previous).await,
            Err(_) => Ok(()),
        };
        drop(lease);

        let run = outcome?;
        restored?;

        let patch = CountryPatch {
            to_reprocess: Some(false),
            ..Default::default()
        };
        self.store
            .update_country(country.id, &patch)
            .await
            .with_context(|| format!("clearing reprocess flag on {}", country.name))?;
        Ok(run)
    }

    /// Write the overrides and return each key's previous value. On a partial
    /// failure the keys already written are rolled back before returning.
    async fn override_settings(
        &self,
        overrides: &[(&'static str, &str)],
    ) -> anyhow::Result<Vec<(&'static str, Option<String>)>> {
        let mut previous = Vec::with_capacity(overrides.len());
        for (key, _) in overrides {
            let value = self
                .settings
                .get(key)
                .await
                .with_context(|| format!("reading setting {key}"))?;
            previous.push((*key, value));
        }

        for (index, (key, value)) in overrides.iter().enumerate() {
            if let Err(err) = self.settings.set(key, value).await {
                let written = previous[..index].to_vec();
                if let Err(restore_err) = self.restore_settings(written).await {
                    warn!(error = %format!("{restore_err:#}"), "rollback of temporary settings failed");
                }
                return Err(err).with_context(|| format!("writing setting {key}"));
            }
        }
        Ok(previous)
    }

    /// Put every key back to its saved value, or remove it when there was
    /// none. Attempts all keys before reporting the first failure.
    async fn restore_settings(&self, saved: Vec<(&'static str, Option<String>)>) -> anyhow::Result<()> {
        let mut first_err = None;
        for (key, value) in saved {
            let result = match &value {
                Some(v) => self.settings.set(key, v).await,
                None => self.settings.unset(key).await,
            };
            if let Err(err) = result {
                warn!(key, error = %err, "could not restore setting");
                first_err.get_or_insert(anyhow::Error::new(err).context(format!("restoring setting {key}")));
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Re-fetch the profile page of each flagged partner and apply it through
    /// the reconciler. Partners without a profile URL, or whose page comes back
    /// empty, keep their flag.
    pub async fn reprocess_flagged_partners(&self) -> anyhow::Result<PartnerReprocessSummary> {
        let flagged = self
            .store
            .list_partners(&PartnerFilter::flagged())
            .await
            .context("listing flagged partners")?;
        let mut summary = PartnerReprocessSummary::default();
        if flagged.is_empty() {
            info!("no partners flagged for reprocessing");
            return Ok(summary);
        }
        info!(count = flagged.len(), "reprocessing flagged partners");

        for partner in flagged {
            summary.attempted += 1;
            let Some(url) = partner.profile_url.clone().filter(|u| !u.trim().is_empty()) else {
                warn!(partner = %partner.name, "partner has no profile url; skipping");
                summary.skipped_no_url += 1;
                continue;
            };

            match self.reprocess_partner(&partner, &url).await {
                Ok(PartnerOutcome::Updated) => summary.updated += 1,
                Ok(PartnerOutcome::Unchanged) => summary.unchanged += 1,
                Ok(PartnerOutcome::Empty) => summary.empty += 1,
                Err(err) => {
                    error!(partner = %partner.name, error = %format!("{err:#}"), "partner reprocess failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn reprocess_partner(&self, partner: &Partner, url: &str) -> anyhow::Result<PartnerOutcome> {
        let Some(html) = self.fetcher.fetch_html(url).await else {
            error!(partner = %partner.name, url, "empty result for profile page");
            return Ok(PartnerOutcome::Empty);
        };
        let Some(record) = parse_profile(&html, url) else {
            error!(partner = %partner.name, url, "profile page yielded no record");
            return Ok(PartnerOutcome::Empty);
        };

        let updated = self
            .reconciler
            .update_partner(partner, record)
            .await
            .with_context(|| format!("updating partner {}", partner.name))?;
        self.store
            .set_partner_reprocess(partner.id, false)
            .await
            .with_context(|| format!("clearing reprocess flag on {}", partner.name))?;
        info!(partner = %partner.name, "partner reprocessed");

        Ok(if updated.is_some() {
            PartnerOutcome::Updated
        } else {
            PartnerOutcome::Unchanged
        })
    }
}

enum PartnerOutcome {
    Updated,
    Unchanged,
    Empty,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
