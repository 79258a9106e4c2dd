use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use pmon_adapters::{find_country_link, parse_listing_page, parse_max_page, CountrySlug};
use pmon_core::PartnerRecord;
use pmon_storage::{
    CountryPatch, MonitorStore, PageFetcher, SettingsError, SettingsStore, KEY_FETCH_MODE,
    KEY_FETCH_PAGE, KEY_TARGET_COUNTRY,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::reconcile::{ReconcileSummary, Reconciler};

/// Worker pool cap for full crawls.
pub const FULL_CRAWL_WORKERS: usize = 4;
/// Hard ceiling on concurrent page workers for any mode.
pub const MAX_WORKERS: usize = 8;

/// Which slice of the directory a run scrapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FetchMode {
    All,
    First,
    Specific { page: u32 },
    SpecificCountry { country: String },
}

#[derive(Debug, Error)]
pub enum TargetResolutionError {
    #[error("unknown fetch mode `{0}`")]
    UnknownMode(String),
    #[error("fetch mode `specific` needs a page number >= 1, got `{0}`")]
    InvalidPage(String),
    #[error("fetch mode `specific_country` needs a target country")]
    MissingCountry,
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::All => "all",
            FetchMode::First => "first",
            FetchMode::Specific { .. } => "specific",
            FetchMode::SpecificCountry { .. } => "specific_country",
        }
    }

    /// Build a mode from raw settings values. An unset mode means `all` and an
    /// unset page means page 1.
    pub fn from_parts(
        mode: Option<&str>,
        page: Option<&str>,
        country: Option<&str>,
    ) -> Result<Self, TargetResolutionError> {
        match mode.map(str::trim).unwrap_or("all") {
            "all" => Ok(FetchMode::All),
            "first" => Ok(FetchMode::First),
            "specific" => {
                let page = match page.map(str::trim) {
                    None => 1,
                    Some(raw) => raw
                        .parse::<u32>()
                        .ok()
                        .filter(|p| *p >= 1)
                        .ok_or_else(|| TargetResolutionError::InvalidPage(raw.to_string()))?,
                };
                Ok(FetchMode::Specific { page })
            }
            "specific_country" => {
                let country = country
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or(TargetResolutionError::MissingCountry)?;
                Ok(FetchMode::SpecificCountry {
                    country: country.to_string(),
                })
            }
            other => Err(TargetResolutionError::UnknownMode(other.to_string())),
        }
    }

    pub async fn from_settings(settings: &dyn SettingsStore) -> Result<Self, TargetResolutionError> {
        let mode = settings.get(KEY_FETCH_MODE).await?;
        let page = settings.get(KEY_FETCH_PAGE).await?;
        let country = settings.get(KEY_TARGET_COUNTRY).await?;
        Self::from_parts(mode.as_deref(), page.as_deref(), country.as_deref())
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchMode::Specific { page } => write!(f, "specific(page {page})"),
            FetchMode::SpecificCountry { country } => write!(f, "specific_country({country})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    pub base_url: String,
    pub pages: Vec<u32>,
}

/// Page 1 is the base URL itself; later pages extend it.
pub fn page_url(base_url: &str, page: u32) -> String {
    if page <= 1 {
        base_url.to_string()
    } else if base_url.contains('?') {
        format!("{base_url}&page={page}")
    } else {
        format!("{}/page/{page}", base_url.trim_end_matches('/'))
    }
}

pub fn pool_size(mode: &FetchMode, page_count: usize) -> usize {
    let cap = match mode {
        FetchMode::All => FULL_CRAWL_WORKERS,
        _ => MAX_WORKERS,
    };
    page_count.min(cap).clamp(1, MAX_WORKERS)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub mode: FetchMode,
    pub pages_requested: usize,
    pub records_scraped: usize,
    pub reconcile: ReconcileSummary,
}

/// Anything that can execute a scrape run for a mode.
#[async_trait]
pub trait ScrapeRunner: Send + Sync {
    async fn run(&self, mode: FetchMode) -> anyhow::Result<RunSummary>;
}

pub struct Orchestrator {
    listing_url: String,
    config: MonitorConfig,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn MonitorStore>,
    reconciler: Reconciler,
    run_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: &MonitorConfig, fetcher: Arc<dyn PageFetcher>, store: Arc<dyn MonitorStore>) -> Self {
        Self {
            listing_url: config.listing_url(),
            config: config.clone(),
            fetcher,
            reconciler: Reconciler::new(Arc::clone(&store)),
            store,
            run_lock: Mutex::new(()),
        }
    }

    /// Work out which URL and page numbers a mode covers. Never fails: an
    /// unresolvable target is an empty page list.
    pub async fn resolve_targets(&self, mode: &FetchMode) -> Targets {
        let base_url = self.listing_url.clone();
        match mode {
            FetchMode::All => {
                let max = self.max_page(&base_url).await;
                Targets {
                    base_url,
                    pages: (1..=max).collect(),
                }
            }
            FetchMode::First => Targets {
                base_url,
                pages: vec![1],
            },
            FetchMode::Specific { page } => Targets {
                base_url,
                pages: vec![*page],
            },
            FetchMode::SpecificCountry { country } => {
                let Some(slug) = self.resolve_country_slug(country).await else {
                    error!(country = %country, "no country link found; nothing to fetch");
                    return Targets {
                        base_url,
                        pages: Vec::new(),
                    };
                };
                let country_url = self.config.country_url(&slug.slug, &slug.external_id);
                let max = self.max_page(&country_url).await;
                Targets {
                    base_url: country_url,
                    pages: (1..=max).collect(),
                }
            }
        }
    }

    pub async fn run(&self, mode: FetchMode) -> anyhow::Result<RunSummary> {
        let _guard = self.run_lock.lock().await;

        let targets = self.resolve_targets(&mode).await;
        if targets.pages.is_empty() {
            warn!(%mode, "no pages to fetch");
            return Ok(RunSummary {
                mode,
                pages_requested: 0,
                records_scraped: 0,
                reconcile: ReconcileSummary::default(),
            });
        }

        let urls: Vec<String> = targets.pages.iter().map(|p| page_url(&targets.base_url, *p)).collect();
        let workers = pool_size(&mode, urls.len());
        info!(%mode, pages = urls.len(), workers, "fetching listing pages");

        let records = self.scrape_pages(urls, workers).await;
        let records_scraped = records.len();
        info!(%mode, records = records_scraped, "scraped partner records");

        let reconcile = self
            .reconciler
            .upsert(records)
            .await
            .with_context(|| format!("reconciling {mode} run"))?;

        Ok(RunSummary {
            mode,
            pages_requested: targets.pages.len(),
            records_scraped,
            reconcile,
        })
    }

    async fn scrape_pages(&self, urls: Vec<String>, workers: usize) -> Vec<PartnerRecord> {
        let fetcher = Arc::clone(&self.fetcher);
        let mut results = stream::iter(urls)
            .map(move |url| {
                let fetcher = Arc::clone(&fetcher);
                tokio::spawn(async move { scrape_page(fetcher.as_ref(), &url).await })
            })
            .buffer_unordered(workers);

        let mut records = Vec::new();
        while let Some(outcome) = results.next().await {
            match outcome {
                Ok(page) => records.extend(page),
                Err(join_err) => warn!(error = %join_err, "page worker failed"),
            }
        }
        records
    }

    async fn max_page(&self, url: &str) -> u32 {
        match self.fetcher.fetch_html(url).await {
            Some(html) => parse_max_page(&html),
            None => {
                warn!(url, "pagination page unavailable; assuming one page");
                1
            }
        }
    }

    async fn resolve_country_slug(&self, country: &str) -> Option<CountrySlug> {
        let html = self.fetcher.fetch_html(&self.listing_url).await?;
        let slug = find_country_link(&html, country)?;

        match self.store.find_country_by_name(country).await {
            Ok(Some(stored))
                if stored.slug.as_deref() != Some(slug.slug.as_str())
                    || stored.external_id.as_deref() != Some(slug.external_id.as_str()) =>
            {
                let patch = CountryPatch {
                    slug: Some(slug.slug.clone()),
                    external_id: Some(slug.external_id.clone()),
                    ..Default::default()
                };
                if let Err(err) = self.store.update_country(stored.id, &patch).await {
                    warn!(country, error = %err, "could not record country slug");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(country, error = %err, "could not look up country"),
        }
        Some(slug)
    }
}

#[async_trait]
impl ScrapeRunner for Orchestrator {
    async fn run(&self, mode: FetchMode) -> anyhow::Result<RunSummary> {
        Orchestrator::run(self, mode).await
    }
}

async fn scrape_page(fetcher: &dyn PageFetcher, url: &str) -> Vec<PartnerRecord> {
    let Some(html) = fetcher.fetch_html(url).await else {
        return Vec::new();
    };
    match parse_listing_page(&html, url) {
        Ok(page) => page.records,
        Err(err) => {
            warn!(url, error = %err, "listing page could not be parsed");
            Vec::new()
        }
    }
}
