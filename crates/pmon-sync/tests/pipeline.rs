use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use pmon_core::{PartnerRecord, PartnerStatus};
use pmon_storage::{
    CountryPatch, MemorySettings, MemoryStore, MonitorStore, PageFetcher, PartnerFilter,
    SettingsError, SettingsLease, SettingsStore, KEY_FETCH_MODE, KEY_TARGET_COUNTRY,
};
use pmon_sync::{
    DriftDetector, FetchMode, JobKind, JobOutcome, Jobs, MonitorConfig, Orchestrator,
    ReconcileSummary, Reconciler, RunSummary, ScrapeRunner,
};

const LISTING: &str = "https://www.odoo.com/partners?country_all=1";

fn fixture(rel: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(rel);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn card(name: &str, country: &str, refs: i64) -> String {
    let slug = name.to_lowercase().replace(' ', "-");
    format!(
        r#"<a class="text-decoration-none row p-2 text-black" href="/partners/{slug}-1">
             <h5><span>{name}</span></h5>
             <div id="o_wcrm_partners_address"><span>{country}</span></div>
             <div class="col-md-3 stat_ref"><div>{refs} references</div></div>
           </a>"#
    )
}

fn page(cards: &[String], max_page: u32) -> String {
    let links: String = (1..=max_page).map(|p| format!("<li><a>{p}</a></li>")).collect();
    format!(
        "<html><body>{}<ul class=\"pagination\">{links}</ul></body></html>",
        cards.join("\n")
    )
}

/// Serves canned HTML by URL and records every request.
#[derive(Default)]
struct FixtureFetcher {
    pages: HashMap<String, String>,
    requests: StdMutex<Vec<String>>,
}

impl FixtureFetcher {
    fn with(mut self, url: &str, html: String) -> Self {
        self.pages.insert(url.to_string(), html);
        self
    }

    fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn fetch_html(&self, url: &str) -> Option<String> {
        self.requests.lock().unwrap().push(url.to_string());
        self.pages.get(url).cloned()
    }
}

fn orchestrator(fetcher: Arc<FixtureFetcher>, store: Arc<MemoryStore>) -> Orchestrator {
    Orchestrator::new(&MonitorConfig::default(), fetcher, store)
}

fn record(name: &str, country: &str) -> PartnerRecord {
    PartnerRecord {
        name: name.to_string(),
        profile_url: format!("https://www.odoo.com/partners/{}", name.to_lowercase()),
        status: PartnerStatus::Ready,
        country_name: country.to_string(),
        retention_rate: 0.0,
        total_references: 0,
        largest_project_size: 0,
        average_project_size: 0.0,
    }
}

#[tokio::test]
async fn specific_page_targets_exactly_that_page() {
    let fetcher = Arc::new(FixtureFetcher::default());
    let orch = orchestrator(fetcher.clone(), Arc::new(MemoryStore::new()));

    let targets = orch.resolve_targets(&FetchMode::Specific { page: 7 }).await;
    assert_eq!(targets.base_url, LISTING);
    assert_eq!(targets.pages, vec![7]);
    assert!(fetcher.requested().is_empty());
}

#[tokio::test]
async fn unresolvable_country_is_an_empty_no_op_run() {
    let fetcher = Arc::new(FixtureFetcher::default().with(LISTING, fixture("listing/partners_page_1.html")));
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(fetcher.clone(), store.clone());

    let mode = FetchMode::SpecificCountry {
        country: "Atlantis".into(),
    };
    let targets = orch.resolve_targets(&mode).await;
    assert!(targets.pages.is_empty());

    let summary = orch.run(mode).await.unwrap();
    assert_eq!(summary.pages_requested, 0);
    assert_eq!(summary.reconcile, ReconcileSummary::default());
    assert!(store.list_partners(&PartnerFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn country_run_uses_resolved_slug_and_records_it() {
    let country_url = "https://www.odoo.com/partners/country/belgium-20";
    let fetcher = Arc::new(
        FixtureFetcher::default()
            .with(LISTING, fixture("listing/partners_page_1.html"))
            .with(country_url, page(&[card("Acme Consulting", "Belgium", 17)], 2))
            .with(
                &format!("{country_url}/page/2"),
                page(&[card("Brussels Cloud", "Belgium", 3)], 2),
            ),
    );
    let store = Arc::new(MemoryStore::new());
    store.create_country("Belgium").await.unwrap();
    let orch = orchestrator(fetcher.clone(), store.clone());

    let mode = FetchMode::SpecificCountry {
        country: "Belgium".into(),
    };
    let summary = orch.run(mode).await.unwrap();
    assert_eq!(summary.pages_requested, 2);
    assert_eq!(summary.records_scraped, 2);
    assert_eq!(summary.reconcile.created, 2);

    let belgium = store.find_country_by_name("Belgium").await.unwrap().unwrap();
    assert_eq!(belgium.slug.as_deref(), Some("belgium"));
    assert_eq!(belgium.external_id.as_deref(), Some("20"));
    assert!(fetcher.requested().iter().any(|u| u == &format!("{country_url}/page/2")));
}

#[tokio::test]
async fn first_page_run_skips_the_malformed_card() {
    let fetcher = Arc::new(FixtureFetcher::default().with(LISTING, fixture("listing/partners_page_1.html")));
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(fetcher, store.clone());

    let summary = orch.run(FetchMode::First).await.unwrap();
    assert_eq!(summary.records_scraped, 4);
    assert_eq!(summary.reconcile.created, 4);
    // Belgium, France and the "Unknown" bucket.
    assert_eq!(summary.reconcile.countries_created, 3);
    assert!(store.find_country_by_name("Unknown").await.unwrap().is_some());
}

#[tokio::test]
async fn full_crawl_collects_every_page_even_when_one_is_missing() {
    let fetcher = Arc::new(
        FixtureFetcher::default()
            .with(LISTING, fixture("listing/partners_page_1.html"))
            .with(
                &format!("{LISTING}&page=2"),
                page(&[card("Echo Systems", "France", 1), card("Fjord IT", "Norway", 2)], 3),
            ),
    );
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(fetcher.clone(), store.clone());

    let summary = orch.run(FetchMode::All).await.unwrap();
    assert_eq!(summary.pages_requested, 3);
    assert_eq!(summary.records_scraped, 6);
    assert_eq!(store.list_partners(&PartnerFilter::default()).await.unwrap().len(), 6);
    assert!(fetcher.requested().contains(&format!("{LISTING}&page=3")));
}

#[tokio::test]
async fn rerunning_an_unchanged_page_adds_no_history() {
    let fetcher = Arc::new(FixtureFetcher::default().with(LISTING, fixture("listing/partners_page_1.html")));
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(fetcher, store.clone());

    orch.run(FetchMode::First).await.unwrap();
    let before = store.history_counts().await;
    let second = orch.run(FetchMode::First).await.unwrap();

    assert_eq!(second.reconcile.unchanged, 4);
    assert_eq!(store.history_counts().await, before);
}

struct NoopRunner;

#[async_trait]
impl ScrapeRunner for NoopRunner {
    async fn run(&self, mode: FetchMode) -> anyhow::Result<RunSummary> {
        Ok(RunSummary {
            mode,
            pages_requested: 1,
            records_scraped: 0,
            reconcile: ReconcileSummary::default(),
        })
    }
}

fn detector(
    store: Arc<MemoryStore>,
    settings: Arc<MemorySettings>,
    runner: Arc<dyn ScrapeRunner>,
    fetcher: Arc<FixtureFetcher>,
) -> DriftDetector {
    DriftDetector::new(store, settings, runner, fetcher)
}

#[tokio::test]
async fn country_audit_overwrites_total_then_clears_flag() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone());
    let batch = ["A", "B", "C", "D", "E"].map(|n| record(n, "Belgium")).to_vec();
    reconciler.upsert(batch).await.unwrap();

    let belgium = store.find_country_by_name("Belgium").await.unwrap().unwrap();
    let patch = CountryPatch {
        total_partner_count: Some(3),
        ..Default::default()
    };
    store.update_country(belgium.id, &patch).await.unwrap();

    let drift = detector(
        store.clone(),
        Arc::new(MemorySettings::new()),
        Arc::new(NoopRunner),
        Arc::new(FixtureFetcher::default()),
    );
    let first = drift.audit_countries().await.unwrap();
    assert_eq!(first.flagged, 1);
    let belgium = store.find_country_by_name("Belgium").await.unwrap().unwrap();
    assert_eq!(belgium.total_partner_count, 5);
    assert!(belgium.to_reprocess);

    let second = drift.audit_countries().await.unwrap();
    assert_eq!(second.flagged, 0);
    assert_eq!(second.cleared, 1);
    assert!(!store.find_country_by_name("Belgium").await.unwrap().unwrap().to_reprocess);
}

#[tokio::test]
async fn partner_audit_flags_reference_mismatch_only() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone());
    let mut consistent = record("Consistent", "Belgium");
    consistent.total_references = 0;
    let mut drifted = record("Drifted", "Belgium");
    drifted.total_references = 4;
    reconciler.upsert(vec![consistent, drifted]).await.unwrap();

    let drifted = store.partners_by_names(&["Drifted".to_string()]).await.unwrap().remove(0);
    store.seed_reference_history(drifted.id, 4, true).await;

    let drift = detector(
        store.clone(),
        Arc::new(MemorySettings::new()),
        Arc::new(NoopRunner),
        Arc::new(FixtureFetcher::default()),
    );
    let summary = drift.audit_partners().await.unwrap();
    assert_eq!(summary.checked, 2);
    assert_eq!(summary.flagged, 1);

    let flagged = store.list_partners(&PartnerFilter::flagged()).await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].name, "Drifted");
    assert_eq!(flagged[0].total_references, 4);
}

/// Fails or panics for chosen countries and snapshots the settings it sees.
struct ScriptedRunner {
    settings: Arc<MemorySettings>,
    fail: Vec<String>,
    panic: Vec<String>,
    seen: tokio::sync::Mutex<Vec<HashMap<String, String>>>,
}

#[async_trait]
impl ScrapeRunner for ScriptedRunner {
    async fn run(&self, mode: FetchMode) -> anyhow::Result<RunSummary> {
        self.seen.lock().await.push(self.settings.snapshot().await);
        let FetchMode::SpecificCountry { country } = &mode else {
            anyhow::bail!("unexpected mode {mode}");
        };
        if self.panic.contains(country) {
            panic!("upstream exploded for {country}");
        }
        if self.fail.contains(country) {
            anyhow::bail!("fetch failed for {country}");
        }
        Ok(RunSummary {
            mode,
            pages_requested: 1,
            records_scraped: 0,
            reconcile: ReconcileSummary::default(),
        })
    }
}

async fn flag_country(store: &MemoryStore, name: &str) -> i64 {
    let country = store.create_country(name).await.unwrap();
    let patch = CountryPatch {
        to_reprocess: Some(true),
        ..Default::default()
    };
    store.update_country(country.id, &patch).await.unwrap();
    country.id
}

#[tokio::test]
async fn country_reprocess_restores_settings_after_failure_and_panic() {
    let store = Arc::new(MemoryStore::new());
    flag_country(&store, "Atlantis").await;
    flag_country(&store, "Belgium").await;
    flag_country(&store, "Lemuria").await;

    let settings = Arc::new(MemorySettings::with_values([(KEY_FETCH_MODE, "first")]));
    let runner = Arc::new(ScriptedRunner {
        settings: settings.clone(),
        fail: vec!["Atlantis".into()],
        panic: vec!["Lemuria".into()],
        seen: Default::default(),
    });
    let drift = detector(store.clone(), settings.clone(), runner.clone(), Arc::new(FixtureFetcher::default()));

    let err = drift.reprocess_flagged_countries().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Atlantis"));
    assert!(message.contains("Lemuria"));

    // Every run saw its own temporary target.
    let seen = runner.seen.lock().await;
    assert_eq!(seen.len(), 3);
    for snapshot in seen.iter() {
        assert_eq!(snapshot.get(KEY_FETCH_MODE).map(String::as_str), Some("specific_country"));
        assert!(snapshot.contains_key(KEY_TARGET_COUNTRY));
    }

    // Previous values are back and the temporary country key is gone.
    let after = settings.snapshot().await;
    assert_eq!(after.get(KEY_FETCH_MODE).map(String::as_str), Some("first"));
    assert!(!after.contains_key(KEY_TARGET_COUNTRY));

    let still_flagged: Vec<String> = store
        .list_countries(Some(true))
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(still_flagged, vec!["Atlantis".to_string(), "Lemuria".to_string()]);
}

/// Takes a while, like a real scrape, and records the settings it ran under.
struct SlowRunner {
    settings: Arc<MemorySettings>,
    seen: tokio::sync::Mutex<Vec<HashMap<String, String>>>,
}

#[async_trait]
impl ScrapeRunner for SlowRunner {
    async fn run(&self, mode: FetchMode) -> anyhow::Result<RunSummary> {
        self.seen.lock().await.push(self.settings.snapshot().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(RunSummary {
            mode,
            pages_requested: 1,
            records_scraped: 0,
            reconcile: ReconcileSummary::default(),
        })
    }
}

#[tokio::test]
async fn overlapping_country_reprocesses_restore_original_settings() {
    let store = Arc::new(MemoryStore::new());
    flag_country(&store, "Belgium").await;

    let settings = Arc::new(MemorySettings::with_values([(KEY_FETCH_MODE, "all")]));
    let runner = Arc::new(SlowRunner {
        settings: settings.clone(),
        seen: Default::default(),
    });
    let drift = detector(store.clone(), settings.clone(), runner.clone(), Arc::new(FixtureFetcher::default()));

    let (a, b) = tokio::join!(drift.reprocess_flagged_countries(), drift.reprocess_flagged_countries());
    assert_eq!(a.unwrap().succeeded, 1);
    assert_eq!(b.unwrap().succeeded, 1);

    // Each run saw its own override, never one left behind by the other.
    let seen = runner.seen.lock().await;
    assert_eq!(seen.len(), 2);
    for snapshot in seen.iter() {
        assert_eq!(snapshot.get(KEY_FETCH_MODE).map(String::as_str), Some("specific_country"));
        assert_eq!(snapshot.get(KEY_TARGET_COUNTRY).map(String::as_str), Some("Belgium"));
    }

    let after = settings.snapshot().await;
    assert_eq!(after.get(KEY_FETCH_MODE).map(String::as_str), Some("all"));
    assert!(!after.contains_key(KEY_TARGET_COUNTRY));
}

/// Reads from memory but refuses every write.
struct ReadOnlySettings(MemorySettings);

#[async_trait]
impl SettingsStore for ReadOnlySettings {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        self.0.get(key).await
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), SettingsError> {
        Err(SettingsError::Database(sqlx::Error::PoolClosed))
    }

    async fn unset(&self, _key: &str) -> Result<(), SettingsError> {
        Err(SettingsError::Database(sqlx::Error::PoolClosed))
    }

    async fn lease(&self) -> Result<SettingsLease, SettingsError> {
        self.0.lease().await
    }
}

#[tokio::test]
async fn failed_override_leaves_operator_settings_alone() {
    let store = Arc::new(MemoryStore::new());
    flag_country(&store, "Belgium").await;

    let settings = Arc::new(ReadOnlySettings(MemorySettings::with_values([
        (KEY_FETCH_MODE, "first"),
        (KEY_TARGET_COUNTRY, "France"),
    ])));
    let drift = DriftDetector::new(
        store.clone(),
        settings.clone(),
        Arc::new(NoopRunner),
        Arc::new(FixtureFetcher::default()),
    );

    let err = drift.reprocess_flagged_countries().await.unwrap_err();
    assert!(err.to_string().contains("Belgium"));

    let after = settings.0.snapshot().await;
    assert_eq!(after.get(KEY_FETCH_MODE).map(String::as_str), Some("first"));
    assert_eq!(after.get(KEY_TARGET_COUNTRY).map(String::as_str), Some("France"));
    assert!(store.find_country_by_name("Belgium").await.unwrap().unwrap().to_reprocess);
}

#[tokio::test]
async fn fetch_job_waits_out_a_temporary_override() {
    let store = Arc::new(MemoryStore::new());
    let settings = Arc::new(MemorySettings::with_values([(KEY_FETCH_MODE, "first")]));
    let fetcher = Arc::new(FixtureFetcher::default().with(LISTING, fixture("listing/partners_page_1.html")));
    let jobs = Arc::new(Jobs::new(
        &MonitorConfig::default(),
        store,
        settings.clone(),
        Arc::new(pmon_storage::LogNotifier),
        fetcher,
    ));

    let lease = settings.lease().await.unwrap();
    settings.set(KEY_FETCH_MODE, "specific_country").await.unwrap();
    settings.set(KEY_TARGET_COUNTRY, "Belgium").await.unwrap();

    let job = tokio::spawn({
        let jobs = jobs.clone();
        async move { jobs.run(JobKind::FetchPartnerData).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!job.is_finished());

    settings.set(KEY_FETCH_MODE, "first").await.unwrap();
    settings.unset(KEY_TARGET_COUNTRY).await.unwrap();
    drop(lease);

    match job.await.unwrap().unwrap() {
        JobOutcome::Fetch(summary) => assert_eq!(summary.mode, FetchMode::First),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn partner_reprocess_applies_profile_and_skips_missing_urls() {
    let profile_url = "https://www.odoo.com/partners/acme-consulting-42";
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone());

    let mut acme = record("Acme Consulting", "Belgium");
    acme.profile_url = profile_url.to_string();
    let mut ghost = record("Ghost", "Belgium");
    ghost.profile_url = String::new();
    let mut gone = record("Gone", "Belgium");
    gone.profile_url = "https://www.odoo.com/partners/gone-1".to_string();
    reconciler.upsert(vec![acme, ghost, gone]).await.unwrap();
    for partner in store.list_partners(&PartnerFilter::default()).await.unwrap() {
        store.set_partner_reprocess(partner.id, true).await.unwrap();
    }

    let fetcher = Arc::new(FixtureFetcher::default().with(profile_url, fixture("profile/acme_consulting.html")));
    let drift = detector(store.clone(), Arc::new(MemorySettings::new()), Arc::new(NoopRunner), fetcher);

    let summary = drift.reprocess_flagged_partners().await.unwrap();
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.skipped_no_url, 1);
    assert_eq!(summary.empty, 1);

    let acme = store.partners_by_names(&["Acme Consulting".to_string()]).await.unwrap().remove(0);
    assert!(!acme.to_reprocess);
    assert_eq!(acme.status, PartnerStatus::Silver);
    assert_eq!(acme.total_references, 21);
    assert_eq!(store.reference_history(acme.id).await.unwrap().len(), 1);

    let flagged: Vec<String> = store
        .list_partners(&PartnerFilter::flagged())
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(flagged.len(), 2);
    assert!(flagged.contains(&"Ghost".to_string()));
    assert!(flagged.contains(&"Gone".to_string()));
}

#[tokio::test]
async fn fetch_job_with_bad_settings_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let settings = Arc::new(MemorySettings::with_values([(KEY_FETCH_MODE, "specific_c")]));
    let fetcher = Arc::new(FixtureFetcher::default());
    let jobs = Jobs::new(
        &MonitorConfig::default(),
        store,
        settings,
        Arc::new(pmon_storage::LogNotifier),
        fetcher.clone(),
    );

    let outcome = jobs.run(JobKind::FetchPartnerData).await.unwrap();
    assert!(matches!(outcome, JobOutcome::FetchSkipped { .. }));
    assert!(fetcher.requested().is_empty());
}

#[tokio::test]
async fn fetch_job_reads_mode_from_settings() {
    let store = Arc::new(MemoryStore::new());
    let settings = Arc::new(MemorySettings::with_values([(KEY_FETCH_MODE, "first")]));
    let fetcher = Arc::new(FixtureFetcher::default().with(LISTING, fixture("listing/partners_page_1.html")));
    let jobs = Jobs::new(
        &MonitorConfig::default(),
        store.clone(),
        settings,
        Arc::new(pmon_storage::LogNotifier),
        fetcher,
    );

    match jobs.run(JobKind::FetchPartnerData).await.unwrap() {
        JobOutcome::Fetch(summary) => {
            assert_eq!(summary.mode, FetchMode::First);
            assert_eq!(summary.reconcile.created, 4);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(store.count_partners(&PartnerFilter::default()).await.unwrap(), 4);
}

#[tokio::test]
async fn specific_mode_without_a_page_fetches_page_one() {
    let store = Arc::new(MemoryStore::new());
    let settings = Arc::new(MemorySettings::with_values([(KEY_FETCH_MODE, "specific")]));
    let fetcher = Arc::new(FixtureFetcher::default().with(LISTING, fixture("listing/partners_page_1.html")));
    let jobs = Jobs::new(
        &MonitorConfig::default(),
        store,
        settings,
        Arc::new(pmon_storage::LogNotifier),
        fetcher.clone(),
    );

    match jobs.run(JobKind::FetchPartnerData).await.unwrap() {
        JobOutcome::Fetch(summary) => {
            assert_eq!(summary.mode, FetchMode::Specific { page: 1 });
            assert_eq!(summary.records_scraped, 4);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(fetcher.requested(), vec![LISTING.to_string()]);
}
