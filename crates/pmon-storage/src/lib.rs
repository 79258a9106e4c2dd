//! Persistence, settings, operator inbox and HTTP fetch utilities for the
//! partner monitor.

mod fetch;
mod memory;
mod notify;
mod postgres;
mod settings;
mod store;

pub const CRATE_NAME: &str = "pmon-storage";

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, JitterPolicy, PageFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use notify::{LogNotifier, Notifier, NotifyError};
pub use postgres::{connect, run_migrations, PgNotifier, PgSettings, PgStore};
pub use settings::{
    MemorySettings, SettingsError, SettingsLease, SettingsStore, KEY_ERROR_RECIPIENT, KEY_FETCH_MODE,
    KEY_FETCH_PAGE, KEY_TARGET_COUNTRY,
};
pub use store::{CountryPatch, MonitorStore, PartnerFilter, StoreError};
