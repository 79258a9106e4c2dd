//! Persistence contract over partners, countries and their history.

use async_trait::async_trait;
use pmon_core::{
    Country, NewPartner, NewStatusHistory, Partner, PartnerChange, PartnerStatus,
    ReferenceHistoryEntry, StatusHistoryEntry,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("{entity} `{name}` already exists")]
    Duplicate { entity: &'static str, name: String },
    #[error("stored value is not valid: {0}")]
    Corrupt(String),
}

/// Search filter for [`MonitorStore::list_partners`]. `None` fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartnerFilter {
    pub status: Option<PartnerStatus>,
    pub country_id: Option<i64>,
    pub to_reprocess: Option<bool>,
}

impl PartnerFilter {
    pub fn flagged() -> Self {
        Self {
            to_reprocess: Some(true),
            ..Default::default()
        }
    }

    pub fn matches(&self, partner: &Partner) -> bool {
        self.status.map_or(true, |s| s == partner.status)
            && self.country_id.map_or(true, |c| partner.country_id == Some(c))
            && self.to_reprocess.map_or(true, |f| f == partner.to_reprocess)
    }
}

/// Partial update of a country; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountryPatch {
    pub total_partner_count: Option<i64>,
    pub to_reprocess: Option<bool>,
    pub slug: Option<String>,
    pub external_id: Option<String>,
}

#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn partners_by_names(&self, names: &[String]) -> Result<Vec<Partner>, StoreError>;

    async fn list_partners(&self, filter: &PartnerFilter) -> Result<Vec<Partner>, StoreError>;

    /// Insert a partner, optionally with its first status history row, as
    /// one atomic write.
    async fn create_partner(
        &self,
        partner: NewPartner,
        initial_status: Option<NewStatusHistory>,
    ) -> Result<Partner, StoreError>;

    /// Append the change's history rows and write its fields atomically.
    async fn apply_partner_change(&self, change: &PartnerChange) -> Result<Partner, StoreError>;

    async fn set_partner_reprocess(&self, id: i64, flag: bool) -> Result<(), StoreError>;

    async fn count_partners(&self, filter: &PartnerFilter) -> Result<i64, StoreError>;

    async fn count_active_references(&self, partner_id: i64) -> Result<i64, StoreError>;

    async fn find_country_by_name(&self, name: &str) -> Result<Option<Country>, StoreError>;

    /// Create a country with default fields, or return the existing one.
    async fn create_country(&self, name: &str) -> Result<Country, StoreError>;

    async fn list_countries(&self, to_reprocess: Option<bool>) -> Result<Vec<Country>, StoreError>;

    async fn update_country(&self, id: i64, patch: &CountryPatch) -> Result<(), StoreError>;

    async fn status_history(&self, partner_id: i64) -> Result<Vec<StatusHistoryEntry>, StoreError>;

    async fn reference_history(
        &self,
        partner_id: i64,
    ) -> Result<Vec<ReferenceHistoryEntry>, StoreError>;
}
