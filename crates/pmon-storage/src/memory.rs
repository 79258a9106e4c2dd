//! In-process store backend for tests and dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pmon_core::{
    Country, NewPartner, NewStatusHistory, Partner, PartnerChange, ReferenceHistoryEntry,
    StatusHistoryEntry,
};
use tokio::sync::Mutex;

use crate::store::{CountryPatch, MonitorStore, PartnerFilter, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    partners: BTreeMap<i64, Partner>,
    countries: BTreeMap<i64, Country>,
    status_history: Vec<StatusHistoryEntry>,
    reference_history: Vec<ReferenceHistoryEntry>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_status(&mut self, partner_id: i64, entry: &NewStatusHistory) {
        let id = self.allocate_id();
        self.status_history.push(StatusHistoryEntry {
            id,
            partner_id,
            old_status: entry.old_status,
            new_status: entry.new_status,
            change_date: entry.change_date,
            change_type: entry.change_type,
        });
    }
}

/// Every method holds the state lock for its whole body, so each call is
/// atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reference history row directly, bypassing reconciliation.
    /// Lets callers seed drift scenarios.
    pub async fn seed_reference_history(&self, partner_id: i64, reference_count: i64, active: bool) {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.reference_history.push(ReferenceHistoryEntry {
            id,
            partner_id,
            reference_count,
            old_reference_count: None,
            active,
            changed_at: chrono::Utc::now(),
        });
    }

    pub async fn history_counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.status_history.len(), state.reference_history.len())
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn partners_by_names(&self, names: &[String]) -> Result<Vec<Partner>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .partners
            .values()
            .filter(|p| names.contains(&p.name))
            .cloned()
            .collect())
    }

    async fn list_partners(&self, filter: &PartnerFilter) -> Result<Vec<Partner>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.partners.values().filter(|p| filter.matches(p)).cloned().collect())
    }

    async fn create_partner(
        &self,
        partner: NewPartner,
        initial_status: Option<NewStatusHistory>,
    ) -> Result<Partner, StoreError> {
        let mut state = self.state.lock().await;
        if state.partners.values().any(|p| p.name == partner.name) {
            return Err(StoreError::Duplicate {
                entity: "partner",
                name: partner.name,
            });
        }

        let id = state.allocate_id();
        let fields = partner.fields;
        let created = Partner {
            id,
            name: partner.name,
            profile_url: fields.profile_url,
            status: fields.status,
            country_id: fields.country_id,
            first_seen_on: partner.first_seen_on,
            retention_rate: fields.retention_rate,
            total_references: fields.total_references,
            largest_project_size: fields.largest_project_size,
            average_project_size: fields.average_project_size,
            to_reprocess: false,
        };
        state.partners.insert(id, created.clone());
        if let Some(entry) = &initial_status {
            state.push_status(id, entry);
        }
        Ok(created)
    }

    async fn apply_partner_change(&self, change: &PartnerChange) -> Result<Partner, StoreError> {
        let mut state = self.state.lock().await;
        if !state.partners.contains_key(&change.partner_id) {
            return Err(StoreError::NotFound {
                entity: "partner",
                id: change.partner_id,
            });
        }

        if let Some(entry) = &change.status_history {
            state.push_status(change.partner_id, entry);
        }
        if let Some(entry) = &change.reference_history {
            let id = state.allocate_id();
            state.reference_history.push(ReferenceHistoryEntry {
                id,
                partner_id: change.partner_id,
                reference_count: entry.reference_count,
                old_reference_count: entry.old_reference_count,
                active: true,
                changed_at: entry.changed_at,
            });
        }

        let partner = state
            .partners
            .get_mut(&change.partner_id)
            .ok_or(StoreError::NotFound {
                entity: "partner",
                id: change.partner_id,
            })?;
        let fields = change.fields.clone();
        partner.profile_url = fields.profile_url;
        partner.status = fields.status;
        partner.country_id = fields.country_id;
        partner.retention_rate = fields.retention_rate;
        partner.total_references = fields.total_references;
        partner.largest_project_size = fields.largest_project_size;
        partner.average_project_size = fields.average_project_size;
        Ok(partner.clone())
    }

    async fn set_partner_reprocess(&self, id: i64, flag: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let partner = state
            .partners
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "partner", id })?;
        partner.to_reprocess = flag;
        Ok(())
    }

    async fn count_partners(&self, filter: &PartnerFilter) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.partners.values().filter(|p| filter.matches(p)).count() as i64)
    }

    async fn count_active_references(&self, partner_id: i64) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .reference_history
            .iter()
            .filter(|r| r.partner_id == partner_id && r.active)
            .count() as i64)
    }

    async fn find_country_by_name(&self, name: &str) -> Result<Option<Country>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.countries.values().find(|c| c.name == name).cloned())
    }

    async fn create_country(&self, name: &str) -> Result<Country, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.countries.values().find(|c| c.name == name) {
            return Ok(existing.clone());
        }
        let id = state.allocate_id();
        let country = Country {
            id,
            name: name.to_string(),
            slug: None,
            external_id: None,
            total_partner_count: 0,
            to_reprocess: false,
            active: true,
        };
        state.countries.insert(id, country.clone());
        Ok(country)
    }

    async fn list_countries(&self, to_reprocess: Option<bool>) -> Result<Vec<Country>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .countries
            .values()
            .filter(|c| c.active && to_reprocess.map_or(true, |f| f == c.to_reprocess))
            .cloned()
            .collect())
    }

    async fn update_country(&self, id: i64, patch: &CountryPatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let country = state
            .countries
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "country", id })?;
        if let Some(total) = patch.total_partner_count {
            country.total_partner_count = total;
        }
        if let Some(flag) = patch.to_reprocess {
            country.to_reprocess = flag;
        }
        if let Some(slug) = &patch.slug {
            country.slug = Some(slug.clone());
        }
        if let Some(external_id) = &patch.external_id {
            country.external_id = Some(external_id.clone());
        }
        Ok(())
    }

    async fn status_history(&self, partner_id: i64) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .status_history
            .iter()
            .filter(|h| h.partner_id == partner_id)
            .cloned()
            .collect())
    }

    async fn reference_history(
        &self,
        partner_id: i64,
    ) -> Result<Vec<ReferenceHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .reference_history
            .iter()
            .filter(|h| h.partner_id == partner_id)
            .cloned()
            .collect())
    }
}
