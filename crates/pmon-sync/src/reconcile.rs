use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pmon_core::{NewPartner, NewStatusHistory, Partner, PartnerChange, PartnerFields, PartnerRecord};
use pmon_storage::{MonitorStore, StoreError};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub countries_created: usize,
    pub status_changes: usize,
    pub reference_changes: usize,
}

impl ReconcileSummary {
    fn record_change(&mut self, change: &PartnerChange) {
        self.updated += 1;
        if change.status_history.is_some() {
            self.status_changes += 1;
        }
        if change.reference_history.is_some() {
            self.reference_changes += 1;
        }
    }
}

/// Applies scraped records to storage. All partner writes go through here so
/// status and reference history is appended on every change.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn MonitorStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn MonitorStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, records: Vec<PartnerRecord>) -> Result<ReconcileSummary, StoreError> {
        self.upsert_at(records, Utc::now()).await
    }

    pub async fn upsert_at(
        &self,
        records: Vec<PartnerRecord>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary, StoreError> {
        let mut summary = ReconcileSummary::default();
        if records.is_empty() {
            return Ok(summary);
        }

        let mut names: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names.dedup();
        let mut existing: HashMap<String, Partner> = self
            .store
            .partners_by_names(&names)
            .await?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        let mut countries: HashMap<String, i64> = HashMap::new();

        for record in records {
            let country_id = self
                .resolve_country(&record.country_name, &mut countries, &mut summary)
                .await?;
            let fields = PartnerFields::from_record(&record, country_id);

            match existing.get(&record.name) {
                Some(stored) => match PartnerChange::between(stored, fields, now) {
                    Some(change) => {
                        summary.record_change(&change);
                        let updated = self.store.apply_partner_change(&change).await?;
                        existing.insert(updated.name.clone(), updated);
                    }
                    None => summary.unchanged += 1,
                },
                None => {
                    let today = now.date_naive();
                    let initial = NewStatusHistory::transition(None, fields.status, today);
                    let created = self
                        .store
                        .create_partner(
                            NewPartner {
                                name: record.name,
                                fields,
                                first_seen_on: today,
                            },
                            Some(initial),
                        )
                        .await?;
                    debug!(partner = %created.name, id = created.id, "partner created");
                    summary.created += 1;
                    existing.insert(created.name.clone(), created);
                }
            }
        }

        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            countries_created = summary.countries_created,
            status_changes = summary.status_changes,
            reference_changes = summary.reference_changes,
            "reconciled partner batch"
        );
        Ok(summary)
    }

    /// Apply a freshly parsed record to one known partner. Returns the
    /// updated partner, or `None` when nothing changed.
    pub async fn update_partner(
        &self,
        partner: &Partner,
        record: PartnerRecord,
    ) -> Result<Option<Partner>, StoreError> {
        let mut countries = HashMap::new();
        let mut summary = ReconcileSummary::default();
        let country_id = self
            .resolve_country(&record.country_name, &mut countries, &mut summary)
            .await?;
        let fields = PartnerFields::from_record(&record, country_id);

        match PartnerChange::between(partner, fields, Utc::now()) {
            Some(change) => Ok(Some(self.store.apply_partner_change(&change).await?)),
            None => Ok(None),
        }
    }

    async fn resolve_country(
        &self,
        name: &str,
        cache: &mut HashMap<String, i64>,
        summary: &mut ReconcileSummary,
    ) -> Result<Option<i64>, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        if let Some(id) = cache.get(name) {
            return Ok(Some(*id));
        }

        let country = match self.store.find_country_by_name(name).await? {
            Some(country) => country,
            None => {
                summary.countries_created += 1;
                self.store.create_country(name).await?
            }
        };
        cache.insert(name.to_string(), country.id);
        Ok(Some(country.id))
    }
}
