//! PostgreSQL backends for the store, settings and operator inbox.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use pmon_core::{
    ChangeType, Country, NewPartner, NewStatusHistory, Partner, PartnerChange, PartnerStatus,
    ReferenceHistoryEntry, StatusHistoryEntry,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::notify::{Notifier, NotifyError};
use crate::settings::{SettingsError, SettingsLease, SettingsStore};
use crate::store::{CountryPatch, MonitorStore, PartnerFilter, StoreError};

const PARTNER_COLUMNS: &str = "id, name, profile_url, status, country_id, first_seen_on, \
     retention_rate, total_references, largest_project_size, average_project_size, to_reprocess";
/// Advisory lock id guarding the fetch-target settings across processes.
const SETTINGS_LEASE_KEY: i64 = 0x706d_6f6e;
const COUNTRY_COLUMNS: &str =
    "id, name, slug, external_id, total_partner_count, to_reprocess, active";

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")
}

fn parse_status(raw: &str) -> Result<PartnerStatus, StoreError> {
    raw.parse().map_err(|e: pmon_core::UnknownStatus| StoreError::Corrupt(e.to_string()))
}

fn partner_from_row(row: &PgRow) -> Result<Partner, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Partner {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        profile_url: row.try_get("profile_url")?,
        status: parse_status(&status)?,
        country_id: row.try_get("country_id")?,
        first_seen_on: row.try_get("first_seen_on")?,
        retention_rate: row.try_get("retention_rate")?,
        total_references: row.try_get("total_references")?,
        largest_project_size: row.try_get("largest_project_size")?,
        average_project_size: row.try_get("average_project_size")?,
        to_reprocess: row.try_get("to_reprocess")?,
    })
}

fn country_from_row(row: &PgRow) -> Result<Country, StoreError> {
    Ok(Country {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        external_id: row.try_get("external_id")?,
        total_partner_count: row.try_get("total_partner_count")?,
        to_reprocess: row.try_get("to_reprocess")?,
        active: row.try_get("active")?,
    })
}

fn duplicate_or(err: sqlx::Error, entity: &'static str, name: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate {
            entity,
            name: name.to_string(),
        },
        _ => StoreError::Database(err),
    }
}

async fn insert_status_history(
    tx: &mut Transaction<'_, Postgres>,
    partner_id: i64,
    entry: &NewStatusHistory,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO partner_status_history (partner_id, old_status, new_status, change_date, change_type) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(partner_id)
    .bind(entry.old_status.map(PartnerStatus::as_str))
    .bind(entry.new_status.as_str())
    .bind(entry.change_date)
    .bind(entry.change_type.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MonitorStore for PgStore {
    async fn partners_by_names(&self, names: &[String]) -> Result<Vec<Partner>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {PARTNER_COLUMNS} FROM partners WHERE name = ANY($1)"))
            .bind(names.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(partner_from_row).collect()
    }

    async fn list_partners(&self, filter: &PartnerFilter) -> Result<Vec<Partner>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PARTNER_COLUMNS} FROM partners \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::bigint IS NULL OR country_id = $2) \
               AND ($3::boolean IS NULL OR to_reprocess = $3) \
             ORDER BY id"
        ))
        .bind(filter.status.map(PartnerStatus::as_str))
        .bind(filter.country_id)
        .bind(filter.to_reprocess)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(partner_from_row).collect()
    }


    async fn create_partner(
        &self,
        partner: NewPartner,
        initial_status: Option<NewStatusHistory>,
    ) -> Result<Partner, StoreError> {
        let mut tx = self.pool.begin().await?;
        let fields = &partner.fields;
        let row = sqlx::query(&format!(
            "INSERT INTO partners (name, profile_url, status, country_id, first_seen_on, retention_rate, \
                 total_references, largest_project_size, average_project_size) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {PARTNER_COLUMNS}"
        ))
        .bind(&partner.name)
        .bind(&fields.profile_url)
        .bind(fields.status.as_str())
        .bind(fields.country_id)
        .bind(partner.first_seen_on)
        .bind(fields.retention_rate)
        .bind(fields.total_references)
        .bind(fields.largest_project_size)
        .bind(fields.average_project_size)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| duplicate_or(e, "partner", &partner.name))?;
        let created = partner_from_row(&row)?;

        if let Some(entry) = &initial_status {
            insert_status_history(&mut tx, created.id, entry).await?;
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn apply_partner_change(&self, change: &PartnerChange) -> Result<Partner, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(entry) = &change.status_history {
            insert_status_history(&mut tx, change.partner_id, entry).await?;
        }
        if let Some(entry) = &change.reference_history {
            sqlx::query(
                "INSERT INTO partner_reference_history (partner_id, reference_count, old_reference_count, active, changed_at) \
                 VALUES ($1, $2, $3, TRUE, $4)",
            )
            .bind(change.partner_id)
            .bind(entry.reference_count)
            .bind(entry.old_reference_count)
            .bind(entry.changed_at)
            .execute(&mut *tx)
            .await?;
        }

        let fields = &change.fields;
        let row = sqlx::query(&format!(
            "UPDATE partners SET profile_url = $2, status = $3, country_id = $4, retention_rate = $5, \
                 total_references = $6, largest_project_size = $7, average_project_size = $8 \
             WHERE id = $1 RETURNING {PARTNER_COLUMNS}"
        ))
        .bind(change.partner_id)
        .bind(&fields.profile_url)
        .bind(fields.status.as_str())
        .bind(fields.country_id)
        .bind(fields.retention_rate)
        .bind(fields.total_references)
        .bind(fields.largest_project_size)
        .bind(fields.average_project_size)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "partner",
            id: change.partner_id,
        })?;
        let updated = partner_from_row(&row)?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn set_partner_reprocess(&self, id: i64, flag: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE partners SET to_reprocess = $2 WHERE id = $1")
            .bind(id)
            .bind(flag)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "partner", id });
        }
        Ok(())
    }

    async fn count_partners(&self, filter: &PartnerFilter) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM partners \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::bigint IS NULL OR country_id = $2) \
               AND ($3::boolean IS NULL OR to_reprocess = $3)",
        )
        .bind(filter.status.map(PartnerStatus::as_str))
        .bind(filter.country_id)
        .bind(filter.to_reprocess)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_active_references(&self, partner_id: i64) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM partner_reference_history WHERE partner_id = $1 AND active",
        )
        .bind(partner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn find_country_by_name(&self, name: &str) -> Result<Option<Country>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COUNTRY_COLUMNS} FROM countries WHERE name = $1 ORDER BY id LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(country_from_row).transpose()
    }

    async fn create_country(&self, name: &str) -> Result<Country, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO countries (name) VALUES ($1) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING {COUNTRY_COLUMNS}"
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        country_from_row(&row)
    }

    async fn list_countries(&self, to_reprocess: Option<bool>) -> Result<Vec<Country>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COUNTRY_COLUMNS} FROM countries \
             WHERE active AND ($1::boolean IS NULL OR to_reprocess = $1) ORDER BY name"
        ))
        .bind(to_reprocess)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(country_from_row).collect()
    }

    async fn update_country(&self, id: i64, patch: &CountryPatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE countries SET \
                 total_partner_count = COALESCE($2, total_partner_count), \
                 to_reprocess = COALESCE($3, to_reprocess), \
                 slug = COALESCE($4, slug), \
                 external_id = COALESCE($5, external_id) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(patch.total_partner_count)
        .bind(patch.to_reprocess)
        .bind(&patch.slug)
        .bind(&patch.external_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "country", id });
        }
        Ok(())
    }

    async fn status_history(&self, partner_id: i64) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, partner_id, old_status, new_status, change_date, change_type \
             FROM partner_status_history WHERE partner_id = $1 ORDER BY id",
        )
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let old: Option<String> = row.try_get("old_status")?;
                let new: String = row.try_get("new_status")?;
                let change_type: String = row.try_get("change_type")?;
                Ok(StatusHistoryEntry {
                    id: row.try_get("id")?,
                    partner_id: row.try_get("partner_id")?,
                    old_status: old.as_deref().map(parse_status).transpose()?,
                    new_status: parse_status(&new)?,
                    change_date: row.try_get("change_date")?,
                    change_type: change_type
                        .parse::<ChangeType>()
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn reference_history(
        &self,
        partner_id: i64,
    ) -> Result<Vec<ReferenceHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, partner_id, reference_count, old_reference_count, active, changed_at \
             FROM partner_reference_history WHERE partner_id = $1 ORDER BY id",
        )
        .bind(partner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ReferenceHistoryEntry {
                    id: row.try_get("id")?,
                    partner_id: row.try_get("partner_id")?,
                    reference_count: row.try_get("reference_count")?,
                    old_reference_count: row.try_get("old_reference_count")?,
                    active: row.try_get("active")?,
                    changed_at: row.try_get("changed_at")?,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgSettings {
    pool: PgPool,
    local: Arc<tokio::sync::Mutex<()>>,
}

impl PgSettings {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            local: Arc::default(),
        }
    }
}

#[async_trait]
impl SettingsStore for PgSettings {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let value = sqlx::query_scalar("SELECT value FROM monitor_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        sqlx::query(
            "INSERT INTO monitor_settings (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<(), SettingsError> {
        sqlx::query("DELETE FROM monitor_settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// In-process waiters queue on the local mutex. The transaction-scoped
    /// advisory lock excludes other processes and is released when the lease
    /// drops and the transaction rolls back.
    async fn lease(&self) -> Result<SettingsLease, SettingsError> {
        let local = Arc::clone(&self.local).lock_owned().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SETTINGS_LEASE_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(SettingsLease::new((local, tx)))
    }
}

/// Posts operator notifications into the `operator_messages` inbox table.
#[derive(Debug, Clone)]
pub struct PgNotifier {
    pool: PgPool,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn send_message(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        if recipient.trim().is_empty() {
            return Err(NotifyError::UnknownRecipient(recipient.to_string()));
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO operator_messages (recipient, subject, body) VALUES ($1, $2, $3)")
            .bind(recipient)
            .bind(subject)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
