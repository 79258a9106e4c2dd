//! Core domain model for the partner directory monitor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pmon-core";

/// Country name used when a listing card or profile carries no address.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Partner tier. Variant order is the ordinal rank: ready < silver < gold.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PartnerStatus {
    #[default]
    Ready,
    Silver,
    Gold,
}

impl PartnerStatus {
    pub const ALL: [PartnerStatus; 3] = [PartnerStatus::Ready, PartnerStatus::Silver, PartnerStatus::Gold];

    pub fn as_str(self) -> &'static str {
        match self {
            PartnerStatus::Ready => "ready",
            PartnerStatus::Silver => "silver",
            PartnerStatus::Gold => "gold",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            PartnerStatus::Ready => 0,
            PartnerStatus::Silver => 1,
            PartnerStatus::Gold => 2,
        }
    }

    /// Badge text is free-form ("Gold Partner", "SILVER"...); anything that
    /// mentions neither tier is a ready partner.
    pub fn from_badge(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("gold") {
            PartnerStatus::Gold
        } else if lower.contains("silver") {
            PartnerStatus::Silver
        } else {
            PartnerStatus::Ready
        }
    }
}

impl fmt::Display for PartnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown partner status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for PartnerStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ready" => Ok(PartnerStatus::Ready),
            "silver" => Ok(PartnerStatus::Silver),
            "gold" => Ok(PartnerStatus::Gold),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Initial,
    Promoted,
    Demoted,
}

impl ChangeType {
    pub fn classify(old: Option<PartnerStatus>, new: PartnerStatus) -> Self {
        match old {
            None => ChangeType::Initial,
            Some(old) if new.rank() > old.rank() => ChangeType::Promoted,
            Some(_) => ChangeType::Demoted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Initial => "initial",
            ChangeType::Promoted => "promoted",
            ChangeType::Demoted => "demoted",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(ChangeType::Initial),
            "promoted" => Ok(ChangeType::Promoted),
            "demoted" => Ok(ChangeType::Demoted),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Parsed handoff contract from the HTML parsers into reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerRecord {
    pub name: String,
    pub profile_url: String,
    pub status: PartnerStatus,
    pub country_name: String,
    pub retention_rate: f64,
    pub total_references: i64,
    pub largest_project_size: i64,
    pub average_project_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    pub id: i64,
    pub name: String,
    pub profile_url: Option<String>,
    pub status: PartnerStatus,
    pub country_id: Option<i64>,
    pub first_seen_on: NaiveDate,
    pub retention_rate: f64,
    pub total_references: i64,
    pub largest_project_size: i64,
    pub average_project_size: f64,
    pub to_reprocess: bool,
}

impl Partner {
    pub fn fields(&self) -> PartnerFields {
        PartnerFields {
            profile_url: self.profile_url.clone(),
            status: self.status,
            country_id: self.country_id,
            retention_rate: self.retention_rate,
            total_references: self.total_references,
            largest_project_size: self.largest_project_size,
            average_project_size: self.average_project_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub id: i64,
    pub name: String,
    pub slug: Option<String>,
    pub external_id: Option<String>,
    pub total_partner_count: i64,
    pub to_reprocess: bool,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub id: i64,
    pub partner_id: i64,
    pub old_status: Option<PartnerStatus>,
    pub new_status: PartnerStatus,
    pub change_date: NaiveDate,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceHistoryEntry {
    pub id: i64,
    pub partner_id: i64,
    pub reference_count: i64,
    pub old_reference_count: Option<i64>,
    pub active: bool,
    pub changed_at: DateTime<Utc>,
}

/// The mutable field set of a partner, written as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerFields {
    pub profile_url: Option<String>,
    pub status: PartnerStatus,
    pub country_id: Option<i64>,
    pub retention_rate: f64,
    pub total_references: i64,
    pub largest_project_size: i64,
    pub average_project_size: f64,
}

impl PartnerFields {
    pub fn from_record(record: &PartnerRecord, country_id: Option<i64>) -> Self {
        let profile_url = if record.profile_url.trim().is_empty() {
            None
        } else {
            Some(record.profile_url.clone())
        };
        Self {
            profile_url,
            status: record.status,
            country_id,
            retention_rate: record.retention_rate,
            total_references: record.total_references,
            largest_project_size: record.largest_project_size,
            average_project_size: record.average_project_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPartner {
    pub name: String,
    pub fields: PartnerFields,
    pub first_seen_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStatusHistory {
    pub old_status: Option<PartnerStatus>,
    pub new_status: PartnerStatus,
    pub change_date: NaiveDate,
    pub change_type: ChangeType,
}

impl NewStatusHistory {
    pub fn transition(old: Option<PartnerStatus>, new: PartnerStatus, change_date: NaiveDate) -> Self {
        Self {
            old_status: old,
            new_status: new,
            change_date,
            change_type: ChangeType::classify(old, new),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReferenceHistory {
    pub reference_count: i64,
    pub old_reference_count: Option<i64>,
    pub changed_at: DateTime<Utc>,
}

/// Explicit diff between a stored partner and freshly scraped fields.
///
/// History rows and the field write travel together so a store can apply
/// them atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerChange {
    pub partner_id: i64,
    pub fields: PartnerFields,
    pub status_history: Option<NewStatusHistory>,
    pub reference_history: Option<NewReferenceHistory>,
}

impl PartnerChange {
    /// Returns `None` when `incoming` matches the stored fields exactly.
    pub fn between(stored: &Partner, incoming: PartnerFields, now: DateTime<Utc>) -> Option<Self> {
        if stored.fields() == incoming {
            return None;
        }

        let status_history = (incoming.status != stored.status).then(|| {
            NewStatusHistory::transition(Some(stored.status), incoming.status, now.date_naive())
        });
        let reference_history =
            (incoming.total_references != stored.total_references).then(|| NewReferenceHistory {
                reference_count: incoming.total_references,
                old_reference_count: Some(stored.total_references),
                changed_at: now,
            });

        Some(Self {
            partner_id: stored.id,
            fields: incoming,
            status_history,
            reference_history,
        })
    }
}
