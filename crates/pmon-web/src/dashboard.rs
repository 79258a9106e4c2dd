use std::collections::HashMap;

use pmon_core::{Country, Partner, PartnerStatus, UNKNOWN_COUNTRY};
use serde::Serialize;

pub const RANK_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub gold: u64,
    pub silver: u64,
    pub ready: u64,
}

impl StatusCounts {
    fn add(&mut self, status: PartnerStatus) {
        match status {
            PartnerStatus::Gold => self.gold += 1,
            PartnerStatus::Silver => self.silver += 1,
            PartnerStatus::Ready => self.ready += 1,
        }
    }
}

/// Partner counts per average-project-size band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SizeBuckets {
    #[serde(rename = "<5")]
    pub under_5: u64,
    #[serde(rename = "5-10")]
    pub from_5_to_10: u64,
    #[serde(rename = "11-25")]
    pub from_11_to_25: u64,
    #[serde(rename = "25+")]
    pub over_25: u64,
}

impl SizeBuckets {
    fn add(&mut self, average_size: f64) {
        if average_size < 5.0 {
            self.under_5 += 1;
        } else if average_size <= 10.0 {
            self.from_5_to_10 += 1;
        } else if average_size <= 25.0 {
            self.from_11_to_25 += 1;
        } else {
            self.over_25 += 1;
        }
    }
}

trait Total {
    fn total(&self) -> u64;
}

impl Total for StatusCounts {
    fn total(&self) -> u64 {
        self.gold + self.silver + self.ready
    }
}

impl Total for SizeBuckets {
    fn total(&self) -> u64 {
        self.under_5 + self.from_5_to_10 + self.from_11_to_25 + self.over_25
    }
}

/// Groups serialize as `[country, counts]` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranked<T> {
    pub top5: Vec<(String, T)>,
    pub bottom5: Vec<(String, T)>,
}

fn country_names(countries: &[Country]) -> HashMap<i64, &str> {
    countries.iter().map(|c| (c.id, c.name.as_str())).collect()
}

fn group_by_country<T, F>(partners: &[Partner], countries: &[Country], mut add: F) -> Vec<(String, T)>
where
    T: Default + Total,
    F: FnMut(&mut T, &Partner),
{
    let names = country_names(countries);
    let mut groups: HashMap<String, T> = HashMap::new();
    for partner in partners {
        let country = partner
            .country_id
            .and_then(|id| names.get(&id).copied())
            .unwrap_or(UNKNOWN_COUNTRY);
        add(groups.entry(country.to_string()).or_default(), partner);
    }

    let mut sorted: Vec<(String, T)> = groups.into_iter().collect();
    sorted.sort_by(|(a_name, a), (b_name, b)| b.total().cmp(&a.total()).then_with(|| a_name.cmp(b_name)));
    sorted
}

fn rank<T: Clone>(sorted: Vec<(String, T)>) -> Ranked<T> {
    let top5 = sorted.iter().take(RANK_SIZE).cloned().collect();
    let bottom5 = sorted[sorted.len().saturating_sub(RANK_SIZE)..].to_vec();
    Ranked { top5, bottom5 }
}

pub fn partner_status_ranking(partners: &[Partner], countries: &[Country]) -> Ranked<StatusCounts> {
    rank(group_by_country(partners, countries, |counts: &mut StatusCounts, p| {
        counts.add(p.status)
    }))
}

pub fn project_size_ranking(partners: &[Partner], countries: &[Country]) -> Ranked<SizeBuckets> {
    rank(group_by_country(partners, countries, |buckets: &mut SizeBuckets, p| {
        buckets.add(p.average_project_size)
    }))
}
