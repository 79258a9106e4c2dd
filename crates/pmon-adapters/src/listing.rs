use std::sync::LazyLock;

use pmon_core::{PartnerRecord, PartnerStatus, UNKNOWN_COUNTRY};
use regex::Regex;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{
    element_text, first_decimal, first_integer, select_first_raw_text, select_first_text,
    selector, ParseError,
};

pub const CARD_SELECTOR: &str = "a.text-decoration-none.row.p-2.text-black";

static COUNTRY_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/country/([a-z0-9\-]+)-(\d+)").expect("static regex"));

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub records: Vec<PartnerRecord>,
    /// Cards that matched the card selector but failed to parse.
    pub skipped: usize,
}

/// Upstream identity of a country: URL slug plus numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountrySlug {
    pub slug: String,
    pub external_id: String,
}

/// Extract one partner record from a listing card element.
pub fn parse_card(card: ElementRef<'_>, page_url: &Url) -> Result<PartnerRecord, ParseError> {
    let name = select_first_text(card, "h5 span")?.ok_or(ParseError::MissingField("name"))?;

    let href = card
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::MissingField("profile_url"))?;
    let profile_url = page_url
        .join(href)
        .map_err(|source| ParseError::InvalidUrl {
            href: href.to_string(),
            source,
        })?
        .to_string();

    let status = select_first_text(card, "h5 .badge")?
        .map(|badge| PartnerStatus::from_badge(&badge))
        .unwrap_or_default();

    let country_name = select_first_text(card, "#o_wcrm_partners_address span")?
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());

    let retention_rate = match select_first_raw_text(card, "div.mb-2 small span")? {
        Some(text) => first_decimal(&text).ok_or(ParseError::InvalidNumber {
            field: "retention_rate",
            text,
        })?,
        None => 0.0,
    };

    let total_references = match select_first_raw_text(card, "div.col-md-3.stat_ref > div")? {
        Some(text) => first_integer(&text).ok_or(ParseError::InvalidNumber {
            field: "total_references",
            text,
        })?,
        None => 0,
    };

    let mut largest_project_size = 0;
    let mut average_project_size = 0.0;
    let muted = selector("small.text-muted")?;
    for tag in card.select(&muted) {
        let text = element_text(tag);
        if text.starts_with("Average Project") {
            average_project_size = first_decimal(&text).unwrap_or(0.0);
        } else if text.starts_with("Large Project") {
            largest_project_size = first_integer(&text).unwrap_or(0);
        }
    }

    Ok(PartnerRecord {
        name,
        profile_url,
        status,
        country_name,
        retention_rate,
        total_references,
        largest_project_size,
        average_project_size,
    })
}

/// Parse a standalone card snippet. `None` when the snippet holds no card
/// or the card is malformed.
pub fn parse_listing_fragment(fragment: &str, page_url: &Url) -> Option<PartnerRecord> {
    let html = Html::parse_fragment(fragment);
    let card_sel = selector(CARD_SELECTOR).ok()?;
    let card = html.root_element().select(&card_sel).next()?;
    match parse_card(card, page_url) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(error = %err, "skipping malformed partner card");
            None
        }
    }
}

pub fn parse_listing_page(html: &str, page_url: &str) -> Result<ListingPage, ParseError> {
    let base = Url::parse(page_url).map_err(|source| ParseError::InvalidUrl {
        href: page_url.to_string(),
        source,
    })?;
    let document = Html::parse_document(html);
    let card_sel = selector(CARD_SELECTOR)?;

    let mut page = ListingPage::default();
    for card in document.select(&card_sel) {
        match parse_card(card, &base) {
            Ok(record) => page.records.push(record),
            Err(err) => {
                warn!(page_url, error = %err, "skipping malformed partner card");
                page.skipped += 1;
            }
        }
    }
    debug!(page_url, records = page.records.len(), skipped = page.skipped, "parsed listing page");
    Ok(page)
}

/// Highest numeric pagination label, or 1 when the page has none.
pub fn parse_max_page(html: &str) -> u32 {
    let document = Html::parse_document(html);
    let Ok(sel) = selector("ul.pagination li a") else {
        return 1;
    };
    document
        .select(&sel)
        .filter_map(|a| {
            let label = element_text(a);
            if !label.is_empty() && label.chars().all(|c| c.is_ascii_digit()) {
                label.parse::<u32>().ok()
            } else {
                None
            }
        })
        .max()
        .unwrap_or(1)
}

/// Look up a country's slug and id among the listing page's country links,
/// matching the link text case-insensitively.
pub fn find_country_link(html: &str, country_name: &str) -> Option<CountrySlug> {
    let wanted = country_name.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    let document = Html::parse_document(html);
    let sel = selector(r#"a[href*="/partners/country/"]"#).ok()?;

    document
        .select(&sel)
        .filter(|a| element_text(*a).to_lowercase() == wanted)
        .find_map(|a| {
            let href = a.value().attr("href")?;
            let caps = COUNTRY_HREF.captures(href)?;
            Some(CountrySlug {
                slug: caps.get(1)?.as_str().to_string(),
                external_id: caps.get(2)?.as_str().to_string(),
            })
        })
}
