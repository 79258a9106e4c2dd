use std::sync::LazyLock;

use pmon_core::{PartnerRecord, PartnerStatus, UNKNOWN_COUNTRY};
use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::warn;

use crate::{first_decimal, first_integer, select_first_text, selector, text_or_none, ParseError};

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("static regex"));

/// Parse a partner's own profile page.
///
/// `None` means "no update this cycle": the page had no name or could not be
/// read. Missing sub-blocks fall back to the listing defaults.
pub fn parse_profile(html: &str, profile_url: &str) -> Option<PartnerRecord> {
    let document = Html::parse_document(html);
    match extract(document.root_element(), profile_url) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(profile_url, error = %err, "profile page not usable");
            None
        }
    }
}

fn extract(root: ElementRef<'_>, profile_url: &str) -> Result<PartnerRecord, ParseError> {
    let name = select_first_text(root, "h1")?.ok_or(ParseError::MissingField("name"))?;

    let status = select_first_text(root, "span.badge")?
        .map(|badge| PartnerStatus::from_badge(&badge))
        .unwrap_or_default();

    let (largest_project_size, average_project_size, retention_rate) = size_stats(root)?;

    Ok(PartnerRecord {
        name,
        profile_url: profile_url.to_string(),
        status,
        country_name: address_country(root)?,
        retention_rate,
        total_references: reference_count(root)?,
        largest_project_size,
        average_project_size,
    })
}

/// Country is the last line of the street address block.
fn address_country(root: ElementRef<'_>) -> Result<String, ParseError> {
    let sel = selector(r#"span[itemprop="streetAddress"]"#)?;
    let Some(block) = root.select(&sel).next() else {
        return Ok(UNKNOWN_COUNTRY.to_string());
    };
    let inner = block.inner_html();
    let mut lines = inner.split("<br>");
    let (Some(_), Some(last)) = (lines.next(), lines.last()) else {
        return Ok(UNKNOWN_COUNTRY.to_string());
    };
    let fragment = Html::parse_fragment(last);
    let text = fragment.root_element().text().collect::<String>();
    Ok(text_or_none(text).unwrap_or_else(|| UNKNOWN_COUNTRY.to_string()))
}

fn reference_count(root: ElementRef<'_>) -> Result<i64, ParseError> {
    let block_sel = selector("div.stat_ref")?;
    let Some(block) = root.select(&block_sel).next() else {
        return Ok(0);
    };
    let header = select_first_text(block, "div.mt-3")?;
    Ok(header
        .filter(|text| text.contains("References"))
        .and_then(|text| first_integer(&text))
        .unwrap_or(0))
}

/// (largest, average, retention) from the `div.stat_size` block.
fn size_stats(root: ElementRef<'_>) -> Result<(i64, f64, f64), ParseError> {
    let sel = selector("div.stat_size")?;
    let Some(block) = root.select(&sel).next() else {
        return Ok((0, 0.0, 0.0));
    };
    let texts: Vec<&str> = block.text().collect();

    let largest = texts
        .iter()
        .find(|t| t.contains("Largest:"))
        .and_then(|t| first_integer(t))
        .unwrap_or(0);
    let average = texts
        .iter()
        .find(|t| t.contains("Average:"))
        .and_then(|t| first_decimal(t))
        .unwrap_or(0.0);
    let retention = texts
        .iter()
        .find_map(|t| PERCENT.captures(t))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0);

    Ok((largest, average, retention))
}
