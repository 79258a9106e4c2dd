//! HTML parsers for the partner directory: listing pages, pagination,
//! country links and partner profile pages.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Selector};
use thiserror::Error;

mod listing;
mod profile;

pub use listing::{
    find_country_link, parse_card, parse_listing_fragment, parse_listing_page, parse_max_page,
    CountrySlug, ListingPage, CARD_SELECTOR,
};
pub use profile::parse_profile;

pub const CRATE_NAME: &str = "pmon-adapters";

/// Per-item extraction failure. Callers skip the item and keep going.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not numeric: `{text}`")]
    InvalidNumber { field: &'static str, text: String },
    #[error("cannot resolve url `{href}`: {source}")]
    InvalidUrl {
        href: String,
        #[source]
        source: url::ParseError,
    },
}

static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").expect("static regex"));
static DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("static regex"));

pub(crate) fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

pub(crate) fn select_first_text(root: ElementRef<'_>, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(root
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

/// Like [`select_first_text`] but distinguishes "element absent" (`None`)
/// from "element present with blank text" (`Some("")`).
pub(crate) fn select_first_raw_text(root: ElementRef<'_>, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(root.select(&sel).next().map(element_text))
}

pub(crate) fn first_integer(text: &str) -> Option<i64> {
    INTEGER
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub(crate) fn first_decimal(text: &str) -> Option<f64> {
    DECIMAL
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
