//! Price source contracts and the HTML table scraper for the public price page.

use std::sync::Arc;

use async_trait::async_trait;
use finca_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "finca-adapters";

/// Which rows count as "the" price row.
///
/// A row matches when its label column, lowercased and stripped of diacritics,
/// contains every keyword fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCriteria {
    keywords: Vec<String>,
    pub row_selector: String,
    pub label_column: usize,
    pub value_column: usize,
}

impl MatchCriteria {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| normalize_label(k.as_ref()))
                .filter(|k| !k.is_empty())
                .collect(),
            row_selector: "tr".to_string(),
            label_column: 0,
            value_column: 1,
        }
    }

    /// Parses a comma-separated keyword list such as `limon,persa`.
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(','))
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn matches_label(&self, label: &str) -> bool {
        let normalized = normalize_label(label);
        !self.keywords.is_empty() && self.keywords.iter().all(|k| normalized.contains(k.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPrice {
    pub price: f64,
    pub row_label: String,
    pub raw_value: String,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid row selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("fetching {source_id}: {source}")]
    Fetch {
        source_id: String,
        #[source]
        source: FetchError,
    },
    #[error("no matching price row on {source_id}")]
    NotFound { source_id: String },
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Lowercases and strips diacritics so `LIMÓN` matches `limon`, whether the
/// page ships precomposed or decomposed characters.
pub fn normalize_label(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strips everything except digits and separators, then resolves which
/// separator is the decimal point.
///
/// With both `,` and `.` present the later one is the decimal point. A lone
/// separator kind is decimal when it appears once and is followed by one or two
/// digits (for `,`) or appears once at all (for `.`); otherwise it groups
/// thousands.
pub fn parse_price_text(text: &str) -> Option<f64> {
    let kept = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect::<String>();
    // "Q. 520.00" leaves a stray leading dot from the currency abbreviation.
    let kept = kept.trim_matches(|c| c == '.' || c == ',').to_string();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_dot = kept.rfind('.');
    let last_comma = kept.rfind(',');
    let canonical = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            let (decimal, grouping) = if dot > comma { ('.', ',') } else { (',', '.') };
            kept.replace(grouping, "").replace(decimal, ".")
        }
        (None, Some(comma)) => {
            let decimal_digits = kept.len() - comma - 1;
            if kept.matches(',').count() == 1 && (1..=2).contains(&decimal_digits) {
                kept.replace(',', ".")
            } else {
                kept.replace(',', "")
            }
        }
        (Some(_), None) => {
            if kept.matches('.').count() == 1 {
                kept
            } else {
                kept.replace('.', "")
            }
        }
        (None, None) => kept,
    };

    canonical
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

fn row_cells<'a>(row: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| matches!(el.value().name(), "td" | "th"))
        .collect()
}

/// Scans rows in document order and returns the price of the first row whose
/// label matches. Later matching rows are ignored even when the first one has
/// an unparseable value.
pub fn extract_price(raw_html: &str, criteria: &MatchCriteria) -> Result<Option<ExtractedPrice>, ExtractError> {
    let selector = Selector::parse(&criteria.row_selector).map_err(|e| ExtractError::InvalidSelector {
        selector: criteria.row_selector.clone(),
        message: e.to_string(),
    })?;
    let document = Html::parse_document(raw_html);

    for row in document.select(&selector) {
        let cells = row_cells(&row);
        let Some(label_cell) = cells.get(criteria.label_column) else {
            continue;
        };
        let label = cell_text(label_cell);
        if !criteria.matches_label(&label) {
            continue;
        }

        let raw_value = cells
            .get(criteria.value_column)
            .map(cell_text)
            .unwrap_or_default();
        let parsed = parse_price_text(&raw_value);
        debug!(row_label = %label, raw_value = %raw_value, ?parsed, "first matching price row");
        return Ok(parsed.map(|price| ExtractedPrice {
            price,
            row_label: label,
            raw_value,
        }));
    }

    Ok(None)
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Raw page body. No retry beyond the transport policy the caller configured.
    async fn fetch(&self) -> Result<String, FetchError>;

    fn extract(&self, raw_html: &str) -> Result<Option<ExtractedPrice>, ExtractError>;

    async fn scrape(&self) -> Result<ExtractedPrice, ScrapeError> {
        let raw_html = self.fetch().await.map_err(|source| ScrapeError::Fetch {
            source_id: self.source_id().to_string(),
            source,
        })?;
        self.extract(&raw_html)?.ok_or_else(|| ScrapeError::NotFound {
            source_id: self.source_id().to_string(),
        })
    }
}

/// Live HTML page with a price table.
#[derive(Debug, Clone)]
pub struct HtmlTablePriceSource {
    source_id: String,
    url: String,
    criteria: MatchCriteria,
    http: Arc<HttpFetcher>,
}

impl HtmlTablePriceSource {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        criteria: MatchCriteria,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            criteria,
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn criteria(&self) -> &MatchCriteria {
        &self.criteria
    }
}

#[async_trait]
impl PriceSource for HtmlTablePriceSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<String, FetchError> {
        let response = self.http.fetch_bytes(&self.source_id, &self.url).await?;
        Ok(response.text_lossy())
    }

    fn extract(&self, raw_html: &str) -> Result<Option<ExtractedPrice>, ExtractError> {
        extract_price(raw_html, &self.criteria)
    }
}
