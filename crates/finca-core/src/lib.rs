//! Core domain model for price readings, queued writes and the sync error log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "finca-core";

pub const PRICE_READINGS_COLLECTION: &str = "price_readings";
pub const ERROR_LOG_COLLECTION: &str = "error_log";

/// Decimal places kept on a normalized price.
pub const PRICE_SCALE: u32 = 4;

/// Measurement basis of a reading. Fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceUnit {
    PerThousand,
    PerHundred,
    PerUnit,
    PerBox,
}

impl PriceUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceUnit::PerThousand => "per-thousand",
            PriceUnit::PerHundred => "per-hundred",
            PriceUnit::PerUnit => "per-unit",
            PriceUnit::PerBox => "per-box",
        }
    }

    /// Human wording used in notification bodies.
    pub fn describe(&self) -> &'static str {
        match self {
            PriceUnit::PerThousand => "per thousand",
            PriceUnit::PerHundred => "per hundred",
            PriceUnit::PerUnit => "per unit",
            PriceUnit::PerBox => "per box",
        }
    }
}

impl fmt::Display for PriceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown price unit `{0}`")]
pub struct UnknownUnitError(pub String);

impl FromStr for PriceUnit {
    type Err = UnknownUnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-thousand" | "millar" => Ok(PriceUnit::PerThousand),
            "per-hundred" | "ciento" => Ok(PriceUnit::PerHundred),
            "per-unit" | "unidad" => Ok(PriceUnit::PerUnit),
            "per-box" | "caja" => Ok(PriceUnit::PerBox),
            other => Err(UnknownUnitError(other.to_string())),
        }
    }
}

/// Provenance tag of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadingSource {
    ScheduledJob,
    OnDemandProxy,
    Manual,
}

impl ReadingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingSource::ScheduledJob => "scheduled-job",
            ReadingSource::OnDemandProxy => "on-demand-proxy",
            ReadingSource::Manual => "manual",
        }
    }
}

/// One persisted price observation. Immutable once stored; history is append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceReading {
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub unit: PriceUnit,
    pub currency: String,
    pub source: ReadingSource,
    /// Server clock at persistence time, not scrape time.
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum InvalidPriceError {
    #[error("price is not a finite number: {0}")]
    NotFinite(f64),
    #[error("price must not be negative: {0}")]
    Negative(f64),
    #[error("price is outside the representable range: {0}")]
    OutOfRange(f64),
}

/// Turns extracted raw prices into canonical readings. Pure: the caller supplies
/// the timestamp and provenance, nothing here reads a clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceNormalizer {
    unit: PriceUnit,
    currency: String,
}

impl PriceNormalizer {
    pub fn new(unit: PriceUnit, currency: impl AsRef<str>) -> Self {
        Self {
            unit,
            currency: normalize_currency(currency.as_ref()),
        }
    }

    pub fn unit(&self) -> PriceUnit {
        self.unit
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn normalize(
        &self,
        raw_price: f64,
        source: ReadingSource,
        captured_at: DateTime<Utc>,
    ) -> Result<PriceReading, InvalidPriceError> {
        Ok(PriceReading {
            price: canonical_price(raw_price)?,
            unit: self.unit,
            currency: self.currency.clone(),
            source,
            captured_at,
        })
    }
}

fn normalize_currency(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Validates and converts a raw float into the canonical decimal price.
pub fn canonical_price(raw_price: f64) -> Result<Decimal, InvalidPriceError> {
    if !raw_price.is_finite() {
        return Err(InvalidPriceError::NotFinite(raw_price));
    }
    if raw_price < 0.0 {
        return Err(InvalidPriceError::Negative(raw_price));
    }
    let price = Decimal::from_f64(raw_price).ok_or(InvalidPriceError::OutOfRange(raw_price))?;
    Ok(price
        .round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
        .normalize())
}

/// `(current - previous) / previous * 100`, rounded to two places.
///
/// Zero when there is no previous reading or the previous price is zero.
pub fn percent_change(previous: Option<&PriceReading>, current: &PriceReading) -> Decimal {
    let Some(previous) = previous else {
        return Decimal::ZERO;
    };
    if previous.price.is_zero() {
        return Decimal::ZERO;
    }
    ((current.price - previous.price) / previous.price * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// A write that could not reach the backend yet. Owned by the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Client-generated idempotency key, stable across redeliveries.
    pub op_id: Uuid,
    #[serde(rename = "type")]
    pub op_type: String,
    pub payload: JsonValue,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    ScrapeFailure,
    PersistFailure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ScrapeFailure => "scrape-failure",
            ErrorCategory::PersistFailure => "persist-failure",
        }
    }
}

/// Append-only record written when a scheduled sync fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub captured_at: DateTime<Utc>,
    pub category: ErrorCategory,
    /// Finer tag, e.g. `fetch-failure` vs `not-found`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).single().unwrap()
    }

    fn reading(price: Decimal) -> PriceReading {
        PriceReading {
            price,
            unit: PriceUnit::PerThousand,
            currency: "GTQ".into(),
            source: ReadingSource::ScheduledJob,
            captured_at: ts(),
        }
    }

    #[test]
    fn normalize_builds_canonical_reading() {
        let normalizer = PriceNormalizer::new(PriceUnit::PerThousand, " gtq ");
        let reading = normalizer
            .normalize(520.00, ReadingSource::ScheduledJob, ts())
            .unwrap();
        assert_eq!(reading.price, dec!(520));
        assert_eq!(reading.unit, PriceUnit::PerThousand);
        assert_eq!(reading.currency, "GTQ");
        assert_eq!(reading.captured_at, ts());
    }

    #[test]
    fn normalize_is_pure() {
        let normalizer = PriceNormalizer::new(PriceUnit::PerThousand, "GTQ");
        let first = normalizer.normalize(487.35, ReadingSource::Manual, ts()).unwrap();
        let second = normalizer
            .normalize(487.35, ReadingSource::Manual, ts())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn normalize_rejects_non_finite_and_negative() {
        let normalizer = PriceNormalizer::new(PriceUnit::PerThousand, "GTQ");
        assert_eq!(
            normalizer.normalize(-1.0, ReadingSource::Manual, ts()),
            Err(InvalidPriceError::Negative(-1.0))
        );
        assert!(matches!(
            normalizer.normalize(f64::NAN, ReadingSource::Manual, ts()),
            Err(InvalidPriceError::NotFinite(_))
        ));
        assert!(matches!(
            normalizer.normalize(f64::INFINITY, ReadingSource::Manual, ts()),
            Err(InvalidPriceError::NotFinite(_))
        ));
    }

    #[test]
    fn percent_change_matches_expected_values() {
        assert_eq!(
            percent_change(Some(&reading(dec!(100))), &reading(dec!(110))),
            dec!(10)
        );
        assert_eq!(
            percent_change(Some(&reading(dec!(100))), &reading(dec!(90))),
            dec!(-10)
        );
        assert_eq!(percent_change(None, &reading(dec!(42))), Decimal::ZERO);
        assert_eq!(
            percent_change(Some(&reading(dec!(0))), &reading(dec!(42))),
            Decimal::ZERO
        );
        assert_eq!(
            percent_change(Some(&reading(dec!(450))), &reading(dec!(520))),
            dec!(15.56)
        );
    }

    #[test]
    fn reading_serializes_price_as_number() {
        let value = serde_json::to_value(reading(dec!(520))).unwrap();
        assert!(value["price"].is_number());
        assert_eq!(value["unit"], "per-thousand");
        assert_eq!(value["source"], "scheduled-job");
        let back: PriceReading = serde_json::from_value(value).unwrap();
        assert_eq!(back.price, dec!(520));
    }

    #[test]
    fn unit_parses_from_config_strings() {
        assert_eq!("per-thousand".parse::<PriceUnit>().unwrap(), PriceUnit::PerThousand);
        assert_eq!("PER_UNIT".parse::<PriceUnit>().unwrap(), PriceUnit::PerUnit);
        assert!("per-ton".parse::<PriceUnit>().is_err());
    }
}
