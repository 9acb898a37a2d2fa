//! Record normalizer: turns raw upstream records into canonical
//! [`Observation`] rows.
//!
//! Rules run in a fixed order (date, region, value) and the first failure
//! wins. Rejections never abort a batch.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::epiweek::Epiweek;
use crate::error::{Error, Result};

/// Metric literal for weighted ILI percentage.
pub const METRIC_ILI: &str = "ili";

/// One raw upstream record, as returned by the fetcher.
pub type RawRecord = Value;

/// The canonical persisted row. Field order is the export column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub region: String,
    pub value: f64,
    pub metric: String,
    pub source_id: String,
    pub epiweek: Epiweek,
}

impl Observation {
    /// Builds a row from already-validated parts, deriving `date` and
    /// `source_id` from the epiweek and region.
    pub fn new(region: &str, epiweek: Epiweek, value: f64) -> Self {
        let region = region.to_ascii_uppercase();
        Observation {
            date: epiweek.monday(),
            source_id: source_id(&region, epiweek),
            region,
            value,
            metric: METRIC_ILI.to_string(),
            epiweek,
        }
    }
}

/// `<lowercase region>-<YYYYWW>`
pub fn source_id(region: &str, epiweek: Epiweek) -> String {
    format!("{}-{}", region.to_ascii_lowercase(), epiweek)
}

/// Normalizes a single raw record.
pub fn normalize_record(raw: &RawRecord) -> Result<Observation> {
    let epiweek = parse_epiweek(raw)?;
    let region = parse_region(raw)?;
    let value = parse_value(raw)?;
    Ok(Observation::new(&region, epiweek, value))
}

fn parse_epiweek(raw: &RawRecord) -> Result<Epiweek> {
    let from_code = match raw.get("epiweek") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|c| u32::try_from(c).ok())
            .and_then(|c| Epiweek::from_code(c).ok()),
        Some(Value::String(s)) => s.parse::<Epiweek>().ok(),
        _ => None,
    };
    if let Some(epiweek) = from_code {
        return Ok(epiweek);
    }

    let date = ["date", "release_date"]
        .iter()
        .filter_map(|key| raw.get(*key).and_then(Value::as_str))
        .find_map(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        .ok_or_else(|| {
            Error::Parse(format!(
                "no valid epiweek or date in record (epiweek = {})",
                raw.get("epiweek").unwrap_or(&Value::Null)
            ))
        })?;
    Epiweek::containing(date).map_err(|e| Error::Parse(format!("date {date}: {e}")))
}

fn parse_region(raw: &RawRecord) -> Result<String> {
    let region = match raw.get("region") {
        Some(Value::String(s)) => s.trim().to_ascii_uppercase(),
        Some(other) => return Err(Error::InvalidRegion(other.to_string())),
        None => return Err(Error::InvalidRegion(String::new())),
    };
    if region.len() == 2 && region.bytes().all(|b| b.is_ascii_alphabetic()) {
        Ok(region)
    } else {
        Err(Error::InvalidRegion(region))
    }
}

fn parse_value(raw: &RawRecord) -> Result<f64> {
    let field = raw
        .get("wili")
        .filter(|v| !v.is_null())
        .or_else(|| raw.get("value"));

    let value = match field {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match value {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Some(v) => Err(Error::InvalidValue(v.to_string())),
        None => Err(Error::InvalidValue(
            field.map(Value::to_string).unwrap_or_else(|| "missing".into()),
        )),
    }
}

/// Output of [`normalize_batch`].
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    /// Accepted rows, one per `source_id`, ordered by `source_id`.
    pub rows: Vec<Observation>,
    pub rejected: usize,
    /// Accepted records that were superseded by a later record with the same key.
    pub superseded: usize,
}

/// Normalizes a batch in input order.
///
/// When two records share a `source_id` the later one wins.
pub fn normalize_batch<I>(raw: I) -> NormalizedBatch
where
    I: IntoIterator<Item = RawRecord>,
{
    let mut by_key: BTreeMap<String, Observation> = BTreeMap::new();
    let mut batch = NormalizedBatch::default();

    for (index, record) in raw.into_iter().enumerate() {
        match normalize_record(&record) {
            Ok(obs) => {
                if by_key.insert(obs.source_id.clone(), obs).is_some() {
                    batch.superseded += 1;
                }
            }
            Err(e) => {
                debug!(index, error = %e, "Rejected upstream record");
                batch.rejected += 1;
            }
        }
    }

    batch.rows = by_key.into_values().collect();
    batch
}
