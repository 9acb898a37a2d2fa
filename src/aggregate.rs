//! Read-only query facade for presentation consumers.
//!
//! Validates raw string parameters and delegates to the [`Store`]. Bad dates
//! are rejected before any query runs.

use chrono::NaiveDate;
use serde::Deserialize;

use crate::epiweek::Epiweek;
use crate::error::{Error, Result};
use crate::normalize::Observation;
use crate::output::write_csv;
use crate::stats::{RegionMeans, RowPage, SummaryStats};
use crate::store::{ObservationFilter, Store};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Raw filter parameters as they arrive from a caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParams {
    pub region: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl QueryParams {
    pub fn to_filter(&self) -> Result<ObservationFilter> {
        let start_date = parse_date("start_date", self.start_date.as_deref())?;
        let end_date = parse_date("end_date", self.end_date.as_deref())?;
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if start > end {
                return Err(Error::InvalidDateRange(
                    "start_date must be <= end_date".to_string(),
                ));
            }
        }

        let region = self
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty() && !r.eq_ignore_ascii_case("all") && *r != "*")
            .map(str::to_ascii_uppercase);

        Ok(ObservationFilter {
            region,
            start_date,
            end_date,
        })
    }
}

/// Parses an optional `YYYY-MM-DD` value; blank counts as absent.
///
/// Dates that fall in no encodable epiweek (ISO years outside `1..=9999`)
/// are rejected.
pub fn parse_date(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>> {
    let s = match value.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(s) => s,
    };
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        Error::InvalidDateRange(format!("{field}: {s:?} is not a YYYY-MM-DD date"))
    })?;
    Epiweek::containing(date).map_err(|_| {
        Error::InvalidDateRange(format!("{field}: {s:?} is outside years 0001-9999"))
    })?;
    Ok(Some(date))
}

#[derive(Clone)]
pub struct Aggregator {
    store: Store,
}

impl Aggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn rows(&self, params: &QueryParams, limit: i64, offset: i64) -> Result<RowPage> {
        let filter = params.to_filter()?;
        self.store.query_rows(&filter, limit, offset).await
    }

    pub async fn stats(&self, params: &QueryParams) -> Result<SummaryStats> {
        let filter = params.to_filter()?;
        self.store.query_stats(&filter).await
    }

    /// Region means over the date window; any region filter is ignored.
    pub async fn map(&self, params: &QueryParams) -> Result<RegionMeans> {
        let filter = params.to_filter()?;
        self.store
            .query_map(filter.start_date, filter.end_date)
            .await
    }

    pub async fn export(&self, params: &QueryParams) -> Result<Vec<Observation>> {
        let filter = params.to_filter()?;
        self.store.export_rows(&filter).await
    }

    /// The filtered dataset rendered as CSV with a header row.
    pub async fn export_csv(&self, params: &QueryParams) -> Result<Vec<u8>> {
        let rows = self.export(params).await?;
        let mut buf = Vec::new();
        write_csv(&mut buf, &rows)?;
        Ok(buf)
    }
}
