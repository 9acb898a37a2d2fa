use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::normalize::Observation;

/// Summary statistics over a filtered set of observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryStats {
    pub count: i64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub regions: Vec<String>,
}

impl SummaryStats {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Mean value per region, keyed by region code.
pub type RegionMeans = BTreeMap<String, f64>;

/// A page of rows plus the unpaginated match count.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RowPage {
    pub total: i64,
    pub rows: Vec<Observation>,
}
