//! Error taxonomy shared by every stage of the pipeline.
//!
//! Row-level variants ([`Error::Parse`], [`Error::InvalidRegion`],
//! [`Error::InvalidValue`]) are recovered by the normalizer: the row is
//! dropped and counted. Everything else propagates to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid region: {0:?}")]
    InvalidRegion(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid epiweek: {0}")]
    InvalidEpiweek(String),

    #[error("date range resolves to no epiweeks")]
    EmptyRange,

    #[error("{0}")]
    InvalidDateRange(String),

    #[error("fetch failed for region {region}: {reason}")]
    FetchFailure { region: String, reason: String },

    #[error("upstream unreachable for every requested region: {0}")]
    Unreachable(String),

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("export failed: {0}")]
    Export(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that only invalidate a single upstream record.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            Error::Parse(_) | Error::InvalidRegion(_) | Error::InvalidValue(_)
        )
    }

    /// True for errors caused by caller-supplied parameters.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidEpiweek(_)
                | Error::EmptyRange
                | Error::InvalidDateRange(_)
                | Error::InvalidRegion(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
