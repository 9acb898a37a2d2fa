//! Upstream fetcher.
//!
//! [`Fetcher`] is the seam the ETL run depends on; [`FluViewFetcher`] is the
//! production implementation against the Delphi Epidata FluView endpoint.

mod basic;
mod client;
mod fluview;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use fluview::{DEFAULT_BASE_URL, FluViewFetcher, parse_envelope, request_url};

use async_trait::async_trait;
use thiserror::Error;

use crate::epiweek::Epiweek;
use crate::normalize::RawRecord;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Produces raw records for one region over an inclusive epiweek range.
///
/// Each call fetches the whole range again; there is no resumption.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        region: &str,
        start: Epiweek,
        end: Epiweek,
    ) -> Result<Vec<RawRecord>, FetchError>;
}

/// Issues a GET and decodes the body as JSON, failing on non-2xx status.
pub async fn fetch_json<C: HttpClient>(
    client: &C,
    url: reqwest::Url,
) -> Result<serde_json::Value, FetchError> {
    let req = reqwest::Request::new(reqwest::Method::GET, url);
    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.json().await?)
}
