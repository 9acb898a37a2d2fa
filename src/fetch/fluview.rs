use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{FetchError, Fetcher, HttpClient, fetch_json};
use crate::epiweek::Epiweek;
use crate::normalize::RawRecord;

pub const DEFAULT_BASE_URL: &str = "https://api.delphi.cmu.edu/epidata/fluview/";

/// Fetches weekly ILI records from the Delphi FluView endpoint.
pub struct FluViewFetcher<C> {
    client: C,
    base_url: String,
}

impl<C: HttpClient> FluViewFetcher<C> {
    pub fn new(client: C, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

/// Regions are sent lower-cased and the range as `YYYYWW-YYYYWW`.
pub fn request_url(
    base_url: &str,
    region: &str,
    start: Epiweek,
    end: Epiweek,
) -> Result<reqwest::Url, FetchError> {
    reqwest::Url::parse_with_params(
        base_url,
        &[
            ("regions", region.to_ascii_lowercase()),
            ("epiweeks", format!("{start}-{end}")),
        ],
    )
    .map_err(|e| FetchError::InvalidUrl(e.to_string()))
}

/// Unwraps an Epidata `{result, message, epidata}` envelope.
///
/// `result == 1` yields the records, a "no results"/"no data" message yields
/// none, and anything else is an upstream error.
pub fn parse_envelope(body: Value) -> Result<Vec<RawRecord>, FetchError> {
    if body.get("result").and_then(Value::as_i64) == Some(1) {
        return match body.get("epidata") {
            Some(Value::Array(records)) => Ok(records.clone()),
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(other) => Err(FetchError::Upstream(format!(
                "epidata is not an array: {other}"
            ))),
        };
    }

    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let lowered = message.to_lowercase();
    if lowered.contains("no results") || lowered.contains("no data") {
        return Ok(Vec::new());
    }

    Err(FetchError::Upstream(format!("FluView error: {message}")))
}

#[async_trait]
impl<C: HttpClient> Fetcher for FluViewFetcher<C> {
    #[tracing::instrument(skip(self, start, end), fields(start = %start, end = %end))]
    async fn fetch(
        &self,
        region: &str,
        start: Epiweek,
        end: Epiweek,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let url = request_url(&self.base_url, region, start, end)?;
        let body = fetch_json(&self.client, url).await?;
        let records = parse_envelope(body)?;
        debug!(records = records.len(), "FluView response decoded");
        Ok(records)
    }
}
