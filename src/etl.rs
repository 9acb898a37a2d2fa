//! ETL orchestration: fetch every requested region, normalize the combined
//! batch, and upsert it in one transaction.
//!
//! A run moves through [`EtlStage::Fetching`], [`EtlStage::Normalizing`] and
//! [`EtlStage::Upserting`] to [`EtlStage::Done`]; any fatal error ends it in
//! [`EtlStage::Failed`]. Per-region fetch failures are recorded in the report
//! and only become fatal when every region fails.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, error, info, warn};

use crate::epiweek::{Epiweek, epiweeks_between};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::normalize::normalize_batch;
use crate::stats::SummaryStats;
use crate::store::{ObservationFilter, Store};

/// Region codes covered by `all`: the 50 states plus DC.
pub const SUPPORTED_REGIONS: [&str; 51] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "DC", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ", "NM",
    "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT", "VA", "WA",
    "WV", "WI", "WY",
];

pub const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSelection {
    All,
    Only(Vec<String>),
}

impl RegionSelection {
    /// Parses `all` / `*` or a comma-separated list of two-letter codes.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("all") || trimmed == "*" {
            return Ok(Self::All);
        }

        let mut regions: Vec<String> = Vec::new();
        for part in trimmed.split(',') {
            let code = part.trim().to_ascii_uppercase();
            if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
                return Err(Error::InvalidRegion(part.trim().to_string()));
            }
            if !regions.contains(&code) {
                regions.push(code);
            }
        }
        Ok(Self::Only(regions))
    }

    pub fn regions(&self) -> Vec<String> {
        match self {
            Self::All => SUPPORTED_REGIONS.iter().map(|r| r.to_string()).collect(),
            Self::Only(regions) => regions.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EtlRequest {
    pub regions: RegionSelection,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Progress of a run, reported in logs when a run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtlStage {
    Fetching,
    Normalizing,
    Upserting,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionFailure {
    pub region: String,
    pub reason: String,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct EtlReport {
    /// Rows inserted or replaced by the upsert. Zero means the range had no
    /// valid data, which is not an error.
    pub rows_loaded: u64,
    pub fetched: usize,
    pub rejected: usize,
    pub first_week: Option<NaiveDate>,
    pub last_week: Option<NaiveDate>,
    pub failures: Vec<RegionFailure>,
}

#[derive(Clone)]
pub struct EtlRunner {
    store: Store,
    fetcher: Arc<dyn Fetcher>,
    concurrency: usize,
}

impl EtlRunner {
    pub fn new(store: Store, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            fetcher,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Maximum number of region fetches in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    #[tracing::instrument(
        skip(self, request),
        fields(start = %request.start_date, end = %request.end_date)
    )]
    pub async fn run(&self, request: &EtlRequest) -> Result<EtlReport> {
        let mut stage = EtlStage::Fetching;
        match self.run_stages(request, &mut stage).await {
            Ok(report) => {
                info!(
                    rows_loaded = report.rows_loaded,
                    rejected = report.rejected,
                    failed_regions = report.failures.len(),
                    "ETL run complete"
                );
                Ok(report)
            }
            Err(e) => {
                let failed_at = std::mem::replace(&mut stage, EtlStage::Failed);
                error!(stage = ?stage, failed_at = ?failed_at, error = %e, "ETL run failed");
                Err(e)
            }
        }
    }

    async fn run_stages(&self, request: &EtlRequest, stage: &mut EtlStage) -> Result<EtlReport> {
        if request.start_date > request.end_date {
            return Err(Error::InvalidDateRange(
                "start_date must be <= end_date".to_string(),
            ));
        }
        let weeks = epiweeks_between(request.start_date, request.end_date).map_err(|e| {
            Error::InvalidDateRange(format!(
                "{} to {} has no epiweek codes: {e}",
                request.start_date, request.end_date
            ))
        })?;
        let (Some(first), Some(last)) = (weeks.first().copied(), weeks.last().copied()) else {
            return Err(Error::EmptyRange);
        };

        let regions = request.regions.regions();
        if regions.is_empty() {
            return Err(Error::InvalidRegion(String::new()));
        }
        info!(
            regions = regions.len(),
            first = %first,
            last = %last,
            "Fetching upstream records"
        );

        let (raw, failures) = self.fetch_all(&regions, first, last).await;
        if failures.len() == regions.len() {
            let summary = failures
                .iter()
                .map(|f| format!("{}: {}", f.region, f.reason))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Unreachable(summary));
        }

        *stage = EtlStage::Normalizing;
        let fetched = raw.len();
        let batch = normalize_batch(raw);
        info!(
            fetched,
            accepted = batch.rows.len(),
            rejected = batch.rejected,
            superseded = batch.superseded,
            "Normalized upstream records"
        );

        *stage = EtlStage::Upserting;
        let rows_loaded = self.store.upsert_many(&batch.rows).await?;
        if rows_loaded == 0 {
            warn!("ETL completed with no data loaded");
        }

        *stage = EtlStage::Done;
        let first_week = batch.rows.iter().map(|r| r.epiweek).min().map(|e| e.monday());
        let last_week = batch.rows.iter().map(|r| r.epiweek).max().map(|e| e.monday());

        Ok(EtlReport {
            rows_loaded,
            fetched,
            rejected: batch.rejected,
            first_week,
            last_week,
            failures,
        })
    }

    /// Fetches regions concurrently and returns their records concatenated in
    /// request order, independent of completion order.
    async fn fetch_all(
        &self,
        regions: &[String],
        first: Epiweek,
        last: Epiweek,
    ) -> (Vec<serde_json::Value>, Vec<RegionFailure>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(regions.len());

        for region in regions {
            let sem = semaphore.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let region = region.clone();
            let span = tracing::info_span!("fetch_region", region = %region);

            tasks.push(tokio::spawn(
                async move {
                    let _permit = sem.acquire().await.ok();
                    fetcher.fetch(&region, first, last).await
                }
                .instrument(span),
            ));
        }

        let mut raw = Vec::new();
        let mut failures = Vec::new();
        for (region, task) in regions.iter().zip(tasks) {
            let reason = match task.await {
                Ok(Ok(records)) => {
                    debug!(region = %region, records = records.len(), "Region fetched");
                    if records.is_empty() {
                        warn!(region = %region, "No data returned for region");
                    }
                    raw.extend(records);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("fetch task aborted: {e}"),
            };
            warn!(region = %region, reason = %reason, "Region fetch failed");
            failures.push(RegionFailure {
                region: region.clone(),
                reason,
            });
        }

        (raw, failures)
    }

    /// Fetch-on-miss policy: query stats, and if nothing matches run ETL for
    /// the filter's region (or every region) and date window, then query again.
    ///
    /// Without both window bounds there is nothing to fetch and the empty
    /// stats are returned as is.
    pub async fn stats_with_fetch_on_miss(
        &self,
        filter: &ObservationFilter,
    ) -> Result<(SummaryStats, Option<EtlReport>)> {
        let stats = self.store.query_stats(filter).await?;
        if !stats.is_empty() {
            return Ok((stats, None));
        }
        let (Some(start_date), Some(end_date)) = (filter.start_date, filter.end_date) else {
            return Ok((stats, None));
        };

        let regions = match &filter.region {
            Some(region) => RegionSelection::parse(region)?,
            None => RegionSelection::All,
        };
        info!("No stored rows for filter, running ETL");
        let report = self
            .run(&EtlRequest {
                regions,
                start_date,
                end_date,
            })
            .await?;

        let stats = self.store.query_stats(filter).await?;
        Ok((stats, Some(report)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::normalize::RawRecord;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves canned records per lower-case region; unknown regions fail.
    #[derive(Default)]
    struct StubFetcher {
        responses: HashMap<String, Vec<RawRecord>>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<(String, u32, u32)>>,
        completed: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn with(mut self, region: &str, records: Vec<RawRecord>) -> Self {
            self.responses.insert(region.to_string(), records);
            self
        }

        fn delayed(mut self, region: &str, delay: Duration) -> Self {
            self.delays.insert(region.to_string(), delay);
            self
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(
            &self,
            region: &str,
            start: Epiweek,
            end: Epiweek,
        ) -> std::result::Result<Vec<RawRecord>, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((region.to_string(), start.code(), end.code()));
            let key = region.to_ascii_lowercase();
            if let Some(delay) = self.delays.get(&key) {
                tokio::time::sleep(*delay).await;
            }
            self.completed.lock().unwrap().push(region.to_string());
            self.responses
                .get(&key)
                .cloned()
                .ok_or_else(|| FetchError::Upstream(format!("no route to {region}")))
        }
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn request(regions: &str, start: NaiveDate, end: NaiveDate) -> EtlRequest {
        EtlRequest {
            regions: RegionSelection::parse(regions).unwrap(),
            start_date: start,
            end_date: end,
        }
    }

    async fn runner(fetcher: StubFetcher) -> (EtlRunner, Arc<StubFetcher>) {
        let fetcher = Arc::new(fetcher);
        let store = Store::in_memory().await.unwrap();
        (EtlRunner::new(store, fetcher.clone()), fetcher)
    }

    #[test]
    fn test_region_selection() {
        assert_eq!(RegionSelection::parse("all").unwrap(), RegionSelection::All);
        assert_eq!(RegionSelection::parse("*").unwrap(), RegionSelection::All);
        assert_eq!(RegionSelection::All.regions().len(), 51);
        assert_eq!(
            RegionSelection::parse("ma, NY,ma").unwrap(),
            RegionSelection::Only(vec!["MA".into(), "NY".into()])
        );
        assert!(matches!(
            RegionSelection::parse("mass"),
            Err(Error::InvalidRegion(_))
        ));
    }

    #[tokio::test]
    async fn test_run_loads_rows_and_requests_covering_weeks() {
        let (runner, fetcher) = runner(StubFetcher::default().with(
            "ma",
            vec![
                json!({"region": "ma", "epiweek": 202401, "wili": 1.0}),
                json!({"region": "ma", "epiweek": 202402, "wili": 2.0}),
                json!({"region": "ma", "epiweek": 202403, "wili": 3.0}),
            ],
        ))
        .await;

        let report = runner
            .run(&request("MA", ymd(2024, 1, 1), ymd(2024, 1, 21)))
            .await
            .unwrap();

        assert_eq!(report.rows_loaded, 3);
        assert_eq!(report.rejected, 0);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("stage").is_none());
        assert_eq!(report.first_week, Some(ymd(2024, 1, 1)));
        assert_eq!(report.last_week, Some(ymd(2024, 1, 15)));
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            vec![("MA".to_string(), 202401, 202403)]
        );
    }

    #[tokio::test]
    async fn test_negative_value_is_rejected_not_fatal() {
        let (runner, _) = runner(StubFetcher::default().with(
            "ma",
            vec![
                json!({"region": "ma", "epiweek": 202401, "wili": 1.0}),
                json!({"region": "ma", "epiweek": 202402, "wili": -1.0}),
            ],
        ))
        .await;

        let report = runner
            .run(&request("MA", ymd(2024, 1, 1), ymd(2024, 1, 14)))
            .await
            .unwrap();
        assert_eq!(report.rows_loaded, 1);
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn test_partial_region_failure_is_reported() {
        let (runner, _) = runner(StubFetcher::default().with(
            "ma",
            vec![json!({"region": "ma", "epiweek": 202401, "wili": 1.0})],
        ))
        .await;

        let report = runner
            .run(&request("MA,NY", ymd(2024, 1, 1), ymd(2024, 1, 7)))
            .await
            .unwrap();
        assert_eq!(report.rows_loaded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].region, "NY");
        assert!(report.failures[0].reason.contains("no route"));
    }

    #[tokio::test]
    async fn test_total_fetch_failure_is_fatal() {
        let (runner, _) = runner(StubFetcher::default()).await;
        let err = runner
            .run(&request("MA,NY", ymd(2024, 1, 1), ymd(2024, 1, 7)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));

        let stats = runner
            .store()
            .query_stats(&ObservationFilter::default())
            .await
            .unwrap();
        assert_eq!(stats.count, 0);
    }

    #[tokio::test]
    async fn test_empty_upstream_is_not_an_error() {
        let (runner, _) = runner(StubFetcher::default().with("ma", vec![])).await;
        let report = runner
            .run(&request("MA", ymd(2024, 1, 1), ymd(2024, 1, 7)))
            .await
            .unwrap();
        assert_eq!(report.rows_loaded, 0);
        assert_eq!(report.first_week, None);
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let (runner, fetcher) = runner(StubFetcher::default()).await;
        let err = runner
            .run(&request("MA", ymd(2025, 2, 1), ymd(2025, 1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDateRange(ref m) if m == "start_date must be <= end_date"));
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_outside_four_digit_years_is_rejected() {
        let (runner, fetcher) = runner(StubFetcher::default()).await;
        for (start, end) in [
            (ymd(-1, 6, 1), ymd(2024, 1, 7)),
            (ymd(0, 6, 1), ymd(0, 6, 30)),
            (ymd(2024, 1, 1), ymd(10000, 6, 1)),
        ] {
            let err = runner.run(&request("MA", start, end)).await.unwrap_err();
            assert!(matches!(err, Error::InvalidDateRange(_)), "{start}..{end}: {err:?}");
        }
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_wins_across_regions_in_request_order() {
        // NY's payload also carries an MA row for the same week; NY is
        // requested after MA so its value must win, even though MA answers
        // last.
        let (runner, fetcher) = runner(
            StubFetcher::default()
                .with("ma", vec![json!({"region": "ma", "epiweek": 202401, "wili": 1.0})])
                .with("ny", vec![json!({"region": "ma", "epiweek": 202401, "wili": 7.0})])
                .delayed("ma", Duration::from_millis(50)),
        )
        .await;

        let report = runner
            .run(&request("MA,NY", ymd(2024, 1, 1), ymd(2024, 1, 7)))
            .await
            .unwrap();
        assert_eq!(report.rows_loaded, 1);
        assert_eq!(*fetcher.completed.lock().unwrap(), vec!["NY", "MA"]);

        let rows = runner
            .store()
            .export_rows(&ObservationFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 7.0);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let (runner, _) = runner(StubFetcher::default().with(
            "ma",
            vec![json!({"region": "ma", "epiweek": 202401, "wili": 1.0})],
        ))
        .await;
        let req = request("MA", ymd(2024, 1, 1), ymd(2024, 1, 7));
        runner.run(&req).await.unwrap();
        runner.run(&req).await.unwrap();

        let stats = runner
            .store()
            .query_stats(&ObservationFilter::default())
            .await
            .unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn test_fetch_on_miss_runs_once_then_serves_from_store() {
        let (runner, fetcher) = runner(StubFetcher::default().with(
            "ma",
            vec![
                json!({"region": "ma", "epiweek": 202401, "wili": 1.0}),
                json!({"region": "ma", "epiweek": 202402, "wili": 3.0}),
            ],
        ))
        .await;
        let filter = ObservationFilter::default()
            .region("ma")
            .between(Some(ymd(2024, 1, 1)), Some(ymd(2024, 1, 14)));

        let (stats, report) = runner.stats_with_fetch_on_miss(&filter).await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(report.map(|r| r.rows_loaded), Some(2));

        let (stats, report) = runner.stats_with_fetch_on_miss(&filter).await.unwrap();
        assert_eq!(stats.count, 2);
        assert!(report.is_none());
        assert_eq!(fetcher.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_on_miss_without_window_does_not_fetch() {
        let (runner, fetcher) = runner(StubFetcher::default()).await;
        let (stats, report) = runner
            .stats_with_fetch_on_miss(&ObservationFilter::default())
            .await
            .unwrap();
        assert!(stats.is_empty());
        assert!(report.is_none());
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }
}
