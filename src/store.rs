//! SQLite-backed observation store.
//!
//! Owns the `observations` table. Writes are keyed by `source_id` and
//! replace the whole row; each [`Store::upsert_many`] call is one
//! transaction.

use chrono::{Datelike, NaiveDate};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::epiweek::Epiweek;
use crate::error::{Error, Result};
use crate::normalize::{METRIC_ILI, Observation};
use crate::stats::{RegionMeans, RowPage, SummaryStats};

pub const TABLE: &str = "observations";

const COLUMNS: &str = "date, region, value, metric, source_id, epiweek";

const UPSERT_SQL: &str = "
    INSERT INTO observations (date, region, value, metric, source_id, epiweek)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT(source_id) DO UPDATE SET
        date = excluded.date,
        region = excluded.region,
        value = excluded.value,
        metric = excluded.metric,
        epiweek = excluded.epiweek";

/// Region and date-window filter shared by every read query.
///
/// Dates are matched at epiweek granularity: a row is in range when its
/// epiweek lies between the epiweeks containing `start_date` and `end_date`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationFilter {
    pub region: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl ObservationFilter {
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if let Some(region) = &self.region {
            qb.push(" AND region = ")
                .push_bind(region.trim().to_ascii_uppercase());
        }
        if let Some(start) = self.start_date {
            qb.push(" AND epiweek >= ").push_bind(week_bound(start));
        }
        if let Some(end) = self.end_date {
            qb.push(" AND epiweek <= ").push_bind(week_bound(end));
        }
    }
}

/// Epiweek code used as a filter bound. Dates outside the encodable years
/// sort below or above every stored code.
fn week_bound(date: NaiveDate) -> i64 {
    match Epiweek::containing(date) {
        Ok(week) => i64::from(week.code()),
        Err(_) if date.year() < 1 => -1,
        Err(_) => i64::MAX,
    }
}

#[derive(sqlx::FromRow)]
struct ObservationRow {
    date: NaiveDate,
    region: String,
    value: f64,
    metric: String,
    source_id: String,
    epiweek: Option<i64>,
}

impl TryFrom<ObservationRow> for Observation {
    type Error = Error;

    fn try_from(row: ObservationRow) -> Result<Self> {
        let epiweek = match row
            .epiweek
            .and_then(|c| u32::try_from(c).ok())
            .and_then(|c| Epiweek::from_code(c).ok())
        {
            Some(week) => week,
            None => Epiweek::containing(row.date)?,
        };
        Ok(Observation {
            date: row.date,
            region: row.region,
            value: row.value,
            metric: row.metric,
            source_id: row.source_id,
            epiweek,
        })
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database file at `path` and migrates it.
    pub async fn open(path: &Path) -> Result<Self> {
        let newly_created = !path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&url).await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        if newly_created {
            info!(path = %path.display(), "Initialized new database");
        } else {
            info!(path = %path.display(), "Opened existing database");
        }

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database. The pool holds a single connection that
    /// never expires, since each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wraps an existing pool without migrating.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the table and indexes, adds the `epiweek` column to legacy
    /// tables, and backfills rows that predate it. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS observations (
                date      TEXT,
                region    TEXT,
                value     REAL,
                metric    TEXT,
                source_id TEXT PRIMARY KEY,
                epiweek   INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let columns: Vec<String> = sqlx::query("PRAGMA table_info(observations)")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.get::<String, _>(1))
            .collect();
        if !columns.iter().any(|c| c == "epiweek") {
            info!("Adding epiweek column to legacy observations table");
            sqlx::query("ALTER TABLE observations ADD COLUMN epiweek INTEGER")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_observations_date ON observations (date)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_observations_region ON observations (region)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_observations_epiweek ON observations (epiweek)",
        )
        .execute(&self.pool)
        .await?;

        self.backfill_epiweeks().await
    }

    /// Derives `epiweek` from the `source_id` suffix for rows missing it and
    /// resets `date` to that week's Monday. Unparseable rows are left alone.
    async fn backfill_epiweeks(&self) -> Result<()> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT source_id FROM observations WHERE epiweek IS NULL")
                .fetch_all(&self.pool)
                .await?;
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut fixed = 0usize;
        for source_id in &ids {
            let parsed = source_id
                .rsplit('-')
                .next()
                .and_then(|suffix| suffix.parse::<Epiweek>().ok());
            let Some(epiweek) = parsed else {
                warn!(source_id, "Cannot derive epiweek from source_id, leaving row as is");
                continue;
            };
            sqlx::query("UPDATE observations SET epiweek = ?, date = ? WHERE source_id = ?")
                .bind(i64::from(epiweek.code()))
                .bind(epiweek.monday())
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
            fixed += 1;
        }
        tx.commit().await?;

        info!(fixed, pending = ids.len(), "Backfilled epiweek column");
        Ok(())
    }

    /// Inserts or fully replaces each row keyed by `source_id`, all in one
    /// transaction. Returns the number of rows inserted or replaced.
    #[tracing::instrument(skip_all, fields(rows = rows.len()))]
    pub async fn upsert_many(&self, rows: &[Observation]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for row in rows {
            affected += sqlx::query(UPSERT_SQL)
                .bind(row.date)
                .bind(row.region.to_ascii_uppercase())
                .bind(row.value)
                .bind(&row.metric)
                .bind(&row.source_id)
                .bind(i64::from(row.epiweek.code()))
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!(affected, "Upsert committed");
        Ok(affected)
    }

    /// One page of matching rows ordered by date then `source_id`, plus the
    /// total match count ignoring `limit`/`offset`.
    pub async fn query_rows(
        &self,
        filter: &ObservationFilter,
        limit: i64,
        offset: i64,
    ) -> Result<RowPage> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM observations");
        filter.push_where(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM observations"));
        filter.push_where(&mut qb);
        qb.push(" ORDER BY date ASC, source_id ASC LIMIT ")
            .push_bind(limit.max(0))
            .push(" OFFSET ")
            .push_bind(offset.max(0));
        let rows = qb
            .build_query_as::<ObservationRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Observation::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(RowPage { total, rows })
    }

    pub async fn query_stats(&self, filter: &ObservationFilter) -> Result<SummaryStats> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*), MIN(value), MAX(value), MIN(date), MAX(date) FROM observations",
        );
        filter.push_where(&mut qb);
        let (count, min, max, start, end): (
            i64,
            Option<f64>,
            Option<f64>,
            Option<NaiveDate>,
            Option<NaiveDate>,
        ) = qb.build_query_as().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT region FROM observations");
        filter.push_where(&mut qb);
        qb.push(" ORDER BY region ASC");
        let regions: Vec<String> = qb.build_query_scalar().fetch_all(&self.pool).await?;

        Ok(SummaryStats {
            count,
            min,
            max,
            start,
            end,
            regions,
        })
    }

    /// Mean `ili` value per region within the date window.
    pub async fn query_map(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<RegionMeans> {
        let filter = ObservationFilter::default().between(start_date, end_date);
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT region, AVG(value) FROM observations");
        filter.push_where(&mut qb);
        qb.push(" AND metric = ")
            .push_bind(METRIC_ILI)
            .push(" GROUP BY region ORDER BY region ASC");
        let rows: Vec<(String, f64)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    /// Every matching row ordered by date then `source_id`.
    pub async fn export_rows(&self, filter: &ObservationFilter) -> Result<Vec<Observation>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM observations"));
        filter.push_where(&mut qb);
        qb.push(" ORDER BY date ASC, source_id ASC");
        let rows = qb
            .build_query_as::<ObservationRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Observation::try_from).collect()
    }
}
