//! CLI entry point for the ILI ETL service.
//!
//! Provides subcommands for serving the HTTP API, running a one-off ETL
//! pull, printing summary statistics, and exporting the stored dataset.

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use ili_etl::aggregate::{Aggregator, QueryParams};
use ili_etl::api::{AppState, build_router};
use ili_etl::config::Config;
use ili_etl::etl::{EtlRequest, EtlRunner, RegionSelection};
use ili_etl::fetch::{BasicClient, Fetcher, FluViewFetcher, auth::UrlParam};
use ili_etl::output::{print_json, write_csv_file};
use ili_etl::store::Store;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "ili_etl")]
#[command(about = "Weekly ILI surveillance ETL and query service", long_about = None)]
struct Cli {
    /// SQLite database file (overrides DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FilterArgs {
    /// Two-letter region code
    #[arg(short, long)]
    region: Option<String>,

    /// Inclusive start date (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<String>,

    /// Inclusive end date (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<String>,
}

impl From<FilterArgs> for QueryParams {
    fn from(args: FilterArgs) -> Self {
        QueryParams {
            region: args.region,
            start_date: args.start_date,
            end_date: args.end_date,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Address to listen on (overrides BIND_ADDR)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Run one ETL pull and upsert the results
    Run {
        /// Region code, comma-separated codes, or "all"
        #[arg(short, long, default_value = "MA")]
        region: String,

        /// Inclusive start date (YYYY-MM-DD)
        #[arg(long)]
        start_date: NaiveDate,

        /// Inclusive end date (YYYY-MM-DD)
        #[arg(long)]
        end_date: NaiveDate,
    },
    /// Print summary statistics as JSON
    Stats {
        #[command(flatten)]
        filters: FilterArgs,

        /// Run ETL for the window when nothing is stored yet
        #[arg(long, default_value_t = false)]
        fetch_on_miss: bool,
    },
    /// Write the filtered dataset to a CSV file
    Export {
        /// CSV file to write
        #[arg(short, long, default_value = "cleaned.csv")]
        output: PathBuf,

        #[command(flatten)]
        filters: FilterArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/ili_etl.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("ili_etl.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(tracing::Level::INFO.into()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::from_env("RUST_LOG_JSON").add_directive(tracing::Level::DEBUG.into()),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind_addr.clone());
            let runner = build_runner(&config).await?;
            let app = build_router(AppState::new(runner));

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!(addr = %bind, "Listening");
            axum::serve(listener, app).await?;
        }
        Commands::Run {
            region,
            start_date,
            end_date,
        } => {
            let runner = build_runner(&config).await?;
            let request = EtlRequest {
                regions: RegionSelection::parse(&region)?,
                start_date,
                end_date,
            };
            let report = runner.run(&request).await?;
            print_json(&report)?;
        }
        Commands::Stats {
            filters,
            fetch_on_miss,
        } => {
            let params = QueryParams::from(filters);
            if fetch_on_miss {
                let runner = build_runner(&config).await?;
                let (stats, report) = runner
                    .stats_with_fetch_on_miss(&params.to_filter()?)
                    .await?;
                if let Some(report) = report {
                    info!(rows_loaded = report.rows_loaded, "Fetched on miss");
                }
                print_json(&stats)?;
            } else {
                let store = Store::open(&config.database_path).await?;
                let stats = Aggregator::new(store).stats(&params).await?;
                print_json(&stats)?;
            }
        }
        Commands::Export { output, filters } => {
            let store = Store::open(&config.database_path).await?;
            let rows = Aggregator::new(store)
                .export(&QueryParams::from(filters))
                .await?;
            write_csv_file(&output, &rows)?;
            info!(path = %output.display(), rows = rows.len(), "Export written");
        }
    }

    Ok(())
}

/// Opens the store and wires the FluView fetcher, adding the API key when
/// one is configured.
async fn build_runner(config: &Config) -> Result<EtlRunner> {
    let store = Store::open(&config.database_path).await?;
    let client = BasicClient::with_timeouts(Duration::from_secs(30), Duration::from_secs(10))?;

    let fetcher: Arc<dyn Fetcher> = match &config.api_key {
        Some(key) => Arc::new(FluViewFetcher::new(
            UrlParam::api_key(client, key.clone()),
            &config.base_url,
        )),
        None => {
            warn!("DELPHI_API_KEY not set, upstream requests are unauthenticated");
            Arc::new(FluViewFetcher::new(client, &config.base_url))
        }
    };

    Ok(EtlRunner::new(store, fetcher).with_concurrency(config.concurrency))
}
