//! Command line entry point for the equities ingestion toolkit.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_equities::api::{
    http_client, AdvfnScraper, AdvfnSecuritySource, ApiRateLimiter, NasdaqListingClient, QuandlWikiSource,
};
use rust_equities::models::Config;
use rust_equities::settings::{Settings, QUANDL_API_KEY};
use rust_equities::{pricing, reconciler, utils, DatabaseManagerSqlx, IngestError};

#[derive(Parser)]
#[command(name = "rust-equities")]
#[command(about = "Equity reference data and price ingestion", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    InitDb,

    /// Reconcile US securities from the NASDAQ listings and ADVFN
    UpdateSecurities {
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        /// Compute everything but write nothing
        #[arg(long)]
        debug: bool,
    },

    /// Load and correct one date of WIKI prices
    UpdatePrices {
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        #[arg(long)]
        debug: bool,
    },

    /// Load the whole WIKI table date by date
    BulkPrices {
        #[arg(long)]
        debug: bool,
    },

    /// Fill the business-day calendar
    LoadTradeDates {
        #[arg(long, value_parser = parse_date)]
        start: NaiveDate,
        #[arg(long, value_parser = parse_date)]
        end: NaiveDate,
    },

    /// Load ICB sector names from a `code,name` CSV
    LoadIcbSectors {
        #[arg(long)]
        file: String,
    },

    /// Show row counts
    Stats,
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y%m%d"))
        .map_err(|e| format!("invalid date '{}': {}", value, e))
}

fn quandl_source(config: &Config) -> Result<QuandlWikiSource> {
    let settings = Settings::load(&config.settings_path)?;
    let api_key = settings.require_str(QUANDL_API_KEY)?;
    Ok(QuandlWikiSource::new(http_client()?, &config.quandl_base_url, api_key))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("rust_equities={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    let database = DatabaseManagerSqlx::new(&config.database_path)
        .await
        .with_context(|| format!("failed to open database {}", config.database_path))?;
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::InitDb => {
            info!("✅ Schema ready in {}", config.database_path);
        }
        Commands::UpdateSecurities { date, debug } => {
            let client = http_client()?;
            let limiter = Arc::new(ApiRateLimiter::new(config.scrape_rate_limit_per_minute));
            let source = AdvfnSecuritySource::new(
                NasdaqListingClient::new(client.clone(), &config.nasdaq_base_url),
                AdvfnScraper::new(client, &config.advfn_base_url, limiter),
                utils::worker_count(1),
            );

            match reconciler::update(&database, &source, date.unwrap_or(today), debug).await {
                Ok(result) => println!(
                    "✅ {} securities: {} new, {} changed",
                    result.securities.len(),
                    result.new_count(),
                    result.changed_count()
                ),
                Err(e @ IngestError::Partial { .. }) => {
                    let collected = e.partial_securities().map_or(0, |s| s.len());
                    error!("❌ Security update aborted with {} securities collected: {}", collected, e);
                    return Err(anyhow!(e));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::UpdatePrices { date, debug } => {
            let source = quandl_source(&config)?;
            let batch = pricing::update(&database, &source, date.unwrap_or(today), debug).await?;
            println!("✅ {} prices, {} dividends", batch.prices.len(), batch.dividends.len());
        }
        Commands::BulkPrices { debug } => {
            let source = quandl_source(&config)?;
            let dates = source.bulk(&database, debug).await?;
            println!("✅ Processed {} dates", dates);
        }
        Commands::LoadTradeDates { start, end } => {
            let dates = utils::generate_trade_dates(start, end);
            let inserted = database.insert_trade_dates(&dates).await?;
            println!("✅ Loaded {} trade dates", inserted);
        }
        Commands::LoadIcbSectors { file } => {
            let sectors = utils::read_icb_sectors(&file)?;
            let inserted = database.insert_icb_sectors(&sectors).await?;
            println!("✅ Loaded {} ICB sectors", inserted);
        }
        Commands::Stats => {
            let mut stats: Vec<(String, i64)> = database.get_stats().await?.into_iter().collect();
            stats.sort();
            for (table, count) in stats {
                println!("{:<16} {}", table, count);
            }
            if let Some(latest) = database.get_latest_quote_date().await? {
                println!("{:<16} {}", "latest prices", latest);
            }
        }
    }

    database.close().await;
    Ok(())
}
