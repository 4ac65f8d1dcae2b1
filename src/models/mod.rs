use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// End date carried by every open (current) reference-data row
pub fn open_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}

/// Source tag written on prices copied forward from the prior trading date
pub const REPEAT_SOURCE: &str = "repeat";

/// Security reference data, one row per validity interval
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Security {
    pub uid: Option<i64>,
    pub ticker: String,
    pub security_name: Option<String>,
    pub exchange: Option<String>,
    pub bb_ticker: Option<String>,
    pub sedol: Option<String>,
    pub isin: Option<String>,
    pub cusip: Option<String>,
    pub ric: Option<String>,
    pub ibes_ticker: Option<String>,
    pub currency_code: Option<String>,
    pub gics: Option<String>,
    pub icb: Option<String>,
    pub country: Option<String>,
    pub security_type: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub source: String,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Security {
    /// Create an open row with only the ticker and source filled in
    pub fn new(ticker: &str, source: &str, start_date: NaiveDate) -> Self {
        Self {
            uid: None,
            ticker: ticker.to_string(),
            security_name: None,
            exchange: None,
            bb_ticker: None,
            sedol: None,
            isin: None,
            cusip: None,
            ric: None,
            ibes_ticker: None,
            currency_code: None,
            gics: None,
            icb: None,
            country: None,
            security_type: None,
            start_date,
            end_date: open_end_date(),
            source: source.to_string(),
            last_updated: None,
        }
    }

    /// Whether the row is the current one for its uid
    pub fn is_open(&self) -> bool {
        self.end_date == open_end_date()
    }

    /// Whether the half-open validity interval `[start_date, end_date)` covers the date
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date < self.end_date
    }

    /// Compare tracked attributes, ignoring uid, source, validity dates and `last_updated`
    pub fn attributes_differ(&self, other: &Security) -> bool {
        self.ticker != other.ticker
            || self.security_name != other.security_name
            || self.exchange != other.exchange
            || self.bb_ticker != other.bb_ticker
            || self.sedol != other.sedol
            || self.isin != other.isin
            || self.cusip != other.cusip
            || self.ric != other.ric
            || self.ibes_ticker != other.ibes_ticker
            || self.currency_code != other.currency_code
            || self.gics != other.gics
            || self.icb != other.icb
            || self.country != other.country
            || self.security_type != other.security_type
    }
}

/// Whether a reconciled security was already known or newly created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityStatus {
    New,
    Exist,
}

impl SecurityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityStatus::New => "new",
            SecurityStatus::Exist => "exist",
        }
    }
}

/// Daily price bar keyed by (quote_date, uid)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub quote_date: NaiveDate,
    pub uid: i64,
    pub currency_code: Option<String>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub shares_os: Option<f64>,
    pub volume: Option<f64>,
    pub adj_factor: f64,
    pub accum_adj_factor: f64,
    pub accum_index: f64,
    pub bid_ask_spread: Option<f64>,
    pub source: String,
}

/// Cash dividend keyed by uid and ex-date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dividend {
    pub uid: i64,
    pub ex_date: NaiveDate,
    pub payable_date: Option<NaiveDate>,
    pub gross_amount: f64,
    pub net_amount: f64,
    pub source: String,
}

/// ICB sector lookup row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcbSector {
    pub code: String,
    pub name: String,
}

/// Business-day calendar row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeDate {
    pub quote_date: NaiveDate,
    pub next_trade_date: Option<NaiveDate>,
    pub next_eom_date: NaiveDate,
    /// Day of week counted from Sunday = 0
    pub weekday: u32,
    pub eom: bool,
    pub mom: bool,
    pub counter: i64,
}

/// Prices and dividends for one quote date, as produced by a price source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceBatch {
    pub prices: Vec<PriceBar>,
    pub dividends: Vec<Dividend>,
    /// Securities first seen by the source, stored together with the prices
    pub securities: Vec<Security>,
}

impl PriceBatch {
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// Configuration for the application
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub settings_path: String,
    pub scrape_rate_limit_per_minute: u32,
    pub nasdaq_base_url: String,
    pub advfn_base_url: String,
    pub quandl_base_url: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        Ok(Config {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "equities.db".to_string()),
            settings_path: std::env::var("SETTINGS_PATH")
                .unwrap_or_else(|_| "data_source.json".to_string()),
            scrape_rate_limit_per_minute: std::env::var("SCRAPE_RATE_LIMIT_PER_MINUTE")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .map_err(|e| anyhow::anyhow!("SCRAPE_RATE_LIMIT_PER_MINUTE must be a number: {}", e))?,
            nasdaq_base_url: std::env::var("NASDAQ_BASE_URL")
                .unwrap_or_else(|_| "http://www.nasdaq.com".to_string()),
            advfn_base_url: std::env::var("ADVFN_BASE_URL")
                .unwrap_or_else(|_| "http://au.advfn.com".to_string()),
            quandl_base_url: std::env::var("QUANDL_BASE_URL")
                .unwrap_or_else(|_| "https://www.quandl.com".to_string()),
        })
    }
}
