use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};
use url::Url;

use super::PriceSource;
use crate::database::EquityStore;
use crate::error::{IngestError, Result};
use crate::models::{Dividend, PriceBar, PriceBatch, Security};
use crate::pricing;
use crate::reconciler::assign_new_uids;

pub const WIKI_SOURCE: &str = "WIKI";
const WIKI_PRICES_PATH: &str = "/api/v3/datatables/WIKI/PRICES.json";
const INITIAL_ACCUM_INDEX: f64 = 1000.0;

#[derive(Debug, Deserialize)]
struct DatatableResponse {
    datatable: Datatable,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Datatable {
    data: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    next_cursor_id: Option<String>,
}

/// One WIKI PRICES row: ticker, date, open, high, low, close, volume,
/// ex-dividend, split ratio, then the adjusted columns
#[derive(Debug, Clone, PartialEq)]
pub struct WikiRow {
    pub ticker: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub ex_dividend: f64,
    pub split_ratio: f64,
}

impl WikiRow {
    pub fn from_values(row: &[Value]) -> Result<Self> {
        let number = |i: usize| row.get(i).and_then(Value::as_f64);
        let ticker = row
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| IngestError::Parse(format!("WIKI row without ticker: {:?}", row)))?;
        let date = row
            .get(1)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .ok_or_else(|| IngestError::Parse(format!("WIKI row without date: {:?}", row)))?;

        Ok(Self {
            ticker: ticker.to_string(),
            date,
            open: number(2),
            high: number(3),
            low: number(4),
            close: number(5),
            volume: number(6),
            ex_dividend: number(7).unwrap_or(0.0),
            split_ratio: number(8).unwrap_or(1.0),
        })
    }

    /// Multiplicative price adjustment: a 2-for-1 split gives 0.5
    pub fn adj_factor(&self) -> f64 {
        if self.split_ratio > 0.0 {
            1.0 / self.split_ratio
        } else {
            1.0
        }
    }
}

/// Quandl WIKI end-of-day prices
pub struct QuandlWikiSource {
    client: Client,
    base_url: String,
    api_key: String,
}

impl QuandlWikiSource {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// All rows for one date, or the whole table when `date` is `None`
    pub async fn fetch_rows(&self, date: Option<NaiveDate>) -> Result<Vec<WikiRow>> {
        let url = Url::parse(&format!("{}{}", self.base_url, WIKI_PRICES_PATH))?;
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![("api_key", self.api_key.clone())];
            if let Some(date) = date {
                params.push(("date", date.format("%Y%m%d").to_string()));
            }
            if let Some(cursor) = &cursor {
                params.push(("qopts.cursor_id", cursor.clone()));
            }

            let response: DatatableResponse = self
                .client
                .get(url.clone())
                .query(&params)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            for row in &response.datatable.data {
                rows.push(WikiRow::from_values(row)?);
            }
            debug!("WIKI page: {} rows, {} so far", response.datatable.data.len(), rows.len());

            cursor = response.meta.and_then(|m| m.next_cursor_id);
            if cursor.is_none() {
                break;
            }
        }

        Ok(rows)
    }

    /// Resolve uids and build the price batch for one date's rows. Unknown
    /// tickers get new uids and minimal securities, carried in the batch so they
    /// are written in the same transaction as the prices.
    pub async fn shape(&self, store: &dyn EquityStore, date: NaiveDate, rows: Vec<WikiRow>) -> Result<PriceBatch> {
        let mut uid_by_ticker: HashMap<String, i64> = HashMap::new();
        for security in store.get_stock_list(date).await? {
            let Some(uid) = security.uid else { continue };
            let entry = uid_by_ticker.entry(security.ticker.clone()).or_insert(uid);
            if *entry != uid {
                warn!("⚠️ Ticker {} maps to uids {} and {}, using the lower", security.ticker, *entry, uid);
                *entry = (*entry).min(uid);
            }
        }

        let unknown: Vec<String> = {
            let mut seen = HashSet::new();
            rows.iter()
                .filter(|row| !uid_by_ticker.contains_key(&row.ticker) && seen.insert(row.ticker.as_str()))
                .map(|row| row.ticker.clone())
                .collect()
        };

        let mut batch = PriceBatch::default();
        if !unknown.is_empty() {
            let mut new_uids = vec![None; unknown.len()];
            assign_new_uids(&mut new_uids, store.get_max_uid().await?);

            for (ticker, uid) in unknown.iter().zip(new_uids) {
                let mut security = Security::new(ticker, WIKI_SOURCE, date);
                security.uid = uid;
                security.bb_ticker = Some(format!("{} US Equity", ticker));
                security.currency_code = Some("USD".to_string());
                security.country = Some("US".to_string());
                security.security_type = Some("Common Stock".to_string());
                if let Some(uid) = uid {
                    uid_by_ticker.insert(ticker.clone(), uid);
                }
                batch.securities.push(security);
            }
            info!("🆕 {} new tickers from WIKI", batch.securities.len());
        }

        for row in rows {
            let Some(&uid) = uid_by_ticker.get(&row.ticker) else {
                continue;
            };

            if row.ex_dividend > 0.0 {
                batch.dividends.push(Dividend {
                    uid,
                    ex_date: row.date,
                    payable_date: None,
                    gross_amount: row.ex_dividend,
                    net_amount: row.ex_dividend,
                    source: WIKI_SOURCE.to_string(),
                });
            }

            batch.prices.push(PriceBar {
                quote_date: row.date,
                uid,
                currency_code: Some("USD".to_string()),
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                shares_os: None,
                volume: row.volume,
                adj_factor: row.adj_factor(),
                accum_adj_factor: 1.0,
                accum_index: INITIAL_ACCUM_INDEX,
                bid_ask_spread: None,
                source: WIKI_SOURCE.to_string(),
            });
        }

        Ok(batch)
    }

    /// Download the whole table and run the price corrector date by date,
    /// oldest first. Returns how many dates were processed.
    pub async fn bulk(&self, store: &dyn EquityStore, debug: bool) -> Result<usize> {
        let rows = self.fetch_rows(None).await?;
        info!("📦 WIKI bulk download: {} rows", rows.len());

        let mut by_date: BTreeMap<NaiveDate, Vec<WikiRow>> = BTreeMap::new();
        for row in rows {
            by_date.entry(row.date).or_default().push(row);
        }

        let dates = by_date.len();
        for (date, rows) in by_date {
            let batch = self.shape(store, date, rows).await?;
            pricing::apply(store, date, batch, debug).await?;
        }

        info!("✅ Bulk load processed {} dates", dates);
        Ok(dates)
    }
}

#[async_trait]
impl PriceSource for QuandlWikiSource {
    fn name(&self) -> &str {
        WIKI_SOURCE
    }

    async fn get(&self, store: &dyn EquityStore, date: NaiveDate) -> Result<PriceBatch> {
        let rows = self.fetch_rows(Some(date)).await?;
        self.shape(store, date, rows).await
    }
}
