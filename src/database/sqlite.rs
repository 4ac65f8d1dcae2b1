use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::EquityStore;
use crate::error::{IngestError, Result};
use crate::models::{Dividend, IcbSector, PriceBar, Security, TradeDate};
use crate::pricing;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stock_info (
        uid INTEGER NOT NULL,
        ticker TEXT NOT NULL,
        security_name TEXT,
        exchange TEXT,
        bb_ticker TEXT,
        sedol TEXT,
        isin TEXT,
        cusip TEXT,
        ric TEXT,
        ibes_ticker TEXT,
        currency_code TEXT,
        gics TEXT,
        icb TEXT,
        country TEXT,
        security_type TEXT,
        start_date DATE NOT NULL,
        end_date DATE NOT NULL DEFAULT '9999-12-31',
        source TEXT NOT NULL,
        last_updated_date DATETIME
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_prices (
        quote_date DATE NOT NULL,
        uid INTEGER NOT NULL,
        currency_code TEXT,
        open REAL,
        high REAL,
        low REAL,
        close REAL,
        shares_os REAL,
        volume REAL,
        adj_factor REAL NOT NULL DEFAULT 1.0,
        accum_adj_factor REAL NOT NULL DEFAULT 1.0,
        accum_index REAL NOT NULL DEFAULT 1000.0,
        bid_ask_spread REAL,
        source TEXT NOT NULL,
        PRIMARY KEY (quote_date, uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dividends (
        uid INTEGER NOT NULL,
        ex_date DATE NOT NULL,
        payable_date DATE,
        gross_amount REAL NOT NULL,
        net_amount REAL NOT NULL,
        source TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trade_dates (
        quote_date DATE PRIMARY KEY,
        next_trade_date DATE,
        next_eom_date DATE NOT NULL,
        weekday INTEGER NOT NULL,
        eom_yn INTEGER NOT NULL,
        mom_yn INTEGER NOT NULL,
        counter INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS icb_sectors (
        code TEXT PRIMARY KEY,
        name TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_stock_info_uid ON stock_info(uid, start_date)",
    "CREATE INDEX IF NOT EXISTS idx_stock_info_ticker ON stock_info(ticker, exchange)",
    "CREATE INDEX IF NOT EXISTS idx_stock_info_dates ON stock_info(start_date, end_date)",
    "CREATE INDEX IF NOT EXISTS idx_stock_prices_uid ON stock_prices(uid, quote_date)",
    "CREATE INDEX IF NOT EXISTS idx_dividends_ex_date ON dividends(ex_date, uid)",
];

const SECURITY_COLUMNS: &str = "uid, ticker, security_name, exchange, bb_ticker, sedol, isin, cusip, ric, \
     ibes_ticker, currency_code, gics, icb, country, security_type, start_date, end_date, source, \
     last_updated_date";

const UID_CHUNK: usize = 500;

const PRICE_COLUMNS: &str = "quote_date, uid, currency_code, open, high, low, close, shares_os, volume, \
     adj_factor, accum_adj_factor, accum_index, bid_ask_spread, source";

/// SQLX-based store for equity reference data and prices
pub struct DatabaseManagerSqlx {
    database_path: String,
    pool: RwLock<SqlitePool>,
}

impl DatabaseManagerSqlx {
    /// Open (creating if needed) the SQLite database and ensure the schema exists
    pub async fn new(database_path: &str) -> Result<Self> {
        let database_path = database_path
            .strip_prefix("sqlite:")
            .unwrap_or(database_path)
            .to_string();

        let pool = Self::connect(&database_path).await?;
        info!("💾 Database initialized at {}", database_path);

        Ok(Self {
            database_path,
            pool: RwLock::new(pool),
        })
    }

    async fn connect(database_path: &str) -> std::result::Result<SqlitePool, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(database_path)
                    .create_if_missing(true),
            )
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(pool)
    }

    /// Current connection pool
    pub async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    /// Replace the pool with a fresh connection
    pub async fn reconnect(&self) -> Result<()> {
        let fresh = Self::connect(&self.database_path).await?;
        let stale = std::mem::replace(&mut *self.pool.write().await, fresh);
        stale.close().await;
        info!("🔌 Reconnected to {}", self.database_path);
        Ok(())
    }

    /// Run `operation`; on a connection-level failure reconnect once and run it once more
    async fn with_retry<T, F, Fut>(&self, name: &str, operation: F) -> Result<T>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match operation(self.pool().await).await {
            Ok(value) => Ok(value),
            Err(e) if is_transient(&e) => {
                warn!("⚠️ {} failed with {}, reconnecting and retrying once", name, e);
                self.reconnect().await?;
                Ok(operation(self.pool().await).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }

    /// All rows ever stored for a uid, oldest first
    pub async fn get_security_history(&self, uid: i64) -> Result<Vec<Security>> {
        self.with_retry("get_security_history", |pool| async move {
            let sql = format!(
                "SELECT {} FROM stock_info WHERE uid = ? ORDER BY start_date, end_date",
                SECURITY_COLUMNS
            );
            let rows = sqlx::query(&sql).bind(uid).fetch_all(&pool).await?;
            rows.iter()
                .map(security_from_row)
                .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    pub async fn get_dividends(&self, ex_date: NaiveDate) -> Result<Vec<Dividend>> {
        self.with_retry("get_dividends", |pool| async move {
            fetch_dividends(&pool, ex_date).await
        })
        .await
    }

    /// Replace the business-day calendar rows for the given dates
    pub async fn insert_trade_dates(&self, dates: &[TradeDate]) -> Result<u64> {
        self.with_retry("insert_trade_dates", |pool| async move {
            let mut tx = pool.begin().await?;
            let mut inserted = 0;
            for td in dates {
                inserted += sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO trade_dates
                        (quote_date, next_trade_date, next_eom_date, weekday, eom_yn, mom_yn, counter)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(td.quote_date)
                .bind(td.next_trade_date)
                .bind(td.next_eom_date)
                .bind(i64::from(td.weekday))
                .bind(td.eom)
                .bind(td.mom)
                .bind(td.counter)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(inserted)
        })
        .await
    }

    pub async fn get_trade_dates(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<TradeDate>> {
        self.with_retry("get_trade_dates", |pool| async move {
            let rows = sqlx::query(
                r#"
                SELECT quote_date, next_trade_date, next_eom_date, weekday, eom_yn, mom_yn, counter
                FROM trade_dates
                WHERE quote_date BETWEEN ? AND ?
                ORDER BY quote_date
                "#,
            )
            .bind(start)
            .bind(end)
            .fetch_all(&pool)
            .await?;

            rows.iter()
                .map(|r| {
                    Ok(TradeDate {
                        quote_date: r.try_get("quote_date")?,
                        next_trade_date: r.try_get("next_trade_date")?,
                        next_eom_date: r.try_get("next_eom_date")?,
                        weekday: r.try_get::<i64, _>("weekday")? as u32,
                        eom: r.try_get("eom_yn")?,
                        mom: r.try_get("mom_yn")?,
                        counter: r.try_get("counter")?,
                    })
                })
                .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    pub async fn insert_icb_sectors(&self, sectors: &[IcbSector]) -> Result<u64> {
        self.with_retry("insert_icb_sectors", |pool| async move {
            let mut tx = pool.begin().await?;
            let mut inserted = 0;
            for sector in sectors {
                inserted += sqlx::query("INSERT OR REPLACE INTO icb_sectors (code, name) VALUES (?, ?)")
                    .bind(&sector.code)
                    .bind(&sector.name)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(inserted)
        })
        .await
    }

    /// Row counts per table plus the latest price date
    pub async fn get_stats(&self) -> Result<HashMap<String, i64>> {
        self.with_retry("get_stats", |pool| async move {
            let mut stats = HashMap::new();
            for table in ["stock_info", "stock_prices", "dividends", "trade_dates", "icb_sectors"] {
                let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                    .fetch_one(&pool)
                    .await?;
                stats.insert(table.to_string(), count);
            }
            let open: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stock_info WHERE end_date = '9999-12-31'")
                .fetch_one(&pool)
                .await?;
            stats.insert("open_securities".to_string(), open);
            Ok::<_, sqlx::Error>(stats)
        })
        .await
    }

    pub async fn get_latest_quote_date(&self) -> Result<Option<NaiveDate>> {
        self.with_retry("get_latest_quote_date", |pool| async move {
            sqlx::query_scalar::<_, Option<NaiveDate>>("SELECT MAX(quote_date) FROM stock_prices")
                .fetch_one(&pool)
                .await
        })
        .await
    }
}

#[async_trait]
impl EquityStore for DatabaseManagerSqlx {
    async fn get_stock_list(&self, date: NaiveDate) -> Result<Vec<Security>> {
        self.with_retry("get_stock_list", |pool| async move {
            let sql = format!(
                "SELECT {} FROM stock_info WHERE start_date <= ? AND ? < end_date ORDER BY uid",
                SECURITY_COLUMNS
            );
            let rows = sqlx::query(&sql).bind(date).bind(date).fetch_all(&pool).await?;
            rows.iter()
                .map(security_from_row)
                .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    async fn get_stock_prices(&self, date: NaiveDate, uids: Option<&[i64]>) -> Result<Vec<PriceBar>> {
        let Some(uids) = uids else {
            return self
                .with_retry("get_stock_prices", |pool| async move { fetch_prices(&pool, date).await })
                .await;
        };
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut prices = Vec::with_capacity(uids.len());
        // SQLite caps bound parameters per statement
        for chunk in uids.chunks(UID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM stock_prices WHERE quote_date = ? AND uid IN ({}) ORDER BY uid",
                PRICE_COLUMNS, placeholders
            );
            let sql = sql.as_str();
            let rows = self
                .with_retry("get_stock_prices", |pool| async move {
                    let mut query = sqlx::query(sql).bind(date);
                    for uid in chunk {
                        query = query.bind(*uid);
                    }
                    let rows = query.fetch_all(&pool).await?;
                    rows.iter()
                        .map(price_from_row)
                        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
                })
                .await?;
            prices.extend(rows);
        }
        prices.sort_by_key(|p| p.uid);
        Ok(prices)
    }

    async fn get_max_uid(&self) -> Result<Option<i64>> {
        self.with_retry("get_max_uid", |pool| async move {
            sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(uid) FROM stock_info")
                .fetch_one(&pool)
                .await
        })
        .await
    }

    async fn get_prev_trade_date(&self, date: NaiveDate) -> Result<Option<NaiveDate>> {
        self.with_retry("get_prev_trade_date", |pool| async move {
            let from_calendar = sqlx::query_scalar::<_, Option<NaiveDate>>(
                "SELECT MAX(quote_date) FROM trade_dates WHERE quote_date < ?",
            )
            .bind(date)
            .fetch_one(&pool)
            .await?;

            if from_calendar.is_some() {
                return Ok(from_calendar);
            }

            sqlx::query_scalar::<_, Option<NaiveDate>>(
                "SELECT MAX(quote_date) FROM stock_prices WHERE quote_date < ?",
            )
            .bind(date)
            .fetch_one(&pool)
            .await
        })
        .await
    }

    async fn get_icb_sectors(&self) -> Result<Vec<IcbSector>> {
        self.with_retry("get_icb_sectors", |pool| async move {
            let rows = sqlx::query("SELECT code, name FROM icb_sectors ORDER BY code")
                .fetch_all(&pool)
                .await?;
            rows.iter()
                .map(|r| {
                    Ok(IcbSector {
                        code: r.try_get("code")?,
                        name: r.try_get("name")?,
                    })
                })
                .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    async fn insert_securities(&self, securities: &[Security]) -> Result<u64> {
        let inserted = self
            .with_retry("insert_securities", |pool| async move {
                let mut tx = pool.begin().await?;
                let mut inserted = 0;
                for security in securities {
                    inserted += insert_security(&mut *tx, security).await?;
                }
                tx.commit().await?;
                Ok::<_, sqlx::Error>(inserted)
            })
            .await?;
        debug!("Inserted {} securities", inserted);
        Ok(inserted)
    }

    async fn apply_security_changes(
        &self,
        date: NaiveDate,
        closes: &[Security],
        inserts: &[Security],
    ) -> Result<()> {
        self.with_retry("apply_security_changes", |pool| async move {
            let mut tx = pool.begin().await?;
            for row in closes {
                let closed = sqlx::query(
                    "UPDATE stock_info SET end_date = ? WHERE uid = ? AND start_date = ? AND end_date = ?",
                )
                .bind(date)
                .bind(row.uid)
                .bind(row.start_date)
                .bind(row.end_date)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if closed == 0 {
                    return Err(sqlx::Error::RowNotFound);
                }
            }
            for security in inserts {
                insert_security(&mut *tx, security).await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn replace_prices(
        &self,
        date: NaiveDate,
        uids: &[i64],
        prices: &[PriceBar],
        dividends: &[Dividend],
        securities: &[Security],
    ) -> Result<()> {
        if let Some(bad) = prices.iter().find(|p| p.quote_date != date) {
            return Err(IngestError::DataShape(format!(
                "price for uid {} dated {} in a batch for {}",
                bad.uid, bad.quote_date, date
            )));
        }

        self.with_retry("replace_prices", |pool| async move {
            let mut tx = pool.begin().await?;
            for security in securities {
                insert_security(&mut *tx, security).await?;
            }
            for uid in uids {
                sqlx::query("DELETE FROM stock_prices WHERE quote_date = ? AND uid = ?")
                    .bind(date)
                    .bind(uid)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM dividends WHERE ex_date = ? AND uid = ?")
                    .bind(date)
                    .bind(uid)
                    .execute(&mut *tx)
                    .await?;
            }
            for price in prices {
                insert_price(&mut *tx, price).await?;
            }
            for dividend in dividends {
                sqlx::query(
                    r#"
                    INSERT INTO dividends (uid, ex_date, payable_date, gross_amount, net_amount, source)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(dividend.uid)
                .bind(dividend.ex_date)
                .bind(dividend.payable_date)
                .bind(dividend.gross_amount)
                .bind(dividend.net_amount)
                .bind(&dividend.source)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn calc_accum_adj_factor(&self, date: NaiveDate) -> Result<()> {
        let prev_date = self.get_prev_trade_date(date).await?;
        let updated = self
            .with_retry("calc_accum_adj_factor", |pool| async move {
                let mut tx = pool.begin().await?;

                let previous = match prev_date {
                    Some(prev_date) => fetch_prices(&mut *tx, prev_date).await?,
                    None => Vec::new(),
                };
                let mut current = fetch_prices(&mut *tx, date).await?;
                let dividends = fetch_dividends(&mut *tx, date).await?;

                pricing::accumulate(&previous, &mut current, &dividends);

                for price in &current {
                    sqlx::query(
                        "UPDATE stock_prices SET accum_adj_factor = ?, accum_index = ? WHERE quote_date = ? AND uid = ?",
                    )
                    .bind(price.accum_adj_factor)
                    .bind(price.accum_index)
                    .bind(price.quote_date)
                    .bind(price.uid)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok::<_, sqlx::Error>(current.len())
            })
            .await?;

        debug!("Recomputed accumulated factors for {} rows on {}", updated, date);
        Ok(())
    }
}

/// Connection-level failures worth a reconnect
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
    )
}

async fn insert_security<'e, E: SqliteExecutor<'e>>(
    executor: E,
    security: &Security,
) -> std::result::Result<u64, sqlx::Error> {
    let uid = security.uid.ok_or_else(|| {
        sqlx::Error::Protocol(format!("security {} has no uid", security.ticker))
    })?;
    let last_updated = security.last_updated.unwrap_or_else(Utc::now);

    let sql = format!(
        "INSERT INTO stock_info ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        SECURITY_COLUMNS
    );
    let result = sqlx::query(&sql)
        .bind(uid)
        .bind(&security.ticker)
        .bind(&security.security_name)
        .bind(&security.exchange)
        .bind(&security.bb_ticker)
        .bind(&security.sedol)
        .bind(&security.isin)
        .bind(&security.cusip)
        .bind(&security.ric)
        .bind(&security.ibes_ticker)
        .bind(&security.currency_code)
        .bind(&security.gics)
        .bind(&security.icb)
        .bind(&security.country)
        .bind(&security.security_type)
        .bind(security.start_date)
        .bind(security.end_date)
        .bind(&security.source)
        .bind(last_updated)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

async fn insert_price<'e, E: SqliteExecutor<'e>>(
    executor: E,
    price: &PriceBar,
) -> std::result::Result<u64, sqlx::Error> {
    let sql = format!(
        "INSERT INTO stock_prices ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        PRICE_COLUMNS
    );
    let result = sqlx::query(&sql)
        .bind(price.quote_date)
        .bind(price.uid)
        .bind(&price.currency_code)
        .bind(price.open)
        .bind(price.high)
        .bind(price.low)
        .bind(price.close)
        .bind(price.shares_os)
        .bind(price.volume)
        .bind(price.adj_factor)
        .bind(price.accum_adj_factor)
        .bind(price.accum_index)
        .bind(price.bid_ask_spread)
        .bind(&price.source)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

async fn fetch_prices<'e, E: SqliteExecutor<'e>>(
    executor: E,
    date: NaiveDate,
) -> std::result::Result<Vec<PriceBar>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM stock_prices WHERE quote_date = ? ORDER BY uid",
        PRICE_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(date).fetch_all(executor).await?;
    rows.iter().map(price_from_row).collect()
}

async fn fetch_dividends<'e, E: SqliteExecutor<'e>>(
    executor: E,
    ex_date: NaiveDate,
) -> std::result::Result<Vec<Dividend>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT uid, ex_date, payable_date, gross_amount, net_amount, source
        FROM dividends
        WHERE ex_date = ?
        ORDER BY uid
        "#,
    )
    .bind(ex_date)
    .fetch_all(executor)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(Dividend {
                uid: r.try_get("uid")?,
                ex_date: r.try_get("ex_date")?,
                payable_date: r.try_get("payable_date")?,
                gross_amount: r.try_get("gross_amount")?,
                net_amount: r.try_get("net_amount")?,
                source: r.try_get("source")?,
            })
        })
        .collect()
}

fn security_from_row(r: &SqliteRow) -> std::result::Result<Security, sqlx::Error> {
    Ok(Security {
        uid: r.try_get("uid")?,
        ticker: r.try_get("ticker")?,
        security_name: r.try_get("security_name")?,
        exchange: r.try_get("exchange")?,
        bb_ticker: r.try_get("bb_ticker")?,
        sedol: r.try_get("sedol")?,
        isin: r.try_get("isin")?,
        cusip: r.try_get("cusip")?,
        ric: r.try_get("ric")?,
        ibes_ticker: r.try_get("ibes_ticker")?,
        currency_code: r.try_get("currency_code")?,
        gics: r.try_get("gics")?,
        icb: r.try_get("icb")?,
        country: r.try_get("country")?,
        security_type: r.try_get("security_type")?,
        start_date: r.try_get("start_date")?,
        end_date: r.try_get("end_date")?,
        source: r.try_get("source")?,
        last_updated: r.try_get::<Option<DateTime<Utc>>, _>("last_updated_date")?,
    })
}

fn price_from_row(r: &SqliteRow) -> std::result::Result<PriceBar, sqlx::Error> {
    Ok(PriceBar {
        quote_date: r.try_get("quote_date")?,
        uid: r.try_get("uid")?,
        currency_code: r.try_get("currency_code")?,
        open: r.try_get("open")?,
        high: r.try_get("high")?,
        low: r.try_get("low")?,
        close: r.try_get("close")?,
        shares_os: r.try_get("shares_os")?,
        volume: r.try_get("volume")?,
        adj_factor: r.try_get("adj_factor")?,
        accum_adj_factor: r.try_get("accum_adj_factor")?,
        accum_index: r.try_get("accum_index")?,
        bid_ask_spread: r.try_get("bid_ask_spread")?,
        source: r.try_get("source")?,
    })
}
