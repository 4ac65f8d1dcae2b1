//! Storage interface consumed by the reconciler and the price corrector.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::models::{Dividend, IcbSector, PriceBar, Security};

pub mod sqlite;
pub use sqlite::DatabaseManagerSqlx;

/// Relational store holding `stock_info`, `stock_prices`, `dividends`,
/// `trade_dates` and `icb_sectors`
#[async_trait]
pub trait EquityStore: Send + Sync {
    /// Securities whose validity interval covers the date
    async fn get_stock_list(&self, date: NaiveDate) -> Result<Vec<Security>>;

    /// Stored prices for the date, optionally restricted to a set of uids
    async fn get_stock_prices(&self, date: NaiveDate, uids: Option<&[i64]>) -> Result<Vec<PriceBar>>;

    /// Highest uid ever assigned, `None` for an empty reference table
    async fn get_max_uid(&self) -> Result<Option<i64>>;

    /// Trading date immediately before `date`
    async fn get_prev_trade_date(&self, date: NaiveDate) -> Result<Option<NaiveDate>>;

    async fn get_icb_sectors(&self) -> Result<Vec<IcbSector>>;

    /// Append security rows as given
    async fn insert_securities(&self, securities: &[Security]) -> Result<u64>;

    /// End each of `closes` at `date` and append `inserts`, in one transaction.
    /// A row is identified by uid and validity interval, so only that version is closed.
    async fn apply_security_changes(
        &self,
        date: NaiveDate,
        closes: &[Security],
        inserts: &[Security],
    ) -> Result<()>;

    /// Delete the date's prices and dividends for `uids`, then insert the given rows
    /// together with any securities first seen in the batch, in one transaction
    async fn replace_prices(
        &self,
        date: NaiveDate,
        uids: &[i64],
        prices: &[PriceBar],
        dividends: &[Dividend],
        securities: &[Security],
    ) -> Result<()>;

    /// Recompute `accum_adj_factor` and `accum_index` for the date's rows
    async fn calc_accum_adj_factor(&self, date: NaiveDate) -> Result<()>;
}
