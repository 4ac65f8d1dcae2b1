use chrono::{Datelike, Duration, NaiveDate, Weekday};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::path::Path;
use tracing::debug;

use crate::error::Result;
use crate::models::{IcbSector, TradeDate};

pub fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Latest business day on or before `date`
fn business_day_on_or_before(mut date: NaiveDate) -> NaiveDate {
    while !is_business_day(date) {
        date -= Duration::days(1);
    }
    date
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
}

/// Last business day of the month containing `date`
pub fn business_month_end(date: NaiveDate) -> NaiveDate {
    business_day_on_or_before(first_of_next_month(date) - Duration::days(1))
}

/// Last business day on or before the 15th of the month containing `date`
pub fn business_mid_month(date: NaiveDate) -> NaiveDate {
    business_day_on_or_before(date.with_day(15).unwrap_or(date))
}

/// Next business month end strictly after a month-end date, otherwise the current one
pub fn next_business_month_end(date: NaiveDate) -> NaiveDate {
    let month_end = business_month_end(date);
    if date >= month_end {
        business_month_end(first_of_next_month(date))
    } else {
        month_end
    }
}

/// Monday-to-Friday calendar between `start` and `end` inclusive. Holidays are not removed.
pub fn generate_trade_dates(start: NaiveDate, end: NaiveDate) -> Vec<TradeDate> {
    let days: Vec<NaiveDate> = start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| is_business_day(*d))
        .collect();

    days.iter()
        .enumerate()
        .map(|(counter, &quote_date)| TradeDate {
            quote_date,
            next_trade_date: days.get(counter + 1).copied(),
            next_eom_date: next_business_month_end(quote_date),
            weekday: quote_date.weekday().num_days_from_sunday(),
            eom: quote_date == business_month_end(quote_date),
            mom: quote_date == business_mid_month(quote_date),
            counter: counter as i64,
        })
        .collect()
}

/// Worker count for parallel fetches: all cores less `spare`, at least one
pub fn worker_count(spare: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(spare).max(1)
}

/// Run `f` over every item with up to `workers` calls in flight.
///
/// Results come back in completion order, not input order.
pub async fn apply_parallel<T, R, F, Fut>(items: Vec<T>, workers: usize, f: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    debug!("Running {} tasks on {} workers", items.len(), workers);
    stream::iter(items.into_iter().map(f))
        .buffer_unordered(workers.max(1))
        .collect()
        .await
}

/// Read an ICB sector list from a CSV file with `code,name` headers
pub fn read_icb_sectors(path: impl AsRef<Path>) -> Result<Vec<IcbSector>> {
    let mut reader = csv::Reader::from_path(path)?;
    let sectors = reader
        .deserialize::<IcbSector>()
        .collect::<std::result::Result<Vec<_>, csv::Error>>()?;
    Ok(sectors)
}
