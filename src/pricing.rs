//! Price correction and persistence for one trading date.

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::api::PriceSource;
use crate::database::EquityStore;
use crate::error::{IngestError, Result};
use crate::models::{Dividend, PriceBar, PriceBatch, REPEAT_SOURCE};

/// Fail on a second row for the same (quote_date, uid)
pub fn check_unique(prices: &[PriceBar]) -> Result<()> {
    let mut seen = HashSet::new();
    for price in prices {
        if !seen.insert((price.quote_date, price.uid)) {
            return Err(IngestError::DataShape(format!(
                "duplicate price for uid {} on {}",
                price.uid, price.quote_date
            )));
        }
    }
    Ok(())
}

/// Reset adjustment factors that make the open-to-open move look worse than
/// leaving the price unadjusted. Returns how many factors were reset.
///
/// A heuristic: a genuine corporate action with an unusual open can be reset too.
pub fn correct_adj_factors(current: &mut [PriceBar], previous: &[PriceBar]) -> usize {
    let prev_open: HashMap<i64, f64> = previous
        .iter()
        .filter_map(|p| Some((p.uid, p.open?)))
        .collect();

    let mut corrected = 0;
    for price in current.iter_mut().filter(|p| p.adj_factor != 1.0) {
        let (Some(open), Some(&prev)) = (price.open, prev_open.get(&price.uid)) else {
            continue;
        };

        let raw_return = (open / prev - 1.0).abs();
        let adjusted_return = (open / (prev * price.adj_factor) - 1.0).abs();
        if adjusted_return > raw_return {
            debug!(
                "Resetting adj_factor {} for uid {} (raw {:.4}, adjusted {:.4})",
                price.adj_factor, price.uid, raw_return, adjusted_return
            );
            price.adj_factor = 1.0;
            corrected += 1;
        }
    }
    corrected
}

/// Copy the prior date's rows for `covered` uids onto `date` unchanged apart
/// from the quote date and the source tag
pub fn roll_forward(previous: &[PriceBar], covered: &HashSet<i64>, date: NaiveDate) -> Vec<PriceBar> {
    previous
        .iter()
        .filter(|p| covered.contains(&p.uid))
        .map(|p| PriceBar {
            quote_date: date,
            source: REPEAT_SOURCE.to_string(),
            ..p.clone()
        })
        .collect()
}

/// Chain accumulated adjustment factor and total-return index from the
/// previous stored date onto `current`
pub fn accumulate(previous: &[PriceBar], current: &mut [PriceBar], dividends: &[Dividend]) {
    let prev_by_uid: HashMap<i64, &PriceBar> = previous.iter().map(|p| (p.uid, p)).collect();
    let mut dividend_by_uid: HashMap<i64, f64> = HashMap::new();
    for dividend in dividends {
        *dividend_by_uid.entry(dividend.uid).or_default() += dividend.gross_amount;
    }

    for price in current.iter_mut() {
        let Some(prev) = prev_by_uid.get(&price.uid) else {
            price.accum_adj_factor = price.adj_factor;
            continue;
        };

        price.accum_adj_factor = prev.accum_adj_factor * price.adj_factor;
        price.accum_index = match (price.close, prev.close) {
            (Some(close), Some(prev_close)) if prev_close != 0.0 && price.adj_factor != 0.0 => {
                let dividend = dividend_by_uid.get(&price.uid).copied().unwrap_or(0.0);
                prev.accum_index * (close + dividend) / (prev_close * price.adj_factor)
            }
            _ => prev.accum_index,
        };
    }
}

/// Fetch one date from `source` and run it through [`apply`]
pub async fn update(
    store: &dyn EquityStore,
    source: &dyn PriceSource,
    date: NaiveDate,
    debug: bool,
) -> Result<PriceBatch> {
    info!("💰 Updating prices from {} for {}", source.name(), date);
    let batch = source.get(store, date).await?;
    info!("📥 Fetched {} prices and {} dividends", batch.prices.len(), batch.dividends.len());
    apply(store, date, batch, debug).await
}

/// Correct and persist one date's prices. Running it twice with the same input
/// leaves the same rows behind.
pub async fn apply(
    store: &dyn EquityStore,
    date: NaiveDate,
    batch: PriceBatch,
    debug: bool,
) -> Result<PriceBatch> {
    if batch.is_empty() {
        if debug {
            return Ok(PriceBatch::default());
        }
        return repeat_previous(store, date).await;
    }

    let PriceBatch {
        mut prices,
        dividends,
        securities,
    } = batch;
    check_unique(&prices)?;
    if let Some(bad) = prices.iter().find(|p| p.quote_date != date) {
        return Err(IngestError::DataShape(format!(
            "price for uid {} dated {} in a batch for {}",
            bad.uid, bad.quote_date, date
        )));
    }

    let uids: Vec<i64> = prices.iter().map(|p| p.uid).collect();
    if let Some(prev_date) = store.get_prev_trade_date(date).await? {
        let previous = store.get_stock_prices(prev_date, Some(&uids)).await?;
        let corrected = correct_adj_factors(&mut prices, &previous);
        if corrected > 0 {
            info!("🔧 Reset {} adjustment factors against {}", corrected, prev_date);
        }
    } else {
        debug!("No trading date before {}, adjustment factors kept", date);
    }

    let dividends: Vec<Dividend> = dividends
        .into_iter()
        .filter(|d| d.gross_amount > 0.0)
        .collect();

    if debug {
        info!(
            "🐛 Debug mode: {} prices and {} new securities not written",
            prices.len(),
            securities.len()
        );
        return Ok(PriceBatch {
            prices,
            dividends,
            securities,
        });
    }

    store
        .replace_prices(date, &uids, &prices, &dividends, &securities)
        .await?;
    store.calc_accum_adj_factor(date).await?;
    if !securities.is_empty() {
        info!("🆕 Inserted {} new securities", securities.len());
    }
    info!("✅ Stored {} prices and {} dividends for {}", prices.len(), dividends.len(), date);

    Ok(PriceBatch {
        prices,
        dividends,
        securities,
    })
}

async fn repeat_previous(store: &dyn EquityStore, date: NaiveDate) -> Result<PriceBatch> {
    let Some(prev_date) = store.get_prev_trade_date(date).await? else {
        warn!("⚠️ No prices for {} and no earlier trading date to repeat", date);
        return Ok(PriceBatch::default());
    };

    let covered: HashSet<i64> = store
        .get_stock_list(date)
        .await?
        .iter()
        .filter_map(|s| s.uid)
        .collect();
    let previous = store.get_stock_prices(prev_date, None).await?;
    let prices = roll_forward(&previous, &covered, date);
    if prices.is_empty() {
        warn!("⚠️ Nothing stored on {} to repeat onto {}", prev_date, date);
        return Ok(PriceBatch::default());
    }

    let uids: Vec<i64> = prices.iter().map(|p| p.uid).collect();
    // Accumulated columns are carried over as copied
    store.replace_prices(date, &uids, &prices, &[], &[]).await?;
    info!("🔁 Repeated {} prices from {} onto {}", prices.len(), prev_date, date);

    Ok(PriceBatch {
        prices,
        ..PriceBatch::default()
    })
}
