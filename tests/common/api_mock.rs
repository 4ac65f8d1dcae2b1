//! In-memory sources standing in for the web fetchers

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_equities::api::{PriceSource, SecuritySource};
use rust_equities::models::{PriceBatch, Security};
use rust_equities::{EquityStore, IngestError, Result};

/// Returns the same candidates on every call
pub struct StaticSecuritySource {
    pub candidates: Vec<Security>,
}

#[async_trait]
impl SecuritySource for StaticSecuritySource {
    fn name(&self) -> &str {
        "static"
    }

    async fn get(&self, _store: &dyn EquityStore, date: NaiveDate) -> Result<Vec<Security>> {
        Ok(self
            .candidates
            .iter()
            .cloned()
            .map(|mut s| {
                s.start_date = date;
                s
            })
            .collect())
    }
}

/// Fails after collecting `collected`
pub struct FailingSecuritySource {
    pub collected: Vec<Security>,
}

#[async_trait]
impl SecuritySource for FailingSecuritySource {
    fn name(&self) -> &str {
        "failing"
    }

    async fn get(&self, _store: &dyn EquityStore, _date: NaiveDate) -> Result<Vec<Security>> {
        Err(IngestError::Partial {
            securities: self.collected.clone(),
            source: Box::new(IngestError::Parse("page layout changed".to_string())),
        })
    }
}

/// Returns a fixed batch of prices
pub struct StaticPriceSource {
    pub batch: PriceBatch,
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn get(&self, _store: &dyn EquityStore, _date: NaiveDate) -> Result<PriceBatch> {
        Ok(self.batch.clone())
    }
}
