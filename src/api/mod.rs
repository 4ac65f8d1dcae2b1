use async_trait::async_trait;
use chrono::NaiveDate;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::database::EquityStore;
use crate::error::Result;
use crate::models::{PriceBatch, Security};

pub mod advfn;
pub mod nasdaq;
pub mod quandl;

pub use advfn::{AdvfnScraper, AdvfnSecuritySource};
pub use nasdaq::NasdaqListingClient;
pub use quandl::QuandlWikiSource;

/// Per-minute request quota shared by the scrapers
pub struct ApiRateLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl ApiRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }

    /// Wait until the next request is allowed
    pub async fn wait(&self) {
        self.limiter.until_ready().await;
    }
}

/// HTTP client used by every fetcher
pub fn http_client() -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("rust-equities/1.0")
        .build()?)
}

/// Produces candidate securities for a trading date
#[async_trait]
pub trait SecuritySource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch candidates; a failure after some rows were collected comes back as
    /// `IngestError::Partial`
    async fn get(&self, store: &dyn EquityStore, date: NaiveDate) -> Result<Vec<Security>>;
}

/// Produces one date's prices and dividends, with uids already resolved. Sources
/// only read the store; securities they create travel in the batch.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, store: &dyn EquityStore, date: NaiveDate) -> Result<PriceBatch>;
}
