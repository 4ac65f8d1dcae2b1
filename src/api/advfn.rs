use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::nasdaq::{not_available, ListedCompany, NasdaqListingClient};
use super::{ApiRateLimiter, SecuritySource};
use crate::database::EquityStore;
use crate::error::{IngestError, Result};
use crate::models::Security;
use crate::utils::apply_parallel;

pub const ADVFN_SOURCE: &str = "ADVFN";

/// Fields scraped from an ADVFN share-price page
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdvfnDetails {
    pub security_name: Option<String>,
    pub ticker: Option<String>,
    pub exchange: Option<String>,
    pub security_type: Option<String>,
    pub isin: Option<String>,
    pub currency_code: String,
}

/// Looks up the detail page of one listing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DetailScraper: Send + Sync {
    async fn parse(&self, ticker: &str, exchange: &str) -> Result<AdvfnDetails>;
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| IngestError::Parse(format!("bad selector {}: {}", css, e)))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// The table holding a row whose header cell reads `header`
fn table_with_header<'a>(document: &'a Html, header: &str) -> Result<Option<ElementRef<'a>>> {
    let tr = selector("tr")?;
    let th = selector("th")?;

    Ok(document
        .select(&tr)
        .find(|row| row.select(&th).any(|cell| cell_text(cell) == header))
        .and_then(|row| row.parent())
        .and_then(ElementRef::wrap))
}

/// First non-empty text found in data column `index` (zero-based) of the table
fn column_text(table: ElementRef<'_>, index: usize) -> Result<Option<String>> {
    let tr = selector("tr")?;
    let td = selector("td")?;

    Ok(table
        .select(&tr)
        .filter_map(|row| row.select(&td).nth(index))
        .map(cell_text)
        .find(|text| !text.is_empty()))
}

/// Parse a share-price page
pub fn parse_detail_page(html: &str) -> Result<AdvfnDetails> {
    let document = Html::parse_document(html);

    let info = table_with_header(&document, "Stock Name")?
        .ok_or_else(|| IngestError::Parse("no 'Stock Name' table".to_string()))?;
    let currency_table = table_with_header(&document, "Currency")?
        .ok_or_else(|| IngestError::Parse("no 'Currency' table".to_string()))?;
    let currency_code = column_text(currency_table, 4)?
        .ok_or_else(|| IngestError::Parse("currency cell is empty".to_string()))?;

    Ok(AdvfnDetails {
        security_name: column_text(info, 0)?,
        ticker: column_text(info, 1)?,
        exchange: column_text(info, 2)?,
        security_type: column_text(info, 3)?,
        isin: column_text(info, 4)?,
        currency_code,
    })
}

/// Decode HTML entities in a listing name
pub fn unescape_html(text: &str) -> String {
    Html::parse_fragment(text)
        .root_element()
        .text()
        .collect::<String>()
}

/// Scrapes ADVFN share-price pages
pub struct AdvfnScraper {
    client: Client,
    base_url: String,
    rate_limiter: Arc<ApiRateLimiter>,
}

impl AdvfnScraper {
    pub fn new(client: Client, base_url: &str, rate_limiter: Arc<ApiRateLimiter>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        }
    }

    pub fn detail_url(&self, ticker: &str, exchange: &str) -> String {
        format!("{}/stock-market/{}/{}/share-price", self.base_url, exchange, ticker)
    }
}

#[async_trait]
impl DetailScraper for AdvfnScraper {
    async fn parse(&self, ticker: &str, exchange: &str) -> Result<AdvfnDetails> {
        self.rate_limiter.wait().await;

        let url = self.detail_url(ticker, exchange);
        debug!("Scraping {}", url);
        let html = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_detail_page(&html).map_err(|e| IngestError::Parse(format!("{} {}: {}", exchange, ticker, e)))
    }
}

/// US securities from the NASDAQ listings, enriched with ADVFN detail pages
pub struct AdvfnSecuritySource<S: DetailScraper = AdvfnScraper> {
    listing: NasdaqListingClient,
    scraper: S,
    workers: usize,
}

impl<S: DetailScraper> AdvfnSecuritySource<S> {
    pub fn new(listing: NasdaqListingClient, scraper: S, workers: usize) -> Self {
        Self {
            listing,
            scraper,
            workers,
        }
    }

    /// Build the candidate row for one listing and its scraped details
    pub fn to_security(
        company: &ListedCompany,
        details: &AdvfnDetails,
        icb_codes: &HashMap<String, String>,
        date: NaiveDate,
    ) -> Security {
        let mut security = Security::new(&company.ticker, ADVFN_SOURCE, date);
        security.security_name = not_available(&unescape_html(&company.security_name));
        security.exchange = Some(company.exchange.clone());
        security.bb_ticker = Some(format!("{} US Equity", company.ticker));
        security.country = Some("US".to_string());
        security.icb = company
            .subsector
            .as_ref()
            .and_then(|name| icb_codes.get(name))
            .cloned();

        // Details only merge when the page agrees on ticker and exchange
        let same_listing = details.ticker.as_deref() == Some(company.ticker.as_str())
            && details.exchange.as_deref() == Some(company.exchange.as_str());
        if same_listing {
            security.isin = details.isin.as_deref().and_then(not_available);
            security.security_type = details.security_type.as_deref().and_then(not_available);
            security.currency_code = not_available(&details.currency_code);
        } else {
            warn!(
                "⚠️ ADVFN page for {} {} reports {:?} {:?}, details dropped",
                company.exchange, company.ticker, details.exchange, details.ticker
            );
        }

        security
    }
}

#[async_trait]
impl<S: DetailScraper> SecuritySource for AdvfnSecuritySource<S> {
    fn name(&self) -> &str {
        ADVFN_SOURCE
    }

    async fn get(&self, store: &dyn EquityStore, date: NaiveDate) -> Result<Vec<Security>> {
        let companies = self.listing.get_all().await?;
        info!("🔍 Scraping {} ADVFN pages on {} workers", companies.len(), self.workers);

        let scraper = &self.scraper;
        let scraped = apply_parallel(companies, self.workers, |company: ListedCompany| async move {
            let details = scraper.parse(&company.ticker, &company.exchange).await;
            (company, details)
        })
        .await;

        let icb_codes: HashMap<String, String> = store
            .get_icb_sectors()
            .await?
            .into_iter()
            .map(|sector| (sector.name, sector.code))
            .collect();

        let mut securities = Vec::with_capacity(scraped.len());
        let mut failures = Vec::new();
        for (company, details) in scraped {
            match details {
                Ok(details) => securities.push(Self::to_security(&company, &details, &icb_codes, date)),
                Err(e) => failures.push(e),
            }
        }

        if let Some(first) = failures.into_iter().next() {
            warn!("❌ ADVFN scrape failed after collecting {} securities", securities.len());
            return Err(IngestError::Partial {
                securities,
                source: Box::new(first),
            });
        }

        Ok(securities)
    }
}
