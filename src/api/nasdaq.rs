use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::error::Result;

/// Exchanges covered by the NASDAQ company-list downloads
pub const EXCHANGES: [&str; 3] = ["NASDAQ", "NYSE", "AMEX"];

const NOT_AVAILABLE: &str = "n/a";

/// One row of a NASDAQ company-list download
#[derive(Debug, Clone, PartialEq)]
pub struct ListedCompany {
    pub ticker: String,
    pub security_name: String,
    pub exchange: String,
    pub market_cap: String,
    pub sector: Option<String>,
    pub subsector: Option<String>,
}

/// Map the `n/a` placeholder to `None`
pub fn not_available(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value == NOT_AVAILABLE {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parse a company-list CSV: ticker, name, last, market cap, IPO year, sector,
/// subsector, url and a trailing spare column. Rows without a market cap are dropped.
pub fn parse_listing(body: &str, exchange: &str) -> Result<Vec<ListedCompany>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut companies = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").trim();

        if field(3) == NOT_AVAILABLE || field(0).is_empty() {
            continue;
        }

        companies.push(ListedCompany {
            ticker: field(0).to_string(),
            security_name: field(1).to_string(),
            exchange: exchange.to_string(),
            market_cap: field(3).to_string(),
            sector: not_available(field(5)),
            subsector: not_available(field(6)),
        });
    }

    Ok(companies)
}

/// Downloads the NASDAQ, NYSE and AMEX company lists
pub struct NasdaqListingClient {
    client: Client,
    base_url: String,
}

impl NasdaqListingClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn listing_url(&self, exchange: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/screening/companies-by-name.aspx", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("letter", "0")
            .append_pair("exchange", &exchange.to_lowercase())
            .append_pair("render", "download");
        Ok(url)
    }

    /// Companies listed on one exchange
    pub async fn get_listing(&self, exchange: &str) -> Result<Vec<ListedCompany>> {
        let url = self.listing_url(exchange)?;
        debug!("Fetching {} listing from {}", exchange, url);

        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let companies = parse_listing(&body, exchange)?;
        info!("📄 {} listing: {} companies", exchange, companies.len());
        Ok(companies)
    }

    /// All three listings concatenated in NASDAQ, NYSE, AMEX order
    pub async fn get_all(&self) -> Result<Vec<ListedCompany>> {
        let mut companies = Vec::new();
        for exchange in EXCHANGES {
            companies.extend(self.get_listing(exchange).await?);
        }
        Ok(companies)
    }
}
