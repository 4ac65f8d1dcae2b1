//! Fetchers against a local mock server

use pretty_assertions::assert_eq;
use reqwest::Client;
use rust_equities::api::advfn::DetailScraper;
use rust_equities::api::{AdvfnScraper, ApiRateLimiter, NasdaqListingClient, QuandlWikiSource};
use rust_equities::{pricing, EquityStore};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{date, init_fresh_test_database, logging, test_data};

const WIKI_PATH: &str = "/api/v3/datatables/WIKI/PRICES.json";

fn wiki_row(ticker: &str, day: &str, open: f64, close: f64, dividend: f64, split: f64) -> serde_json::Value {
    json!([ticker, day, open, close + 1.0, open - 1.0, close, 1000000.0, dividend, split, open, close + 1.0, open - 1.0, close, 1000000.0])
}

async fn mount_wiki_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(WIKI_PATH))
        .and(query_param("qopts.cursor_id", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datatable": {
                "data": [wiki_row("NEWCO", "2016-01-05", 10.0, 10.5, 0.0, 1.0)],
                "columns": []
            },
            "meta": { "next_cursor_id": null }
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(WIKI_PATH))
        .and(query_param("date", "20160105"))
        .and(query_param("api_key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datatable": {
                "data": [
                    wiki_row("AAPL", "2016-01-05", 102.0, 102.0, 0.52, 2.0),
                    wiki_row("SALT", "2016-01-05", 3.0, 3.1, 0.0, 1.0)
                ],
                "columns": []
            },
            "meta": { "next_cursor_id": "page-2" }
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_wiki_pages_are_followed_and_shaped() {
    logging::init_test_logging();
    let server = MockServer::start().await;
    mount_wiki_pages(&server).await;

    let db = init_fresh_test_database().await;
    db.insert_securities(&[
        test_data::create_stored_security(1, "AAPL", "NASDAQ", date(2016, 1, 4)),
        test_data::create_stored_security(2, "SALT", "NYSE", date(2016, 1, 4)),
    ])
    .await
    .unwrap();

    let source = QuandlWikiSource::new(Client::new(), &server.uri(), "test-key");
    let rows = source.fetch_rows(Some(date(2016, 1, 5))).await.unwrap();
    assert_eq!(rows.len(), 3);

    let batch = source.shape(&*db, date(2016, 1, 5), rows).await.unwrap();
    logging::log_test_data("WIKI batch", &batch);

    let uids: Vec<i64> = batch.prices.iter().map(|p| p.uid).collect();
    assert_eq!(uids, vec![1, 2, 3]);
    assert_eq!(batch.prices[0].adj_factor, 0.5);
    assert_eq!(batch.prices[0].accum_index, 1000.0);
    assert_eq!(batch.dividends.len(), 1);
    assert_eq!(batch.dividends[0].gross_amount, 0.52);

    // Unknown ticker got the next uid and a minimal security row, not yet stored
    assert_eq!(batch.securities.len(), 1);
    assert_eq!(batch.securities[0].uid, Some(3));
    assert!(db.get_security_history(3).await.unwrap().is_empty());

    pricing::apply(&*db, date(2016, 1, 5), batch, false).await.unwrap();
    let newco = db.get_security_history(3).await.unwrap();
    assert_eq!(newco.len(), 1);
    assert_eq!(newco[0].ticker, "NEWCO");
    assert_eq!(newco[0].bb_ticker.as_deref(), Some("NEWCO US Equity"));
    assert_eq!(newco[0].source, "WIKI");
}

#[tokio::test]
async fn test_failed_price_write_leaves_no_new_securities() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WIKI_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datatable": {
                "data": [
                    wiki_row("NEWCO", "2016-01-05", 10.0, 10.5, 0.0, 1.0),
                    wiki_row("NEWCO", "2016-01-05", 10.0, 10.6, 0.0, 1.0)
                ]
            },
            "meta": { "next_cursor_id": null }
        })))
        .mount(&server)
        .await;
    let db = init_fresh_test_database().await;

    let source = QuandlWikiSource::new(Client::new(), &server.uri(), "test-key");
    let result = pricing::update(&*db, &source, date(2016, 1, 5), false).await;

    assert!(result.is_err());
    assert_eq!(db.get_max_uid().await.unwrap(), None);
    assert_eq!(db.get_stats().await.unwrap()["stock_info"], 0);
}

#[tokio::test]
async fn test_wiki_debug_mode_inserts_no_securities() {
    let server = MockServer::start().await;
    mount_wiki_pages(&server).await;
    let db = init_fresh_test_database().await;

    let source = QuandlWikiSource::new(Client::new(), &server.uri(), "test-key");
    let batch = pricing::update(&*db, &source, date(2016, 1, 5), true).await.unwrap();

    assert_eq!(batch.prices.len(), 3);
    assert_eq!(db.get_max_uid().await.unwrap(), None);
    assert!(db.get_stock_prices(date(2016, 1, 5), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wiki_update_stores_prices() {
    let server = MockServer::start().await;
    mount_wiki_pages(&server).await;
    let db = init_fresh_test_database().await;

    let source = QuandlWikiSource::new(Client::new(), &server.uri(), "test-key");
    pricing::update(&*db, &source, date(2016, 1, 5), false).await.unwrap();

    let stored = db.get_stock_prices(date(2016, 1, 5), None).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|p| p.source == "WIKI"));
    assert_eq!(db.get_dividends(date(2016, 1, 5)).await.unwrap().len(), 1);
    assert_eq!(db.get_stock_list(date(2016, 1, 5)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_wiki_bulk_runs_dates_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WIKI_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datatable": {
                "data": [
                    wiki_row("SALT", "2016-01-05", 3.0, 3.3, 0.0, 1.0),
                    wiki_row("SALT", "2016-01-04", 3.0, 3.0, 0.0, 1.0)
                ]
            },
            "meta": { "next_cursor_id": null }
        })))
        .mount(&server)
        .await;
    let db = init_fresh_test_database().await;

    let source = QuandlWikiSource::new(Client::new(), &server.uri(), "test-key");
    let dates = source.bulk(&*db, false).await.unwrap();

    assert_eq!(dates, 2);
    assert_eq!(db.get_max_uid().await.unwrap(), Some(1));
    let day2 = &db.get_stock_prices(date(2016, 1, 5), None).await.unwrap()[0];
    assert!((day2.accum_index - 1100.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_nasdaq_listings_are_concatenated() {
    let server = MockServer::start().await;
    let header = "\"Symbol\",\"Name\",\"LastSale\",\"MarketCap\",\"IPOyear\",\"Sector\",\"industry\",\"Summary Quote\",\n";
    for (exchange, ticker) in [("nasdaq", "AAPL"), ("nyse", "SALT"), ("amex", "GLD")] {
        let body = format!(
            "{}\"{}\",\"{} Inc\",\"1.0\",\"$1M\",\"n/a\",\"n/a\",\"n/a\",\"url\",\n",
            header, ticker, ticker
        );
        Mock::given(method("GET"))
            .and(path("/screening/companies-by-name.aspx"))
            .and(query_param("exchange", exchange))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
    }

    let client = NasdaqListingClient::new(Client::new(), &server.uri());
    let companies = client.get_all().await.unwrap();

    let listed: Vec<(&str, &str)> = companies
        .iter()
        .map(|c| (c.ticker.as_str(), c.exchange.as_str()))
        .collect();
    assert_eq!(listed, vec![("AAPL", "NASDAQ"), ("SALT", "NYSE"), ("GLD", "AMEX")]);
}

#[tokio::test]
async fn test_advfn_page_is_scraped() {
    let server = MockServer::start().await;
    let page = r#"<html><body><table>
        <tr><th>Stock Name</th><th>Stock Symbol</th><th>Market</th><th>Stock Type</th><th>ISIN Code</th></tr>
        <tr><td>AT&amp;T Inc</td><td>T</td><td>NYSE</td><td>Common Stock</td><td>US00206R1023</td></tr>
    </table><table>
        <tr><th>Market Cap</th><th>Shares</th><th>Float</th><th>Rank</th><th>Currency</th></tr>
        <tr><td>1</td><td>2</td><td>3</td><td>4</td><td>USD</td></tr>
    </table></body></html>"#;
    Mock::given(method("GET"))
        .and(path("/stock-market/NYSE/T/share-price"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page))
        .mount(&server)
        .await;

    let scraper = AdvfnScraper::new(Client::new(), &server.uri(), Arc::new(ApiRateLimiter::new(600)));
    let details = scraper.parse("T", "NYSE").await.unwrap();

    assert_eq!(details.security_name.as_deref(), Some("AT&T Inc"));
    assert_eq!(details.isin.as_deref(), Some("US00206R1023"));
    assert_eq!(details.currency_code, "USD");

    // Missing page surfaces as a fetch error
    assert!(scraper.parse("NOPE", "NYSE").await.is_err());
}
