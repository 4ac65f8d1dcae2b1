//! Security reconciliation against a real store

use assert_matches::assert_matches;
use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use rust_equities::models::{open_end_date, SecurityStatus};
use rust_equities::reconciler::Reconciliation;
use rust_equities::{reconciler, EquityStore, IngestError};

use crate::common::api_mock::{FailingSecuritySource, StaticSecuritySource};
use crate::common::{date, init_fresh_test_database, logging, test_data, TestDatabase};

fn sample_candidates() -> Vec<rust_equities::models::Security> {
    vec![
        test_data::create_test_security("SALT", "NYSE", "Scorpio Bulkers Inc"),
        test_data::create_test_security("AAPL", "NASDAQ", "Apple Inc."),
        test_data::create_test_security("GE", "NYSE", "General Electric Company"),
    ]
}

#[test_log::test(tokio::test)]
async fn test_first_run_creates_securities() {
    logging::log_test_step("Reconciling into an empty reference table");
    let db = init_fresh_test_database().await;
    let source = StaticSecuritySource {
        candidates: sample_candidates(),
    };

    let result = reconciler::update(&*db, &source, date(2016, 1, 4), false).await.unwrap();

    assert_eq!(result.new_count(), 3);
    let uids: Vec<Option<i64>> = result.to_insert.iter().map(|s| s.uid).collect();
    assert_eq!(uids, vec![Some(1), Some(2), Some(3)]);
    assert_eq!(db.get_max_uid().await.unwrap(), Some(3));
    assert_eq!(db.get_stock_list(date(2016, 1, 4)).await.unwrap().len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_resubmission_changes_nothing() {
    let db = init_fresh_test_database().await;
    let source = StaticSecuritySource {
        candidates: sample_candidates(),
    };
    reconciler::update(&*db, &source, date(2016, 1, 4), false).await.unwrap();

    let result = reconciler::update(&*db, &source, date(2016, 1, 5), false).await.unwrap();

    assert!(result.to_insert.is_empty());
    assert!(result.to_close.is_empty());
    assert!(result.securities.iter().all(|s| s.status == SecurityStatus::Exist));
    assert_eq!(db.get_stats().await.unwrap()["stock_info"], 3);
}

#[test_log::test(tokio::test)]
async fn test_changed_attributes_close_and_reopen() {
    let db = init_fresh_test_database().await;
    reconciler::update(
        &*db,
        &StaticSecuritySource {
            candidates: sample_candidates(),
        },
        date(2016, 1, 4),
        false,
    )
    .await
    .unwrap();

    let mut changed = sample_candidates();
    changed[0].security_name = Some("Scorpio Bulkers Inc.".to_string());
    changed.push(test_data::create_test_security("MSFT", "NASDAQ", "Microsoft Corporation"));
    let result = reconciler::update(
        &*db,
        &StaticSecuritySource { candidates: changed },
        date(2016, 2, 1),
        false,
    )
    .await
    .unwrap();
    logging::log_test_data("Reconciliation", &result);

    assert_eq!(result.changed_count(), 1);
    assert_eq!(result.new_count(), 1);

    let history = db.get_security_history(1).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].end_date, date(2016, 2, 1));
    assert_eq!(history[1].start_date, date(2016, 2, 1));
    assert_eq!(history[1].security_name.as_deref(), Some("Scorpio Bulkers Inc."));
    assert!(history[1].is_open());

    // New uid is above everything assigned before the batch
    assert_eq!(db.get_max_uid().await.unwrap(), Some(4));
    assert_eq!(db.get_stock_list(date(2016, 2, 1)).await.unwrap().len(), 4);
    assert_eq!(db.get_stock_list(date(2016, 1, 29)).await.unwrap().len(), 3);
}

async fn submit_name(db: &TestDatabase, name: &str, day: NaiveDate) -> Reconciliation {
    let candidates = vec![test_data::create_test_security("SALT", "NYSE", name)];
    reconciler::update(&**db, &StaticSecuritySource { candidates }, day, false)
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_backdated_change_keeps_history_contiguous() {
    let db = init_fresh_test_database().await;

    submit_name(&db, "Scorpio A", date(2016, 1, 4)).await;
    submit_name(&db, "Scorpio B", date(2016, 2, 1)).await;
    let result = submit_name(&db, "Scorpio C", date(2016, 1, 15)).await;
    assert_eq!(result.changed_count(), 1);

    let history = db.get_security_history(1).await.unwrap();
    let intervals: Vec<(&str, _, _)> = history
        .iter()
        .map(|s| (s.security_name.as_deref().unwrap_or(""), s.start_date, s.end_date))
        .collect();
    assert_eq!(
        intervals,
        vec![
            ("Scorpio A", date(2016, 1, 4), date(2016, 1, 15)),
            ("Scorpio C", date(2016, 1, 15), date(2016, 2, 1)),
            ("Scorpio B", date(2016, 2, 1), open_end_date()),
        ]
    );

    // Exactly one version covers any date
    for day in [date(2016, 1, 10), date(2016, 1, 20), date(2016, 2, 5)] {
        assert_eq!(db.get_stock_list(day).await.unwrap().len(), 1);
    }
}

#[test_log::test(tokio::test)]
async fn test_debug_mode_writes_nothing() {
    let db = init_fresh_test_database().await;
    let source = StaticSecuritySource {
        candidates: sample_candidates(),
    };

    let result = reconciler::update(&*db, &source, date(2016, 1, 4), true).await.unwrap();

    assert_eq!(result.to_insert.len(), 3);
    assert_eq!(db.get_max_uid().await.unwrap(), None);
}

#[test_log::test(tokio::test)]
async fn test_partial_fetch_is_returned_without_writes() {
    let db = init_fresh_test_database().await;
    let source = FailingSecuritySource {
        collected: sample_candidates(),
    };

    let err = reconciler::update(&*db, &source, date(2016, 1, 4), false)
        .await
        .unwrap_err();

    assert_matches!(&err, IngestError::Partial { .. });
    assert_eq!(err.partial_securities().map(|s| s.len()), Some(3));
    assert_eq!(db.get_max_uid().await.unwrap(), None);
}

#[test_log::test(tokio::test)]
async fn test_duplicate_match_fails_without_writes() {
    let db = init_fresh_test_database().await;
    let mut first = test_data::create_test_security("SALT", "NYSE", "Scorpio Bulkers Inc");
    first.isin = Some("MHY7546A1221".to_string());
    reconciler::update(
        &*db,
        &StaticSecuritySource {
            candidates: vec![first],
        },
        date(2016, 1, 4),
        false,
    )
    .await
    .unwrap();

    // Same ISIN under a new listing plus the original listing both land on uid 1
    let mut relisted = test_data::create_test_security("SALT", "NASDAQ", "Scorpio Bulkers Inc");
    relisted.isin = Some("MHY7546A1221".to_string());
    let candidates = vec![
        test_data::create_test_security("SALT", "NYSE", "Scorpio Bulkers Inc"),
        relisted,
    ];
    let result = reconciler::update(&*db, &StaticSecuritySource { candidates }, date(2016, 1, 5), false).await;

    assert_matches!(result, Err(IngestError::DataShape(_)));
    assert_eq!(db.get_stats().await.unwrap()["stock_info"], 1);
}
