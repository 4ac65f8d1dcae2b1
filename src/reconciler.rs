//! Security reconciliation: identity matching, uid assignment and change detection.

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::api::SecuritySource;
use crate::database::EquityStore;
use crate::error::{IngestError, Result};
use crate::models::{open_end_date, Security, SecurityStatus};

/// A candidate after matching, carrying its resolved uid
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledSecurity {
    pub security: Security,
    pub status: SecurityStatus,
}

/// Outcome of reconciling one batch of candidates against the reference table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Every deduplicated candidate with its uid and status
    pub securities: Vec<ReconciledSecurity>,
    /// Existing rows covering the batch date whose tracked attributes changed
    pub to_close: Vec<Security>,
    /// New securities followed by replacement rows for changed ones
    pub to_insert: Vec<Security>,
}

impl Reconciliation {
    pub fn new_count(&self) -> usize {
        self.securities
            .iter()
            .filter(|s| s.status == SecurityStatus::New)
            .count()
    }

    pub fn changed_count(&self) -> usize {
        self.to_close.len()
    }

    pub fn log_summary(&self) {
        info!(
            "📋 Reconciled {} securities: {} new, {} changed, {} unchanged",
            self.securities.len(),
            self.new_count(),
            self.changed_count(),
            self.securities.len() - self.new_count() - self.changed_count()
        );
    }
}

/// Drop exact duplicates, keeping the first occurrence
pub fn dedupe(candidates: Vec<Security>) -> Vec<Security> {
    let mut seen = HashSet::new();
    let before = candidates.len();
    let unique: Vec<Security> = candidates
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect();

    if unique.len() < before {
        debug!("Collapsed {} duplicate candidates", before - unique.len());
    }
    unique
}

/// Key index over the reference table; a key seen with two different uids is ambiguous
struct KeyIndex<K> {
    uids: HashMap<K, i64>,
    ambiguous: HashSet<K>,
}

impl<K: std::hash::Hash + Eq + Clone + std::fmt::Debug> KeyIndex<K> {
    fn build<'a>(existing: &'a [Security], key: impl Fn(&'a Security) -> Option<K>) -> Self {
        let mut uids = HashMap::new();
        let mut ambiguous = HashSet::new();

        for (k, uid) in existing.iter().filter_map(|s| Some((key(s)?, s.uid?))) {
            match uids.get(&k) {
                Some(&known) if known != uid => {
                    ambiguous.insert(k);
                }
                Some(_) => {}
                None => {
                    uids.insert(k, uid);
                }
            }
        }

        Self { uids, ambiguous }
    }

    fn lookup(&self, key: Option<K>, tier: &str) -> Result<Option<i64>> {
        let Some(key) = key else {
            return Ok(None);
        };
        if self.ambiguous.contains(&key) {
            return Err(IngestError::DataShape(format!(
                "{} key {:?} maps to more than one open uid",
                tier, key
            )));
        }
        Ok(self.uids.get(&key).copied())
    }
}

fn listing_key(s: &Security) -> Option<(&str, &str)> {
    Some((s.ticker.as_str(), s.exchange.as_deref()?))
}

/// Resolve uids through the ticker+exchange, SEDOL, ISIN waterfall.
///
/// Each tier only sees rows the previous tiers left unresolved. Null key
/// components never match.
pub fn match_existing(candidates: &[Security], existing: &[Security]) -> Result<Vec<Option<i64>>> {
    let by_listing = KeyIndex::build(existing, listing_key);
    let by_sedol = KeyIndex::build(existing, |s| s.sedol.as_deref());
    let by_isin = KeyIndex::build(existing, |s| s.isin.as_deref());

    let mut resolved = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let mut uid = by_listing.lookup(listing_key(candidate), "ticker/exchange")?;
        if uid.is_none() {
            uid = by_sedol.lookup(candidate.sedol.as_deref(), "sedol")?;
        }
        if uid.is_none() {
            uid = by_isin.lookup(candidate.isin.as_deref(), "isin")?;
        }
        resolved.push(uid);
    }

    let mut claimed: HashMap<i64, &str> = HashMap::new();
    for (candidate, uid) in candidates.iter().zip(&resolved) {
        if let Some(uid) = uid {
            if let Some(first) = claimed.insert(*uid, &candidate.ticker) {
                return Err(IngestError::DataShape(format!(
                    "candidates {} and {} both resolve to uid {}",
                    first, candidate.ticker, uid
                )));
            }
        }
    }

    Ok(resolved)
}

/// Give every unresolved row the next uid above `max_uid`, in candidate order
pub fn assign_new_uids(resolved: &mut [Option<i64>], max_uid: Option<i64>) -> usize {
    let mut running_max = max_uid.unwrap_or(0).max(0);
    let mut assigned = 0;

    for uid in resolved.iter_mut().filter(|uid| uid.is_none()) {
        running_max += 1;
        *uid = Some(running_max);
        assigned += 1;
    }
    assigned
}

/// Reconcile candidates against the rows covering `batch_date`
pub fn reconcile(
    candidates: Vec<Security>,
    existing: &[Security],
    max_uid: Option<i64>,
    batch_date: NaiveDate,
) -> Result<Reconciliation> {
    let candidates = dedupe(candidates);
    let mut resolved = match_existing(&candidates, existing)?;
    let statuses: Vec<SecurityStatus> = resolved
        .iter()
        .map(|uid| match uid {
            Some(_) => SecurityStatus::Exist,
            None => SecurityStatus::New,
        })
        .collect();
    assign_new_uids(&mut resolved, max_uid);

    let current: HashMap<i64, &Security> = existing
        .iter()
        .filter(|s| s.covers(batch_date))
        .filter_map(|s| Some((s.uid?, s)))
        .collect();

    let mut reconciliation = Reconciliation::default();
    let mut replacements = Vec::new();

    for ((mut security, uid), status) in candidates.into_iter().zip(resolved).zip(statuses) {
        security.uid = uid;

        let mut row = security.clone();
        row.start_date = batch_date;
        row.end_date = open_end_date();
        row.last_updated = None;

        match status {
            SecurityStatus::New => reconciliation.to_insert.push(row),
            SecurityStatus::Exist => {
                let Some(previous) = uid.and_then(|uid| current.get(&uid)) else {
                    return Err(IngestError::DataShape(format!(
                        "{} matched uid {:?} but no row for it covers {}",
                        security.ticker, uid, batch_date
                    )));
                };
                if previous.attributes_differ(&security) {
                    debug!("Security {} (uid {:?}) changed", security.ticker, uid);
                    // A backdated change ends where the next version starts
                    row.end_date = previous.end_date;
                    reconciliation.to_close.push((*previous).clone());
                    replacements.push(row);
                }
            }
        }

        reconciliation.securities.push(ReconciledSecurity { security, status });
    }

    reconciliation.to_insert.extend(replacements);
    Ok(reconciliation)
}

/// Fetch candidates from `source`, reconcile them and write the result in one
/// transaction. Debug mode computes the reconciliation without writing.
pub async fn update(
    store: &dyn EquityStore,
    source: &dyn SecuritySource,
    date: NaiveDate,
    debug: bool,
) -> Result<Reconciliation> {
    info!("🔄 Updating securities from {} for {}", source.name(), date);

    let candidates = source.get(store, date).await?;
    info!("📥 Fetched {} candidate securities", candidates.len());

    let existing = store.get_stock_list(date).await?;
    let max_uid = store.get_max_uid().await?;
    let reconciliation = reconcile(candidates, &existing, max_uid, date)?;
    reconciliation.log_summary();

    if debug {
        info!("🐛 Debug mode: nothing written");
        return Ok(reconciliation);
    }

    store
        .apply_security_changes(date, &reconciliation.to_close, &reconciliation.to_insert)
        .await?;
    info!(
        "✅ Closed {} rows and inserted {} rows",
        reconciliation.to_close.len(),
        reconciliation.to_insert.len()
    );

    Ok(reconciliation)
}
