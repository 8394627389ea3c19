pub mod feed;
pub mod odds_api;
pub mod retry;

pub use feed::OddsFeed;
pub use odds_api::TheOddsApi;
pub use retry::{retry_async, retry_sync, Backoff};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::MarketTuning;
use crate::db::models::{line_key, MarketState, OddsSnapshot};
use crate::db::Database;
use crate::error::{PipelineError, Result};

/// Outcome of storing a batch of observations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub stored: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub feeds_polled: usize,
    pub feeds_failed: usize,
    pub snapshots_stored: usize,
    pub snapshots_rejected: usize,
    pub events_processed: usize,
    pub events_failed: usize,
    pub market_states_computed: usize,
}

/// Reject observations that cannot be priced or attributed
pub fn validate_snapshot(snap: &OddsSnapshot) -> Result<()> {
    if !snap.price.is_finite() || snap.price <= 1.0 {
        return Err(PipelineError::InvalidSnapshot(format!(
            "price {} for {}/{}/{} must be above 1.0",
            snap.price, snap.event_id, snap.selection, snap.bookmaker
        )));
    }
    if let Some(line) = snap.line {
        if !line.is_finite() {
            return Err(PipelineError::InvalidSnapshot(format!(
                "non-finite line for {}/{}",
                snap.event_id, snap.selection
            )));
        }
    }
    let required = [
        ("event_id", &snap.event_id),
        ("sport", &snap.sport),
        ("league", &snap.league),
        ("home_team", &snap.home_team),
        ("away_team", &snap.away_team),
        ("market_type", &snap.market_type),
        ("selection", &snap.selection),
        ("bookmaker", &snap.bookmaker),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(PipelineError::InvalidSnapshot(format!("missing {field}")));
        }
    }
    Ok(())
}

/// Append one observation after validation
pub fn ingest(db: &Database, snap: &OddsSnapshot) -> Result<i64> {
    validate_snapshot(snap)?;
    db.insert_snapshot(snap)
}

/// Validate each observation on its own, then store the valid ones together
pub fn ingest_batch(db: &Database, snaps: &[OddsSnapshot]) -> Result<BatchOutcome> {
    let mut valid = Vec::with_capacity(snaps.len());
    let mut rejected = 0;
    for snap in snaps {
        match validate_snapshot(snap) {
            Ok(()) => valid.push(snap.clone()),
            Err(e) => {
                warn!("Dropping snapshot: {}", e);
                rejected += 1;
            }
        }
    }
    let stored = if valid.is_empty() {
        0
    } else {
        db.insert_snapshots(&valid)?
    };
    Ok(BatchOutcome { stored, rejected })
}

/// Consolidate observations of one event into per-selection market states.
///
/// Only each bookmaker's latest observation of a selection counts. Best
/// price ties go to the alphabetically first bookmaker.
pub fn aggregate_market_states(
    event_id: &str,
    observations: &[OddsSnapshot],
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Vec<MarketState> {
    // (market, selection, line_key) -> bookmaker -> latest observation
    let mut groups: BTreeMap<(String, String, String), BTreeMap<String, &OddsSnapshot>> =
        BTreeMap::new();
    for obs in observations.iter().filter(|o| o.event_id == event_id) {
        let key = (obs.market_type.clone(), obs.selection.clone(), line_key(obs.line));
        let books = groups.entry(key).or_default();
        match books.get(&obs.bookmaker) {
            Some(prev) if prev.observed_at > obs.observed_at => {}
            _ => {
                books.insert(obs.bookmaker.clone(), obs);
            }
        }
    }

    let mut states = Vec::with_capacity(groups.len());
    for ((market_type, selection, _), books) in groups {
        let Some(first) = books.values().next() else { continue };
        let line = first.line;

        let mut best_price = f64::MIN;
        let mut best_bookmaker = String::new();
        for (bookmaker, obs) in &books {
            if obs.price > best_price {
                best_price = obs.price;
                best_bookmaker = bookmaker.clone();
            }
        }

        let prices: BTreeMap<String, f64> =
            books.iter().map(|(bk, o)| (bk.clone(), o.price)).collect();
        let values: Vec<f64> = prices.values().copied().collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let dispersion = if values.len() > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
        } else {
            0.0
        };

        let stale_books: Vec<String> = books
            .iter()
            .filter(|(_, o)| now - o.observed_at > stale_after)
            .map(|(bk, _)| bk.clone())
            .collect();

        states.push(MarketState {
            event_id: event_id.to_string(),
            market_type,
            selection,
            line,
            best_price,
            best_bookmaker,
            market_avg: mean,
            market_median: median(&values),
            dispersion,
            book_count: prices.len() as i64,
            prices,
            is_stale: !stale_books.is_empty(),
            stale_books,
            computed_at: now,
        });
    }
    states
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Recompute every selection state of an event from stored observations
pub fn compute_market_state(
    db: &Database,
    event_id: &str,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<Vec<MarketState>> {
    let observations = db.snapshots_for_event(event_id)?;
    Ok(aggregate_market_states(event_id, &observations, now, stale_after))
}

pub fn persist_market_states(db: &Database, states: &[MarketState]) -> Result<()> {
    db.upsert_market_states(states)
}

/// Store fetched batches and refresh the market state of every event they
/// touched, retrying busy-database failures.
fn store_fetched(
    db: &Database,
    results: Vec<(String, anyhow::Result<Vec<OddsSnapshot>>)>,
    backoff: &Backoff,
    stale_after: Duration,
    now: DateTime<Utc>,
    mut summary: IngestionSummary,
) -> IngestionSummary {
    let mut events = BTreeSet::new();
    for (name, result) in results {
        let snaps = match result {
            Ok(s) => s,
            Err(e) => {
                error!("Feed '{}' skipped after retries: {}", name, e);
                summary.feeds_failed += 1;
                continue;
            }
        };
        match retry_sync(backoff, &name, || ingest_batch(db, &snaps)) {
            Ok(outcome) => {
                summary.snapshots_stored += outcome.stored;
                summary.snapshots_rejected += outcome.rejected;
                for s in &snaps {
                    events.insert(s.event_id.clone());
                }
            }
            Err(e) => {
                error!("Storing snapshots from '{}' failed: {}", name, e);
                summary.feeds_failed += 1;
            }
        }
    }

    for event_id in &events {
        let refreshed = retry_sync(backoff, event_id, || {
            let states = compute_market_state(db, event_id, now, stale_after)?;
            persist_market_states(db, &states)?;
            Ok(states.len())
        });
        match refreshed {
            Ok(n) => {
                debug!("Market state for {}: {} selections", event_id, n);
                summary.market_states_computed += n;
                summary.events_processed += 1;
            }
            Err(e) => {
                error!("Market state for {} failed: {}", event_id, e);
                summary.events_failed += 1;
            }
        }
    }
    summary
}

/// Poll every feed concurrently, store what came back and refresh the
/// market state of every touched event. Failures stay local to one feed or
/// one event.
pub async fn run_ingestion_cycle(
    db: &Database,
    feeds: &[Arc<dyn OddsFeed>],
    tuning: &MarketTuning,
    now: DateTime<Utc>,
) -> IngestionSummary {
    let backoff = Backoff::from_tuning(tuning);
    let summary = IngestionSummary {
        feeds_polled: feeds.len(),
        ..Default::default()
    };

    // Network first; storage is only touched once every fetch has returned.
    let fetches: Vec<_> = feeds
        .iter()
        .map(|feed| {
            let feed = Arc::clone(feed);
            async move {
                let res = retry_async(&backoff, feed.name(), || feed.fetch_snapshots(now)).await;
                (feed.name().to_string(), res)
            }
        })
        .collect();
    let results = futures_util::future::join_all(fetches).await;

    // SQLite calls and their busy-retry sleeps stay off the async workers.
    let db = db.clone();
    let stale_after = Duration::minutes(tuning.stale_after_minutes);
    let feeds_polled = summary.feeds_polled;
    let stored = tokio::task::spawn_blocking(move || {
        store_fetched(&db, results, &backoff, stale_after, now, summary)
    })
    .await;
    let summary = match stored {
        Ok(summary) => summary,
        Err(e) => {
            error!("Ingestion storage task aborted: {}", e);
            IngestionSummary {
                feeds_polled,
                feeds_failed: feeds_polled,
                ..Default::default()
            }
        }
    };

    info!(
        "Ingestion cycle: {} feeds ({} failed), {} snapshots stored, {} rejected, {} events, {} states",
        summary.feeds_polled,
        summary.feeds_failed,
        summary.snapshots_stored,
        summary.snapshots_rejected,
        summary.events_processed,
        summary.market_states_computed
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::market::tests::snapshot;
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 20, 12, 0, 0).unwrap()
    }

    #[test]
    fn rejects_price_at_or_below_one() {
        let db = Database::open_in_memory().unwrap();
        let bad = snapshot("e1", "home", "pinnacle", 1.0, t0());
        let err = ingest(&db, &bad).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSnapshot(_)));
        assert!(db.snapshots_for_event("e1").unwrap().is_empty());
    }

    #[test]
    fn rejects_missing_identity() {
        let mut bad = snapshot("e1", "home", "pinnacle", 2.0, t0());
        bad.bookmaker = " ".into();
        assert!(validate_snapshot(&bad).is_err());
    }

    #[test]
    fn batch_keeps_valid_rows() {
        let db = Database::open_in_memory().unwrap();
        let out = ingest_batch(
            &db,
            &[
                snapshot("e1", "home", "pinnacle", 2.0, t0()),
                snapshot("e1", "home", "bet365", 0.9, t0()),
                snapshot("e1", "away", "bet365", f64::NAN, t0()),
            ],
        )
        .unwrap();
        assert_eq!(out, BatchOutcome { stored: 1, rejected: 2 });
    }

    #[test]
    fn market_state_uses_latest_price_per_book() {
        let obs = vec![
            snapshot("e1", "home", "pinnacle", 2.30, t0() - Duration::minutes(10)),
            snapshot("e1", "home", "pinnacle", 2.10, t0() - Duration::minutes(1)),
            snapshot("e1", "home", "bet365", 2.00, t0() - Duration::minutes(2)),
            snapshot("e1", "home", "unibet", 2.20, t0() - Duration::minutes(45)),
        ];
        let states = aggregate_market_states("e1", &obs, t0(), Duration::minutes(30));
        assert_eq!(states.len(), 1);
        let s = &states[0];
        assert_eq!(s.best_price, 2.20);
        assert_eq!(s.best_bookmaker, "unibet");
        assert_eq!(s.book_count, 3);
        assert_relative_eq!(s.market_avg, 2.10, epsilon = 1e-9);
        assert_relative_eq!(s.market_median, 2.10, epsilon = 1e-9);
        // population stdev of {2.0, 2.1, 2.2}
        assert_relative_eq!(s.dispersion, (0.02f64 / 3.0).sqrt(), epsilon = 1e-9);
        assert!(s.is_stale);
        assert_eq!(s.stale_books, vec!["unibet".to_string()]);
    }

    #[test]
    fn best_price_tie_goes_to_first_bookmaker_by_name() {
        let obs = vec![
            snapshot("e1", "home", "williamhill", 2.5, t0()),
            snapshot("e1", "home", "betfair", 2.5, t0()),
        ];
        let states = aggregate_market_states("e1", &obs, t0(), Duration::minutes(30));
        assert_eq!(states[0].best_bookmaker, "betfair");
    }

    #[test]
    fn single_book_has_zero_dispersion() {
        let obs = vec![snapshot("e1", "draw", "pinnacle", 3.4, t0())];
        let states = aggregate_market_states("e1", &obs, t0(), Duration::minutes(30));
        assert_eq!(states[0].dispersion, 0.0);
        assert_eq!(states[0].book_count, 1);
        assert!(!states[0].is_stale);
    }

    struct StaticFeed(Vec<OddsSnapshot>);
    struct BrokenFeed;

    #[async_trait]
    impl OddsFeed for StaticFeed {
        async fn fetch_snapshots(&self, _: DateTime<Utc>) -> anyhow::Result<Vec<OddsSnapshot>> {
            Ok(self.0.clone())
        }
        fn name(&self) -> &str {
            "static"
        }
    }

    #[async_trait]
    impl OddsFeed for BrokenFeed {
        async fn fetch_snapshots(&self, _: DateTime<Utc>) -> anyhow::Result<Vec<OddsSnapshot>> {
            anyhow::bail!("connection refused")
        }
        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn failing_feed_does_not_block_others() {
        let db = Database::open_in_memory().unwrap();
        let tuning = MarketTuning {
            retry_attempts: 2,
            retry_base_ms: 1,
            retry_max_ms: 2,
            ..MarketTuning::default()
        };
        let feeds: Vec<Arc<dyn OddsFeed>> = vec![
            Arc::new(BrokenFeed),
            Arc::new(StaticFeed(vec![
                snapshot("e1", "home", "pinnacle", 2.1, t0()),
                snapshot("e1", "away", "pinnacle", 3.3, t0()),
            ])),
        ];
        let summary = run_ingestion_cycle(&db, &feeds, &tuning, t0()).await;
        assert_eq!(summary.feeds_polled, 2);
        assert_eq!(summary.feeds_failed, 1);
        assert_eq!(summary.snapshots_stored, 2);
        assert_eq!(summary.events_processed, 1);
        assert_eq!(db.get_market_states("e1").unwrap().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn locked_database_does_not_stall_the_runtime() {
        let db = Database::open_in_memory().unwrap();
        let feeds: Vec<Arc<dyn OddsFeed>> = vec![Arc::new(StaticFeed(vec![snapshot(
            "e1", "home", "pinnacle", 2.1, t0(),
        )]))];

        let holder = db.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let locker = std::thread::spawn(move || {
            let _guard = holder.conn().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(300));
        });
        locked_rx.recv().unwrap();

        let started = std::time::Instant::now();
        let ingest = async {
            let summary = run_ingestion_cycle(&db, &feeds, &MarketTuning::default(), t0()).await;
            (summary, started.elapsed())
        };
        let ticker = async {
            for _ in 0..5 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            started.elapsed()
        };
        let ((summary, ingest_done), ticker_done) = tokio::join!(ingest, ticker);
        locker.join().unwrap();

        assert!(ticker_done < ingest_done, "ticker {ticker_done:?} waited on ingestion {ingest_done:?}");
        assert_eq!(summary.snapshots_stored, 1);
        assert_eq!(db.get_market_states("e1").unwrap().len(), 1);
    }
}
