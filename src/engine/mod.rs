use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Tuning;
use crate::db::models::*;
use crate::db::Database;
use crate::error::{PipelineError, Result};
use crate::gating::{self, PromotionReport};
use crate::lifecycle;
use crate::market::{self, compute_market_state, persist_market_states, Backoff, IngestionSummary, OddsFeed};
use crate::pricing::edge::{build_edge_results, capture_clv, rank_candidates, sharpness_for};
use crate::pricing::{compute_fair_odds, CalibrationCache};

/// Result of pricing one event against a batch of model probabilities
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventEvaluation {
    pub event_id: String,
    pub fair_odds: Vec<FairOddsResult>,
    pub candidates: Vec<EdgeResult>,
    pub created: Vec<i64>,
    pub rejected: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClvSweep {
    pub checked: usize,
    pub captured: usize,
    pub no_price: usize,
    pub failed: usize,
}

/// Runs the decision pipeline: ingestion, pricing, gating and lifecycle.
pub struct Engine {
    db: Database,
    tuning: Tuning,
    feeds: Vec<Arc<dyn OddsFeed>>,
    /// Calibration table, reloaded lazily when expired.
    calibration: Mutex<CalibrationCache>,
}

impl Engine {
    pub fn new(db: Database, tuning: Tuning, feeds: Vec<Arc<dyn OddsFeed>>) -> Self {
        let ttl = Duration::seconds(tuning.calibration.cache_ttl_secs);
        Engine {
            db,
            tuning,
            feeds,
            calibration: Mutex::new(CalibrationCache::new(ttl)),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    fn backoff(&self) -> Backoff {
        Backoff::from_tuning(&self.tuning.market)
    }

    pub async fn run_ingestion_cycle(&self, now: DateTime<Utc>) -> IngestionSummary {
        market::run_ingestion_cycle(&self.db, &self.feeds, &self.tuning.market, now).await
    }

    /// Price an event's selections, then create lifecycle candidates for the
    /// best positive-EV ones. DISABLED segments are priced but never offered.
    pub fn evaluate_event(
        &self,
        event_id: &str,
        probabilities: &[ModelProbability],
        now: DateTime<Utc>,
    ) -> Result<EventEvaluation> {
        let event = self
            .db
            .event_summary(event_id)?
            .ok_or_else(|| PipelineError::UnknownEvent(event_id.to_string()))?;

        let mut states = self.db.get_market_states(event_id)?;
        if states.is_empty() {
            let stale_after = Duration::minutes(self.tuning.market.stale_after_minutes);
            states = compute_market_state(&self.db, event_id, now, stale_after)?;
            persist_market_states(&self.db, &states)?;
        }
        let dispersion: BTreeMap<(&str, &str, String), f64> = states
            .iter()
            .map(|s| ((s.market_type.as_str(), s.selection.as_str(), line_key(s.line)), s.dispersion))
            .collect();

        let mut fair = Vec::with_capacity(probabilities.len());
        {
            let mut cache = self.calibration.lock().map_err(|_| PipelineError::LockPoisoned)?;
            for mp in probabilities {
                let calibrated = cache.calibrate(
                    &self.db,
                    mp.probability,
                    &event.league,
                    &mp.market_type,
                    &self.tuning.calibration,
                    now,
                );
                let disp = dispersion
                    .get(&(mp.market_type.as_str(), mp.selection.as_str(), line_key(mp.line)))
                    .copied()
                    .unwrap_or(0.0);
                fair.push(compute_fair_odds(
                    event_id,
                    &mp.market_type,
                    &mp.selection,
                    mp.line,
                    mp.probability,
                    &calibrated,
                    disp,
                    &self.tuning.calibration,
                    &self.tuning.confidence,
                ));
            }
        }
        for fo in &fair {
            self.db.upsert_fair_odds(fo, now)?;
        }

        // Gating and expected CLV are per segment, i.e. per market type here.
        let markets: Vec<&str> = {
            let mut m: Vec<&str> = fair.iter().map(|f| f.market_type.as_str()).collect();
            m.sort_unstable();
            m.dedup();
            m
        };
        let mut edges = Vec::new();
        for market_type in markets {
            let segment = Segment::new(&event.sport, &event.league, market_type);
            let status = self
                .db
                .get_eligibility(&segment)?
                .map(|row| row.status)
                .unwrap_or(GatingStatus::LearningOnly);
            if status == GatingStatus::Disabled {
                debug!("Skipping disabled segment {}", segment);
                continue;
            }
            let expected_clv = self.db.segment_avg_clv(&segment)?;
            let market_states: Vec<MarketState> =
                states.iter().filter(|s| s.market_type == market_type).cloned().collect();
            let market_fair: Vec<FairOddsResult> =
                fair.iter().filter(|f| f.market_type == market_type).cloned().collect();
            edges.extend(build_edge_results(&event, &market_states, &market_fair, status, expected_clv, now));
        }

        for edge in &mut edges {
            let rec = Recommendation::Candidate(edge.clone());
            edge.sharpness_tags = sharpness_for(&self.db, &rec, &self.tuning.edge)?;
        }
        let candidates = rank_candidates(edges, &self.tuning.edge);

        let mut evaluation = EventEvaluation {
            event_id: event_id.to_string(),
            fair_odds: fair,
            ..Default::default()
        };
        for edge in &candidates {
            let bet = NewBet::from_edge(edge, self.tuning.edge.default_stake_units);
            match lifecycle::create_candidate(&self.db, &bet, &self.tuning.lifecycle, now) {
                Ok(id) => evaluation.created.push(id),
                Err(e) if e.is_rejection() => evaluation.rejected += 1,
                Err(e) => {
                    error!("Failed to create candidate {}: {}", bet.identity(), e);
                    evaluation.failed += 1;
                }
            }
        }
        info!(
            "Evaluated {}: {} priced, {} with value, {} created, {} rejected",
            event_id,
            evaluation.fair_odds.len(),
            candidates.len(),
            evaluation.created.len(),
            evaluation.rejected
        );
        evaluation.candidates = candidates;
        Ok(evaluation)
    }

    /// Record closing lines for bets whose closing window has passed.
    /// Bets older than the lookback are no longer retried.
    pub fn capture_closing_lines(&self, now: DateTime<Utc>) -> Result<ClvSweep> {
        let cutoff = now - Duration::minutes(self.tuning.edge.close_after_minutes);
        let oldest = cutoff - Duration::hours(self.tuning.edge.close_lookback_hours);
        let bets = self.db.bets_awaiting_clv(oldest, cutoff)?;
        let mut sweep = ClvSweep {
            checked: bets.len(),
            ..Default::default()
        };
        for bet in bets {
            let bet_id = bet.id;
            match capture_clv(&self.db, &Recommendation::Tracked(bet), &self.tuning.edge, now) {
                Ok(Some(rec)) => {
                    debug!("CLV for bet #{}: {:+.2}%", bet_id, rec.clv_pct);
                    sweep.captured += 1;
                }
                Ok(None) => sweep.no_price += 1,
                Err(e) => {
                    warn!("CLV capture failed for bet #{}: {}", bet_id, e);
                    sweep.failed += 1;
                }
            }
        }
        if sweep.checked > 0 {
            info!(
                "CLV sweep: {} checked, {} captured, {} without closing price",
                sweep.checked, sweep.captured, sweep.no_price
            );
        }
        Ok(sweep)
    }

    pub fn run_promotion_cycle(&self, now: DateTime<Utc>) -> Result<PromotionReport> {
        gating::run_promotion_cycle(&self.db, &self.tuning.gating, &self.backoff(), now)
    }

    pub fn settle(&self, bet_id: i64, settlement: &Settlement, now: DateTime<Utc>) -> Result<BetLifecycle> {
        lifecycle::settle_bet(&self.db, bet_id, settlement, now)
    }

    pub fn transition(
        &self,
        bet_id: i64,
        to: BetStatus,
        details: &serde_json::Value,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<BetLifecycle> {
        lifecycle::transition(&self.db, bet_id, to, details, source, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::market::tests::snapshot;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 20, 9, 0, 0).unwrap()
    }

    fn engine_with_prices() -> Engine {
        let db = Database::open_in_memory().unwrap();
        let seen = now() - Duration::minutes(5);
        let snaps = vec![
            snapshot("e1", "home", "pinnacle", 2.10, seen),
            snapshot("e1", "home", "bet365", 2.05, seen),
            snapshot("e1", "away", "pinnacle", 3.40, seen),
            snapshot("e1", "away", "bet365", 3.50, seen),
        ];
        market::ingest_batch(&db, &snaps).unwrap();
        Engine::new(db, Tuning::default(), vec![])
    }

    fn probs() -> Vec<ModelProbability> {
        vec![
            ModelProbability {
                market_type: "moneyline".into(),
                selection: "home".into(),
                line: None,
                probability: 0.52,
            },
            ModelProbability {
                market_type: "moneyline".into(),
                selection: "away".into(),
                line: None,
                probability: 0.25,
            },
        ]
    }

    #[test]
    fn evaluation_creates_only_positive_ev_candidates() {
        let engine = engine_with_prices();
        let eval = engine.evaluate_event("e1", &probs(), now()).unwrap();
        assert_eq!(eval.fair_odds.len(), 2);
        // home: 0.52 * 2.10 > 1, away: 0.25 * 3.50 < 1
        assert_eq!(eval.candidates.len(), 1);
        assert_eq!(eval.candidates[0].selection, "home");
        assert_eq!(eval.candidates[0].bookmaker, "pinnacle");
        assert_eq!(eval.candidates[0].gating_status, GatingStatus::LearningOnly);
        assert_eq!(eval.created.len(), 1);

        // evaluating again hits the duplicate guard
        let again = engine.evaluate_event("e1", &probs(), now()).unwrap();
        assert!(again.created.is_empty());
        assert_eq!(again.rejected, 1);
        assert_eq!(engine.db().get_fair_odds("e1").unwrap().len(), 2);
    }

    #[test]
    fn disabled_segment_gets_no_candidates() {
        let engine = engine_with_prices();
        gating::override_segment(
            engine.db(),
            &Segment::new("football", "epl", "moneyline"),
            GatingStatus::Disabled,
            "model under review",
            now(),
        )
        .unwrap();
        let eval = engine.evaluate_event("e1", &probs(), now()).unwrap();
        assert!(eval.candidates.is_empty());
        assert!(eval.created.is_empty());
    }

    #[test]
    fn unknown_event_is_rejected() {
        let engine = engine_with_prices();
        let err = engine.evaluate_event("nope", &probs(), now()).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownEvent(_)));
    }

    #[test]
    fn closing_sweep_then_settlement_carries_clv() {
        let engine = engine_with_prices();
        let eval = engine.evaluate_event("e1", &probs(), now()).unwrap();
        let bet_id = eval.created[0];
        let kickoff = Utc.with_ymd_and_hms(2026, 10, 20, 15, 0, 0).unwrap();
        engine
            .db()
            .insert_snapshot(&snapshot("e1", "home", "pinnacle", 1.89, kickoff - Duration::minutes(2)))
            .unwrap();

        let sweep = engine.capture_closing_lines(kickoff + Duration::minutes(10)).unwrap();
        assert_eq!(sweep.captured, 1);
        let settled = engine
            .settle(
                bet_id,
                &Settlement {
                    result: BetResult::Won,
                    profit_loss: 1.1,
                    closing_odds: None,
                },
                kickoff + Duration::hours(2),
            )
            .unwrap();
        assert_eq!(settled.closing_odds, Some(1.89));
        assert!((settled.clv_pct.unwrap() - (1.89 / 2.10 - 1.0) * 100.0).abs() < 1e-9);
    }

    #[test]
    fn closing_sweep_records_max_price_inside_window() {
        let engine = engine_with_prices();
        let bet_id = engine.evaluate_event("e1", &probs(), now()).unwrap().created[0];
        let unpriced = crate::db::bets::tests::insert_sample_bet(engine.db(), "e2");
        let kickoff = Utc.with_ymd_and_hms(2026, 10, 20, 15, 0, 0).unwrap();
        for (book, price, before) in [("pinnacle", 1.89, 2), ("bet365", 1.95, 4), ("pinnacle", 2.40, 30)] {
            engine
                .db()
                .insert_snapshot(&snapshot("e1", "home", book, price, kickoff - Duration::minutes(before)))
                .unwrap();
        }

        let sweep = engine.capture_closing_lines(kickoff + Duration::minutes(10)).unwrap();
        assert_eq!(sweep.checked, 2);
        assert_eq!(sweep.captured, 1);
        assert_eq!(sweep.no_price, 1);
        assert_eq!(sweep.failed, 0);

        let rec = engine.db().clv_record_for_bet(bet_id).unwrap().unwrap();
        assert_eq!(rec.bet_odds, 2.10);
        assert_eq!(rec.closing_odds, 1.95);
        assert!((rec.clv_pct - (1.95 / 2.10 - 1.0) * 100.0).abs() < 1e-9);
        assert!(engine.db().clv_record_for_bet(unpriced).unwrap().is_none());

        let again = engine.capture_closing_lines(kickoff + Duration::minutes(20)).unwrap();
        assert_eq!(again.checked, 1);
        assert_eq!(again.captured, 0);
    }

    #[test]
    fn unpriced_bet_leaves_the_sweep_after_lookback() {
        let engine = Engine::new(Database::open_in_memory().unwrap(), Tuning::default(), vec![]);
        crate::db::bets::tests::insert_sample_bet(engine.db(), "e1");
        let kickoff = Utc.with_ymd_and_hms(2026, 10, 20, 15, 0, 0).unwrap();

        let day_one = engine.capture_closing_lines(kickoff + Duration::days(1)).unwrap();
        assert_eq!(day_one.checked, 1);
        assert_eq!(day_one.no_price, 1);

        for days in [3, 30, 365] {
            let later = engine.capture_closing_lines(kickoff + Duration::days(days)).unwrap();
            assert_eq!(later.checked, 0);
        }
    }
}
