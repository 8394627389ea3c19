//! Rolling probability calibration by (league, market).
//!
//! Each key's factor is `actual win rate / mean model probability` over its
//! settled history. Small samples are shrunk toward the global factor.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::config::CalibrationTuning;
use crate::db::models::BetLifecycle;
use crate::db::Database;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationEntry {
    pub league: String,
    pub market_type: String,
    pub n: i64,
    pub actual_rate: f64,
    pub avg_model_prob: f64,
    pub factor: f64,
}

/// A probability after calibration, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calibrated {
    pub prob: f64,
    pub factor: f64,
    pub source: String,
    pub sample_size: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    entries: BTreeMap<(String, String), CalibrationEntry>,
}

impl CalibrationTable {
    /// Build from settled bets. Pushes and voids carry no win/loss signal and
    /// are ignored, as are rows without a usable model probability.
    pub fn build(bets: &[BetLifecycle], tuning: &CalibrationTuning) -> Self {
        // (league, market) -> (n, wins, sum of model probs)
        let mut acc: BTreeMap<(String, String), (i64, f64, f64)> = BTreeMap::new();
        for bet in bets {
            let Some(result) = bet.result else { continue };
            if !(result.is_win() || result.is_loss()) {
                continue;
            }
            if !(bet.model_prob > 0.0 && bet.model_prob.is_finite()) {
                continue;
            }
            let slot = acc
                .entry((bet.league.clone(), bet.market_type.clone()))
                .or_insert((0, 0.0, 0.0));
            slot.0 += 1;
            if result.is_win() {
                slot.1 += 1.0;
            }
            slot.2 += bet.model_prob;
        }

        let entries = acc
            .into_iter()
            .filter(|(_, (n, _, _))| *n >= tuning.min_rows)
            .map(|((league, market_type), (n, wins, prob_sum))| {
                let actual_rate = wins / n as f64;
                let avg_model_prob = prob_sum / n as f64;
                let factor = if actual_rate > 0.0 && avg_model_prob > 0.0 {
                    actual_rate / avg_model_prob
                } else {
                    1.0
                };
                let entry = CalibrationEntry {
                    league: league.clone(),
                    market_type: market_type.clone(),
                    n,
                    actual_rate,
                    avg_model_prob,
                    factor,
                };
                ((league, market_type), entry)
            })
            .collect();
        CalibrationTable { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CalibrationEntry> {
        self.entries.values()
    }

    pub fn entry(&self, league: &str, market_type: &str) -> Option<&CalibrationEntry> {
        self.entries.get(&(league.to_string(), market_type.to_string()))
    }

    /// Mean factor of well-sampled keys, else of all keys, else 1.0
    pub fn global_factor(&self, min_league_sample: i64) -> f64 {
        let trusted: Vec<f64> = self
            .entries
            .values()
            .filter(|e| e.n >= min_league_sample)
            .map(|e| e.factor)
            .collect();
        let factors: Vec<f64> = if trusted.is_empty() {
            self.entries.values().map(|e| e.factor).collect()
        } else {
            trusted
        };
        if factors.is_empty() {
            1.0
        } else {
            factors.iter().sum::<f64>() / factors.len() as f64
        }
    }

    pub fn calibrate(
        &self,
        model_prob: f64,
        league: &str,
        market_type: &str,
        tuning: &CalibrationTuning,
    ) -> Calibrated {
        let p = clamp_input(model_prob, tuning);
        let global = self.global_factor(tuning.min_league_sample);

        let (factor, source, sample_size) = match self.entry(league, market_type) {
            Some(e) if e.n >= tuning.min_league_sample => {
                let w = tuning.global_shrink_weight;
                (
                    (1.0 - w) * e.factor + w * global,
                    format!("league+market ({} bets)", e.n),
                    e.n,
                )
            }
            Some(e) => {
                let lambda = e.n as f64 / tuning.min_league_sample as f64;
                (
                    lambda * e.factor + (1.0 - lambda) * global,
                    format!("blended ({} bets)", e.n),
                    e.n,
                )
            }
            None => (global, "global".to_string(), 0),
        };

        Calibrated {
            prob: (p * factor).clamp(tuning.prob_floor, tuning.prob_ceiling),
            factor,
            source,
            sample_size,
        }
    }
}

/// Probabilities outside (0, 1) are pulled into the configured bounds.
pub fn clamp_input(p: f64, tuning: &CalibrationTuning) -> f64 {
    if p.is_nan() {
        tuning.prob_floor
    } else if p <= 0.0 || p >= 1.0 {
        p.clamp(tuning.prob_floor, tuning.prob_ceiling)
    } else {
        p
    }
}

/// Calibration table with a time-to-live, owned by whoever prices events.
#[derive(Debug, Clone)]
pub struct CalibrationCache {
    table: CalibrationTable,
    loaded_at: Option<DateTime<Utc>>,
    ttl: Duration,
}

impl CalibrationCache {
    pub fn new(ttl: Duration) -> Self {
        CalibrationCache {
            table: CalibrationTable::default(),
            loaded_at: None,
            ttl,
        }
    }

    /// True before the first load and once the TTL has elapsed. An empty
    /// table from a successful load is kept until it expires.
    pub fn needs_reload(&self, now: DateTime<Utc>) -> bool {
        match self.loaded_at {
            None => true,
            Some(at) => now - at >= self.ttl,
        }
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }

    /// Reload from settled history. On failure the previous table is kept.
    pub fn refresh(&mut self, db: &Database, tuning: &CalibrationTuning, now: DateTime<Utc>) {
        match db.settled_bets(None, None, None) {
            Ok(bets) => {
                self.table = CalibrationTable::build(&bets, tuning);
                self.loaded_at = Some(now);
                info!(
                    "Loaded calibration data for {} league+market combos",
                    self.table.entries.len()
                );
            }
            Err(e) => error!("Calibration reload failed, keeping previous table: {}", e),
        }
    }

    /// Calibrate, reloading first when the table has expired. Never fails.
    pub fn calibrate(
        &mut self,
        db: &Database,
        model_prob: f64,
        league: &str,
        market_type: &str,
        tuning: &CalibrationTuning,
        now: DateTime<Utc>,
    ) -> Calibrated {
        if self.needs_reload(now) {
            self.refresh(db, tuning, now);
        }
        self.table.calibrate(model_prob, league, market_type, tuning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::BetResult;
    use crate::lifecycle::tests::settled_bet;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn history(league: &str, n: usize, wins: usize, model_prob: f64) -> Vec<BetLifecycle> {
        (0..n)
            .map(|i| {
                let mut b = settled_bet(i as i64, "football", league, "moneyline", 1.0);
                b.model_prob = model_prob;
                b.result = Some(if i < wins { BetResult::Won } else { BetResult::Lost });
                b
            })
            .collect()
    }

    #[test]
    fn cold_start_passes_probability_through() {
        let table = CalibrationTable::default();
        let c = table.calibrate(0.55, "epl", "moneyline", &CalibrationTuning::default());
        assert_relative_eq!(c.prob, 0.55);
        assert_eq!(c.source, "global");
        assert_eq!(c.sample_size, 0);
    }

    #[test]
    fn well_sampled_key_is_lightly_shrunk() {
        let tuning = CalibrationTuning::default();
        // 40 bets at 0.5 model prob, 24 wins -> factor 1.2
        let table = CalibrationTable::build(&history("epl", 40, 24, 0.5), &tuning);
        let e = table.entry("epl", "moneyline").unwrap();
        assert_relative_eq!(e.factor, 1.2, epsilon = 1e-12);
        // only key, so global == 1.2 and the blend is 1.2 as well
        let c = table.calibrate(0.5, "epl", "moneyline", &tuning);
        assert_relative_eq!(c.prob, 0.6, epsilon = 1e-12);
        assert_eq!(c.source, "league+market (40 bets)");
    }

    #[test]
    fn small_sample_blends_toward_global() {
        let tuning = CalibrationTuning::default();
        let mut bets = history("epl", 40, 20, 0.5); // factor 1.0, trusted
        bets.extend(history("laliga", 15, 9, 0.5)); // factor 1.2, n=15
        let table = CalibrationTable::build(&bets, &tuning);
        assert_relative_eq!(table.global_factor(30), 1.0, epsilon = 1e-12);
        let c = table.calibrate(0.5, "laliga", "moneyline", &tuning);
        // lambda = 0.5 -> 0.5 * 1.2 + 0.5 * 1.0 = 1.1
        assert_relative_eq!(c.factor, 1.1, epsilon = 1e-12);
        assert_eq!(c.source, "blended (15 bets)");
    }

    #[test]
    fn keys_below_min_rows_are_ignored() {
        let table = CalibrationTable::build(&history("epl", 9, 9, 0.5), &CalibrationTuning::default());
        assert!(table.is_empty());
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        let table = CalibrationTable::default();
        let tuning = CalibrationTuning::default();
        assert_relative_eq!(table.calibrate(1.4, "x", "y", &tuning).prob, 0.99);
        assert_relative_eq!(table.calibrate(-0.2, "x", "y", &tuning).prob, 0.01);
    }

    #[test]
    fn reload_is_a_function_of_time() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let mut cache = CalibrationCache::new(Duration::hours(1));
        assert!(cache.needs_reload(t0));
        cache.table = CalibrationTable::build(&history("epl", 10, 5, 0.5), &CalibrationTuning::default());
        cache.loaded_at = Some(t0);
        assert!(!cache.needs_reload(t0 + Duration::minutes(59)));
        assert!(cache.needs_reload(t0 + Duration::minutes(60)));
    }

    #[test]
    fn refresh_reads_settled_history() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let mut cache = CalibrationCache::new(Duration::hours(1));
        let c = cache.calibrate(&db, 0.4, "epl", "moneyline", &CalibrationTuning::default(), now);
        assert_relative_eq!(c.prob, 0.4);
        assert_eq!(cache.loaded_at(), Some(now));
    }

    #[test]
    fn empty_history_is_not_reloaded_within_ttl() {
        let db = Database::open_in_memory().unwrap();
        let tuning = CalibrationTuning::default();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let mut cache = CalibrationCache::new(Duration::hours(1));
        cache.calibrate(&db, 0.4, "epl", "moneyline", &tuning, t0);
        assert!(cache.table().is_empty());
        assert!(!cache.needs_reload(t0 + Duration::minutes(30)));

        cache.calibrate(&db, 0.4, "epl", "moneyline", &tuning, t0 + Duration::minutes(30));
        assert_eq!(cache.loaded_at(), Some(t0));

        cache.calibrate(&db, 0.4, "epl", "moneyline", &tuning, t0 + Duration::hours(1));
        assert_eq!(cache.loaded_at(), Some(t0 + Duration::hours(1)));
    }
}
