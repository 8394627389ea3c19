//! Property-based tests for the pricing and aggregation invariants.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use sharpline::config::{CalibrationTuning, ConfidenceTuning};
use sharpline::db::models::OddsSnapshot;
use sharpline::db::Database;
use sharpline::market::{aggregate_market_states, ingest};
use sharpline::pricing::edge::{compute_clv, compute_ev};
use sharpline::pricing::{compute_fair_odds, CalibrationTable};

fn snapshot(bookmaker: &str, price: f64, minutes: i64) -> OddsSnapshot {
    let t0 = Utc.with_ymd_and_hms(2026, 10, 20, 12, 0, 0).unwrap();
    OddsSnapshot {
        id: None,
        event_id: "ev".to_string(),
        sport: "football".to_string(),
        league: "soccer_epl".to_string(),
        league_name: "EPL".to_string(),
        home_team: "Arsenal".to_string(),
        away_team: "Chelsea".to_string(),
        start_time: t0 + Duration::hours(6),
        market_type: "moneyline".to_string(),
        selection: "Arsenal".to_string(),
        line: None,
        bookmaker: bookmaker.to_string(),
        price,
        observed_at: t0 + Duration::minutes(minutes),
    }
}

// ── Edge / EV / CLV ─────────────────────────────────────────

proptest! {
    /// EV grows with probability at a fixed price.
    #[test]
    fn ev_increases_with_probability(
        p in 0.01f64..0.98,
        dp in 0.001f64..0.02,
        odds in 1.01f64..20.0,
    ) {
        let ev1 = compute_ev(p, odds);
        let ev2 = compute_ev((p + dp).min(0.99), odds);
        prop_assert!(ev2 >= ev1, "EV must rise with p: {ev1} > {ev2}");
    }

    /// EV grows with the price at a fixed probability.
    #[test]
    fn ev_increases_with_odds(
        p in 0.01f64..0.99,
        odds in 1.01f64..20.0,
        d in 0.01f64..2.0,
    ) {
        prop_assert!(compute_ev(p, odds + d) > compute_ev(p, odds));
    }

    /// Beating the close is positive CLV, never the other way round.
    #[test]
    fn clv_sign_follows_closing_price(bet in 1.01f64..10.0, close in 1.01f64..10.0) {
        let clv = compute_clv(bet, close);
        if close < bet {
            prop_assert!(clv < 0.0);
        } else if close > bet {
            prop_assert!(clv > 0.0);
        }
    }
}

// ── Calibration / fair odds ─────────────────────────────────

proptest! {
    /// Fair odds are the reciprocal of the calibrated probability.
    #[test]
    fn fair_odds_times_probability_is_one(p in -0.5f64..1.5, dispersion in 0.0f64..0.5) {
        let tuning = CalibrationTuning::default();
        let calibrated = CalibrationTable::default().calibrate(p, "soccer_epl", "moneyline", &tuning);
        let fo = compute_fair_odds(
            "ev", "moneyline", "Arsenal", None, p, &calibrated, dispersion,
            &tuning, &ConfidenceTuning::default(),
        );
        prop_assert!((fo.fair_odds * fo.calibrated_prob - 1.0).abs() < 1e-9);
        prop_assert!(fo.confidence >= 0.1 && fo.confidence <= 1.0);
    }

    /// Calibrating twice without new history gives the same answer.
    #[test]
    fn calibration_is_idempotent(p in 0.01f64..0.99) {
        let tuning = CalibrationTuning::default();
        let table = CalibrationTable::default();
        let a = table.calibrate(p, "soccer_epl", "totals", &tuning);
        let b = table.calibrate(p, "soccer_epl", "totals", &tuning);
        prop_assert_eq!(a, b);
    }
}

// ── Market aggregation ──────────────────────────────────────

proptest! {
    /// Best price is the max over each bookmaker's latest observation.
    #[test]
    fn best_price_is_max_of_latest_per_book(
        early in prop::collection::vec(1.01f64..15.0, 3),
        late in prop::collection::vec(1.01f64..15.0, 3),
    ) {
        let books = ["alpha", "bravo", "charlie"];
        let mut obs = Vec::new();
        for (i, book) in books.iter().enumerate() {
            obs.push(snapshot(book, early[i], 0));
            obs.push(snapshot(book, late[i], 10));
        }
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 12, 15, 0).unwrap();
        let states = aggregate_market_states("ev", &obs, now, Duration::minutes(30));
        prop_assert_eq!(states.len(), 1);
        let st = &states[0];
        let max = late.iter().cloned().fold(f64::MIN, f64::max);
        prop_assert_eq!(st.best_price, max);
        prop_assert_eq!(st.prices.get(&st.best_bookmaker).copied(), Some(max));
        prop_assert_eq!(st.book_count, 3);
    }

    /// Prices at or below evens are never stored.
    #[test]
    fn prices_at_or_below_one_are_rejected(price in -5.0f64..=1.0) {
        let db = Database::open_in_memory().unwrap();
        prop_assert!(ingest(&db, &snapshot("alpha", price, 0)).is_err());
        prop_assert!(db.snapshots_for_event("ev").unwrap().is_empty());
    }
}
