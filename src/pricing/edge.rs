use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::EdgeTuning;
use crate::db::market::EventSummary;
use crate::db::models::*;
use crate::db::Database;
use crate::error::Result;

/// Edge% of a book price over the fair price
pub fn compute_edge(book_odds: f64, fair_odds: f64) -> f64 {
    if fair_odds <= 1.0 {
        return 0.0;
    }
    (book_odds / fair_odds - 1.0) * 100.0
}

/// Expected value per unit staked, in percent
pub fn compute_ev(prob: f64, book_odds: f64) -> f64 {
    if prob <= 0.0 || book_odds <= 1.0 {
        return 0.0;
    }
    (prob * (book_odds - 1.0) - (1.0 - prob)) * 100.0
}

/// Closing-line value: positive when the market closed shorter than the
/// price taken. Bet 2.00, close 1.80 gives -10%.
pub fn compute_clv(bet_odds: f64, closing_odds: f64) -> f64 {
    if bet_odds <= 0.0 {
        return 0.0;
    }
    (closing_odds / bet_odds - 1.0) * 100.0
}

/// Observation window whose best price is the closing line
pub fn closing_window(start_time: DateTime<Utc>, t: &EdgeTuning) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        start_time - Duration::minutes(t.close_before_minutes),
        start_time + Duration::minutes(t.close_after_minutes),
    )
}

pub fn minutes_to_kickoff(start_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (start_time - now).num_seconds() as f64 / 60.0
}

pub fn timing_bucket(minutes_to_kickoff: f64) -> TimingBucket {
    let m = minutes_to_kickoff.max(0.0);
    if m < 60.0 {
        TimingBucket::UnderOneHour
    } else if m < 180.0 {
        TimingBucket::OneToThreeHours
    } else if m < 360.0 {
        TimingBucket::ThreeToSixHours
    } else if m < 720.0 {
        TimingBucket::SixToTwelveHours
    } else if m < 1440.0 {
        TimingBucket::TwelveToTwentyFourHours
    } else {
        TimingBucket::OverADay
    }
}

/// Price-movement tags for a selection's ordered price history (all books).
pub fn detect_sharpness(history: &[OddsSnapshot], bet_odds: f64, t: &EdgeTuning) -> Vec<SharpnessTag> {
    let mut tags = Vec::new();
    if history.len() < 2 {
        return tags;
    }

    let first = history[0].price;
    let last = history[history.len() - 1].price;

    if last < first * (1.0 - t.steam_threshold) {
        tags.push(SharpnessTag::SteamMoveDown);
    } else if last > first * (1.0 + t.steam_threshold) {
        tags.push(SharpnessTag::SteamMoveUp);
    }

    if bet_odds > last * (1.0 + t.best_price_margin) {
        tags.push(SharpnessTag::GotBestPrice);
    } else if bet_odds < last * (1.0 - t.best_price_margin) {
        tags.push(SharpnessTag::PriceDropped);
    }

    if t.trend_points >= 2 && history.len() >= t.trend_points {
        let recent = &history[history.len() - t.trend_points..];
        if recent.windows(2).all(|w| w[1].price < w[0].price) {
            tags.push(SharpnessTag::ConsistentShortening);
        } else if recent.windows(2).all(|w| w[1].price > w[0].price) {
            tags.push(SharpnessTag::ConsistentDrifting);
        }
    }

    let mut latest: BTreeMap<&str, f64> = BTreeMap::new();
    for obs in history {
        latest.insert(obs.bookmaker.as_str(), obs.price);
    }
    if latest.len() >= t.min_spread_books {
        let (min, max) = latest
            .values()
            .fold((f64::MAX, f64::MIN), |(lo, hi), &p| (lo.min(p), hi.max(p)));
        let mean = latest.values().sum::<f64>() / latest.len() as f64;
        if mean > 0.0 && (max - min) / mean > t.high_spread_threshold {
            tags.push(SharpnessTag::HighBookSpread);
        }
    }

    tags
}

/// Sharpness tags for anything bet-like, read from stored history
pub fn sharpness_for(db: &Database, rec: &Recommendation, t: &EdgeTuning) -> Result<Vec<SharpnessTag>> {
    let history = db.price_history(rec.event_id(), rec.market_type(), rec.selection(), rec.line())?;
    Ok(detect_sharpness(&history, rec.price(), t))
}

pub fn ranking_score(edge: &EdgeResult, t: &EdgeTuning) -> f64 {
    let best_price = if edge.sharpness_tags.contains(&SharpnessTag::GotBestPrice) {
        t.sharpness_bonus
    } else {
        0.0
    };
    let dropped = if edge.sharpness_tags.contains(&SharpnessTag::PriceDropped) {
        -t.sharpness_bonus
    } else {
        0.0
    };
    t.ev_weight * edge.ev_pct
        + t.edge_weight * edge.edge_pct
        + t.confidence_weight * edge.confidence * t.confidence_scale
        + t.clv_weight * edge.expected_clv_pct.unwrap_or(0.0)
        + t.sharpness_weight * best_price
        + t.sharpness_weight * dropped
}

/// Highest score first, at most `top_n`
pub fn rank_candidates(candidates: Vec<EdgeResult>, t: &EdgeTuning) -> Vec<EdgeResult> {
    let mut scored: Vec<(f64, EdgeResult)> = candidates
        .into_iter()
        .map(|c| (ranking_score(&c, t), c))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().take(t.top_n).map(|(_, c)| c).collect()
}

/// Join market states with fair prices and keep the positive-EV selections.
pub fn build_edge_results(
    event: &EventSummary,
    states: &[MarketState],
    fair: &[FairOddsResult],
    gating_status: GatingStatus,
    expected_clv_pct: Option<f64>,
    now: DateTime<Utc>,
) -> Vec<EdgeResult> {
    let bucket = timing_bucket(minutes_to_kickoff(event.start_time, now));
    let fair_by_key: BTreeMap<(&str, &str, String), &FairOddsResult> = fair
        .iter()
        .map(|f| ((f.market_type.as_str(), f.selection.as_str(), line_key(f.line)), f))
        .collect();

    let mut out = Vec::new();
    for ms in states {
        let key = (ms.market_type.as_str(), ms.selection.as_str(), line_key(ms.line));
        let Some(fo) = fair_by_key.get(&key) else { continue };
        if fo.fair_odds <= 1.0 {
            continue;
        }
        let edge_pct = compute_edge(ms.best_price, fo.fair_odds);
        let ev_pct = compute_ev(fo.calibrated_prob, ms.best_price);
        if ev_pct <= 0.0 {
            debug!(
                "No value on {}/{}/{} at {:.3} (fair {:.3})",
                event.event_id, ms.market_type, ms.selection, ms.best_price, fo.fair_odds
            );
            continue;
        }
        out.push(EdgeResult {
            event_id: event.event_id.clone(),
            sport: event.sport.clone(),
            league: event.league.clone(),
            league_name: event.league_name.clone(),
            home_team: event.home_team.clone(),
            away_team: event.away_team.clone(),
            market_type: ms.market_type.clone(),
            selection: ms.selection.clone(),
            line: ms.line,
            book_odds: ms.best_price,
            bookmaker: ms.best_bookmaker.clone(),
            fair_odds: fo.fair_odds,
            model_prob: fo.model_prob,
            calibrated_prob: fo.calibrated_prob,
            edge_pct,
            ev_pct,
            expected_clv_pct,
            confidence: fo.confidence,
            confidence_badge: fo.confidence_badge,
            sharpness_tags: Vec::new(),
            timing_bucket: bucket,
            start_time: event.start_time,
            volatility: fo.volatility,
            gating_status,
        });
    }
    out
}

/// Record the closing line of a tracked bet once its window has closed.
/// Returns `None` when no price was seen in the window or a record exists.
pub fn capture_clv(
    db: &Database,
    rec: &Recommendation,
    t: &EdgeTuning,
    now: DateTime<Utc>,
) -> Result<Option<ClvRecord>> {
    let Recommendation::Tracked(bet) = rec else {
        return Ok(None);
    };
    let (from, to) = closing_window(bet.start_time, t);
    let Some(closing) = db.closing_price(
        rec.event_id(),
        rec.market_type(),
        rec.selection(),
        rec.line(),
        from,
        to,
    )?
    else {
        return Ok(None);
    };
    let record = ClvRecord {
        id: None,
        bet_id: bet.id,
        event_id: bet.event_id.clone(),
        market_type: bet.market_type.clone(),
        selection: bet.selection.clone(),
        line: bet.line,
        bet_odds: rec.price(),
        closing_odds: closing,
        clv_pct: compute_clv(rec.price(), closing),
        close_window_minutes: t.close_before_minutes,
        close_reference: bet.start_time,
        created_at: now,
    };
    if db.insert_clv_record(&record)? {
        Ok(Some(record))
    } else {
        Ok(None)
    }
}
