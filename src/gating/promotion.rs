use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use super::scoring::{score_segment, SegmentScore};
use crate::config::GatingTuning;
use crate::db::models::*;
use crate::db::Database;
use crate::error::Result;
use crate::market::retry::{retry_sync, Backoff};

/// Outcome of one automatic promotion cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PromotionReport {
    pub evaluated: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub disabled: usize,
    pub new: usize,
    pub unchanged: usize,
    pub skipped_overrides: usize,
    pub failed: usize,
    pub changes: Vec<GatingChange>,
}

/// Group settled bets by segment and score the ones with enough history.
pub fn aggregate_segments(bets: &[BetLifecycle], t: &GatingTuning) -> BTreeMap<Segment, SegmentScore> {
    let mut rows: BTreeMap<Segment, Vec<(f64, f64, bool, Option<f64>)>> = BTreeMap::new();
    for bet in bets {
        if bet.status != BetStatus::Settled {
            continue;
        }
        rows.entry(bet.segment()).or_default().push((
            bet.profit_loss.unwrap_or(0.0),
            bet.stake_units,
            bet.result.map(|r| r.is_win()).unwrap_or(false),
            bet.clv_pct,
        ));
    }
    rows.into_iter()
        .filter(|(_, r)| r.len() as i64 >= t.min_segment_bets)
        .map(|(seg, r)| (seg, score_segment(&r, t)))
        .collect()
}

/// Next automatic status for a segment and the reason for a move.
/// DISABLED is sticky; PRODUCTION can only fall back to LEARNING_ONLY.
pub fn decide(current: GatingStatus, s: &SegmentScore, t: &GatingTuning) -> (GatingStatus, Option<String>) {
    match current {
        GatingStatus::Disabled => (GatingStatus::Disabled, None),
        GatingStatus::LearningOnly => {
            if s.total_bets >= t.promote_min_bets
                && s.roi_pct > t.promote_min_roi
                && s.clv_avg >= t.promote_min_clv
                && s.stability >= t.promote_min_stability
            {
                let reason = format!(
                    "Promoted: {} bets, ROI {:.1}%, CLV {:+.2}%, stability {:.2}",
                    s.total_bets, s.roi_pct, s.clv_avg, s.stability
                );
                (GatingStatus::Production, Some(reason))
            } else if s.total_bets >= t.disable_min_bets && s.roi_pct < t.disable_max_roi {
                let reason = format!("Disabled: {} bets, ROI {:.1}%", s.total_bets, s.roi_pct);
                (GatingStatus::Disabled, Some(reason))
            } else {
                (GatingStatus::LearningOnly, None)
            }
        }
        GatingStatus::Production => {
            let roi_breach = s.roi_pct < t.demote_max_roi;
            let clv_breach = s.clv_avg < t.demote_max_clv && s.total_bets >= t.demote_clv_min_bets;
            if s.total_bets >= t.demote_min_bets && (roi_breach || clv_breach) {
                let reason = format!(
                    "Demoted: {} bets, ROI {:.1}%, CLV {:+.2}%",
                    s.total_bets, s.roi_pct, s.clv_avg
                );
                (GatingStatus::LearningOnly, Some(reason))
            } else {
                (GatingStatus::Production, None)
            }
        }
    }
}

fn eligibility_row(
    segment: &Segment,
    status: GatingStatus,
    s: &SegmentScore,
    change_reason: Option<String>,
    now: DateTime<Utc>,
) -> EligibilityMap {
    EligibilityMap {
        sport: segment.sport.clone(),
        league: segment.league.clone(),
        market_type: segment.market_type.clone(),
        status,
        total_bets: s.total_bets,
        roi_pct: s.roi_pct,
        clv_avg: s.clv_avg,
        stability_score: s.stability,
        drawdown_pct: s.drawdown_pct,
        recency_bonus: s.recency_bonus,
        composite_score: s.composite,
        manual_override: false,
        override_reason: None,
        change_reason,
        updated_at: Some(now),
    }
}

/// Recompute every segment from settled history and apply the state
/// machine. Overridden segments are left alone; one segment failing to
/// persist does not stop the others.
pub fn run_promotion_cycle(
    db: &Database,
    t: &GatingTuning,
    backoff: &Backoff,
    now: DateTime<Utc>,
) -> Result<PromotionReport> {
    let settled = retry_sync(backoff, "settled history read", || db.settled_bets(None, None, None))?;
    let scores = aggregate_segments(&settled, t);
    let stored: BTreeMap<Segment, EligibilityMap> = retry_sync(backoff, "eligibility read", || {
        db.list_eligibility(None)
    })?
    .into_iter()
    .map(|row| (row.segment(), row))
    .collect();

    let mut report = PromotionReport::default();
    for (segment, score) in &scores {
        let existing = stored.get(segment);
        if existing.is_some_and(|row| row.manual_override) {
            report.skipped_overrides += 1;
            continue;
        }
        report.evaluated += 1;

        let current = existing.map(|row| row.status).unwrap_or(GatingStatus::LearningOnly);
        let (next, reason) = decide(current, score, t);
        let change = (next != current).then(|| GatingChange {
            id: None,
            sport: segment.sport.clone(),
            league: segment.league.clone(),
            market_type: segment.market_type.clone(),
            old_status: Some(current),
            new_status: next,
            reason: reason.clone().unwrap_or_default(),
            manual: false,
            changed_at: now,
        });
        let row = eligibility_row(segment, next, score, reason, now);

        let saved = retry_sync(backoff, "segment evaluation write", || {
            db.save_segment_evaluation(&row, change.as_ref())
        });
        match saved {
            Ok(true) => {}
            Ok(false) => {
                report.skipped_overrides += 1;
                continue;
            }
            Err(e) => {
                error!("Failed to persist gating for {}: {}", segment, e);
                report.failed += 1;
                continue;
            }
        }

        if existing.is_none() {
            report.new += 1;
        }
        match (current, next) {
            (a, b) if a == b => {
                if existing.is_some() {
                    report.unchanged += 1;
                }
            }
            (_, GatingStatus::Production) => report.promoted += 1,
            (_, GatingStatus::Disabled) => report.disabled += 1,
            _ => report.demoted += 1,
        }
        if let Some(change) = change {
            info!(
                "Gating {}: {} -> {} ({})",
                segment, current, change.new_status, change.reason
            );
            report.changes.push(change);
        }
    }

    info!(
        "Promotion cycle: {} evaluated, {} promoted, {} demoted, {} disabled, {} new, {} overrides skipped, {} failed",
        report.evaluated,
        report.promoted,
        report.demoted,
        report.disabled,
        report.new,
        report.skipped_overrides,
        report.failed
    );
    Ok(report)
}

// ── Queries ───────────────────────────────────────────────────────────────────

/// Eligibility rows with live scores from settled history. Stored statuses
/// and overrides are overlaid when readable; otherwise segments fall back to
/// LEARNING_ONLY.
pub fn eligibility_view(db: &Database, sport: Option<&str>, t: &GatingTuning, now: DateTime<Utc>) -> Result<Vec<EligibilityMap>> {
    let settled = db.settled_bets(sport, None, None)?;
    let scores = aggregate_segments(&settled, t);
    let mut stored: BTreeMap<Segment, EligibilityMap> = match db.list_eligibility(sport) {
        Ok(rows) => rows.into_iter().map(|r| (r.segment(), r)).collect(),
        Err(e) => {
            warn!("Eligibility table unreadable, using default statuses: {}", e);
            BTreeMap::new()
        }
    };

    let mut out = Vec::new();
    for (segment, score) in &scores {
        let mut row = eligibility_row(segment, GatingStatus::LearningOnly, score, None, now);
        if let Some(saved) = stored.remove(segment) {
            row.status = saved.status;
            row.manual_override = saved.manual_override;
            row.override_reason = saved.override_reason;
            row.change_reason = saved.change_reason;
            row.updated_at = saved.updated_at;
        }
        out.push(row);
    }
    // stored rows without enough settled history (e.g. manual pins)
    out.extend(stored.into_values());
    out.sort_by(|a, b| b.composite_score.total_cmp(&a.composite_score));
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupSummary {
    pub key: String,
    pub bets: i64,
    pub roi_pct: f64,
    pub clv_avg: f64,
    pub best_composite: f64,
    pub segments: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionCandidate {
    pub segment: EligibilityMap,
    pub bets_needed: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryView {
    pub by_league: Vec<GroupSummary>,
    pub by_market: Vec<GroupSummary>,
    pub candidates: Vec<PromotionCandidate>,
    pub status_counts: BTreeMap<String, i64>,
}

fn summarize<F>(rows: &[&EligibilityMap], key_of: F) -> Vec<GroupSummary>
where
    F: Fn(&EligibilityMap) -> String,
{
    let mut groups: BTreeMap<String, GroupSummary> = BTreeMap::new();
    for row in rows {
        let key = key_of(row);
        let g = groups.entry(key.clone()).or_insert_with(|| GroupSummary {
            key,
            best_composite: f64::MIN,
            ..GroupSummary::default()
        });
        g.bets += row.total_bets;
        // bet-weighted sums, divided below
        g.roi_pct += row.roi_pct * row.total_bets as f64;
        g.clv_avg += row.clv_avg * row.total_bets as f64;
        g.best_composite = g.best_composite.max(row.composite_score);
        g.segments += 1;
    }
    let mut out: Vec<GroupSummary> = groups
        .into_values()
        .map(|mut g| {
            if g.bets > 0 {
                g.roi_pct /= g.bets as f64;
                g.clv_avg /= g.bets as f64;
            }
            g
        })
        .collect();
    out.sort_by(|a, b| b.best_composite.total_cmp(&a.best_composite));
    out
}

/// League-only and market-only rollups plus the segments closest to promotion
pub fn discovery(
    db: &Database,
    sport: Option<&str>,
    min_bets: i64,
    t: &GatingTuning,
    now: DateTime<Utc>,
) -> Result<DiscoveryView> {
    let rows = eligibility_view(db, sport, t, now)?;

    let mut status_counts: BTreeMap<String, i64> =
        GatingStatus::ALL.iter().map(|s| (s.to_string(), 0)).collect();
    for row in &rows {
        *status_counts.entry(row.status.to_string()).or_insert(0) += 1;
    }

    let qualified: Vec<&EligibilityMap> = rows.iter().filter(|r| r.total_bets >= min_bets).collect();
    let by_league = summarize(&qualified, |r| r.league.clone());
    let by_market = summarize(&qualified, |r| r.market_type.clone());

    let threshold = (t.candidate_fraction * t.promote_min_bets as f64).round() as i64;
    let mut candidates: Vec<PromotionCandidate> = rows
        .iter()
        .filter(|r| r.status == GatingStatus::LearningOnly && r.total_bets >= threshold && r.roi_pct > 0.0)
        .map(|r| PromotionCandidate {
            segment: r.clone(),
            bets_needed: (t.promote_min_bets - r.total_bets).max(0),
        })
        .collect();
    candidates.sort_by(|a, b| b.segment.composite_score.total_cmp(&a.segment.composite_score));

    Ok(DiscoveryView {
        by_league,
        by_market,
        candidates,
        status_counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bets::tests::{sample_bet, wide_limits};
    use crate::db::bets::SettlementRow;
    use crate::lifecycle::tests::settled_bet;
    use chrono::{Duration, TimeZone};

    fn quick() -> Backoff {
        Backoff {
            attempts: 1,
            base: std::time::Duration::from_millis(1),
            max: std::time::Duration::from_millis(1),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn score(n: i64, roi: f64, clv: f64, stability: f64) -> SegmentScore {
        SegmentScore {
            total_bets: n,
            roi_pct: roi,
            clv_avg: clv,
            stability,
            ..SegmentScore::default()
        }
    }

    /// Write settled bets into the football/epl/moneyline segment
    fn seed(db: &Database, tag: &str, profits: &[f64], clv: f64) {
        for (i, p) in profits.iter().enumerate() {
            let created = now() - Duration::days(30) + Duration::minutes(i as i64);
            let id = db
                .create_bet(&sample_bet(&format!("{tag}-{i}")), &wide_limits(created), created)
                .unwrap();
            let row = SettlementRow {
                result: if *p > 0.0 { BetResult::Won } else { BetResult::Lost },
                profit_loss: *p,
                closing_odds: None,
                clv_pct: Some(clv),
            };
            db.settle_bet_row(id, BetStatus::Candidate, &row, created + Duration::hours(2))
                .unwrap();
        }
    }

    /// 90 bets, ROI 4%: four early wins then alternating losses and slightly
    /// smaller wins
    fn promotable_profits() -> Vec<f64> {
        let win = 1.0 - 0.4 / 43.0;
        let mut profits = vec![1.0; 4];
        for _ in 0..43 {
            profits.push(-1.0);
            profits.push(win);
        }
        profits
    }

    #[test]
    fn promotion_thresholds() {
        let t = GatingTuning::default();
        let lo = GatingStatus::LearningOnly;
        assert_eq!(decide(lo, &score(90, 4.0, 0.5, 0.5), &t).0, GatingStatus::Production);
        assert_eq!(decide(lo, &score(79, 4.0, 0.5, 0.5), &t).0, lo);
        assert_eq!(decide(lo, &score(90, 3.0, 0.5, 0.5), &t).0, lo);
        assert_eq!(decide(lo, &score(90, 4.0, -0.1, 0.5), &t).0, lo);
        assert_eq!(decide(lo, &score(90, 4.0, 0.5, 0.29), &t).0, lo);
    }

    #[test]
    fn demotion_and_disable_rules() {
        let t = GatingTuning::default();
        let prod = GatingStatus::Production;
        assert_eq!(decide(prod, &score(80, -2.5, 1.0, 0.5), &t).0, GatingStatus::LearningOnly);
        assert_eq!(decide(prod, &score(90, 1.0, -1.0, 0.5), &t).0, prod);
        assert_eq!(decide(prod, &score(100, 1.0, -1.0, 0.5), &t).0, GatingStatus::LearningOnly);
        // production never jumps straight to disabled
        assert_eq!(decide(prod, &score(200, -20.0, -5.0, 0.0), &t).0, GatingStatus::LearningOnly);
        let lo = GatingStatus::LearningOnly;
        assert_eq!(decide(lo, &score(150, -9.0, 0.0, 0.5), &t).0, GatingStatus::Disabled);
        assert_eq!(decide(lo, &score(149, -9.0, 0.0, 0.5), &t).0, lo);
        assert_eq!(decide(GatingStatus::Disabled, &score(500, 20.0, 3.0, 1.0), &t).0, GatingStatus::Disabled);
    }

    #[test]
    fn segments_below_minimum_are_not_scored() {
        let t = GatingTuning::default();
        let bets: Vec<BetLifecycle> = (0..4).map(|i| settled_bet(i, "football", "epl", "moneyline", 1.0)).collect();
        assert!(aggregate_segments(&bets, &t).is_empty());
        let bets: Vec<BetLifecycle> = (0..5).map(|i| settled_bet(i, "football", "epl", "moneyline", 1.0)).collect();
        assert_eq!(aggregate_segments(&bets, &t).len(), 1);
    }

    #[test]
    fn profitable_learning_segment_is_promoted() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, "p", &promotable_profits(), 0.5);
        let report = run_promotion_cycle(&db, &GatingTuning::default(), &quick(), now()).unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.new, 1);
        assert_eq!(report.changes.len(), 1);

        let seg = Segment::new("football", "epl", "moneyline");
        let row = db.get_eligibility(&seg).unwrap().unwrap();
        assert_eq!(row.status, GatingStatus::Production);
        assert_eq!(row.total_bets, 90);
        assert!((row.roi_pct - 4.0).abs() < 1e-9);
        assert!(row.stability_score >= 0.3);
        let changes = db.gating_changes_between(now() - Duration::hours(1), now() + Duration::hours(1)).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].manual);

        // a second run finds nothing to do
        let again = run_promotion_cycle(&db, &GatingTuning::default(), &quick(), now()).unwrap();
        assert_eq!(again.unchanged, 1);
        assert!(again.changes.is_empty());
    }

    #[test]
    fn manual_override_survives_the_cycle() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, "p", &promotable_profits(), 0.5);
        let seg = Segment::new("football", "epl", "moneyline");
        db.set_manual_status(&seg, GatingStatus::Disabled, "bad data feed", now()).unwrap();

        let report = run_promotion_cycle(&db, &GatingTuning::default(), &quick(), now()).unwrap();
        assert_eq!(report.skipped_overrides, 1);
        assert_eq!(report.promoted, 0);
        let row = db.get_eligibility(&seg).unwrap().unwrap();
        assert_eq!(row.status, GatingStatus::Disabled);
        assert_eq!(row.total_bets, 0);
    }

    #[test]
    fn discovery_lists_near_promotion_segments() {
        let db = Database::open_in_memory().unwrap();
        // 60 bets with a small profit: 0.6 * 80 = 48 needed to be a candidate
        let mut profits = vec![1.0; 4];
        for _ in 0..28 {
            profits.push(-1.0);
            profits.push(1.05);
        }
        seed(&db, "d", &profits, 0.2);
        let view = discovery(&db, None, 5, &GatingTuning::default(), now()).unwrap();
        assert_eq!(view.candidates.len(), 1);
        assert_eq!(view.candidates[0].bets_needed, 20);
        assert_eq!(view.by_league.len(), 1);
        assert_eq!(view.by_league[0].bets, 60);
        assert_eq!(view.status_counts["LEARNING_ONLY"], 1);
        assert_eq!(view.status_counts["PRODUCTION"], 0);
    }
}
