//! Segment scores over a settled profit series (oldest first).

use serde::Serialize;

use crate::config::GatingTuning;

/// Rolling scores of one segment, recomputed from its settled bets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SegmentScore {
    pub total_bets: i64,
    pub wins: i64,
    pub profit_units: f64,
    pub stake_units: f64,
    pub roi_pct: f64,
    pub clv_avg: f64,
    pub clv_count: i64,
    pub stability: f64,
    pub drawdown_pct: f64,
    pub recency_bonus: f64,
    pub composite: f64,
}

fn cumulative(profits: &[f64]) -> Vec<f64> {
    profits
        .iter()
        .scan(0.0, |acc, p| {
            *acc += p;
            Some(*acc)
        })
        .collect()
}

/// Largest `(peak - value) / max(peak, 1)` along the cumulative series
fn max_drawdown_ratio(cum: &[f64]) -> f64 {
    let Some(&first) = cum.first() else { return 0.0 };
    let mut peak = first;
    let mut worst: f64 = 0.0;
    for &c in cum {
        if c > peak {
            peak = c;
        }
        worst = worst.max((peak - c) / peak.max(1.0));
    }
    worst
}

pub fn stability(profits: &[f64], min_points: usize) -> f64 {
    if profits.len() < min_points {
        return 0.5;
    }
    let cum = cumulative(profits);
    if cum.iter().all(|&c| c <= 0.0) {
        return 0.5;
    }
    1.0 - max_drawdown_ratio(&cum).min(1.0)
}

pub fn drawdown_pct(profits: &[f64], min_points: usize) -> f64 {
    if profits.len() < min_points {
        return 0.0;
    }
    max_drawdown_ratio(&cumulative(profits)) * 100.0
}

/// Share of total profit made in the last `window` bets, scaled to [-s, s]
pub fn recency_bonus(profits: &[f64], window: usize, scale: f64) -> f64 {
    if window == 0 || profits.len() < window {
        return 0.0;
    }
    let total: f64 = profits.iter().sum();
    if total == 0.0 {
        return 0.0;
    }
    let recent: f64 = profits[profits.len() - window..].iter().sum();
    (recent / total.abs().max(1.0)).clamp(-1.0, 1.0) * scale
}

pub fn composite_score(
    roi_pct: f64,
    clv_avg: f64,
    stability: f64,
    drawdown_pct: f64,
    total_bets: i64,
    recency_bonus: f64,
    t: &GatingTuning,
) -> f64 {
    let roi = roi_pct.clamp(t.roi_min, t.roi_max);
    let clv = (clv_avg * t.clv_scale).clamp(t.clv_min, t.clv_max);
    let volume = (total_bets.max(1) as f64).ln() * t.volume_scale;
    t.roi_weight * roi + t.clv_weight * clv + t.stability_weight * stability * t.stability_scale
        - t.drawdown_weight * drawdown_pct.min(t.drawdown_cap)
        + t.volume_weight * volume
        + t.recency_weight * recency_bonus
}

/// Score a segment from its settled rows in settlement order:
/// `(profit, stake, won, clv)` per bet.
pub fn score_segment(rows: &[(f64, f64, bool, Option<f64>)], t: &GatingTuning) -> SegmentScore {
    let profits: Vec<f64> = rows.iter().map(|r| r.0).collect();
    let profit_units: f64 = profits.iter().sum();
    let stake_units: f64 = rows.iter().map(|r| r.1).sum();
    let wins = rows.iter().filter(|r| r.2).count() as i64;
    let clvs: Vec<f64> = rows.iter().filter_map(|r| r.3).collect();
    let clv_avg = if clvs.is_empty() {
        0.0
    } else {
        clvs.iter().sum::<f64>() / clvs.len() as f64
    };
    let roi_pct = if stake_units > 0.0 {
        profit_units / stake_units * 100.0
    } else {
        0.0
    };
    let total_bets = rows.len() as i64;
    let stability = stability(&profits, t.stability_min_points);
    let drawdown_pct = drawdown_pct(&profits, t.stability_min_points);
    let recency_bonus = recency_bonus(&profits, t.recency_window, t.recency_scale);
    let composite = composite_score(roi_pct, clv_avg, stability, drawdown_pct, total_bets, recency_bonus, t);

    SegmentScore {
        total_bets,
        wins,
        profit_units,
        stake_units,
        roi_pct,
        clv_avg,
        clv_count: clvs.len() as i64,
        stability,
        drawdown_pct,
        recency_bonus,
        composite,
    }
}
