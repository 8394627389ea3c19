use crate::config::{CalibrationTuning, ConfidenceTuning};
use crate::db::models::{ConfidenceBadge, FairOddsResult};

use super::calibration::{clamp_input, Calibrated};

/// Historical sample tier used in the confidence score
pub fn data_quality_tier(sample_size: i64) -> f64 {
    match sample_size {
        n if n >= 100 => 1.0,
        n if n >= 50 => 0.8,
        n if n >= 20 => 0.6,
        _ => 0.4,
    }
}

/// Extra confidence for probabilities far from a coin flip
pub fn prob_strength(p: f64) -> f64 {
    if p > 0.65 || p < 0.35 {
        0.2
    } else if p > 0.55 || p < 0.45 {
        0.1
    } else {
        0.0
    }
}

/// Confidence in [floor, ceiling] from probability certainty, sample depth
/// and cross-book disagreement.
pub fn compute_confidence(p: f64, sample_size: i64, dispersion: f64, t: &ConfidenceTuning) -> f64 {
    let certainty = (p - 0.5).abs() * 2.0;
    let dispersion_penalty = if dispersion > 0.0 {
        (dispersion * t.dispersion_multiplier).min(t.max_dispersion_penalty)
    } else {
        0.0
    };
    let raw = t.certainty_weight * certainty
        + t.data_quality_weight * data_quality_tier(sample_size)
        + t.strength_weight * prob_strength(p)
        + t.dispersion_weight * (1.0 - dispersion_penalty);
    raw.clamp(t.floor, t.ceiling)
}

pub fn confidence_badge(confidence: f64, t: &ConfidenceTuning) -> ConfidenceBadge {
    if confidence >= t.high_threshold {
        ConfidenceBadge::High
    } else if confidence >= t.medium_threshold {
        ConfidenceBadge::Medium
    } else {
        ConfidenceBadge::Low
    }
}

/// Price one selection from its model probability and calibration.
#[allow(clippy::too_many_arguments)]
pub fn compute_fair_odds(
    event_id: &str,
    market_type: &str,
    selection: &str,
    line: Option<f64>,
    model_prob: f64,
    calibrated: &Calibrated,
    dispersion: f64,
    calibration: &CalibrationTuning,
    confidence: &ConfidenceTuning,
) -> FairOddsResult {
    let p = clamp_input(model_prob, calibration);
    let score = compute_confidence(p, calibrated.sample_size, dispersion, confidence);
    FairOddsResult {
        event_id: event_id.to_string(),
        market_type: market_type.to_string(),
        selection: selection.to_string(),
        line,
        model_prob: p,
        calibrated_prob: calibrated.prob,
        calibration_source: calibrated.source.clone(),
        league_sample_size: calibrated.sample_size,
        fair_odds: 1.0 / calibrated.prob,
        confidence: score,
        confidence_badge: confidence_badge(score, confidence),
        uncertainty: 1.0 - (p - 0.5).abs() * 2.0,
        data_quality: (calibrated.sample_size as f64 / 100.0).min(1.0),
        market_dispersion: dispersion,
        volatility: dispersion * 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn passthrough(prob: f64) -> Calibrated {
        Calibrated {
            prob,
            factor: 1.0,
            source: "global".into(),
            sample_size: 0,
        }
    }

    #[test]
    fn confidence_matches_weighted_formula() {
        let t = ConfidenceTuning::default();
        // p=0.7: certainty 0.4, tier 0.4, strength 0.2, penalty min(0.02*5, 0.3)=0.1
        let c = compute_confidence(0.7, 0, 0.02, &t);
        let expected = 0.3 * 0.4 + 0.3 * 0.4 + 0.2 * 0.2 + 0.2 * 0.9;
        assert_relative_eq!(c, expected, epsilon = 1e-12);
        assert_eq!(confidence_badge(c, &t), ConfidenceBadge::Medium);
    }

    #[test]
    fn deep_sample_and_strong_probability_is_high() {
        let t = ConfidenceTuning::default();
        let c = compute_confidence(0.85, 150, 0.0, &t);
        assert!(c >= 0.70);
        assert_eq!(confidence_badge(c, &t), ConfidenceBadge::High);
        assert_eq!(confidence_badge(0.3, &t), ConfidenceBadge::Low);
    }

    #[test]
    fn dispersion_penalty_is_capped() {
        let t = ConfidenceTuning::default();
        let capped = compute_confidence(0.5, 0, 10.0, &t);
        assert_relative_eq!(capped, 0.3 * 0.4 + 0.2 * 0.7, epsilon = 1e-12);
    }

    #[test]
    fn fair_odds_is_reciprocal_of_calibrated_prob() {
        let r = compute_fair_odds(
            "e1",
            "totals",
            "Over",
            Some(2.5),
            0.55,
            &passthrough(0.55),
            0.02,
            &CalibrationTuning::default(),
            &ConfidenceTuning::default(),
        );
        assert_relative_eq!(r.fair_odds * r.calibrated_prob, 1.0, epsilon = 1e-12);
        assert_relative_eq!(r.volatility, 2.0, epsilon = 1e-12);
        assert_relative_eq!(r.uncertainty, 0.9, epsilon = 1e-12);
        assert_eq!(r.data_quality, 0.0);
    }
}
