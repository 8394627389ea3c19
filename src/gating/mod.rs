//! Self-learning segment gating: which (sport, league, market) segments may
//! publish, learned from their settled history.

pub mod promotion;
pub mod scoring;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::db::models::{GatingStatus, Segment};
use crate::db::Database;
use crate::error::{PipelineError, Result};

pub use promotion::{discovery, eligibility_view, run_promotion_cycle, DiscoveryView, PromotionReport};
pub use scoring::SegmentScore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideOutcome {
    pub success: bool,
    pub segment: Segment,
    pub old_status: Option<GatingStatus>,
    pub new_status: GatingStatus,
    pub reason: String,
}

/// Pin a segment to `status`. The automatic cycle ignores it until released.
pub fn override_segment(
    db: &Database,
    segment: &Segment,
    status: GatingStatus,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<OverrideOutcome> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(PipelineError::MissingReason);
    }
    let old_status = db.set_manual_status(segment, status, reason, now)?;
    info!(
        "Manual gating override {}: {} -> {} ({})",
        segment,
        old_status.map(|s| s.as_str()).unwrap_or("none"),
        status,
        reason
    );
    Ok(OverrideOutcome {
        success: true,
        segment: segment.clone(),
        old_status,
        new_status: status,
        reason: reason.to_string(),
    })
}

/// Return a pinned segment to automatic evaluation, keeping its status.
pub fn release_override(db: &Database, segment: &Segment, now: DateTime<Utc>) -> Result<bool> {
    let released = db.release_override(segment, now)?;
    if released {
        info!("Released manual override on {}", segment);
    }
    Ok(released)
}

/// Segments without a stored row are LEARNING_ONLY and not publishable.
pub fn is_publishable(db: &Database, segment: &Segment) -> Result<bool> {
    Ok(db
        .get_eligibility(segment)?
        .map(|row| row.can_publish())
        .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn override_requires_reason_and_is_recorded() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let seg = Segment::new("football", "epl", "totals");

        let err = override_segment(&db, &seg, GatingStatus::Production, "   ", now).unwrap_err();
        assert!(matches!(err, PipelineError::MissingReason));
        assert!(!is_publishable(&db, &seg).unwrap());

        let out = override_segment(&db, &seg, GatingStatus::Production, "trusted model", now).unwrap();
        assert!(out.success);
        assert_eq!(out.old_status, None);
        assert!(is_publishable(&db, &seg).unwrap());
        let row = db.get_eligibility(&seg).unwrap().unwrap();
        assert!(row.manual_override);

        assert!(release_override(&db, &seg, now).unwrap());
        let row = db.get_eligibility(&seg).unwrap().unwrap();
        assert!(!row.manual_override);
        assert_eq!(row.status, GatingStatus::Production);
        assert!(!release_override(&db, &Segment::new("x", "y", "z"), now).unwrap());
    }
}
