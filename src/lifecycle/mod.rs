//! Bet lifecycle: candidate -> published -> placed -> settled, with voiding
//! from any live state. Every change writes one audit entry in the same
//! transaction as the row update.

pub mod reports;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::{info, warn};

use crate::config::LifecycleTuning;
use crate::db::bets::{BetQuery, CapLimits, SettlementRow};
use crate::db::models::*;
use crate::db::Database;
use crate::error::{PipelineError, Result};
use crate::pricing::edge::compute_clv;

/// Start and end of the UTC day containing `now`
pub fn utc_day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}

pub fn cap_limits(market_type: &str, t: &LifecycleTuning, now: DateTime<Utc>) -> CapLimits {
    let (day_start, day_end) = utc_day_bounds(now);
    CapLimits {
        total: t.daily_total_cap,
        per_market: t.market_cap(market_type),
        day_start,
        day_end,
    }
}

/// Insert a new candidate. Rejects disabled segments, duplicates and
/// anything over today's exposure caps.
pub fn create_candidate(db: &Database, bet: &NewBet, t: &LifecycleTuning, now: DateTime<Utc>) -> Result<i64> {
    let limits = cap_limits(&bet.market_type, t, now);
    match db.create_bet(bet, &limits, now) {
        Ok(id) => {
            info!(
                "Candidate #{} created: {} @ {:.2} (EV {:+.1}%)",
                id,
                bet.identity(),
                bet.odds,
                bet.ev_pct
            );
            Ok(id)
        }
        Err(e) => {
            if e.is_rejection() {
                warn!("Candidate {} rejected: {}", bet.identity(), e);
            }
            Err(e)
        }
    }
}

/// Move a bet to `to`. Illegal moves fail without touching the row.
pub fn transition(
    db: &Database,
    bet_id: i64,
    to: BetStatus,
    details: &serde_json::Value,
    source: &str,
    now: DateTime<Utc>,
) -> Result<BetLifecycle> {
    let bet = db.get_bet(bet_id)?.ok_or(PipelineError::BetNotFound(bet_id))?;
    if !bet.status.can_transition_to(to) {
        return Err(PipelineError::IllegalTransition {
            bet_id,
            from: bet.status,
            to,
        });
    }
    db.advance_bet(bet_id, bet.status, to, details, source, now)?;
    info!("Bet #{}: {} -> {} ({})", bet_id, bet.status, to, source);
    db.get_bet(bet_id)?.ok_or(PipelineError::BetNotFound(bet_id))
}

/// Settle a live bet. Without a supplied closing price the recorded
/// closing line is used; CLV stays empty when neither exists.
pub fn settle_bet(db: &Database, bet_id: i64, settlement: &Settlement, now: DateTime<Utc>) -> Result<BetLifecycle> {
    let bet = db.get_bet(bet_id)?.ok_or(PipelineError::BetNotFound(bet_id))?;
    if !bet.status.is_settleable() {
        return Err(PipelineError::IllegalTransition {
            bet_id,
            from: bet.status,
            to: BetStatus::Settled,
        });
    }

    let closing_odds = match settlement.closing_odds {
        Some(c) => Some(c),
        None => db.clv_record_for_bet(bet_id)?.map(|r| r.closing_odds),
    };
    let row = SettlementRow {
        result: settlement.result,
        profit_loss: settlement.profit_loss,
        closing_odds,
        clv_pct: closing_odds.map(|c| compute_clv(bet.odds, c)),
    };
    db.settle_bet_row(bet_id, bet.status, &row, now)?;
    info!(
        "Bet #{} settled {} ({:+.2}u, CLV {})",
        bet_id,
        settlement.result,
        settlement.profit_loss,
        row.clv_pct.map(|c| format!("{c:+.2}%")).unwrap_or_else(|| "n/a".into())
    );
    db.get_bet(bet_id)?.ok_or(PipelineError::BetNotFound(bet_id))
}

pub fn bet_history(db: &Database, bet_id: i64) -> Result<Vec<AuditEntry>> {
    if db.get_bet(bet_id)?.is_none() {
        return Err(PipelineError::BetNotFound(bet_id));
    }
    db.audit_history(bet_id)
}

/// Final status implied by an ordered audit trail
pub fn replay_status(history: &[AuditEntry]) -> Option<BetStatus> {
    history.iter().filter_map(|e| e.new_status).last()
}

pub fn query_bets(db: &Database, q: &BetQuery) -> Result<(Vec<BetLifecycle>, i64)> {
    db.query_bets(q)
}
