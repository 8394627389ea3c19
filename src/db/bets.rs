use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use super::models::*;
use super::{json_column, Database};
use crate::error::{PipelineError, Result};

const BET_COLUMNS: &str = "id, event_id, sport, league, league_name, home_team, away_team,
    market_type, selection, line, bookmaker, odds, fair_odds, model_prob, calibrated_prob,
    edge_pct, ev_pct, expected_clv_pct, confidence, confidence_badge, timing_bucket,
    volatility, status, gating_status, stake_units, result, profit_loss, closing_odds,
    clv_pct, start_time, created_at, published_at, placed_at, settled_at, voided_at,
    tags, notes";

/// Daily exposure limits that apply to one candidate, resolved for its market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapLimits {
    pub total: i64,
    pub per_market: i64,
    pub day_start: DateTime<Utc>,
    pub day_end: DateTime<Utc>,
}

/// Settlement values as written to the bet row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementRow {
    pub result: BetResult,
    pub profit_loss: f64,
    pub closing_odds: Option<f64>,
    pub clv_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetSort {
    #[default]
    Newest,
    Kickoff,
    Ev,
    Edge,
    Odds,
    Confidence,
}

impl BetSort {
    fn order_clause(&self) -> &'static str {
        match self {
            BetSort::Newest => "created_at DESC, id DESC",
            BetSort::Kickoff => "start_time ASC, id ASC",
            BetSort::Ev => "ev_pct DESC, id DESC",
            BetSort::Edge => "edge_pct DESC, id DESC",
            BetSort::Odds => "odds DESC, id DESC",
            BetSort::Confidence => "confidence DESC, id DESC",
        }
    }
}

/// Filters for the bets feed. Learning-only rows are hidden unless asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BetQuery {
    pub status: Option<BetStatus>,
    pub gating: Option<GatingStatus>,
    pub sport: Option<String>,
    pub market: Option<String>,
    pub league: Option<String>,
    pub min_ev: Option<f64>,
    pub min_confidence: Option<f64>,
    pub show_learning: bool,
    pub sort: BetSort,
    pub limit: i64,
    pub offset: i64,
}

impl Default for BetQuery {
    fn default() -> Self {
        BetQuery {
            status: None,
            gating: None,
            sport: None,
            market: None,
            league: None,
            min_ev: None,
            min_confidence: None,
            show_learning: false,
            sort: BetSort::Newest,
            limit: 30,
            offset: 0,
        }
    }
}

impl Database {
    // ── Bet lifecycle ─────────────────────────────────────────────────────────

    /// Insert a candidate row plus its `created` audit entry in one
    /// transaction, enforcing segment, duplicate and daily-cap rules.
    pub fn create_bet(&self, bet: &NewBet, limits: &CapLimits, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let gating_status = segment_status_tx(&tx, &bet.sport, &bet.league, &bet.market_type)?
            .unwrap_or(GatingStatus::LearningOnly);
        if gating_status == GatingStatus::Disabled {
            return Err(PipelineError::SegmentDisabled(bet.segment().to_string()));
        }

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM bet_lifecycle
                 WHERE event_id = ?1 AND market_type = ?2 AND selection = ?3
                   AND line_key = ?4 AND bookmaker = ?5",
                params![
                    bet.event_id,
                    bet.market_type,
                    bet.selection,
                    line_key(bet.line),
                    bet.bookmaker
                ],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(PipelineError::DuplicateCandidate(bet.identity()));
        }

        let sport_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM bet_lifecycle
             WHERE sport = ?1 AND created_at >= ?2 AND created_at < ?3 AND status != 'voided'",
            params![bet.sport, limits.day_start, limits.day_end],
            |r| r.get(0),
        )?;
        if sport_count >= limits.total {
            return Err(PipelineError::DailyCapReached {
                scope: bet.sport.clone(),
                count: sport_count,
                limit: limits.total,
            });
        }

        let market_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM bet_lifecycle
             WHERE sport = ?1 AND market_type = ?2 AND created_at >= ?3 AND created_at < ?4
               AND status != 'voided'",
            params![bet.sport, bet.market_type, limits.day_start, limits.day_end],
            |r| r.get(0),
        )?;
        if market_count >= limits.per_market {
            return Err(PipelineError::DailyCapReached {
                scope: format!("{}/{}", bet.sport, bet.market_type),
                count: market_count,
                limit: limits.per_market,
            });
        }

        let bet_id = insert_candidate(&tx, bet, gating_status, now)?;

        let details = serde_json::json!({
            "odds": bet.odds,
            "ev": bet.ev_pct,
            "edge": bet.edge_pct,
            "confidence": bet.confidence,
            "gating_status": gating_status,
        });
        append_audit(
            &tx,
            bet_id,
            "created",
            None,
            Some(BetStatus::Candidate),
            &details,
            now,
            "system",
        )?;
        tx.commit()?;
        Ok(bet_id)
    }

    /// Compare-and-set a bet's status from `from` to `to`, stamping the
    /// matching timestamp column and appending one audit entry.
    pub fn advance_bet(
        &self,
        bet_id: i64,
        from: BetStatus,
        to: BetStatus,
        details: &serde_json::Value,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if to == BetStatus::Published {
            let (sport, league, market_type): (String, String, String) = tx
                .query_row(
                    "SELECT sport, league, market_type FROM bet_lifecycle WHERE id = ?1",
                    params![bet_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?
                .ok_or(PipelineError::BetNotFound(bet_id))?;
            let status = segment_status_tx(&tx, &sport, &league, &market_type)?
                .unwrap_or(GatingStatus::LearningOnly);
            if !status.can_publish() {
                return Err(PipelineError::NotPublishable(
                    Segment::new(&sport, &league, &market_type).to_string(),
                ));
            }
        }

        let ts_column = match to {
            BetStatus::Published => "published_at",
            BetStatus::Placed => "placed_at",
            BetStatus::Settled => "settled_at",
            BetStatus::Voided => "voided_at",
            BetStatus::Candidate => "created_at",
        };
        let changed = tx.execute(
            &format!("UPDATE bet_lifecycle SET status = ?1, {ts_column} = ?2 WHERE id = ?3 AND status = ?4"),
            params![to, now, bet_id, from],
        )?;
        if changed == 0 {
            return Err(lost_race(&tx, bet_id, to)?);
        }

        append_audit(
            &tx,
            bet_id,
            &format!("transition_{}", to),
            Some(from),
            Some(to),
            details,
            now,
            source,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Compare-and-set a bet to settled with its outcome.
    pub fn settle_bet_row(
        &self,
        bet_id: i64,
        from: BetStatus,
        row: &SettlementRow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE bet_lifecycle
             SET status = ?1, result = ?2, profit_loss = ?3, closing_odds = ?4,
                 clv_pct = ?5, settled_at = ?6
             WHERE id = ?7 AND status = ?8",
            params![
                BetStatus::Settled,
                row.result,
                row.profit_loss,
                row.closing_odds,
                row.clv_pct,
                now,
                bet_id,
                from
            ],
        )?;
        if changed == 0 {
            return Err(lost_race(&tx, bet_id, BetStatus::Settled)?);
        }

        let details = serde_json::json!({
            "result": row.result,
            "profit_loss": row.profit_loss,
            "closing_odds": row.closing_odds,
            "clv_pct": row.clv_pct,
        });
        append_audit(
            &tx,
            bet_id,
            "settled",
            Some(from),
            Some(BetStatus::Settled),
            &details,
            now,
            "settlement",
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_bet(&self, bet_id: i64) -> Result<Option<BetLifecycle>> {
        let conn = self.conn()?;
        let bet = conn
            .query_row(
                &format!("SELECT {BET_COLUMNS} FROM bet_lifecycle WHERE id = ?1"),
                params![bet_id],
                map_bet,
            )
            .optional()?;
        Ok(bet)
    }

    /// Filtered, sorted page of bets plus the unpaginated total
    pub fn query_bets(&self, q: &BetQuery) -> Result<(Vec<BetLifecycle>, i64)> {
        const FILTER: &str = "WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR gating_status = ?2)
               AND (?3 IS NULL OR sport = ?3)
               AND (?4 IS NULL OR market_type = ?4)
               AND (?5 IS NULL OR league = ?5)
               AND (?6 IS NULL OR ev_pct >= ?6)
               AND (?7 IS NULL OR confidence >= ?7)
               AND (?8 = 1 OR gating_status = 'PRODUCTION')";

        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM bet_lifecycle {FILTER}"),
            params![
                q.status,
                q.gating,
                q.sport,
                q.market,
                q.league,
                q.min_ev,
                q.min_confidence,
                q.show_learning
            ],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {BET_COLUMNS} FROM bet_lifecycle {FILTER}
             ORDER BY {} LIMIT ?9 OFFSET ?10",
            q.sort.order_clause()
        ))?;
        let bets = stmt
            .query_map(
                params![
                    q.status,
                    q.gating,
                    q.sport,
                    q.market,
                    q.league,
                    q.min_ev,
                    q.min_confidence,
                    q.show_learning,
                    q.limit.clamp(1, 500),
                    q.offset.max(0)
                ],
                map_bet,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((bets, total))
    }

    /// Settled bets, optionally restricted to a sport and a settlement
    /// window, ordered by settlement time
    pub fn settled_bets(
        &self,
        sport: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<BetLifecycle>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BET_COLUMNS} FROM bet_lifecycle
             WHERE status = 'settled'
               AND (?1 IS NULL OR sport = ?1)
               AND (?2 IS NULL OR settled_at >= ?2)
               AND (?3 IS NULL OR settled_at < ?3)
             ORDER BY settled_at ASC, id ASC"
        ))?;
        let bets = stmt
            .query_map(params![sport, from, to], map_bet)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bets)
    }

    /// Live bets that kicked off in `(kicked_off_after, kicked_off_before]`
    /// and have no CLV record yet
    pub fn bets_awaiting_clv(
        &self,
        kicked_off_after: DateTime<Utc>,
        kicked_off_before: DateTime<Utc>,
    ) -> Result<Vec<BetLifecycle>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BET_COLUMNS} FROM bet_lifecycle b
             WHERE b.status != 'voided'
               AND b.start_time > ?1
               AND b.start_time <= ?2
               AND NOT EXISTS (SELECT 1 FROM clv_records c WHERE c.bet_id = b.id)
             ORDER BY b.start_time ASC, b.id ASC"
        ))?;
        let bets = stmt
            .query_map(params![kicked_off_after, kicked_off_before], map_bet)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bets)
    }

    /// Mean recorded CLV% of a segment, if any bet in it has one
    pub fn segment_avg_clv(&self, segment: &Segment) -> Result<Option<f64>> {
        let conn = self.conn()?;
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(c.clv_pct) FROM clv_records c
             JOIN bet_lifecycle b ON b.id = c.bet_id
             WHERE b.sport = ?1 AND b.league = ?2 AND b.market_type = ?3",
            params![segment.sport, segment.league, segment.market_type],
            |r| r.get(0),
        )?;
        Ok(avg)
    }

    // ── Audit log ─────────────────────────────────────────────────────────────

    pub fn audit_history(&self, bet_id: i64) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, bet_id, seq, action, old_status, new_status, details, timestamp, source
             FROM audit_log WHERE bet_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![bet_id], map_audit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

pub(crate) fn segment_status_tx(
    tx: &Transaction,
    sport: &str,
    league: &str,
    market_type: &str,
) -> rusqlite::Result<Option<GatingStatus>> {
    tx.query_row(
        "SELECT status FROM segment_eligibility
         WHERE sport = ?1 AND league = ?2 AND market_type = ?3",
        params![sport, league, market_type],
        |r| r.get(0),
    )
    .optional()
}

/// Insert a candidate row. A UNIQUE hit on the bet identity is a duplicate.
fn insert_candidate(
    tx: &Transaction,
    bet: &NewBet,
    gating_status: GatingStatus,
    now: DateTime<Utc>,
) -> Result<i64> {
    let inserted = tx.execute(
        "INSERT INTO bet_lifecycle (
            event_id, sport, league, league_name, home_team, away_team,
            market_type, selection, line, line_key, bookmaker, odds, fair_odds,
            model_prob, calibrated_prob, edge_pct, ev_pct, expected_clv_pct,
            confidence, confidence_badge, timing_bucket, volatility, status,
            gating_status, stake_units, start_time, created_at, tags, notes
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,
                   ?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29)",
        params![
            bet.event_id,
            bet.sport,
            bet.league,
            bet.league_name,
            bet.home_team,
            bet.away_team,
            bet.market_type,
            bet.selection,
            bet.line,
            line_key(bet.line),
            bet.bookmaker,
            bet.odds,
            bet.fair_odds,
            bet.model_prob,
            bet.calibrated_prob,
            bet.edge_pct,
            bet.ev_pct,
            bet.expected_clv_pct,
            bet.confidence,
            bet.confidence_badge,
            bet.timing_bucket,
            bet.volatility,
            BetStatus::Candidate,
            gating_status,
            bet.stake_units,
            bet.start_time,
            now,
            serde_json::to_string(&bet.tags)?,
            bet.notes,
        ],
    );
    if let Err(e) = inserted {
        if is_unique_violation(&e) {
            return Err(PipelineError::DuplicateCandidate(bet.identity()));
        }
        return Err(e.into());
    }
    Ok(tx.last_insert_rowid())
}

/// Build the failure for a compare-and-set that matched no row.
fn lost_race(tx: &Transaction, bet_id: i64, to: BetStatus) -> Result<PipelineError> {
    let current: Option<BetStatus> = tx
        .query_row(
            "SELECT status FROM bet_lifecycle WHERE id = ?1",
            params![bet_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match current {
        Some(from) => PipelineError::IllegalTransition { bet_id, from, to },
        None => PipelineError::BetNotFound(bet_id),
    })
}

#[allow(clippy::too_many_arguments)]
fn append_audit(
    tx: &Transaction,
    bet_id: i64,
    action: &str,
    old_status: Option<BetStatus>,
    new_status: Option<BetStatus>,
    details: &serde_json::Value,
    now: DateTime<Utc>,
    source: &str,
) -> Result<i64> {
    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_log WHERE bet_id = ?1",
        params![bet_id],
        |r| r.get(0),
    )?;
    tx.execute(
        "INSERT INTO audit_log (bet_id, seq, action, old_status, new_status, details, timestamp, source)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            bet_id,
            seq,
            action,
            old_status,
            new_status,
            serde_json::to_string(details)?,
            now,
            source
        ],
    )?;
    Ok(seq)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
                && f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn map_bet(row: &rusqlite::Row) -> rusqlite::Result<BetLifecycle> {
    Ok(BetLifecycle {
        id: row.get(0)?,
        event_id: row.get(1)?,
        sport: row.get(2)?,
        league: row.get(3)?,
        league_name: row.get(4)?,
        home_team: row.get(5)?,
        away_team: row.get(6)?,
        market_type: row.get(7)?,
        selection: row.get(8)?,
        line: row.get(9)?,
        bookmaker: row.get(10)?,
        odds: row.get(11)?,
        fair_odds: row.get(12)?,
        model_prob: row.get(13)?,
        calibrated_prob: row.get(14)?,
        edge_pct: row.get(15)?,
        ev_pct: row.get(16)?,
        expected_clv_pct: row.get(17)?,
        confidence: row.get(18)?,
        confidence_badge: row.get(19)?,
        timing_bucket: row.get(20)?,
        volatility: row.get(21)?,
        status: row.get(22)?,
        gating_status: row.get(23)?,
        stake_units: row.get(24)?,
        result: row.get(25)?,
        profit_loss: row.get(26)?,
        closing_odds: row.get(27)?,
        clv_pct: row.get(28)?,
        start_time: row.get(29)?,
        created_at: row.get(30)?,
        published_at: row.get(31)?,
        placed_at: row.get(32)?,
        settled_at: row.get(33)?,
        voided_at: row.get(34)?,
        tags: json_column(row, 35)?,
        notes: row.get(36)?,
    })
}

fn map_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        bet_id: row.get(1)?,
        seq: row.get(2)?,
        action: row.get(3)?,
        old_status: row.get(4)?,
        new_status: row.get(5)?,
        details: json_column(row, 6)?,
        timestamp: row.get(7)?,
        source: row.get(8)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub(crate) fn sample_bet(event_id: &str) -> NewBet {
        NewBet {
            event_id: event_id.to_string(),
            sport: "football".to_string(),
            league: "epl".to_string(),
            league_name: "Premier League".to_string(),
            home_team: "Arsenal".to_string(),
            away_team: "Chelsea".to_string(),
            market_type: "moneyline".to_string(),
            selection: "home".to_string(),
            line: None,
            bookmaker: "pinnacle".to_string(),
            odds: 2.10,
            fair_odds: 2.00,
            model_prob: 0.5,
            calibrated_prob: 0.5,
            edge_pct: 5.0,
            ev_pct: 5.0,
            expected_clv_pct: None,
            confidence: 0.6,
            confidence_badge: ConfidenceBadge::Medium,
            timing_bucket: TimingBucket::ThreeToSixHours,
            volatility: 1.0,
            stake_units: 1.0,
            start_time: Utc.with_ymd_and_hms(2026, 10, 20, 15, 0, 0).unwrap(),
            tags: vec![],
            notes: String::new(),
        }
    }

    pub(crate) fn wide_limits(now: DateTime<Utc>) -> CapLimits {
        CapLimits {
            total: 1000,
            per_market: 1000,
            day_start: now - Duration::days(1),
            day_end: now + Duration::days(1),
        }
    }

    pub(crate) fn insert_sample_bet(db: &Database, event_id: &str) -> i64 {
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 9, 0, 0).unwrap();
        db.create_bet(&sample_bet(event_id), &wide_limits(now), now).unwrap()
    }

    #[test]
    fn same_identity_is_rejected_and_not_inserted_twice() {
        let db = Database::open_in_memory().unwrap();
        insert_sample_bet(&db, "e1");
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 9, 30, 0).unwrap();
        let err = db
            .create_bet(&sample_bet("e1"), &wide_limits(now), now)
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateCandidate(_)));

        let (bets, total) = db
            .query_bets(&BetQuery {
                show_learning: true,
                ..BetQuery::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(bets.len(), 1);
    }

    #[test]
    fn unique_constraint_hit_maps_to_duplicate() {
        let db = Database::open_in_memory().unwrap();
        insert_sample_bet(&db, "e1");
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 9, 30, 0).unwrap();

        // Write straight past the identity lookup, as a racing writer would.
        let mut conn = db.conn().unwrap();
        let tx = conn.transaction().unwrap();
        let err = insert_candidate(&tx, &sample_bet("e1"), GatingStatus::LearningOnly, now).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateCandidate(_)));
        assert!(err.is_rejection());
        drop(tx);
        drop(conn);

        let (_, total) = db
            .query_bets(&BetQuery {
                show_learning: true,
                ..BetQuery::default()
            })
            .unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn cas_mismatch_reports_current_status() {
        let db = Database::open_in_memory().unwrap();
        let id = insert_sample_bet(&db, "e1");
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 10, 0, 0).unwrap();
        db.advance_bet(id, BetStatus::Candidate, BetStatus::Voided, &serde_json::json!({}), "test", now)
            .unwrap();
        let err = db
            .advance_bet(id, BetStatus::Candidate, BetStatus::Voided, &serde_json::json!({}), "test", now)
            .unwrap_err();
        match err {
            PipelineError::IllegalTransition { from, .. } => assert_eq!(from, BetStatus::Voided),
            other => panic!("unexpected error: {other}"),
        }
        let history = db.audit_history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].seq, 2);
        assert_eq!(history[1].action, "transition_voided");
    }

    #[test]
    fn feed_hides_learning_rows_by_default() {
        let db = Database::open_in_memory().unwrap();
        insert_sample_bet(&db, "e1");
        let (bets, total) = db.query_bets(&BetQuery::default()).unwrap();
        assert!(bets.is_empty());
        assert_eq!(total, 0);
    }
}
