use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use super::models::*;
use super::Database;
use crate::error::Result;

const ELIGIBILITY_COLUMNS: &str = "sport, league, market_type, status, total_bets, roi_pct,
    clv_avg, stability_score, drawdown_pct, recency_bonus, composite_score,
    manual_override, override_reason, change_reason, updated_at";

impl Database {
    // ── Segment eligibility ───────────────────────────────────────────────────

    pub fn get_eligibility(&self, segment: &Segment) -> Result<Option<EligibilityMap>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ELIGIBILITY_COLUMNS} FROM segment_eligibility
                     WHERE sport = ?1 AND league = ?2 AND market_type = ?3"
                ),
                params![segment.sport, segment.league, segment.market_type],
                map_eligibility,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_eligibility(&self, sport: Option<&str>) -> Result<Vec<EligibilityMap>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ELIGIBILITY_COLUMNS} FROM segment_eligibility
             WHERE (?1 IS NULL OR sport = ?1)
             ORDER BY composite_score DESC, sport, league, market_type"
        ))?;
        let rows = stmt
            .query_map(params![sport], map_eligibility)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Persist an automatic evaluation and, when the status moved, its change
    /// record. A row that became manually overridden in the meantime is left
    /// untouched; returns whether the row was written.
    pub fn save_segment_evaluation(&self, row: &EligibilityMap, change: Option<&GatingChange>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let written = tx.execute(
            "INSERT INTO segment_eligibility (
                sport, league, market_type, status, total_bets, roi_pct, clv_avg,
                stability_score, drawdown_pct, recency_bonus, composite_score,
                manual_override, override_reason, change_reason, updated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,0,NULL,?12,?13)
             ON CONFLICT(sport, league, market_type) DO UPDATE SET
                status=excluded.status,
                total_bets=excluded.total_bets,
                roi_pct=excluded.roi_pct,
                clv_avg=excluded.clv_avg,
                stability_score=excluded.stability_score,
                drawdown_pct=excluded.drawdown_pct,
                recency_bonus=excluded.recency_bonus,
                composite_score=excluded.composite_score,
                change_reason=COALESCE(excluded.change_reason, segment_eligibility.change_reason),
                updated_at=excluded.updated_at
             WHERE segment_eligibility.manual_override = 0",
            params![
                row.sport,
                row.league,
                row.market_type,
                row.status,
                row.total_bets,
                row.roi_pct,
                row.clv_avg,
                row.stability_score,
                row.drawdown_pct,
                row.recency_bonus,
                row.composite_score,
                row.change_reason,
                row.updated_at,
            ],
        )?;
        if written == 0 {
            return Ok(false);
        }
        if let Some(change) = change {
            insert_gating_change(&tx, change)?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Manually set a segment's status and pin it. Returns the previous status.
    pub fn set_manual_status(
        &self,
        segment: &Segment,
        status: GatingStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GatingStatus>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let old = super::bets::segment_status_tx(&tx, &segment.sport, &segment.league, &segment.market_type)?;
        tx.execute(
            "INSERT INTO segment_eligibility (
                sport, league, market_type, status, manual_override,
                override_reason, change_reason, updated_at
             ) VALUES (?1,?2,?3,?4,1,?5,?5,?6)
             ON CONFLICT(sport, league, market_type) DO UPDATE SET
                status=excluded.status,
                manual_override=1,
                override_reason=excluded.override_reason,
                change_reason=excluded.change_reason,
                updated_at=excluded.updated_at",
            params![segment.sport, segment.league, segment.market_type, status, reason, now],
        )?;
        insert_gating_change(
            &tx,
            &GatingChange {
                id: None,
                sport: segment.sport.clone(),
                league: segment.league.clone(),
                market_type: segment.market_type.clone(),
                old_status: old,
                new_status: status,
                reason: reason.to_string(),
                manual: true,
                changed_at: now,
            },
        )?;
        tx.commit()?;
        Ok(old)
    }

    /// Hand a pinned segment back to the automatic cycle. Returns false when
    /// the segment has no stored row.
    pub fn release_override(&self, segment: &Segment, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE segment_eligibility
             SET manual_override = 0, override_reason = NULL, updated_at = ?4
             WHERE sport = ?1 AND league = ?2 AND market_type = ?3",
            params![segment.sport, segment.league, segment.market_type, now],
        )?;
        Ok(changed > 0)
    }

    // ── Gating changes ────────────────────────────────────────────────────────

    pub fn gating_changes_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<GatingChange>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sport, league, market_type, old_status, new_status, reason, manual, changed_at
             FROM gating_changes
             WHERE changed_at >= ?1 AND changed_at < ?2
             ORDER BY changed_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![from, to], map_gating_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn insert_gating_change(tx: &Transaction, change: &GatingChange) -> rusqlite::Result<usize> {
    tx.execute(
        "INSERT INTO gating_changes (
            sport, league, market_type, old_status, new_status, reason, manual, changed_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            change.sport,
            change.league,
            change.market_type,
            change.old_status,
            change.new_status,
            change.reason,
            change.manual,
            change.changed_at,
        ],
    )
}

fn map_eligibility(row: &rusqlite::Row) -> rusqlite::Result<EligibilityMap> {
    Ok(EligibilityMap {
        sport: row.get(0)?,
        league: row.get(1)?,
        market_type: row.get(2)?,
        status: row.get(3)?,
        total_bets: row.get(4)?,
        roi_pct: row.get(5)?,
        clv_avg: row.get(6)?,
        stability_score: row.get(7)?,
        drawdown_pct: row.get(8)?,
        recency_bonus: row.get(9)?,
        composite_score: row.get(10)?,
        manual_override: row.get(11)?,
        override_reason: row.get(12)?,
        change_reason: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn map_gating_change(row: &rusqlite::Row) -> rusqlite::Result<GatingChange> {
    Ok(GatingChange {
        id: row.get(0)?,
        sport: row.get(1)?,
        league: row.get(2)?,
        market_type: row.get(3)?,
        old_status: row.get(4)?,
        new_status: row.get(5)?,
        reason: row.get(6)?,
        manual: row.get(7)?,
        changed_at: row.get(8)?,
    })
}
