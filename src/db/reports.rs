use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{json_column, Database};
use crate::error::Result;

/// Rolling lifecycle counters over a creation window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub candidates: i64,
    pub published: i64,
    pub placed: i64,
    pub settled: i64,
    pub voided: i64,
    pub wins: i64,
    pub losses: i64,
    pub hit_rate: f64,
    pub profit_units: f64,
    pub roi_pct: f64,
    pub avg_clv: f64,
    pub avg_ev: f64,
    pub avg_odds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub bets: i64,
    pub wins: i64,
    pub profit: f64,
    pub stake: f64,
    pub roi_pct: f64,
    pub avg_clv: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyReport {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub total_bets: i64,
    pub wins: i64,
    pub losses: i64,
    pub pushes: i64,
    pub hit_rate: f64,
    pub profit_units: f64,
    pub roi_pct: f64,
    pub avg_clv: f64,
    pub avg_ev: f64,
    pub avg_odds: f64,
    pub best_market: Option<String>,
    pub worst_market: Option<String>,
    pub top_league: Option<String>,
    pub promotions: i64,
    pub demotions: i64,
    pub by_market: BTreeMap<String, Breakdown>,
    pub by_league: BTreeMap<String, Breakdown>,
}

impl WeeklyReport {
    pub fn empty(week_start: NaiveDate, week_end: NaiveDate) -> Self {
        WeeklyReport {
            week_start,
            week_end,
            total_bets: 0,
            wins: 0,
            losses: 0,
            pushes: 0,
            hit_rate: 0.0,
            profit_units: 0.0,
            roi_pct: 0.0,
            avg_clv: 0.0,
            avg_ev: 0.0,
            avg_odds: 0.0,
            best_market: None,
            worst_market: None,
            top_league: None,
            promotions: 0,
            demotions: 0,
            by_market: BTreeMap::new(),
            by_league: BTreeMap::new(),
        }
    }
}

impl Database {
    // ── Stats ─────────────────────────────────────────────────────────────────

    /// Lifecycle counters for bets created since `since`
    pub fn lifecycle_stats(&self, sport: Option<&str>, since: DateTime<Utc>) -> Result<LifecycleStats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'candidate' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'published' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'placed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'settled' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'voided' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN result IN ('won', 'half_won') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN result IN ('lost', 'half_lost') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'settled' THEN profit_loss END), 0),
                COALESCE(SUM(CASE WHEN status = 'settled' THEN stake_units END), 0),
                COALESCE(AVG(clv_pct), 0),
                COALESCE(AVG(ev_pct), 0),
                COALESCE(AVG(CASE WHEN status = 'settled' THEN odds END), 0)
             FROM bet_lifecycle
             WHERE (?1 IS NULL OR sport = ?1) AND created_at >= ?2",
            params![sport, since],
            |r| {
                let settled: i64 = r.get(3)?;
                let wins: i64 = r.get(5)?;
                let losses: i64 = r.get(6)?;
                let decided = wins + losses;
                let profit: f64 = r.get(7)?;
                let stake: f64 = r.get(8)?;
                Ok(LifecycleStats {
                    candidates: r.get(0)?,
                    published: r.get(1)?,
                    placed: r.get(2)?,
                    settled,
                    voided: r.get(4)?,
                    wins,
                    losses,
                    hit_rate: if decided > 0 { wins as f64 / decided as f64 * 100.0 } else { 0.0 },
                    profit_units: profit,
                    roi_pct: if stake > 0.0 { profit / stake * 100.0 } else { 0.0 },
                    avg_clv: r.get(9)?,
                    avg_ev: r.get(10)?,
                    avg_odds: r.get(11)?,
                })
            },
        )?;
        Ok(stats)
    }

    // ── Weekly reports ────────────────────────────────────────────────────────

    /// Store a report, replacing any previous one for the same week
    pub fn save_weekly_report(&self, report: &WeeklyReport, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO weekly_reports (week_start, week_end, report_data, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(week_start) DO UPDATE SET
                week_end=excluded.week_end,
                report_data=excluded.report_data,
                created_at=excluded.created_at",
            params![report.week_start, report.week_end, serde_json::to_string(report)?, now],
        )?;
        Ok(())
    }

    pub fn get_weekly_report(&self, week_start: NaiveDate) -> Result<Option<WeeklyReport>> {
        let conn = self.conn()?;
        let report = conn
            .query_row(
                "SELECT report_data FROM weekly_reports WHERE week_start = ?1",
                params![week_start],
                |r| json_column(r, 0),
            )
            .optional()?;
        Ok(report)
    }

    pub fn list_weekly_reports(&self, limit: i64) -> Result<Vec<WeeklyReport>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT report_data FROM weekly_reports ORDER BY week_start DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |r| json_column(r, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
