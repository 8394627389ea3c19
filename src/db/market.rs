use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::models::*;
use super::{json_column, Database};
use crate::error::Result;

const SNAPSHOT_COLUMNS: &str = "id, event_id, sport, league, league_name, home_team, away_team,
    start_time, market_type, selection, line, bookmaker, price, observed_at";

/// One row of the upcoming-events board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub event_id: String,
    pub sport: String,
    pub league: String,
    pub league_name: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub bookmaker_count: i64,
    pub market_count: i64,
    pub last_observed_at: DateTime<Utc>,
}

impl Database {
    // ── Odds snapshots ────────────────────────────────────────────────────────

    /// Append one price observation
    pub fn insert_snapshot(&self, snap: &OddsSnapshot) -> Result<i64> {
        let conn = self.conn()?;
        insert_snapshot_row(&conn, snap)?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a batch of observations in one transaction
    pub fn insert_snapshots(&self, snaps: &[OddsSnapshot]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for snap in snaps {
            insert_snapshot_row(&tx, snap)?;
        }
        tx.commit()?;
        Ok(snaps.len())
    }

    /// Every observation for an event, oldest first
    pub fn snapshots_for_event(&self, event_id: &str) -> Result<Vec<OddsSnapshot>> {
        self.odds_history(event_id, None, None)
    }

    /// Observations for an event, optionally narrowed to a market and selection
    pub fn odds_history(
        &self,
        event_id: &str,
        market_type: Option<&str>,
        selection: Option<&str>,
    ) -> Result<Vec<OddsSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM odds_snapshots
             WHERE event_id = ?1
               AND (?2 IS NULL OR market_type = ?2)
               AND (?3 IS NULL OR selection = ?3)
             ORDER BY observed_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![event_id, market_type, selection], map_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ordered price series of one selection (all bookmakers)
    pub fn price_history(
        &self,
        event_id: &str,
        market_type: &str,
        selection: &str,
        line: Option<f64>,
    ) -> Result<Vec<OddsSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM odds_snapshots
             WHERE event_id = ?1 AND market_type = ?2 AND selection = ?3 AND line_key = ?4
             ORDER BY observed_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(
                params![event_id, market_type, selection, line_key(line)],
                map_snapshot,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Best price observed for a selection inside `[from, to]`
    pub fn closing_price(
        &self,
        event_id: &str,
        market_type: &str,
        selection: &str,
        line: Option<f64>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let conn = self.conn()?;
        let price: Option<f64> = conn.query_row(
            "SELECT MAX(price) FROM odds_snapshots
             WHERE event_id = ?1 AND market_type = ?2 AND selection = ?3 AND line_key = ?4
               AND observed_at >= ?5 AND observed_at <= ?6",
            params![event_id, market_type, selection, line_key(line), from, to],
            |r| r.get(0),
        )?;
        Ok(price)
    }

    /// Identity of an event as last seen in the feed
    pub fn event_summary(&self, event_id: &str) -> Result<Option<EventSummary>> {
        let conn = self.conn()?;
        let summary = conn
            .query_row(
                "SELECT event_id, MAX(sport), MAX(league), MAX(league_name), MAX(home_team),
                        MAX(away_team), MAX(start_time), COUNT(DISTINCT bookmaker),
                        COUNT(DISTINCT market_type), MAX(observed_at)
                 FROM odds_snapshots WHERE event_id = ?1 GROUP BY event_id",
                params![event_id],
                map_event_summary,
            )
            .optional()?;
        Ok(summary)
    }

    /// Events kicking off within `hours` of `now`, soonest first
    pub fn upcoming_events(&self, now: DateTime<Utc>, hours: i64) -> Result<Vec<EventSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, MAX(sport), MAX(league), MAX(league_name), MAX(home_team),
                    MAX(away_team), MAX(start_time), COUNT(DISTINCT bookmaker),
                    COUNT(DISTINCT market_type), MAX(observed_at)
             FROM odds_snapshots
             WHERE start_time >= ?1 AND start_time <= ?2
             GROUP BY event_id
             ORDER BY MAX(start_time) ASC",
        )?;
        let rows = stmt
            .query_map(params![now, now + Duration::hours(hours)], map_event_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Market state ──────────────────────────────────────────────────────────

    /// Replace the derived state of each selection
    pub fn upsert_market_states(&self, states: &[MarketState]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for st in states {
            tx.execute(
                "INSERT INTO market_state (
                    event_id, market_type, selection, line, line_key, best_price,
                    best_bookmaker, market_avg, market_median, dispersion, book_count,
                    prices, is_stale, stale_books, computed_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                 ON CONFLICT(event_id, market_type, selection, line_key) DO UPDATE SET
                    line=excluded.line,
                    best_price=excluded.best_price,
                    best_bookmaker=excluded.best_bookmaker,
                    market_avg=excluded.market_avg,
                    market_median=excluded.market_median,
                    dispersion=excluded.dispersion,
                    book_count=excluded.book_count,
                    prices=excluded.prices,
                    is_stale=excluded.is_stale,
                    stale_books=excluded.stale_books,
                    computed_at=excluded.computed_at",
                params![
                    st.event_id,
                    st.market_type,
                    st.selection,
                    st.line,
                    line_key(st.line),
                    st.best_price,
                    st.best_bookmaker,
                    st.market_avg,
                    st.market_median,
                    st.dispersion,
                    st.book_count,
                    serde_json::to_string(&st.prices)?,
                    st.is_stale,
                    serde_json::to_string(&st.stale_books)?,
                    st.computed_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_market_states(&self, event_id: &str) -> Result<Vec<MarketState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, market_type, selection, line, best_price, best_bookmaker,
                    market_avg, market_median, dispersion, book_count, prices,
                    is_stale, stale_books, computed_at
             FROM market_state WHERE event_id = ?1
             ORDER BY market_type, selection, line_key",
        )?;
        let rows = stmt
            .query_map(params![event_id], map_market_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Fair odds ─────────────────────────────────────────────────────────────

    pub fn upsert_fair_odds(&self, fo: &FairOddsResult, computed_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO fair_odds (
                event_id, market_type, selection, line, line_key, model_prob,
                calibrated_prob, calibration_source, league_sample_size, fair_odds,
                confidence, confidence_badge, uncertainty, data_quality,
                market_dispersion, volatility, computed_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
             ON CONFLICT(event_id, market_type, selection, line_key) DO UPDATE SET
                model_prob=excluded.model_prob,
                calibrated_prob=excluded.calibrated_prob,
                calibration_source=excluded.calibration_source,
                league_sample_size=excluded.league_sample_size,
                fair_odds=excluded.fair_odds,
                confidence=excluded.confidence,
                confidence_badge=excluded.confidence_badge,
                uncertainty=excluded.uncertainty,
                data_quality=excluded.data_quality,
                market_dispersion=excluded.market_dispersion,
                volatility=excluded.volatility,
                computed_at=excluded.computed_at",
            params![
                fo.event_id,
                fo.market_type,
                fo.selection,
                fo.line,
                line_key(fo.line),
                fo.model_prob,
                fo.calibrated_prob,
                fo.calibration_source,
                fo.league_sample_size,
                fo.fair_odds,
                fo.confidence,
                fo.confidence_badge,
                fo.uncertainty,
                fo.data_quality,
                fo.market_dispersion,
                fo.volatility,
                computed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_fair_odds(&self, event_id: &str) -> Result<Vec<FairOddsResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, market_type, selection, line, model_prob, calibrated_prob,
                    calibration_source, league_sample_size, fair_odds, confidence,
                    confidence_badge, uncertainty, data_quality, market_dispersion, volatility
             FROM fair_odds WHERE event_id = ?1
             ORDER BY market_type, selection, line_key",
        )?;
        let rows = stmt
            .query_map(params![event_id], map_fair_odds)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── CLV records ───────────────────────────────────────────────────────────

    /// Append the CLV record of a bet. Returns false if one already exists.
    pub fn insert_clv_record(&self, rec: &ClvRecord) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO clv_records (
                bet_id, event_id, market_type, selection, line, bet_odds,
                closing_odds, clv_pct, close_window_minutes, close_reference, created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
             ON CONFLICT(bet_id) DO NOTHING",
            params![
                rec.bet_id,
                rec.event_id,
                rec.market_type,
                rec.selection,
                rec.line,
                rec.bet_odds,
                rec.closing_odds,
                rec.clv_pct,
                rec.close_window_minutes,
                rec.close_reference,
                rec.created_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn clv_record_for_bet(&self, bet_id: i64) -> Result<Option<ClvRecord>> {
        let conn = self.conn()?;
        let rec = conn
            .query_row(
                "SELECT id, bet_id, event_id, market_type, selection, line, bet_odds,
                        closing_odds, clv_pct, close_window_minutes, close_reference, created_at
                 FROM clv_records WHERE bet_id = ?1",
                params![bet_id],
                map_clv_record,
            )
            .optional()?;
        Ok(rec)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn insert_snapshot_row(conn: &rusqlite::Connection, snap: &OddsSnapshot) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO odds_snapshots (
            event_id, sport, league, league_name, home_team, away_team, start_time,
            market_type, selection, line, line_key, bookmaker, price, observed_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        params![
            snap.event_id,
            snap.sport,
            snap.league,
            snap.league_name,
            snap.home_team,
            snap.away_team,
            snap.start_time,
            snap.market_type,
            snap.selection,
            snap.line,
            line_key(snap.line),
            snap.bookmaker,
            snap.price,
            snap.observed_at,
        ],
    )
}

fn map_snapshot(row: &rusqlite::Row) -> rusqlite::Result<OddsSnapshot> {
    Ok(OddsSnapshot {
        id: row.get(0)?,
        event_id: row.get(1)?,
        sport: row.get(2)?,
        league: row.get(3)?,
        league_name: row.get(4)?,
        home_team: row.get(5)?,
        away_team: row.get(6)?,
        start_time: row.get(7)?,
        market_type: row.get(8)?,
        selection: row.get(9)?,
        line: row.get(10)?,
        bookmaker: row.get(11)?,
        price: row.get(12)?,
        observed_at: row.get(13)?,
    })
}

fn map_event_summary(row: &rusqlite::Row) -> rusqlite::Result<EventSummary> {
    Ok(EventSummary {
        event_id: row.get(0)?,
        sport: row.get(1)?,
        league: row.get(2)?,
        league_name: row.get(3)?,
        home_team: row.get(4)?,
        away_team: row.get(5)?,
        start_time: row.get(6)?,
        bookmaker_count: row.get(7)?,
        market_count: row.get(8)?,
        last_observed_at: row.get(9)?,
    })
}

fn map_market_state(row: &rusqlite::Row) -> rusqlite::Result<MarketState> {
    Ok(MarketState {
        event_id: row.get(0)?,
        market_type: row.get(1)?,
        selection: row.get(2)?,
        line: row.get(3)?,
        best_price: row.get(4)?,
        best_bookmaker: row.get(5)?,
        market_avg: row.get(6)?,
        market_median: row.get(7)?,
        dispersion: row.get(8)?,
        book_count: row.get(9)?,
        prices: json_column(row, 10)?,
        is_stale: row.get(11)?,
        stale_books: json_column(row, 12)?,
        computed_at: row.get(13)?,
    })
}

fn map_fair_odds(row: &rusqlite::Row) -> rusqlite::Result<FairOddsResult> {
    Ok(FairOddsResult {
        event_id: row.get(0)?,
        market_type: row.get(1)?,
        selection: row.get(2)?,
        line: row.get(3)?,
        model_prob: row.get(4)?,
        calibrated_prob: row.get(5)?,
        calibration_source: row.get(6)?,
        league_sample_size: row.get(7)?,
        fair_odds: row.get(8)?,
        confidence: row.get(9)?,
        confidence_badge: row.get(10)?,
        uncertainty: row.get(11)?,
        data_quality: row.get(12)?,
        market_dispersion: row.get(13)?,
        volatility: row.get(14)?,
    })
}

pub(crate) fn map_clv_record(row: &rusqlite::Row) -> rusqlite::Result<ClvRecord> {
    Ok(ClvRecord {
        id: row.get(0)?,
        bet_id: row.get(1)?,
        event_id: row.get(2)?,
        market_type: row.get(3)?,
        selection: row.get(4)?,
        line: row.get(5)?,
        bet_odds: row.get(6)?,
        closing_odds: row.get(7)?,
        clv_pct: row.get(8)?,
        close_window_minutes: row.get(9)?,
        close_reference: row.get(10)?,
        created_at: row.get(11)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn snapshot(
        event_id: &str,
        selection: &str,
        bookmaker: &str,
        price: f64,
        observed_at: DateTime<Utc>,
    ) -> OddsSnapshot {
        OddsSnapshot {
            id: None,
            event_id: event_id.to_string(),
            sport: "football".to_string(),
            league: "epl".to_string(),
            league_name: "Premier League".to_string(),
            home_team: "Arsenal".to_string(),
            away_team: "Chelsea".to_string(),
            start_time: Utc.with_ymd_and_hms(2026, 10, 20, 15, 0, 0).unwrap(),
            market_type: "moneyline".to_string(),
            selection: selection.to_string(),
            line: None,
            bookmaker: bookmaker.to_string(),
            price,
            observed_at,
        }
    }

    #[test]
    fn closing_price_uses_best_price_inside_window() {
        let db = Database::open_in_memory().unwrap();
        let kickoff = Utc.with_ymd_and_hms(2026, 10, 20, 15, 0, 0).unwrap();
        db.insert_snapshots(&[
            snapshot("e1", "home", "pinnacle", 2.40, kickoff - Duration::minutes(30)),
            snapshot("e1", "home", "pinnacle", 2.10, kickoff - Duration::minutes(4)),
            snapshot("e1", "home", "bet365", 2.05, kickoff - Duration::minutes(1)),
            snapshot("e1", "home", "bet365", 2.50, kickoff + Duration::minutes(10)),
        ])
        .unwrap();
        let close = db
            .closing_price(
                "e1",
                "moneyline",
                "home",
                None,
                kickoff - Duration::minutes(5),
                kickoff + Duration::minutes(2),
            )
            .unwrap();
        assert_eq!(close, Some(2.10));
        let none = db
            .closing_price("e1", "moneyline", "away", None, kickoff, kickoff)
            .unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn upcoming_events_respects_horizon() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 12, 0, 0).unwrap();
        db.insert_snapshot(&snapshot("e1", "home", "pinnacle", 2.0, now)).unwrap();
        let mut far = snapshot("e2", "home", "pinnacle", 2.0, now);
        far.start_time = now + Duration::hours(72);
        db.insert_snapshot(&far).unwrap();

        let events = db.upcoming_events(now, 24).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "e1");
        assert_eq!(events[0].bookmaker_count, 1);
    }

    #[test]
    fn clv_record_is_written_once_per_bet() {
        let db = Database::open_in_memory().unwrap();
        let bet_id = crate::db::bets::tests::insert_sample_bet(&db, "e9");
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 15, 5, 0).unwrap();
        let rec = ClvRecord {
            id: None,
            bet_id,
            event_id: "e9".into(),
            market_type: "moneyline".into(),
            selection: "home".into(),
            line: None,
            bet_odds: 2.0,
            closing_odds: 1.8,
            clv_pct: -10.0,
            close_window_minutes: 5,
            close_reference: now,
            created_at: now,
        };
        assert!(db.insert_clv_record(&rec).unwrap());
        assert!(!db.insert_clv_record(&rec).unwrap());
        let stored = db.clv_record_for_bet(bet_id).unwrap().unwrap();
        assert_eq!(stored.closing_odds, 1.8);
    }
}
