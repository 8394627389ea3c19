use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{PipelineError, Result};

pub mod bets;
pub mod gating;
pub mod market;
pub mod models;
pub mod reports;

/// Thread-safe SQLite handle (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PipelineError::LockPoisoned)
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS odds_snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    TEXT    NOT NULL,
    sport       TEXT    NOT NULL,
    league      TEXT    NOT NULL,
    league_name TEXT    NOT NULL DEFAULT '',
    home_team   TEXT    NOT NULL,
    away_team   TEXT    NOT NULL,
    start_time  TEXT    NOT NULL,
    market_type TEXT    NOT NULL,
    selection   TEXT    NOT NULL,
    line        REAL,
    line_key    TEXT    NOT NULL DEFAULT '',
    bookmaker   TEXT    NOT NULL,
    price       REAL    NOT NULL CHECK (price > 1.0),
    observed_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS market_state (
    event_id       TEXT    NOT NULL,
    market_type    TEXT    NOT NULL,
    selection      TEXT    NOT NULL,
    line           REAL,
    line_key       TEXT    NOT NULL DEFAULT '',
    best_price     REAL    NOT NULL,
    best_bookmaker TEXT    NOT NULL,
    market_avg     REAL    NOT NULL,
    market_median  REAL    NOT NULL,
    dispersion     REAL    NOT NULL,
    book_count     INTEGER NOT NULL,
    prices         TEXT    NOT NULL,
    is_stale       INTEGER NOT NULL DEFAULT 0,
    stale_books    TEXT    NOT NULL DEFAULT '[]',
    computed_at    TEXT    NOT NULL,
    PRIMARY KEY (event_id, market_type, selection, line_key)
);

CREATE TABLE IF NOT EXISTS fair_odds (
    event_id           TEXT    NOT NULL,
    market_type        TEXT    NOT NULL,
    selection          TEXT    NOT NULL,
    line               REAL,
    line_key           TEXT    NOT NULL DEFAULT '',
    model_prob         REAL    NOT NULL,
    calibrated_prob    REAL    NOT NULL,
    calibration_source TEXT    NOT NULL,
    league_sample_size INTEGER NOT NULL DEFAULT 0,
    fair_odds          REAL    NOT NULL,
    confidence         REAL    NOT NULL,
    confidence_badge   TEXT    NOT NULL,
    uncertainty        REAL    NOT NULL,
    data_quality       REAL    NOT NULL,
    market_dispersion  REAL    NOT NULL,
    volatility         REAL    NOT NULL,
    computed_at        TEXT    NOT NULL,
    PRIMARY KEY (event_id, market_type, selection, line_key)
);

CREATE TABLE IF NOT EXISTS bet_lifecycle (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id         TEXT    NOT NULL,
    sport            TEXT    NOT NULL,
    league           TEXT    NOT NULL,
    league_name      TEXT    NOT NULL DEFAULT '',
    home_team        TEXT    NOT NULL,
    away_team        TEXT    NOT NULL,
    market_type      TEXT    NOT NULL,
    selection        TEXT    NOT NULL,
    line             REAL,
    line_key         TEXT    NOT NULL DEFAULT '',
    bookmaker        TEXT    NOT NULL,
    odds             REAL    NOT NULL,
    fair_odds        REAL    NOT NULL,
    model_prob       REAL    NOT NULL,
    calibrated_prob  REAL    NOT NULL,
    edge_pct         REAL    NOT NULL,
    ev_pct           REAL    NOT NULL,
    expected_clv_pct REAL,
    confidence       REAL    NOT NULL,
    confidence_badge TEXT    NOT NULL,
    timing_bucket    TEXT    NOT NULL,
    volatility       REAL    NOT NULL DEFAULT 0,
    status           TEXT    NOT NULL DEFAULT 'candidate',
    gating_status    TEXT    NOT NULL,
    stake_units      REAL    NOT NULL DEFAULT 1.0,
    result           TEXT,
    profit_loss      REAL,
    closing_odds     REAL,
    clv_pct          REAL,
    start_time       TEXT    NOT NULL,
    created_at       TEXT    NOT NULL,
    published_at     TEXT,
    placed_at        TEXT,
    settled_at       TEXT,
    voided_at        TEXT,
    tags             TEXT    NOT NULL DEFAULT '[]',
    notes            TEXT    NOT NULL DEFAULT '',
    UNIQUE (event_id, market_type, selection, line_key, bookmaker)
);

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    bet_id      INTEGER NOT NULL,
    seq         INTEGER NOT NULL,
    action      TEXT    NOT NULL,
    old_status  TEXT,
    new_status  TEXT,
    details     TEXT    NOT NULL DEFAULT '{}',
    timestamp   TEXT    NOT NULL,
    source      TEXT    NOT NULL DEFAULT 'system',
    UNIQUE (bet_id, seq),
    FOREIGN KEY (bet_id) REFERENCES bet_lifecycle(id)
);

CREATE TABLE IF NOT EXISTS clv_records (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    bet_id               INTEGER NOT NULL UNIQUE,
    event_id             TEXT    NOT NULL,
    market_type          TEXT    NOT NULL,
    selection            TEXT    NOT NULL,
    line                 REAL,
    bet_odds             REAL    NOT NULL,
    closing_odds         REAL    NOT NULL,
    clv_pct              REAL    NOT NULL,
    close_window_minutes INTEGER NOT NULL,
    close_reference      TEXT    NOT NULL,
    created_at           TEXT    NOT NULL,
    FOREIGN KEY (bet_id) REFERENCES bet_lifecycle(id)
);

CREATE TABLE IF NOT EXISTS segment_eligibility (
    sport           TEXT    NOT NULL,
    league          TEXT    NOT NULL,
    market_type     TEXT    NOT NULL,
    status          TEXT    NOT NULL DEFAULT 'LEARNING_ONLY',
    total_bets      INTEGER NOT NULL DEFAULT 0,
    roi_pct         REAL    NOT NULL DEFAULT 0,
    clv_avg         REAL    NOT NULL DEFAULT 0,
    stability_score REAL    NOT NULL DEFAULT 0,
    drawdown_pct    REAL    NOT NULL DEFAULT 0,
    recency_bonus   REAL    NOT NULL DEFAULT 0,
    composite_score REAL    NOT NULL DEFAULT 0,
    manual_override INTEGER NOT NULL DEFAULT 0,
    override_reason TEXT,
    change_reason   TEXT,
    updated_at      TEXT,
    PRIMARY KEY (sport, league, market_type)
);

CREATE TABLE IF NOT EXISTS gating_changes (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sport       TEXT    NOT NULL,
    league      TEXT    NOT NULL,
    market_type TEXT    NOT NULL,
    old_status  TEXT,
    new_status  TEXT    NOT NULL,
    reason      TEXT    NOT NULL,
    manual      INTEGER NOT NULL DEFAULT 0,
    changed_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS weekly_reports (
    week_start  TEXT    PRIMARY KEY,
    week_end    TEXT    NOT NULL,
    report_data TEXT    NOT NULL,
    created_at  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_event ON odds_snapshots(event_id, market_type, selection, line_key);
CREATE INDEX IF NOT EXISTS idx_snapshots_start ON odds_snapshots(start_time);
CREATE INDEX IF NOT EXISTS idx_bets_status ON bet_lifecycle(status);
CREATE INDEX IF NOT EXISTS idx_bets_segment ON bet_lifecycle(sport, league, market_type);
CREATE INDEX IF NOT EXISTS idx_bets_created ON bet_lifecycle(created_at);
CREATE INDEX IF NOT EXISTS idx_audit_bet ON audit_log(bet_id, seq);
CREATE INDEX IF NOT EXISTS idx_gating_changes_at ON gating_changes(changed_at);
"#;

/// Decode a JSON text column, surfacing failures as a conversion error.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let conn = db.conn().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 9);
    }
}
