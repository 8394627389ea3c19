use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Text-backed enum: `as_str`, `Display`, `FromStr` and SQLite conversions.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Lifecycle state of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Candidate,
    Published,
    Placed,
    Settled,
    Voided,
}

text_enum!(BetStatus {
    Candidate => "candidate",
    Published => "published",
    Placed => "placed",
    Settled => "settled",
    Voided => "voided",
});

impl BetStatus {
    /// Legal next states. Settled and voided are terminal.
    pub fn allowed_next(&self) -> &'static [BetStatus] {
        match self {
            BetStatus::Candidate => &[BetStatus::Published, BetStatus::Voided],
            BetStatus::Published => &[BetStatus::Placed, BetStatus::Voided],
            BetStatus::Placed => &[BetStatus::Settled, BetStatus::Voided],
            BetStatus::Settled | BetStatus::Voided => &[],
        }
    }

    pub fn can_transition_to(&self, next: BetStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// States from which `settle_bet` may run.
    pub fn is_settleable(&self) -> bool {
        matches!(
            self,
            BetStatus::Candidate | BetStatus::Published | BetStatus::Placed
        )
    }
}

/// Publication gate of a (sport, league, market) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatingStatus {
    #[serde(rename = "PRODUCTION")]
    Production,
    #[serde(rename = "LEARNING_ONLY")]
    LearningOnly,
    #[serde(rename = "DISABLED")]
    Disabled,
}

text_enum!(GatingStatus {
    Production => "PRODUCTION",
    LearningOnly => "LEARNING_ONLY",
    Disabled => "DISABLED",
});

impl GatingStatus {
    pub fn can_publish(&self) -> bool {
        *self == GatingStatus::Production
    }

    pub fn can_display(&self) -> bool {
        matches!(self, GatingStatus::Production | GatingStatus::LearningOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfidenceBadge {
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "LOW")]
    Low,
}

text_enum!(ConfidenceBadge {
    High => "HIGH",
    Medium => "MEDIUM",
    Low => "LOW",
});

/// Final outcome reported by a settlement producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetResult {
    Won,
    Lost,
    Push,
    HalfWon,
    HalfLost,
    Void,
}

text_enum!(BetResult {
    Won => "won",
    Lost => "lost",
    Push => "push",
    HalfWon => "half_won",
    HalfLost => "half_lost",
    Void => "void",
});

impl BetResult {
    pub fn is_win(&self) -> bool {
        matches!(self, BetResult::Won | BetResult::HalfWon)
    }

    pub fn is_loss(&self) -> bool {
        matches!(self, BetResult::Lost | BetResult::HalfLost)
    }
}

/// Price-movement signals derived from a selection's odds history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharpnessTag {
    SteamMoveDown,
    SteamMoveUp,
    GotBestPrice,
    PriceDropped,
    ConsistentShortening,
    ConsistentDrifting,
    HighBookSpread,
}

text_enum!(SharpnessTag {
    SteamMoveDown => "steam_move_down",
    SteamMoveUp => "steam_move_up",
    GotBestPrice => "got_best_price",
    PriceDropped => "price_dropped",
    ConsistentShortening => "consistent_shortening",
    ConsistentDrifting => "consistent_drifting",
    HighBookSpread => "high_book_spread",
});

/// Minutes-to-kickoff band at the moment a candidate was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimingBucket {
    #[serde(rename = "0-1h")]
    UnderOneHour,
    #[serde(rename = "1-3h")]
    OneToThreeHours,
    #[serde(rename = "3-6h")]
    ThreeToSixHours,
    #[serde(rename = "6-12h")]
    SixToTwelveHours,
    #[serde(rename = "12-24h")]
    TwelveToTwentyFourHours,
    #[serde(rename = "24h+")]
    OverADay,
}

text_enum!(TimingBucket {
    UnderOneHour => "0-1h",
    OneToThreeHours => "1-3h",
    ThreeToSixHours => "3-6h",
    SixToTwelveHours => "6-12h",
    TwelveToTwentyFourHours => "12-24h",
    OverADay => "24h+",
});

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Canonical text form of an optional handicap/total line, used in unique
/// keys so that "no line" compares equal to itself in SQL.
pub fn line_key(line: Option<f64>) -> String {
    match line {
        None => String::new(),
        Some(l) if l == 0.0 => "0.00".to_string(),
        Some(l) => format!("{:.2}", l),
    }
}

/// The unit of promotion/demotion decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment {
    pub sport: String,
    pub league: String,
    pub market_type: String,
}

impl Segment {
    pub fn new(sport: &str, league: &str, market_type: &str) -> Self {
        Segment {
            sport: sport.to_string(),
            league: league.to_string(),
            market_type: market_type.to_string(),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.sport, self.league, self.market_type)
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// One bookmaker price observation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub id: Option<i64>,
    pub event_id: String,
    pub sport: String,
    pub league: String,
    #[serde(default)]
    pub league_name: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub market_type: String,
    pub selection: String,
    pub line: Option<f64>,
    pub bookmaker: String,
    /// Decimal odds
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

/// Consolidated cross-book view of one selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub event_id: String,
    pub market_type: String,
    pub selection: String,
    pub line: Option<f64>,
    pub best_price: f64,
    pub best_bookmaker: String,
    pub market_avg: f64,
    pub market_median: f64,
    /// Population standard deviation of the latest per-book prices
    pub dispersion: f64,
    pub book_count: i64,
    pub prices: BTreeMap<String, f64>,
    pub is_stale: bool,
    pub stale_books: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairOddsResult {
    pub event_id: String,
    pub market_type: String,
    pub selection: String,
    pub line: Option<f64>,
    pub model_prob: f64,
    pub calibrated_prob: f64,
    pub calibration_source: String,
    pub league_sample_size: i64,
    pub fair_odds: f64,
    pub confidence: f64,
    pub confidence_badge: ConfidenceBadge,
    pub uncertainty: f64,
    pub data_quality: f64,
    pub market_dispersion: f64,
    pub volatility: f64,
}

/// A priced, positive-EV candidate before it enters the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeResult {
    pub event_id: String,
    pub sport: String,
    pub league: String,
    pub league_name: String,
    pub home_team: String,
    pub away_team: String,
    pub market_type: String,
    pub selection: String,
    pub line: Option<f64>,
    pub book_odds: f64,
    pub bookmaker: String,
    pub fair_odds: f64,
    pub model_prob: f64,
    pub calibrated_prob: f64,
    pub edge_pct: f64,
    pub ev_pct: f64,
    pub expected_clv_pct: Option<f64>,
    pub confidence: f64,
    pub confidence_badge: ConfidenceBadge,
    pub sharpness_tags: Vec<SharpnessTag>,
    pub timing_bucket: TimingBucket,
    pub start_time: DateTime<Utc>,
    pub volatility: f64,
    pub gating_status: GatingStatus,
}

impl EdgeResult {
    pub fn segment(&self) -> Segment {
        Segment::new(&self.sport, &self.league, &self.market_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClvRecord {
    pub id: Option<i64>,
    pub bet_id: i64,
    pub event_id: String,
    pub market_type: String,
    pub selection: String,
    pub line: Option<f64>,
    pub bet_odds: f64,
    pub closing_odds: f64,
    pub clv_pct: f64,
    pub close_window_minutes: i64,
    pub close_reference: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Stored gating row for one segment, plus its rolling scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityMap {
    pub sport: String,
    pub league: String,
    pub market_type: String,
    pub status: GatingStatus,
    pub total_bets: i64,
    pub roi_pct: f64,
    pub clv_avg: f64,
    pub stability_score: f64,
    pub drawdown_pct: f64,
    pub recency_bonus: f64,
    pub composite_score: f64,
    pub manual_override: bool,
    pub override_reason: Option<String>,
    pub change_reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EligibilityMap {
    pub fn segment(&self) -> Segment {
        Segment::new(&self.sport, &self.league, &self.market_type)
    }

    pub fn can_publish(&self) -> bool {
        self.status.can_publish()
    }
}

/// Canonical recommendation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetLifecycle {
    pub id: i64,
    pub event_id: String,
    pub sport: String,
    pub league: String,
    pub league_name: String,
    pub home_team: String,
    pub away_team: String,
    pub market_type: String,
    pub selection: String,
    pub line: Option<f64>,
    pub bookmaker: String,
    pub odds: f64,
    pub fair_odds: f64,
    pub model_prob: f64,
    pub calibrated_prob: f64,
    pub edge_pct: f64,
    pub ev_pct: f64,
    pub expected_clv_pct: Option<f64>,
    pub confidence: f64,
    pub confidence_badge: ConfidenceBadge,
    pub timing_bucket: TimingBucket,
    pub volatility: f64,
    pub status: BetStatus,
    pub gating_status: GatingStatus,
    pub stake_units: f64,
    pub result: Option<BetResult>,
    pub profit_loss: Option<f64>,
    pub closing_odds: Option<f64>,
    pub clv_pct: Option<f64>,
    pub start_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub placed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub notes: String,
}

impl BetLifecycle {
    pub fn segment(&self) -> Segment {
        Segment::new(&self.sport, &self.league, &self.market_type)
    }
}

/// Input to `create_candidate`. Gating status is filled in at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBet {
    pub event_id: String,
    pub sport: String,
    pub league: String,
    pub league_name: String,
    pub home_team: String,
    pub away_team: String,
    pub market_type: String,
    pub selection: String,
    pub line: Option<f64>,
    pub bookmaker: String,
    pub odds: f64,
    pub fair_odds: f64,
    pub model_prob: f64,
    pub calibrated_prob: f64,
    pub edge_pct: f64,
    pub ev_pct: f64,
    pub expected_clv_pct: Option<f64>,
    pub confidence: f64,
    pub confidence_badge: ConfidenceBadge,
    pub timing_bucket: TimingBucket,
    pub volatility: f64,
    pub stake_units: f64,
    pub start_time: DateTime<Utc>,
    pub tags: Vec<String>,
    pub notes: String,
}

impl NewBet {
    pub fn from_edge(edge: &EdgeResult, stake_units: f64) -> Self {
        NewBet {
            event_id: edge.event_id.clone(),
            sport: edge.sport.clone(),
            league: edge.league.clone(),
            league_name: edge.league_name.clone(),
            home_team: edge.home_team.clone(),
            away_team: edge.away_team.clone(),
            market_type: edge.market_type.clone(),
            selection: edge.selection.clone(),
            line: edge.line,
            bookmaker: edge.bookmaker.clone(),
            odds: edge.book_odds,
            fair_odds: edge.fair_odds,
            model_prob: edge.model_prob,
            calibrated_prob: edge.calibrated_prob,
            edge_pct: edge.edge_pct,
            ev_pct: edge.ev_pct,
            expected_clv_pct: edge.expected_clv_pct,
            confidence: edge.confidence,
            confidence_badge: edge.confidence_badge,
            timing_bucket: edge.timing_bucket,
            volatility: edge.volatility,
            stake_units,
            start_time: edge.start_time,
            tags: edge
                .sharpness_tags
                .iter()
                .map(|t| t.as_str().to_string())
                .collect(),
            notes: String::new(),
        }
    }

    pub fn segment(&self) -> Segment {
        Segment::new(&self.sport, &self.league, &self.market_type)
    }

    /// Human-readable identity tuple for logs and rejection messages.
    pub fn identity(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.event_id,
            self.market_type,
            self.selection,
            line_key(self.line),
            self.bookmaker
        )
    }
}

/// Settlement producer payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub result: BetResult,
    pub profit_loss: f64,
    pub closing_odds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub bet_id: i64,
    pub seq: i64,
    pub action: String,
    pub old_status: Option<BetStatus>,
    pub new_status: Option<BetStatus>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatingChange {
    pub id: Option<i64>,
    pub sport: String,
    pub league: String,
    pub market_type: String,
    pub old_status: Option<GatingStatus>,
    pub new_status: GatingStatus,
    pub reason: String,
    pub manual: bool,
    pub changed_at: DateTime<Utc>,
}

/// Model output for one selection, supplied by an external producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProbability {
    pub market_type: String,
    pub selection: String,
    #[serde(default)]
    pub line: Option<f64>,
    pub probability: f64,
}

/// Anything that behaves like a bet: an unsaved candidate or a tracked row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recommendation {
    Candidate(EdgeResult),
    Tracked(BetLifecycle),
}

impl Recommendation {
    pub fn event_id(&self) -> &str {
        match self {
            Recommendation::Candidate(e) => &e.event_id,
            Recommendation::Tracked(b) => &b.event_id,
        }
    }

    pub fn market_type(&self) -> &str {
        match self {
            Recommendation::Candidate(e) => &e.market_type,
            Recommendation::Tracked(b) => &b.market_type,
        }
    }

    pub fn selection(&self) -> &str {
        match self {
            Recommendation::Candidate(e) => &e.selection,
            Recommendation::Tracked(b) => &b.selection,
        }
    }

    pub fn line(&self) -> Option<f64> {
        match self {
            Recommendation::Candidate(e) => e.line,
            Recommendation::Tracked(b) => b.line,
        }
    }

    /// Price the bet was (or would be) taken at.
    pub fn price(&self) -> f64 {
        match self {
            Recommendation::Candidate(e) => e.book_odds,
            Recommendation::Tracked(b) => b.odds,
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        match self {
            Recommendation::Candidate(e) => e.start_time,
            Recommendation::Tracked(b) => b.start_time,
        }
    }

    pub fn segment(&self) -> Segment {
        match self {
            Recommendation::Candidate(e) => e.segment(),
            Recommendation::Tracked(b) => b.segment(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_only_moves_forward() {
        assert!(BetStatus::Candidate.can_transition_to(BetStatus::Published));
        assert!(BetStatus::Published.can_transition_to(BetStatus::Placed));
        assert!(BetStatus::Placed.can_transition_to(BetStatus::Settled));
        assert!(!BetStatus::Placed.can_transition_to(BetStatus::Candidate));
        assert!(!BetStatus::Settled.can_transition_to(BetStatus::Placed));
        assert!(!BetStatus::Candidate.can_transition_to(BetStatus::Settled));
        for s in [BetStatus::Candidate, BetStatus::Published, BetStatus::Placed] {
            assert!(s.can_transition_to(BetStatus::Voided));
        }
        assert!(BetStatus::Settled.is_terminal());
        assert!(BetStatus::Voided.is_terminal());
    }

    #[test]
    fn text_enums_round_trip_through_strings() {
        for s in BetStatus::ALL {
            assert_eq!(s.as_str().parse::<BetStatus>().unwrap(), *s);
        }
        assert_eq!(
            "LEARNING_ONLY".parse::<GatingStatus>().unwrap(),
            GatingStatus::LearningOnly
        );
        assert!("learning".parse::<GatingStatus>().is_err());
        assert_eq!(TimingBucket::OverADay.to_string(), "24h+");
    }

    #[test]
    fn line_key_normalises_missing_and_negative_zero() {
        assert_eq!(line_key(None), "");
        assert_eq!(line_key(Some(2.5)), "2.50");
        assert_eq!(line_key(Some(-0.0)), "0.00");
        assert_eq!(line_key(Some(-1.25)), "-1.25");
    }

    #[test]
    fn gating_status_serializes_upper_case() {
        let json = serde_json::to_string(&GatingStatus::LearningOnly).unwrap();
        assert_eq!(json, "\"LEARNING_ONLY\"");
        assert!(GatingStatus::Production.can_publish());
        assert!(!GatingStatus::LearningOnly.can_publish());
        assert!(GatingStatus::LearningOnly.can_display());
        assert!(!GatingStatus::Disabled.can_display());
    }
}
