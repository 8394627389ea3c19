use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

/// Multi-book odds aggregation and self-gating recommendation service
#[derive(Parser, Debug, Clone)]
#[command(name = "sharpline", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "sharpline.db")]
    pub database_path: String,

    /// JSON API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// Key expected in the `x-admin-key` header for administrative routes.
    /// Admin routes are refused when unset.
    #[arg(long, env = "ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// The Odds API key. Feed ingestion is disabled when unset.
    #[arg(long, env = "ODDS_API_KEY")]
    pub odds_api_key: Option<String>,

    /// The Odds API base URL
    #[arg(long, env = "ODDS_API_URL", default_value = "https://api.the-odds-api.com/v4")]
    pub odds_api_url: String,

    /// Sport keys to poll, comma separated (e.g. soccer_epl,basketball_nba)
    #[arg(
        long,
        env = "ODDS_SPORTS",
        value_delimiter = ',',
        default_value = "soccer_epl"
    )]
    pub odds_sports: Vec<String>,

    /// Bookmaker regions to request
    #[arg(long, env = "ODDS_REGIONS", default_value = "eu,uk")]
    pub odds_regions: String,

    /// Feed markets to request
    #[arg(long, env = "ODDS_MARKETS", default_value = "h2h,spreads,totals")]
    pub odds_markets: String,

    /// Odds ingestion interval in seconds
    #[arg(long, env = "INGEST_INTERVAL_SECS", default_value = "300")]
    pub ingest_interval_secs: u64,

    /// Closing-line capture sweep interval in seconds
    #[arg(long, env = "CLV_INTERVAL_SECS", default_value = "120")]
    pub clv_interval_secs: u64,

    /// Segment promotion cycle interval in seconds
    #[arg(long, env = "PROMOTION_INTERVAL_SECS", default_value = "3600")]
    pub promotion_interval_secs: u64,

    /// Optional TOML file overriding model thresholds and weights
    #[arg(long, env = "TUNING_PATH")]
    pub tuning_path: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.ingest_interval_secs == 0
            || self.clv_interval_secs == 0
            || self.promotion_interval_secs == 0
        {
            anyhow::bail!("scheduler intervals must be greater than zero");
        }
        if self.odds_sports.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("at least one sport key is required in ODDS_SPORTS");
        }
        if matches!(self.admin_key.as_deref(), Some(k) if k.trim().is_empty()) {
            anyhow::bail!("ADMIN_KEY must not be blank when set");
        }
        url::Url::parse(&self.odds_api_url)
            .with_context(|| format!("Invalid ODDS_API_URL: {}", self.odds_api_url))?;
        Ok(())
    }

    /// Tuning from `tuning_path`, or the built-in defaults
    pub fn load_tuning(&self) -> Result<Tuning> {
        let tuning = match &self.tuning_path {
            Some(path) => Tuning::load(path)?,
            None => Tuning::default(),
        };
        tuning.validate()?;
        Ok(tuning)
    }
}

// ── Model tuning ──────────────────────────────────────────────────────────────

/// Every threshold and weight used by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub market: MarketTuning,
    pub calibration: CalibrationTuning,
    pub confidence: ConfidenceTuning,
    pub edge: EdgeTuning,
    pub gating: GatingTuning,
    pub lifecycle: LifecycleTuning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketTuning {
    pub stale_after_minutes: i64,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for MarketTuning {
    fn default() -> Self {
        MarketTuning {
            stale_after_minutes: 30,
            retry_attempts: 3,
            retry_base_ms: 500,
            retry_max_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationTuning {
    /// Settled rows a (league, market) needs before it enters the table
    pub min_rows: i64,
    /// Sample at which a segment factor is trusted over the global one
    pub min_league_sample: i64,
    pub global_shrink_weight: f64,
    pub cache_ttl_secs: i64,
    pub prob_floor: f64,
    pub prob_ceiling: f64,
}

impl Default for CalibrationTuning {
    fn default() -> Self {
        CalibrationTuning {
            min_rows: 10,
            min_league_sample: 30,
            global_shrink_weight: 0.15,
            cache_ttl_secs: 3600,
            prob_floor: 0.01,
            prob_ceiling: 0.99,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceTuning {
    pub certainty_weight: f64,
    pub data_quality_weight: f64,
    pub strength_weight: f64,
    pub dispersion_weight: f64,
    pub dispersion_multiplier: f64,
    pub max_dispersion_penalty: f64,
    pub floor: f64,
    pub ceiling: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
}

impl Default for ConfidenceTuning {
    fn default() -> Self {
        ConfidenceTuning {
            certainty_weight: 0.3,
            data_quality_weight: 0.3,
            strength_weight: 0.2,
            dispersion_weight: 0.2,
            dispersion_multiplier: 5.0,
            max_dispersion_penalty: 0.3,
            floor: 0.1,
            ceiling: 1.0,
            high_threshold: 0.70,
            medium_threshold: 0.45,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeTuning {
    pub close_before_minutes: i64,
    pub close_after_minutes: i64,
    pub close_lookback_hours: i64,
    pub steam_threshold: f64,
    pub best_price_margin: f64,
    pub high_spread_threshold: f64,
    pub min_spread_books: usize,
    pub trend_points: usize,
    pub top_n: usize,
    pub ev_weight: f64,
    pub edge_weight: f64,
    pub confidence_weight: f64,
    pub confidence_scale: f64,
    pub clv_weight: f64,
    pub sharpness_weight: f64,
    pub sharpness_bonus: f64,
    pub default_stake_units: f64,
}

impl Default for EdgeTuning {
    fn default() -> Self {
        EdgeTuning {
            close_before_minutes: 5,
            close_after_minutes: 2,
            close_lookback_hours: 48,
            steam_threshold: 0.03,
            best_price_margin: 0.02,
            high_spread_threshold: 0.05,
            min_spread_books: 3,
            trend_points: 3,
            top_n: 20,
            ev_weight: 0.35,
            edge_weight: 0.25,
            confidence_weight: 0.20,
            confidence_scale: 50.0,
            clv_weight: 0.10,
            sharpness_weight: 0.05,
            sharpness_bonus: 10.0,
            default_stake_units: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatingTuning {
    pub min_segment_bets: i64,
    pub promote_min_bets: i64,
    pub promote_min_roi: f64,
    pub promote_min_clv: f64,
    pub promote_min_stability: f64,
    pub demote_min_bets: i64,
    pub demote_max_roi: f64,
    pub demote_max_clv: f64,
    pub demote_clv_min_bets: i64,
    pub disable_min_bets: i64,
    pub disable_max_roi: f64,
    pub candidate_fraction: f64,
    pub stability_min_points: usize,
    pub recency_window: usize,
    pub roi_weight: f64,
    pub roi_min: f64,
    pub roi_max: f64,
    pub clv_weight: f64,
    pub clv_scale: f64,
    pub clv_min: f64,
    pub clv_max: f64,
    pub stability_weight: f64,
    pub stability_scale: f64,
    pub drawdown_weight: f64,
    pub drawdown_cap: f64,
    pub volume_weight: f64,
    pub volume_scale: f64,
    pub recency_weight: f64,
    pub recency_scale: f64,
}

impl Default for GatingTuning {
    fn default() -> Self {
        GatingTuning {
            min_segment_bets: 5,
            promote_min_bets: 80,
            promote_min_roi: 3.0,
            promote_min_clv: 0.0,
            promote_min_stability: 0.3,
            demote_min_bets: 80,
            demote_max_roi: -2.0,
            demote_max_clv: -0.5,
            demote_clv_min_bets: 100,
            disable_min_bets: 150,
            disable_max_roi: -8.0,
            candidate_fraction: 0.6,
            stability_min_points: 5,
            recency_window: 20,
            roi_weight: 0.25,
            roi_min: -20.0,
            roi_max: 50.0,
            clv_weight: 0.20,
            clv_scale: 10.0,
            clv_min: -10.0,
            clv_max: 20.0,
            stability_weight: 0.15,
            stability_scale: 20.0,
            drawdown_weight: 0.10,
            drawdown_cap: 30.0,
            volume_weight: 0.15,
            volume_scale: 3.0,
            recency_weight: 0.15,
            recency_scale: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleTuning {
    /// Non-voided candidates per sport per UTC day
    pub daily_total_cap: i64,
    pub default_market_cap: i64,
    pub market_caps: BTreeMap<String, i64>,
}

impl Default for LifecycleTuning {
    fn default() -> Self {
        let market_caps = [
            ("moneyline", 10),
            ("totals", 10),
            ("asian_handicap", 5),
            ("btts", 8),
            ("corners", 20),
            ("cards", 20),
            ("double_chance", 5),
            ("draw_no_bet", 5),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        LifecycleTuning {
            daily_total_cap: 50,
            default_market_cap: 10,
            market_caps,
        }
    }
}

impl LifecycleTuning {
    pub fn market_cap(&self, market_type: &str) -> i64 {
        self.market_caps
            .get(market_type)
            .copied()
            .unwrap_or(self.default_market_cap)
    }
}

impl Tuning {
    /// Load tuning from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tuning file: {path}"))?;
        let tuning: Tuning = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse tuning file: {path}"))?;
        Ok(tuning)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.calibration;
        if !(0.0..=1.0).contains(&c.global_shrink_weight) {
            anyhow::bail!("calibration.global_shrink_weight must be between 0.0 and 1.0");
        }
        if c.min_league_sample <= 0 || c.min_rows <= 0 {
            anyhow::bail!("calibration sample thresholds must be positive");
        }
        if !(0.0 < c.prob_floor && c.prob_floor < c.prob_ceiling && c.prob_ceiling < 1.0) {
            anyhow::bail!("calibration probability bounds must satisfy 0 < floor < ceiling < 1");
        }
        if self.market.stale_after_minutes <= 0 {
            anyhow::bail!("market.stale_after_minutes must be positive");
        }
        if self.edge.close_lookback_hours <= 0 {
            anyhow::bail!("edge.close_lookback_hours must be positive");
        }
        if self.edge.top_n == 0 {
            anyhow::bail!("edge.top_n must be at least 1");
        }
        let g = &self.gating;
        if g.disable_max_roi >= g.demote_max_roi {
            anyhow::bail!("gating.disable_max_roi must be below gating.demote_max_roi");
        }
        if !(0.0..=1.0).contains(&g.candidate_fraction) {
            anyhow::bail!("gating.candidate_fraction must be between 0.0 and 1.0");
        }
        if self.lifecycle.daily_total_cap < 0 {
            anyhow::bail!("lifecycle.daily_total_cap must not be negative");
        }
        Ok(())
    }
}
