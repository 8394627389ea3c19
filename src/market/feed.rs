use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::OddsSnapshot;

/// Trait that every bookmaker odds source must implement.
#[async_trait]
pub trait OddsFeed: Send + Sync {
    /// Return the current price board, stamped with `observed_at`.
    async fn fetch_snapshots(&self, observed_at: DateTime<Utc>) -> Result<Vec<OddsSnapshot>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
