use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use super::feed::OddsFeed;
use crate::db::models::OddsSnapshot;

/// Odds feed backed by The Odds API v4, one sport key per instance.
/// Docs: <https://the-odds-api.com/liveapi/guides/v4/>
pub struct TheOddsApi {
    http: Client,
    api_key: String,
    base_url: Url,
    sport_key: String,
    regions: String,
    markets: String,
    name: String,
}

impl TheOddsApi {
    pub fn new(
        api_key: &str,
        base_url: &str,
        sport_key: &str,
        regions: &str,
        markets: &str,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid odds API URL: {base_url}"))?;
        Ok(TheOddsApi {
            http,
            api_key: api_key.to_string(),
            base_url,
            sport_key: sport_key.to_string(),
            regions: regions.to_string(),
            markets: markets.to_string(),
            name: format!("TheOddsApi:{sport_key}"),
        })
    }

    fn odds_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("odds API URL cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(["sports", self.sport_key.as_str(), "odds"]);
        url.query_pairs_mut()
            .append_pair("apiKey", &self.api_key)
            .append_pair("regions", &self.regions)
            .append_pair("markets", &self.markets)
            .append_pair("oddsFormat", "decimal");
        Ok(url)
    }
}

#[async_trait]
impl OddsFeed for TheOddsApi {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_snapshots(&self, observed_at: DateTime<Utc>) -> Result<Vec<OddsSnapshot>> {
        let url = self.odds_url()?;
        debug!("Fetching odds for {}", self.sport_key);

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Odds API request failed")?;

        let remaining = resp
            .headers()
            .get("x-requests-remaining")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("?")
            .to_string();
        if !resp.status().is_success() {
            anyhow::bail!("Odds API error for {}: {}", self.sport_key, resp.status());
        }

        let raw: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse Odds API response")?;

        let snapshots = parse_odds_response(&raw, &self.sport_key, observed_at);
        info!(
            "Odds API {}: {} snapshots (requests remaining: {})",
            self.sport_key,
            snapshots.len(),
            remaining
        );
        Ok(snapshots)
    }
}

/// Feed market key to internal market type
pub fn normalize_market(key: &str) -> String {
    match key {
        "h2h" => "moneyline".to_string(),
        "spreads" => "asian_handicap".to_string(),
        "totals" => "totals".to_string(),
        other => other.to_string(),
    }
}

/// Sport family of a feed sport key (`soccer_epl` -> `football`)
pub fn sport_from_key(sport_key: &str) -> String {
    let family = sport_key.split('_').next().unwrap_or(sport_key);
    match family {
        "soccer" => "football".to_string(),
        "" => "unknown".to_string(),
        other => other.to_string(),
    }
}

fn parse_odds_response(
    raw: &serde_json::Value,
    sport_key: &str,
    observed_at: DateTime<Utc>,
) -> Vec<OddsSnapshot> {
    let events = match raw.as_array() {
        Some(a) => a,
        None => return vec![],
    };
    let sport = sport_from_key(sport_key);

    let mut out = Vec::new();
    for ev in events {
        let Some(event_id) = ev["id"].as_str() else { continue };
        let Some(home_team) = ev["home_team"].as_str() else { continue };
        let Some(away_team) = ev["away_team"].as_str() else { continue };
        let Some(start_time) = ev["commence_time"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
        else {
            continue;
        };
        let league = ev["sport_key"].as_str().unwrap_or(sport_key);
        let league_name = ev["sport_title"].as_str().unwrap_or_default();

        let bookmakers = ev["bookmakers"].as_array().map(Vec::as_slice).unwrap_or(&[]);
        for bk in bookmakers {
            let Some(bookmaker) = bk["title"].as_str().or_else(|| bk["key"].as_str()) else {
                continue;
            };
            let markets = bk["markets"].as_array().map(Vec::as_slice).unwrap_or(&[]);
            for mkt in markets {
                let Some(market_key) = mkt["key"].as_str() else { continue };
                let market_type = normalize_market(market_key);
                let outcomes = mkt["outcomes"].as_array().map(Vec::as_slice).unwrap_or(&[]);
                for outcome in outcomes {
                    let Some(selection) = outcome["name"].as_str() else { continue };
                    let price = outcome["price"].as_f64().unwrap_or(0.0);
                    if !price.is_finite() || price <= 1.0 {
                        continue;
                    }
                    let line = if market_key == "h2h" {
                        None
                    } else {
                        outcome["point"].as_f64()
                    };
                    out.push(OddsSnapshot {
                        id: None,
                        event_id: event_id.to_string(),
                        sport: sport.clone(),
                        league: league.to_string(),
                        league_name: league_name.to_string(),
                        home_team: home_team.to_string(),
                        away_team: away_team.to_string(),
                        start_time,
                        market_type: market_type.clone(),
                        selection: selection.to_string(),
                        line,
                        bookmaker: bookmaker.to_string(),
                        price: (price * 1000.0).round() / 1000.0,
                        observed_at,
                    });
                }
            }
        }
    }
    out
}
