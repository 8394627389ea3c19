use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use sharpline::config::Config;
use sharpline::dashboard::{self, AppState};
use sharpline::db::Database;
use sharpline::engine::Engine;
use sharpline::lifecycle::reports::{generate_weekly_report, week_start_of};
use sharpline::market::{OddsFeed, TheOddsApi};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    let tuning = config.load_tuning()?;

    let db = Database::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path))?;
    info!("Database opened: {}", config.database_path);

    // One feed per sport key; ingestion stays off without an API key.
    let mut feeds: Vec<Arc<dyn OddsFeed>> = Vec::new();
    match config.odds_api_key.as_deref() {
        Some(key) => {
            for sport in config.odds_sports.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
                feeds.push(Arc::new(TheOddsApi::new(
                    key,
                    &config.odds_api_url,
                    sport,
                    &config.odds_regions,
                    &config.odds_markets,
                )?));
            }
        }
        None => warn!("ODDS_API_KEY not set; odds ingestion disabled"),
    }
    info!("Configured {} odds feed(s)", feeds.len());
    if config.admin_key.is_none() {
        warn!("ADMIN_KEY not set; admin endpoints will refuse every request");
    }

    let engine = Arc::new(Engine::new(db, tuning, feeds));

    // Odds ingestion
    if engine.feed_count() > 0 {
        let engine = Arc::clone(&engine);
        let every = Duration::from_secs(config.ingest_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                engine.run_ingestion_cycle(Utc::now()).await;
            }
        });
    }

    // Closing-line capture
    {
        let engine = Arc::clone(&engine);
        let every = Duration::from_secs(config.clv_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let e = Arc::clone(&engine);
                match tokio::task::spawn_blocking(move || e.capture_closing_lines(Utc::now())).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => error!("CLV sweep failed: {}", err),
                    Err(err) => error!("CLV sweep task aborted: {}", err),
                }
            }
        });
    }

    // Segment promotion, then last week's report if it is missing
    {
        let engine = Arc::clone(&engine);
        let every = Duration::from_secs(config.promotion_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let e = Arc::clone(&engine);
                let run = tokio::task::spawn_blocking(move || {
                    let now = Utc::now();
                    if let Err(err) = e.run_promotion_cycle(now) {
                        error!("Promotion cycle failed: {}", err);
                    }
                    let last_week = week_start_of(now.date_naive() - ChronoDuration::days(7));
                    match e.db().get_weekly_report(last_week) {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            if let Err(err) = generate_weekly_report(e.db(), Some(last_week), now) {
                                error!("Weekly report for {} failed: {}", last_week, err);
                            }
                        }
                        Err(err) => warn!("Could not check weekly report {}: {}", last_week, err),
                    }
                });
                if let Err(err) = run.await {
                    error!("Promotion task aborted: {}", err);
                }
            }
        });
    }

    let app = dashboard::router(AppState {
        engine,
        admin_key: config.admin_key.clone(),
    });
    let addr: SocketAddr = config
        .api_addr
        .parse()
        .with_context(|| format!("Invalid API_ADDR: {}", config.api_addr))?;
    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run API server (blocks until shutdown)
    axum::serve(listener, app).await?;

    Ok(())
}
