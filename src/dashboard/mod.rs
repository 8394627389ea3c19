//! JSON API over the pipeline. Read endpoints are open; `/api/admin/*`
//! requires the configured key in the `x-admin-key` header.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::db::bets::BetQuery;
use crate::db::models::{BetStatus, GatingStatus, ModelProbability, Segment, Settlement};
use crate::engine::Engine;
use crate::error::PipelineError;
use crate::gating;
use crate::lifecycle::{self, reports};

type ApiError = (StatusCode, String);

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub admin_key: Option<String>,
}

/// Build the Axum router for the JSON API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/bets", get(bets_handler))
        .route("/api/bets/:id/history", get(bet_history_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/weekly-report", get(weekly_report_handler))
        .route("/api/weekly-reports", get(weekly_reports_handler))
        .route("/api/market-state/:event_id", get(market_state_handler))
        .route("/api/odds-history/:event_id", get(odds_history_handler))
        .route("/api/upcoming", get(upcoming_handler))
        .route("/api/clv", get(clv_handler))
        .route("/api/timing", get(timing_handler))
        .route("/api/discovery", get(discovery_handler))
        .route("/api/eligibility", get(eligibility_handler))
        .route("/api/admin/gating/override", post(override_handler))
        .route("/api/admin/gating/release", post(release_handler))
        .route("/api/admin/bets/:id/transition", post(transition_handler))
        .route("/api/admin/settle", post(settle_handler))
        .route("/api/admin/model-probabilities", post(model_probabilities_handler))
        .route("/api/admin/promotion/run", post(promotion_handler))
        .route("/api/admin/ingest", post(ingest_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Status code for a pipeline failure. Rejections are the caller's problem.
fn api_error(e: PipelineError) -> ApiError {
    let status = match &e {
        PipelineError::BetNotFound(_) | PipelineError::UnknownEvent(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidSnapshot(_) | PipelineError::MissingReason => StatusCode::BAD_REQUEST,
        PipelineError::DuplicateCandidate(_)
        | PipelineError::DailyCapReached { .. }
        | PipelineError::IllegalTransition { .. }
        | PipelineError::SegmentDisabled(_)
        | PipelineError::NotPublishable(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Run a storage-bound pipeline step on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task aborted: {e}")))?
        .map_err(api_error)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let supplied = headers.get("x-admin-key").and_then(|v| v.to_str().ok());
    match (state.admin_key.as_deref(), supplied) {
        (Some(expected), Some(got)) if expected == got => Ok(()),
        _ => {
            warn!("Rejected admin request without a valid key");
            Err((StatusCode::FORBIDDEN, "Forbidden".to_string()))
        }
    }
}

/// GET /api/health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "feeds": state.engine.feed_count(),
        "time": Utc::now(),
    }))
}

/// GET /api/bets?status=&gating=&sport=&market=&league=&min_ev=&min_confidence=&show_learning=&sort=&limit=&offset=
async fn bets_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (bets, total) = lifecycle::query_bets(state.engine.db(), &q).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "bets": bets, "total": total })))
}

/// GET /api/bets/:id/history
async fn bet_history_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let history = lifecycle::bet_history(state.engine.db(), id).map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "bet_id": id,
        "status": lifecycle::replay_status(&history),
        "history": history,
    })))
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    sport: Option<String>,
    days: Option<i64>,
}

/// GET /api/stats?sport=&days=7
async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    reports::rolling_stats(state.engine.db(), q.sport.as_deref(), q.days.unwrap_or(7), Utc::now())
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct WeeklyQuery {
    week_start: Option<NaiveDate>,
}

/// GET /api/weekly-report?week_start=YYYY-MM-DD
async fn weekly_report_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WeeklyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.engine.db();
    if let Some(day) = q.week_start {
        if let Some(stored) = db.get_weekly_report(reports::week_start_of(day)).map_err(api_error)? {
            return Ok(Json(stored));
        }
    }
    reports::generate_weekly_report(db, q.week_start, Utc::now())
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

/// GET /api/weekly-reports?limit=12
async fn weekly_reports_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .db()
        .list_weekly_reports(q.limit.unwrap_or(12).clamp(1, 104))
        .map(Json)
        .map_err(api_error)
}

/// GET /api/market-state/:event_id
async fn market_state_handler(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.engine.db();
    let event = db
        .event_summary(&event_id)
        .map_err(api_error)?
        .ok_or_else(|| api_error(PipelineError::UnknownEvent(event_id.clone())))?;
    let states = db.get_market_states(&event_id).map_err(api_error)?;
    let fair_odds = db.get_fair_odds(&event_id).map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "event": event,
        "states": states,
        "fair_odds": fair_odds,
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    market: Option<String>,
    selection: Option<String>,
}

/// GET /api/odds-history/:event_id?market=&selection=
async fn odds_history_handler(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .db()
        .odds_history(&event_id, q.market.as_deref(), q.selection.as_deref())
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct UpcomingQuery {
    hours: Option<i64>,
}

/// GET /api/upcoming?hours=48
async fn upcoming_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UpcomingQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .db()
        .upcoming_events(Utc::now(), q.hours.unwrap_or(48).clamp(1, 24 * 14))
        .map(Json)
        .map_err(api_error)
}

/// GET /api/clv?sport=&days=
async fn clv_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let from = q.days.map(|d| Utc::now() - Duration::days(d.max(1)));
    let bets = state
        .engine
        .db()
        .settled_bets(q.sport.as_deref(), from, None)
        .map_err(api_error)?;
    Ok(Json(reports::clv_analytics(&bets)))
}

/// GET /api/timing?sport=&days=
async fn timing_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let from = q.days.map(|d| Utc::now() - Duration::days(d.max(1)));
    let bets = state
        .engine
        .db()
        .settled_bets(q.sport.as_deref(), from, None)
        .map_err(api_error)?;
    Ok(Json(reports::timing_analytics(&bets)))
}

#[derive(Debug, Deserialize)]
struct DiscoveryQuery {
    sport: Option<String>,
    min_bets: Option<i64>,
}

/// GET /api/discovery?sport=&min_bets=
async fn discovery_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DiscoveryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let t = &state.engine.tuning().gating;
    gating::discovery(
        state.engine.db(),
        q.sport.as_deref(),
        q.min_bets.unwrap_or(t.min_segment_bets),
        t,
        Utc::now(),
    )
    .map(Json)
    .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct SportQuery {
    sport: Option<String>,
}

/// GET /api/eligibility?sport=
async fn eligibility_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SportQuery>,
) -> Result<impl IntoResponse, ApiError> {
    gating::eligibility_view(
        state.engine.db(),
        q.sport.as_deref(),
        &state.engine.tuning().gating,
        Utc::now(),
    )
    .map(Json)
    .map_err(api_error)
}

// ── Admin ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    sport: String,
    league: String,
    market_type: String,
    status: GatingStatus,
    #[serde(default)]
    reason: String,
}

/// POST /api/admin/gating/override
async fn override_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OverrideRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let segment = Segment::new(&req.sport, &req.league, &req.market_type);
    gating::override_segment(state.engine.db(), &segment, req.status, &req.reason, Utc::now())
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct ReleaseRequest {
    sport: String,
    league: String,
    market_type: String,
}

/// POST /api/admin/gating/release
async fn release_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReleaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let segment = Segment::new(&req.sport, &req.league, &req.market_type);
    let released = gating::release_override(state.engine.db(), &segment, Utc::now()).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "segment": segment, "released": released })))
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    status: BetStatus,
    #[serde(default)]
    details: serde_json::Value,
    source: Option<String>,
}

/// POST /api/admin/bets/:id/transition
async fn transition_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let details = if req.details.is_null() {
        serde_json::json!({})
    } else {
        req.details
    };
    state
        .engine
        .transition(id, req.status, &details, req.source.as_deref().unwrap_or("api"), Utc::now())
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct SettleRequest {
    bet_id: i64,
    #[serde(flatten)]
    settlement: Settlement,
}

/// POST /api/admin/settle
async fn settle_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SettleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state
        .engine
        .settle(req.bet_id, &req.settlement, Utc::now())
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
struct ModelProbabilitiesRequest {
    event_id: String,
    probabilities: Vec<ModelProbability>,
}

/// POST /api/admin/model-probabilities
async fn model_probabilities_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ModelProbabilitiesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let engine = Arc::clone(&state.engine);
    blocking(move || engine.evaluate_event(&req.event_id, &req.probabilities, Utc::now()))
        .await
        .map(Json)
}

/// POST /api/admin/promotion/run
async fn promotion_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let engine = Arc::clone(&state.engine);
    blocking(move || engine.run_promotion_cycle(Utc::now()))
        .await
        .map(Json)
}

/// POST /api/admin/ingest
async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.run_ingestion_cycle(Utc::now()).await))
}
