// =============================================================================
// REST API Endpoints — Axum 0.7 (spec.md §6)
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health, the state snapshot, and the
// symbol catalog are public reads. `place_trade` and the per-user lookups
// take the user id as an explicit parameter — user authentication/KYC is out
// of scope (spec.md §1), so there is no separate per-user credential on this
// surface, only the admin `AuthBearer` gate on the control-plane routes.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::AuthBearer;
use crate::error::CoreError;
use crate::types::{AccountKind, ActivityLogEntry, SymbolConfig};
use crate::CoreState;

use super::protocol::{PlaceTradeRequest, PlaceTradeResponse};

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: CoreState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/symbols", get(list_symbols))
        // ── Trading & account (user id passed explicitly) ───────────
        .route("/api/v1/trade", post(place_trade))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/wallet", get(wallet))
        // ── Admin: symbol config CRUD ────────────────────────────────
        .route("/api/v1/symbols/:symbol", put(upsert_symbol))
        // ── Admin: control plane ─────────────────────────────────────
        .route("/api/v1/admin/direction-bias", post(set_direction_bias))
        .route("/api/v1/admin/direction-bias/clear", post(clear_direction_bias))
        .route("/api/v1/admin/volatility", post(set_volatility))
        .route("/api/v1/admin/volatility/clear", post(clear_volatility))
        .route("/api/v1/admin/price-override", post(set_price_override))
        .route("/api/v1/admin/price-override/clear", post(clear_price_override))
        .route("/api/v1/admin/user-target", post(set_user_target))
        .route("/api/v1/admin/user-target/clear", post(clear_user_target))
        .route("/api/v1/admin/force-outcome", post(force_trade_outcome))
        .route("/api/v1/admin/reset-exposure", post(reset_exposure))
        .route("/api/v1/admin/activity", get(activity_log))
        // ── WebSocket (mounted here, handled in ws.rs) ───────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn core_error_response(err: CoreError) -> Response {
    let status = err.status_code();
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

async fn activity_entry_response(state: &CoreState, entry: ActivityLogEntry) -> Response {
    let id = entry.id;
    state.log_activity(entry).await;
    (StatusCode::OK, Json(serde_json::json!({ "activity_log_id": id }))).into_response()
}

// =============================================================================
// Health / state / symbols (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    uptime_seconds: u64,
    server_time: i64,
}

async fn health(State(state): State<CoreState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(State(state): State<CoreState>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn list_symbols(State(state): State<CoreState>) -> impl IntoResponse {
    Json(state.all_symbol_configs())
}

// =============================================================================
// Trading & account
// =============================================================================

async fn place_trade(State(state): State<CoreState>, Json(req): Json<PlaceTradeRequest>) -> Response {
    if req.duration_secs <= 0 {
        return core_error_response(CoreError::validation("duration_secs must be positive"));
    }
    let result = state
        .place_trade(
            &req.user_id,
            &req.symbol,
            req.direction,
            req.stake,
            chrono::Duration::seconds(req.duration_secs),
            req.account_kind,
        )
        .await;

    match result {
        Ok(position) => Json(PlaceTradeResponse {
            position_id: position.id,
            entry_price: position.entry_price,
            expires_at: position.expires_at,
        })
        .into_response(),
        Err(err) => core_error_response(err),
    }
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

async fn positions(State(state): State<CoreState>, Query(q): Query<UserQuery>) -> impl IntoResponse {
    Json(state.positions.open_positions_for_user(&q.user_id))
}

#[derive(Deserialize)]
struct WalletQuery {
    user_id: String,
    #[serde(default)]
    account_kind: Option<AccountKind>,
}

async fn wallet(State(state): State<CoreState>, Query(q): Query<WalletQuery>) -> impl IntoResponse {
    let account_kind = q.account_kind.unwrap_or(AccountKind::Real);
    let balance = state.wallet.balance(&q.user_id, account_kind);
    Json(serde_json::json!({ "user_id": q.user_id, "account_kind": account_kind, "balance": balance }))
}

// =============================================================================
// Admin: symbol config CRUD
// =============================================================================

async fn upsert_symbol(
    _auth: AuthBearer,
    State(state): State<CoreState>,
    Path(symbol): Path<String>,
    Json(mut cfg): Json<SymbolConfig>,
) -> Response {
    cfg.symbol = symbol;
    if let Err(msg) = cfg.validate() {
        return core_error_response(CoreError::validation(msg));
    }
    if let Err(err) = state.persistence.upsert_symbol_config(&cfg).await {
        return core_error_response(err);
    }
    let symbol_name = cfg.symbol.clone();
    state.register_symbol(cfg);
    activity_entry_response(
        &state,
        ActivityLogEntry::new("symbol_config", format!("symbol config upserted for {symbol_name}"), None),
    )
    .await
}

// =============================================================================
// Admin: control plane (each mutator logs an activity entry and returns its id)
// =============================================================================

#[derive(Deserialize)]
struct DirectionBiasRequest {
    symbol: String,
    /// Wire units are [-100, +100]; internally stored as [-1, 1].
    bias: f64,
    strength: f64,
    #[serde(default)]
    duration_secs: Option<i64>,
}

async fn set_direction_bias(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<DirectionBiasRequest>) -> Response {
    let now = chrono::Utc::now();
    let duration = req.duration_secs.map(chrono::Duration::seconds);
    state.admin.set_direction_bias(&req.symbol, req.bias / 100.0, req.strength, duration, now);
    activity_entry_response(
        &state,
        ActivityLogEntry::new("admin", format!("direction bias set on {} to {}", req.symbol, req.bias), None)
            .with_metadata(serde_json::json!({ "symbol": req.symbol, "bias": req.bias, "strength": req.strength })),
    )
    .await
}

#[derive(Deserialize)]
struct SymbolOnly {
    symbol: String,
}

async fn clear_direction_bias(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<SymbolOnly>) -> Response {
    state.admin.clear_direction_bias(&req.symbol);
    activity_entry_response(&state, ActivityLogEntry::new("admin", format!("direction bias cleared on {}", req.symbol), None)).await
}

#[derive(Deserialize)]
struct VolatilityRequest {
    symbol: String,
    multiplier: f64,
    #[serde(default)]
    duration_secs: Option<i64>,
}

async fn set_volatility(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<VolatilityRequest>) -> Response {
    let now = chrono::Utc::now();
    let duration = req.duration_secs.map(chrono::Duration::seconds);
    state.admin.set_volatility(&req.symbol, req.multiplier, duration, now);
    activity_entry_response(
        &state,
        ActivityLogEntry::new("admin", format!("volatility override set on {} to {}x", req.symbol, req.multiplier), None),
    )
    .await
}

async fn clear_volatility(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<SymbolOnly>) -> Response {
    state.admin.clear_volatility(&req.symbol);
    activity_entry_response(&state, ActivityLogEntry::new("admin", format!("volatility override cleared on {}", req.symbol), None)).await
}

#[derive(Deserialize)]
struct PriceOverrideRequest {
    symbol: String,
    price: f64,
    duration_secs: i64,
}

async fn set_price_override(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<PriceOverrideRequest>) -> Response {
    if req.price <= 0.0 || req.duration_secs <= 0 {
        return core_error_response(CoreError::validation("price and duration_secs must be positive"));
    }
    let now = chrono::Utc::now();
    state.admin.set_price_override(&req.symbol, req.price, chrono::Duration::seconds(req.duration_secs), now);
    activity_entry_response(
        &state,
        ActivityLogEntry::new("admin", format!("price override set on {} to {}", req.symbol, req.price), None),
    )
    .await
}

async fn clear_price_override(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<SymbolOnly>) -> Response {
    state.admin.clear_price_override(&req.symbol);
    activity_entry_response(&state, ActivityLogEntry::new("admin", format!("price override cleared on {}", req.symbol), None)).await
}

#[derive(Deserialize)]
struct UserTargetRequest {
    user: String,
    #[serde(default)]
    target_win_rate: Option<f64>,
    #[serde(default)]
    force_next_wins: Option<u32>,
    #[serde(default)]
    force_next_losses: Option<u32>,
}

async fn set_user_target(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<UserTargetRequest>) -> Response {
    state.admin.set_user_target(&req.user, req.target_win_rate, req.force_next_wins, req.force_next_losses);
    activity_entry_response(&state, ActivityLogEntry::new("admin", format!("user target updated for {}", req.user), Some(req.user.clone()))).await
}

async fn clear_user_target(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<UserOnly>) -> Response {
    state.admin.clear_user_target(&req.user);
    activity_entry_response(&state, ActivityLogEntry::new("admin", format!("user target cleared for {}", req.user), Some(req.user.clone()))).await
}

#[derive(Deserialize)]
struct UserOnly {
    user: String,
}

#[derive(Deserialize)]
struct ForceOutcomeRequest {
    position_id: uuid::Uuid,
    outcome: ForceOutcome,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
enum ForceOutcome {
    Win,
    Lose,
}

/// Spec.md §4.G defines `force_trade_outcome` as scoped to a single
/// position. The admin control plane's forced-outcome counters are scoped
/// to a user (one-shot, decrementing) rather than a position id; this
/// handler bridges the two by arming exactly one forced win/loss for the
/// position's owning user, after confirming the position is still OPEN.
async fn force_trade_outcome(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<ForceOutcomeRequest>) -> Response {
    let Some(position) = state.positions.get(req.position_id) else {
        return core_error_response(CoreError::validation(format!("unknown position {}", req.position_id)));
    };
    if position.status != crate::positions::PositionStatus::Open {
        return core_error_response(CoreError::validation("force_trade_outcome requires an OPEN position"));
    }
    match req.outcome {
        ForceOutcome::Win => state.admin.set_user_target(&position.user_id, None, Some(1), None),
        ForceOutcome::Lose => state.admin.set_user_target(&position.user_id, None, None, Some(1)),
    }
    let outcome_str = match req.outcome {
        ForceOutcome::Win => "WIN",
        ForceOutcome::Lose => "LOSE",
    };
    activity_entry_response(
        &state,
        ActivityLogEntry::new("admin", format!("forced outcome {outcome_str} armed for position {}", req.position_id), Some(position.user_id))
            .with_metadata(serde_json::json!({ "position_id": req.position_id, "outcome": outcome_str })),
    )
    .await
}

async fn reset_exposure(_auth: AuthBearer, State(state): State<CoreState>, Json(req): Json<SymbolOnly>) -> Response {
    state.exposure.reset(&req.symbol);
    warn!(symbol = %req.symbol, "exposure manually reset by admin");
    activity_entry_response(&state, ActivityLogEntry::new("admin", format!("exposure reset on {}", req.symbol), None)).await
}

#[derive(Deserialize)]
struct ActivityQuery {
    #[serde(default = "default_activity_limit")]
    limit: usize,
}

fn default_activity_limit() -> usize {
    50
}

async fn activity_log(_auth: AuthBearer, State(state): State<CoreState>, Query(q): Query<ActivityQuery>) -> impl IntoResponse {
    Json(state.recent_activity(q.limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_outcome_deserializes_uppercase() {
        let req: ForceOutcomeRequest = serde_json::from_str(
            r#"{"position_id":"00000000-0000-0000-0000-000000000000","outcome":"WIN"}"#,
        )
        .unwrap();
        assert!(matches!(req.outcome, ForceOutcome::Win));
    }
}
