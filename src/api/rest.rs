// =============================================================================
// REST Control API — Axum 0.7
// =============================================================================
//
// All simulation control lives under `/api`. Validation happens at this
// boundary; anything that reaches the manager is already in range. Error
// responses share one body shape: `{success: false, error, details?}` with
// 400 for validation/invalid-state, 404 for unknown ids, 500 for internal
// failures.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::engine::manager::ManagerError;
use crate::engine::simulation::{ControlError, ExternalTradeRequest, ResetOptions};
use crate::engine::SimulationParameters;
use crate::types::{PriceRange, ScenarioType, TpsMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Simulation lifecycle ────────────────────────────────────
        .route("/api/simulation", post(create_simulation))
        .route("/api/simulations", get(list_simulations))
        .route("/api/simulation/:id", get(get_simulation))
        .route("/api/simulation/:id", delete(delete_simulation))
        .route("/api/simulation/:id/ready", get(simulation_ready))
        .route("/api/simulation/:id/start", post(start_simulation))
        .route("/api/simulation/:id/pause", post(pause_simulation))
        .route("/api/simulation/:id/reset", post(reset_simulation))
        .route("/api/simulation/:id/speed", post(set_speed))
        .route("/api/simulation/:id/tps-mode", get(get_tps_mode))
        .route("/api/simulation/:id/tps-mode", post(set_tps_mode))
        .route(
            "/api/simulation/:id/stress-test/liquidation-cascade",
            post(liquidation_cascade),
        )
        .route("/api/simulation/:id/external-trade", post(external_trade))
        // ── Observability ───────────────────────────────────────────
        .route("/api/health", get(health))
        .route("/api/metrics", get(metrics))
        .route("/api/object-pools/status", get(object_pools_status))
        // ── WebSocket event channel ─────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

struct ApiError {
    status: StatusCode,
    error: &'static str,
    details: serde_json::Value,
}

impl ApiError {
    fn validation(reasons: Vec<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "validation_error",
            details: json!(reasons),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.error,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::NotFound(id) => Self {
                status: StatusCode::NOT_FOUND,
                error: "not_found",
                details: json!(format!("unknown simulation {id}")),
            },
            ManagerError::CapacityExceeded(max) => Self {
                status: StatusCode::BAD_REQUEST,
                error: "capacity_exceeded",
                details: json!(format!("simulation capacity reached ({max})")),
            },
            ManagerError::Control(control) => match control {
                ControlError::Validation(reasons) => Self::validation(reasons),
                ControlError::InvalidState(msg) => Self {
                    status: StatusCode::BAD_REQUEST,
                    error: "invalid_state",
                    details: json!(msg),
                },
                ControlError::InvalidMode(msg) => Self {
                    status: StatusCode::BAD_REQUEST,
                    error: "invalid_mode",
                    details: json!(msg),
                },
                ControlError::Timeout => Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    error: "timeout",
                    details: json!("control operation timed out"),
                },
            },
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Simulation creation
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSimulationRequest {
    price_range: Option<String>,
    custom_price: Option<f64>,
    use_custom_price: Option<bool>,
    initial_price: Option<f64>,
    initial_liquidity: Option<f64>,
    duration: Option<u64>,
    volatility_factor: Option<f64>,
    time_compression_factor: Option<u32>,
    scenario_type: Option<String>,
}

impl CreateSimulationRequest {
    fn into_parameters(self) -> Result<SimulationParameters, Vec<String>> {
        let mut reasons = Vec::new();
        let defaults = SimulationParameters::default();

        let price_range = match self.price_range.as_deref() {
            None => None,
            Some(raw) => match PriceRange::parse(raw) {
                Some(range) => Some(range),
                None => {
                    reasons.push(format!("unknown priceRange '{raw}'"));
                    None
                }
            },
        };

        let scenario_type = match self.scenario_type.as_deref() {
            None => None,
            Some(raw) => match ScenarioType::parse(raw) {
                Some(scenario) => Some(scenario),
                None => {
                    reasons.push(format!("unknown scenarioType '{raw}'"));
                    None
                }
            },
        };

        if !reasons.is_empty() {
            return Err(reasons);
        }

        Ok(SimulationParameters {
            initial_price: self.initial_price.unwrap_or(defaults.initial_price),
            initial_liquidity: self
                .initial_liquidity
                .unwrap_or(defaults.initial_liquidity),
            volatility_factor: self
                .volatility_factor
                .unwrap_or(defaults.volatility_factor),
            duration: self.duration.unwrap_or(defaults.duration),
            time_compression_factor: self
                .time_compression_factor
                .unwrap_or(defaults.time_compression_factor),
            scenario_type,
            price_range,
            custom_price: self.custom_price,
            use_custom_price: self.use_custom_price.unwrap_or(false),
        })
    }
}

async fn create_simulation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSimulationRequest>,
) -> ApiResult<Response> {
    let params = request.into_parameters().map_err(ApiError::validation)?;
    let snapshot = state.manager.create(params).map_err(ApiError::from)?;
    info!(simulation_id = %snapshot.id, "simulation created via API");

    let body = json!({
        "success": true,
        "simulationId": snapshot.id,
        "data": snapshot,
    });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

// =============================================================================
// Queries
// =============================================================================

async fn list_simulations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list())
}

async fn get_simulation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.manager.snapshot(&id).map_err(ApiError::from)?;
    Ok(Json(snapshot))
}

async fn simulation_ready(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let ready = state.manager.ready(&id).map_err(ApiError::from)?;
    Ok(Json(ready))
}

// =============================================================================
// Lifecycle control
// =============================================================================

async fn start_simulation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.manager.start(&id).await.map_err(ApiError::from)?;
    Ok(Json(json!({ "success": true, "data": snapshot })))
}

async fn pause_simulation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.manager.pause(&id).map_err(ApiError::from)?;
    Ok(Json(json!({ "success": true, "data": snapshot })))
}

async fn reset_simulation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ResetOptions>>,
) -> ApiResult<impl IntoResponse> {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    let snapshot = state
        .manager
        .reset(&id, &options)
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "success": true, "data": snapshot })))
}

async fn delete_simulation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.manager.delete(&id).map_err(ApiError::from)?;
    Ok(Json(json!({ "success": true })))
}

// =============================================================================
// Speed / TPS mode
// =============================================================================

#[derive(Debug, Deserialize)]
struct SpeedRequest {
    speed: u32,
}

async fn set_speed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SpeedRequest>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state
        .manager
        .set_speed(&id, request.speed)
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "success": true,
        "speed": request.speed,
        "data": snapshot,
    })))
}

#[derive(Debug, Deserialize)]
struct TpsModeRequest {
    mode: String,
}

async fn get_tps_mode(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let mode = state.manager.tps_mode(&id).map_err(ApiError::from)?;
    Ok(Json(json!({
        "success": true,
        "mode": mode.to_string(),
        "targetTps": mode.target_tps(),
        "multiplier": mode.multiplier(),
    })))
}

async fn set_tps_mode(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TpsModeRequest>,
) -> ApiResult<impl IntoResponse> {
    let mode = TpsMode::parse(&request.mode).ok_or_else(|| {
        ApiError::validation(vec![format!(
            "unknown TPS mode '{}' (expected NORMAL, BURST, STRESS, or HFT)",
            request.mode
        )])
    })?;
    let mode = state.manager.set_tps_mode(&id, mode).map_err(ApiError::from)?;
    Ok(Json(json!({
        "success": true,
        "mode": mode.to_string(),
        "targetTps": mode.target_tps(),
    })))
}

// =============================================================================
// Stress tooling / external flow
// =============================================================================

async fn liquidation_cascade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .manager
        .liquidation_cascade(&id)
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "success": true, "data": outcome })))
}

async fn external_trade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ExternalTradeRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .manager
        .external_trade(&id, &request)
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "success": true,
        "trade": outcome.trade,
        "newPrice": outcome.new_price,
        "impact": outcome.impact,
    })))
}

// =============================================================================
// Observability
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_snapshot())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics_snapshot())
}

async fn object_pools_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pools_snapshot())
}
