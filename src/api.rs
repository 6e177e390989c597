use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::identity::{IdentityError, IdentityProvider, SessionStore};
use crate::model::*;
use crate::payment::PaymentGateway;

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub sessions: Arc<SessionStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub gateway: Arc<dyn PaymentGateway>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/session", post(auth_session))
        .route("/api/auth/me", get(auth_me))
        .route("/api/auth/logout", post(auth_logout))
        .route("/api/profile", get(auth_me).patch(update_profile))
        .route("/api/shared-spaces", get(shared_spaces).post(create_shared_space))
        .route("/api/spots", get(list_spots))
        .route("/api/spots/:id", get(get_spot))
        .route("/api/bookings", post(create_booking).get(list_bookings))
        .route("/api/bookings/:id/cancel", post(cancel_booking))
        .route("/api/bookings/:id/close", post(close_booking))
        .route("/api/payments/create-order", post(create_order))
        .route("/api/payments/verify", post(verify_payment))
        .route("/api/rewards/me", get(rewards_me))
        .route("/api/rewards/leaderboard", get(leaderboard))
        .route("/api/predict-availability", post(predict))
        .route("/api/history", get(history))
        .route("/api/wallet", get(wallet))
        .route("/api/simulate-iot", post(simulate_iot))
        .route("/api/seed-data", post(seed_data))
        .layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

async fn track_metrics(matched: Option<MatchedPath>, req: Request, next: Next) -> Response {
    let route = matched
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let start = Instant::now();
    let response = next.run(req).await;
    metrics::counter!(
        crate::observability::REQUESTS_TOTAL,
        "route" => route.clone(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

// ── Error mapping ────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "not authenticated")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
            EngineError::PaymentVerificationFailed(_) => StatusCode::PAYMENT_REQUIRED,
            EngineError::Unauthorized(_) => StatusCode::FORBIDDEN,
            EngineError::WalError(_) | EngineError::Internal(_) => {
                tracing::error!("internal error: {e}");
                return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::InvalidSession => ApiError::new(StatusCode::UNAUTHORIZED, "invalid session"),
            IdentityError::Unavailable(reason) => {
                tracing::error!("identity provider unavailable: {reason}");
                ApiError::new(StatusCode::BAD_GATEWAY, "identity provider unavailable")
            }
        }
    }
}

// ── Auth plumbing ────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn current_user(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = bearer_token(headers).ok_or_else(ApiError::unauthenticated)?;
    let user_id = state
        .sessions
        .resolve(token, now_ms())
        .ok_or_else(ApiError::unauthenticated)?;
    state
        .engine
        .user(&user_id)
        .ok_or_else(ApiError::unauthenticated)
}

fn parse_id(raw: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw).map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "malformed id"))
}

async fn auth_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing session id"))?;

    let profile = state.identity.resolve(session_id).await?;
    let user = state
        .engine
        .ensure_user(&profile.email, &profile.name, profile.picture)
        .await?;
    let token = state.sessions.mint(user.id, now_ms());
    Ok(Json(json!({ "user": user, "session_token": token })))
}

async fn auth_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<User>, ApiError> {
    Ok(Json(current_user(&state, &headers)?))
}

async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    if let Some(token) = bearer_token(&headers) {
        state.sessions.revoke(token);
    }
    Json(json!({ "message": "logged out" }))
}

#[derive(Deserialize)]
struct ProfileUpdateReq {
    name: Option<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProfileUpdateReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &headers)?;
    if let Some(name) = req.name {
        state.engine.update_profile(user.id, name).await?;
    }
    Ok(Json(json!({ "success": true })))
}

// ── Spots ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SpotFilter {
    status: Option<SpotStatus>,
    ev_charging: Option<bool>,
}

async fn list_spots(
    State(state): State<AppState>,
    Query(filter): Query<SpotFilter>,
) -> Json<Vec<SpotView>> {
    Json(state.engine.list_spots(filter.status, filter.ev_charging).await)
}

async fn get_spot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SpotView>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.get_spot(&id).await?))
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateBookingReq {
    spot_id: Ulid,
    duration_hours: f64,
    #[serde(default)]
    ev_charging: bool,
}

async fn create_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateBookingReq>,
) -> Result<Json<Booking>, ApiError> {
    let user = current_user(&state, &headers)?;
    let booking = state
        .engine
        .create_booking(user.id, req.spot_id, req.duration_hours, req.ev_charging)
        .await?;
    Ok(Json(booking))
}

async fn list_bookings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Booking>>, ApiError> {
    let user = current_user(&state, &headers)?;
    Ok(Json(state.engine.bookings_for(user.id).await))
}

async fn cancel_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Booking>, ApiError> {
    let user = current_user(&state, &headers)?;
    let id = parse_id(&id)?;
    Ok(Json(state.engine.cancel_booking(id, user.id).await?))
}

async fn close_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Booking>, ApiError> {
    let user = current_user(&state, &headers)?;
    let id = parse_id(&id)?;
    Ok(Json(state.engine.close_booking(id, user.id).await?))
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateOrderReq {
    booking_id: Ulid,
}

async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderReq>,
) -> Result<Json<crate::engine::OrderView>, ApiError> {
    let user = current_user(&state, &headers)?;
    let order = state
        .engine
        .create_order(req.booking_id, user.id, state.gateway.as_ref())
        .await?;
    Ok(Json(order))
}

#[derive(Deserialize)]
struct VerifyReq {
    booking_id: Ulid,
    razorpay_order_id: String,
    razorpay_payment_id: String,
}

async fn verify_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &headers)?;
    let grant = state
        .engine
        .verify_payment(
            req.booking_id,
            user.id,
            &req.razorpay_order_id,
            &req.razorpay_payment_id,
            state.gateway.as_ref(),
        )
        .await?;
    Ok(Json(json!({
        "success": true,
        "points_earned": grant.points_earned,
        "carbon_saved": grant.carbon_saved,
    })))
}

// ── Rewards ──────────────────────────────────────────────────────

async fn rewards_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<crate::engine::RewardView>, ApiError> {
    let user = current_user(&state, &headers)?;
    Ok(Json(state.engine.rewards_of(user.id).await))
}

#[derive(Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

async fn leaderboard(
    State(state): State<AppState>,
    Query(q): Query<LeaderboardQuery>,
) -> Json<Vec<crate::engine::LeaderboardEntry>> {
    Json(state.engine.leaderboard(q.limit.unwrap_or(10).min(100)).await)
}

// ── Prediction ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct PredictReq {
    destination: String,
    arrival_time: Option<Ms>,
    duration: Option<f64>,
}

async fn predict(
    State(state): State<AppState>,
    Json(req): Json<PredictReq>,
) -> Json<crate::engine::PredictionResult> {
    let arrival = req.arrival_time.unwrap_or_else(now_ms);
    Json(state.engine.predict(&req.destination, arrival, req.duration.unwrap_or(1.0)))
}

// ── Read views ───────────────────────────────────────────────────

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let user = current_user(&state, &headers)?;
    let mut out = Vec::new();
    for booking in state.engine.bookings_for(user.id).await {
        let spot = state.engine.get_spot(&booking.spot_id).await.ok();
        let transaction = state.engine.transaction_for(&booking.id);
        out.push(json!({
            "booking": booking,
            "spot": spot,
            "transaction": transaction,
        }));
    }
    Ok(Json(out))
}

async fn wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = current_user(&state, &headers)?;
    let rewards = state.engine.rewards_of(user.id).await;
    let transactions = state.engine.transactions_for(user.id);
    Ok(Json(json!({
        "balance": rewards.points as f64 * crate::limits::BALANCE_PER_POINT,
        "points": rewards.points,
        "transactions": transactions,
    })))
}

// ── Shared spaces ────────────────────────────────────────────────

async fn shared_spaces(State(state): State<AppState>) -> Json<Vec<SharedSpace>> {
    Json(state.engine.list_shared_spaces())
}

#[derive(Deserialize)]
struct SharedSpaceReq {
    name: String,
    location: String,
    rate_per_hour: f64,
    slot_type: String,
}

async fn create_shared_space(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SharedSpaceReq>,
) -> Result<Json<SharedSpace>, ApiError> {
    let user = current_user(&state, &headers)?;
    let space = state
        .engine
        .create_shared_space(user.id, req.name, req.location, req.rate_per_hour, req.slot_type)
        .await?;
    Ok(Json(space))
}

// ── External collaborators ───────────────────────────────────────

async fn simulate_iot(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let ingested = state.engine.simulate_sensor_sweep().await?;
    Ok(Json(json!({ "message": "sensor sweep ingested", "events": ingested })))
}

#[derive(Deserialize)]
struct SeedReq {
    count: Option<usize>,
}

async fn seed_data(
    State(state): State<AppState>,
    body: Option<Json<SeedReq>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = body.and_then(|Json(req)| req.count).unwrap_or(20).min(1000);
    let spots = state.engine.seed_spots(count).await?;
    Ok(Json(json!({
        "message": "seeded",
        "spots_created": spots.len(),
    })))
}
