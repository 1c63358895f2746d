//! REST API for ReserveL
//!
//! Business dashboard endpoints, the customer confirmation link endpoints and
//! the settlement actions, all mounted under `/api`.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, Request, State,
    },
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::economics::{format_base_units, TOKEN_DECIMALS};
use crate::error::ReservationError;
use crate::persistence::ListFilter;
use crate::reservation::{
    AttendanceStatus, ConfirmationStatus, NewReservation, Reservation, ReservationStatus,
    ReservationUpdate,
};
use crate::service::{Outcome, ReservationService};
use crate::transitions::CustomerAction;

/// Spent amount assumed when a loyalty request does not name one.
const DEFAULT_LOYALTY_SPEND: u64 = 100;

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub service: ReservationService,
    api_stats: Arc<RwLock<ApiStats>>,
}

/// API statistics and monitoring
#[derive(Debug, Default)]
struct ApiStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    reservations_created: u64,
    transitions_applied: u64,
    settlement_calls: u64,
    start_time: Option<Instant>,
}

impl ApiStats {
    fn new() -> Self {
        ApiStats {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn record_request(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }
}

impl AppState {
    pub fn new(service: ReservationService) -> Self {
        Self {
            service,
            api_stats: Arc::new(RwLock::new(ApiStats::new())),
        }
    }

    pub async fn get_stats(&self) -> ApiStatsResponse {
        let stats = self.api_stats.read().await;
        let uptime = stats.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0);

        ApiStatsResponse {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            reservations_created: stats.reservations_created,
            transitions_applied: stats.transitions_applied,
            settlement_calls: stats.settlement_calls,
            uptime_seconds: uptime,
            settlement: self.service.settlement_backend().unwrap_or("disabled"),
        }
    }

    async fn count_created(&self) {
        self.api_stats.write().await.reservations_created += 1;
    }

    async fn count_transition(&self) {
        self.api_stats.write().await.transitions_applied += 1;
    }

    async fn count_settlement_call(&self) {
        self.api_stats.write().await.settlement_calls += 1;
    }
}

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Reservation(ReservationError),
    InvalidInput(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Reservation(e) => {
                let status = match &e {
                    ReservationError::NotFound(_) => StatusCode::NOT_FOUND,
                    ReservationError::InvalidInput(_) | ReservationError::Crypto(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    ReservationError::InvalidTransition(_) | ReservationError::Conflict(_) => {
                        StatusCode::CONFLICT
                    }
                    ReservationError::SettlementDisabled => StatusCode::SERVICE_UNAVAILABLE,
                    ReservationError::Settlement(_) => StatusCode::BAD_GATEWAY,
                    ReservationError::Database(_)
                    | ReservationError::Config(_)
                    | ReservationError::Io(_) => {
                        tracing::error!(error = %e, "api.internal_error");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, client_message(e))
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Transition errors carry their own wording; everything else keeps the
/// error's display form.
fn client_message(err: ReservationError) -> String {
    match err {
        ReservationError::InvalidTransition(msg) | ReservationError::InvalidInput(msg) => msg,
        ReservationError::NotFound(_) => "Reservation not found".to_string(),
        other => other.to_string(),
    }
}

impl From<ReservationError> for ApiError {
    fn from(err: ReservationError) -> Self {
        ApiError::Reservation(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
pub struct ApiStatsResponse {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub reservations_created: u64,
    pub transitions_applied: u64,
    pub settlement_calls: u64,
    pub uptime_seconds: u64,
    pub settlement: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransitionResponse {
    message: String,
    reservation: Reservation,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    settlement_error: Option<String>,
}

impl TransitionResponse {
    fn new(message: impl Into<String>, reservation: Reservation) -> Self {
        Self {
            message: message.into(),
            reservation,
            transaction_hash: None,
            settlement_error: None,
        }
    }

    fn from_outcome(message: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            message: message.into(),
            reservation: outcome.reservation,
            transaction_hash: outcome.receipt.map(|r| r.hash),
            settlement_error: outcome.settlement_error,
        }
    }
}

#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

/// `GET /reservations` query: either a single `id` or a filtered page.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    id: Option<String>,
    confirmation_status: Option<ConfirmationStatus>,
    status: Option<ReservationStatus>,
    date: Option<NaiveDate>,
    page: Option<u64>,
    limit: Option<u64>,
}

impl ListQuery {
    fn filter(&self) -> ListFilter {
        ListFilter {
            confirmation_status: self.confirmation_status,
            status: self.status,
            date: self.date,
            page: self.page.unwrap_or(0),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: Option<String>,
}

impl IdQuery {
    fn require(self) -> Result<String, ApiError> {
        self.id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::InvalidInput("Reservation id is required".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservationIdRequest {
    reservation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceRequest {
    reservation_id: String,
    attendance_status: AttendanceStatus,
}

#[derive(Debug, Deserialize)]
struct CustomerActionRequest {
    action: CustomerAction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnChainConfirmRequest {
    reservation_id: String,
    customer_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest {
    reservation_id: String,
    amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoyaltyRequest {
    reservation_id: String,
    customer_address: Option<String>,
    spent_amount: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoyaltyResponse {
    message: String,
    transaction_hash: Option<String>,
    amount: String,
    reservation: Reservation,
    #[serde(skip_serializing_if = "Option::is_none")]
    settlement_error: Option<String>,
}

// ============================================================================
// Middleware
// ============================================================================

/// Request statistics middleware
async fn stats_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let response = next.run(req).await;

    let success = response.status().is_success();
    let mut stats = state.api_stats.write().await;
    stats.record_request(success);

    response
}

/// Logs method, path, status and duration of every request.
async fn logging_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints
pub fn build_api_router(state: Arc<AppState>) -> Router {
    // CORS configuration - reflect the caller's origin
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE])
        .allow_credentials(true);

    let api_routes = Router::new()
        // Business dashboard
        .route(
            "/reservations",
            get(list_reservations)
                .post(create_reservation)
                .put(update_reservation_by_query)
                .delete(delete_reservation_by_query),
        )
        .route("/reservations/stats", get(reservation_stats))
        .route(
            "/reservations/:id",
            get(get_reservation)
                .put(update_reservation)
                .delete(delete_reservation),
        )
        .route("/reservations/confirm-pending", post(confirm_pending))
        .route("/reservations/cancel-confirmed", post(cancel_confirmed))
        .route("/reservations/update-attendance", post(update_attendance))
        // Customer confirmation link
        .route(
            "/reservations/confirm/:token",
            get(lookup_by_token).post(respond_by_token),
        )
        .route("/reservations/confirm-reservation", post(confirm_on_chain))
        // Settlement
        .route("/settlement/confirm-payment", post(confirm_payment))
        .route("/settlement/issue-loyalty", post(issue_loyalty))
        // Notifications
        .route("/notifications", get(list_notifications).post(send_notification))
        // System endpoints
        .route("/health", get(health_check))
        .route("/stats", get(get_api_stats))
        .layer(middleware::from_fn(logging_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            stats_middleware,
        ))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn run_api_server<F>(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(), ReservationError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_api_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "settlement": state.service.settlement_backend().unwrap_or("disabled"),
    }))
}

async fn get_api_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.get_stats().await)
}

async fn create_reservation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewReservation>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(input) = payload?;
    let created = state.service.create(input).await?;
    state.count_created().await;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn list_reservations(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    if let Some(id) = &query.id {
        return Ok(Json(state.service.get(id)?).into_response());
    }
    Ok(Json(state.service.list(&query.filter())?).into_response())
}

async fn reservation_stats(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    Ok(Json(state.service.stats()?).into_response())
}

async fn get_reservation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, ApiError> {
    Ok(Json(state.service.get(&id)?))
}

async fn update_reservation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<ReservationUpdate>, JsonRejection>,
) -> Result<Json<Reservation>, ApiError> {
    let Json(update) = payload?;
    Ok(Json(state.service.update(&id, update)?))
}

async fn update_reservation_by_query(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdQuery>,
    payload: Result<Json<ReservationUpdate>, JsonRejection>,
) -> Result<Json<Reservation>, ApiError> {
    let id = query.require()?;
    let Json(update) = payload?;
    Ok(Json(state.service.update(&id, update)?))
}

async fn delete_reservation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.service.delete(&id)?;
    Ok(Json(SuccessResponse {
        message: "Reservation deleted".to_string(),
    }))
}

async fn delete_reservation_by_query(
    state: State<Arc<AppState>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let id = query.require()?;
    delete_reservation(state, Path(id)).await
}

async fn confirm_pending(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ReservationIdRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let Json(req) = payload?;
    let reservation = state.service.confirm_pending(&req.reservation_id)?;
    state.count_transition().await;
    Ok(Json(TransitionResponse::new(
        "Reservation confirmed",
        reservation,
    )))
}

async fn cancel_confirmed(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ReservationIdRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let Json(req) = payload?;
    let reservation = state.service.cancel_confirmed(&req.reservation_id)?;
    state.count_transition().await;
    Ok(Json(TransitionResponse::new(
        "Reservation cancelled",
        reservation,
    )))
}

async fn update_attendance(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AttendanceRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let Json(req) = payload?;
    let outcome = state
        .service
        .update_attendance(&req.reservation_id, req.attendance_status)
        .await?;
    state.count_transition().await;
    Ok(Json(TransitionResponse::from_outcome(
        "Attendance updated",
        outcome,
    )))
}

async fn lookup_by_token(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<Reservation>, ApiError> {
    Ok(Json(state.service.lookup_by_token(&token)?))
}

async fn respond_by_token(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    payload: Result<Json<CustomerActionRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let Json(req) = payload?;
    let reservation = state.service.respond_by_token(&token, req.action)?;
    state.count_transition().await;
    let message = match req.action {
        CustomerAction::Confirm => "Reservation confirmed",
        CustomerAction::Cancel => "Reservation cancelled",
    };
    Ok(Json(TransitionResponse::new(message, reservation)))
}

async fn confirm_on_chain(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OnChainConfirmRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let Json(req) = payload?;
    state.count_settlement_call().await;
    let outcome = state
        .service
        .confirm_on_chain(&req.reservation_id, &req.customer_address)
        .await?;
    state.count_transition().await;
    Ok(Json(TransitionResponse::from_outcome(
        "Reservation confirmed on chain",
        outcome,
    )))
}

async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let Json(req) = payload?;
    state.count_settlement_call().await;
    let outcome = state
        .service
        .confirm_payment(&req.reservation_id, &req.amount)
        .await?;
    Ok(Json(TransitionResponse::from_outcome(
        "Payment completed",
        outcome,
    )))
}

async fn issue_loyalty(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoyaltyRequest>, JsonRejection>,
) -> Result<Json<LoyaltyResponse>, ApiError> {
    let Json(req) = payload?;
    state.count_settlement_call().await;
    let (outcome, tokens) = state
        .service
        .issue_loyalty(
            &req.reservation_id,
            req.customer_address.as_deref(),
            req.spent_amount.unwrap_or(DEFAULT_LOYALTY_SPEND),
        )
        .await?;
    Ok(Json(LoyaltyResponse {
        message: "Loyalty tokens issued".to_string(),
        transaction_hash: outcome.receipt.map(|r| r.hash),
        amount: format_base_units(i128::from(tokens) * 10i128.pow(TOKEN_DECIMALS)),
        reservation: outcome.reservation,
        settlement_error: outcome.settlement_error,
    }))
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Reservation>>, ApiError> {
    Ok(Json(state.service.pending_notifications()?))
}

async fn send_notification(
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload?;
    tracing::info!(notification = %body, "notification.sent");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": "Notification sent",
            "data": body,
        })),
    )
        .into_response())
}
