pub mod orders;
pub mod payments;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::health::HealthChecker;
use crate::state::AppState;

/// GET /health and /health/live — liveness probe, always answers while the
/// process runs.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /health/ready — readiness probe, checks dependencies.
async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let status = HealthChecker::new(state.pool.clone()).check_health().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

pub fn router(state: AppState) -> Router {
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(health))
        .route("/health/ready", get(ready))
        .route("/api/payments/mpesa/initiate", post(payments::initiate_stk))
        .route("/api/payments/mpesa/callback", post(payments::mpesa_callback))
        .route(
            "/api/payments/mpesa/status/{checkout_request_id}",
            get(payments::payment_status),
        )
        .route("/api/payments/submit", post(payments::submit_manual))
        .route("/api/payments/verify/{order_id}", put(payments::verify_manual))
        .route(
            "/api/orders",
            post(orders::create_order).get(orders::list_orders),
        )
        .route("/api/orders/{id}", get(orders::get_order))
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .with_state(state)
}
