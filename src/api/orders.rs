use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::database::store::NewOrder;
use crate::error::AppResult;
use crate::middleware::auth::{AdminUser, AuthUser};
use crate::middleware::error::{attach_request_id, success_response};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub total_amount: BigDecimal,
}

/// POST /api/orders — the order is created for the authenticated user.
pub async fn create_order(
    AuthUser(claims): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateOrderRequest>,
) -> AppResult<impl IntoResponse> {
    let user_id = claims.user_id().map_err(|e| attach_request_id(e, &headers))?;
    let order = state
        .payments
        .create_order(NewOrder {
            user_id,
            customer_name: request.customer_name,
            customer_phone: request.customer_phone,
            customer_email: request.customer_email,
            total_amount: request.total_amount,
        })
        .await
        .map_err(|e| attach_request_id(e, &headers))?;
    Ok((StatusCode::CREATED, success_response(order)))
}

/// GET /api/orders/{id} — owner only; admins may fetch any order.
pub async fn get_order(
    AuthUser(claims): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let user_id = claims.user_id().map_err(|e| attach_request_id(e, &headers))?;
    let order = state
        .payments
        .get_order(order_id, user_id, claims.is_admin())
        .await
        .map_err(|e| attach_request_id(e, &headers))?;
    Ok(success_response(order))
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /api/orders (admin)
pub async fn list_orders(
    AdminUser(_claims): AdminUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListOrdersQuery>,
) -> AppResult<impl IntoResponse> {
    let orders = state
        .payments
        .list_orders(query.limit, query.offset)
        .await
        .map_err(|e| attach_request_id(e, &headers))?;
    Ok(success_response(orders))
}
