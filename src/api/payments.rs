use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::AppResult;
use crate::middleware::auth::{AdminUser, AuthUser};
use crate::middleware::error::{attach_request_id, success_response};
use crate::mpesa::{CallbackAck, CallbackEnvelope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiateStkRequest {
    pub order_id: Uuid,
    pub phone_number: String,
}

/// POST /api/payments/mpesa/initiate — owner only.
pub async fn initiate_stk(
    AuthUser(claims): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiateStkRequest>,
) -> AppResult<impl IntoResponse> {
    let user_id = claims.user_id().map_err(|e| attach_request_id(e, &headers))?;
    let initiated = state
        .payments
        .initiate_stk(user_id, request.order_id, &request.phone_number)
        .await
        .map_err(|e| attach_request_id(e, &headers))?;
    Ok(success_response(initiated))
}

/// POST /api/payments/mpesa/callback
///
/// Unauthenticated by provider contract: Daraja offers no signature over the
/// callback body. The handler answers HTTP 200 with a sentinel ack in every
/// case so the provider does not retry-storm the endpoint.
pub async fn mpesa_callback(State(state): State<AppState>, body: String) -> impl IntoResponse {
    info!("received M-Pesa callback");

    let envelope: CallbackEnvelope = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(error = %e, "unparseable callback payload");
            return (StatusCode::OK, Json(CallbackAck::rejected("Invalid payload")));
        }
    };

    let ack = state
        .payments
        .handle_callback(envelope.body.stk_callback)
        .await;
    (StatusCode::OK, Json(ack))
}

/// GET /api/payments/mpesa/status/{checkout_request_id} — owner only.
pub async fn payment_status(
    AuthUser(claims): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(checkout_request_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let user_id = claims.user_id().map_err(|e| attach_request_id(e, &headers))?;
    let view = state
        .payments
        .payment_status(user_id, &checkout_request_id)
        .await
        .map_err(|e| attach_request_id(e, &headers))?;
    Ok(success_response(view))
}

#[derive(Debug, Deserialize)]
pub struct SubmitCodeRequest {
    pub order_id: Uuid,
    /// The amount the customer claims to have paid. Stored as claimed so an
    /// admin can compare it against the order total.
    pub amount: BigDecimal,
    pub mpesa_code: String,
    pub phone_number: Option<String>,
}

/// POST /api/payments/submit — owner only.
pub async fn submit_manual(
    AuthUser(claims): AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitCodeRequest>,
) -> AppResult<impl IntoResponse> {
    let user_id = claims.user_id().map_err(|e| attach_request_id(e, &headers))?;
    let payment = state
        .payments
        .submit_manual(
            user_id,
            request.order_id,
            request.amount,
            &request.mpesa_code,
            request.phone_number.as_deref(),
        )
        .await
        .map_err(|e| attach_request_id(e, &headers))?;
    Ok((StatusCode::CREATED, success_response(payment)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyAction {
    Confirm,
    Reject,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub action: VerifyAction,
    pub rejection_reason: Option<String>,
}

/// PUT /api/payments/verify/{order_id} (admin)
pub async fn verify_manual(
    AdminUser(claims): AdminUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
    Json(request): Json<VerifyRequest>,
) -> AppResult<impl IntoResponse> {
    info!(admin = %claims.sub, order_id = %order_id, "manual payment review");

    let payment = match request.action {
        VerifyAction::Confirm => state
            .payments
            .confirm_manual(order_id)
            .await
            .map_err(|e| attach_request_id(e, &headers))?,
        VerifyAction::Reject => {
            let reason = request
                .rejection_reason
                .unwrap_or_else(|| "Rejected by admin".to_string());
            state
                .payments
                .reject_manual(order_id, &reason)
                .await
                .map_err(|e| attach_request_id(e, &headers))?
        }
    };
    Ok(success_response(payment))
}
