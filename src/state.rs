use crate::services::payment_flow::PaymentService;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<PaymentService>,
    pub pool: PgPool,
    pub jwt_secret: String,
}
