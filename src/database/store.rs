use crate::database::error::DatabaseError;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Payment lifecycle states. STK payments move pending -> verified/failed;
/// manual submissions move pending -> confirmed/rejected. Every transition
/// out of pending is final.
pub mod payment_status {
    pub const PENDING: &str = "pending";
    /// Terminal success via the automatic path (callback receipt).
    pub const VERIFIED: &str = "verified";
    /// Terminal success via admin review of a manual submission.
    pub const CONFIRMED: &str = "confirmed";
    pub const FAILED: &str = "failed";
    pub const REJECTED: &str = "rejected";

    pub fn is_settled(status: &str) -> bool {
        status == VERIFIED || status == CONFIRMED
    }
}

/// Order payment progression: `pending` until an attempt goes out,
/// `awaiting` while the payer acts, then `paid` or `failed`. Paid is final;
/// failed frees the order for another attempt.
pub mod order_payment_status {
    pub const PENDING: &str = "pending";
    pub const AWAITING: &str = "awaiting";
    pub const PAID: &str = "paid";
    pub const FAILED: &str = "failed";
}

/// Order fulfillment states. The payment core only ever moves an order to
/// `processing` on settlement; the rest belong to order management.
pub mod order_status {
    pub const PENDING: &str = "pending";
    pub const CONFIRMED: &str = "confirmed";
    pub const PROCESSING: &str = "processing";
    pub const SHIPPED: &str = "shipped";
    pub const DELIVERED: &str = "delivered";
    pub const CANCELLED: &str = "cancelled";
}

/// How a payment was made. STK pushes carry the provider's correlation ids
/// (absent until the push response lands); manual payments are identified
/// by the transaction code the customer typed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMethod {
    StkPush {
        checkout_request_id: Option<String>,
        merchant_request_id: Option<String>,
    },
    Manual {
        mpesa_code: String,
    },
}

impl PaymentMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentMethod::StkPush { .. } => "stk_push",
            PaymentMethod::Manual { .. } => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub phone_number: Option<String>,
    pub method: PaymentMethod,
    /// M-Pesa receipt number once the payment settles. For manual payments
    /// this mirrors the submitted code.
    pub mpesa_code: Option<String>,
    pub status: String,
    pub result_desc: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStkPayment {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub phone_number: String,
}

#[derive(Debug, Clone)]
pub struct NewManualPayment {
    pub order_id: Uuid,
    pub user_id: Uuid,
    /// Amount the customer claims to have paid; the admin compares it to the
    /// order total during review.
    pub amount: BigDecimal,
    pub phone_number: Option<String>,
    pub mpesa_code: String,
}

/// Receipt fields recorded when an STK payment is verified by the callback.
#[derive(Debug, Clone)]
pub struct StkReceipt {
    pub mpesa_code: String,
    pub phone_number: Option<String>,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub total_amount: BigDecimal,
    pub status: String,
    pub payment_status: String,
    pub payment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub total_amount: BigDecimal,
}

/// Storage for the payment ledger. Resolution methods return `Ok(None)`
/// when the conditional update matched no pending row, i.e. another writer
/// resolved the payment first.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create_stk_pending(&self, new: NewStkPayment) -> Result<Payment, DatabaseError>;

    async fn create_manual_pending(
        &self,
        new: NewManualPayment,
    ) -> Result<Payment, DatabaseError>;

    /// Records the gateway correlation ids on a freshly created STK payment.
    async fn attach_correlation(
        &self,
        payment_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn find_pending_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn verify_stk(
        &self,
        payment_id: Uuid,
        receipt: StkReceipt,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn fail_pending(
        &self,
        payment_id: Uuid,
        result_desc: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn confirm_manual(&self, payment_id: Uuid) -> Result<Option<Payment>, DatabaseError>;

    async fn reject_manual(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> Result<Option<Payment>, DatabaseError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create(&self, new: NewOrder) -> Result<Order, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, DatabaseError>;

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Order>, DatabaseError>;

    /// Moves the order's payment status to `awaiting` once an attempt is in
    /// flight. Returns `false` when the order is already paid.
    async fn mark_awaiting(&self, order_id: Uuid) -> Result<bool, DatabaseError>;

    /// Marks an order paid, moves fulfillment to `processing`, and links the
    /// settling payment. Returns `false` when the order was already paid;
    /// paid orders never change again.
    async fn mark_paid(&self, order_id: Uuid, payment_id: Uuid)
        -> Result<bool, DatabaseError>;

    /// Records a failed attempt on the order. Returns `false` when the order
    /// is already paid; a failure must never regress a paid order.
    async fn apply_failed(&self, order_id: Uuid) -> Result<bool, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_statuses_cover_both_flows() {
        assert!(payment_status::is_settled(payment_status::VERIFIED));
        assert!(payment_status::is_settled(payment_status::CONFIRMED));
        assert!(!payment_status::is_settled(payment_status::PENDING));
        assert!(!payment_status::is_settled(payment_status::FAILED));
        assert!(!payment_status::is_settled(payment_status::REJECTED));
    }

    #[test]
    fn method_kind_matches_storage_discriminator() {
        let stk = PaymentMethod::StkPush {
            checkout_request_id: None,
            merchant_request_id: None,
        };
        assert_eq!(stk.kind(), "stk_push");
        let manual = PaymentMethod::Manual {
            mpesa_code: "QGH7SK61TP".to_string(),
        };
        assert_eq!(manual.kind(), "manual");
    }
}
