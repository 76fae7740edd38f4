use crate::database::error::DatabaseError;
use crate::database::store::{
    payment_status, NewManualPayment, NewStkPayment, Payment, PaymentMethod, PaymentStore,
    StkReceipt,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "id, order_id, user_id, amount, phone_number, method, \
     checkout_request_id, merchant_request_id, mpesa_code, status, result_desc, \
     paid_at, created_at, updated_at";

/// Raw payments row. The method discriminator plus its nullable companions
/// are folded into [`PaymentMethod`] before anything else sees them.
#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    user_id: Uuid,
    amount: BigDecimal,
    phone_number: Option<String>,
    method: String,
    checkout_request_id: Option<String>,
    merchant_request_id: Option<String>,
    mpesa_code: Option<String>,
    status: String,
    result_desc: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let method = match row.method.as_str() {
            "stk_push" => PaymentMethod::StkPush {
                checkout_request_id: row.checkout_request_id,
                merchant_request_id: row.merchant_request_id,
            },
            "manual" => PaymentMethod::Manual {
                mpesa_code: row.mpesa_code.clone().ok_or_else(|| {
                    DatabaseError::inconsistent(format!(
                        "manual payment {} has no transaction code",
                        row.id
                    ))
                })?,
            },
            other => {
                return Err(DatabaseError::inconsistent(format!(
                    "payment {} has unknown method '{}'",
                    row.id, other
                )))
            }
        };

        Ok(Payment {
            id: row.id,
            order_id: row.order_id,
            user_id: row.user_id,
            amount: row.amount,
            phone_number: row.phone_number,
            method,
            mpesa_code: row.mpesa_code,
            status: row.status,
            result_desc: row.result_desc,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_payment(row: Option<PaymentRow>) -> Result<Option<Payment>, DatabaseError> {
    row.map(Payment::try_from).transpose()
}

#[async_trait]
impl PaymentStore for PaymentRepository {
    async fn create_stk_pending(&self, new: NewStkPayment) -> Result<Payment, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments (id, order_id, user_id, amount, phone_number, method, status)
             VALUES ($1, $2, $3, $4, $5, 'stk_push', 'pending')
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.order_id)
        .bind(new.user_id)
        .bind(&new.amount)
        .bind(&new.phone_number)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.try_into()
    }

    async fn create_manual_pending(
        &self,
        new: NewManualPayment,
    ) -> Result<Payment, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments (id, order_id, user_id, amount, phone_number, method,
                 mpesa_code, status)
             VALUES ($1, $2, $3, $4, $5, 'manual', $6, 'pending')
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.order_id)
        .bind(new.user_id)
        .bind(&new.amount)
        .bind(&new.phone_number)
        .bind(&new.mpesa_code)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.try_into()
    }

    async fn attach_correlation(
        &self,
        payment_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE payments
             SET checkout_request_id = $2, merchant_request_id = $3, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(payment_id)
        .bind(checkout_request_id)
        .bind(merchant_request_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE checkout_request_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payment(row)
    }

    async fn find_pending_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<Payment>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE order_id = $1 AND status = 'pending'",
            PAYMENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payment(row)
    }

    async fn verify_stk(
        &self,
        payment_id: Uuid,
        receipt: StkReceipt,
    ) -> Result<Option<Payment>, DatabaseError> {
        // Conditional on 'pending': if another writer resolved this payment
        // first, zero rows come back and the caller sees None.
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments
             SET status = '{verified}', mpesa_code = $2,
                 phone_number = COALESCE($3, phone_number),
                 paid_at = $4, updated_at = NOW()
             WHERE id = $1 AND status = '{pending}'
             RETURNING {cols}",
            verified = payment_status::VERIFIED,
            pending = payment_status::PENDING,
            cols = PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(&receipt.mpesa_code)
        .bind(&receipt.phone_number)
        .bind(receipt.paid_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payment(row)
    }

    async fn fail_pending(
        &self,
        payment_id: Uuid,
        result_desc: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments
             SET status = '{failed}', result_desc = $2, updated_at = NOW()
             WHERE id = $1 AND status = '{pending}'
             RETURNING {cols}",
            failed = payment_status::FAILED,
            pending = payment_status::PENDING,
            cols = PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(result_desc)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payment(row)
    }

    async fn confirm_manual(&self, payment_id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments
             SET status = '{confirmed}', paid_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND status = '{pending}' AND method = 'manual'
             RETURNING {cols}",
            confirmed = payment_status::CONFIRMED,
            pending = payment_status::PENDING,
            cols = PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payment(row)
    }

    async fn reject_manual(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments
             SET status = '{rejected}', result_desc = $2, updated_at = NOW()
             WHERE id = $1 AND status = '{pending}' AND method = 'manual'
             RETURNING {cols}",
            rejected = payment_status::REJECTED,
            pending = payment_status::PENDING,
            cols = PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        into_payment(row)
    }
}
