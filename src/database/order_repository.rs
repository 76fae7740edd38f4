use crate::database::error::DatabaseError;
use crate::database::store::{
    order_payment_status, order_status, NewOrder, Order, OrderStore,
};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

const ORDER_COLUMNS: &str = "id, user_id, customer_name, customer_phone, customer_email, \
     total_amount, status, payment_status, payment_id, created_at, updated_at";

pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for OrderRepository {
    async fn create(&self, new: NewOrder) -> Result<Order, DatabaseError> {
        sqlx::query_as::<_, Order>(&format!(
            "INSERT INTO orders (id, user_id, customer_name, customer_phone, customer_email,
                 total_amount, status, payment_status)
             VALUES ($1, $2, $3, $4, $5, $6, '{status}', '{payment}')
             RETURNING {cols}",
            status = order_status::PENDING,
            payment = order_payment_status::PENDING,
            cols = ORDER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(&new.customer_name)
        .bind(&new.customer_phone)
        .bind(&new.customer_email)
        .bind(&new.total_amount)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, DatabaseError> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Order>, DatabaseError> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            ORDER_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn mark_awaiting(&self, order_id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query(&format!(
            "UPDATE orders
             SET payment_status = '{awaiting}', updated_at = NOW()
             WHERE id = $1 AND payment_status <> '{paid}'",
            awaiting = order_payment_status::AWAITING,
            paid = order_payment_status::PAID
        ))
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_paid(
        &self,
        order_id: Uuid,
        payment_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        // Paid orders are immutable; the status guard makes a second
        // settlement a no-op rather than an overwrite. Settlement also moves
        // fulfillment to processing.
        let result = sqlx::query(&format!(
            "UPDATE orders
             SET payment_status = '{paid}', status = '{processing}',
                 payment_id = $2, updated_at = NOW()
             WHERE id = $1 AND payment_status <> '{paid}'",
            paid = order_payment_status::PAID,
            processing = order_status::PROCESSING
        ))
        .bind(order_id)
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn apply_failed(&self, order_id: Uuid) -> Result<bool, DatabaseError> {
        // Fulfillment status is left untouched so the order stays
        // retry-eligible.
        let result = sqlx::query(&format!(
            "UPDATE orders
             SET payment_status = '{failed}', updated_at = NOW()
             WHERE id = $1 AND payment_status <> '{paid}'",
            failed = order_payment_status::FAILED,
            paid = order_payment_status::PAID
        ))
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }
}
