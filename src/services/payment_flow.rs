//! Orchestrates the payment lifecycle: STK push initiation, callback
//! resolution, manual code submission, and admin reconciliation.
//!
//! All state transitions go through conditional storage updates; this layer
//! never holds locks across awaits and treats a zero-row update as losing a
//! resolution race.

use crate::database::error::DatabaseError;
use crate::database::store::{
    order_payment_status, payment_status, NewManualPayment, NewOrder, NewStkPayment, Order,
    OrderStore, Payment, PaymentStore, StkReceipt,
};
use crate::error::{AppError, AppResult, AuthError, DomainError, ValidationError};
use crate::mpesa::types::is_terminal_failure_code;
use crate::mpesa::{CallbackAck, StkCallback, StkGateway, StkPushRequest, StkQueryOutcome};
use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// M-Pesa receipt codes are ten uppercase alphanumerics.
const TRANSACTION_CODE_PATTERN: &str = r"^[A-Z0-9]{10}$";

#[derive(Debug, Clone, Serialize)]
pub struct InitiatedPayment {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub checkout_request_id: String,
    pub customer_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatusView {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub status: String,
    pub mpesa_code: Option<String>,
    pub result_desc: Option<String>,
    /// Live answer from the gateway, present only while the payment is
    /// still pending.
    pub gateway: Option<StkQueryOutcome>,
}

pub struct PaymentService {
    gateway: Arc<dyn StkGateway>,
    payments: Arc<dyn PaymentStore>,
    orders: Arc<dyn OrderStore>,
    code_pattern: Regex,
}

impl PaymentService {
    pub fn new(
        gateway: Arc<dyn StkGateway>,
        payments: Arc<dyn PaymentStore>,
        orders: Arc<dyn OrderStore>,
    ) -> Self {
        Self {
            gateway,
            payments,
            orders,
            code_pattern: Regex::new(TRANSACTION_CODE_PATTERN)
                .expect("transaction code pattern is valid"),
        }
    }

    /// Loads the order, enforces that the caller owns it, and rejects
    /// settled orders. Every payer-initiated attempt starts here.
    async fn owned_payable_order(&self, order_id: Uuid, user_id: Uuid) -> AppResult<Order> {
        let order = self.orders.find_by_id(order_id).await?.ok_or_else(|| {
            AppError::domain(DomainError::OrderNotFound {
                order_id: order_id.to_string(),
            })
        })?;

        if order.user_id != user_id {
            return Err(AppError::auth(AuthError::NotOwner));
        }
        if order.payment_status == order_payment_status::PAID {
            return Err(AppError::domain(DomainError::OrderAlreadyPaid {
                order_id: order_id.to_string(),
            }));
        }
        Ok(order)
    }

    /// Creates a pending payment for the order and fires the STK push.
    /// The ledger row exists before the gateway call so a callback racing
    /// the push response always finds something to resolve.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn initiate_stk(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        phone_number: &str,
    ) -> AppResult<InitiatedPayment> {
        let order = self.owned_payable_order(order_id, user_id).await?;
        let phone = crate::mpesa::types::normalize_phone(phone_number)?;

        let payment = self
            .payments
            .create_stk_pending(NewStkPayment {
                order_id,
                user_id,
                amount: order.total_amount.clone(),
                phone_number: phone.clone(),
            })
            .await
            .map_err(|e| map_payment_insert_error(e, order_id, None))?;

        let outcome = match self
            .gateway
            .stk_push(StkPushRequest {
                phone_number: phone,
                amount: order.total_amount.clone(),
                account_reference: order_id.to_string(),
                description: "Polyspack order payment".to_string(),
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(gateway_err) => {
                // Free the order for another attempt before reporting.
                if let Err(db_err) = self
                    .payments
                    .fail_pending(payment.id, &format!("push failed: {}", gateway_err))
                    .await
                {
                    error!(
                        payment_id = %payment.id,
                        error = %db_err,
                        "could not mark payment failed after push error"
                    );
                }
                return Err(gateway_err.into());
            }
        };

        self.payments
            .attach_correlation(
                payment.id,
                &outcome.checkout_request_id,
                &outcome.merchant_request_id,
            )
            .await?;
        self.move_to_awaiting(order_id).await;

        info!(
            payment_id = %payment.id,
            checkout_request_id = %outcome.checkout_request_id,
            "STK push initiated"
        );
        Ok(InitiatedPayment {
            payment_id: payment.id,
            order_id,
            checkout_request_id: outcome.checkout_request_id,
            customer_message: outcome.customer_message,
        })
    }

    /// Resolves a pending payment from a provider callback. Always returns
    /// an acknowledgement; failures here are logged, never surfaced to the
    /// provider as errors.
    #[instrument(skip(self, callback), fields(checkout_request_id = %callback.checkout_request_id))]
    pub async fn handle_callback(&self, callback: StkCallback) -> CallbackAck {
        let payment = match self
            .payments
            .find_by_checkout_request_id(&callback.checkout_request_id)
            .await
        {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                // Nothing of ours; acknowledge so the provider stops resending.
                warn!("callback for unknown checkout request, ignoring");
                return CallbackAck::accepted();
            }
            Err(e) => {
                error!(error = %e, "failed to load payment for callback");
                return CallbackAck::rejected("Internal error");
            }
        };

        if callback.is_success() {
            self.verify_from_callback(payment, &callback).await
        } else {
            self.fail_from_callback(payment, &callback).await
        }
    }

    async fn verify_from_callback(
        &self,
        payment: Payment,
        callback: &StkCallback,
    ) -> CallbackAck {
        let receipt = callback.receipt();
        let Some(mpesa_code) = receipt.receipt_number else {
            // A success with no receipt cannot settle the ledger; leave the
            // payment pending for reconciliation.
            error!(payment_id = %payment.id, "success callback carried no receipt number");
            return CallbackAck::accepted();
        };

        let verified = self
            .payments
            .verify_stk(
                payment.id,
                StkReceipt {
                    mpesa_code: mpesa_code.clone(),
                    phone_number: receipt.phone_number,
                    paid_at: Utc::now(),
                },
            )
            .await;

        match verified {
            Ok(Some(verified)) => {
                match self.orders.mark_paid(verified.order_id, verified.id).await {
                    Ok(true) => {
                        info!(
                            payment_id = %verified.id,
                            order_id = %verified.order_id,
                            mpesa_code = %mpesa_code,
                            "payment verified, order marked paid"
                        );
                    }
                    Ok(false) => {
                        // The order settled through another payment. The
                        // ledger keeps both records for reconciliation.
                        warn!(
                            payment_id = %verified.id,
                            order_id = %verified.order_id,
                            "payment verified but order was already paid"
                        );
                    }
                    Err(e) => {
                        error!(
                            payment_id = %verified.id,
                            error = %e,
                            "failed to mark order paid"
                        );
                    }
                }
                CallbackAck::accepted()
            }
            Ok(None) => {
                // Replayed callback or a race we lost; the first resolution
                // stands.
                info!(payment_id = %payment.id, "payment already resolved, callback is a no-op");
                CallbackAck::accepted()
            }
            Err(e) if e.is_unique_violation() => {
                warn!(
                    payment_id = %payment.id,
                    mpesa_code = %mpesa_code,
                    "receipt number already recorded on another payment"
                );
                CallbackAck::accepted()
            }
            Err(e) => {
                error!(payment_id = %payment.id, error = %e, "failed to verify payment");
                CallbackAck::rejected("Internal error")
            }
        }
    }

    async fn fail_from_callback(&self, payment: Payment, callback: &StkCallback) -> CallbackAck {
        match self
            .payments
            .fail_pending(payment.id, &callback.result_desc)
            .await
        {
            Ok(Some(failed)) => {
                info!(
                    payment_id = %failed.id,
                    result_code = callback.result_code,
                    result_desc = %callback.result_desc,
                    "payment failed"
                );
                self.record_failed_outcome(failed.order_id).await;
            }
            Ok(None) => {
                info!(payment_id = %payment.id, "payment already resolved, callback is a no-op");
            }
            Err(e) => {
                error!(payment_id = %payment.id, error = %e, "failed to record payment failure");
                return CallbackAck::rejected("Internal error");
            }
        }
        CallbackAck::accepted()
    }

    /// Current state of an STK payment, visible only to its owner. While the
    /// payment is pending the gateway is queried live; a terminal failure
    /// answer resolves the payment, anything else leaves it pending for the
    /// callback.
    #[instrument(skip(self))]
    pub async fn payment_status(
        &self,
        user_id: Uuid,
        checkout_request_id: &str,
    ) -> AppResult<PaymentStatusView> {
        let payment = self
            .payments
            .find_by_checkout_request_id(checkout_request_id)
            .await?
            .ok_or_else(|| {
                AppError::domain(DomainError::PaymentNotFound {
                    reference: checkout_request_id.to_string(),
                })
            })?;

        if payment.user_id != user_id {
            return Err(AppError::auth(AuthError::NotOwner));
        }

        if payment.status != payment_status::PENDING {
            return Ok(status_view(payment, None));
        }

        let gateway_answer = match self.gateway.query_status(checkout_request_id).await {
            Ok(answer) => answer,
            Err(e) => {
                // The gateway being unreachable does not change our ledger.
                warn!(error = %e, "status query failed, reporting stored state");
                return Ok(status_view(payment, None));
            }
        };

        let payment = if is_terminal_failure_code(&gateway_answer.result_code) {
            match self
                .payments
                .fail_pending(payment.id, &gateway_answer.result_desc)
                .await?
            {
                Some(failed) => {
                    self.record_failed_outcome(failed.order_id).await;
                    failed
                }
                None => payment,
            }
        } else {
            payment
        };

        Ok(status_view(payment, Some(gateway_answer)))
    }

    /// Records a customer-submitted transaction code for admin review. The
    /// claimed amount is stored as submitted so the admin can compare it to
    /// the order total.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn submit_manual(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        amount: BigDecimal,
        code: &str,
        phone_number: Option<&str>,
    ) -> AppResult<Payment> {
        let code = code.trim().to_uppercase();
        if !self.code_pattern.is_match(&code) {
            return Err(AppError::validation(
                ValidationError::InvalidTransactionCode { code },
            ));
        }
        if amount <= BigDecimal::zero() {
            return Err(AppError::validation(ValidationError::InvalidAmount {
                amount: amount.to_string(),
                reason: "must be greater than zero".to_string(),
            }));
        }

        let order = self.owned_payable_order(order_id, user_id).await?;
        let phone = phone_number
            .map(crate::mpesa::types::normalize_phone)
            .transpose()?;

        if amount != order.total_amount {
            // Recorded as claimed; the mismatch is the admin's call to make.
            warn!(
                claimed = %amount,
                order_total = %order.total_amount,
                "manual submission amount differs from order total"
            );
        }

        let payment = self
            .payments
            .create_manual_pending(NewManualPayment {
                order_id,
                user_id,
                amount,
                phone_number: phone,
                mpesa_code: code.clone(),
            })
            .await
            .map_err(|e| map_payment_insert_error(e, order_id, Some(&code)))?;
        self.move_to_awaiting(order_id).await;

        info!(payment_id = %payment.id, "manual transaction code submitted");
        Ok(payment)
    }

    /// Admin confirmation of a pending manual payment: marks it confirmed
    /// and settles the order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn confirm_manual(&self, order_id: Uuid) -> AppResult<Payment> {
        let payment = self.pending_payment_for(order_id).await?;

        let confirmed = self
            .payments
            .confirm_manual(payment.id)
            .await?
            .ok_or_else(|| {
                AppError::domain(DomainError::AlreadyResolved {
                    payment_id: payment.id.to_string(),
                })
            })?;

        if !self.orders.mark_paid(order_id, confirmed.id).await? {
            warn!(
                payment_id = %confirmed.id,
                order_id = %order_id,
                "payment confirmed but order was already paid"
            );
        }

        info!(payment_id = %confirmed.id, "manual payment confirmed");
        Ok(confirmed)
    }

    /// Admin rejection of a pending manual payment. The order moves to
    /// failed and the code becomes submittable again only on other orders.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn reject_manual(&self, order_id: Uuid, reason: &str) -> AppResult<Payment> {
        let payment = self.pending_payment_for(order_id).await?;

        let rejected = self
            .payments
            .reject_manual(payment.id, reason)
            .await?
            .ok_or_else(|| {
                AppError::domain(DomainError::AlreadyResolved {
                    payment_id: payment.id.to_string(),
                })
            })?;
        self.record_failed_outcome(order_id).await;
        Ok(rejected)
    }

    async fn pending_payment_for(&self, order_id: Uuid) -> AppResult<Payment> {
        self.payments
            .find_pending_for_order(order_id)
            .await?
            .ok_or_else(|| {
                AppError::domain(DomainError::PaymentNotFound {
                    reference: format!("no pending payment for order {}", order_id),
                })
            })
    }

    /// Moves the order to `awaiting` after an attempt went out. Losing to a
    /// concurrent settlement is harmless, so the result is only logged.
    async fn move_to_awaiting(&self, order_id: Uuid) {
        match self.orders.mark_awaiting(order_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(order_id = %order_id, "order settled before it could be marked awaiting");
            }
            Err(e) => {
                error!(order_id = %order_id, error = %e, "failed to mark order awaiting");
            }
        }
    }

    /// Propagates a failed payment into the order. A paid order is never
    /// regressed; that contradiction is logged as inconsistent state and
    /// absorbed.
    async fn record_failed_outcome(&self, order_id: Uuid) {
        match self.orders.apply_failed(order_id).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    order_id = %order_id,
                    "inconsistent state: failed payment outcome on a paid order"
                );
            }
            Err(e) => {
                error!(order_id = %order_id, error = %e, "failed to record order payment failure");
            }
        }
    }

    pub async fn create_order(&self, new: NewOrder) -> AppResult<Order> {
        if new.customer_name.trim().is_empty() {
            return Err(AppError::validation(ValidationError::MissingField {
                field: "customer_name".to_string(),
            }));
        }
        if new.total_amount <= BigDecimal::zero() {
            return Err(AppError::validation(ValidationError::InvalidAmount {
                amount: new.total_amount.to_string(),
                reason: "must be greater than zero".to_string(),
            }));
        }
        let customer_phone = crate::mpesa::types::normalize_phone(&new.customer_phone)?;

        Ok(self
            .orders
            .create(NewOrder {
                customer_phone,
                ..new
            })
            .await?)
    }

    /// Fetches an order for its owner; admins may fetch any order.
    pub async fn get_order(&self, order_id: Uuid, user_id: Uuid, admin: bool) -> AppResult<Order> {
        let order = self.orders.find_by_id(order_id).await?.ok_or_else(|| {
            AppError::domain(DomainError::OrderNotFound {
                order_id: order_id.to_string(),
            })
        })?;

        if !admin && order.user_id != user_id {
            return Err(AppError::auth(AuthError::NotOwner));
        }
        Ok(order)
    }

    pub async fn list_orders(&self, limit: i64, offset: i64) -> AppResult<Vec<Order>> {
        Ok(self.orders.list(limit.clamp(1, 200), offset.max(0)).await?)
    }
}

fn status_view(payment: Payment, gateway: Option<StkQueryOutcome>) -> PaymentStatusView {
    PaymentStatusView {
        payment_id: payment.id,
        order_id: payment.order_id,
        status: payment.status,
        mpesa_code: payment.mpesa_code,
        result_desc: payment.result_desc,
        gateway,
    }
}

/// Translate a unique violation from the payments table into the domain
/// error for the rule that fired.
fn map_payment_insert_error(err: DatabaseError, order_id: Uuid, code: Option<&str>) -> AppError {
    if err.is_unique_violation() {
        match err.constraint() {
            Some(name) if name.contains("mpesa_code") => {
                return AppError::domain(DomainError::DuplicateCode {
                    code: code.unwrap_or_default().to_string(),
                });
            }
            Some(name) if name.contains("order") => {
                return AppError::domain(DomainError::DuplicatePayment {
                    order_id: order_id.to_string(),
                });
            }
            _ => {
                return AppError::domain(DomainError::DuplicatePayment {
                    order_id: order_id.to_string(),
                });
            }
        }
    }
    err.into()
}
