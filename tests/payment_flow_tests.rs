//! End-to-end exercises of the payment lifecycle against in-memory stores
//! and a scripted gateway, covering STK verification, failure retry, and
//! manual reconciliation.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use polyspack_payments::database::error::{DatabaseError, DatabaseErrorKind};
use polyspack_payments::database::store::{
    order_payment_status, order_status, payment_status, NewManualPayment, NewOrder, NewStkPayment,
    Order, OrderStore, Payment, PaymentMethod, PaymentStore, StkReceipt,
};
use polyspack_payments::error::ErrorCode;
use polyspack_payments::mpesa::types::{CallbackItem, CallbackMetadata};
use polyspack_payments::mpesa::{
    MpesaError, MpesaResult, StkCallback, StkGateway, StkPushOutcome, StkPushRequest,
    StkQueryOutcome,
};
use polyspack_payments::services::payment_flow::PaymentService;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ---- test doubles -------------------------------------------------------

struct MockGateway {
    push_results: Mutex<VecDeque<MpesaResult<StkPushOutcome>>>,
    query_result: Mutex<Option<StkQueryOutcome>>,
    push_calls: AtomicUsize,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            push_results: Mutex::new(VecDeque::new()),
            query_result: Mutex::new(None),
            push_calls: AtomicUsize::new(0),
        }
    }

    fn queue_push(&self, result: MpesaResult<StkPushOutcome>) {
        self.push_results.lock().unwrap().push_back(result);
    }

    fn set_query(&self, outcome: StkQueryOutcome) {
        *self.query_result.lock().unwrap() = Some(outcome);
    }

    fn push_count(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }
}

fn accepted_push(checkout: &str) -> StkPushOutcome {
    StkPushOutcome {
        checkout_request_id: checkout.to_string(),
        merchant_request_id: format!("merchant-{}", checkout),
        customer_message: "Success. Request accepted for processing".to_string(),
    }
}

#[async_trait]
impl StkGateway for MockGateway {
    async fn stk_push(&self, _request: StkPushRequest) -> MpesaResult<StkPushOutcome> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.push_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(accepted_push("ws_CO_default")))
    }

    async fn query_status(&self, _checkout_request_id: &str) -> MpesaResult<StkQueryOutcome> {
        self.query_result
            .lock()
            .unwrap()
            .clone()
            .ok_or(MpesaError::NetworkError {
                message: "query not scripted".to_string(),
            })
    }
}

/// In-memory ledger enforcing the same uniqueness rules as the schema.
struct MemoryPayments {
    rows: Mutex<Vec<Payment>>,
}

impl MemoryPayments {
    fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }

    fn unique_violation(constraint: &str) -> DatabaseError {
        DatabaseError::new(
            DatabaseErrorKind::UniqueViolation {
                constraint: Some(constraint.to_string()),
            },
            "duplicate key value",
        )
    }

    fn get(&self, id: Uuid) -> Option<Payment> {
        self.rows.lock().unwrap().iter().find(|p| p.id == id).cloned()
    }
}

fn active(status: &str) -> bool {
    status == payment_status::PENDING || payment_status::is_settled(status)
}

#[async_trait]
impl PaymentStore for MemoryPayments {
    async fn create_stk_pending(&self, new: NewStkPayment) -> Result<Payment, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        if rows
            .iter()
            .any(|p| p.order_id == new.order_id && active(&p.status))
        {
            return Err(Self::unique_violation("payments_order_id_active_key"));
        }
        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            user_id: new.user_id,
            amount: new.amount,
            phone_number: Some(new.phone_number),
            method: PaymentMethod::StkPush {
                checkout_request_id: None,
                merchant_request_id: None,
            },
            mpesa_code: None,
            status: payment_status::PENDING.to_string(),
            result_desc: None,
            paid_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        rows.push(payment.clone());
        Ok(payment)
    }

    async fn create_manual_pending(
        &self,
        new: NewManualPayment,
    ) -> Result<Payment, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        if rows
            .iter()
            .any(|p| p.mpesa_code.as_deref() == Some(new.mpesa_code.as_str()))
        {
            return Err(Self::unique_violation("payments_mpesa_code_key"));
        }
        if rows
            .iter()
            .any(|p| p.order_id == new.order_id && active(&p.status))
        {
            return Err(Self::unique_violation("payments_order_id_active_key"));
        }
        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            user_id: new.user_id,
            amount: new.amount,
            phone_number: new.phone_number,
            method: PaymentMethod::Manual {
                mpesa_code: new.mpesa_code.clone(),
            },
            mpesa_code: Some(new.mpesa_code),
            status: payment_status::PENDING.to_string(),
            result_desc: None,
            paid_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        rows.push(payment.clone());
        Ok(payment)
    }

    async fn attach_correlation(
        &self,
        payment_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<(), DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(payment) = rows.iter_mut().find(|p| p.id == payment_id) {
            payment.method = PaymentMethod::StkPush {
                checkout_request_id: Some(checkout_request_id.to_string()),
                merchant_request_id: Some(merchant_request_id.to_string()),
            };
        }
        Ok(())
    }

    async fn find_by_checkout_request_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|p| {
                matches!(
                    &p.method,
                    PaymentMethod::StkPush {
                        checkout_request_id: Some(id),
                        ..
                    } if id == checkout_request_id
                )
            })
            .cloned())
    }

    async fn find_pending_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<Payment>, DatabaseError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.order_id == order_id && p.status == payment_status::PENDING)
            .cloned())
    }

    async fn verify_stk(
        &self,
        payment_id: Uuid,
        receipt: StkReceipt,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|p| {
            p.id != payment_id && p.mpesa_code.as_deref() == Some(receipt.mpesa_code.as_str())
        }) {
            return Err(Self::unique_violation("payments_mpesa_code_key"));
        }
        let Some(payment) = rows
            .iter_mut()
            .find(|p| p.id == payment_id && p.status == payment_status::PENDING)
        else {
            return Ok(None);
        };
        payment.status = payment_status::VERIFIED.to_string();
        payment.mpesa_code = Some(receipt.mpesa_code);
        if receipt.phone_number.is_some() {
            payment.phone_number = receipt.phone_number;
        }
        payment.paid_at = Some(receipt.paid_at);
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn fail_pending(
        &self,
        payment_id: Uuid,
        result_desc: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(payment) = rows
            .iter_mut()
            .find(|p| p.id == payment_id && p.status == payment_status::PENDING)
        else {
            return Ok(None);
        };
        payment.status = payment_status::FAILED.to_string();
        payment.result_desc = Some(result_desc.to_string());
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn confirm_manual(&self, payment_id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(payment) = rows.iter_mut().find(|p| {
            p.id == payment_id
                && p.status == payment_status::PENDING
                && matches!(p.method, PaymentMethod::Manual { .. })
        }) else {
            return Ok(None);
        };
        payment.status = payment_status::CONFIRMED.to_string();
        payment.paid_at = Some(Utc::now());
        Ok(Some(payment.clone()))
    }

    async fn reject_manual(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(payment) = rows.iter_mut().find(|p| {
            p.id == payment_id
                && p.status == payment_status::PENDING
                && matches!(p.method, PaymentMethod::Manual { .. })
        }) else {
            return Ok(None);
        };
        payment.status = payment_status::REJECTED.to_string();
        payment.result_desc = Some(reason.to_string());
        Ok(Some(payment.clone()))
    }
}

struct MemoryOrders {
    rows: Mutex<Vec<Order>>,
}

impl MemoryOrders {
    fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OrderStore for MemoryOrders {
    async fn create(&self, new: NewOrder) -> Result<Order, DatabaseError> {
        let order = Order {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            customer_name: new.customer_name,
            customer_phone: new.customer_phone,
            customer_email: new.customer_email,
            total_amount: new.total_amount,
            status: order_status::PENDING.to_string(),
            payment_status: order_payment_status::PENDING.to_string(),
            payment_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(order.clone());
        Ok(order)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>, DatabaseError> {
        Ok(self.rows.lock().unwrap().iter().find(|o| o.id == id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Order>, DatabaseError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_awaiting(&self, order_id: Uuid) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(order) = rows
            .iter_mut()
            .find(|o| o.id == order_id && o.payment_status != order_payment_status::PAID)
        else {
            return Ok(false);
        };
        order.payment_status = order_payment_status::AWAITING.to_string();
        Ok(true)
    }

    async fn mark_paid(&self, order_id: Uuid, payment_id: Uuid) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(order) = rows
            .iter_mut()
            .find(|o| o.id == order_id && o.payment_status != order_payment_status::PAID)
        else {
            return Ok(false);
        };
        order.payment_status = order_payment_status::PAID.to_string();
        order.status = order_status::PROCESSING.to_string();
        order.payment_id = Some(payment_id);
        Ok(true)
    }

    async fn apply_failed(&self, order_id: Uuid) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(order) = rows
            .iter_mut()
            .find(|o| o.id == order_id && o.payment_status != order_payment_status::PAID)
        else {
            return Ok(false);
        };
        // Fulfillment status untouched; only the payment track moves.
        order.payment_status = order_payment_status::FAILED.to_string();
        Ok(true)
    }
}

// ---- fixtures -----------------------------------------------------------

struct Fixture {
    service: PaymentService,
    gateway: Arc<MockGateway>,
    payments: Arc<MemoryPayments>,
    orders: Arc<MemoryOrders>,
}

fn fixture() -> Fixture {
    let gateway = Arc::new(MockGateway::new());
    let payments = Arc::new(MemoryPayments::new());
    let orders = Arc::new(MemoryOrders::new());
    let service = PaymentService::new(gateway.clone(), payments.clone(), orders.clone());
    Fixture {
        service,
        gateway,
        payments,
        orders,
    }
}

async fn make_order(fx: &Fixture, owner: Uuid, amount: u32) -> Order {
    fx.service
        .create_order(NewOrder {
            user_id: owner,
            customer_name: "Wanjiku Kamau".to_string(),
            customer_phone: "0712345678".to_string(),
            customer_email: None,
            total_amount: BigDecimal::from(amount),
        })
        .await
        .expect("order should be created")
}

fn success_callback(checkout: &str, receipt: &str) -> StkCallback {
    StkCallback {
        merchant_request_id: format!("merchant-{}", checkout),
        checkout_request_id: checkout.to_string(),
        result_code: 0,
        result_desc: "The service request is processed successfully.".to_string(),
        callback_metadata: Some(CallbackMetadata {
            item: vec![
                CallbackItem {
                    name: "Amount".to_string(),
                    value: serde_json::json!(1500),
                },
                CallbackItem {
                    name: "MpesaReceiptNumber".to_string(),
                    value: serde_json::json!(receipt),
                },
                CallbackItem {
                    name: "PhoneNumber".to_string(),
                    value: serde_json::json!(254712345678u64),
                },
            ],
        }),
    }
}

fn failure_callback(checkout: &str, code: i64, desc: &str) -> StkCallback {
    StkCallback {
        merchant_request_id: format!("merchant-{}", checkout),
        checkout_request_id: checkout.to_string(),
        result_code: code,
        result_desc: desc.to_string(),
        callback_metadata: None,
    }
}

// ---- STK push flow ------------------------------------------------------

#[tokio::test]
async fn stk_happy_path_verifies_payment_and_settles_order() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));

    let initiated = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .expect("push should be initiated");
    assert_eq!(initiated.checkout_request_id, "ws_CO_1");

    let ack = fx
        .service
        .handle_callback(success_callback("ws_CO_1", "NLJ7RT61SV"))
        .await;
    assert_eq!(ack.result_code, 0);

    let payment = fx.payments.get(initiated.payment_id).expect("payment exists");
    assert_eq!(payment.status, payment_status::VERIFIED);
    assert_eq!(payment.mpesa_code.as_deref(), Some("NLJ7RT61SV"));
    assert!(payment.paid_at.is_some());

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, order_payment_status::PAID);
    // Settlement hands the order to fulfillment.
    assert_eq!(order.status, order_status::PROCESSING);
    assert_eq!(order.payment_id, Some(initiated.payment_id));
}

#[tokio::test]
async fn initiation_moves_order_to_awaiting() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;
    assert_eq!(order.payment_status, order_payment_status::PENDING);

    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    fx.service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, order_payment_status::AWAITING);
    assert_eq!(order.status, order_status::PENDING);
}

#[tokio::test]
async fn another_users_order_is_off_limits() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;

    let err = fx
        .service
        .initiate_stk(stranger, order.id, "0712345678")
        .await
        .expect_err("stranger should be refused");
    assert_eq!(err.status_code(), 403);
    assert_eq!(err.error_code(), ErrorCode::Forbidden);
    assert_eq!(fx.gateway.push_count(), 0);

    let err = fx
        .service
        .submit_manual(
            stranger,
            order.id,
            BigDecimal::from(1500),
            "QGH7SK61TP",
            None,
        )
        .await
        .expect_err("stranger submission should be refused");
    assert_eq!(err.status_code(), 403);

    // Status of the owner's in-flight payment is equally off limits.
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    fx.service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();
    let err = fx
        .service
        .payment_status(stranger, "ws_CO_1")
        .await
        .expect_err("stranger poll should be refused");
    assert_eq!(err.status_code(), 403);

    let err = fx
        .service
        .get_order(order.id, stranger, false)
        .await
        .expect_err("stranger fetch should be refused");
    assert_eq!(err.status_code(), 403);
    // An admin may fetch it regardless of ownership.
    fx.service
        .get_order(order.id, stranger, true)
        .await
        .expect("admin fetch should succeed");
}

#[tokio::test]
async fn replayed_success_callback_is_a_noop() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    let initiated = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();

    let first = fx
        .service
        .handle_callback(success_callback("ws_CO_1", "NLJ7RT61SV"))
        .await;
    let replay = fx
        .service
        .handle_callback(success_callback("ws_CO_1", "NLJ7RT61SV"))
        .await;
    assert_eq!(first.result_code, 0);
    assert_eq!(replay.result_code, 0);

    let payment = fx.payments.get(initiated.payment_id).unwrap();
    assert_eq!(payment.status, payment_status::VERIFIED);
}

#[tokio::test]
async fn failed_push_leaves_order_retry_eligible() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 800).await;
    fx.gateway.queue_push(Err(MpesaError::RequestFailed {
        message: "push rejected".to_string(),
        error_code: Some("500.001.1001".to_string()),
    }));

    let err = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .expect_err("push should fail");
    assert_eq!(err.status_code(), 502);

    // The failed attempt frees the order for a second try.
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_2")));
    let retry = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .expect("retry should succeed");
    assert_eq!(retry.checkout_request_id, "ws_CO_2");
    assert_eq!(fx.gateway.push_count(), 2);
}

#[tokio::test]
async fn declined_callback_fails_payment_and_order() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 2000).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    let initiated = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();

    let ack = fx
        .service
        .handle_callback(failure_callback("ws_CO_1", 1032, "Request cancelled by user"))
        .await;
    assert_eq!(ack.result_code, 0);

    let payment = fx.payments.get(initiated.payment_id).unwrap();
    assert_eq!(payment.status, payment_status::FAILED);
    assert_eq!(
        payment.result_desc.as_deref(),
        Some("Request cancelled by user")
    );

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, order_payment_status::FAILED);
    // Fulfillment never started, so the order can be retried.
    assert_eq!(order.status, order_status::PENDING);
    assert_eq!(order.payment_id, None);
}

#[tokio::test]
async fn failed_outcome_never_regresses_a_paid_order() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    fx.service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();
    fx.service
        .handle_callback(success_callback("ws_CO_1", "NLJ7RT61SV"))
        .await;

    let applied = fx.orders.apply_failed(order.id).await.unwrap();
    assert!(!applied, "a paid order must not move to failed");

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, order_payment_status::PAID);
    assert_eq!(order.status, order_status::PROCESSING);
}

#[tokio::test]
async fn callback_for_unknown_checkout_is_acknowledged() {
    let fx = fixture();
    let ack = fx
        .service
        .handle_callback(success_callback("ws_CO_unknown", "NLJ7RT61SV"))
        .await;
    assert_eq!(ack.result_code, 0);
}

#[tokio::test]
async fn second_initiation_on_pending_order_is_rejected() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    fx.service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();

    let err = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .expect_err("second attempt should conflict");
    assert_eq!(err.error_code(), ErrorCode::DuplicatePayment);
    assert_eq!(err.status_code(), 409);
    // The gateway never saw the second attempt.
    assert_eq!(fx.gateway.push_count(), 1);
}

#[tokio::test]
async fn initiation_on_paid_order_is_rejected() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    fx.service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();
    fx.service
        .handle_callback(success_callback("ws_CO_1", "NLJ7RT61SV"))
        .await;

    let err = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .expect_err("paid order should not accept payments");
    assert_eq!(err.error_code(), ErrorCode::OrderAlreadyPaid);
}

#[tokio::test]
async fn invalid_phone_is_rejected_before_any_ledger_write() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;

    let err = fx
        .service
        .initiate_stk(owner, order.id, "0812345678")
        .await
        .expect_err("non-Safaricom prefix should be rejected");
    assert_eq!(err.status_code(), 400);
    assert_eq!(fx.gateway.push_count(), 0);
    assert!(fx
        .payments
        .find_pending_for_order(order.id)
        .await
        .unwrap()
        .is_none());
}

// ---- status polling -----------------------------------------------------

#[tokio::test]
async fn status_poll_with_terminal_failure_resolves_payment_and_order() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 900).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    let initiated = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();

    fx.gateway.set_query(StkQueryOutcome {
        result_code: "1032".to_string(),
        result_desc: "Request cancelled by user".to_string(),
    });

    let view = fx.service.payment_status(owner, "ws_CO_1").await.unwrap();
    assert_eq!(view.status, payment_status::FAILED);
    assert_eq!(view.payment_id, initiated.payment_id);

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, order_payment_status::FAILED);
}

#[tokio::test]
async fn status_poll_with_ambiguous_answer_stays_pending() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 900).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    fx.service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();

    fx.gateway.set_query(StkQueryOutcome {
        result_code: "4999".to_string(),
        result_desc: "The transaction is being processed".to_string(),
    });

    let view = fx.service.payment_status(owner, "ws_CO_1").await.unwrap();
    assert_eq!(view.status, payment_status::PENDING);
    assert!(view.gateway.is_some());
}

#[tokio::test]
async fn status_poll_for_unknown_checkout_is_not_found() {
    let fx = fixture();
    let err = fx
        .service
        .payment_status(Uuid::new_v4(), "ws_CO_missing")
        .await
        .expect_err("should be not found");
    assert_eq!(err.status_code(), 404);
}

// ---- manual reconciliation ----------------------------------------------

#[tokio::test]
async fn manual_flow_confirm_settles_order() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 3000).await;

    let payment = fx
        .service
        .submit_manual(
            owner,
            order.id,
            BigDecimal::from(3000),
            "qgh7sk61tp",
            Some("0712345678"),
        )
        .await
        .expect("submission should be recorded");
    assert_eq!(payment.status, payment_status::PENDING);
    // Codes are canonicalized to uppercase on submission.
    assert_eq!(payment.mpesa_code.as_deref(), Some("QGH7SK61TP"));

    let awaiting = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(awaiting.payment_status, order_payment_status::AWAITING);

    let confirmed = fx
        .service
        .confirm_manual(order.id)
        .await
        .expect("admin confirm should succeed");
    assert_eq!(confirmed.status, payment_status::CONFIRMED);

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, order_payment_status::PAID);
    assert_eq!(order.status, order_status::PROCESSING);
    assert_eq!(order.payment_id, Some(confirmed.id));
}

#[tokio::test]
async fn manual_submission_records_the_claimed_amount() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 3000).await;

    // Customer claims less than the order total; the claim is stored as
    // submitted so the admin sees the mismatch.
    let payment = fx
        .service
        .submit_manual(owner, order.id, BigDecimal::from(2500), "QGH7SK61TP", None)
        .await
        .expect("submission should be recorded");
    assert_eq!(payment.amount, BigDecimal::from(2500));
    assert_ne!(payment.amount, order.total_amount);
}

#[tokio::test]
async fn manual_flow_reject_fails_the_order() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 3000).await;
    fx.service
        .submit_manual(owner, order.id, BigDecimal::from(3000), "QGH7SK61TP", None)
        .await
        .unwrap();

    let rejected = fx
        .service
        .reject_manual(order.id, "Amount mismatch")
        .await
        .expect("admin reject should succeed");
    assert_eq!(rejected.status, payment_status::REJECTED);
    assert_eq!(rejected.result_desc.as_deref(), Some("Amount mismatch"));

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, order_payment_status::FAILED);
    assert_eq!(order.status, order_status::PENDING);
}

#[tokio::test]
async fn rejected_order_accepts_a_new_code() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 3000).await;
    fx.service
        .submit_manual(owner, order.id, BigDecimal::from(3000), "QGH7SK61TP", None)
        .await
        .unwrap();
    fx.service.reject_manual(order.id, "Wrong code").await.unwrap();

    fx.service
        .submit_manual(owner, order.id, BigDecimal::from(3000), "RHL8TM72UQ", None)
        .await
        .expect("new code should be accepted after rejection");

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, order_payment_status::AWAITING);
}

#[tokio::test]
async fn transaction_code_cannot_be_reused_across_orders() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let first = make_order(&fx, owner, 1000).await;
    let second = make_order(&fx, owner, 2000).await;

    fx.service
        .submit_manual(owner, first.id, BigDecimal::from(1000), "QGH7SK61TP", None)
        .await
        .unwrap();
    let err = fx
        .service
        .submit_manual(owner, second.id, BigDecimal::from(2000), "QGH7SK61TP", None)
        .await
        .expect_err("reused code should conflict");
    assert_eq!(err.error_code(), ErrorCode::DuplicateCode);
}

#[tokio::test]
async fn malformed_transaction_code_is_rejected() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1000).await;

    for code in ["SHORT", "toolongcode123", "QGH7SK61T!", ""] {
        let err = fx
            .service
            .submit_manual(owner, order.id, BigDecimal::from(1000), code, None)
            .await
            .expect_err("malformed code should be rejected");
        assert_eq!(err.status_code(), 400, "code: {}", code);
    }
}

#[tokio::test]
async fn non_positive_claimed_amount_is_rejected() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1000).await;

    let err = fx
        .service
        .submit_manual(owner, order.id, BigDecimal::from(0), "QGH7SK61TP", None)
        .await
        .expect_err("zero amount should be rejected");
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn double_confirm_reports_already_resolved() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1000).await;
    fx.service
        .submit_manual(owner, order.id, BigDecimal::from(1000), "QGH7SK61TP", None)
        .await
        .unwrap();
    fx.service.confirm_manual(order.id).await.unwrap();

    let err = fx
        .service
        .confirm_manual(order.id)
        .await
        .expect_err("second confirm should fail");
    // The payment already left pending; there is nothing left to review.
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn confirm_with_no_submission_is_not_found() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1000).await;

    let err = fx
        .service
        .confirm_manual(order.id)
        .await
        .expect_err("nothing to confirm");
    assert_eq!(err.error_code(), ErrorCode::PaymentNotFound);
}

// ---- paid-at-most-once --------------------------------------------------

#[tokio::test]
async fn settled_order_is_never_relinked() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_1")));
    let initiated = fx
        .service
        .initiate_stk(owner, order.id, "0712345678")
        .await
        .unwrap();
    fx.service
        .handle_callback(success_callback("ws_CO_1", "NLJ7RT61SV"))
        .await;

    // A direct second settlement attempt must not overwrite the link.
    let relinked = fx.orders.mark_paid(order.id, Uuid::new_v4()).await.unwrap();
    assert!(!relinked);

    let order = fx.orders.find_by_id(order.id).await.unwrap().unwrap();
    assert_eq!(order.payment_id, Some(initiated.payment_id));
}

#[tokio::test]
async fn concurrent_initiations_yield_one_pending_payment() {
    let fx = fixture();
    let owner = Uuid::new_v4();
    let order = make_order(&fx, owner, 1500).await;
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_a")));
    fx.gateway.queue_push(Ok(accepted_push("ws_CO_b")));

    let (first, second) = tokio::join!(
        fx.service.initiate_stk(owner, order.id, "0712345678"),
        fx.service.initiate_stk(owner, order.id, "0712345678"),
    );

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one initiation should win");
    let loser = if first.is_err() { first } else { second };
    assert_eq!(
        loser.expect_err("one must lose").error_code(),
        ErrorCode::DuplicatePayment
    );
}
