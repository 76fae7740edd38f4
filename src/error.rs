//! Unified error handling for the payments service.
//!
//! Every failure surfaces as an [`AppError`] with an HTTP status, a stable
//! error code for client handling, and a message safe to show the customer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::mpesa::MpesaError;

/// Stable error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "DUPLICATE_PAYMENT")]
    DuplicatePayment,
    #[serde(rename = "DUPLICATE_CODE")]
    DuplicateCode,
    #[serde(rename = "ALREADY_RESOLVED")]
    AlreadyResolved,
    #[serde(rename = "ORDER_ALREADY_PAID")]
    OrderAlreadyPaid,
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "INCONSISTENT_STATE")]
    InconsistentState,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 429)
    #[serde(rename = "GATEWAY_AUTH_ERROR")]
    GatewayAuthError,
    #[serde(rename = "GATEWAY_REQUEST_ERROR")]
    GatewayRequestError,
    #[serde(rename = "GATEWAY_UNAVAILABLE")]
    GatewayUnavailable,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,

    // Auth
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business-rule violations in the payment ledger
#[derive(Debug, Clone)]
pub enum DomainError {
    /// The order already has an unresolved or settled payment
    DuplicatePayment { order_id: String },
    /// The transaction code has already been submitted
    DuplicateCode { code: String },
    /// The payment already left the pending state
    AlreadyResolved { payment_id: String },
    /// The order has settled and cannot accept further payments
    OrderAlreadyPaid { order_id: String },
    OrderNotFound { order_id: String },
    PaymentNotFound { reference: String },
    /// Stored data contradicts a ledger invariant
    InconsistentState { message: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
}

/// Failures talking to the payment gateway
#[derive(Debug, Clone)]
pub enum ExternalError {
    GatewayAuth {
        message: String,
    },
    GatewayRequest {
        message: String,
        error_code: Option<String>,
    },
    GatewayUnavailable {
        message: String,
    },
    RateLimit {
        retry_after: Option<u64>,
    },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidPhoneFormat { phone: String },
    InvalidTransactionCode { code: String },
    InvalidAmount { amount: String, reason: String },
    MissingField { field: String },
}

/// Authentication and authorization failures
#[derive(Debug, Clone)]
pub enum AuthError {
    MissingToken,
    InvalidToken { message: String },
    Forbidden { required_role: String },
    /// The caller is authenticated but does not own the order or payment.
    NotOwner,
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
    Auth(AuthError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn domain(err: DomainError) -> Self {
        Self::new(AppErrorKind::Domain(err))
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(err))
    }

    pub fn auth(err: AuthError) -> Self {
        Self::new(AppErrorKind::Auth(err))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::DuplicatePayment { .. } => 409,
                DomainError::DuplicateCode { .. } => 409,
                DomainError::AlreadyResolved { .. } => 409,
                DomainError::OrderAlreadyPaid { .. } => 409,
                DomainError::OrderNotFound { .. } => 404,
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::InconsistentState { .. } => 500,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayAuth { .. } => 502,
                ExternalError::GatewayRequest { .. } => 502,
                ExternalError::GatewayUnavailable { .. } => 503,
                ExternalError::RateLimit { .. } => 429,
            },
            AppErrorKind::Validation(_) => 400,
            AppErrorKind::Auth(err) => match err {
                AuthError::MissingToken | AuthError::InvalidToken { .. } => 401,
                AuthError::Forbidden { .. } | AuthError::NotOwner => 403,
            },
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::DuplicatePayment { .. } => ErrorCode::DuplicatePayment,
                DomainError::DuplicateCode { .. } => ErrorCode::DuplicateCode,
                DomainError::AlreadyResolved { .. } => ErrorCode::AlreadyResolved,
                DomainError::OrderAlreadyPaid { .. } => ErrorCode::OrderAlreadyPaid,
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::InconsistentState { .. } => ErrorCode::InconsistentState,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayAuth { .. } => ErrorCode::GatewayAuthError,
                ExternalError::GatewayRequest { .. } => ErrorCode::GatewayRequestError,
                ExternalError::GatewayUnavailable { .. } => ErrorCode::GatewayUnavailable,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
            AppErrorKind::Auth(err) => match err {
                AuthError::MissingToken | AuthError::InvalidToken { .. } => {
                    ErrorCode::Unauthorized
                }
                AuthError::Forbidden { .. } | AuthError::NotOwner => ErrorCode::Forbidden,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::DuplicatePayment { order_id } => {
                    format!("Order '{}' already has a payment in progress", order_id)
                }
                DomainError::DuplicateCode { code } => {
                    format!("Transaction code '{}' has already been submitted", code)
                }
                DomainError::AlreadyResolved { payment_id } => {
                    format!("Payment '{}' has already been resolved", payment_id)
                }
                DomainError::OrderAlreadyPaid { order_id } => {
                    format!("Order '{}' is already paid", order_id)
                }
                DomainError::OrderNotFound { order_id } => {
                    format!("Order '{}' not found", order_id)
                }
                DomainError::PaymentNotFound { reference } => {
                    format!("Payment '{}' not found", reference)
                }
                DomainError::InconsistentState { .. } => {
                    "Payment records are in an unexpected state. Please contact support"
                        .to_string()
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayAuth { .. } | ExternalError::GatewayRequest { .. } => {
                    "Payment could not be initiated. Please try again".to_string()
                }
                ExternalError::GatewayUnavailable { .. } => {
                    "Payment provider is temporarily unavailable. Please try again".to_string()
                }
                ExternalError::RateLimit { retry_after } => {
                    if let Some(secs) = retry_after {
                        format!("Too many payment requests. Please retry in {} seconds", secs)
                    } else {
                        "Too many payment requests. Please retry shortly".to_string()
                    }
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidPhoneFormat { phone } => {
                    format!("'{}' is not a valid Safaricom phone number", phone)
                }
                ValidationError::InvalidTransactionCode { code } => {
                    format!("'{}' is not a valid M-Pesa transaction code", code)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
            },
            AppErrorKind::Auth(err) => match err {
                AuthError::MissingToken => "Authentication required".to_string(),
                AuthError::InvalidToken { .. } => {
                    "Authentication token is invalid or expired".to_string()
                }
                AuthError::Forbidden { required_role } => {
                    format!("This action requires the '{}' role", required_role)
                }
                AuthError::NotOwner => "You do not have access to this order".to_string(),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayAuth { .. } => false,
                ExternalError::GatewayRequest { .. } => false,
                ExternalError::GatewayUnavailable { .. } => true,
                ExternalError::RateLimit { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
            AppErrorKind::Auth(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let kind = match &err.kind {
            DatabaseErrorKind::NotFound => AppErrorKind::Domain(DomainError::PaymentNotFound {
                reference: err.message.clone(),
            }),
            DatabaseErrorKind::Inconsistent => {
                AppErrorKind::Domain(DomainError::InconsistentState {
                    message: err.message.clone(),
                })
            }
            DatabaseErrorKind::UniqueViolation { .. } => {
                // Callers that can name the violated rule map this before it
                // reaches here; anything left is an unexpected conflict.
                AppErrorKind::Domain(DomainError::InconsistentState {
                    message: err.message.clone(),
                })
            }
            DatabaseErrorKind::ConnectionFailed => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: err.message.clone(),
                    is_retryable: true,
                })
            }
            DatabaseErrorKind::Unknown => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: err.message.clone(),
                    is_retryable: false,
                })
            }
        };
        AppError::new(kind)
    }
}

impl From<MpesaError> for AppError {
    fn from(err: MpesaError) -> Self {
        let kind = match err {
            MpesaError::InvalidPhoneFormat { phone } => {
                AppErrorKind::Validation(ValidationError::InvalidPhoneFormat { phone })
            }
            MpesaError::AuthFailed { message } => {
                AppErrorKind::External(ExternalError::GatewayAuth { message })
            }
            MpesaError::RequestFailed {
                message,
                error_code,
            } => AppErrorKind::External(ExternalError::GatewayRequest {
                message,
                error_code,
            }),
            MpesaError::NetworkError { message } => {
                AppErrorKind::External(ExternalError::GatewayUnavailable { message })
            }
            MpesaError::RateLimited {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                retry_after: retry_after_seconds,
            }),
            MpesaError::ConfigError { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration { message })
            }
        };
        AppError::new(kind)
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
