use thiserror::Error;

pub type MpesaResult<T> = Result<T, MpesaError>;

/// Gateway-layer failures. HTTP status and payer-facing messages are decided
/// at the application error layer, not here.
#[derive(Debug, Clone, Error)]
pub enum MpesaError {
    #[error("Invalid phone number: {phone}")]
    InvalidPhoneFormat { phone: String },

    #[error("Gateway authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Gateway rejected request: {message}")]
    RequestFailed {
        message: String,
        error_code: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },
}
