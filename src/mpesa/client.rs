use crate::mpesa::error::{MpesaError, MpesaResult};
use crate::mpesa::http::{GatewayAuth, GatewayHttpClient};
use crate::mpesa::types::{
    normalize_phone, stk_password, stk_timestamp, OauthTokenResponse, StkPushOutcome,
    StkPushRequest, StkPushResponse, StkQueryOutcome, StkQueryResponse,
};
use async_trait::async_trait;
use bigdecimal::ToPrimitive;
use chrono::Utc;
use serde_json::json;
use std::env;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Abstraction over the STK push gateway so services can be exercised
/// without talking to Safaricom.
#[async_trait]
pub trait StkGateway: Send + Sync {
    async fn stk_push(&self, request: StkPushRequest) -> MpesaResult<StkPushOutcome>;
    async fn query_status(&self, checkout_request_id: &str) -> MpesaResult<StkQueryOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DarajaEnvironment {
    Sandbox,
    Production,
}

impl DarajaEnvironment {
    fn base_url(&self) -> &'static str {
        match self {
            DarajaEnvironment::Sandbox => "https://sandbox.safaricom.co.ke",
            DarajaEnvironment::Production => "https://api.safaricom.co.ke",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DarajaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    pub environment: DarajaEnvironment,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl DarajaConfig {
    /// Reads credentials from the environment, failing closed: a service
    /// with a half-configured gateway must not start.
    pub fn from_env() -> MpesaResult<Self> {
        let required = |name: &str| -> MpesaResult<String> {
            env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| MpesaError::ConfigError {
                    message: format!("{} is not set", name),
                })
        };

        let environment = match env::var("MPESA_ENVIRONMENT")
            .unwrap_or_else(|_| "sandbox".to_string())
            .to_lowercase()
            .as_str()
        {
            "sandbox" => DarajaEnvironment::Sandbox,
            "production" => DarajaEnvironment::Production,
            other => {
                return Err(MpesaError::ConfigError {
                    message: format!(
                        "MPESA_ENVIRONMENT must be 'sandbox' or 'production', got '{}'",
                        other
                    ),
                })
            }
        };

        Ok(Self {
            consumer_key: required("MPESA_CONSUMER_KEY")?,
            consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            shortcode: required("MPESA_SHORTCODE")?,
            passkey: required("MPESA_PASSKEY")?,
            callback_url: required("MPESA_CALLBACK_URL")?,
            environment,
            timeout_secs: env::var("MPESA_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            max_retries: env::var("MPESA_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        })
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Client for Safaricom's Daraja API. OAuth tokens are cached and refreshed
/// shortly before expiry; all requests go through the retrying HTTP client.
pub struct DarajaClient {
    config: DarajaConfig,
    http: GatewayHttpClient,
    token: RwLock<Option<CachedToken>>,
}

impl DarajaClient {
    pub fn new(config: DarajaConfig) -> MpesaResult<Self> {
        let http = GatewayHttpClient::new(
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            config,
            http,
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> MpesaResult<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut cached = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.environment.base_url()
        );
        let response: OauthTokenResponse = self
            .http
            .request_json(
                reqwest::Method::GET,
                &url,
                GatewayAuth::Basic {
                    username: &self.config.consumer_key,
                    password: &self.config.consumer_secret,
                },
                None,
            )
            .await
            .map_err(|e| match e {
                MpesaError::RequestFailed { message, .. } => {
                    MpesaError::AuthFailed { message }
                }
                other => other,
            })?;

        let expires_in: u64 = response
            .expires_in
            .parse()
            .map_err(|_| MpesaError::AuthFailed {
                message: format!("unparseable token lifetime: {}", response.expires_in),
            })?;
        // Refresh a minute early so in-flight requests never carry a token
        // that dies mid-call.
        let lifetime = Duration::from_secs(expires_in.saturating_sub(60).max(1));

        debug!(expires_in, "obtained gateway access token");
        let access_token = response.access_token.clone();
        *cached = Some(CachedToken {
            access_token: response.access_token,
            expires_at: Instant::now() + lifetime,
        });
        Ok(access_token)
    }
}

#[async_trait]
impl StkGateway for DarajaClient {
    #[instrument(skip(self, request), fields(reference = %request.account_reference))]
    async fn stk_push(&self, request: StkPushRequest) -> MpesaResult<StkPushOutcome> {
        let phone = normalize_phone(&request.phone_number)?;
        // Daraja only accepts whole shillings.
        let amount = request
            .amount
            .round(0)
            .to_i64()
            .ok_or_else(|| MpesaError::RequestFailed {
                message: format!("amount out of range: {}", request.amount),
                error_code: None,
            })?;

        let token = self.access_token().await?;
        let timestamp = stk_timestamp(Utc::now());
        let password = stk_password(&self.config.shortcode, &self.config.passkey, &timestamp);

        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": password,
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": request.account_reference,
            "TransactionDesc": request.description,
        });

        let url = format!(
            "{}/mpesa/stkpush/v1/processrequest",
            self.config.environment.base_url()
        );
        let response: StkPushResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &url,
                GatewayAuth::Bearer(&token),
                Some(&payload),
            )
            .await?;

        if response.response_code != "0" {
            return Err(MpesaError::RequestFailed {
                message: format!("push rejected: {}", response.customer_message),
                error_code: Some(response.response_code),
            });
        }

        info!(
            checkout_request_id = %response.checkout_request_id,
            "STK push accepted by gateway"
        );
        Ok(StkPushOutcome {
            checkout_request_id: response.checkout_request_id,
            merchant_request_id: response.merchant_request_id,
            customer_message: response.customer_message,
        })
    }

    #[instrument(skip(self))]
    async fn query_status(&self, checkout_request_id: &str) -> MpesaResult<StkQueryOutcome> {
        let token = self.access_token().await?;
        let timestamp = stk_timestamp(Utc::now());
        let password = stk_password(&self.config.shortcode, &self.config.passkey, &timestamp);

        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": password,
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_request_id,
        });

        let url = format!(
            "{}/mpesa/stkpushquery/v1/query",
            self.config.environment.base_url()
        );
        let response: StkQueryResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &url,
                GatewayAuth::Bearer(&token),
                Some(&payload),
            )
            .await?;

        Ok(StkQueryOutcome {
            result_code: response.result_code,
            result_desc: response.result_desc,
        })
    }
}
