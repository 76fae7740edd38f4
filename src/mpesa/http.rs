use crate::mpesa::error::{MpesaError, MpesaResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// Credentials attached to a gateway request.
pub enum GatewayAuth<'a> {
    Bearer(&'a str),
    Basic { username: &'a str, password: &'a str },
}

/// Thin retrying JSON client for the Daraja endpoints. Server errors and
/// rate limits back off exponentially; everything else fails fast.
#[derive(Clone)]
pub struct GatewayHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
}

impl GatewayHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> MpesaResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            MpesaError::NetworkError {
                message: format!("failed to initialize HTTP client: {}", e),
            }
        })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
        })
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: GatewayAuth<'_>,
        body: Option<&JsonValue>,
    ) -> MpesaResult<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout);
            request = match &auth {
                GatewayAuth::Bearer(token) => request.bearer_auth(token),
                GatewayAuth::Basic { username, password } => {
                    request.basic_auth(username, Some(password))
                }
            };
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let response = request.send().await.map_err(|e| MpesaError::NetworkError {
                message: format!("gateway request failed: {}", e),
            });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            MpesaError::RequestFailed {
                                message: format!("invalid gateway JSON response: {}", e),
                                error_code: None,
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                            continue;
                        }
                        return Err(MpesaError::RateLimited {
                            message: "gateway rate limit exceeded".to_string(),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() && attempt < self.max_retries {
                        warn!(
                            status = %status,
                            attempt = attempt + 1,
                            "gateway server error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                        continue;
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(MpesaError::AuthFailed {
                            message: format!("HTTP {}: {}", status, text),
                        });
                    }

                    // Daraja error bodies carry an errorCode worth keeping.
                    let error_code = serde_json::from_str::<JsonValue>(&text)
                        .ok()
                        .and_then(|v| {
                            v.get("errorCode")
                                .and_then(|c| c.as_str())
                                .map(|c| c.to_string())
                        });
                    return Err(MpesaError::RequestFailed {
                        message: format!("HTTP {}: {}", status, text),
                        error_code,
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(MpesaError::NetworkError {
            message: "gateway request failed".to_string(),
        }))
    }
}
