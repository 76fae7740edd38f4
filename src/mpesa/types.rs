use crate::mpesa::error::{MpesaError, MpesaResult};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Canonicalize a Kenyan subscriber number to `2547XXXXXXXX` / `2541XXXXXXXX`.
///
/// Accepted inputs: `07XXXXXXXX`, `01XXXXXXXX`, `+2547...`, `+2541...`,
/// `2547...`, `2541...` (with incidental whitespace). Anything else is
/// rejected rather than guessed at.
pub fn normalize_phone(input: &str) -> MpesaResult<String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();

    let digits = if let Some(rest) = cleaned.strip_prefix('+') {
        rest.to_string()
    } else if let Some(rest) = cleaned.strip_prefix('0') {
        format!("254{}", rest)
    } else {
        cleaned.clone()
    };

    let valid = digits.len() == 12
        && digits.chars().all(|c| c.is_ascii_digit())
        && (digits.starts_with("2547") || digits.starts_with("2541"));

    if valid {
        Ok(digits)
    } else {
        Err(MpesaError::InvalidPhoneFormat {
            phone: input.to_string(),
        })
    }
}

/// Daraja request timestamp, `YYYYMMDDHHMMSS`.
pub fn stk_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// STK password: base64(shortcode + passkey + timestamp).
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    let raw = format!("{}{}{}", shortcode, passkey, timestamp);
    base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
}

/// Result codes the status query reports for attempts that are dead, as
/// opposed to still waiting on the payer. Everything outside this set (and
/// outside "0") is treated as still pending; the provider does not cleanly
/// distinguish "in flight" from "abandoned".
const TERMINAL_FAILURE_CODES: &[&str] = &["1", "1019", "1025", "1032", "1037", "2001"];

pub fn is_terminal_failure_code(result_code: &str) -> bool {
    TERMINAL_FAILURE_CODES.contains(&result_code)
}

#[derive(Debug, Clone)]
pub struct StkPushRequest {
    pub phone_number: String,
    pub amount: bigdecimal::BigDecimal,
    pub account_reference: String,
    pub description: String,
}

/// What the caller gets back from a successful push: the provider's
/// correlation ids for the attempt plus the message shown on the handset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkPushOutcome {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub customer_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkQueryOutcome {
    pub result_code: String,
    pub result_desc: String,
}

// Wire types for the Daraja API proper.

#[derive(Debug, Deserialize)]
pub(crate) struct OauthTokenResponse {
    pub access_token: String,
    /// Daraja returns this as a string, e.g. "3599".
    pub expires_in: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StkPushResponse {
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    #[allow(dead_code)]
    pub response_description: String,
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StkQueryResponse {
    #[serde(rename = "ResultCode")]
    pub result_code: String,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

// Callback envelope as delivered by the provider. The metadata item list is
// name/value pairs with no fixed schema, so values are kept as raw JSON and
// extracted by name.

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub item: Vec<CallbackItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: JsonValue,
}

/// Fields pulled out of a successful callback's metadata list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackReceipt {
    pub amount: Option<String>,
    pub receipt_number: Option<String>,
    pub phone_number: Option<String>,
    pub transaction_date: Option<String>,
}

impl StkCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }

    pub fn receipt(&self) -> CallbackReceipt {
        let mut receipt = CallbackReceipt::default();
        let Some(metadata) = &self.callback_metadata else {
            return receipt;
        };
        for item in &metadata.item {
            match item.name.as_str() {
                "Amount" => receipt.amount = json_value_to_string(&item.value),
                "MpesaReceiptNumber" => {
                    receipt.receipt_number = json_value_to_string(&item.value)
                }
                "PhoneNumber" => receipt.phone_number = json_value_to_string(&item.value),
                "TransactionDate" => {
                    receipt.transaction_date = json_value_to_string(&item.value)
                }
                _ => {}
            }
        }
        receipt
    }
}

fn json_value_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Body the provider expects back from the callback endpoint. These are
/// sentinel integers, not HTTP semantics; the endpoint answers HTTP 200
/// either way so the provider does not retry-storm us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Callback received successfully".to_string(),
        }
    }

    pub fn rejected(desc: impl Into<String>) -> Self {
        Self {
            result_code: 1,
            result_desc: desc.into(),
        }
    }
}
