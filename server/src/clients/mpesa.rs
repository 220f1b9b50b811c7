//! M-Pesa "Lipa Na M-Pesa Online" (STK push) client and callback envelope.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::MpesaConfig;
use crate::models::PaymentResult;
use crate::utils::phone;

const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";
const ACCEPTED_RESPONSE_CODE: &str = "0";
/// Returned by the status query while the customer has not answered the prompt.
const STILL_PROCESSING_ERROR_CODE: &str = "500.001.1001";
/// Tokens are refreshed this long before the gateway says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("access token request failed: {0}")]
    Token(String),

    #[error("push request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("gateway unreachable: {0}")]
    Transport(String),

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),

    #[error("invalid push request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// What the purchaser is told. Rejections carry the gateway's own wording.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Rejected { message, .. } => message.clone(),
            GatewayError::InvalidRequest(message) => message.clone(),
            _ => "Failed to initiate payment".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub amount: Decimal,
    pub phone_number: String,
    /// The internal correlation id of the purchase batch.
    pub account_reference: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushAcknowledgement {
    /// The gateway's correlation id; every callback carries it.
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub customer_message: String,
}

/// What the gateway reports when asked about an earlier push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushStatus {
    /// The customer has not answered the prompt yet.
    Processing,
    /// Final outcome. Status queries carry no receipt code or metadata.
    Finished(PaymentResult),
}

/// Initiates a push payment and returns the gateway's correlation id. The
/// payment outcome arrives later through the callback, or can be asked for
/// with `query_push`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_push(&self, request: &PushRequest) -> Result<PushAcknowledgement, GatewayError>;

    async fn query_push(&self, checkout_request_id: &str) -> Result<PushStatus, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushPayload<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: i64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    call_back_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    customer_message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryPayload<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkQueryResponse {
    #[serde(rename = "MerchantRequestID", default)]
    merchant_request_id: Option<String>,
    #[serde(rename = "ResponseCode", default)]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    /// Sent as a string by the live API and as a number by the sandbox.
    #[serde(rename = "ResultCode", default)]
    result_code: Option<Value>,
    #[serde(rename = "ResultDesc", default)]
    result_desc: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

pub struct MpesaClient {
    client: Client,
    config: MpesaConfig,
    token: Mutex<Option<CachedToken>>,
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
        })
    }

    /// OAuth client-credentials token, cached until shortly before expiry.
    pub async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .get(format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.config.base_url
            ))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(|e| GatewayError::Token(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Token(format!("status {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Token(e.to_string()))?;

        let lifetime = token
            .expires_in
            .as_deref()
            .and_then(|secs| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3599));
        let usable = lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(usable).unwrap_or_else(|_| chrono::Duration::zero());

        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });

        Ok(token.access_token)
    }

    fn password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }
}

pub fn push_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// The gateway only takes whole currency units.
fn whole_amount(amount: Decimal) -> Result<i64, GatewayError> {
    amount
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .filter(|value| *value >= 1)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("amount {amount} cannot be charged")))
}

#[async_trait]
impl PaymentGateway for MpesaClient {
    async fn initiate_push(&self, request: &PushRequest) -> Result<PushAcknowledgement, GatewayError> {
        let amount = whole_amount(request.amount)?;
        let msisdn = phone::to_msisdn(&request.phone_number)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        let token = self.access_token().await?;
        let timestamp = push_timestamp(Utc::now());

        let payload = StkPushPayload {
            business_short_code: &self.config.shortcode,
            password: self.password(&timestamp),
            timestamp,
            transaction_type: TRANSACTION_TYPE,
            amount,
            party_a: &msisdn,
            party_b: &self.config.shortcode,
            phone_number: &msisdn,
            call_back_url: &self.config.callback_url,
            account_reference: &request.account_reference,
            transaction_desc: &request.description,
        };

        let response = self
            .client
            .post(format!("{}/mpesa/stkpush/v1/processrequest", self.config.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body: StkPushResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

                if body.response_code != ACCEPTED_RESPONSE_CODE {
                    return Err(GatewayError::Rejected {
                        code: body.response_code,
                        message: body.response_description,
                    });
                }

                tracing::info!(
                    checkout_request_id = %body.checkout_request_id,
                    account_reference = %request.account_reference,
                    amount,
                    "STK push accepted"
                );

                Ok(PushAcknowledgement {
                    checkout_request_id: body.checkout_request_id,
                    merchant_request_id: body.merchant_request_id,
                    customer_message: body.customer_message,
                })
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                let (code, message) = api_error(status, &text, "Failed to initiate payment");
                Err(GatewayError::Rejected { code, message })
            }
        }
    }

    async fn query_push(&self, checkout_request_id: &str) -> Result<PushStatus, GatewayError> {
        let token = self.access_token().await?;
        let timestamp = push_timestamp(Utc::now());

        let payload = StkQueryPayload {
            business_short_code: &self.config.shortcode,
            password: self.password(&timestamp),
            timestamp,
            checkout_request_id,
        };

        let response = self
            .client
            .post(format!("{}/mpesa/stkpushquery/v1/query", self.config.base_url))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            let (code, message) = api_error(status, &text, "Failed to query payment status");
            if code == STILL_PROCESSING_ERROR_CODE {
                return Ok(PushStatus::Processing);
            }
            return Err(GatewayError::Rejected { code, message });
        }

        let body: StkQueryResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        if let Some(code) = body.response_code.as_deref() {
            if code != ACCEPTED_RESPONSE_CODE {
                return Err(GatewayError::Rejected {
                    code: code.to_string(),
                    message: body.response_description,
                });
            }
        }

        let result_code = match body.result_code {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| GatewayError::InvalidResponse("status query without a result code".to_string()))?;

        tracing::info!(%checkout_request_id, result_code, "STK push status queried");

        Ok(PushStatus::Finished(PaymentResult {
            checkout_request_id: checkout_request_id.to_string(),
            merchant_request_id: body.merchant_request_id,
            result_code,
            result_desc: body.result_desc,
            receipt_code: None,
            phone_number: None,
            amount: None,
        }))
    }
}

/// `(errorCode, errorMessage)` from an error body, falling back to the HTTP status.
fn api_error(status: StatusCode, text: &str, fallback: &str) -> (String, String) {
    match serde_json::from_str::<ApiErrorResponse>(text) {
        Ok(err) => (
            err.error_code.unwrap_or_else(|| status.as_u16().to_string()),
            err.error_message.unwrap_or_else(|| fallback.to_string()),
        ),
        Err(_) => (status.as_u16().to_string(), fallback.to_string()),
    }
}

/// Inbound callback body:
/// `{"Body":{"stkCallback":{...,"CallbackMetadata":{"Item":[{"Name","Value"}]}}}}`.
#[derive(Debug, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

impl StkCallback {
    fn item(&self, name: &str) -> Option<&Value> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }

    fn item_string(&self, name: &str) -> Option<String> {
        match self.item(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn item_decimal(&self, name: &str) -> Option<Decimal> {
        match self.item(name)? {
            Value::Number(n) => match n.as_i64() {
                Some(whole) => Some(Decimal::from(whole)),
                None => n.as_f64().and_then(Decimal::from_f64),
            },
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl From<StkCallbackEnvelope> for PaymentResult {
    fn from(envelope: StkCallbackEnvelope) -> Self {
        let callback = envelope.body.stk_callback;
        let success = callback.result_code == crate::models::payment::RESULT_CODE_SUCCESS;

        PaymentResult {
            receipt_code: success
                .then(|| callback.item_string("MpesaReceiptNumber"))
                .flatten(),
            phone_number: success.then(|| callback.item_string("PhoneNumber")).flatten(),
            amount: success.then(|| callback.item_decimal("Amount")).flatten(),
            checkout_request_id: callback.checkout_request_id,
            merchant_request_id: callback.merchant_request_id,
            result_code: callback.result_code,
            result_desc: callback.result_desc,
        }
    }
}
