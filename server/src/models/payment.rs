use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Gateway result code meaning the customer paid.
pub const RESULT_CODE_SUCCESS: i64 = 0;

/// A payment outcome reported by the gateway, stripped of its wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentResult {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub result_code: i64,
    pub result_desc: String,
    pub receipt_code: Option<String>,
    pub phone_number: Option<String>,
    pub amount: Option<Decimal>,
}

impl PaymentResult {
    pub fn is_success(&self) -> bool {
        self.result_code == RESULT_CODE_SUCCESS
    }
}

/// Idempotency ledger row: this gateway result has been fully applied.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProcessedCallback {
    pub checkout_request_id: String,
    pub correlation_id: Uuid,
    pub outcome: String,
    pub receipt_code: Option<String>,
    pub processed_at: DateTime<Utc>,
}
