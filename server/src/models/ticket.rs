use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketTier {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub quantity: i32,
    pub sold: i32,
    pub is_active: bool,
    pub sales_start: Option<DateTime<Utc>>,
    pub sales_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TicketTier {
    pub fn new(event_id: Uuid, name: impl Into<String>, price: Decimal, quantity: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event_id,
            name: name.into(),
            price,
            quantity,
            sold: 0,
            is_active: true,
            sales_start: None,
            sales_end: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active and inside the sale window. Open-ended bounds are unbounded.
    pub fn is_on_sale(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.sales_start.map_or(true, |start| now >= start)
            && self.sales_end.map_or(true, |end| now <= end)
    }

    pub fn available(&self) -> i32 {
        self.quantity - self.sold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Expired => "EXPIRED",
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown payment status '{0}'")]
pub struct UnknownPaymentStatus(pub String);

impl FromStr for PaymentStatus {
    type Err = UnknownPaymentStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(PaymentStatus::Pending),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "FAILED" => Ok(PaymentStatus::Failed),
            "EXPIRED" => Ok(PaymentStatus::Expired),
            other => Err(UnknownPaymentStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = UnknownPaymentStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One seat. Every ticket of a purchase shares the same `correlation_id`;
/// `checkout_request_id` is the gateway's id for that purchase, attached
/// once initiation succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub event_id: Uuid,
    pub tier_id: Uuid,
    pub purchaser_id: Uuid,
    pub phone_number: String,
    pub amount: Decimal,
    pub ticket_number: String,
    pub verification_payload: String,
    #[sqlx(try_from = "String")]
    pub payment_status: PaymentStatus,
    pub correlation_id: Uuid,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub receipt_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A PENDING ticket about to be written together with its reservation.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub id: Uuid,
    pub event_id: Uuid,
    pub tier_id: Uuid,
    pub purchaser_id: Uuid,
    pub phone_number: String,
    pub amount: Decimal,
    pub ticket_number: String,
    pub verification_payload: String,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl NewTicket {
    pub fn into_pending(self) -> Ticket {
        Ticket {
            id: self.id,
            event_id: self.event_id,
            tier_id: self.tier_id,
            purchaser_id: self.purchaser_id,
            phone_number: self.phone_number,
            amount: self.amount,
            ticket_number: self.ticket_number,
            verification_payload: self.verification_payload,
            payment_status: PaymentStatus::Pending,
            correlation_id: self.correlation_id,
            checkout_request_id: None,
            merchant_request_id: None,
            receipt_code: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}
