use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Running totals for one purchaser with one organizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FanProfile {
    pub id: Uuid,
    pub purchaser_id: Uuid,
    pub organizer_id: Uuid,
    pub total_spent: Decimal,
    pub tickets_purchased: i32,
    pub last_interaction: DateTime<Utc>,
    pub is_superfan: bool,
    pub created_at: DateTime<Utc>,
}
