use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An organizer's event. `tickets_sold` and `revenue` only move when a
/// payment is confirmed; reservations never touch them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub organizer_id: Uuid,
    pub title: String,
    pub capacity: i32,
    pub is_published: bool,
    pub tickets_sold: i32,
    pub revenue: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn new(organizer_id: Uuid, title: impl Into<String>, capacity: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organizer_id,
            title: title.into(),
            capacity,
            is_published: true,
            tickets_sold: 0,
            revenue: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}
