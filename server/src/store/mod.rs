//! Inventory store: events, tiers, tickets, fan profiles, the callback ledger
//! and the notification outbox.
//!
//! Every mutating operation is atomic. Tier capacity only moves through the
//! conditional `sold + n <= quantity` increment and its inverse; there is no
//! read-then-write of `sold` anywhere.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Event, FanProfile, NewTicket, PaymentResult, PaymentStatus, Ticket, TicketTier};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgInventoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ticket number {0} already exists")]
    DuplicateTicketNumber(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved(Vec<Ticket>),
    /// Nothing was written. `available` is informational only.
    Insufficient { available: i32 },
}

/// Apply a successful payment to a PENDING batch.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub correlation_id: Uuid,
    /// Ledger key.
    pub checkout_request_id: String,
    pub receipt_code: Option<String>,
    pub settled_at: DateTime<Utc>,
    pub superfan_threshold: Decimal,
}

#[derive(Debug)]
pub struct Settled {
    pub tickets: Vec<Ticket>,
    pub fans: Vec<FanProfile>,
}

#[derive(Debug)]
pub enum SettleOutcome {
    Applied(Settled),
    /// The ledger already holds this checkout id; nothing changed.
    AlreadyProcessed,
    /// No ticket of the batch is PENDING any more; nothing changed.
    NotPending,
}

/// Move a PENDING batch to FAILED or EXPIRED and give its units back.
#[derive(Debug, Clone)]
pub struct Closure {
    pub correlation_id: Uuid,
    pub status: PaymentStatus,
    /// Set when a gateway callback caused the closure; recorded in the ledger.
    pub checkout_request_id: Option<String>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum CloseOutcome {
    Closed(Vec<Ticket>),
    AlreadyProcessed,
    NotPending,
}

#[derive(Debug, Clone)]
pub struct ParkedCallback {
    pub result: PaymentResult,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub ticket_id: Uuid,
    /// Attempts including the one this claim is for.
    pub attempts: i32,
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError>;

    async fn find_tier(&self, tier_id: Uuid) -> Result<Option<TicketTier>, StoreError>;

    async fn find_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError>;

    async fn tickets_in_batch(&self, correlation_id: Uuid) -> Result<Vec<Ticket>, StoreError>;

    async fn fan_profile(
        &self,
        purchaser_id: Uuid,
        organizer_id: Uuid,
    ) -> Result<Option<FanProfile>, StoreError>;

    /// Reserve one unit per ticket on `tier_id` and write the tickets as
    /// PENDING, all or nothing.
    async fn reserve(&self, tier_id: Uuid, tickets: Vec<NewTicket>) -> Result<ReserveOutcome, StoreError>;

    /// Undo a reservation whose payment never started: delete its PENDING
    /// tickets and release their units. Returns the number of tickets removed.
    async fn cancel_reservation(&self, correlation_id: Uuid) -> Result<u64, StoreError>;

    async fn attach_checkout(
        &self,
        correlation_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<(), StoreError>;

    /// Map the gateway's correlation id back to the purchase batch.
    async fn resolve_checkout(&self, checkout_request_id: &str) -> Result<Option<Uuid>, StoreError>;

    async fn is_processed(&self, checkout_request_id: &str) -> Result<bool, StoreError>;

    /// Ledger entry, ticket transitions, event aggregates, fan profiles and
    /// notification outbox rows, in one atomic step.
    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError>;

    async fn close_batch(&self, closure: &Closure) -> Result<CloseOutcome, StoreError>;

    /// Correlation ids of batches still PENDING that were created before `cutoff`.
    async fn pending_batches_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    async fn park_callback(
        &self,
        result: &PaymentResult,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn parked_callbacks(&self) -> Result<Vec<ParkedCallback>, StoreError>;

    async fn discard_parked(&self, checkout_request_id: &str) -> Result<(), StoreError>;

    /// Lease up to `limit` due outbox rows until `lease_until`, bumping their
    /// attempt count. A leased row is invisible to other claimers.
    async fn claim_notifications(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    async fn mark_notification_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn reschedule_notification(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn abandon_notification(&self, id: Uuid, at: DateTime<Utc>, error: &str) -> Result<(), StoreError>;
}

/// Tickets of a batch grouped by a key, in key order.
pub(crate) fn group_by<K, F>(tickets: &[Ticket], key: F) -> BTreeMap<K, Vec<&Ticket>>
where
    K: Ord,
    F: Fn(&Ticket) -> K,
{
    let mut groups: BTreeMap<K, Vec<&Ticket>> = BTreeMap::new();
    for ticket in tickets {
        groups.entry(key(ticket)).or_default().push(ticket);
    }
    groups
}

pub(crate) fn units(count: usize) -> Result<i32, StoreError> {
    i32::try_from(count).map_err(|_| StoreError::Corrupt(format!("batch of {count} tickets")))
}
