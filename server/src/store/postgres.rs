//! Postgres-backed inventory store.
//!
//! Each mutating operation runs in one transaction. Capacity changes are
//! single conditional `UPDATE`s, so concurrent purchases serialize on the
//! tier row and never oversell.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    group_by, units, CloseOutcome, Closure, InventoryStore, OutboxMessage, ParkedCallback,
    ReserveOutcome, SettleOutcome, Settled, Settlement, StoreError,
};
use crate::models::{Event, FanProfile, NewTicket, PaymentResult, PaymentStatus, Ticket, TicketTier};
use crate::services::fans::{announce_superfan, group_sales};

#[derive(FromRow)]
struct FanUpsert {
    #[sqlx(flatten)]
    profile: FanProfile,
    was_superfan: bool,
}

#[derive(Clone)]
pub struct PgInventoryStore {
    pool: PgPool,
}

impl PgInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn insert_error(err: sqlx::Error, ticket_number: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::DuplicateTicketNumber(ticket_number.to_string())
        }
        _ => StoreError::Database(err),
    }
}

async fn release(tx: &mut Transaction<'_, Postgres>, tier_id: Uuid, count: usize) -> Result<(), StoreError> {
    let units = units(count)?;
    let released = sqlx::query(
        "UPDATE ticket_tiers SET sold = sold - $2, updated_at = NOW()
         WHERE id = $1 AND sold >= $2",
    )
    .bind(tier_id)
    .bind(units)
    .execute(&mut **tx)
    .await?;

    if released.rows_affected() == 0 {
        return Err(StoreError::Corrupt(format!(
            "cannot release {units} units from tier {tier_id}"
        )));
    }
    Ok(())
}

async fn record_outcome(
    tx: &mut Transaction<'_, Postgres>,
    checkout_request_id: &str,
    correlation_id: Uuid,
    outcome: PaymentStatus,
    receipt_code: Option<&str>,
    at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let inserted = sqlx::query(
        "INSERT INTO processed_callbacks (checkout_request_id, correlation_id, outcome, receipt_code, processed_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (checkout_request_id) DO NOTHING",
    )
    .bind(checkout_request_id)
    .bind(correlation_id)
    .bind(outcome.as_str())
    .bind(receipt_code)
    .bind(at)
    .execute(&mut **tx)
    .await?;

    Ok(inserted.rows_affected() == 1)
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    async fn find_tier(&self, tier_id: Uuid) -> Result<Option<TicketTier>, StoreError> {
        let tier = sqlx::query_as::<_, TicketTier>("SELECT * FROM ticket_tiers WHERE id = $1")
            .bind(tier_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tier)
    }

    async fn find_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError> {
        let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1")
            .bind(ticket_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(ticket)
    }

    async fn tickets_in_batch(&self, correlation_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let tickets = sqlx::query_as::<_, Ticket>(
            "SELECT * FROM tickets WHERE correlation_id = $1 ORDER BY created_at, ticket_number",
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tickets)
    }

    async fn fan_profile(
        &self,
        purchaser_id: Uuid,
        organizer_id: Uuid,
    ) -> Result<Option<FanProfile>, StoreError> {
        let profile = sqlx::query_as::<_, FanProfile>(
            "SELECT * FROM fan_profiles WHERE purchaser_id = $1 AND organizer_id = $2",
        )
        .bind(purchaser_id)
        .bind(organizer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(profile)
    }

    async fn reserve(&self, tier_id: Uuid, tickets: Vec<NewTicket>) -> Result<ReserveOutcome, StoreError> {
        let units = units(tickets.len())?;
        let mut tx = self.pool.begin().await?;

        let reserved = sqlx::query(
            "UPDATE ticket_tiers SET sold = sold + $2, updated_at = NOW()
             WHERE id = $1 AND sold + $2 <= quantity",
        )
        .bind(tier_id)
        .bind(units)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            let available: Option<(i32,)> =
                sqlx::query_as("SELECT quantity - sold FROM ticket_tiers WHERE id = $1")
                    .bind(tier_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(ReserveOutcome::Insufficient {
                available: available.map_or(0, |(available,)| available),
            });
        }

        let mut written = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            let row = sqlx::query_as::<_, Ticket>(
                "INSERT INTO tickets (
                    id, event_id, tier_id, purchaser_id, phone_number, amount, ticket_number,
                    verification_payload, payment_status, correlation_id, created_at, updated_at
                 )
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
                 RETURNING *",
            )
            .bind(ticket.id)
            .bind(ticket.event_id)
            .bind(ticket.tier_id)
            .bind(ticket.purchaser_id)
            .bind(&ticket.phone_number)
            .bind(ticket.amount)
            .bind(&ticket.ticket_number)
            .bind(&ticket.verification_payload)
            .bind(PaymentStatus::Pending.as_str())
            .bind(ticket.correlation_id)
            .bind(ticket.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| insert_error(e, &ticket.ticket_number))?;
            written.push(row);
        }

        tx.commit().await?;
        Ok(ReserveOutcome::Reserved(written))
    }

    async fn cancel_reservation(&self, correlation_id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let removed: Vec<(Uuid,)> = sqlx::query_as(
            "DELETE FROM tickets WHERE correlation_id = $1 AND payment_status = 'PENDING'
             RETURNING tier_id",
        )
        .bind(correlation_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut per_tier: BTreeMap<Uuid, usize> = BTreeMap::new();
        for (tier_id,) in &removed {
            *per_tier.entry(*tier_id).or_default() += 1;
        }
        for (tier_id, count) in per_tier {
            release(&mut tx, tier_id, count).await?;
        }

        tx.commit().await?;
        Ok(removed.len() as u64)
    }

    async fn attach_checkout(
        &self,
        correlation_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tickets
             SET checkout_request_id = $2, merchant_request_id = $3, updated_at = NOW()
             WHERE correlation_id = $1",
        )
        .bind(correlation_id)
        .bind(checkout_request_id)
        .bind(merchant_request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_checkout(&self, checkout_request_id: &str) -> Result<Option<Uuid>, StoreError> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT correlation_id FROM tickets WHERE checkout_request_id = $1 LIMIT 1")
                .bind(checkout_request_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(correlation_id,)| correlation_id))
    }

    async fn is_processed(&self, checkout_request_id: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM processed_callbacks WHERE checkout_request_id = $1)",
        )
        .bind(checkout_request_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let recorded = record_outcome(
            &mut tx,
            &settlement.checkout_request_id,
            settlement.correlation_id,
            PaymentStatus::Completed,
            settlement.receipt_code.as_deref(),
            settlement.settled_at,
        )
        .await?;
        if !recorded {
            tx.rollback().await?;
            return Ok(SettleOutcome::AlreadyProcessed);
        }

        let tickets = sqlx::query_as::<_, Ticket>(
            "UPDATE tickets SET payment_status = 'COMPLETED', receipt_code = $2, updated_at = $3
             WHERE correlation_id = $1 AND payment_status = 'PENDING'
             RETURNING *",
        )
        .bind(settlement.correlation_id)
        .bind(settlement.receipt_code.as_deref())
        .bind(settlement.settled_at)
        .fetch_all(&mut *tx)
        .await?;
        if tickets.is_empty() {
            tx.rollback().await?;
            return Ok(SettleOutcome::NotPending);
        }

        let mut fans = Vec::new();
        for (event_id, group) in group_by(&tickets, |t| t.event_id) {
            let revenue: Decimal = group.iter().map(|t| t.amount).sum();
            let organizer: Option<(Uuid,)> = sqlx::query_as(
                "UPDATE events
                 SET tickets_sold = tickets_sold + $2, revenue = revenue + $3, updated_at = $4
                 WHERE id = $1
                 RETURNING organizer_id",
            )
            .bind(event_id)
            .bind(units(group.len())?)
            .bind(revenue)
            .bind(settlement.settled_at)
            .fetch_optional(&mut *tx)
            .await?;
            let Some((organizer_id,)) = organizer else {
                return Err(StoreError::Corrupt(format!("tickets reference missing event {event_id}")));
            };

            for sale in group_sales(group, organizer_id) {
                let upsert = sqlx::query_as::<_, FanUpsert>(
                    "WITH prior AS (
                        SELECT is_superfan FROM fan_profiles WHERE purchaser_id = $2 AND organizer_id = $3
                     )
                     INSERT INTO fan_profiles (
                        id, purchaser_id, organizer_id, total_spent, tickets_purchased,
                        last_interaction, is_superfan, created_at
                     )
                     VALUES ($1, $2, $3, $4, $5, $6, $4 >= $7, $6)
                     ON CONFLICT (purchaser_id, organizer_id) DO UPDATE SET
                        total_spent = fan_profiles.total_spent + EXCLUDED.total_spent,
                        tickets_purchased = fan_profiles.tickets_purchased + EXCLUDED.tickets_purchased,
                        last_interaction = EXCLUDED.last_interaction,
                        is_superfan = fan_profiles.is_superfan
                            OR fan_profiles.total_spent + EXCLUDED.total_spent >= $7
                     RETURNING fan_profiles.*,
                        COALESCE((SELECT is_superfan FROM prior), FALSE) AS was_superfan",
                )
                .bind(Uuid::new_v4())
                .bind(sale.purchaser_id)
                .bind(sale.organizer_id)
                .bind(sale.amount)
                .bind(sale.tickets)
                .bind(settlement.settled_at)
                .bind(settlement.superfan_threshold)
                .fetch_one(&mut *tx)
                .await?;

                if upsert.profile.is_superfan && !upsert.was_superfan {
                    announce_superfan(&upsert.profile);
                }
                fans.push(upsert.profile);
            }
        }

        for ticket in &tickets {
            sqlx::query(
                "INSERT INTO notification_outbox (id, ticket_id, next_attempt_at) VALUES ($1, $2, $3)",
            )
            .bind(Uuid::new_v4())
            .bind(ticket.id)
            .bind(settlement.settled_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(SettleOutcome::Applied(Settled { tickets, fans }))
    }

    async fn close_batch(&self, closure: &Closure) -> Result<CloseOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(checkout_request_id) = &closure.checkout_request_id {
            let recorded = record_outcome(
                &mut tx,
                checkout_request_id,
                closure.correlation_id,
                closure.status,
                None,
                closure.closed_at,
            )
            .await?;
            if !recorded {
                tx.rollback().await?;
                return Ok(CloseOutcome::AlreadyProcessed);
            }
        }

        let tickets = sqlx::query_as::<_, Ticket>(
            "UPDATE tickets SET payment_status = $2, updated_at = $3
             WHERE correlation_id = $1 AND payment_status = 'PENDING'
             RETURNING *",
        )
        .bind(closure.correlation_id)
        .bind(closure.status.as_str())
        .bind(closure.closed_at)
        .fetch_all(&mut *tx)
        .await?;
        if tickets.is_empty() {
            tx.rollback().await?;
            return Ok(CloseOutcome::NotPending);
        }

        for (tier_id, group) in group_by(&tickets, |t| t.tier_id) {
            release(&mut tx, tier_id, group.len()).await?;
        }

        tx.commit().await?;
        Ok(CloseOutcome::Closed(tickets))
    }

    async fn pending_batches_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT correlation_id FROM tickets
             WHERE payment_status = 'PENDING' AND created_at < $1
             ORDER BY correlation_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn park_callback(
        &self,
        result: &PaymentResult,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(result)
            .map_err(|e| StoreError::Corrupt(format!("unserializable callback: {e}")))?;

        sqlx::query(
            "INSERT INTO parked_callbacks (checkout_request_id, payload, received_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (checkout_request_id) DO NOTHING",
        )
        .bind(&result.checkout_request_id)
        .bind(payload)
        .bind(received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn parked_callbacks(&self) -> Result<Vec<ParkedCallback>, StoreError> {
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT checkout_request_id, payload, received_at FROM parked_callbacks ORDER BY received_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut parked = Vec::with_capacity(rows.len());
        for (checkout_request_id, payload, received_at) in rows {
            match serde_json::from_str::<PaymentResult>(&payload) {
                Ok(result) => parked.push(ParkedCallback { result, received_at }),
                Err(e) => {
                    tracing::warn!(%checkout_request_id, error = %e, "Skipping unreadable parked callback");
                }
            }
        }
        Ok(parked)
    }

    async fn discard_parked(&self, checkout_request_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM parked_callbacks WHERE checkout_request_id = $1")
            .bind(checkout_request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_notifications(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let claimed = sqlx::query_as::<_, OutboxMessage>(
            "UPDATE notification_outbox SET attempts = attempts + 1, next_attempt_at = $2
             WHERE id IN (
                SELECT id FROM notification_outbox
                WHERE delivered_at IS NULL AND abandoned_at IS NULL AND next_attempt_at <= $1
                ORDER BY next_attempt_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
             )
             RETURNING id, ticket_id, attempts",
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(claimed)
    }

    async fn mark_notification_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE notification_outbox SET delivered_at = $2, last_error = NULL WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule_notification(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE notification_outbox SET next_attempt_at = $2, last_error = $3 WHERE id = $1")
            .bind(id)
            .bind(next_attempt_at)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn abandon_notification(&self, id: Uuid, at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE notification_outbox SET abandoned_at = $2, last_error = $3 WHERE id = $1")
            .bind(id)
            .bind(at)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
