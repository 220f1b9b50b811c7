//! In-memory inventory store.
//!
//! One mutex serializes every mutation, which gives the same single-writer
//! semantics as the transactional Postgres store. Used by tests and for
//! running the server without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    group_by, units, CloseOutcome, Closure, InventoryStore, OutboxMessage, ParkedCallback,
    ReserveOutcome, SettleOutcome, Settled, Settlement, StoreError,
};
use crate::models::{
    Event, FanProfile, NewTicket, PaymentResult, PaymentStatus, ProcessedCallback, Ticket, TicketTier,
};
use crate::services::fans::{group_sales, FanAggregateUpdater};

#[derive(Debug, Clone)]
struct OutboxEntry {
    id: Uuid,
    ticket_id: Uuid,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    abandoned_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct State {
    events: HashMap<Uuid, Event>,
    tiers: HashMap<Uuid, TicketTier>,
    tickets: Vec<Ticket>,
    fans: HashMap<(Uuid, Uuid), FanProfile>,
    ledger: HashMap<String, ProcessedCallback>,
    parked: HashMap<String, ParkedCallback>,
    outbox: Vec<OutboxEntry>,
}

/// `sold += units` only if the result stays within `quantity`.
fn try_reserve_units(tier: &mut TicketTier, units: i32) -> bool {
    match tier.sold.checked_add(units) {
        Some(sold) if units > 0 && sold <= tier.quantity => {
            tier.sold = sold;
            true
        }
        _ => false,
    }
}

/// `sold -= units` only if that cannot go negative.
fn release_units(tier: &mut TicketTier, units: i32) -> bool {
    if units > 0 && tier.sold >= units {
        tier.sold -= units;
        true
    } else {
        false
    }
}

impl State {
    fn release(&mut self, tier_id: Uuid, count: usize) -> Result<(), StoreError> {
        let units = units(count)?;
        let tier = self
            .tiers
            .get_mut(&tier_id)
            .ok_or_else(|| StoreError::Corrupt(format!("ticket references missing tier {tier_id}")))?;
        if release_units(tier, units) {
            Ok(())
        } else {
            Err(StoreError::Corrupt(format!(
                "releasing {units} units from tier {tier_id} with only {} sold",
                tier.sold
            )))
        }
    }

    fn pending_ids(&self, correlation_id: Uuid) -> Vec<usize> {
        self.tickets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.correlation_id == correlation_id && t.payment_status == PaymentStatus::Pending)
            .map(|(index, _)| index)
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
    }

    pub fn seed_event(&self, event: Event) -> Result<(), StoreError> {
        self.lock()?.events.insert(event.id, event);
        Ok(())
    }

    pub fn seed_tier(&self, tier: TicketTier) -> Result<(), StoreError> {
        self.lock()?.tiers.insert(tier.id, tier);
        Ok(())
    }

    /// Outbox rows not yet delivered or abandoned.
    pub fn undelivered_notifications(&self) -> Result<usize, StoreError> {
        Ok(self
            .lock()?
            .outbox
            .iter()
            .filter(|entry| entry.delivered_at.is_none() && entry.abandoned_at.is_none())
            .count())
    }

    pub fn notification_errors(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()?
            .outbox
            .iter()
            .filter_map(|entry| entry.last_error.clone())
            .collect())
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self.lock()?.events.get(&event_id).cloned())
    }

    async fn find_tier(&self, tier_id: Uuid) -> Result<Option<TicketTier>, StoreError> {
        Ok(self.lock()?.tiers.get(&tier_id).cloned())
    }

    async fn find_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError> {
        Ok(self.lock()?.tickets.iter().find(|t| t.id == ticket_id).cloned())
    }

    async fn tickets_in_batch(&self, correlation_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        Ok(self
            .lock()?
            .tickets
            .iter()
            .filter(|t| t.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    async fn fan_profile(
        &self,
        purchaser_id: Uuid,
        organizer_id: Uuid,
    ) -> Result<Option<FanProfile>, StoreError> {
        Ok(self.lock()?.fans.get(&(purchaser_id, organizer_id)).cloned())
    }

    async fn reserve(&self, tier_id: Uuid, tickets: Vec<NewTicket>) -> Result<ReserveOutcome, StoreError> {
        let units = units(tickets.len())?;
        let mut state = self.lock()?;

        let mut numbers: HashSet<&str> = state.tickets.iter().map(|t| t.ticket_number.as_str()).collect();
        if let Some(duplicate) = tickets.iter().find(|new| !numbers.insert(new.ticket_number.as_str())) {
            return Err(StoreError::DuplicateTicketNumber(duplicate.ticket_number.clone()));
        }

        let Some(tier) = state.tiers.get_mut(&tier_id) else {
            return Ok(ReserveOutcome::Insufficient { available: 0 });
        };
        if !try_reserve_units(tier, units) {
            return Ok(ReserveOutcome::Insufficient {
                available: tier.available(),
            });
        }

        let reserved: Vec<Ticket> = tickets.into_iter().map(NewTicket::into_pending).collect();
        state.tickets.extend(reserved.iter().cloned());
        Ok(ReserveOutcome::Reserved(reserved))
    }

    async fn cancel_reservation(&self, correlation_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let (cancelled, kept): (Vec<Ticket>, Vec<Ticket>) = std::mem::take(&mut state.tickets)
            .into_iter()
            .partition(|t| t.correlation_id == correlation_id && t.payment_status == PaymentStatus::Pending);
        state.tickets = kept;

        for (tier_id, group) in group_by(&cancelled, |t| t.tier_id) {
            state.release(tier_id, group.len())?;
        }
        Ok(cancelled.len() as u64)
    }

    async fn attach_checkout(
        &self,
        correlation_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        for ticket in state.tickets.iter_mut().filter(|t| t.correlation_id == correlation_id) {
            ticket.checkout_request_id = Some(checkout_request_id.to_string());
            ticket.merchant_request_id = Some(merchant_request_id.to_string());
            ticket.updated_at = now;
        }
        Ok(())
    }

    async fn resolve_checkout(&self, checkout_request_id: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .lock()?
            .tickets
            .iter()
            .find(|t| t.checkout_request_id.as_deref() == Some(checkout_request_id))
            .map(|t| t.correlation_id))
    }

    async fn is_processed(&self, checkout_request_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.ledger.contains_key(checkout_request_id))
    }

    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError> {
        let mut state = self.lock()?;
        if state.ledger.contains_key(&settlement.checkout_request_id) {
            return Ok(SettleOutcome::AlreadyProcessed);
        }

        let pending = state.pending_ids(settlement.correlation_id);
        if pending.is_empty() {
            return Ok(SettleOutcome::NotPending);
        }

        // Validate every event up front so a failure leaves nothing half-applied.
        let mut completed = Vec::with_capacity(pending.len());
        for &index in &pending {
            let mut ticket = state.tickets[index].clone();
            if !state.events.contains_key(&ticket.event_id) {
                return Err(StoreError::Corrupt(format!(
                    "ticket {} references missing event {}",
                    ticket.id, ticket.event_id
                )));
            }
            ticket.payment_status = PaymentStatus::Completed;
            ticket.receipt_code = settlement.receipt_code.clone();
            ticket.updated_at = settlement.settled_at;
            completed.push(ticket);
        }

        for (&index, ticket) in pending.iter().zip(&completed) {
            state.tickets[index] = ticket.clone();
        }

        let updater = FanAggregateUpdater::new(settlement.superfan_threshold);
        let mut fans = Vec::new();
        for (event_id, group) in group_by(&completed, |t| t.event_id) {
            let organizer_id = match state.events.get_mut(&event_id) {
                Some(event) => {
                    event.tickets_sold += units(group.len())?;
                    event.revenue += group.iter().map(|t| t.amount).sum::<rust_decimal::Decimal>();
                    event.updated_at = settlement.settled_at;
                    event.organizer_id
                }
                None => continue,
            };

            for sale in group_sales(group, organizer_id) {
                let key = (sale.purchaser_id, sale.organizer_id);
                let existing = state.fans.remove(&key);
                let profile = updater.apply(existing, &sale, settlement.settled_at);
                state.fans.insert(key, profile.clone());
                fans.push(profile);
            }
        }

        for ticket in &completed {
            state.outbox.push(OutboxEntry {
                id: Uuid::new_v4(),
                ticket_id: ticket.id,
                attempts: 0,
                next_attempt_at: settlement.settled_at,
                delivered_at: None,
                abandoned_at: None,
                last_error: None,
            });
        }

        state.ledger.insert(
            settlement.checkout_request_id.clone(),
            ProcessedCallback {
                checkout_request_id: settlement.checkout_request_id.clone(),
                correlation_id: settlement.correlation_id,
                outcome: PaymentStatus::Completed.as_str().to_string(),
                receipt_code: settlement.receipt_code.clone(),
                processed_at: settlement.settled_at,
            },
        );

        Ok(SettleOutcome::Applied(Settled {
            tickets: completed,
            fans,
        }))
    }

    async fn close_batch(&self, closure: &Closure) -> Result<CloseOutcome, StoreError> {
        let mut state = self.lock()?;
        if let Some(key) = &closure.checkout_request_id {
            if state.ledger.contains_key(key) {
                return Ok(CloseOutcome::AlreadyProcessed);
            }
        }

        let pending = state.pending_ids(closure.correlation_id);
        if pending.is_empty() {
            return Ok(CloseOutcome::NotPending);
        }

        let closed: Vec<Ticket> = pending
            .iter()
            .map(|&index| {
                let mut ticket = state.tickets[index].clone();
                ticket.payment_status = closure.status;
                ticket.updated_at = closure.closed_at;
                ticket
            })
            .collect();

        // Check releases on a scratch copy first; the lock makes this atomic.
        let mut tiers = state.tiers.clone();
        for (tier_id, group) in group_by(&closed, |t| t.tier_id) {
            let units = units(group.len())?;
            let released = tiers
                .get_mut(&tier_id)
                .map(|tier| release_units(tier, units))
                .unwrap_or(false);
            if !released {
                return Err(StoreError::Corrupt(format!(
                    "cannot release {units} units from tier {tier_id}"
                )));
            }
        }
        state.tiers = tiers;

        for (&index, ticket) in pending.iter().zip(&closed) {
            state.tickets[index] = ticket.clone();
        }

        if let Some(key) = &closure.checkout_request_id {
            state.ledger.insert(
                key.clone(),
                ProcessedCallback {
                    checkout_request_id: key.clone(),
                    correlation_id: closure.correlation_id,
                    outcome: closure.status.as_str().to_string(),
                    receipt_code: None,
                    processed_at: closure.closed_at,
                },
            );
        }

        Ok(CloseOutcome::Closed(closed))
    }

    async fn pending_batches_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let state = self.lock()?;
        let mut batches: Vec<Uuid> = state
            .tickets
            .iter()
            .filter(|t| t.payment_status == PaymentStatus::Pending && t.created_at < cutoff)
            .map(|t| t.correlation_id)
            .collect();
        batches.sort();
        batches.dedup();
        Ok(batches)
    }

    async fn park_callback(
        &self,
        result: &PaymentResult,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock()?
            .parked
            .entry(result.checkout_request_id.clone())
            .or_insert_with(|| ParkedCallback {
                result: result.clone(),
                received_at,
            });
        Ok(())
    }

    async fn parked_callbacks(&self) -> Result<Vec<ParkedCallback>, StoreError> {
        let mut parked: Vec<ParkedCallback> = self.lock()?.parked.values().cloned().collect();
        parked.sort_by_key(|p| p.received_at);
        Ok(parked)
    }

    async fn discard_parked(&self, checkout_request_id: &str) -> Result<(), StoreError> {
        self.lock()?.parked.remove(checkout_request_id);
        Ok(())
    }

    async fn claim_notifications(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut state = self.lock()?;
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut due: Vec<&mut OutboxEntry> = state
            .outbox
            .iter_mut()
            .filter(|e| e.delivered_at.is_none() && e.abandoned_at.is_none() && e.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|e| e.next_attempt_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|entry| {
                entry.attempts += 1;
                entry.next_attempt_at = lease_until;
                OutboxMessage {
                    id: entry.id,
                    ticket_id: entry.ticket_id,
                    attempts: entry.attempts,
                }
            })
            .collect())
    }

    async fn mark_notification_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(entry) = self.lock()?.outbox.iter_mut().find(|e| e.id == id) {
            entry.delivered_at = Some(at);
        }
        Ok(())
    }

    async fn reschedule_notification(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        if let Some(entry) = self.lock()?.outbox.iter_mut().find(|e| e.id == id) {
            entry.next_attempt_at = next_attempt_at;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn abandon_notification(&self, id: Uuid, at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        if let Some(entry) = self.lock()?.outbox.iter_mut().find(|e| e.id == id) {
            entry.abandoned_at = Some(at);
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
