//! Purchase orchestration: reserve, initiate payment, compensate on failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clients::{PaymentGateway, PushRequest};
use crate::config::EngineConfig;
use crate::models::NewTicket;
use crate::services::credentials::{ticket_number, VerificationPayload};
use crate::store::{InventoryStore, ReserveOutcome, StoreError};
use crate::utils::error::AppError;
use crate::utils::phone;
use crate::utils::retry::{retry_with_backoff, RetryPolicy};

/// Fresh ticket numbers are drawn again when one collides.
const TICKET_NUMBER_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub event_id: Uuid,
    pub tier_id: Uuid,
    pub purchaser_id: Uuid,
    pub phone_number: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub ticket_ids: Vec<Uuid>,
    pub correlation_id: Uuid,
    pub checkout_request_id: String,
    pub amount: Decimal,
    pub customer_message: String,
}

/// A gateway checkout id that could not be written to its batch after the
/// push went out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCheckout {
    pub correlation_id: Uuid,
    pub checkout_request_id: String,
    pub merchant_request_id: String,
}

/// Checkout ids waiting to be attached. Shared with the reconciliation sweep,
/// which retries them before it replays or expires anything.
#[derive(Debug, Default)]
pub struct UnattachedCheckouts {
    entries: Mutex<HashMap<Uuid, PendingCheckout>>,
}

impl UnattachedCheckouts {
    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, PendingCheckout>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, checkout: PendingCheckout) {
        self.entries().insert(checkout.correlation_id, checkout);
    }

    pub fn remove(&self, correlation_id: Uuid) -> Option<PendingCheckout> {
        self.entries().remove(&correlation_id)
    }

    pub fn get(&self, correlation_id: Uuid) -> Option<PendingCheckout> {
        self.entries().get(&correlation_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<PendingCheckout> {
        self.entries().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ReservationService {
    store: Arc<dyn InventoryStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: EngineConfig,
    store_retry: RetryPolicy,
    unattached: Arc<UnattachedCheckouts>,
}

impl ReservationService {
    pub fn new(store: Arc<dyn InventoryStore>, gateway: Arc<dyn PaymentGateway>, config: EngineConfig) -> Self {
        Self {
            store,
            gateway,
            config,
            store_retry: RetryPolicy::default(),
            unattached: Arc::new(UnattachedCheckouts::default()),
        }
    }

    /// Backoff for store writes that must not be dropped once the push is
    /// decided: compensation and checkout attachment.
    pub fn with_store_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn with_unattached_checkouts(mut self, unattached: Arc<UnattachedCheckouts>) -> Self {
        self.unattached = unattached;
        self
    }

    pub async fn purchase(&self, request: PurchaseRequest) -> Result<PurchaseReceipt, AppError> {
        if request.quantity < 1 || request.quantity > self.config.max_tickets_per_purchase {
            return Err(AppError::ValidationError(format!(
                "quantity must be between 1 and {}",
                self.config.max_tickets_per_purchase
            )));
        }
        let msisdn = phone::to_msisdn(&request.phone_number)
            .map_err(|e| AppError::ValidationError(e.to_string()))?;

        let event = self
            .store
            .find_event(request.event_id)
            .await?
            .filter(|event| event.is_published)
            .ok_or_else(|| AppError::NotFound(format!("event {} not found", request.event_id)))?;
        let tier = self
            .store
            .find_tier(request.tier_id)
            .await?
            .filter(|tier| tier.event_id == event.id)
            .ok_or_else(|| AppError::NotFound(format!("ticket tier {} not found", request.tier_id)))?;

        let now = Utc::now();
        if !tier.is_on_sale(now) {
            return Err(AppError::TierInactive(format!(
                "tickets for '{}' are not on sale",
                tier.name
            )));
        }

        let correlation_id = Uuid::new_v4();
        let mut attempt = 0;
        let tickets = loop {
            attempt += 1;
            let batch: Vec<NewTicket> = (0..request.quantity)
                .map(|_| {
                    let id = Uuid::new_v4();
                    let number = ticket_number(now);
                    NewTicket {
                        id,
                        event_id: event.id,
                        tier_id: tier.id,
                        purchaser_id: request.purchaser_id,
                        phone_number: msisdn.clone(),
                        amount: tier.price,
                        verification_payload: VerificationPayload::new(id, &number, now).encode(),
                        ticket_number: number,
                        correlation_id,
                        created_at: now,
                    }
                })
                .collect();

            match self.store.reserve(tier.id, batch).await {
                Ok(ReserveOutcome::Reserved(tickets)) => break tickets,
                Ok(ReserveOutcome::Insufficient { available }) => {
                    info!(tier_id = %tier.id, requested = request.quantity, available, "Reservation refused");
                    return Err(AppError::InsufficientInventory(format!(
                        "only {} tickets left for '{}'",
                        available.max(0),
                        tier.name
                    )));
                }
                Err(StoreError::DuplicateTicketNumber(number)) if attempt < TICKET_NUMBER_ATTEMPTS => {
                    warn!(%number, attempt, "Ticket number collision, drawing new numbers");
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(
            %correlation_id,
            tier_id = %tier.id,
            quantity = request.quantity,
            "Reserved tickets"
        );

        let amount = tier.price * Decimal::from(request.quantity);
        let push = PushRequest {
            amount,
            phone_number: msisdn,
            account_reference: correlation_id.to_string(),
            description: format!("{} - {}", event.title, tier.name),
        };

        let acknowledgement = match self.gateway.initiate_push(&push).await {
            Ok(ack) => ack,
            Err(gateway_error) => {
                warn!(%correlation_id, error = %gateway_error, "Payment initiation failed, releasing reservation");
                self.compensate(correlation_id).await?;
                return Err(gateway_error.into());
            }
        };

        let attached = retry_with_backoff(&self.store_retry, || {
            self.store.attach_checkout(
                correlation_id,
                &acknowledgement.checkout_request_id,
                &acknowledgement.merchant_request_id,
            )
        })
        .await;
        if let Err(e) = attached {
            // The customer is already being prompted, so the purchase stands.
            error!(
                %correlation_id,
                checkout_request_id = %acknowledgement.checkout_request_id,
                error = %e,
                "Failed to attach gateway checkout id, handing it to the sweep"
            );
            self.unattached.insert(PendingCheckout {
                correlation_id,
                checkout_request_id: acknowledgement.checkout_request_id.clone(),
                merchant_request_id: acknowledgement.merchant_request_id.clone(),
            });
        }

        info!(
            %correlation_id,
            checkout_request_id = %acknowledgement.checkout_request_id,
            %amount,
            "Payment initiated"
        );

        Ok(PurchaseReceipt {
            ticket_ids: tickets.iter().map(|t| t.id).collect(),
            correlation_id,
            checkout_request_id: acknowledgement.checkout_request_id,
            amount,
            customer_message: acknowledgement.customer_message,
        })
    }

    async fn compensate(&self, correlation_id: Uuid) -> Result<(), AppError> {
        match retry_with_backoff(&self.store_retry, || self.store.cancel_reservation(correlation_id)).await {
            Ok(removed) => {
                info!(%correlation_id, removed, "Reservation released");
                Ok(())
            }
            Err(e) => {
                error!(%correlation_id, error = %e, "Failed to release reservation after gateway failure");
                Err(e.into())
            }
        }
    }
}
