//! Ticket confirmations through the notification outbox, plus organizer
//! broadcasts chunked to the transport's recipient limit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clients::{RecipientStatus, SmsTransport, TransportError};
use crate::config::EngineConfig;
use crate::models::Ticket;
use crate::store::{InventoryStore, OutboxMessage, StoreError};
use crate::utils::retry::RetryPolicy;

const CLAIM_BATCH_SIZE: i64 = 50;
const CLAIM_LEASE: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("recipient rejected with status {0}")]
    Rejected(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub accepted: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

pub fn ticket_message(event_title: &str, ticket_number: &str, base_url: &str) -> String {
    format!(
        "Your ticket for {event_title}\nTicket #: {ticket_number}\nShow QR code at entry: {}/{ticket_number}\n\nPowered by Rada",
        base_url.trim_end_matches('/')
    )
}

pub fn broadcast_message(message: &str, organizer_name: Option<&str>) -> String {
    match organizer_name {
        Some(name) => format!("{name}: {message}\n\nReply STOP to unsubscribe"),
        None => message.to_string(),
    }
}

pub struct NotificationDispatcher {
    store: Arc<dyn InventoryStore>,
    transport: Arc<dyn SmsTransport>,
    ticket_base_url: String,
    max_attempts: i32,
    backoff: RetryPolicy,
    interval: Duration,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn InventoryStore>, transport: Arc<dyn SmsTransport>, config: &EngineConfig) -> Self {
        Self {
            store,
            transport,
            ticket_base_url: config.ticket_base_url.clone(),
            max_attempts: config.notification_max_attempts,
            backoff: RetryPolicy {
                max_retries: 0,
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30 * 60),
                multiplier: 2.0,
            },
            interval: config.notification_interval,
        }
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn send_ticket(&self, ticket: &Ticket, event_title: &str) -> Result<(), DeliveryError> {
        let message = ticket_message(event_title, &ticket.ticket_number, &self.ticket_base_url);
        let statuses = self
            .transport
            .send(std::slice::from_ref(&ticket.phone_number), &message)
            .await?;

        match statuses.iter().find(|s| !s.accepted) {
            Some(rejected) => Err(DeliveryError::Rejected(rejected.status.clone())),
            None if statuses.is_empty() => Err(DeliveryError::Rejected("no status reported".to_string())),
            None => Ok(()),
        }
    }

    /// One pass over the due outbox rows.
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> Result<DeliveryReport, StoreError> {
        let lease_until = now + chrono::Duration::from_std(CLAIM_LEASE).unwrap_or_else(|_| chrono::Duration::minutes(2));
        let claimed = self
            .store
            .claim_notifications(now, lease_until, CLAIM_BATCH_SIZE)
            .await?;

        let mut report = DeliveryReport::default();
        for message in claimed {
            match self.deliver(&message).await {
                Ok(()) => {
                    self.store.mark_notification_delivered(message.id, Utc::now()).await?;
                    debug!(ticket_id = %message.ticket_id, "Ticket confirmation sent");
                    report.delivered += 1;
                }
                Err(reason) if message.attempts >= self.max_attempts => {
                    error!(
                        ticket_id = %message.ticket_id,
                        attempts = message.attempts,
                        error = %reason,
                        "Giving up on ticket confirmation"
                    );
                    self.store
                        .abandon_notification(message.id, Utc::now(), &reason)
                        .await?;
                    report.abandoned += 1;
                }
                Err(reason) => {
                    let attempt = usize::try_from(message.attempts.max(1) - 1).unwrap_or(0);
                    let delay = chrono::Duration::from_std(self.backoff.delay_for_attempt(attempt))
                        .unwrap_or_else(|_| chrono::Duration::minutes(30));
                    warn!(
                        ticket_id = %message.ticket_id,
                        attempts = message.attempts,
                        error = %reason,
                        retry_in_secs = delay.num_seconds(),
                        "Ticket confirmation failed, rescheduling"
                    );
                    self.store
                        .reschedule_notification(message.id, Utc::now() + delay, &reason)
                        .await?;
                    report.rescheduled += 1;
                }
            }
        }
        Ok(report)
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<(), String> {
        let ticket = self
            .store
            .find_ticket(message.ticket_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("ticket {} no longer exists", message.ticket_id))?;
        let title = self
            .store
            .find_event(ticket.event_id)
            .await
            .map_err(|e| e.to_string())?
            .map(|event| event.title)
            .ok_or_else(|| format!("event {} no longer exists", ticket.event_id))?;

        self.send_ticket(&ticket, &title).await.map_err(|e| e.to_string())
    }

    /// Send one message to many recipients. Chunks go out concurrently and a
    /// failed chunk does not stop the others.
    pub async fn broadcast(
        &self,
        recipients: &[String],
        message: &str,
        organizer_name: Option<&str>,
    ) -> BroadcastReport {
        let body = broadcast_message(message, organizer_name);
        let chunk_size = self.transport.max_recipients().max(1);

        let sends = recipients
            .chunks(chunk_size)
            .map(|chunk| self.transport.send(chunk, &body));
        let results: Vec<Result<Vec<RecipientStatus>, TransportError>> = join_all(sends).await;

        let mut report = BroadcastReport {
            recipients: recipients.len(),
            batches: results.len(),
            ..BroadcastReport::default()
        };
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(statuses) => report.accepted += statuses.iter().filter(|s| s.accepted).count(),
                Err(e) => {
                    warn!(batch = index, error = %e, "Broadcast batch failed");
                    report.failed_batches += 1;
                }
            }
        }

        info!(
            recipients = report.recipients,
            accepted = report.accepted,
            batches = report.batches,
            failed_batches = report.failed_batches,
            "Broadcast finished"
        );
        report
    }

    /// Periodic delivery passes until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "Notification worker started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.deliver_due(Utc::now()).await {
                        error!(error = %e, "Notification delivery pass failed");
                    }
                }
            }
        }

        info!("Notification worker stopped");
    }
}
