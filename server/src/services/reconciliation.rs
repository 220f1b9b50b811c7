//! Applies gateway payment results to purchase batches exactly once, and
//! sweeps batches whose result never arrived.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clients::{PaymentGateway, PushStatus};
use crate::config::EngineConfig;
use crate::models::{PaymentResult, PaymentStatus};
use crate::services::notifications::NotificationDispatcher;
use crate::services::reservation::UnattachedCheckouts;
use crate::store::{CloseOutcome, Closure, InventoryStore, SettleOutcome, Settlement};
use crate::utils::error::AppError;

/// Parked callbacks that still resolve to nothing after this long are dropped.
const PARKED_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackDisposition {
    Completed { correlation_id: Uuid, tickets: usize },
    Failed { correlation_id: Uuid, tickets: usize },
    /// Already in the ledger; nothing was done.
    Duplicate,
    /// Not applied yet, either because no batch carries this checkout id or
    /// because applying it failed. Kept for the sweep.
    Parked,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub attached: usize,
    pub replayed: usize,
    pub discarded: usize,
    /// Batches settled or failed from a gateway status query.
    pub recovered: usize,
    /// Overdue batches left PENDING because the gateway still reports the prompt open.
    pub deferred: usize,
    pub expired_batches: usize,
    pub released_tickets: usize,
}

enum Expiry {
    Expired(usize),
    Recovered,
    Deferred,
    Untouched,
}

pub struct ReconciliationService {
    store: Arc<dyn InventoryStore>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    notifier: Option<Arc<NotificationDispatcher>>,
    unattached: Arc<UnattachedCheckouts>,
    config: EngineConfig,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn InventoryStore>, config: EngineConfig) -> Self {
        Self {
            store,
            gateway: None,
            notifier: None,
            unattached: Arc::new(UnattachedCheckouts::default()),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Overdue batches are checked with the gateway before they expire.
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_unattached_checkouts(mut self, unattached: Arc<UnattachedCheckouts>) -> Self {
        self.unattached = unattached;
        self
    }

    /// Apply a gateway callback. Internal failures park the result for the
    /// sweep instead of losing it; only a stale callback is reported as an error.
    pub async fn handle_callback(&self, result: PaymentResult) -> Result<CallbackDisposition, AppError> {
        match self.route_callback(&result).await {
            Err(e) if !matches!(e, AppError::StaleCallback(_)) => {
                e.log();
                let checkout_request_id = result.checkout_request_id.as_str();
                match self.store.park_callback(&result, Utc::now()).await {
                    Ok(()) => {
                        warn!(%checkout_request_id, "Callback could not be applied, parked for retry");
                        Ok(CallbackDisposition::Parked)
                    }
                    Err(park_error) => {
                        error!(%checkout_request_id, error = %park_error, "Failed to park callback");
                        Err(e)
                    }
                }
            }
            other => other,
        }
    }

    async fn route_callback(&self, result: &PaymentResult) -> Result<CallbackDisposition, AppError> {
        let checkout_request_id = result.checkout_request_id.as_str();
        if self.store.is_processed(checkout_request_id).await? {
            warn!(%checkout_request_id, "Duplicate callback ignored");
            return Ok(CallbackDisposition::Duplicate);
        }

        let Some(correlation_id) = self.store.resolve_checkout(checkout_request_id).await? else {
            warn!(%checkout_request_id, result_code = result.result_code, "Callback for unknown checkout parked");
            self.store.park_callback(result, Utc::now()).await?;
            return Ok(CallbackDisposition::Parked);
        };

        self.apply(correlation_id, result, Utc::now()).await
    }

    async fn apply(
        &self,
        correlation_id: Uuid,
        result: &PaymentResult,
        now: DateTime<Utc>,
    ) -> Result<CallbackDisposition, AppError> {
        let checkout_request_id = result.checkout_request_id.as_str();

        if !result.is_success() {
            let closure = Closure {
                correlation_id,
                status: PaymentStatus::Failed,
                checkout_request_id: Some(result.checkout_request_id.clone()),
                closed_at: now,
            };
            return match self.store.close_batch(&closure).await? {
                CloseOutcome::Closed(tickets) => {
                    info!(
                        %correlation_id,
                        %checkout_request_id,
                        result_code = result.result_code,
                        result_desc = %result.result_desc,
                        released = tickets.len(),
                        "Payment failed, reservation released"
                    );
                    Ok(CallbackDisposition::Failed {
                        correlation_id,
                        tickets: tickets.len(),
                    })
                }
                CloseOutcome::AlreadyProcessed => Ok(CallbackDisposition::Duplicate),
                CloseOutcome::NotPending => Err(AppError::StaleCallback(format!(
                    "batch {correlation_id} is no longer pending"
                ))),
            };
        }

        let settlement = Settlement {
            correlation_id,
            checkout_request_id: result.checkout_request_id.clone(),
            receipt_code: result.receipt_code.clone(),
            settled_at: now,
            superfan_threshold: self.config.superfan_threshold,
        };
        let settled = match self.store.settle(&settlement).await? {
            SettleOutcome::Applied(settled) => settled,
            SettleOutcome::AlreadyProcessed => return Ok(CallbackDisposition::Duplicate),
            SettleOutcome::NotPending => {
                return Err(AppError::StaleCallback(format!(
                    "batch {correlation_id} is no longer pending"
                )))
            }
        };

        let total: Decimal = settled.tickets.iter().map(|t| t.amount).sum();
        if let Some(paid) = result.amount {
            if paid != total {
                warn!(%correlation_id, %paid, expected = %total, "Paid amount differs from batch total");
            }
        }
        info!(
            %correlation_id,
            %checkout_request_id,
            receipt_code = result.receipt_code.as_deref().unwrap_or_default(),
            tickets = settled.tickets.len(),
            amount = %total,
            "Payment confirmed"
        );

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.deliver_due(now).await {
                error!(%correlation_id, error = %e, "Notification pass after settlement failed");
            }
        }

        Ok(CallbackDisposition::Completed {
            correlation_id,
            tickets: settled.tickets.len(),
        })
    }

    /// Attach checkout ids left over from failed purchases, replay parked
    /// callbacks that have become resolvable, then settle or expire PENDING
    /// batches older than the reservation window.
    ///
    /// A failure on one row is logged and the row is left for the next pass;
    /// it never stops the passes that follow.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();

        for pending in self.unattached.snapshot() {
            match self
                .store
                .attach_checkout(
                    pending.correlation_id,
                    &pending.checkout_request_id,
                    &pending.merchant_request_id,
                )
                .await
            {
                Ok(()) => {
                    self.unattached.remove(pending.correlation_id);
                    info!(
                        correlation_id = %pending.correlation_id,
                        checkout_request_id = %pending.checkout_request_id,
                        "Attached gateway checkout id"
                    );
                    report.attached += 1;
                }
                Err(e) => warn!(
                    correlation_id = %pending.correlation_id,
                    error = %e,
                    "Checkout id still cannot be attached"
                ),
            }
        }

        // Batches whose parked result could not be applied yet must not expire.
        let mut held = HashSet::new();
        let retention = ChronoDuration::hours(PARKED_RETENTION_HOURS);
        for parked in self.store.parked_callbacks().await? {
            let checkout_request_id = parked.result.checkout_request_id.as_str();
            let overdue = now - parked.received_at > retention;

            let resolved = match self.store.resolve_checkout(checkout_request_id).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    error!(%checkout_request_id, error = %e, "Failed to resolve parked callback");
                    continue;
                }
            };

            match resolved {
                Some(correlation_id) => match self.apply(correlation_id, &parked.result, now).await {
                    Ok(_) => {
                        report.replayed += 1;
                        self.forget_parked(checkout_request_id).await;
                    }
                    Err(AppError::StaleCallback(reason)) => {
                        warn!(%checkout_request_id, %reason, "Parked callback is stale");
                        self.forget_parked(checkout_request_id).await;
                    }
                    Err(e) if overdue => {
                        error!(
                            %checkout_request_id,
                            %correlation_id,
                            error = %e,
                            received_at = %parked.received_at,
                            "Giving up on parked callback that keeps failing"
                        );
                        self.forget_parked(checkout_request_id).await;
                        report.discarded += 1;
                    }
                    Err(e) => {
                        error!(
                            %checkout_request_id,
                            %correlation_id,
                            error = %e,
                            "Replaying parked callback failed, keeping it"
                        );
                        held.insert(correlation_id);
                    }
                },
                None if overdue => {
                    error!(
                        %checkout_request_id,
                        received_at = %parked.received_at,
                        "Discarding callback that never matched a purchase"
                    );
                    self.forget_parked(checkout_request_id).await;
                    report.discarded += 1;
                }
                None => {}
            }
        }

        let window = ChronoDuration::from_std(self.config.reservation_expiry)
            .map_err(|e| AppError::InternalServerError(format!("reservation expiry out of range: {e}")))?;
        let cutoff = now - window;
        // An open prompt holds a batch for at most one more window.
        let deadline = cutoff - window;

        for correlation_id in self.store.pending_batches_before(cutoff).await? {
            if held.contains(&correlation_id) {
                continue;
            }
            match self.settle_or_expire(correlation_id, now, deadline).await {
                Ok(Expiry::Expired(released)) => {
                    report.expired_batches += 1;
                    report.released_tickets += released;
                }
                Ok(Expiry::Recovered) => report.recovered += 1,
                Ok(Expiry::Deferred) => report.deferred += 1,
                Ok(Expiry::Untouched) => {}
                Err(e) => error!(%correlation_id, error = %e, "Failed to close overdue batch"),
            }
        }

        Ok(report)
    }

    async fn forget_parked(&self, checkout_request_id: &str) {
        if let Err(e) = self.store.discard_parked(checkout_request_id).await {
            error!(%checkout_request_id, error = %e, "Failed to remove parked callback");
        }
    }

    /// Ask the gateway about an overdue batch and apply its answer; expire
    /// the batch when there is no answer to wait for.
    async fn settle_or_expire(
        &self,
        correlation_id: Uuid,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<Expiry, AppError> {
        let tickets = self.store.tickets_in_batch(correlation_id).await?;
        let checkout_request_id = tickets
            .iter()
            .find_map(|t| t.checkout_request_id.clone())
            .or_else(|| self.unattached.get(correlation_id).map(|p| p.checkout_request_id));

        if let (Some(gateway), Some(checkout_request_id)) = (&self.gateway, checkout_request_id) {
            match gateway.query_push(&checkout_request_id).await {
                Ok(PushStatus::Finished(result)) => {
                    return match self.apply(correlation_id, &result, now).await {
                        Ok(disposition) => {
                            info!(%correlation_id, %checkout_request_id, ?disposition, "Overdue batch resolved by status query");
                            self.unattached.remove(correlation_id);
                            Ok(Expiry::Recovered)
                        }
                        Err(AppError::StaleCallback(_)) => Ok(Expiry::Untouched),
                        Err(e) => Err(e),
                    };
                }
                Ok(PushStatus::Processing) => {
                    let opened = tickets.iter().map(|t| t.created_at).min();
                    if opened.map_or(false, |opened| opened >= deadline) {
                        info!(%correlation_id, %checkout_request_id, "Payment prompt still open, expiry deferred");
                        return Ok(Expiry::Deferred);
                    }
                    warn!(%correlation_id, %checkout_request_id, "Payment prompt still open past the deadline");
                }
                Err(e) => {
                    warn!(%correlation_id, %checkout_request_id, error = %e, "Status query failed, expiring batch");
                }
            }
        }

        let closure = Closure {
            correlation_id,
            status: PaymentStatus::Expired,
            checkout_request_id: None,
            closed_at: now,
        };
        match self.store.close_batch(&closure).await? {
            CloseOutcome::Closed(tickets) => {
                info!(%correlation_id, released = tickets.len(), "Reservation expired");
                self.unattached.remove(correlation_id);
                Ok(Expiry::Expired(tickets.len()))
            }
            CloseOutcome::AlreadyProcessed | CloseOutcome::NotPending => Ok(Expiry::Untouched),
        }
    }

    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        info!(interval_secs = self.config.sweep_interval.as_secs(), "Reservation sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(
                                attached = report.attached,
                                replayed = report.replayed,
                                discarded = report.discarded,
                                recovered = report.recovered,
                                deferred = report.deferred,
                                expired_batches = report.expired_batches,
                                released_tickets = report.released_tickets,
                                "Sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            }
        }

        info!("Reservation sweeper stopped");
    }
}
