#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use rada_server::clients::{
    GatewayError, PaymentGateway, PushAcknowledgement, PushRequest, PushStatus, RecipientStatus,
    SmsTransport, TransportError,
};
use rada_server::config::EngineConfig;
use rada_server::models::{Event, FanProfile, NewTicket, PaymentResult, Ticket, TicketTier};
use rada_server::services::{
    NotificationDispatcher, PurchaseRequest, ReconciliationService, ReservationService, UnattachedCheckouts,
};
use rada_server::store::{
    CloseOutcome, Closure, InventoryStore, MemoryStore, OutboxMessage, ParkedCallback, ReserveOutcome,
    SettleOutcome, Settlement, StoreError,
};
use rada_server::utils::retry::RetryPolicy;

pub const PHONE: &str = "0712345678";

/// Accepts every push with a fresh checkout id, or rejects every push.
/// Status queries answer from `statuses`; unknown checkout ids are rejected
/// the way the gateway rejects them.
pub struct ScriptedGateway {
    reject: bool,
    delay: Duration,
    pushes: Mutex<Vec<(PushRequest, String)>>,
    statuses: Mutex<HashMap<String, PushStatus>>,
}

impl ScriptedGateway {
    pub fn accepting() -> Self {
        Self {
            reject: false,
            delay: Duration::ZERO,
            pushes: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn answer_query(&self, checkout_request_id: &str, status: PushStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(checkout_request_id.to_string(), status);
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::accepting()
        }
    }

    /// Holds each push open for `delay`, like a slow gateway.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::accepting()
        }
    }

    pub fn pushes(&self) -> Vec<(PushRequest, String)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn initiate_push(&self, request: &PushRequest) -> Result<PushAcknowledgement, GatewayError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.reject {
            return Err(GatewayError::Rejected {
                code: "500.001.1001".into(),
                message: "Unable to lock subscriber, a transaction is already in process".into(),
            });
        }

        let checkout_request_id = format!("ws_CO_{}", Uuid::new_v4().simple());
        self.pushes
            .lock()
            .unwrap()
            .push((request.clone(), checkout_request_id.clone()));
        Ok(PushAcknowledgement {
            checkout_request_id,
            merchant_request_id: format!("MR_{}", Uuid::new_v4().simple()),
            customer_message: "Success. Request accepted for processing".into(),
        })
    }

    async fn query_push(&self, checkout_request_id: &str) -> Result<PushStatus, GatewayError> {
        self.statuses
            .lock()
            .unwrap()
            .get(checkout_request_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                code: "400.002.02".into(),
                message: "Bad Request - Invalid CheckoutRequestID".into(),
            })
    }
}

fn outage() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

/// A `MemoryStore` whose settlements and checkout attachments can be made to
/// fail a number of times, like a database that briefly goes away.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    settle_failures: AtomicUsize,
    attach_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_settles(&self, times: usize) {
        self.settle_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_attaches(&self, times: usize) {
        self.attach_failures.store(times, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Deref for FlakyStore {
    type Target = MemoryStore;

    fn deref(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl InventoryStore for FlakyStore {
    async fn find_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        self.inner.find_event(event_id).await
    }

    async fn find_tier(&self, tier_id: Uuid) -> Result<Option<TicketTier>, StoreError> {
        self.inner.find_tier(tier_id).await
    }

    async fn find_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, StoreError> {
        self.inner.find_ticket(ticket_id).await
    }

    async fn tickets_in_batch(&self, correlation_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        self.inner.tickets_in_batch(correlation_id).await
    }

    async fn fan_profile(&self, purchaser_id: Uuid, organizer_id: Uuid) -> Result<Option<FanProfile>, StoreError> {
        self.inner.fan_profile(purchaser_id, organizer_id).await
    }

    async fn reserve(&self, tier_id: Uuid, tickets: Vec<NewTicket>) -> Result<ReserveOutcome, StoreError> {
        self.inner.reserve(tier_id, tickets).await
    }

    async fn cancel_reservation(&self, correlation_id: Uuid) -> Result<u64, StoreError> {
        self.inner.cancel_reservation(correlation_id).await
    }

    async fn attach_checkout(
        &self,
        correlation_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<(), StoreError> {
        if Self::trip(&self.attach_failures) {
            return Err(outage());
        }
        self.inner
            .attach_checkout(correlation_id, checkout_request_id, merchant_request_id)
            .await
    }

    async fn resolve_checkout(&self, checkout_request_id: &str) -> Result<Option<Uuid>, StoreError> {
        self.inner.resolve_checkout(checkout_request_id).await
    }

    async fn is_processed(&self, checkout_request_id: &str) -> Result<bool, StoreError> {
        self.inner.is_processed(checkout_request_id).await
    }

    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError> {
        if Self::trip(&self.settle_failures) {
            return Err(outage());
        }
        self.inner.settle(settlement).await
    }

    async fn close_batch(&self, closure: &Closure) -> Result<CloseOutcome, StoreError> {
        self.inner.close_batch(closure).await
    }

    async fn pending_batches_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        self.inner.pending_batches_before(cutoff).await
    }

    async fn park_callback(&self, result: &PaymentResult, received_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.park_callback(result, received_at).await
    }

    async fn parked_callbacks(&self) -> Result<Vec<ParkedCallback>, StoreError> {
        self.inner.parked_callbacks().await
    }

    async fn discard_parked(&self, checkout_request_id: &str) -> Result<(), StoreError> {
        self.inner.discard_parked(checkout_request_id).await
    }

    async fn claim_notifications(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        self.inner.claim_notifications(now, lease_until, limit).await
    }

    async fn mark_notification_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.mark_notification_delivered(id, at).await
    }

    async fn reschedule_notification(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        self.inner.reschedule_notification(id, next_attempt_at, error).await
    }

    async fn abandon_notification(&self, id: Uuid, at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        self.inner.abandon_notification(id, at, error).await
    }
}

/// Records every send. Fails while `failures_left` is above zero.
pub struct RecordingTransport {
    max_recipients: usize,
    failures_left: AtomicUsize,
    sent: Mutex<Vec<(Vec<String>, String)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::with_limit(100)
    }

    pub fn with_limit(max_recipients: usize) -> Self {
        Self {
            max_recipients,
            failures_left: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(times: usize) -> Self {
        let transport = Self::new();
        transport.failures_left.store(times, Ordering::SeqCst);
        transport
    }

    pub fn sent(&self) -> Vec<(Vec<String>, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsTransport for RecordingTransport {
    fn max_recipients(&self) -> usize {
        self.max_recipients
    }

    async fn send(&self, recipients: &[String], message: &str) -> Result<Vec<RecipientStatus>, TransportError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Unreachable("connection reset".into()));
        }

        self.sent
            .lock()
            .unwrap()
            .push((recipients.to_vec(), message.to_string()));
        Ok(recipients
            .iter()
            .map(|number| RecipientStatus {
                number: number.clone(),
                accepted: true,
                status: "Success".into(),
            })
            .collect())
    }
}

pub struct Harness {
    pub store: Arc<FlakyStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub transport: Arc<RecordingTransport>,
    pub notifier: Arc<NotificationDispatcher>,
    pub reservations: Arc<ReservationService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub unattached: Arc<UnattachedCheckouts>,
    pub config: EngineConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(ScriptedGateway::accepting(), RecordingTransport::new())
    }

    pub fn with(gateway: ScriptedGateway, transport: RecordingTransport) -> Self {
        let config = EngineConfig::default();
        let store = Arc::new(FlakyStore::default());
        let gateway = Arc::new(gateway);
        let transport = Arc::new(transport);
        let unattached = Arc::new(UnattachedCheckouts::default());
        let dyn_store: Arc<dyn InventoryStore> = store.clone();

        let notifier = Arc::new(
            NotificationDispatcher::new(dyn_store.clone(), transport.clone(), &config).with_backoff(RetryPolicy {
                max_retries: 0,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                multiplier: 1.0,
            }),
        );
        let reconciliation = Arc::new(
            ReconciliationService::new(dyn_store.clone(), config.clone())
                .with_notifier(notifier.clone())
                .with_gateway(gateway.clone())
                .with_unattached_checkouts(unattached.clone()),
        );
        let reservations = Arc::new(
            ReservationService::new(dyn_store, gateway.clone(), config.clone())
                .with_store_retry_policy(RetryPolicy {
                    max_retries: 1,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    multiplier: 1.0,
                })
                .with_unattached_checkouts(unattached.clone()),
        );

        Self {
            store,
            gateway,
            transport,
            notifier,
            reservations,
            reconciliation,
            unattached,
            config,
        }
    }

    /// A published event with one tier of `quantity` seats at `price`.
    pub fn seed(&self, price: i64, quantity: i32) -> (Event, TicketTier) {
        let event = Event::new(Uuid::new_v4(), "Sauti Sol Live", 500);
        let tier = TicketTier::new(event.id, "Regular", Decimal::from(price), quantity);
        self.store.seed_event(event.clone()).unwrap();
        self.store.seed_tier(tier.clone()).unwrap();
        (event, tier)
    }

    pub async fn tier(&self, tier_id: Uuid) -> TicketTier {
        self.store.find_tier(tier_id).await.unwrap().unwrap()
    }

    pub async fn event(&self, event_id: Uuid) -> Event {
        self.store.find_event(event_id).await.unwrap().unwrap()
    }
}

pub fn purchase(event: &Event, tier: &TicketTier, purchaser_id: Uuid, quantity: i32) -> PurchaseRequest {
    PurchaseRequest {
        event_id: event.id,
        tier_id: tier.id,
        purchaser_id,
        phone_number: PHONE.to_string(),
        quantity,
    }
}

pub fn success_callback(checkout_request_id: &str, amount: i64) -> PaymentResult {
    PaymentResult {
        checkout_request_id: checkout_request_id.to_string(),
        merchant_request_id: None,
        result_code: 0,
        result_desc: "The service request is processed successfully.".into(),
        receipt_code: Some("NLJ7RT61SV".into()),
        phone_number: Some("254712345678".into()),
        amount: Some(Decimal::from(amount)),
    }
}

pub fn failure_callback(checkout_request_id: &str) -> PaymentResult {
    PaymentResult {
        checkout_request_id: checkout_request_id.to_string(),
        merchant_request_id: None,
        result_code: 1032,
        result_desc: "Request cancelled by user".into(),
        receipt_code: None,
        phone_number: None,
        amount: None,
    }
}
