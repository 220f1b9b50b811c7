pub mod credentials;
pub mod fans;
pub mod notifications;
pub mod reconciliation;
pub mod reservation;

pub use fans::FanAggregateUpdater;
pub use notifications::{BroadcastReport, DeliveryReport, NotificationDispatcher};
pub use reconciliation::{CallbackDisposition, ReconciliationService, SweepReport};
pub use reservation::{PendingCheckout, PurchaseReceipt, PurchaseRequest, ReservationService, UnattachedCheckouts};
