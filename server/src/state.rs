use std::sync::Arc;

use crate::services::{ReconciliationService, ReservationService};
use crate::store::InventoryStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InventoryStore>,
    pub reservations: Arc<ReservationService>,
    pub reconciliation: Arc<ReconciliationService>,
}
