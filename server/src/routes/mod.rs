use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, create_security_headers_layer};
use crate::handlers::{health_check, mpesa, purchases, tickets};
use crate::state::AppState;

pub fn create_routes(state: AppState, production: bool, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/tickets/purchase", post(purchases::purchase))
        .route("/api/purchases/:correlation_id", get(purchases::purchase_status))
        .route("/api/tickets/verify", post(tickets::verify))
        .route("/api/mpesa/callback", post(mpesa::callback))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(create_security_headers_layer(production))
        .layer(create_cors_layer(allowed_origins))
}
