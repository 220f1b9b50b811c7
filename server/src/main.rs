use std::sync::Arc;

use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use rada_server::clients::{AfricasTalkingClient, MpesaClient};
use rada_server::config::Config;
use rada_server::routes::create_routes;
use rada_server::services::{
    NotificationDispatcher, ReconciliationService, ReservationService, UnattachedCheckouts,
};
use rada_server::state::AppState;
use rada_server::store::{InventoryStore, PgInventoryStore};

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rada_server=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().expect("Invalid configuration");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Successfully connected to database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    tracing::info!("Migrations run successfully");

    let store: Arc<dyn InventoryStore> = Arc::new(PgInventoryStore::new(pool));
    let gateway = Arc::new(MpesaClient::new(config.mpesa.clone()).expect("Failed to build M-Pesa client"));
    let transport =
        Arc::new(AfricasTalkingClient::new(config.sms.clone()).expect("Failed to build SMS client"));

    let notifier = Arc::new(NotificationDispatcher::new(store.clone(), transport, &config.engine));
    let unattached = Arc::new(UnattachedCheckouts::default());
    let reconciliation = Arc::new(
        ReconciliationService::new(store.clone(), config.engine.clone())
            .with_notifier(notifier.clone())
            .with_gateway(gateway.clone())
            .with_unattached_checkouts(unattached.clone()),
    );
    let reservations = Arc::new(
        ReservationService::new(store.clone(), gateway, config.engine.clone()).with_unattached_checkouts(unattached),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(reconciliation.clone().run_sweeper(shutdown_rx.clone()));
    let worker = tokio::spawn(notifier.run(shutdown_rx));

    let state = AppState {
        store,
        reservations,
        reconciliation,
    };
    let app: Router = create_routes(state, config.production, &config.cors_allowed_origins);

    tracing::info!("🚀 Server running at http://{}", config.bind_addr);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, worker);
    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
