mod app;
mod config;
mod db;
mod handlers;
mod models;
mod optimizer;
mod service;
mod state;
mod store;
mod stream;

use routeflow_common::{bind_listener, init_tracing, shutdown_signal};
use std::sync::Arc;

use crate::config::{StatusServiceConfig, StoreBackend};
use crate::db::PostgresStatusStore;
use crate::optimizer::NextBillionClient;
use crate::state::AppState;
use crate::store::{MemoryStatusStore, StatusStore};

#[tokio::main]
async fn main() {
    let _guards = init_tracing("status-service");
    let config = StatusServiceConfig::from_env();

    let store: Arc<dyn StatusStore> = match &config.store {
        StoreBackend::Postgres { database_url } => Arc::new(
            PostgresStatusStore::connect(database_url)
                .await
                .expect("connect status store"),
        ),
        StoreBackend::Memory => {
            tracing::warn!("DATABASE_URL not set, status records are kept in memory only");
            Arc::new(MemoryStatusStore::new())
        }
    };

    if config.api_key.is_none() {
        tracing::warn!("NEXTBILLION_API_KEY not set, fallback polling is disabled");
    }
    let source = NextBillionClient::new(
        &config.api_base,
        config.api_key.clone(),
        config.fallback_timeout,
    )
    .expect("build optimization api client");

    let state = AppState {
        store,
        source: Arc::new(source),
        stream: config.stream.clone(),
    };

    let app = app::build_router(state);
    let listener = bind_listener(config.port).await.expect("bind listener");
    tracing::info!(port = config.port, "status service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("serve");
}
