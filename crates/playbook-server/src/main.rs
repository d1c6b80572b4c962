// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Playbook Server - HTTP control surface for the orchestration engine.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use playbook_core::config::Config;
use playbook_core::engine::WorkflowEngine;
use playbook_core::store::{PostgresStore, Store};
use playbook_server::external_http::HttpApiClient;
use playbook_server::{AppState, app};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("playbook_server=info".parse().unwrap())
                .add_directive("playbook_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Playbook Server");

    let config = Config::from_env()?;
    info!(
        http_port = config.http_port,
        idempotency_ttl_hours = config.idempotency_ttl_hours,
        "Configuration loaded"
    );

    // Connect and migrate
    info!("Connecting to database...");
    let store: Arc<dyn Store> = Arc::new(PostgresStore::from_url(&config.database_url).await?);
    info!("Database ready");

    let engine = Arc::new(
        WorkflowEngine::new(store.clone()).with_external_api(Arc::new(HttpApiClient::new())),
    );
    let state = Arc::new(AppState::new(
        store,
        engine,
        config.idempotency_ttl_hours,
    ));

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Playbook Server listening");

    axum::serve(listener, app(state)).await?;
    Ok(())
}
