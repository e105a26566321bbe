// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Covenant Connector - standalone binary
//!
//! Runs the negotiation, transfer and policy monitor managers against the
//! store named by `COVENANT_DATABASE_URL`. Outbound messages are logged.

use anyhow::Result;
use tracing::{error, info};

use covenant_connector::config::ConnectorConfig;
use covenant_connector::runtime::ConnectorRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("covenant_connector=info".parse()?)
                .add_directive("covenant_core=info".parse()?),
        )
        .init();

    info!("Starting Covenant Connector");

    // Load configuration
    let config = ConnectorConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        participant_id = %config.participant_id,
        runtime_id = %config.core.runtime_id,
        database_url = %config.core.database_url,
        batch_size = config.core.batch_size,
        retention_enabled = config.core.retention.enabled,
        "Configuration loaded"
    );

    let runtime = ConnectorRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;

    info!("Covenant Connector initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    runtime.shutdown().await?;

    info!("Covenant Connector stopped");
    Ok(())
}
