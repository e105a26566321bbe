// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity stores of the three process types, opened on one backend.

use std::sync::Arc;

use covenant_core::config::StoreBackend;
use covenant_core::store::{
    InMemoryEntityStore, PostgresEntityStore, SqliteEntityStore, StoreOptions, postgres, sqlite,
};
use covenant_core::{EntityStore, StoreResult};
use tracing::info;

use crate::negotiation::ContractNegotiation;
use crate::policy_monitor::PolicyMonitorEntry;
use crate::transfer::TransferProcess;

/// Connections held for PostgreSQL stores.
const POSTGRES_MAX_CONNECTIONS: u32 = 10;

/// One store per process type.
#[derive(Clone)]
pub struct Stores {
    /// Contract negotiations.
    pub negotiations: Arc<dyn EntityStore<ContractNegotiation>>,
    /// Transfer processes.
    pub transfers: Arc<dyn EntityStore<TransferProcess>>,
    /// Policy monitor entries.
    pub monitors: Arc<dyn EntityStore<PolicyMonitorEntry>>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    /// Process-local stores.
    pub fn in_memory(options: StoreOptions) -> Self {
        Self {
            negotiations: Arc::new(InMemoryEntityStore::with_options(options.clone())),
            transfers: Arc::new(InMemoryEntityStore::with_options(options.clone())),
            monitors: Arc::new(InMemoryEntityStore::with_options(options)),
        }
    }

    /// Open the stores on `backend`, running migrations for database backends.
    pub async fn open(backend: &StoreBackend, options: StoreOptions) -> StoreResult<Self> {
        match backend {
            StoreBackend::Memory => {
                info!("Using in-memory entity stores");
                Ok(Self::in_memory(options))
            }
            StoreBackend::Sqlite(path) => {
                info!(path = %path.display(), "Opening SQLite entity stores");
                let pool = sqlite::open_pool(path).await?;
                Ok(Self {
                    negotiations: Arc::new(SqliteEntityStore::new(pool.clone(), options.clone())),
                    transfers: Arc::new(SqliteEntityStore::new(pool.clone(), options.clone())),
                    monitors: Arc::new(SqliteEntityStore::new(pool, options)),
                })
            }
            StoreBackend::Postgres(url) => {
                info!("Connecting to PostgreSQL entity stores");
                let pool = postgres::open_pool(url, POSTGRES_MAX_CONNECTIONS).await?;
                Ok(Self {
                    negotiations: Arc::new(PostgresEntityStore::new(pool.clone(), options.clone())),
                    transfers: Arc::new(PostgresEntityStore::new(pool.clone(), options.clone())),
                    monitors: Arc::new(PostgresEntityStore::new(pool, options)),
                })
            }
        }
    }
}
