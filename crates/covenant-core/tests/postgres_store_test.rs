// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store contract tests for the PostgreSQL backend.
//!
//! Skipped unless `TEST_DATABASE_URL` points at a disposable database.
//! Scenarios share the `entities` table and therefore run sequentially in a
//! single test.

mod common;

use std::sync::Arc;

use common::*;
use covenant_core::clock::ManualClock;
use covenant_core::store::postgres::open_pool;
use covenant_core::store::{EntityStore, PostgresEntityStore};
use sqlx::PgPool;

async fn reset(pool: &PgPool) {
    sqlx::query("DELETE FROM entities WHERE entity_type = 'probe'")
        .execute(pool)
        .await
        .unwrap();
}

fn store(pool: &PgPool, owner: &str, clock: &ManualClock) -> Arc<dyn EntityStore<Probe>> {
    Arc::new(PostgresEntityStore::new(pool.clone(), options(owner, clock)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_postgres_store_contract() {
    skip_if_no_db!();

    let database_url = std::env::var("TEST_DATABASE_URL").unwrap();
    let pool = open_pool(&database_url, 5).await.expect("connect");
    let clock = ManualClock::new(T0);

    reset(&pool).await;
    no_double_claim(
        store(&pool, "runtime-a", &clock),
        store(&pool, "runtime-b", &clock),
        &clock,
    )
    .await;

    reset(&pool).await;
    clock.set(T0);
    no_starvation(store(&pool, "runtime-a", &clock), &clock).await;

    reset(&pool).await;
    clock.set(T0);
    optimistic_concurrency(store(&pool, "runtime-a", &clock)).await;

    reset(&pool).await;
    lease_expiry(store(&pool, "runtime-a", &clock), &clock).await;

    reset(&pool).await;
    reschedule(store(&pool, "runtime-a", &clock), &clock).await;

    reset(&pool).await;
    terminal_lifecycle(store(&pool, "runtime-a", &clock)).await;

    reset(&pool).await;
    query(store(&pool, "runtime-a", &clock)).await;

    reset(&pool).await;
    insert_rules(store(&pool, "runtime-a", &clock)).await;

    reset(&pool).await;
}
