// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed entity store.
//!
//! Claims run as a single statement: candidate rows are locked with
//! `FOR UPDATE SKIP LOCKED` and updated in place, so concurrent runtimes
//! sharing the database never claim the same row.

use std::marker::PhantomData;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{
    EntityFilter, EntityRow, EntityStore, StoreOptions, db_error, is_terminal_code, state_name,
};
use crate::entity::{EntityState, StatefulEntity};
use crate::error::{StoreError, StoreResult};
use crate::migrations;

/// A claimed row together with the `state_timestamp` it was claimed from.
#[derive(sqlx::FromRow)]
struct ClaimedRow {
    #[sqlx(flatten)]
    row: EntityRow,
    claimed_from: i64,
}

/// PostgreSQL-backed entity store for one entity type.
pub struct PostgresEntityStore<E> {
    pool: PgPool,
    options: StoreOptions,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for PostgresEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: StatefulEntity> PostgresEntityStore<E> {
    /// Create a store over an existing, already migrated pool.
    pub fn new(pool: PgPool, options: StoreOptions) -> Self {
        Self {
            pool,
            options,
            _entity: PhantomData,
        }
    }

    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str, options: StoreOptions) -> StoreResult<Self> {
        let pool = open_pool(database_url, 10).await?;
        Ok(Self::new(pool, options))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn persisted_version(&self, id: &str) -> StoreResult<u64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM entities WHERE entity_type = $1 AND id = $2")
                .bind(E::ENTITY_TYPE)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("read_version"))?;
        Ok(version.unwrap_or(0).max(0) as u64)
    }

    async fn write(&self, entity: &mut E, lease_expires_at: Option<i64>) -> StoreResult<()> {
        let now = self.options.now();
        let expected = entity.meta().version();

        let current: Option<(i32, i64)> = sqlx::query_as(
            "SELECT state, version FROM entities WHERE entity_type = $1 AND id = $2",
        )
        .bind(E::ENTITY_TYPE)
        .bind(entity.id())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("read_version"))?;

        let next_version = match current {
            None if expected != 0 => {
                return Err(StoreError::NotFound {
                    entity_type: E::ENTITY_TYPE,
                    id: entity.id().to_string(),
                });
            }
            None => 1,
            Some((code, _)) if is_terminal_code::<E::State>(code) => {
                return Err(StoreError::TerminalState {
                    entity_type: E::ENTITY_TYPE,
                    id: entity.id().to_string(),
                    state: state_name::<E::State>(code),
                });
            }
            Some((_, version)) if version as u64 != expected => {
                return Err(StoreError::ConcurrentModification {
                    entity_type: E::ENTITY_TYPE,
                    id: entity.id().to_string(),
                    expected,
                    actual: version as u64,
                });
            }
            Some(_) => expected + 1,
        };

        let mut row = EntityRow::from_entity(entity, next_version, now)?;
        if let Some(expires_at) = lease_expires_at {
            row.lease_owner = Some(self.options.owner.clone());
            row.lease_expires_at = Some(expires_at);
        }

        let result = if next_version == 1 {
            sqlx::query(
                r#"
                INSERT INTO entities (entity_type, id, state, state_count, state_timestamp,
                                      version, error_detail, lease_owner, lease_expires_at,
                                      body, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (entity_type, id) DO NOTHING
                "#,
            )
            .bind(&row.entity_type)
            .bind(&row.id)
            .bind(row.state)
            .bind(row.state_count)
            .bind(row.state_timestamp)
            .bind(row.version)
            .bind(&row.error_detail)
            .bind(&row.lease_owner)
            .bind(row.lease_expires_at)
            .bind(&row.body)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_error("insert_entity"))?
        } else {
            sqlx::query(
                r#"
                UPDATE entities
                SET state = $1, state_count = $2, state_timestamp = $3, version = $4,
                    error_detail = $5, lease_owner = $6, lease_expires_at = $7,
                    body = $8, updated_at = $9
                WHERE entity_type = $10 AND id = $11 AND version = $12
                "#,
            )
            .bind(row.state)
            .bind(row.state_count)
            .bind(row.state_timestamp)
            .bind(row.version)
            .bind(&row.error_detail)
            .bind(&row.lease_owner)
            .bind(row.lease_expires_at)
            .bind(&row.body)
            .bind(row.updated_at)
            .bind(&row.entity_type)
            .bind(&row.id)
            .bind(expected as i64)
            .execute(&self.pool)
            .await
            .map_err(db_error("update_entity"))?
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::ConcurrentModification {
                entity_type: E::ENTITY_TYPE,
                id: entity.id().to_string(),
                expected,
                actual: self.persisted_version(entity.id()).await?,
            });
        }

        entity.meta_mut().mark_persisted(next_version, now);
        Ok(())
    }
}

/// Connect a PostgreSQL pool and apply migrations.
pub async fn open_pool(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Database {
            operation: "connect".to_string(),
            details: format!("Failed to connect to PostgreSQL: {}", e),
        })?;

    migrations::run_postgres(&pool)
        .await
        .map_err(|e| StoreError::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })?;

    Ok(pool)
}

#[async_trait]
impl<E: StatefulEntity> EntityStore<E> for PostgresEntityStore<E> {
    async fn find(&self, id: &str) -> StoreResult<Option<E>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT entity_type, id, state, state_count, state_timestamp, version,
                   error_detail, lease_owner, lease_expires_at, body, created_at, updated_at
            FROM entities
            WHERE entity_type = $1 AND id = $2
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find_entity"))?;

        row.map(EntityRow::into_entity).transpose()
    }

    async fn save(&self, entity: &mut E) -> StoreResult<()> {
        self.write(entity, None).await
    }

    async fn reschedule(&self, entity: &mut E, not_before_millis: i64) -> StoreResult<()> {
        self.write(entity, Some(not_before_millis)).await
    }

    async fn next_for_state(&self, state: E::State, max: usize) -> StoreResult<Vec<E>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.options.now();
        let expires_at = self.options.lease_expiry(now);

        let mut rows = sqlx::query_as::<_, ClaimedRow>(
            r#"
            WITH candidates AS (
                SELECT entity_type, id, state_timestamp AS claimed_from
                FROM entities
                WHERE entity_type = $1 AND state = $2
                  AND (lease_expires_at IS NULL OR lease_expires_at <= $3)
                ORDER BY state_timestamp ASC, id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE entities e
            SET state_count = e.state_count + 1,
                state_timestamp = $3,
                version = e.version + 1,
                lease_owner = $5,
                lease_expires_at = $6,
                updated_at = $3
            FROM candidates c
            WHERE e.entity_type = c.entity_type AND e.id = c.id
            RETURNING e.entity_type, e.id, e.state, e.state_count, e.state_timestamp,
                      e.version, e.error_detail, e.lease_owner, e.lease_expires_at,
                      e.body, e.created_at, e.updated_at, c.claimed_from
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(state.code())
        .bind(now)
        .bind(max as i64)
        .bind(&self.options.owner)
        .bind(expires_at)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("claim_entities"))?;

        // UPDATE ... RETURNING does not preserve the candidate order.
        rows.sort_by(|a, b| (a.claimed_from, &a.row.id).cmp(&(b.claimed_from, &b.row.id)));
        rows.into_iter().map(|c| c.row.into_entity()).collect()
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let code: Option<i32> =
            sqlx::query_scalar("SELECT state FROM entities WHERE entity_type = $1 AND id = $2")
                .bind(E::ENTITY_TYPE)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("read_state"))?;

        let code = code.ok_or_else(|| StoreError::NotFound {
            entity_type: E::ENTITY_TYPE,
            id: id.to_string(),
        })?;
        if !is_terminal_code::<E::State>(code) {
            return Err(StoreError::NotTerminal {
                entity_type: E::ENTITY_TYPE,
                id: id.to_string(),
                state: state_name::<E::State>(code),
            });
        }

        sqlx::query("DELETE FROM entities WHERE entity_type = $1 AND id = $2 AND state = $3")
            .bind(E::ENTITY_TYPE)
            .bind(id)
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete_entity"))?;

        Ok(())
    }

    async fn query(&self, filter: &EntityFilter<E::State>) -> StoreResult<Vec<E>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT entity_type, id, state, state_count, state_timestamp, version,
                   error_detail, lease_owner, lease_expires_at, body, created_at, updated_at
            FROM entities
            WHERE entity_type = $1
              AND ($2::INTEGER IS NULL OR state = $2)
              AND ($3::BIGINT IS NULL OR state_timestamp < $3)
            ORDER BY state_timestamp ASC, id ASC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(filter.state.map(|s| s.code()))
        .bind(filter.state_timestamp_before)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("query_entities"))?;

        rows.into_iter().map(EntityRow::into_entity).collect()
    }
}
