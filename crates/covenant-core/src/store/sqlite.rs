// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed entity store.
//!
//! Claims run in a `BEGIN IMMEDIATE` transaction: the candidate select and
//! the lease updates happen under the database write lock, so concurrent
//! claimants (other pools or processes on the same file) are serialized and
//! never see each other's candidates.

use std::marker::PhantomData;
use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use super::{
    EntityFilter, EntityRow, EntityStore, StoreOptions, db_error, is_terminal_code, state_name,
};
use crate::entity::{EntityState, StatefulEntity};
use crate::error::{StoreError, StoreResult};
use crate::migrations;

/// SQLite-backed entity store for one entity type.
pub struct SqliteEntityStore<E> {
    pool: SqlitePool,
    options: StoreOptions,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for SqliteEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: StatefulEntity> SqliteEntityStore<E> {
    /// Create a store over an existing, already migrated pool.
    pub fn new(pool: SqlitePool, options: StoreOptions) -> Self {
        Self {
            pool,
            options,
            _entity: PhantomData,
        }
    }

    /// Open (creating if needed) the database file at `path` and run migrations.
    ///
    /// ```ignore
    /// let store = SqliteEntityStore::<Negotiation>::from_path(".data/covenant.db", options).await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>, options: StoreOptions) -> StoreResult<Self> {
        let pool = open_pool(path).await?;
        Ok(Self::new(pool, options))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn persisted_version(&self, id: &str) -> StoreResult<u64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM entities WHERE entity_type = ? AND id = ?")
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

        let current: Option<(i32, i64)> =
            sqlx::query_as("SELECT state, version FROM entities WHERE entity_type = ? AND id = ?")
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
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
                SET state = ?, state_count = ?, state_timestamp = ?, version = ?,
                    error_detail = ?, lease_owner = ?, lease_expires_at = ?,
                    body = ?, updated_at = ?
                WHERE entity_type = ? AND id = ? AND version = ?
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

/// Open a SQLite pool at `path`, creating parent directories and the file,
/// and apply migrations.
pub async fn open_pool(path: impl AsRef<Path>) -> StoreResult<SqlitePool> {
    let path = path.as_ref();

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
            operation: "create_dir".to_string(),
            details: format!("Failed to create directory {:?}: {}", parent, e),
        })?;
    }

    let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .map_err(|e| StoreError::Database {
            operation: "connect".to_string(),
            details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
        })?;

    migrations::run_sqlite(&pool)
        .await
        .map_err(|e| StoreError::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })?;

    Ok(pool)
}

#[async_trait]
impl<E: StatefulEntity> EntityStore<E> for SqliteEntityStore<E> {
    async fn find(&self, id: &str) -> StoreResult<Option<E>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT entity_type, id, state, state_count, state_timestamp, version,
                   error_detail, lease_owner, lease_expires_at, body, created_at, updated_at
            FROM entities
            WHERE entity_type = ? AND id = ?
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

        // SQLite has one writer at a time; taking the write lock up front makes
        // the candidate select and the claim updates a single atomic step.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(db_error("begin_claim"))?;

        let candidates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM entities
            WHERE entity_type = ? AND state = ?
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
            ORDER BY state_timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(state.code())
        .bind(now)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("select_candidates"))?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let row = sqlx::query_as::<_, EntityRow>(
                r#"
                UPDATE entities
                SET state_count = state_count + 1,
                    state_timestamp = ?,
                    version = version + 1,
                    lease_owner = ?,
                    lease_expires_at = ?,
                    updated_at = ?
                WHERE entity_type = ? AND id = ?
                RETURNING entity_type, id, state, state_count, state_timestamp, version,
                          error_detail, lease_owner, lease_expires_at, body, created_at, updated_at
                "#,
            )
            .bind(now)
            .bind(&self.options.owner)
            .bind(expires_at)
            .bind(now)
            .bind(E::ENTITY_TYPE)
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("claim_entity"))?;
            claimed.push(row.into_entity()?);
        }

        tx.commit().await.map_err(db_error("commit_claim"))?;

        debug!(
            entity_type = E::ENTITY_TYPE,
            state = state.name(),
            claimed = claimed.len(),
            "Claimed entities"
        );
        Ok(claimed)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let code: Option<i32> =
            sqlx::query_scalar("SELECT state FROM entities WHERE entity_type = ? AND id = ?")
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

        sqlx::query("DELETE FROM entities WHERE entity_type = ? AND id = ? AND state = ?")
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
            WHERE entity_type = ?1
              AND (?2 IS NULL OR state = ?2)
              AND (?3 IS NULL OR state_timestamp < ?3)
            ORDER BY state_timestamp ASC, id ASC
            LIMIT ?4 OFFSET ?5
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
