// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity store contract and backends.
//!
//! Every backend must implement [`EntityStore`] with identical semantics:
//!
//! - `save` is an upsert guarded by the entity's version. A stale copy is
//!   rejected with [`StoreError::ConcurrentModification`] and the stored copy is
//!   left untouched.
//! - `next_for_state` is the lease-and-claim operation. It selects entities in
//!   a state that are not leased (or whose lease has expired), oldest
//!   `state_timestamp` first, bumps their `state_count`/`state_timestamp`/
//!   `version`, stamps a lease owned by this store instance and returns them.
//!   Two concurrent callers never receive the same entity.
//! - Entities in a terminal state can only be deleted.
//!
//! The in-memory backend serializes claims behind one mutex; the SQL
//! backends rely on version compare-and-swap (SQLite) or row locks with
//! `SKIP LOCKED` (PostgreSQL).

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::InMemoryEntityStore;
pub use self::postgres::PostgresEntityStore;
pub use self::sqlite::SqliteEntityStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{self, Clock};
use crate::entity::{EntityState, StatefulEntity};
use crate::error::{StoreError, StoreResult};

/// Persistent collection of entities of one type.
#[async_trait]
pub trait EntityStore<E: StatefulEntity>: Send + Sync {
    /// Point lookup.
    async fn find(&self, id: &str) -> StoreResult<Option<E>>;

    /// Insert or update `entity`, releasing any lease on it.
    ///
    /// On success the caller's copy carries the new version.
    async fn save(&self, entity: &mut E) -> StoreResult<()>;

    /// Like [`save`](EntityStore::save), but keeps the entity unclaimable
    /// until `not_before_millis`.
    async fn reschedule(&self, entity: &mut E, not_before_millis: i64) -> StoreResult<()>;

    /// Claim up to `max` unleased entities in `state`, oldest first.
    async fn next_for_state(&self, state: E::State, max: usize) -> StoreResult<Vec<E>>;

    /// Delete a terminal entity.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// List entities matching `filter`, ordered by `state_timestamp`.
    async fn query(&self, filter: &EntityFilter<E::State>) -> StoreResult<Vec<E>>;
}

/// Settings shared by all store backends.
#[derive(Clone)]
pub struct StoreOptions {
    /// Identifier stamped on leases taken by this store instance.
    pub owner: String,
    /// How long a claim stays exclusive before the entity becomes reclaimable.
    pub lease_duration: Duration,
    /// Time source for timestamps and lease expiry.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("owner", &self.owner)
            .field("lease_duration", &self.lease_duration)
            .field("clock", &"...")
            .finish()
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            owner: uuid::Uuid::new_v4().to_string(),
            lease_duration: Duration::from_secs(60),
            clock: clock::system(),
        }
    }
}

impl StoreOptions {
    /// Set the lease owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub(crate) fn lease_expiry(&self, now: i64) -> i64 {
        now.saturating_add(self.lease_duration.as_millis() as i64)
    }
}

/// Exclusive processing right on an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Store instance holding the lease.
    pub owner: String,
    /// Epoch millis after which the lease is stale.
    pub expires_at: i64,
}

impl Lease {
    /// Whether the lease still excludes other claimants at `now`.
    pub fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// Filter for [`EntityStore::query`].
#[derive(Debug, Clone)]
pub struct EntityFilter<S: EntityState> {
    /// Only entities in this state.
    pub state: Option<S>,
    /// Only entities whose `state_timestamp` is strictly older than this.
    pub state_timestamp_before: Option<i64>,
    /// Maximum number of results.
    pub limit: i64,
    /// Number of results to skip.
    pub offset: i64,
}

impl<S: EntityState> Default for EntityFilter<S> {
    fn default() -> Self {
        Self {
            state: None,
            state_timestamp_before: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl<S: EntityState> EntityFilter<S> {
    /// Filter on a single state.
    pub fn in_state(state: S) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, state: S, state_timestamp: i64) -> bool {
        self.state.is_none_or(|s| s == state)
            && self
                .state_timestamp_before
                .is_none_or(|before| state_timestamp < before)
    }
}

// ============================================================================
// Record Types (SQL backends)
// ============================================================================

/// Entity row as stored by the SQL backends.
///
/// Bookkeeping is mirrored into columns so that claims can update it without
/// rewriting the JSON document; the columns win over the document on load.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntityRow {
    /// Entity type discriminator.
    pub entity_type: String,
    /// Entity ID.
    pub id: String,
    /// State code.
    pub state: i32,
    /// Claims in the current state.
    pub state_count: i64,
    /// Last state change or claim, epoch millis.
    pub state_timestamp: i64,
    /// Optimistic-concurrency version.
    pub version: i64,
    /// Failure reason, mirrored for operators.
    pub error_detail: Option<String>,
    /// Current lease holder.
    pub lease_owner: Option<String>,
    /// Lease expiry, epoch millis.
    pub lease_expires_at: Option<i64>,
    /// Full entity as JSON.
    pub body: String,
    /// Creation time, epoch millis.
    pub created_at: i64,
    /// Last write, epoch millis.
    pub updated_at: i64,
}

impl EntityRow {
    /// Build the row for `entity` as it will look after a write at `version`.
    pub(crate) fn from_entity<E: StatefulEntity>(
        entity: &E,
        version: u64,
        now: i64,
    ) -> StoreResult<Self> {
        let meta = entity.meta();
        let mut persisted = entity.clone();
        persisted.meta_mut().mark_persisted(version, now);

        Ok(Self {
            entity_type: E::ENTITY_TYPE.to_string(),
            id: meta.id().to_string(),
            state: meta.state().code(),
            state_count: i64::from(meta.state_count()),
            state_timestamp: meta.state_timestamp(),
            version: version as i64,
            error_detail: meta.error_detail().map(str::to_string),
            lease_owner: None,
            lease_expires_at: None,
            body: serde_json::to_string(&persisted)?,
            created_at: meta.created_at(),
            updated_at: now,
        })
    }

    /// Decode the document and overlay the bookkeeping columns.
    pub(crate) fn into_entity<E: StatefulEntity>(self) -> StoreResult<E> {
        let state = E::State::from_code(self.state).ok_or_else(|| StoreError::UnknownState {
            entity_type: E::ENTITY_TYPE,
            id: self.id.clone(),
            code: self.state,
        })?;
        let mut entity: E = serde_json::from_str(&self.body)?;
        entity.meta_mut().restore(
            state,
            u32::try_from(self.state_count).unwrap_or(u32::MAX),
            self.state_timestamp,
            self.version.max(0) as u64,
            self.updated_at,
        );
        Ok(entity)
    }
}

/// State codes of all terminal states of `S`.
pub(crate) fn terminal_codes<S: EntityState>() -> Vec<i32> {
    S::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.code())
        .collect()
}

/// Attach the failing operation to a database error.
pub(crate) fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Database {
        operation: operation.to_string(),
        details: e.to_string(),
    }
}

/// Whether a persisted state code denotes a terminal state of `S`.
pub(crate) fn is_terminal_code<S: EntityState>(code: i32) -> bool {
    S::from_code(code).is_some_and(|s| s.is_terminal())
}

/// Map a persisted state code to a state name for error messages.
pub(crate) fn state_name<S: EntityState>(code: i32) -> &'static str {
    S::from_code(code).map(|s| s.name()).unwrap_or("UNKNOWN")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures::{Job, JobState};

    #[test]
    fn test_row_round_trip_overlays_columns() {
        let job = Job::new("job-1", 1_000);
        let mut row = EntityRow::from_entity(&job, 1, 2_000).unwrap();
        assert_eq!(row.state, 100);
        assert_eq!(row.version, 1);
        assert_eq!(row.updated_at, 2_000);

        // Simulate a claim that only touched the columns.
        row.state_count = 3;
        row.state_timestamp = 5_000;
        row.version = 4;

        let loaded: Job = row.into_entity().unwrap();
        assert_eq!(loaded.meta.state_count(), 3);
        assert_eq!(loaded.meta.state_timestamp(), 5_000);
        assert_eq!(loaded.meta.version(), 4);
        assert_eq!(loaded.payload, "payload-job-1");
    }

    #[test]
    fn test_row_with_unknown_state_is_rejected() {
        let job = Job::new("job-1", 0);
        let mut row = EntityRow::from_entity(&job, 1, 0).unwrap();
        row.state = 999;

        let err = row.into_entity::<Job>().unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_STATE");
    }

    #[test]
    fn test_filter_matching() {
        let filter = EntityFilter {
            state: Some(JobState::Completed),
            state_timestamp_before: Some(100),
            ..Default::default()
        };
        assert!(filter.matches(JobState::Completed, 99));
        assert!(!filter.matches(JobState::Completed, 100));
        assert!(!filter.matches(JobState::Requested, 10));
        assert!(EntityFilter::<JobState>::default().matches(JobState::Requested, i64::MAX));
    }

    #[test]
    fn test_terminal_codes() {
        assert_eq!(terminal_codes::<JobState>(), vec![800, 1400]);
        assert_eq!(state_name::<JobState>(200), "REQUESTED");
        assert_eq!(state_name::<JobState>(1), "UNKNOWN");
    }

    #[test]
    fn test_lease_liveness() {
        let lease = Lease {
            owner: "a".to_string(),
            expires_at: 100,
        };
        assert!(lease.is_live(99));
        assert!(!lease.is_live(100));
    }
}
