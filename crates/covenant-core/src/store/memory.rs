// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory entity store.
//!
//! All operations serialize behind a single mutex, so claims are trivially
//! exclusive. Entities are handed out by value; callers never alias the
//! stored copy.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{EntityFilter, EntityStore, Lease, StoreOptions};
use crate::entity::{EntityState, StatefulEntity};
use crate::error::{StoreError, StoreResult};

struct Slot<E> {
    entity: E,
    lease: Option<Lease>,
}

/// Entity store backed by a `HashMap`.
pub struct InMemoryEntityStore<E: StatefulEntity> {
    slots: Mutex<HashMap<String, Slot<E>>>,
    options: StoreOptions,
}

impl<E: StatefulEntity> InMemoryEntityStore<E> {
    /// Create an empty store with default options.
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    /// Create an empty store.
    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Number of stored entities.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Current lease on an entity, if any.
    pub async fn lease_of(&self, id: &str) -> Option<Lease> {
        self.slots.lock().await.get(id).and_then(|s| s.lease.clone())
    }

    async fn write(&self, entity: &mut E, lease: Option<Lease>) -> StoreResult<()> {
        let now = self.options.now();
        let mut slots = self.slots.lock().await;
        let expected = entity.meta().version();

        let next_version = match slots.get(entity.id()) {
            None if expected != 0 => {
                return Err(StoreError::NotFound {
                    entity_type: E::ENTITY_TYPE,
                    id: entity.id().to_string(),
                });
            }
            None => 1,
            Some(slot) => {
                let stored = slot.entity.meta();
                if stored.state().is_terminal() {
                    return Err(StoreError::TerminalState {
                        entity_type: E::ENTITY_TYPE,
                        id: entity.id().to_string(),
                        state: stored.state().name(),
                    });
                }
                if stored.version() != expected {
                    return Err(StoreError::ConcurrentModification {
                        entity_type: E::ENTITY_TYPE,
                        id: entity.id().to_string(),
                        expected,
                        actual: stored.version(),
                    });
                }
                expected + 1
            }
        };

        entity.meta_mut().mark_persisted(next_version, now);
        slots.insert(
            entity.id().to_string(),
            Slot {
                entity: entity.clone(),
                lease,
            },
        );
        Ok(())
    }
}

impl<E: StatefulEntity> Default for InMemoryEntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: StatefulEntity> EntityStore<E> for InMemoryEntityStore<E> {
    async fn find(&self, id: &str) -> StoreResult<Option<E>> {
        Ok(self.slots.lock().await.get(id).map(|s| s.entity.clone()))
    }

    async fn save(&self, entity: &mut E) -> StoreResult<()> {
        self.write(entity, None).await
    }

    async fn reschedule(&self, entity: &mut E, not_before_millis: i64) -> StoreResult<()> {
        let lease = Lease {
            owner: self.options.owner.clone(),
            expires_at: not_before_millis,
        };
        self.write(entity, Some(lease)).await
    }

    async fn next_for_state(&self, state: E::State, max: usize) -> StoreResult<Vec<E>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.options.now();
        let mut slots = self.slots.lock().await;

        let mut candidates: Vec<(i64, String)> = slots
            .values()
            .filter(|s| s.entity.state() == state)
            .filter(|s| s.lease.as_ref().is_none_or(|l| !l.is_live(now)))
            .map(|s| (s.entity.meta().state_timestamp(), s.entity.id().to_string()))
            .collect();
        candidates.sort();
        candidates.truncate(max);

        let expires_at = self.options.lease_expiry(now);
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(slot) = slots.get_mut(&id) {
                slot.entity.meta_mut().mark_claimed(now);
                slot.lease = Some(Lease {
                    owner: self.options.owner.clone(),
                    expires_at,
                });
                claimed.push(slot.entity.clone());
            }
        }
        Ok(claimed)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut slots = self.slots.lock().await;
        let state = match slots.get(id) {
            Some(slot) => slot.entity.state(),
            None => {
                return Err(StoreError::NotFound {
                    entity_type: E::ENTITY_TYPE,
                    id: id.to_string(),
                });
            }
        };
        if !state.is_terminal() {
            return Err(StoreError::NotTerminal {
                entity_type: E::ENTITY_TYPE,
                id: id.to_string(),
                state: state.name(),
            });
        }
        slots.remove(id);
        Ok(())
    }

    async fn query(&self, filter: &EntityFilter<E::State>) -> StoreResult<Vec<E>> {
        let slots = self.slots.lock().await;
        let mut matches: Vec<&E> = slots
            .values()
            .map(|s| &s.entity)
            .filter(|e| filter.matches(e.state(), e.meta().state_timestamp()))
            .collect();
        matches.sort_by(|a, b| {
            (a.meta().state_timestamp(), a.id()).cmp(&(b.meta().state_timestamp(), b.id()))
        });
        Ok(matches
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
