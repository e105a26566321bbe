// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity model shared by every long-running process type.
//!
//! A process type (contract negotiation, transfer, policy monitor, ...) is a
//! [`StatefulEntity`] whose lifecycle is described by a closed [`EntityState`]
//! enumeration. The enumeration doubles as the transition table: every state
//! lists its legal successors, and a state without successors is terminal.
//!
//! ```text
//!   INITIAL ──► ... ──► (terminal)
//!      │                    ▲
//!      └── failure_state ───┘
//! ```
//!
//! Bookkeeping (`state_count`, `state_timestamp`, `version`) lives in
//! [`EntityMeta`] and is written by the stores and the manager only.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::IllegalTransition;

/// A closed state enumeration together with its transition table.
pub trait EntityState:
    Copy + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Every state of the process type.
    const ALL: &'static [Self];

    /// The state new entities are created in.
    const INITIAL: Self;

    /// Stable integer code persisted by the stores.
    fn code(self) -> i32;

    /// Upper-case state name used in logs and errors.
    fn name(self) -> &'static str;

    /// Legal successor states. Empty for terminal states.
    fn successors(self) -> &'static [Self];

    /// The state an entity moves to when processing in `self` fails for good.
    ///
    /// Must be one of `self.successors()` for every non-terminal state.
    fn failure_state(self) -> Self;

    /// Look up a state by its persisted code.
    fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// A terminal state has no outgoing transitions.
    fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// Whether `next` is an outgoing edge of `self`.
    fn can_transition_to(self, next: Self) -> bool {
        self.successors().contains(&next)
    }
}

/// Bookkeeping common to all entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "S: EntityState")]
pub struct EntityMeta<S: EntityState> {
    id: String,
    state: S,
    state_count: u32,
    state_timestamp: i64,
    error_detail: Option<String>,
    #[serde(default)]
    trace_context: BTreeMap<String, String>,
    #[serde(default)]
    version: u64,
    created_at: i64,
    updated_at: i64,
}

impl<S: EntityState> EntityMeta<S> {
    /// Metadata for a new entity in the process type's initial state.
    pub fn new(id: impl Into<String>, now_millis: i64) -> Self {
        Self::in_state(id, S::INITIAL, now_millis)
    }

    /// Metadata for a new entity created directly in `state`.
    ///
    /// Used when an inbound protocol message opens a process mid-lifecycle
    /// (for example a provider receiving a request).
    pub fn in_state(id: impl Into<String>, state: S, now_millis: i64) -> Self {
        Self {
            id: id.into(),
            state,
            state_count: 0,
            state_timestamp: now_millis,
            error_detail: None,
            trace_context: BTreeMap::new(),
            version: 0,
            created_at: now_millis,
            updated_at: now_millis,
        }
    }

    /// Attach a tracing propagation carrier.
    pub fn with_trace_context(mut self, trace_context: BTreeMap<String, String>) -> Self {
        self.trace_context = trace_context;
        self
    }

    /// Entity ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.state
    }

    /// Claims made in the current state.
    pub fn state_count(&self) -> u32 {
        self.state_count
    }

    /// Epoch millis of the last state change or claim.
    pub fn state_timestamp(&self) -> i64 {
        self.state_timestamp
    }

    /// Failure reason, present only after entering a failure state.
    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    /// Opaque tracing carrier.
    pub fn trace_context(&self) -> &BTreeMap<String, String> {
        &self.trace_context
    }

    /// Optimistic-concurrency version of the last persisted write.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Creation time in epoch millis.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Time of the last persisted write in epoch millis.
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn set_state(&mut self, next: S, error_detail: Option<String>, now_millis: i64) {
        self.state = next;
        self.state_count = 0;
        self.state_timestamp = now_millis;
        self.error_detail = error_detail;
    }

    pub(crate) fn mark_claimed(&mut self, now_millis: i64) {
        self.state_count += 1;
        self.state_timestamp = now_millis;
        self.version += 1;
        self.updated_at = now_millis;
    }

    pub(crate) fn mark_persisted(&mut self, version: u64, now_millis: i64) {
        self.version = version;
        self.updated_at = now_millis;
    }

    pub(crate) fn reset_attempts(&mut self) {
        self.state_count = 0;
    }

    /// Overwrite bookkeeping with the values of a persisted row.
    pub(crate) fn restore(
        &mut self,
        state: S,
        state_count: u32,
        state_timestamp: i64,
        version: u64,
        updated_at: i64,
    ) {
        self.state = state;
        self.state_count = state_count;
        self.state_timestamp = state_timestamp;
        self.version = version;
        self.updated_at = updated_at;
    }
}

/// An instance of a long-running process.
///
/// Implementors own their payload and expose bookkeeping through
/// [`meta`](StatefulEntity::meta). Stores serialize the whole entity as a
/// JSON document and mirror the bookkeeping into indexed columns.
pub trait StatefulEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The process type's state enumeration.
    type State: EntityState;

    /// Entity type name, used as a storage discriminator and in logs.
    const ENTITY_TYPE: &'static str;

    /// Shared bookkeeping.
    fn meta(&self) -> &EntityMeta<Self::State>;

    /// Mutable shared bookkeeping.
    fn meta_mut(&mut self) -> &mut EntityMeta<Self::State>;

    /// Entity ID.
    fn id(&self) -> &str {
        self.meta().id()
    }

    /// Current state.
    fn state(&self) -> Self::State {
        self.meta().state()
    }

    /// Move to `next`, resetting retry bookkeeping and clearing any error.
    fn transition_to(&mut self, next: Self::State, now_millis: i64) -> Result<(), IllegalTransition> {
        self.check_transition(next)?;
        self.meta_mut().set_state(next, None, now_millis);
        Ok(())
    }

    /// Move to the failure state `next`, recording `reason` as error detail.
    fn fail_to(
        &mut self,
        next: Self::State,
        reason: impl Into<String>,
        now_millis: i64,
    ) -> Result<(), IllegalTransition> {
        self.check_transition(next)?;
        self.meta_mut()
            .set_state(next, Some(reason.into()), now_millis);
        Ok(())
    }

    /// Verify that `next` is an outgoing edge of the current state.
    fn check_transition(&self, next: Self::State) -> Result<(), IllegalTransition> {
        let current = self.state();
        if current.can_transition_to(next) {
            Ok(())
        } else {
            Err(IllegalTransition {
                entity_type: Self::ENTITY_TYPE,
                id: self.id().to_string(),
                from: current.name(),
                to: next.name(),
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_new_entity_starts_in_initial_state() {
        let job = Job::new("job-1", 42);
        assert_eq!(job.state(), JobState::Requesting);
        assert_eq!(job.meta.state_count(), 0);
        assert_eq!(job.meta.state_timestamp(), 42);
        assert_eq!(job.meta.version(), 0);
        assert!(job.meta.error_detail().is_none());
    }

    #[test]
    fn test_transition_resets_bookkeeping() {
        let mut job = Job::new("job-1", 0);
        job.meta.mark_claimed(10);
        job.meta.mark_claimed(20);
        assert_eq!(job.meta.state_count(), 2);

        job.transition_to(JobState::Requested, 30).unwrap();
        assert_eq!(job.state(), JobState::Requested);
        assert_eq!(job.meta.state_count(), 0);
        assert_eq!(job.meta.state_timestamp(), 30);
    }

    #[test]
    fn test_illegal_transition_leaves_entity_unchanged() {
        let mut job = Job::new("job-1", 0);
        let before = job.clone();

        let err = job.transition_to(JobState::Completed, 5).unwrap_err();
        assert_eq!(err.from, "REQUESTING");
        assert_eq!(err.to, "COMPLETED");
        assert_eq!(job, before);
    }

    #[test]
    fn test_fail_to_sets_error_and_success_clears_it() {
        let mut job = Job::in_state("job-1", JobState::Requested, 0);
        job.fail_to(JobState::Terminated, "boom", 1).unwrap();
        assert_eq!(job.meta.error_detail(), Some("boom"));
        assert!(job.state().is_terminal());

        let mut other = Job::new("job-2", 0);
        other.fail_to(JobState::Completed, "x", 1).unwrap_err();
        other.transition_to(JobState::Requested, 1).unwrap();
        assert!(other.meta.error_detail().is_none());
    }

    #[test]
    fn test_state_codes_round_trip() {
        for state in JobState::ALL {
            assert_eq!(JobState::from_code(state.code()), Some(*state));
        }
        assert_eq!(JobState::from_code(-1), None);
    }

    #[test]
    fn test_failure_state_is_a_legal_edge() {
        for state in JobState::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(state.failure_state()));
        }
    }
}
