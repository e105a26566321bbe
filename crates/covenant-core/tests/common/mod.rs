// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for covenant-core integration tests.
//!
//! Provides a small process type ([`Probe`]) and the store contract checks
//! that every [`EntityStore`] backend must pass.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use covenant_core::clock::ManualClock;
use covenant_core::store::{EntityFilter, EntityStore, StoreOptions};
use covenant_core::{EntityMeta, EntityState, StatefulEntity};

/// Epoch millis the test clocks start at.
pub const T0: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeState {
    Requesting,
    Requested,
    Completed,
    Terminated,
}

impl EntityState for ProbeState {
    const ALL: &'static [Self] = &[
        Self::Requesting,
        Self::Requested,
        Self::Completed,
        Self::Terminated,
    ];
    const INITIAL: Self = Self::Requesting;

    fn code(self) -> i32 {
        match self {
            Self::Requesting => 100,
            Self::Requested => 200,
            Self::Completed => 800,
            Self::Terminated => 1400,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Requesting => "REQUESTING",
            Self::Requested => "REQUESTED",
            Self::Completed => "COMPLETED",
            Self::Terminated => "TERMINATED",
        }
    }

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Requesting => &[Self::Requested, Self::Terminated],
            Self::Requested => &[Self::Completed, Self::Terminated],
            Self::Completed | Self::Terminated => &[],
        }
    }

    fn failure_state(self) -> Self {
        Self::Terminated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub meta: EntityMeta<ProbeState>,
    pub counterparty: String,
}

impl Probe {
    pub fn new(id: &str, now: i64) -> Self {
        Self::in_state(id, ProbeState::Requesting, now)
    }

    pub fn in_state(id: &str, state: ProbeState, now: i64) -> Self {
        Self {
            meta: EntityMeta::in_state(id, state, now),
            counterparty: "https://provider.example/dsp".to_string(),
        }
    }
}

impl StatefulEntity for Probe {
    type State = ProbeState;
    const ENTITY_TYPE: &'static str = "probe";

    fn meta(&self) -> &EntityMeta<ProbeState> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta<ProbeState> {
        &mut self.meta
    }
}

/// Store options with a manual clock and the given owner.
pub fn options(owner: &str, clock: &ManualClock) -> StoreOptions {
    StoreOptions::default()
        .with_owner(owner)
        .with_lease_duration(Duration::from_secs(60))
        .with_clock(Arc::new(clock.clone()))
}

/// Macro to skip test if database URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

// ============================================================================
// Store contract
// ============================================================================

/// Two claimants racing for 15 entities receive disjoint batches covering all of them.
pub async fn no_double_claim(
    a: Arc<dyn EntityStore<Probe>>,
    b: Arc<dyn EntityStore<Probe>>,
    clock: &ManualClock,
) {
    for i in 0..15 {
        let mut probe = Probe::in_state(&format!("probe-{i:02}"), ProbeState::Requested, T0 + i);
        a.save(&mut probe).await.unwrap();
    }
    clock.set(T0 + 1_000);

    let (batch_a, batch_b) = tokio::join!(
        a.next_for_state(ProbeState::Requested, 10),
        b.next_for_state(ProbeState::Requested, 10)
    );
    let ids_a: HashSet<String> = batch_a.unwrap().iter().map(|p| p.id().to_string()).collect();
    let ids_b: HashSet<String> = batch_b.unwrap().iter().map(|p| p.id().to_string()).collect();

    assert!(ids_a.is_disjoint(&ids_b), "batches overlap: {ids_a:?} / {ids_b:?}");
    assert_eq!(ids_a.len() + ids_b.len(), 15, "a={ids_a:?} b={ids_b:?}");
    let union: HashSet<&String> = ids_a.union(&ids_b).collect();
    assert_eq!(union.len(), 15);
}

/// Repeated single claims visit every entity once before revisiting any.
pub async fn no_starvation(store: Arc<dyn EntityStore<Probe>>, clock: &ManualClock) {
    const N: i64 = 6;
    for i in 0..N {
        store
            .save(&mut Probe::new(&format!("probe-{i}"), T0 + i * 10))
            .await
            .unwrap();
    }
    clock.set(T0 + 1_000);

    let mut seen = Vec::new();
    for _ in 0..N {
        clock.advance(Duration::from_millis(1));
        let mut batch = store.next_for_state(ProbeState::Requesting, 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        let mut probe = batch.remove(0);
        seen.push(probe.id().to_string());
        // Handing the entity back releases the lease; its timestamp is now the newest.
        store.save(&mut probe).await.unwrap();
    }

    let expected: Vec<String> = (0..N).map(|i| format!("probe-{i}")).collect();
    assert_eq!(seen, expected);

    clock.advance(Duration::from_millis(1));
    let again = store.next_for_state(ProbeState::Requesting, 1).await.unwrap();
    assert_eq!(again[0].id(), "probe-0");
    assert_eq!(again[0].meta.state_count(), 2);
}

/// A stale save fails and leaves the stored copy untouched.
pub async fn optimistic_concurrency(store: Arc<dyn EntityStore<Probe>>) {
    let mut probe = Probe::new("probe-1", T0);
    store.save(&mut probe).await.unwrap();
    assert_eq!(probe.meta.version(), 1);

    let mut stale = store.find("probe-1").await.unwrap().unwrap();

    probe.counterparty = "first".to_string();
    store.save(&mut probe).await.unwrap();
    assert_eq!(probe.meta.version(), 2);

    stale.counterparty = "second".to_string();
    let err = store.save(&mut stale).await.unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {err}");

    let stored = store.find("probe-1").await.unwrap().unwrap();
    assert_eq!(stored.counterparty, "first");
    assert_eq!(stored.meta.version(), 2);

    // A claim also invalidates copies taken before it.
    let claimed = store.next_for_state(ProbeState::Requesting, 1).await.unwrap();
    assert_eq!(claimed[0].meta.version(), 3);
    assert!(store.save(&mut probe).await.unwrap_err().is_conflict());
}

/// Leases block other claimants until they expire.
pub async fn lease_expiry(store: Arc<dyn EntityStore<Probe>>, clock: &ManualClock) {
    clock.set(T0);
    store.save(&mut Probe::new("probe-1", T0)).await.unwrap();

    let first = store.next_for_state(ProbeState::Requesting, 5).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].meta.state_count(), 1);

    clock.advance(Duration::from_secs(59));
    assert!(store.next_for_state(ProbeState::Requesting, 5).await.unwrap().is_empty());

    clock.advance(Duration::from_secs(1));
    let reclaimed = store.next_for_state(ProbeState::Requesting, 5).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].meta.state_count(), 2);

    // The crashed claimant's copy is stale now.
    let mut crashed = first.into_iter().next().unwrap();
    assert!(store.save(&mut crashed).await.unwrap_err().is_conflict());
}

/// Rescheduled entities stay unclaimable until their not-before time.
pub async fn reschedule(store: Arc<dyn EntityStore<Probe>>, clock: &ManualClock) {
    clock.set(T0);
    store.save(&mut Probe::new("probe-1", T0)).await.unwrap();

    let mut claimed = store.next_for_state(ProbeState::Requesting, 1).await.unwrap();
    store
        .reschedule(&mut claimed[0], T0 + 5_000)
        .await
        .unwrap();

    clock.set(T0 + 4_999);
    assert!(store.next_for_state(ProbeState::Requesting, 1).await.unwrap().is_empty());
    clock.set(T0 + 5_000);
    assert_eq!(store.next_for_state(ProbeState::Requesting, 1).await.unwrap().len(), 1);
}

/// Terminal entities can be deleted but not updated.
pub async fn terminal_lifecycle(store: Arc<dyn EntityStore<Probe>>) {
    let mut probe = Probe::in_state("probe-1", ProbeState::Requested, T0);
    store.save(&mut probe).await.unwrap();
    assert_eq!(
        store.delete("probe-1").await.unwrap_err().error_code(),
        "NOT_TERMINAL"
    );

    probe.fail_to(ProbeState::Terminated, "counterparty gone", T0 + 1).unwrap();
    store.save(&mut probe).await.unwrap();

    let stored = store.find("probe-1").await.unwrap().unwrap();
    assert_eq!(stored.state(), ProbeState::Terminated);
    assert_eq!(stored.meta.error_detail(), Some("counterparty gone"));

    probe.counterparty = "changed".to_string();
    assert_eq!(
        store.save(&mut probe).await.unwrap_err().error_code(),
        "TERMINAL_STATE"
    );

    store.delete("probe-1").await.unwrap();
    assert!(store.find("probe-1").await.unwrap().is_none());
    assert_eq!(
        store.delete("probe-1").await.unwrap_err().error_code(),
        "ENTITY_NOT_FOUND"
    );
}

/// Query filters by state and age and pages in timestamp order.
pub async fn query(store: Arc<dyn EntityStore<Probe>>) {
    for i in 0..4 {
        store
            .save(&mut Probe::new(&format!("probe-{i}"), T0 + i))
            .await
            .unwrap();
    }
    store
        .save(&mut Probe::in_state("done", ProbeState::Completed, T0))
        .await
        .unwrap();

    let all = store.query(&EntityFilter::default()).await.unwrap();
    assert_eq!(all.len(), 5);

    let page = store
        .query(&EntityFilter {
            state: Some(ProbeState::Requesting),
            limit: 2,
            offset: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<&str> = page.iter().map(|p| p.id()).collect();
    assert_eq!(ids, vec!["probe-1", "probe-2"]);

    let old = store
        .query(&EntityFilter {
            state_timestamp_before: Some(T0 + 1),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut ids: Vec<&str> = old.iter().map(|p| p.id()).collect();
    ids.sort();
    assert_eq!(ids, vec!["done", "probe-0"]);
}

/// Inserts must not shadow an existing entity; updates need an existing one.
pub async fn insert_rules(store: Arc<dyn EntityStore<Probe>>) {
    let mut probe = Probe::in_state("probe-1", ProbeState::Requested, T0);
    store.save(&mut probe).await.unwrap();

    let mut duplicate = Probe::in_state("probe-1", ProbeState::Requested, T0);
    assert!(store.save(&mut duplicate).await.unwrap_err().is_conflict());

    let mut done = probe.clone();
    done.transition_to(ProbeState::Completed, T0 + 1).unwrap();
    store.save(&mut done).await.unwrap();
    store.delete("probe-1").await.unwrap();

    // `probe` still carries the version of an entity that no longer exists.
    assert_eq!(
        store.save(&mut probe).await.unwrap_err().error_code(),
        "ENTITY_NOT_FOUND"
    );
}
