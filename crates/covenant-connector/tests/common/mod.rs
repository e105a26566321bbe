// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for covenant-connector integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use covenant_core::store::InMemoryEntityStore;
use covenant_core::{EntityFilter, EntityStore, StatefulEntity, StoreError, StoreResult};

use covenant_connector::config::ConnectorConfig;
use covenant_connector::dispatch::{DispatchError, Dispatcher, RemoteMessage};
use covenant_connector::negotiation::{ContractAgreement, ContractOffer};
use covenant_connector::policy::Policy;
use covenant_connector::runtime::NewTransfer;
use covenant_connector::transfer::DataAddress;

/// Epoch millis the test clocks start at.
pub const T0: i64 = 1_700_000_000_000;

pub const PROVIDER_ADDRESS: &str = "https://provider.example/dsp";

/// Dispatcher recording every message it is asked to send.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<RemoteMessage>>,
}

impl RecordingDispatcher {
    pub fn sent(&self) -> Vec<RemoteMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_types(&self, process_id: &str) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.process_id() == process_id)
            .map(RemoteMessage::message_type)
            .collect()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> Result<(), DispatchError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

/// Dispatcher whose counterparty refuses everything.
pub struct RejectingDispatcher;

#[async_trait]
impl Dispatcher for RejectingDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected {
            message_type: message.message_type(),
            reason: "unknown offer".to_string(),
        })
    }
}

/// Dispatcher that cannot reach the counterparty for the first few sends of
/// one message type, then records like [`RecordingDispatcher`].
pub struct FlakyDispatcher {
    message_type: &'static str,
    failures_left: Mutex<u32>,
    failed: Mutex<u32>,
    inner: RecordingDispatcher,
}

impl FlakyDispatcher {
    pub fn new(message_type: &'static str, failures: u32) -> Self {
        Self {
            message_type,
            failures_left: Mutex::new(failures),
            failed: Mutex::new(0),
            inner: RecordingDispatcher::default(),
        }
    }

    pub fn failed(&self) -> u32 {
        *self.failed.lock().unwrap()
    }

    pub fn sent_types(&self, process_id: &str) -> Vec<&'static str> {
        self.inner.sent_types(process_id)
    }
}

#[async_trait]
impl Dispatcher for FlakyDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> Result<(), DispatchError> {
        if message.message_type() == self.message_type {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                *self.failed.lock().unwrap() += 1;
                return Err(DispatchError::Unreachable {
                    address: PROVIDER_ADDRESS.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
        }
        self.inner.dispatch(message).await
    }
}

/// In-memory store whose first `failures` saves fail with a database error.
pub struct UnavailableStore<E: StatefulEntity> {
    inner: InMemoryEntityStore<E>,
    failures_left: AtomicU32,
}

impl<E: StatefulEntity> UnavailableStore<E> {
    pub fn failing(failures: u32) -> Self {
        Self {
            inner: InMemoryEntityStore::new(),
            failures_left: AtomicU32::new(failures),
        }
    }

    pub fn failures_left(&self) -> u32 {
        self.failures_left.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E: StatefulEntity> EntityStore<E> for UnavailableStore<E> {
    async fn find(&self, id: &str) -> StoreResult<Option<E>> {
        self.inner.find(id).await
    }

    async fn save(&self, entity: &mut E) -> StoreResult<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Database {
                operation: "save".to_string(),
                details: "database is locked".to_string(),
            });
        }
        self.inner.save(entity).await
    }

    async fn reschedule(&self, entity: &mut E, not_before_millis: i64) -> StoreResult<()> {
        self.inner.reschedule(entity, not_before_millis).await
    }

    async fn next_for_state(&self, state: E::State, max: usize) -> StoreResult<Vec<E>> {
        self.inner.next_for_state(state, max).await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.inner.delete(id).await
    }

    async fn query(&self, filter: &EntityFilter<E::State>) -> StoreResult<Vec<E>> {
        self.inner.query(filter).await
    }
}

/// In-memory configuration with short polling intervals.
pub fn test_config() -> ConnectorConfig {
    let mut config = ConnectorConfig::default();
    config.core.database_url = "memory".to_string();
    config.core.iteration_wait = Duration::from_millis(5);
    config.core.iteration_wait_max = Duration::from_millis(20);
    config.core.retry_backoff_base = Duration::from_millis(1);
    config.participant_id = "consumer".to_string();
    config.policy_check_interval = Duration::from_secs(30);
    config
}

pub fn offer(policy: Policy) -> ContractOffer {
    ContractOffer {
        id: "offer-1".to_string(),
        asset_id: "asset-1".to_string(),
        policy,
    }
}

pub fn agreement(asset_id: &str, policy: Policy) -> ContractAgreement {
    ContractAgreement {
        id: "agreement-1".to_string(),
        asset_id: asset_id.to_string(),
        provider_id: "provider".to_string(),
        consumer_id: "consumer".to_string(),
        signing_date: T0,
        policy,
    }
}

pub fn new_transfer(policy: Policy) -> NewTransfer {
    NewTransfer {
        asset_id: "asset-1".to_string(),
        contract_id: "agreement-1".to_string(),
        counterparty_id: "provider".to_string(),
        counterparty_address: PROVIDER_ADDRESS.to_string(),
        policy,
        data_destination: DataAddress::new("HttpData")
            .with_property("baseUrl", "https://consumer.example/inbox"),
    }
}

/// Poll `check` until it returns `Some`, failing the test after five seconds.
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Shared handle used by several tests to observe the dispatcher after
/// handing it to the runtime.
pub fn recording() -> Arc<RecordingDispatcher> {
    Arc::new(RecordingDispatcher::default())
}
