// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State machine manager.
//!
//! One manager drives all entities of one process type. It owns a table of
//! `state -> handler` and polls the store:
//!
//! ```text
//! loop {
//!     drain queued commands
//!     for (state, handler) in table {
//!         batch = store.next_for_state(state, batch_size)   // claim
//!         run handlers of batch concurrently
//!         apply outcomes: save / reschedule / fail, notify listeners
//!     }
//!     nothing processed? sleep(wait_strategy(idle_ticks)), interruptible
//! }
//! ```
//!
//! Ticks never overlap. Handlers of one batch may run concurrently because
//! each claimed entity is exclusively leased to this manager.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = StateMachineManager::builder("negotiation", store)
//!     .on_state(NegotiationState::Requesting, SendRequest::new(dispatcher))
//!     .on_state_fn(NegotiationState::Agreed, |_| Outcome::Proceed(NegotiationState::Verifying))
//!     .batch_size(10)
//!     .retry_policy(RetryPolicy::default())
//!     .build();
//!
//! let handle = manager.start();
//! // ...
//! handle.shutdown();
//! handle.join().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{self, Clock};
use crate::command::CommandDrain;
use crate::entity::{EntityState, StatefulEntity};
use crate::error::{ManagerError, StoreError};
use crate::observe::{EntityListener, EntityListeners, notify_transition};
use crate::retry::{ExponentialWaitStrategy, RetryPolicy, WaitStrategy};
use crate::store::EntityStore;

/// Entities claimed per state per tick unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Result of running a state handler on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<S> {
    /// Move to the given state.
    Proceed(S),
    /// Try again later. After too many attempts the entity moves to its
    /// failure state with the reason as error detail.
    Retry(String),
    /// Move to the failure state now.
    Fatal(String),
    /// Nothing to do yet. Check again after the delay without consuming a retry.
    Pending(Duration),
}

impl<S> Outcome<S> {
    /// `Retry` with a reason.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    /// `Fatal` with a reason.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }
}

/// Business logic for entities in one state.
#[async_trait]
pub trait StateHandler<E: StatefulEntity>: Send + Sync {
    /// Process a claimed entity. The handler may update the payload.
    async fn handle(&self, entity: &mut E) -> Outcome<E::State>;
}

/// Adapter turning a synchronous closure into a [`StateHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<E, F> StateHandler<E> for FnHandler<F>
where
    E: StatefulEntity,
    F: Fn(&mut E) -> Outcome<E::State> + Send + Sync,
{
    async fn handle(&self, entity: &mut E) -> Outcome<E::State> {
        (self.0)(entity)
    }
}

/// Builder for [`StateMachineManager`].
pub struct StateMachineManagerBuilder<E: StatefulEntity> {
    name: String,
    store: Arc<dyn EntityStore<E>>,
    handlers: Vec<(E::State, Arc<dyn StateHandler<E>>)>,
    wait_strategy: Arc<dyn WaitStrategy>,
    batch_size: usize,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    listeners: Arc<EntityListeners<E>>,
    commands: Vec<Arc<dyn CommandDrain>>,
}

impl<E: StatefulEntity> std::fmt::Debug for StateMachineManagerBuilder<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineManagerBuilder")
            .field("name", &self.name)
            .field(
                "states",
                &self.handlers.iter().map(|(s, _)| s.name()).collect::<Vec<_>>(),
            )
            .field("wait_strategy", &self.wait_strategy)
            .field("batch_size", &self.batch_size)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl<E: StatefulEntity> StateMachineManagerBuilder<E> {
    /// Install the handler for `state`, replacing any previous one.
    pub fn on_state(mut self, state: E::State, handler: impl StateHandler<E> + 'static) -> Self {
        let handler: Arc<dyn StateHandler<E>> = Arc::new(handler);
        match self.handlers.iter_mut().find(|(s, _)| *s == state) {
            Some(entry) => entry.1 = handler,
            None => self.handlers.push((state, handler)),
        }
        self
    }

    /// Install a synchronous closure as the handler for `state`.
    pub fn on_state_fn<F>(self, state: E::State, f: F) -> Self
    where
        F: Fn(&mut E) -> Outcome<E::State> + Send + Sync + 'static,
    {
        self.on_state(state, FnHandler(f))
    }

    /// Backoff used when a tick finds no work.
    ///
    /// Default: exponential from 1 s up to 10 s.
    pub fn wait_strategy(mut self, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    /// Entities claimed per state per tick. Default: 5.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Per-entity retry limit and backoff.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Time source for transitions and backoff.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a transition listener.
    pub fn listener(self, listener: Arc<dyn EntityListener<E>>) -> Self {
        self.listeners.register(listener);
        self
    }

    /// Use a listener registry shared with other components, such as the
    /// command runner of the same entity type.
    pub fn listeners(mut self, listeners: Arc<EntityListeners<E>>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Drain this command processor at the top of every tick.
    pub fn commands(mut self, commands: Arc<dyn CommandDrain>) -> Self {
        self.commands.push(commands);
        self
    }

    /// Build the manager.
    pub fn build(self) -> StateMachineManager<E> {
        let (shutdown_tx, _) = watch::channel(false);
        StateMachineManager {
            name: self.name,
            store: self.store,
            handlers: self.handlers,
            wait_strategy: self.wait_strategy,
            batch_size: self.batch_size,
            retry_policy: self.retry_policy,
            clock: self.clock,
            listeners: self.listeners,
            commands: self.commands,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }
}

/// Polls the store and drives entities of type `E` through their lifecycle.
pub struct StateMachineManager<E: StatefulEntity> {
    name: String,
    store: Arc<dyn EntityStore<E>>,
    handlers: Vec<(E::State, Arc<dyn StateHandler<E>>)>,
    wait_strategy: Arc<dyn WaitStrategy>,
    batch_size: usize,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    listeners: Arc<EntityListeners<E>>,
    commands: Vec<Arc<dyn CommandDrain>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl<E: StatefulEntity> StateMachineManager<E> {
    /// Start building a manager named `name` over `store`.
    pub fn builder(
        name: impl Into<String>,
        store: Arc<dyn EntityStore<E>>,
    ) -> StateMachineManagerBuilder<E> {
        StateMachineManagerBuilder {
            name: name.into(),
            store,
            handlers: Vec::new(),
            wait_strategy: Arc::new(ExponentialWaitStrategy::new(
                Duration::from_secs(1),
                Duration::from_secs(10),
            )),
            batch_size: DEFAULT_BATCH_SIZE,
            retry_policy: RetryPolicy::default(),
            clock: clock::system(),
            listeners: Arc::new(EntityListeners::new()),
            commands: Vec::new(),
        }
    }

    /// Manager name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The listener registry, shareable with command runners.
    pub fn listeners(&self) -> &Arc<EntityListeners<E>> {
        &self.listeners
    }

    /// Ask a running loop to stop after the current tick.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Run one tick. Returns the number of commands and entities processed.
    ///
    /// Concurrency conflicts are logged and skipped. Store failures and
    /// illegal transitions are returned after every handler of the failing
    /// batch has finished.
    pub async fn tick(&self) -> Result<usize, ManagerError> {
        let mut processed = 0;

        for commands in &self.commands {
            processed += commands.drain(self.batch_size).await;
        }

        for (state, handler) in &self.handlers {
            if *self.shutdown_tx.borrow() {
                break;
            }

            let batch = self.store.next_for_state(*state, self.batch_size).await?;
            if batch.is_empty() {
                continue;
            }
            processed += batch.len();
            debug!(
                manager = %self.name,
                state = state.name(),
                claimed = batch.len(),
                "Claimed batch"
            );

            let results = join_all(
                batch
                    .into_iter()
                    .map(|entity| self.process(entity, handler.as_ref())),
            )
            .await;

            let mut first_error = None;
            for result in results {
                match result {
                    Ok(()) => {}
                    Err(e @ ManagerError::IllegalTransition { .. }) => return Err(e),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(processed)
    }

    /// Run ticks until shut down.
    ///
    /// Returns an error only for an illegal transition, which indicates a
    /// defect in a handler.
    pub async fn run(&self) -> Result<(), ManagerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut idle_ticks: u32 = 0;

        info!(
            manager = %self.name,
            states = self.handlers.len(),
            batch_size = self.batch_size,
            retry_limit = self.retry_policy.retry_limit,
            "State machine manager started"
        );

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            let delay = match self.tick().await {
                Ok(0) => {
                    idle_ticks = idle_ticks.saturating_add(1);
                    self.wait_strategy.wait_for(idle_ticks)
                }
                Ok(_) => {
                    idle_ticks = 0;
                    continue;
                }
                Err(e @ ManagerError::IllegalTransition { .. }) => {
                    error!(manager = %self.name, error = %e, "Illegal transition, stopping manager");
                    return Err(e);
                }
                Err(e) => {
                    idle_ticks = idle_ticks.saturating_add(1);
                    error!(manager = %self.name, error = %e, "Tick failed");
                    self.wait_strategy.wait_for(idle_ticks)
                }
            };

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {}

                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(manager = %self.name, "State machine manager stopped");
        Ok(())
    }

    /// Spawn [`run`](Self::run) on the tokio runtime.
    pub fn start(self) -> ManagerHandle {
        let name = self.name.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let task = tokio::spawn(async move { self.run().await });
        ManagerHandle {
            name,
            shutdown_tx,
            task,
        }
    }

    async fn process(
        &self,
        mut entity: E,
        handler: &dyn StateHandler<E>,
    ) -> Result<(), ManagerError> {
        let previous = entity.state();
        let outcome = handler.handle(&mut entity).await;
        let now = self.clock.now_millis();

        let result = match outcome {
            Outcome::Proceed(next) => {
                entity
                    .transition_to(next, now)
                    .map_err(|source| self.illegal(source))?;
                self.commit(&mut entity, previous).await
            }
            Outcome::Fatal(reason) => self.fail(&mut entity, previous, reason, now).await?,
            Outcome::Retry(reason) => {
                let attempts = entity.meta().state_count();
                if self.retry_policy.is_exhausted(attempts) {
                    warn!(
                        manager = %self.name,
                        entity_id = %entity.id(),
                        state = previous.name(),
                        attempts,
                        reason = %reason,
                        "Retry limit exceeded"
                    );
                    self.fail(&mut entity, previous, reason, now).await?
                } else {
                    let delay = self.retry_policy.delay(attempts);
                    debug!(
                        manager = %self.name,
                        entity_id = %entity.id(),
                        state = previous.name(),
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Retrying later"
                    );
                    self.store
                        .reschedule(&mut entity, now + delay.as_millis() as i64)
                        .await
                }
            }
            Outcome::Pending(delay) => {
                entity.meta_mut().reset_attempts();
                self.store
                    .reschedule(&mut entity, now + delay.as_millis() as i64)
                    .await
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(
                    manager = %self.name,
                    entity_id = %entity.id(),
                    error = %e,
                    "Entity advanced concurrently, discarding result"
                );
                Ok(())
            }
            Err(e) => Err(ManagerError::Store(e)),
        }
    }

    async fn commit(&self, entity: &mut E, previous: E::State) -> Result<(), StoreError> {
        self.store.save(entity).await?;
        debug!(
            manager = %self.name,
            entity_id = %entity.id(),
            from = previous.name(),
            to = entity.state().name(),
            "Entity transitioned"
        );
        notify_transition(&self.listeners, entity, previous);
        Ok(())
    }

    /// Move to the failure state of `previous`. The outer result carries
    /// illegal transitions, the inner one store errors.
    async fn fail(
        &self,
        entity: &mut E,
        previous: E::State,
        reason: String,
        now: i64,
    ) -> Result<Result<(), StoreError>, ManagerError> {
        entity
            .fail_to(previous.failure_state(), reason, now)
            .map_err(|source| self.illegal(source))?;
        Ok(self.commit(entity, previous).await)
    }

    fn illegal(&self, source: crate::error::IllegalTransition) -> ManagerError {
        error!(
            manager = %self.name,
            entity_type = source.entity_type,
            entity_id = %source.id,
            from = source.from,
            to = source.to,
            "Handler requested an illegal transition"
        );
        ManagerError::IllegalTransition {
            manager: self.name.clone(),
            source,
        }
    }
}

/// Handle to a manager running on its own task.
#[derive(Debug)]
pub struct ManagerHandle {
    name: String,
    shutdown_tx: Arc<watch::Sender<bool>>,
    task: JoinHandle<Result<(), ManagerError>>,
}

impl ManagerHandle {
    /// Manager name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the manager to stop. In-flight handlers finish first.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Whether the manager task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait for the manager task to end.
    pub async fn join(self) -> Result<(), ManagerError> {
        self.task
            .await
            .map_err(|e| ManagerError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::fixtures::{Job, JobState};
    use crate::store::{InMemoryEntityStore, StoreOptions};

    fn fixture() -> (Arc<InMemoryEntityStore<Job>>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let store = Arc::new(InMemoryEntityStore::with_options(
            StoreOptions::default().with_clock(Arc::new(clock.clone())),
        ));
        (store, clock)
    }

    #[tokio::test]
    async fn test_proceed_transitions_and_saves() {
        let (store, clock) = fixture();
        store.save(&mut Job::new("job-1", 0)).await.unwrap();

        let manager = StateMachineManager::builder("jobs", store.clone())
            .on_state_fn(JobState::Requesting, |job: &mut Job| {
                job.payload = "sent".to_string();
                Outcome::Proceed(JobState::Requested)
            })
            .clock(Arc::new(clock.clone()))
            .build();

        assert_eq!(manager.tick().await.unwrap(), 1);

        let job = store.find("job-1").await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Requested);
        assert_eq!(job.payload, "sent");
        assert_eq!(job.meta.state_count(), 0);
        assert_eq!(manager.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_moves_to_failure_state() {
        let (store, clock) = fixture();
        store.save(&mut Job::new("job-1", 0)).await.unwrap();

        let manager = StateMachineManager::builder("jobs", store.clone())
            .on_state_fn(JobState::Requesting, |_: &mut Job| {
                Outcome::retry("handler failed")
            })
            .retry_policy(RetryPolicy::immediate(2))
            .clock(Arc::new(clock.clone()))
            .build();

        for attempt in 1..=2 {
            manager.tick().await.unwrap();
            let job = store.find("job-1").await.unwrap().unwrap();
            assert_eq!(job.state(), JobState::Requesting);
            assert_eq!(job.meta.state_count(), attempt);
        }

        manager.tick().await.unwrap();
        let job = store.find("job-1").await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Terminated);
        assert_eq!(job.meta.error_detail(), Some("handler failed"));
        assert_eq!(job.meta.state_count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_ignores_retry_budget() {
        let (store, clock) = fixture();
        store.save(&mut Job::new("job-1", 0)).await.unwrap();

        let manager = StateMachineManager::builder("jobs", store.clone())
            .on_state_fn(JobState::Requesting, |_: &mut Job| Outcome::fatal("rejected"))
            .clock(Arc::new(clock))
            .build();
        manager.tick().await.unwrap();

        let job = store.find("job-1").await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Terminated);
        assert_eq!(job.meta.error_detail(), Some("rejected"));
    }

    #[tokio::test]
    async fn test_illegal_transition_aborts_without_saving() {
        let (store, clock) = fixture();
        store.save(&mut Job::new("job-1", 0)).await.unwrap();
        let before = store.find("job-1").await.unwrap().unwrap();

        let manager = StateMachineManager::builder("jobs", store.clone())
            .on_state_fn(JobState::Requesting, |_: &mut Job| {
                Outcome::Proceed(JobState::Completed)
            })
            .clock(Arc::new(clock))
            .build();

        let err = manager.tick().await.unwrap_err();
        assert!(matches!(err, ManagerError::IllegalTransition { .. }));

        let after = store.find("job-1").await.unwrap().unwrap();
        assert_eq!(after.state(), JobState::Requesting);
        // Only the claim touched the entity.
        assert_eq!(after.meta.version(), before.meta.version() + 1);
    }

    #[tokio::test]
    async fn test_pending_reschedules_without_consuming_retries() {
        let (store, clock) = fixture();
        store
            .save(&mut Job::in_state("job-1", JobState::Requested, 0))
            .await
            .unwrap();

        let manager = StateMachineManager::builder("jobs", store.clone())
            .on_state_fn(JobState::Requested, |_: &mut Job| {
                Outcome::Pending(Duration::from_secs(30))
            })
            .retry_policy(RetryPolicy::immediate(0))
            .clock(Arc::new(clock.clone()))
            .build();

        assert_eq!(manager.tick().await.unwrap(), 1);
        assert_eq!(manager.tick().await.unwrap(), 0);

        clock.advance(Duration::from_secs(30));
        assert_eq!(manager.tick().await.unwrap(), 1);

        let job = store.find("job-1").await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Requested);
        assert_eq!(job.meta.state_count(), 0);
    }

    #[tokio::test]
    async fn test_listeners_see_committed_transitions() {
        struct Recorder(Mutex<Vec<(String, JobState, JobState)>>);

        impl EntityListener<Job> for Recorder {
            fn on_transition(&self, job: &Job, previous: JobState) -> anyhow::Result<()> {
                self.0
                    .lock()
                    .unwrap()
                    .push((job.id().to_string(), previous, job.state()));
                Ok(())
            }
        }

        let (store, clock) = fixture();
        store.save(&mut Job::new("job-1", 0)).await.unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        let manager = StateMachineManager::builder("jobs", store.clone())
            .on_state_fn(JobState::Requesting, |_: &mut Job| {
                Outcome::Proceed(JobState::Requested)
            })
            .on_state_fn(JobState::Requested, |_: &mut Job| {
                Outcome::Proceed(JobState::Completed)
            })
            .listener(recorder.clone())
            .clock(Arc::new(clock))
            .build();

        manager.tick().await.unwrap();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                ("job-1".to_string(), JobState::Requesting, JobState::Requested),
                ("job-1".to_string(), JobState::Requested, JobState::Completed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_manager_stops_on_shutdown() {
        let (store, _) = fixture();
        let manager = StateMachineManager::builder("jobs", store)
            .on_state_fn(JobState::Requesting, |_: &mut Job| {
                Outcome::Proceed(JobState::Requested)
            })
            .build();

        let handle = manager.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.is_running());

        handle.shutdown();
        handle.join().await.unwrap();
    }
}
