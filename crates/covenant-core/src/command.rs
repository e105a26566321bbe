// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Out-of-band commands.
//!
//! Lifecycle changes that do not originate from a manager's own polling
//! (cancellation, inbound protocol events, watchdogs) are queued as
//! [`Command`]s and applied by a [`CommandRunner`] under the same optimistic
//! concurrency rule the manager uses. The [`CommandProcessor`] bounds how often
//! a failing command is retried and spaces the retries out with a backoff, so
//! a command that arrives too early is still applied once its target catches up.
//!
//! ```text
//! enqueue ──► CommandQueue ──► CommandProcessor::process ──► CommandRunner::run
//!                 ▲                       │ failure, retries left:
//!                 └───────────────────────┘ not before now + backoff
//! ```

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::{self, Clock};
use crate::entity::{EntityState, StatefulEntity};
use crate::error::CommandError;
use crate::observe::{EntityListeners, notify_transition};
use crate::retry::{ExponentialWaitStrategy, WaitStrategy};
use crate::store::EntityStore;

/// Retries granted to a new command.
pub const DEFAULT_COMMAND_RETRIES: u32 = 5;

/// The type tag of a command.
pub trait CommandKind: Clone + Debug + Send + Sync + 'static {
    /// Short stable name used in logs and errors.
    fn tag(&self) -> &'static str;
}

/// An instruction targeting one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command<K> {
    /// Unique command ID.
    pub id: Uuid,
    /// Target entity ID.
    pub entity_id: String,
    /// What to do.
    pub kind: K,
    retries_left: u32,
    attempts: u32,
    not_before: i64,
    /// Creation time in epoch millis.
    pub created_at: i64,
}

impl<K: CommandKind> Command<K> {
    /// Create a command with [`DEFAULT_COMMAND_RETRIES`] retries, due at once.
    pub fn new(entity_id: impl Into<String>, kind: K, now_millis: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            kind,
            retries_left: DEFAULT_COMMAND_RETRIES,
            attempts: 0,
            not_before: now_millis,
            created_at: now_millis,
        }
    }

    /// Override the number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_left = retries;
        self
    }

    /// Retries remaining.
    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Whether a failed run may be retried.
    pub fn can_retry(&self) -> bool {
        self.retries_left > 0
    }

    /// Failed runs so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Epoch millis before which the command must not run.
    pub fn not_before(&self) -> i64 {
        self.not_before
    }

    /// Whether the command may run at `now_millis`.
    pub fn is_due(&self, now_millis: i64) -> bool {
        self.not_before <= now_millis
    }

    /// Consume one retry.
    pub fn record_failure(&mut self) {
        self.retries_left = self.retries_left.saturating_sub(1);
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Hold the command back until `not_before_millis`.
    pub fn defer_until(&mut self, not_before_millis: i64) {
        self.not_before = not_before_millis;
    }

    /// The kind's tag.
    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }
}

// ============================================================================
// Queue
// ============================================================================

/// FIFO of pending commands.
#[async_trait]
pub trait CommandQueue<K: CommandKind>: Send + Sync {
    /// Append a command.
    async fn enqueue(&self, command: Command<K>) -> Result<(), CommandError>;

    /// Pop the oldest command.
    async fn dequeue(&self) -> Option<Command<K>>;

    /// Pop up to `max` commands, oldest first.
    async fn dequeue_batch(&self, max: usize) -> Vec<Command<K>>;

    /// Number of queued commands.
    async fn len(&self) -> usize;
}

/// In-memory FIFO with a fixed capacity.
///
/// Commands do not survive a restart. The lock is never held across an
/// await, so synchronous callers such as listeners can use
/// [`try_enqueue`](Self::try_enqueue).
pub struct BoundedCommandQueue<K> {
    items: Mutex<VecDeque<Command<K>>>,
    capacity: usize,
}

impl<K: CommandKind> BoundedCommandQueue<K> {
    /// Create a queue holding at most `capacity` commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Maximum number of queued commands.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a command without awaiting.
    pub fn try_enqueue(&self, command: Command<K>) -> Result<(), CommandError> {
        let mut items = self.items();
        if items.len() >= self.capacity {
            return Err(CommandError::QueueFull {
                capacity: self.capacity,
            });
        }
        items.push_back(command);
        Ok(())
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Command<K>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<K: CommandKind> CommandQueue<K> for BoundedCommandQueue<K> {
    async fn enqueue(&self, command: Command<K>) -> Result<(), CommandError> {
        self.try_enqueue(command)
    }

    async fn dequeue(&self) -> Option<Command<K>> {
        self.items().pop_front()
    }

    async fn dequeue_batch(&self, max: usize) -> Vec<Command<K>> {
        let mut items = self.items();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    async fn len(&self) -> usize {
        self.items().len()
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Applies a command.
#[async_trait]
pub trait CommandRunner<K: CommandKind>: Send + Sync {
    /// Run `command` once.
    async fn run(&self, command: &Command<K>) -> Result<(), CommandError>;
}

/// What a [`CommandHandler`] decided to do with its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEffect<S> {
    /// Nothing to persist.
    Unchanged,
    /// Move to a state.
    TransitionTo(S),
    /// Move to a failure state, recording the reason.
    FailTo(S, String),
}

/// Entity-specific part of a command: decides the effect on the target.
#[async_trait]
pub trait CommandHandler<E: StatefulEntity>: Send + Sync {
    /// The command kinds handled.
    type Kind: CommandKind;

    /// Decide the effect of `command` on `entity`.
    ///
    /// The handler may update the entity's payload; changes are only
    /// persisted together with a state change.
    async fn apply(
        &self,
        command: &Command<Self::Kind>,
        entity: &mut E,
    ) -> Result<CommandEffect<E::State>, CommandError>;
}

/// Runner that loads the target entity, applies a [`CommandHandler`], saves
/// and notifies listeners, acting as the manager would.
pub struct EntityCommandRunner<E: StatefulEntity, H> {
    store: Arc<dyn EntityStore<E>>,
    handler: H,
    listeners: Arc<EntityListeners<E>>,
    clock: Arc<dyn Clock>,
}

impl<E: StatefulEntity, H: CommandHandler<E>> EntityCommandRunner<E, H> {
    /// Create a runner.
    pub fn new(store: Arc<dyn EntityStore<E>>, handler: H) -> Self {
        Self {
            store,
            handler,
            listeners: Arc::new(EntityListeners::new()),
            clock: clock::system(),
        }
    }

    /// Share the listener registry of the entity type's manager.
    pub fn with_listeners(mut self, listeners: Arc<EntityListeners<E>>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Use a specific clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl<E, H> CommandRunner<H::Kind> for EntityCommandRunner<E, H>
where
    E: StatefulEntity,
    H: CommandHandler<E>,
{
    async fn run(&self, command: &Command<H::Kind>) -> Result<(), CommandError> {
        let mut entity = self
            .store
            .find(&command.entity_id)
            .await?
            .ok_or_else(|| CommandError::EntityNotFound {
                entity_type: E::ENTITY_TYPE,
                id: command.entity_id.clone(),
            })?;

        let previous = entity.state();
        if previous.is_terminal() {
            return Err(CommandError::InvalidState {
                command: command.tag(),
                entity_type: E::ENTITY_TYPE,
                id: command.entity_id.clone(),
                state: previous.name(),
            });
        }

        let now = self.clock.now_millis();
        match self.handler.apply(command, &mut entity).await? {
            CommandEffect::Unchanged => {
                debug!(
                    command = command.tag(),
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %command.entity_id,
                    state = previous.name(),
                    "Command left entity unchanged"
                );
                return Ok(());
            }
            CommandEffect::TransitionTo(next) => entity.transition_to(next, now)?,
            CommandEffect::FailTo(next, reason) => entity.fail_to(next, reason, now)?,
        }

        self.store.save(&mut entity).await?;
        notify_transition(&self.listeners, &entity, previous);
        Ok(())
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Drives commands through a runner with bounded, backed-off retries.
pub struct CommandProcessor<K> {
    queue: Arc<dyn CommandQueue<K>>,
    runner: Arc<dyn CommandRunner<K>>,
    backoff: Arc<dyn WaitStrategy>,
    clock: Arc<dyn Clock>,
}

impl<K: CommandKind> CommandProcessor<K> {
    /// Create a processor. Retries back off exponentially from one second.
    pub fn new(queue: Arc<dyn CommandQueue<K>>, runner: Arc<dyn CommandRunner<K>>) -> Self {
        Self {
            queue,
            runner,
            backoff: Arc::new(ExponentialWaitStrategy::new(
                Duration::from_secs(1),
                Duration::from_secs(60),
            )),
            clock: clock::system(),
        }
    }

    /// Delay between retries of a failed command, by number of failures.
    pub fn with_backoff(mut self, backoff: Arc<dyn WaitStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Use a specific clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The queue failed commands are returned to.
    pub fn queue(&self) -> &Arc<dyn CommandQueue<K>> {
        &self.queue
    }

    /// Run one command to completion.
    ///
    /// Returns `true` when the runner succeeded. A failed command with retries
    /// left is re-enqueued and held back by the backoff; an exhausted one is
    /// dropped.
    pub async fn process(&self, mut command: Command<K>) -> bool {
        let result = self.runner.run(&command).await;
        let e = match result {
            Ok(()) => {
                debug!(
                    command_id = %command.id,
                    command = command.tag(),
                    entity_id = %command.entity_id,
                    "Command processed"
                );
                return true;
            }
            Err(e) => e,
        };

        if command.can_retry() {
            command.record_failure();
            let delay = self.backoff.wait_for(command.attempts());
            command.defer_until(self.clock.now_millis() + delay.as_millis() as i64);
            warn!(
                command_id = %command.id,
                command = command.tag(),
                entity_id = %command.entity_id,
                retries_left = command.retries_left(),
                retry_in_ms = delay.as_millis() as u64,
                error = %e,
                "Command failed, re-enqueueing"
            );
            if let Err(enqueue_err) = self.queue.enqueue(command).await {
                error!(error = %enqueue_err, "Failed to re-enqueue command, dropping it");
            }
        } else {
            error!(
                command_id = %command.id,
                command = command.tag(),
                entity_id = %command.entity_id,
                error = %e,
                "Command failed and has no retries left, dropping it"
            );
        }
        false
    }
}

/// Type-erased command draining, so managers can pump any command kind.
#[async_trait]
pub trait CommandDrain: Send + Sync {
    /// Process up to `max` queued commands that are due. Returns how many
    /// succeeded; failed and not-yet-due commands do not count as progress.
    async fn drain(&self, max: usize) -> usize;
}

#[async_trait]
impl<K: CommandKind> CommandDrain for CommandProcessor<K> {
    async fn drain(&self, max: usize) -> usize {
        // Take the batch up front so re-enqueued commands wait for the next tick.
        let batch = self.queue.dequeue_batch(max).await;
        let now = self.clock.now_millis();
        let mut succeeded = 0;
        for command in batch {
            if !command.is_due(now) {
                if let Err(e) = self.queue.enqueue(command).await {
                    error!(error = %e, "Failed to re-enqueue deferred command, dropping it");
                }
                continue;
            }
            if self.process(command).await {
                succeeded += 1;
            }
        }
        succeeded
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::fixtures::{Job, JobState};
    use crate::retry::FixedWaitStrategy;
    use crate::store::InMemoryEntityStore;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum JobCommand {
        Complete,
        Cancel { reason: String },
    }

    impl CommandKind for JobCommand {
        fn tag(&self) -> &'static str {
            match self {
                Self::Complete => "complete",
                Self::Cancel { .. } => "cancel",
            }
        }
    }

    struct JobCommandHandler;

    #[async_trait]
    impl CommandHandler<Job> for JobCommandHandler {
        type Kind = JobCommand;

        async fn apply(
            &self,
            command: &Command<JobCommand>,
            entity: &mut Job,
        ) -> Result<CommandEffect<JobState>, CommandError> {
            Ok(match &command.kind {
                JobCommand::Complete if entity.state() == JobState::Requested => {
                    CommandEffect::TransitionTo(JobState::Completed)
                }
                JobCommand::Complete => CommandEffect::Unchanged,
                JobCommand::Cancel { reason } => {
                    CommandEffect::FailTo(JobState::Terminated, reason.clone())
                }
            })
        }
    }

    struct CountingRunner {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CommandRunner<JobCommand> for CountingRunner {
        async fn run(&self, _: &Command<JobCommand>) -> Result<(), CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CommandError::Rejected("nope".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn processor(fail: bool, clock: &ManualClock) -> (CommandProcessor<JobCommand>, Arc<CountingRunner>) {
        let runner = Arc::new(CountingRunner {
            calls: AtomicUsize::new(0),
            fail,
        });
        let queue: Arc<dyn CommandQueue<JobCommand>> = Arc::new(BoundedCommandQueue::new(16));
        let processor = CommandProcessor::new(queue, runner.clone())
            .with_backoff(Arc::new(FixedWaitStrategy::new(Duration::from_secs(1))))
            .with_clock(Arc::new(clock.clone()));
        (processor, runner)
    }

    #[test]
    fn test_command_retry_accounting() {
        let mut command = Command::new("job-1", JobCommand::Complete, 42).with_retries(1);
        assert_eq!(command.created_at, 42);
        assert!(command.is_due(42));
        assert!(!command.is_due(41));
        assert!(command.can_retry());
        command.record_failure();
        assert!(!command.can_retry());
        command.record_failure();
        assert_eq!(command.retries_left(), 0);
        assert_eq!(command.tag(), "complete");
    }

    #[tokio::test]
    async fn test_bounded_queue_is_fifo_and_rejects_overflow() {
        let queue = BoundedCommandQueue::new(2);
        queue.enqueue(Command::new("a", JobCommand::Complete, 0)).await.unwrap();
        queue.enqueue(Command::new("b", JobCommand::Complete, 0)).await.unwrap();

        let err = queue
            .enqueue(Command::new("c", JobCommand::Complete, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::QueueFull { capacity: 2 }));

        assert_eq!(queue.dequeue().await.unwrap().entity_id, "a");
        assert_eq!(queue.dequeue_batch(10).await.len(), 1);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_successful_command_is_not_requeued() {
        let (processor, runner) = processor(false, &ManualClock::new(0));
        assert!(processor.process(Command::new("job-1", JobCommand::Complete, 0)).await);
        assert_eq!(processor.queue().len().await, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_command_is_requeued_until_exhausted() {
        let clock = ManualClock::new(0);
        let (processor, runner) = processor(true, &clock);
        let command = Command::new("job-1", JobCommand::Complete, 0).with_retries(2);

        assert!(!processor.process(command).await);
        let requeued = processor.queue().dequeue().await.unwrap();
        assert_eq!(requeued.retries_left(), 1);
        assert_eq!(requeued.attempts(), 1);
        assert_eq!(requeued.not_before(), 1_000);

        assert!(!processor.process(requeued).await);
        let requeued = processor.queue().dequeue().await.unwrap();
        assert_eq!(requeued.retries_left(), 0);

        assert!(!processor.process(requeued).await);
        assert_eq!(processor.queue().len().await, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drain_defers_requeued_commands() {
        let clock = ManualClock::new(0);
        let (processor, runner) = processor(true, &clock);
        processor
            .queue()
            .enqueue(Command::new("job-1", JobCommand::Complete, 0))
            .await
            .unwrap();

        // A failure is not progress.
        assert_eq!(processor.drain(10).await, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(processor.queue().len().await, 1);

        // Held back until the backoff elapsed.
        clock.advance(Duration::from_millis(999));
        assert_eq!(processor.drain(10).await, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(processor.queue().len().await, 1);

        clock.advance(Duration::from_millis(1));
        processor.drain(10).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drain_counts_successes() {
        let (processor, runner) = processor(false, &ManualClock::new(0));
        for id in ["job-1", "job-2"] {
            processor
                .queue()
                .enqueue(Command::new(id, JobCommand::Complete, 0))
                .await
                .unwrap();
        }

        assert_eq!(processor.drain(10).await, 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entity_runner_applies_transition() {
        let store = Arc::new(InMemoryEntityStore::<Job>::new());
        let mut job = Job::in_state("job-1", JobState::Requested, 0);
        store.save(&mut job).await.unwrap();

        let runner = EntityCommandRunner::new(store.clone(), JobCommandHandler);
        runner
            .run(&Command::new("job-1", JobCommand::Complete, 0))
            .await
            .unwrap();

        let stored = store.find("job-1").await.unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Completed);
    }

    #[tokio::test]
    async fn test_entity_runner_records_failure_reason() {
        let store = Arc::new(InMemoryEntityStore::<Job>::new());
        store.save(&mut Job::new("job-1", 0)).await.unwrap();

        let runner = EntityCommandRunner::new(store.clone(), JobCommandHandler);
        let cancel = JobCommand::Cancel {
            reason: "operator request".to_string(),
        };
        runner.run(&Command::new("job-1", cancel, 0)).await.unwrap();

        let stored = store.find("job-1").await.unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Terminated);
        assert_eq!(stored.meta.error_detail(), Some("operator request"));
    }

    #[tokio::test]
    async fn test_entity_runner_errors() {
        let store = Arc::new(InMemoryEntityStore::<Job>::new());
        let runner = EntityCommandRunner::new(store.clone(), JobCommandHandler);

        let err = runner
            .run(&Command::new("missing", JobCommand::Complete, 0))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Could not find job with ID [missing]");

        store
            .save(&mut Job::in_state("done", JobState::Completed, 0))
            .await
            .unwrap();
        let err = runner
            .run(&Command::new("done", JobCommand::Complete, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidState { state: "COMPLETED", .. }));
    }

    #[tokio::test]
    async fn test_entity_runner_no_op_keeps_version() {
        let store = Arc::new(InMemoryEntityStore::<Job>::new());
        let mut job = Job::new("job-1", 0);
        store.save(&mut job).await.unwrap();

        let runner = EntityCommandRunner::new(store.clone(), JobCommandHandler);
        runner
            .run(&Command::new("job-1", JobCommand::Complete, 0))
            .await
            .unwrap();

        let stored = store.find("job-1").await.unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Requesting);
        assert_eq!(stored.meta.version(), job.meta.version());
    }
}
