// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener registry and transition events.
//!
//! Listeners are invoked synchronously, in registration order, after a
//! transition has been persisted. A failing or panicking listener is logged
//! and skipped; it never affects the entity or the remaining listeners.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::entity::{EntityState, StatefulEntity};

/// Ordered set of listeners of type `L`.
pub struct Observable<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for Observable<L> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> Observable<L> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn register(&self, listener: Arc<L>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for every listener in registration order.
    ///
    /// Errors and panics raised by `f` are logged and swallowed.
    pub fn invoke_for_each<F>(&self, f: F)
    where
        F: Fn(&L) -> anyhow::Result<()>,
    {
        // Snapshot so listeners may register further listeners.
        let listeners: Vec<Arc<L>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, listener) in listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = index, error = %e, "Listener failed");
                }
                Err(payload) => {
                    error!(
                        listener = index,
                        panic = panic_message(payload.as_ref()),
                        "Listener panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// Receives every persisted state change of entities of type `E`.
pub trait EntityListener<E: StatefulEntity>: Send + Sync {
    /// Called after `entity` moved from `previous` to its current state.
    fn on_transition(&self, entity: &E, previous: E::State) -> anyhow::Result<()>;
}

/// Registry of [`EntityListener`]s for one entity type.
pub type EntityListeners<E> = Observable<dyn EntityListener<E>>;

/// Notify every listener of a committed transition.
pub(crate) fn notify_transition<E: StatefulEntity>(
    listeners: &EntityListeners<E>,
    entity: &E,
    previous: E::State,
) {
    listeners.invoke_for_each(|l| l.on_transition(entity, previous));
}

/// Externally visible record of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    /// Entity type name.
    pub entity_type: String,
    /// Entity ID.
    pub entity_id: String,
    /// State before the transition.
    pub from: String,
    /// State after the transition.
    pub to: String,
    /// Failure reason, if the target is a failure state.
    pub error_detail: Option<String>,
    /// Epoch millis of the transition.
    pub timestamp: i64,
}

impl TransitionEvent {
    /// Build the event for a transition of `entity` out of `previous`.
    pub fn of<E: StatefulEntity>(entity: &E, previous: E::State) -> Self {
        let meta = entity.meta();
        Self {
            entity_type: E::ENTITY_TYPE.to_string(),
            entity_id: meta.id().to_string(),
            from: previous.name().to_string(),
            to: meta.state().name().to_string(),
            error_detail: meta.error_detail().map(str::to_string),
            timestamp: meta.state_timestamp(),
        }
    }
}

/// Listener that publishes [`TransitionEvent`]s on a broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<TransitionEvent>,
}

impl EventPublisher {
    /// Create a publisher buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: TransitionEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl<E: StatefulEntity> EntityListener<E> for EventPublisher {
    fn on_transition(&self, entity: &E, previous: E::State) -> anyhow::Result<()> {
        self.publish(TransitionEvent::of(entity, previous));
        Ok(())
    }
}
