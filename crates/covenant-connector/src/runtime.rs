// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable connector runtime.
//!
//! [`ConnectorRuntime`] wires stores, command queues, managers, listeners and
//! retention workers together and runs them on the current tokio runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use covenant_connector::config::ConnectorConfig;
//! use covenant_connector::runtime::ConnectorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ConnectorRuntime::builder()
//!         .config(ConnectorConfig::from_env()?)
//!         .dispatcher(Arc::new(MyDspClient::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let negotiation_id = runtime
//!         .initiate_negotiation("provider", "https://provider.example/dsp", offer)
//!         .await?;
//!
//!     // ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use covenant_core::clock::{self, Clock};
use covenant_core::retention::RetentionWorker;
use covenant_core::{
    BoundedCommandQueue, Command, CommandProcessor, CommandQueue, EntityCommandRunner,
    EntityListener, EntityListeners, EventPublisher, ManagerHandle, StatefulEntity,
    TransitionEvent,
};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ConnectorConfig;
use crate::dispatch::{Dispatcher, LoggingDispatcher};
use crate::error::Error;
use crate::negotiation::{
    self, ContractNegotiation, ContractOffer, NegotiationCommand, NegotiationCommandHandler,
    NegotiationListener, NegotiationListenerAdapter,
};
use crate::policy::{Policy, PolicyEngine, RuleBasedPolicyEngine};
use crate::policy_monitor::{
    self, CheckPolicy, CreateMonitorEntry, PolicyMonitorCommand, PolicyMonitorEntry, StartMonitoring,
};
use crate::provision::{NoopProvisioner, Provisioner};
use crate::stores::Stores;
use crate::transfer::{
    self, DataAddress, TransferCommand, TransferCommandHandler, TransferListener,
    TransferListenerAdapter, TransferProcess,
};

/// Parameters of a new transfer.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    /// Asset to transfer.
    pub asset_id: String,
    /// Finalized agreement covering the asset.
    pub contract_id: String,
    /// Provider participant ID.
    pub counterparty_id: String,
    /// Provider protocol endpoint.
    pub counterparty_address: String,
    /// Agreed usage policy.
    pub policy: Policy,
    /// Where the data should be delivered.
    pub data_destination: DataAddress,
}

/// Builder for creating a [`ConnectorRuntime`].
pub struct ConnectorRuntimeBuilder {
    config: ConnectorConfig,
    stores: Option<Stores>,
    dispatcher: Arc<dyn Dispatcher>,
    provisioner: Arc<dyn Provisioner>,
    policy_engine: Arc<dyn PolicyEngine>,
    clock: Arc<dyn Clock>,
    negotiation_listeners: Vec<Arc<dyn EntityListener<ContractNegotiation>>>,
    transfer_listeners: Vec<Arc<dyn EntityListener<TransferProcess>>>,
}

impl std::fmt::Debug for ConnectorRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRuntimeBuilder")
            .field("config", &self.config)
            .field("stores", &self.stores.as_ref().map(|_| "..."))
            .field("negotiation_listeners", &self.negotiation_listeners.len())
            .field("transfer_listeners", &self.transfer_listeners.len())
            .finish()
    }
}

impl Default for ConnectorRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: ConnectorConfig::default(),
            stores: None,
            dispatcher: Arc::new(LoggingDispatcher),
            provisioner: Arc::new(NoopProvisioner),
            policy_engine: Arc::new(RuleBasedPolicyEngine),
            clock: clock::system(),
            negotiation_listeners: Vec::new(),
            transfer_listeners: Vec::new(),
        }
    }
}

impl ConnectorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    ///
    /// Default: [`ConnectorConfig::default`]
    pub fn config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use these stores instead of opening the configured backend.
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Set the outbound message dispatcher.
    ///
    /// Default: [`LoggingDispatcher`]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the resource provisioner.
    ///
    /// Default: [`NoopProvisioner`]
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Set the policy engine used by the policy monitor.
    ///
    /// Default: [`RuleBasedPolicyEngine`]
    pub fn policy_engine(mut self, policy_engine: Arc<dyn PolicyEngine>) -> Self {
        self.policy_engine = policy_engine;
        self
    }

    /// Set the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a negotiation listener.
    pub fn negotiation_listener(mut self, listener: impl NegotiationListener + 'static) -> Self {
        self.negotiation_listeners
            .push(Arc::new(NegotiationListenerAdapter(listener)));
        self
    }

    /// Register a transfer listener.
    pub fn transfer_listener(mut self, listener: impl TransferListener + 'static) -> Self {
        self.transfer_listeners
            .push(Arc::new(TransferListenerAdapter(listener)));
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if the configured store backend is invalid.
    pub fn build(self) -> Result<ConnectorRuntimeConfig> {
        if self.stores.is_none() {
            self.config.core.store_backend()?;
        }
        if self.config.participant_id.trim().is_empty() {
            anyhow::bail!("participant_id is required");
        }

        Ok(ConnectorRuntimeConfig { inner: self })
    }
}

/// Configuration for a [`ConnectorRuntime`].
#[derive(Debug)]
pub struct ConnectorRuntimeConfig {
    inner: ConnectorRuntimeBuilder,
}

impl ConnectorRuntimeConfig {
    /// Open the stores and start every manager and worker.
    pub async fn start(self) -> Result<ConnectorRuntime> {
        let ConnectorRuntimeBuilder {
            config,
            stores,
            dispatcher,
            provisioner,
            policy_engine,
            clock,
            negotiation_listeners,
            transfer_listeners,
        } = self.inner;
        let core = &config.core;

        let stores = match stores {
            Some(stores) => stores,
            None => Stores::open(&core.store_backend()?, core.store_options(clock.clone())).await?,
        };

        let events = Arc::new(EventPublisher::default());

        let negotiation_events = Arc::new(EntityListeners::<ContractNegotiation>::new());
        negotiation_events.register(events.clone());
        for listener in negotiation_listeners {
            negotiation_events.register(listener);
        }

        let transfer_events = Arc::new(EntityListeners::<TransferProcess>::new());
        transfer_events.register(events.clone());
        let monitor_commands = Arc::new(BoundedCommandQueue::<PolicyMonitorCommand>::new(
            config.command_queue_capacity,
        ));
        transfer_events.register(Arc::new(TransferListenerAdapter(
            StartMonitoring::new(monitor_commands.clone(), clock.clone())
                .with_command_retries(core.command_retries),
        )));
        for listener in transfer_listeners {
            transfer_events.register(listener);
        }

        let monitor_events = Arc::new(EntityListeners::<PolicyMonitorEntry>::new());
        monitor_events.register(events.clone());

        let negotiation_commands: Arc<dyn CommandQueue<NegotiationCommand>> =
            Arc::new(BoundedCommandQueue::new(config.command_queue_capacity));
        let transfer_commands: Arc<dyn CommandQueue<TransferCommand>> =
            Arc::new(BoundedCommandQueue::new(config.command_queue_capacity));

        let negotiation_processor = Arc::new(
            CommandProcessor::new(
                negotiation_commands.clone(),
                Arc::new(
                    EntityCommandRunner::new(stores.negotiations.clone(), NegotiationCommandHandler)
                        .with_listeners(negotiation_events.clone())
                        .with_clock(clock.clone()),
                ),
            )
            .with_backoff(core.retry_policy().backoff)
            .with_clock(clock.clone()),
        );
        let transfer_processor = Arc::new(
            CommandProcessor::new(
                transfer_commands.clone(),
                Arc::new(
                    EntityCommandRunner::new(stores.transfers.clone(), TransferCommandHandler)
                        .with_listeners(transfer_events.clone())
                        .with_clock(clock.clone()),
                ),
            )
            .with_backoff(core.retry_policy().backoff)
            .with_clock(clock.clone()),
        );

        let negotiation_manager =
            negotiation::manager_builder(stores.negotiations.clone(), dispatcher.clone())
                .wait_strategy(core.wait_strategy())
                .batch_size(core.batch_size)
                .retry_policy(core.retry_policy())
                .clock(clock.clone())
                .listeners(negotiation_events)
                .commands(negotiation_processor)
                .build();

        let transfer_manager = transfer::manager_builder(
            stores.transfers.clone(),
            dispatcher,
            provisioner,
        )
        .wait_strategy(core.wait_strategy())
        .batch_size(core.batch_size)
        .retry_policy(core.retry_policy())
        .clock(clock.clone())
        .listeners(transfer_events)
        .commands(transfer_processor)
        .build();

        let check = CheckPolicy::new(
            stores.transfers.clone(),
            transfer_commands.clone(),
            policy_engine,
            clock.clone(),
            config.policy_check_interval,
        )
        .with_command_retries(core.command_retries);
        let monitor_processor = Arc::new(
            CommandProcessor::<PolicyMonitorCommand>::new(
                monitor_commands,
                Arc::new(CreateMonitorEntry::new(
                    stores.monitors.clone(),
                    config.participant_id.clone(),
                    clock.clone(),
                )),
            )
            .with_backoff(core.retry_policy().backoff)
            .with_clock(clock.clone()),
        );
        let monitor_manager = policy_monitor::manager_builder(stores.monitors.clone(), check)
            .wait_strategy(core.wait_strategy())
            .batch_size(core.batch_size)
            .retry_policy(core.retry_policy())
            .clock(clock.clone())
            .listeners(monitor_events)
            .commands(monitor_processor)
            .build();

        let managers = vec![
            negotiation_manager.start(),
            transfer_manager.start(),
            monitor_manager.start(),
        ];

        let mut retention = Vec::new();
        if core.retention.enabled {
            retention.push(spawn_retention(
                RetentionWorker::new(stores.negotiations.clone(), core.retention.clone())
                    .with_clock(clock.clone()),
            ));
            retention.push(spawn_retention(
                RetentionWorker::new(stores.transfers.clone(), core.retention.clone())
                    .with_clock(clock.clone()),
            ));
            retention.push(spawn_retention(
                RetentionWorker::new(stores.monitors.clone(), core.retention.clone())
                    .with_clock(clock.clone()),
            ));
        }

        info!(
            participant_id = %config.participant_id,
            runtime_id = %core.runtime_id,
            managers = managers.len(),
            retention_workers = retention.len(),
            "ConnectorRuntime started"
        );

        Ok(ConnectorRuntime {
            config,
            stores,
            clock,
            events,
            negotiation_commands,
            transfer_commands,
            managers,
            retention,
        })
    }
}

fn spawn_retention<E: StatefulEntity>(worker: RetentionWorker<E>) -> (Arc<Notify>, JoinHandle<()>) {
    let shutdown = worker.shutdown_handle();
    let task = tokio::spawn(async move { worker.run().await });
    (shutdown, task)
}

/// A running connector.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ConnectorRuntime {
    config: ConnectorConfig,
    stores: Stores,
    clock: Arc<dyn Clock>,
    events: Arc<EventPublisher>,
    negotiation_commands: Arc<dyn CommandQueue<NegotiationCommand>>,
    transfer_commands: Arc<dyn CommandQueue<TransferCommand>>,
    managers: Vec<ManagerHandle>,
    retention: Vec<(Arc<Notify>, JoinHandle<()>)>,
}

impl ConnectorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ConnectorRuntimeBuilder {
        ConnectorRuntimeBuilder::new()
    }

    /// The runtime's stores.
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Receive every persisted transition of every process type.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    /// Start negotiating `offer` with a provider. Returns the negotiation ID.
    pub async fn initiate_negotiation(
        &self,
        counterparty_id: &str,
        counterparty_address: &str,
        offer: ContractOffer,
    ) -> crate::error::Result<String> {
        if counterparty_address.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "counterparty address is required".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut negotiation = ContractNegotiation::new(
            id.clone(),
            counterparty_id,
            counterparty_address,
            offer,
            self.clock.now_millis(),
        );
        self.stores.negotiations.save(&mut negotiation).await?;
        info!(negotiation_id = %id, counterparty_id, "Negotiation initiated");
        Ok(id)
    }

    /// Start a transfer. Returns the transfer ID.
    pub async fn initiate_transfer(&self, request: NewTransfer) -> crate::error::Result<String> {
        if request.contract_id.trim().is_empty() {
            return Err(Error::InvalidRequest("contract ID is required".to_string()));
        }
        if request.counterparty_address.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "counterparty address is required".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut transfer = TransferProcess::new(
            id.clone(),
            request.asset_id,
            request.contract_id,
            request.counterparty_id,
            request.counterparty_address,
            request.policy,
            request.data_destination,
            self.clock.now_millis(),
        );
        self.stores.transfers.save(&mut transfer).await?;
        info!(transfer_id = %id, contract_id = %transfer.contract_id, "Transfer initiated");
        Ok(id)
    }

    /// Queue a command for a negotiation.
    pub async fn negotiation_command(
        &self,
        negotiation_id: &str,
        kind: NegotiationCommand,
    ) -> crate::error::Result<()> {
        let command = Command::new(negotiation_id, kind, self.clock.now_millis())
            .with_retries(self.config.core.command_retries);
        self.negotiation_commands.enqueue(command).await?;
        Ok(())
    }

    /// Queue a command for a transfer.
    pub async fn transfer_command(
        &self,
        transfer_id: &str,
        kind: TransferCommand,
    ) -> crate::error::Result<()> {
        let command = Command::new(transfer_id, kind, self.clock.now_millis())
            .with_retries(self.config.core.command_retries);
        self.transfer_commands.enqueue(command).await?;
        Ok(())
    }

    /// Check if every manager is still running.
    pub fn is_running(&self) -> bool {
        self.managers.iter().all(ManagerHandle::is_running)
    }

    /// Gracefully shut down the runtime.
    ///
    /// In-flight handlers finish; entities they could not save stay leased
    /// until the lease expires and are then picked up again.
    pub async fn shutdown(self) -> Result<()> {
        info!("ConnectorRuntime shutting down...");

        for manager in &self.managers {
            manager.shutdown();
        }
        for (shutdown, _) in &self.retention {
            shutdown.notify_one();
        }

        let mut first_error = None;
        for manager in self.managers {
            let name = manager.name().to_string();
            if let Err(e) = manager.join().await {
                error!(manager = %name, error = %e, "Manager stopped with an error");
                first_error.get_or_insert(e);
            }
        }
        for (_, task) in self.retention {
            if let Err(e) = task.await {
                error!(error = %e, "Retention worker task failed");
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                info!("ConnectorRuntime shutdown complete");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rejects_bad_database_url() {
        let mut config = ConnectorConfig::default();
        config.core.database_url = "mysql://nope".to_string();

        let err = ConnectorRuntime::builder().config(config).build().unwrap_err();
        assert!(err.to_string().contains("COVENANT_DATABASE_URL"));
    }

    #[test]
    fn test_build_with_explicit_stores_skips_backend_check() {
        let mut config = ConnectorConfig::default();
        config.core.database_url = "mysql://nope".to_string();

        let result = ConnectorRuntime::builder()
            .config(config)
            .stores(Stores::in_memory(Default::default()))
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_build_requires_participant_id() {
        let mut config = ConnectorConfig::default();
        config.core.database_url = "memory".to_string();
        config.participant_id = " ".to_string();

        assert!(ConnectorRuntime::builder().config(config).build().is_err());
    }
}
