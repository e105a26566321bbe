// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound messages to remote participants.
//!
//! Wire formats and transports live behind [`Dispatcher`]. Handlers only
//! decide *what* to send; delivery is at-least-once because a handler whose
//! save loses a race may run again and resend.

use async_trait::async_trait;
use covenant_core::Outcome;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::negotiation::{ContractAgreement, ContractOffer};
use crate::transfer::DataAddress;

/// A protocol message for a remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RemoteMessage {
    /// Ask a provider to agree to an offer.
    ContractRequest {
        /// Local process ID, used as correlation ID by the counterparty.
        process_id: String,
        /// Counterparty protocol endpoint.
        counterparty_address: String,
        /// The offer being requested.
        offer: ContractOffer,
    },
    /// Confirm a received agreement.
    ContractAgreementVerification {
        /// Local process ID.
        process_id: String,
        /// Counterparty protocol endpoint.
        counterparty_address: String,
        /// The agreement being verified.
        agreement: ContractAgreement,
    },
    /// Abort a negotiation.
    ContractNegotiationTermination {
        /// Local process ID.
        process_id: String,
        /// Counterparty protocol endpoint.
        counterparty_address: String,
        /// Why the negotiation ends.
        reason: Option<String>,
    },
    /// Ask a provider to start a transfer.
    TransferRequest {
        /// Local process ID.
        process_id: String,
        /// Counterparty protocol endpoint.
        counterparty_address: String,
        /// Agreement the transfer runs under.
        contract_id: String,
        /// Where data should be delivered.
        data_destination: DataAddress,
    },
    /// Report a finished transfer.
    TransferCompletion {
        /// Local process ID.
        process_id: String,
        /// Counterparty protocol endpoint.
        counterparty_address: String,
    },
    /// Abort a transfer.
    TransferTermination {
        /// Local process ID.
        process_id: String,
        /// Counterparty protocol endpoint.
        counterparty_address: String,
        /// Why the transfer ends.
        reason: Option<String>,
    },
}

impl RemoteMessage {
    /// Short message type name for logs.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::ContractRequest { .. } => "ContractRequest",
            Self::ContractAgreementVerification { .. } => "ContractAgreementVerification",
            Self::ContractNegotiationTermination { .. } => "ContractNegotiationTermination",
            Self::TransferRequest { .. } => "TransferRequest",
            Self::TransferCompletion { .. } => "TransferCompletion",
            Self::TransferTermination { .. } => "TransferTermination",
        }
    }

    /// ID of the local process the message belongs to.
    pub fn process_id(&self) -> &str {
        match self {
            Self::ContractRequest { process_id, .. }
            | Self::ContractAgreementVerification { process_id, .. }
            | Self::ContractNegotiationTermination { process_id, .. }
            | Self::TransferRequest { process_id, .. }
            | Self::TransferCompletion { process_id, .. }
            | Self::TransferTermination { process_id, .. } => process_id,
        }
    }

    /// Endpoint the message is sent to.
    pub fn counterparty_address(&self) -> &str {
        match self {
            Self::ContractRequest { counterparty_address, .. }
            | Self::ContractAgreementVerification { counterparty_address, .. }
            | Self::ContractNegotiationTermination { counterparty_address, .. }
            | Self::TransferRequest { counterparty_address, .. }
            | Self::TransferCompletion { counterparty_address, .. }
            | Self::TransferTermination { counterparty_address, .. } => counterparty_address,
        }
    }
}

/// Why a message could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The counterparty could not be reached. Worth retrying.
    #[error("Counterparty at {address} unreachable: {reason}")]
    Unreachable {
        /// Target endpoint.
        address: String,
        /// Transport error description.
        reason: String,
    },

    /// The counterparty answered with a refusal. Retrying will not help.
    #[error("Counterparty rejected {message_type}: {reason}")]
    Rejected {
        /// Message type name.
        message_type: &'static str,
        /// Refusal reason.
        reason: String,
    },
}

impl DispatchError {
    /// Whether sending the same message again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Sends [`RemoteMessage`]s.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver `message`. Returns once the counterparty acknowledged it.
    async fn dispatch(&self, message: RemoteMessage) -> Result<(), DispatchError>;
}

/// Map a dispatch result to a handler outcome: `next` on success, a retry
/// for transport failures, the failure state for refusals.
pub(crate) fn after_dispatch<S>(result: Result<(), DispatchError>, next: S) -> Outcome<S> {
    match result {
        Ok(()) => Outcome::Proceed(next),
        Err(e) if e.is_retryable() => Outcome::retry(e.to_string()),
        Err(e) => Outcome::fatal(e.to_string()),
    }
}

/// Dispatcher for standalone runs: logs every message and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl Dispatcher for LoggingDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> Result<(), DispatchError> {
        info!(
            message_type = message.message_type(),
            process_id = %message.process_id(),
            counterparty_address = %message.counterparty_address(),
            "Dispatching message"
        );
        Ok(())
    }
}
