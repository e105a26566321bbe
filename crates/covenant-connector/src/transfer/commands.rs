// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands applied to transfers.

use async_trait::async_trait;
use covenant_core::{
    Command, CommandEffect, CommandError, CommandHandler, CommandKind, EntityState, StatefulEntity,
};
use serde::{Deserialize, Serialize};

use super::{DataAddress, TransferProcess, TransferState};

/// Out-of-band changes to a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TransferCommand {
    /// The provider started sending data.
    Start {
        /// Source address for pull transfers.
        data_source: Option<DataAddress>,
    },
    /// All data has arrived.
    Complete,
    /// Abort the transfer.
    Terminate {
        /// Reason reported to the provider.
        reason: String,
    },
}

impl CommandKind for TransferCommand {
    fn tag(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Complete => "complete",
            Self::Terminate { .. } => "terminate",
        }
    }
}

/// Applies [`TransferCommand`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferCommandHandler;

fn not_now(transfer: &TransferProcess, action: &str) -> CommandError {
    CommandError::Rejected(format!(
        "transfer '{}' is {} and cannot be {action}",
        transfer.id(),
        transfer.state().name()
    ))
}

#[async_trait]
impl CommandHandler<TransferProcess> for TransferCommandHandler {
    type Kind = TransferCommand;

    async fn apply(
        &self,
        command: &Command<TransferCommand>,
        transfer: &mut TransferProcess,
    ) -> Result<CommandEffect<TransferState>, CommandError> {
        match &command.kind {
            TransferCommand::Start { data_source } => match transfer.state() {
                TransferState::Requested => {
                    transfer.data_source = data_source.clone();
                    Ok(CommandEffect::TransitionTo(TransferState::Started))
                }
                // Redelivered start message.
                TransferState::Started => Ok(CommandEffect::Unchanged),
                _ => Err(not_now(transfer, "started")),
            },
            TransferCommand::Complete => match transfer.state() {
                TransferState::Started => Ok(CommandEffect::TransitionTo(TransferState::Completing)),
                TransferState::Completing => Ok(CommandEffect::Unchanged),
                _ => Err(not_now(transfer, "completed")),
            },
            TransferCommand::Terminate { reason } => match transfer.state() {
                TransferState::Terminating => Ok(CommandEffect::Unchanged),
                _ => Ok(CommandEffect::FailTo(TransferState::Terminating, reason.clone())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    fn transfer(state: TransferState) -> TransferProcess {
        let mut transfer = TransferProcess::new(
            "t-1",
            "asset-1",
            "agreement-1",
            "provider",
            "https://provider.example/dsp",
            Policy::default(),
            DataAddress::new("HttpData"),
            0,
        );
        transfer.meta = covenant_core::EntityMeta::in_state("t-1", state, 0);
        transfer
    }

    async fn apply(
        transfer: &mut TransferProcess,
        kind: TransferCommand,
    ) -> Result<CommandEffect<TransferState>, CommandError> {
        TransferCommandHandler
            .apply(&Command::new("t-1", kind, 0), transfer)
            .await
    }

    #[tokio::test]
    async fn test_start_records_source() {
        let mut t = transfer(TransferState::Requested);
        let source = DataAddress::new("HttpData").with_property("endpoint", "https://p/data");
        let effect = apply(
            &mut t,
            TransferCommand::Start {
                data_source: Some(source.clone()),
            },
        )
        .await
        .unwrap();

        assert_eq!(effect, CommandEffect::TransitionTo(TransferState::Started));
        assert_eq!(t.data_source, Some(source));
    }

    #[tokio::test]
    async fn test_redelivered_messages_are_no_ops() {
        let mut t = transfer(TransferState::Started);
        assert_eq!(
            apply(&mut t, TransferCommand::Start { data_source: None })
                .await
                .unwrap(),
            CommandEffect::Unchanged
        );

        let mut t = transfer(TransferState::Completing);
        assert_eq!(
            apply(&mut t, TransferCommand::Complete).await.unwrap(),
            CommandEffect::Unchanged
        );
    }

    #[tokio::test]
    async fn test_complete_before_start_is_rejected() {
        let mut t = transfer(TransferState::Requested);
        let err = apply(&mut t, TransferCommand::Complete).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Command rejected: transfer 't-1' is REQUESTED and cannot be completed"
        );
    }

    #[tokio::test]
    async fn test_terminate_from_any_active_state() {
        for state in [
            TransferState::Initial,
            TransferState::Provisioning,
            TransferState::Started,
            TransferState::Completing,
        ] {
            let mut t = transfer(state);
            let effect = apply(
                &mut t,
                TransferCommand::Terminate {
                    reason: "policy expired".to_string(),
                },
            )
            .await
            .unwrap();
            assert_eq!(
                effect,
                CommandEffect::FailTo(TransferState::Terminating, "policy expired".to_string())
            );
        }
    }
}
