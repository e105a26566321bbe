// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands applied to negotiations: provider messages and cancellation.

use async_trait::async_trait;
use covenant_core::{
    Command, CommandEffect, CommandError, CommandHandler, CommandKind, EntityState, StatefulEntity,
};
use serde::{Deserialize, Serialize};

use super::{ContractAgreement, ContractNegotiation, NegotiationState};

/// Out-of-band changes to a negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NegotiationCommand {
    /// The provider agreed to the requested offer.
    Agree {
        /// The signed agreement.
        agreement: ContractAgreement,
    },
    /// The provider finalized the verified agreement.
    Finalize,
    /// Cancel the negotiation.
    Terminate {
        /// Reason reported to the provider.
        reason: String,
    },
}

impl CommandKind for NegotiationCommand {
    fn tag(&self) -> &'static str {
        match self {
            Self::Agree { .. } => "agree",
            Self::Finalize => "finalize",
            Self::Terminate { .. } => "terminate",
        }
    }
}

/// Applies [`NegotiationCommand`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiationCommandHandler;

#[async_trait]
impl CommandHandler<ContractNegotiation> for NegotiationCommandHandler {
    type Kind = NegotiationCommand;

    async fn apply(
        &self,
        command: &Command<NegotiationCommand>,
        negotiation: &mut ContractNegotiation,
    ) -> Result<CommandEffect<NegotiationState>, CommandError> {
        let state = negotiation.state();
        match &command.kind {
            NegotiationCommand::Agree { agreement } => {
                // The agreement may overtake our own REQUESTING -> REQUESTED save;
                // failing here lets the processor retry it.
                if state != NegotiationState::Requested {
                    return Err(CommandError::Rejected(format!(
                        "negotiation '{}' is {} and cannot accept an agreement yet",
                        negotiation.id(),
                        state.name()
                    )));
                }
                if agreement.asset_id != negotiation.offer.asset_id {
                    return Ok(CommandEffect::FailTo(
                        NegotiationState::Terminating,
                        format!(
                            "agreement '{}' covers asset '{}', requested '{}'",
                            agreement.id, agreement.asset_id, negotiation.offer.asset_id
                        ),
                    ));
                }
                negotiation.agreement = Some(agreement.clone());
                Ok(CommandEffect::TransitionTo(NegotiationState::Agreed))
            }
            NegotiationCommand::Finalize => {
                if state != NegotiationState::Verified {
                    return Err(CommandError::Rejected(format!(
                        "negotiation '{}' is {} and cannot be finalized",
                        negotiation.id(),
                        state.name()
                    )));
                }
                Ok(CommandEffect::TransitionTo(NegotiationState::Finalized))
            }
            NegotiationCommand::Terminate { reason } => {
                if state == NegotiationState::Terminating {
                    return Ok(CommandEffect::Unchanged);
                }
                Ok(CommandEffect::FailTo(
                    NegotiationState::Terminating,
                    reason.clone(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::ContractOffer;
    use crate::policy::Policy;

    fn negotiation(state: NegotiationState) -> ContractNegotiation {
        let mut negotiation = ContractNegotiation::new(
            "n-1",
            "provider",
            "https://provider.example/dsp",
            ContractOffer {
                id: "offer-1".to_string(),
                asset_id: "asset-1".to_string(),
                policy: Policy::permissive("p-1", "provider", "asset-1"),
            },
            0,
        );
        negotiation.meta = covenant_core::EntityMeta::in_state("n-1", state, 0);
        negotiation
    }

    fn agreement(asset_id: &str) -> ContractAgreement {
        ContractAgreement {
            id: "agreement-1".to_string(),
            asset_id: asset_id.to_string(),
            provider_id: "provider".to_string(),
            consumer_id: "consumer".to_string(),
            signing_date: 10,
            policy: Policy::permissive("p-1", "provider", asset_id),
        }
    }

    async fn apply(
        negotiation: &mut ContractNegotiation,
        kind: NegotiationCommand,
    ) -> Result<CommandEffect<NegotiationState>, CommandError> {
        NegotiationCommandHandler
            .apply(&Command::new("n-1", kind, 0), negotiation)
            .await
    }

    #[tokio::test]
    async fn test_agree_stores_agreement() {
        let mut n = negotiation(NegotiationState::Requested);
        let effect = apply(
            &mut n,
            NegotiationCommand::Agree {
                agreement: agreement("asset-1"),
            },
        )
        .await
        .unwrap();

        assert_eq!(effect, CommandEffect::TransitionTo(NegotiationState::Agreed));
        assert_eq!(n.agreement.unwrap().id, "agreement-1");
    }

    #[tokio::test]
    async fn test_early_agreement_is_rejected_for_retry() {
        let mut n = negotiation(NegotiationState::Requesting);
        let err = apply(
            &mut n,
            NegotiationCommand::Agree {
                agreement: agreement("asset-1"),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Rejected(_)));
        assert!(n.agreement.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_agreement_terminates() {
        let mut n = negotiation(NegotiationState::Requested);
        let effect = apply(
            &mut n,
            NegotiationCommand::Agree {
                agreement: agreement("asset-2"),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            effect,
            CommandEffect::FailTo(NegotiationState::Terminating, _)
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut n = negotiation(NegotiationState::Terminating);
        let effect = apply(
            &mut n,
            NegotiationCommand::Terminate {
                reason: "again".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(effect, CommandEffect::Unchanged);
    }

    #[tokio::test]
    async fn test_finalize_requires_verification() {
        let mut n = negotiation(NegotiationState::Agreed);
        assert!(apply(&mut n, NegotiationCommand::Finalize).await.is_err());

        let mut n = negotiation(NegotiationState::Verified);
        assert_eq!(
            apply(&mut n, NegotiationCommand::Finalize).await.unwrap(),
            CommandEffect::TransitionTo(NegotiationState::Finalized)
        );
    }
}
