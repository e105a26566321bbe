// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Usage policies and their evaluation.
//!
//! The policy language itself is out of scope. A [`Policy`] carries a flat
//! list of [`Constraint`]s that the [`RuleBasedPolicyEngine`] understands;
//! richer engines plug in through [`PolicyEngine`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A usage policy attached to an offer or agreement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Policy ID.
    pub id: String,
    /// Participant granting the policy.
    pub assigner: String,
    /// Asset the policy applies to.
    pub target: String,
    /// Constraints that must all hold.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Policy {
    /// A policy without constraints.
    pub fn permissive(id: impl Into<String>, assigner: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            assigner: assigner.into(),
            target: target.into(),
            constraints: Vec::new(),
        }
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// A single policy constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Constraint {
    /// Usage ends at this time (epoch millis).
    NotAfter {
        /// Expiry in epoch millis.
        epoch_millis: i64,
    },
    /// Usage starts at this time (epoch millis).
    NotBefore {
        /// Start in epoch millis.
        epoch_millis: i64,
    },
    /// Only these participants may use the asset.
    AllowedParties {
        /// Permitted participant IDs.
        participants: Vec<String>,
    },
}

/// Facts a policy is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyContext {
    /// Participant using the asset.
    pub participant_id: String,
    /// Evaluation time in epoch millis.
    pub now_millis: i64,
}

/// Why a policy does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Policy '{policy_id}' violated: {reason}")]
pub struct PolicyViolation {
    /// ID of the violated policy.
    pub policy_id: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Evaluates policies.
pub trait PolicyEngine: Send + Sync {
    /// `Ok` when every constraint of `policy` holds in `context`.
    fn evaluate(&self, policy: &Policy, context: &PolicyContext) -> Result<(), PolicyViolation>;
}

/// Evaluates the built-in [`Constraint`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedPolicyEngine;

impl PolicyEngine for RuleBasedPolicyEngine {
    fn evaluate(&self, policy: &Policy, context: &PolicyContext) -> Result<(), PolicyViolation> {
        let violation = |reason: String| PolicyViolation {
            policy_id: policy.id.clone(),
            reason,
        };

        for constraint in &policy.constraints {
            match constraint {
                Constraint::NotAfter { epoch_millis } if context.now_millis > *epoch_millis => {
                    return Err(violation(format!("expired at {epoch_millis}")));
                }
                Constraint::NotBefore { epoch_millis } if context.now_millis < *epoch_millis => {
                    return Err(violation(format!("not valid before {epoch_millis}")));
                }
                Constraint::AllowedParties { participants }
                    if !participants.contains(&context.participant_id) =>
                {
                    return Err(violation(format!(
                        "participant '{}' is not permitted",
                        context.participant_id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
