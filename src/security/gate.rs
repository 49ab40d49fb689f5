//! Execution gating on verdict and mode.
//!
//! This is the single place that turns a classification verdict and the
//! current mode snapshot into a dispatch decision.

use super::{ClassificationVerdict, VerdictCategory};
use crate::mode::ExecutionMode;

/// Result of passing a verdict through the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionDecision {
    /// Dispatch now
    Execute,
    /// A confirmation token is needed before dispatch
    RequireConfirmation { reason: String },
    /// Refused outright
    Deny { reason: String },
}

/// Decide what to do with a classified command.
///
/// Anything not Allowed is denied. In Safe mode an allowed mutating command
/// needs confirmation; read-only commands and everything in Normal mode run.
pub fn gate_command(verdict: &ClassificationVerdict, mode: ExecutionMode) -> ExecutionDecision {
    match verdict.category {
        VerdictCategory::Allowed => {
            if mode == ExecutionMode::Safe && verdict.mutating {
                ExecutionDecision::RequireConfirmation {
                    reason: format!(
                        "'{}' changes state and requires confirmation in safe mode",
                        verdict.rule_id
                    ),
                }
            } else {
                ExecutionDecision::Execute
            }
        }
        VerdictCategory::Denied | VerdictCategory::Unrecognized | VerdictCategory::RootProtected => {
            ExecutionDecision::Deny {
                reason: verdict.rationale.clone(),
            }
        }
    }
}
