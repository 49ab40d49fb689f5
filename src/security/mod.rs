//! Security policy: normalization, rule classification, root protection and
//! the execution gate.
//!
//! A request is normalized once, assessed by the root guard, classified
//! against the rule table and finally gated on the current mode.

pub mod classifier;
pub mod defaults;
pub mod gate;
pub mod normalize;
pub mod root_guard;
pub mod rules;

use serde::{Deserialize, Serialize};

pub use classifier::{Classifier, Policy};
pub use gate::{ExecutionDecision, gate_command};
pub use normalize::{NormalizedCommand, normalize};
pub use root_guard::{ProtectedIdentity, RootAssessment, RootGuard, VerbClass};
pub use rules::{RuleSpec, RuleTable};

/// Rule id for commands no allow rule covers, and for commands that could not
/// be parsed at all.
pub const UNRECOGNIZED_RULE: &str = "unrecognized";

/// Rule id reported for root protection vetoes.
pub const ROOT_PROTECTION_RULE: &str = "root-protection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictCategory {
    Allowed,
    Denied,
    RootProtected,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationVerdict {
    pub category: VerdictCategory,
    pub rule_id: String,
    pub rationale: String,
    /// Whether an allowed command changes state.
    #[serde(default)]
    pub mutating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb_class: Option<VerbClass>,
}

impl ClassificationVerdict {
    pub fn allowed(rule_id: &str, rationale: &str, mutating: bool) -> Self {
        Self {
            category: VerdictCategory::Allowed,
            rule_id: rule_id.to_string(),
            rationale: rationale.to_string(),
            mutating,
            verb_class: None,
        }
    }

    pub fn denied(rule_id: &str, rationale: &str) -> Self {
        Self {
            category: VerdictCategory::Denied,
            rule_id: rule_id.to_string(),
            rationale: rationale.to_string(),
            mutating: true,
            verb_class: None,
        }
    }

    pub fn unrecognized(rationale: &str) -> Self {
        Self {
            category: VerdictCategory::Unrecognized,
            rule_id: UNRECOGNIZED_RULE.to_string(),
            rationale: rationale.to_string(),
            mutating: true,
            verb_class: None,
        }
    }

    pub fn root_protected(verb_class: VerbClass) -> Self {
        Self {
            category: VerdictCategory::RootProtected,
            rule_id: ROOT_PROTECTION_RULE.to_string(),
            rationale: format!("{verb_class} operation against the protected identity"),
            mutating: true,
            verb_class: Some(verb_class),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.category == VerdictCategory::Allowed
    }
}
