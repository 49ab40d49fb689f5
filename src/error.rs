//! Gateway error taxonomy.
//!
//! Every refusal or failure a caller can see is one of these kinds. Policy
//! refusals report rule ids and rationales, never pattern text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::VerbClass;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayError {
    #[error("command denied by rule '{rule_id}': {rationale}")]
    ClassificationDenied { rule_id: String, rationale: String },

    #[error("{verb_class} operation against the protected identity is not permitted")]
    RootProtectionViolation { verb_class: VerbClass },

    #[error("confirmation required; resubmit with the issued token within {expires_in_secs}s")]
    ConfirmationRequired { token: String, expires_in_secs: u64 },

    #[error("confirmation token rejected: {reason}")]
    ConfirmationExpired { reason: String },

    #[error("command timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("execution channel '{channel}' unavailable after {attempts} attempt(s): {reason}")]
    ExecutionChannelUnavailable {
        channel: String,
        attempts: u32,
        reason: String,
    },

    #[error("audit write failed: {reason}")]
    AuditWriteFailure { reason: String },

    #[error("rate limited: {reason}")]
    RateLimited { reason: String, retry_after_secs: u64 },
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClassificationDenied { .. } => "classification_denied",
            Self::RootProtectionViolation { .. } => "root_protection_violation",
            Self::ConfirmationRequired { .. } => "confirmation_required",
            Self::ConfirmationExpired { .. } => "confirmation_expired",
            Self::Timeout { .. } => "timeout",
            Self::ExecutionChannelUnavailable { .. } => "execution_channel_unavailable",
            Self::AuditWriteFailure { .. } => "audit_write_failure",
            Self::RateLimited { .. } => "rate_limited",
        }
    }

    /// Terminal refusals decided by policy rather than by the environment.
    pub fn is_policy_refusal(&self) -> bool {
        matches!(
            self,
            Self::ClassificationDenied { .. } | Self::RootProtectionViolation { .. }
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExecutionChannelUnavailable { .. } | Self::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_with_kind_tag() {
        let err = GatewayError::ClassificationDenied {
            rule_id: "deny.package-install".to_string(),
            rationale: "package installation is not permitted".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "classification_denied");
        assert_eq!(json["rule_id"], "deny.package-install");
        assert_eq!(json["kind"], err.kind());

        let back: GatewayError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_root_violation_names_verb_class() {
        let err = GatewayError::RootProtectionViolation {
            verb_class: VerbClass::ChangeCredential,
        };
        assert!(err.to_string().contains("change-credential"));
        assert!(err.is_policy_refusal());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["verb_class"], "change-credential");
    }

    #[test]
    fn test_transient_kinds() {
        let err = GatewayError::ExecutionChannelUnavailable {
            channel: "ssh".to_string(),
            attempts: 3,
            reason: "connection refused".to_string(),
        };
        assert!(err.is_transient());
        assert!(!GatewayError::Timeout { after_secs: 60 }.is_transient());
    }
}
