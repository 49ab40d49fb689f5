//! Inbound requests and outbound responses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{HttpMethod, VmOp, vm_status_path};
use crate::audit::redact_json;
use crate::error::GatewayError;
use crate::mode::ExecutionMode;
use crate::security::ClassificationVerdict;
use crate::shell::ExecutionResult;

/// What the caller wants done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// A raw shell command.
    Shell {
        command: String,
        /// Caller environment overrides, checked against the allow-list.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// A management API call.
    Api {
        method: HttpMethod,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// Guest lifecycle action.
    VmAction { node: String, vmid: u32, op: VmOp },
    /// Operating mode toggle.
    SetMode { mode: ExecutionMode },
}

impl Action {
    pub fn shell(command: &str) -> Self {
        Self::Shell {
            command: command.to_string(),
            env: BTreeMap::new(),
        }
    }

    /// Text the classifier sees. Structured actions get a stable pseudo
    /// command so the same rule table covers them.
    pub fn classification_text(&self) -> String {
        match self {
            Self::Shell { command, .. } => command.clone(),
            Self::Api { method, path, .. } => {
                format!("api {} {}", method.as_str().to_ascii_lowercase(), path)
            }
            Self::VmAction { node, vmid, op } => format!("api post {}", vm_status_path(node, *vmid, *op)),
            Self::SetMode { mode } => format!("gateway mode {mode}"),
        }
    }

    /// Text recorded in the audit log (before command redaction).
    pub fn audit_text(&self) -> String {
        match self {
            Self::Api {
                payload: Some(payload),
                ..
            } => format!("{} {}", self.classification_text(), redact_json(payload)),
            _ => self.classification_text(),
        }
    }

    /// Known to change state regardless of rule flags.
    pub fn is_intrinsically_mutating(&self) -> bool {
        match self {
            Self::Shell { .. } => false,
            Self::Api { method, .. } => !method.is_read_only(),
            Self::VmAction { .. } => true,
            // Relaxing to Normal weakens safety; tightening to Safe does not.
            Self::SetMode { mode } => *mode == ExecutionMode::Normal,
        }
    }

    /// Structural checks that do not need the rule table.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::VmAction { node, .. } => {
                let valid = node
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphanumeric())
                    && node.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
                if valid {
                    Ok(())
                } else {
                    Err(format!("invalid node name '{node}'"))
                }
            }
            Self::Api { path, .. } => validate_api_path(path),
            _ => Ok(()),
        }
    }
}

/// API paths are matched against rules as written, so only plain segments
/// are accepted: no dot segments, empty segments, query or fragment.
fn validate_api_path(path: &str) -> Result<(), String> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err("API path must start with '/'".to_string());
    };
    for segment in rest.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(format!("API path '{path}' has an empty or relative segment"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@' | '+' | '=' | ','))
        {
            return Err(format!("API path '{path}' contains a disallowed character"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub principal: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_token: Option<String>,
    /// Session the caller believes it is in; a stale id voids any token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CommandRequest {
    pub fn new(principal: &str, action: Action) -> Self {
        Self {
            principal: principal.to_string(),
            action,
            timeout_secs: None,
            confirmation_token: None,
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn shell(principal: &str, command: &str) -> Self {
        Self::new(principal, Action::shell(command))
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.confirmation_token = Some(token.to_string());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub verdict: ClassificationVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
    pub audit_record_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub mode: ExecutionMode,
}

impl GatewayResponse {
    /// The token issued with a `ConfirmationRequired` refusal.
    pub fn confirmation_token(&self) -> Option<&str> {
        match &self.error {
            Some(GatewayError::ConfirmationRequired { token, .. }) => Some(token),
            _ => None,
        }
    }

    pub fn dispatched(&self) -> bool {
        self.result.is_some()
    }
}
