//! Audit trail.
//!
//! Every decision the gateway makes produces exactly one record, written
//! before the caller sees the outcome. Records are immutable once appended.

pub mod capture;
pub mod log;
pub mod redact;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::mode::ExecutionMode;
use crate::security::ClassificationVerdict;
use crate::session::token::token_digest;
use crate::shell::ExecutionResult;

pub use capture::CaptureStream;
pub use log::{FileAuditLog, MemoryAuditLog};
pub use redact::{redact_command, redact_json};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit writer task failed: {0}")]
    Task(String),
}

/// What happened after classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Executed {
        exit_code: Option<i32>,
        duration_ms: u64,
        timed_out: bool,
        truncated: bool,
    },
    Refused {
        error: GatewayError,
    },
    Failed {
        error: GatewayError,
    },
}

impl AuditOutcome {
    pub fn executed(result: &ExecutionResult) -> Self {
        Self::Executed {
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            timed_out: result.timed_out,
            truncated: result.truncated,
        }
    }

    /// Issued tokens are recorded by digest only.
    pub fn from_error(error: &GatewayError) -> Self {
        let error = &match error {
            GatewayError::ConfirmationRequired { token, expires_in_secs } => GatewayError::ConfirmationRequired {
                token: token_digest(token),
                expires_in_secs: *expires_in_secs,
            },
            other => other.clone(),
        };
        if error.is_policy_refusal()
            || matches!(
                error,
                GatewayError::ConfirmationRequired { .. }
                    | GatewayError::ConfirmationExpired { .. }
                    | GatewayError::RateLimited { .. }
            )
        {
            Self::Refused { error: error.clone() }
        } else {
            Self::Failed { error: error.clone() }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Assigned by the sink at append time.
    #[serde(default)]
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Command text with secrets redacted.
    pub command: String,
    pub verdict: ClassificationVerdict,
    pub mode: ExecutionMode,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    pub fn new(
        id: Uuid,
        principal: &str,
        session_id: Option<Uuid>,
        command: &str,
        verdict: ClassificationVerdict,
        mode: ExecutionMode,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id,
            sequence: 0,
            timestamp: Utc::now(),
            principal: principal.to_string(),
            session_id,
            command: redact_command(command),
            verdict,
            mode,
            outcome,
        }
    }
}

/// Read-only filter over the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub principal: Option<String>,
}

impl AuditQuery {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.since.is_none_or(|t| record.timestamp >= t)
            && self.until.is_none_or(|t| record.timestamp <= t)
            && self
                .principal
                .as_deref()
                .is_none_or(|p| record.principal == p)
    }
}

/// Durable, append-only record store.
pub trait AuditSink: Send + Sync {
    /// Append one record; resolves once it is durable. Returns the record
    /// with its sequence number assigned.
    fn append(&self, record: AuditRecord) -> BoxFuture<'_, Result<AuditRecord, AuditError>>;

    /// Records matching `query`, oldest first.
    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, AuditError>;
}
