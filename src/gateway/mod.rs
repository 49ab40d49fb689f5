//! The authorization pipeline.
//!
//! A request flows session admission, classification and root protection,
//! environment sanitizing, the mode gate, dispatch and finally the audit
//! append. The response is only released once its audit record is durable.

pub mod request;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{HttpMethod, ManagementApi, vm_status_path};
use crate::audit::{AuditOutcome, AuditQuery, AuditRecord, AuditSink, CaptureStream};
use crate::error::GatewayError;
use crate::mode::{ExecutionMode, ModeController};
use crate::security::{
    ClassificationVerdict, ExecutionDecision, NormalizedCommand, Policy, RootAssessment, VerdictCategory,
    gate_command, normalize,
};
use crate::session::{SessionGovernor, SessionHandle};
use crate::shell::{Dispatcher, EnvSanitizer, ExecutionResult, Invocation, OutputObserver, SanitizedEnv};

pub use request::{Action, CommandRequest, GatewayResponse};

/// Rule id for structured actions that fail validation.
pub const INVALID_ACTION_RULE: &str = "invalid-action";

/// Rule id for caller environment overrides outside the allow-list.
pub const ENV_OVERRIDE_RULE: &str = "environment-override";

/// Rule id for shell commands that try to reach structured-action programs.
pub const RESERVED_COMMAND_RULE: &str = "reserved-command";

/// Rule id for programs named by a path outside the trusted `PATH`.
pub const UNTRUSTED_PROGRAM_RULE: &str = "untrusted-program-path";

/// Pseudo programs that only structured actions may produce.
const RESERVED_PROGRAMS: &[&str] = &["api", "gateway"];

/// Collaborators a gateway is assembled from.
pub struct GatewayParts {
    pub policy: Policy,
    pub modes: Arc<ModeController>,
    pub sanitizer: EnvSanitizer,
    pub dispatcher: Dispatcher,
    pub audit: Arc<dyn AuditSink>,
    pub sessions: Arc<SessionGovernor>,
    pub api: Arc<dyn ManagementApi>,
    /// Where write-ahead output captures go; `None` disables capture.
    pub capture_dir: Option<PathBuf>,
}

struct Inner {
    policy: Policy,
    modes: Arc<ModeController>,
    sanitizer: EnvSanitizer,
    dispatcher: Dispatcher,
    audit: Arc<dyn AuditSink>,
    sessions: Arc<SessionGovernor>,
    api: Arc<dyn ManagementApi>,
    capture_dir: Option<PathBuf>,
}

/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

/// Classification of one action, before any session state is touched.
struct Assessment {
    verdict: ClassificationVerdict,
    command: Option<NormalizedCommand>,
    env: SanitizedEnv,
}

/// How far a request got.
enum Attempt {
    Completed(ExecutionResult),
    TimedOut(ExecutionResult, GatewayError),
    Stopped(GatewayError),
}

impl Attempt {
    fn outcome(&self) -> AuditOutcome {
        match self {
            Self::Completed(result) | Self::TimedOut(result, _) => AuditOutcome::executed(result),
            Self::Stopped(err) => AuditOutcome::from_error(err),
        }
    }
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy: parts.policy,
                modes: parts.modes,
                sanitizer: parts.sanitizer,
                dispatcher: parts.dispatcher,
                audit: parts.audit,
                sessions: parts.sessions,
                api: parts.api,
                capture_dir: parts.capture_dir,
            }),
        }
    }

    /// Decide, dispatch and audit one request.
    ///
    /// Refusals and execution failures come back inside the response. `Err`
    /// is reserved for `AuditWriteFailure`: when the record cannot be made
    /// durable no result is released. The pipeline runs on its own task, so
    /// dropping the returned future does not skip the audit append.
    pub async fn handle(&self, request: CommandRequest) -> Result<GatewayResponse, GatewayError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.process(request).await })
            .await
            .map_err(|e| {
                error!("Request task aborted: {}", e);
                GatewayError::AuditWriteFailure {
                    reason: format!("request task aborted: {e}"),
                }
            })?
    }

    /// Classify and gate `action` under the current mode without touching
    /// sessions, the channel or the audit log.
    pub fn explain(&self, action: &Action) -> (ClassificationVerdict, ExecutionDecision) {
        let assessment = self.inner.assess(action);
        let decision = gate_command(&assessment.verdict, self.inner.modes.snapshot());
        (assessment.verdict, decision)
    }

    pub fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, GatewayError> {
        self.inner
            .audit
            .query(query)
            .map_err(|e| GatewayError::AuditWriteFailure { reason: e.to_string() })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.modes.snapshot()
    }

    pub fn modes(&self) -> &Arc<ModeController> {
        &self.inner.modes
    }

    pub fn sessions(&self) -> &Arc<SessionGovernor> {
        &self.inner.sessions
    }
}

impl Inner {
    async fn process(&self, request: CommandRequest) -> Result<GatewayResponse, GatewayError> {
        let record_id = Uuid::new_v4();
        let mode = self.modes.snapshot();
        let assessment = self.assess(&request.action);
        let verdict = assessment.verdict.clone();
        debug!(
            "Request {} from {}: {:?} -> {}",
            record_id, request.principal, verdict.category, verdict.rule_id
        );

        let mut session_id = None;
        let attempt = self.run(&request, assessment, mode, record_id, &mut session_id).await;

        let record = AuditRecord::new(
            record_id,
            &request.principal,
            session_id,
            &request.action.audit_text(),
            verdict.clone(),
            mode,
            attempt.outcome(),
        );
        match self.audit.append(record).await {
            Ok(record) => debug!("Audit record {} appended (seq {})", record.id, record.sequence),
            Err(e) => {
                error!("Audit append for {} failed: {}", record_id, e);
                return Err(GatewayError::AuditWriteFailure { reason: e.to_string() });
            }
        }

        let (result, error) = match attempt {
            Attempt::Stopped(err @ GatewayError::AuditWriteFailure { .. }) => return Err(err),
            Attempt::Completed(result) => (Some(result), None),
            Attempt::TimedOut(result, err) => (Some(result), Some(err)),
            Attempt::Stopped(err) => (None, Some(err)),
        };

        Ok(GatewayResponse {
            verdict,
            result,
            error,
            audit_record_id: record_id,
            session_id,
            mode,
        })
    }

    async fn run(
        &self,
        request: &CommandRequest,
        assessment: Assessment,
        mode: ExecutionMode,
        record_id: Uuid,
        session_id: &mut Option<Uuid>,
    ) -> Attempt {
        let session = match self.sessions.admit(&request.principal) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Refused {}: {}", request.principal, e);
                return Attempt::Stopped(e);
            }
        };
        *session_id = Some(session.id);

        let Assessment { verdict, command, env } = assessment;
        match gate_command(&verdict, mode) {
            ExecutionDecision::Deny { reason } => {
                warn!("Denied '{}' for {}: {}", verdict.rule_id, request.principal, reason);
                return Attempt::Stopped(refusal(&verdict));
            }
            ExecutionDecision::RequireConfirmation { reason } => {
                if let Err(e) = self.confirm(request, &session, command.as_ref(), &reason) {
                    return Attempt::Stopped(e);
                }
            }
            ExecutionDecision::Execute => {}
        }

        let _permit = match self.sessions.acquire_slot(&session) {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Refused {}: {}", request.principal, e);
                return Attempt::Stopped(e);
            }
        };

        info!(
            "Executing '{}' for {} in session {} ({} mode)",
            verdict.rule_id, request.principal, session.id, mode
        );
        let timeout = self.dispatcher.effective_timeout(request.timeout_secs);
        match &request.action {
            Action::Shell { .. } => match command {
                Some(command) => self.run_shell(&command, env, timeout, &verdict, &session, record_id).await,
                None => Attempt::Stopped(refusal(&verdict)),
            },
            Action::Api { method, path, payload } => {
                self.call_api(*method, path, payload.clone(), timeout).await
            }
            Action::VmAction { node, vmid, op } => {
                self.call_api(HttpMethod::Post, &vm_status_path(node, *vmid, *op), None, timeout)
                    .await
            }
            Action::SetMode { mode: to } => self.set_mode(*to, &request.principal),
        }
    }

    /// Spend the presented token, or issue one and refuse.
    fn confirm(
        &self,
        request: &CommandRequest,
        session: &SessionHandle,
        command: Option<&NormalizedCommand>,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let fingerprint = fingerprint(&request.action, command);
        let Some(token) = &request.confirmation_token else {
            let issued = self.sessions.issue_token(session, &fingerprint);
            info!("Confirmation required for {}: {}", request.principal, reason);
            return Err(GatewayError::ConfirmationRequired {
                token: issued.token,
                expires_in_secs: issued.expires_in.as_secs(),
            });
        };

        if request.session_id.is_some_and(|id| id != session.id) {
            warn!("Token from expired session presented by {}", request.principal);
            return Err(GatewayError::ConfirmationExpired {
                reason: "session expired".to_string(),
            });
        }
        self.sessions
            .redeem(session, token, &fingerprint)
            .inspect_err(|e| warn!("Rejected confirmation from {}: {}", request.principal, e))?;
        info!("Confirmation accepted for {}", request.principal);
        Ok(())
    }

    async fn run_shell(
        &self,
        command: &NormalizedCommand,
        env: SanitizedEnv,
        timeout: Duration,
        verdict: &ClassificationVerdict,
        session: &SessionHandle,
        record_id: Uuid,
    ) -> Attempt {
        let capture = match &self.capture_dir {
            Some(dir) => match CaptureStream::open(dir, session.id, record_id) {
                Ok(capture) => Some(Arc::new(capture)),
                Err(e) => {
                    error!("Cannot open output capture in {}: {}", dir.display(), e);
                    return Attempt::Stopped(GatewayError::AuditWriteFailure {
                        reason: format!("output capture unavailable: {e}"),
                    });
                }
            },
            None => None,
        };
        let observer = capture.clone().map(|c| c as Arc<dyn OutputObserver>);

        let result = match self
            .dispatcher
            .dispatch(Invocation::from_command(command), env, timeout, verdict.mutating, observer)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Dispatch failed: {}", e);
                return Attempt::Stopped(e);
            }
        };

        if let Some(capture) = capture {
            if let Err(reason) = finish_capture(&capture) {
                error!("Output capture {} incomplete: {}", capture.path().display(), reason);
                return Attempt::Stopped(GatewayError::AuditWriteFailure { reason });
            }
        }

        if result.timed_out {
            warn!("Command timed out after {:?}", timeout);
            let err = GatewayError::Timeout {
                after_secs: timeout.as_secs(),
            };
            Attempt::TimedOut(result, err)
        } else {
            Attempt::Completed(result)
        }
    }

    async fn call_api(
        &self,
        method: HttpMethod,
        path: &str,
        payload: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Attempt {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.api.call(method, path, payload)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                let body = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                Attempt::Completed(ExecutionResult {
                    duration_ms,
                    ..ExecutionResult::internal(&body)
                })
            }
            Ok(Err(e)) => {
                error!("API {} {} failed: {}", method, path, e);
                Attempt::Stopped(GatewayError::ExecutionChannelUnavailable {
                    channel: "api".to_string(),
                    attempts: 1,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!("API {} {} timed out after {:?}", method, path, timeout);
                let result = ExecutionResult {
                    duration_ms,
                    timed_out: true,
                    ..ExecutionResult::default()
                };
                Attempt::TimedOut(
                    result,
                    GatewayError::Timeout {
                        after_secs: timeout.as_secs(),
                    },
                )
            }
        }
    }

    fn set_mode(&self, to: ExecutionMode, principal: &str) -> Attempt {
        match self.modes.set(to, principal) {
            Ok(Some(transition)) => {
                info!("Mode changed {} -> {} by {}", transition.from, transition.to, principal);
                Attempt::Completed(ExecutionResult::internal(&format!(
                    "mode changed from {} to {}",
                    transition.from, transition.to
                )))
            }
            Ok(None) => Attempt::Completed(ExecutionResult::internal(&format!("mode already {to}"))),
            Err(e) => {
                error!("Mode change to {} failed: {:#}", to, e);
                Attempt::Stopped(GatewayError::ExecutionChannelUnavailable {
                    channel: "mode-store".to_string(),
                    attempts: 1,
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Classify an action, then sanitize its environment if it passed.
    fn assess(&self, action: &Action) -> Assessment {
        let (verdict, command) = self.classify(action);
        let mut assessment = Assessment {
            verdict,
            command,
            env: SanitizedEnv::default(),
        };
        if !assessment.verdict.is_allowed() {
            return assessment;
        }

        let overrides = match action {
            Action::Shell { env, .. } => env.clone(),
            _ => Default::default(),
        };
        match self.sanitizer.sanitize(&overrides) {
            Ok(env) => assessment.env = env,
            Err(e) => {
                assessment.verdict = ClassificationVerdict::denied(ENV_OVERRIDE_RULE, &e.to_string());
            }
        }
        assessment
    }

    fn classify(&self, action: &Action) -> (ClassificationVerdict, Option<NormalizedCommand>) {
        if let Err(reason) = action.validate() {
            return (ClassificationVerdict::denied(INVALID_ACTION_RULE, &reason), None);
        }

        let command = match normalize(&action.classification_text()) {
            Ok(command) => command,
            Err(e) => {
                let rationale = format!("command could not be parsed: {e}");
                return (ClassificationVerdict::unrecognized(&rationale), None);
            }
        };

        let verdict = match action {
            Action::Shell { .. } => {
                let reserved = command
                    .segments()
                    .iter()
                    .filter_map(|s| s.program())
                    .any(|p| RESERVED_PROGRAMS.contains(&p));
                let untrusted = command
                    .segments()
                    .iter()
                    .filter_map(|s| s.program_dir.as_deref())
                    .find(|dir| !self.sanitizer.is_trusted_dir(dir));
                let violation = self.policy.root_guard().assess(&command).is_violation();
                if violation {
                    self.policy.evaluate(&command)
                } else if let Some(dir) = untrusted {
                    ClassificationVerdict::denied(
                        UNTRUSTED_PROGRAM_RULE,
                        &format!("programs may only be named from the trusted PATH, not '{dir}'"),
                    )
                } else if reserved {
                    ClassificationVerdict::denied(
                        RESERVED_COMMAND_RULE,
                        "this command is only available as a structured action",
                    )
                } else {
                    self.policy.evaluate(&command)
                }
            }
            Action::Api { method, path, payload } => {
                let assessment = self.policy.root_guard().assess_api(*method, path, payload.as_ref());
                self.policy.combine(&command, assessment, action.is_intrinsically_mutating())
            }
            Action::VmAction { node, vmid, op } => {
                let path = vm_status_path(node, *vmid, *op);
                let assessment = self.policy.root_guard().assess_api(HttpMethod::Post, &path, None);
                self.policy.combine(&command, assessment, true)
            }
            Action::SetMode { .. } => self.policy.combine(
                &command,
                RootAssessment::default(),
                action.is_intrinsically_mutating(),
            ),
        };
        (verdict, Some(command))
    }
}

/// The caller-facing error for a verdict that is not Allowed.
fn refusal(verdict: &ClassificationVerdict) -> GatewayError {
    match (verdict.category, verdict.verb_class) {
        (VerdictCategory::RootProtected, Some(verb_class)) => GatewayError::RootProtectionViolation { verb_class },
        _ => GatewayError::ClassificationDenied {
            rule_id: verdict.rule_id.clone(),
            rationale: verdict.rationale.clone(),
        },
    }
}

/// Binds a confirmation token to exactly what will run: the argv or script
/// handed to the channel, or the structured action verbatim, plus any
/// overrides and payload riding along with it.
fn fingerprint(action: &Action, command: Option<&NormalizedCommand>) -> String {
    let mut hasher = Sha256::new();
    match (action, command) {
        (Action::Shell { .. }, Some(command)) => hasher.update(command.to_shell_script().as_bytes()),
        _ => hasher.update(action.classification_text().as_bytes()),
    }
    match action {
        Action::Shell { env, .. } => {
            for (name, value) in env {
                hasher.update(b"\0");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
        }
        Action::Api {
            payload: Some(payload),
            ..
        } => {
            hasher.update(b"\0");
            hasher.update(payload.to_string().as_bytes());
        }
        _ => {}
    }
    hex::encode(hasher.finalize())
}

fn finish_capture(capture: &CaptureStream) -> Result<(), String> {
    if capture.has_failed() {
        return Err("one or more output lines were not written".to_string());
    }
    capture.finish().map_err(|e| format!("capture sync failed: {e}"))
}
