use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use super::*;
use crate::api::{ApiError, DisabledApi, VmOp};
use crate::audit::MemoryAuditLog;
use crate::audit::log::tests::FailingAuditSink;
use crate::security::defaults::default_rules;
use crate::security::{Classifier, ProtectedIdentity, RootGuard, RuleSpec, RuleTable, VerbClass};
use crate::session::SessionConfig;
use crate::shell::dispatcher::tests::FakeChannel;
use crate::shell::{ChannelError, DispatchConfig, EnvConfig, ExecRequest, ExecutionChannel, LocalChannel};

struct Setup {
    mode: ExecutionMode,
    sessions: SessionConfig,
    rules: Vec<RuleSpec>,
    api: Arc<dyn ManagementApi>,
    capture_dir: Option<PathBuf>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Normal,
            sessions: SessionConfig::default(),
            rules: default_rules(),
            api: Arc::new(DisabledApi),
            capture_dir: None,
        }
    }
}

impl Setup {
    fn safe() -> Self {
        Self {
            mode: ExecutionMode::Safe,
            ..Self::default()
        }
    }

    fn build(self, channel: Arc<dyn ExecutionChannel>, audit: Arc<dyn AuditSink>) -> Gateway {
        let classifier = Classifier::new(RuleTable::from_specs(&self.rules).unwrap(), false);
        let identity = ProtectedIdentity::new("admin", &["root".to_string(), "root@pam".to_string()]);
        Gateway::new(GatewayParts {
            policy: Policy::new(classifier, RootGuard::new(identity)),
            modes: Arc::new(ModeController::new(self.mode)),
            sanitizer: EnvSanitizer::with_lookup(EnvConfig::default(), |_| None),
            dispatcher: Dispatcher::new(channel, DispatchConfig::default()),
            audit,
            sessions: Arc::new(SessionGovernor::new(self.sessions)),
            api: self.api,
            capture_dir: self.capture_dir,
        })
    }

    fn harness(self) -> (Gateway, Arc<FakeChannel>, Arc<MemoryAuditLog>) {
        let channel = Arc::new(FakeChannel::ok("ok"));
        let audit = Arc::new(MemoryAuditLog::new());
        let gateway = self.build(channel.clone(), audit.clone());
        (gateway, channel, audit)
    }
}

/// API stub that answers every call with the same body.
struct StaticApi(serde_json::Value);

impl ManagementApi for StaticApi {
    fn call(
        &self,
        _method: HttpMethod,
        _path: &str,
        _payload: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value, ApiError>> {
        let body = self.0.clone();
        Box::pin(async move { Ok(body) })
    }
}

/// Channel that takes a while to answer.
struct SlowChannel(Duration);

impl ExecutionChannel for SlowChannel {
    fn name(&self) -> &str {
        "slow"
    }

    fn execute(&self, _request: ExecRequest) -> BoxFuture<'_, Result<ExecutionResult, ChannelError>> {
        Box::pin(async move {
            tokio::time::sleep(self.0).await;
            Ok(ExecutionResult::internal("done"))
        })
    }
}

#[tokio::test]
async fn test_service_status_dispatched_in_normal_mode() {
    let (gateway, channel, audit) = Setup::default().harness();

    let response = gateway.handle(CommandRequest::shell("alice", "service status")).await.unwrap();

    assert_eq!(response.verdict.category, VerdictCategory::Allowed);
    assert_eq!(response.verdict.rule_id, "allow.service-status");
    assert!(response.error.is_none());
    let result = response.result.as_ref().unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout(), "ok");
    assert_eq!(channel.call_count(), 1);

    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, response.audit_record_id);
    assert_eq!(records[0].session_id, response.session_id);
    assert_eq!(records[0].mode, ExecutionMode::Normal);
    assert!(matches!(records[0].outcome, AuditOutcome::Executed { exit_code: Some(0), .. }));
}

#[tokio::test]
async fn test_package_install_denied_without_dispatch() {
    let (gateway, channel, audit) = Setup::default().harness();

    let response = gateway.handle(CommandRequest::shell("alice", "pkg install foo")).await.unwrap();

    assert_eq!(response.verdict.category, VerdictCategory::Denied);
    assert!(response.result.is_none());
    assert_eq!(
        response.error,
        Some(GatewayError::ClassificationDenied {
            rule_id: "deny.package-install".to_string(),
            rationale: "package installation is not permitted through the gateway".to_string(),
        })
    );
    assert_eq!(channel.call_count(), 0);

    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].verdict.category, VerdictCategory::Denied);
    assert!(matches!(records[0].outcome, AuditOutcome::Refused { .. }));
}

#[tokio::test]
async fn test_unrecognized_command_is_default_denied() {
    let (gateway, channel, _audit) = Setup::default().harness();

    let response = gateway
        .handle(CommandRequest::shell("alice", "curl http://example.com"))
        .await
        .unwrap();

    assert_eq!(response.verdict.category, VerdictCategory::Unrecognized);
    assert!(matches!(
        response.error,
        Some(GatewayError::ClassificationDenied { ref rule_id, .. }) if rule_id == "unrecognized"
    ));

    let unparseable = gateway.handle(CommandRequest::shell("alice", "echo 'unterminated")).await.unwrap();
    assert_eq!(unparseable.verdict.category, VerdictCategory::Unrecognized);
    assert!(unparseable.verdict.rationale.contains("unterminated quote"));
    assert_eq!(channel.call_count(), 0);
}

#[tokio::test]
async fn test_credential_change_on_protected_identity() {
    let (gateway, channel, audit) = Setup::default().harness();

    let response = gateway
        .handle(CommandRequest::shell("alice", "account set-password admin --value X"))
        .await
        .unwrap();

    assert_eq!(response.verdict.category, VerdictCategory::RootProtected);
    assert_eq!(
        response.error,
        Some(GatewayError::RootProtectionViolation {
            verb_class: VerbClass::ChangeCredential,
        })
    );
    assert_eq!(channel.call_count(), 0);

    let record = &audit.records()[0];
    assert_eq!(record.verdict.rule_id, "root-protection");
    assert!(!record.command.contains("--value X"));
}

#[tokio::test]
async fn test_root_protection_overrides_allow_rule_for_aliases() {
    let (gateway, channel, _audit) = Setup::default().harness();

    for command in ["pveum passwd root@pam", "pveum passwd ROOT", "sudo pveum passwd 'root'"] {
        let response = gateway.handle(CommandRequest::shell("alice", command)).await.unwrap();
        assert_eq!(response.verdict.category, VerdictCategory::RootProtected, "{command}");
        assert!(matches!(
            response.error,
            Some(GatewayError::RootProtectionViolation { .. })
        ));
    }
    assert_eq!(channel.call_count(), 0);

    // Another user is fine.
    let response = gateway
        .handle(CommandRequest::shell("alice", "pveum passwd bob@pve"))
        .await
        .unwrap();
    assert_eq!(response.verdict.category, VerdictCategory::Allowed);
    assert_eq!(channel.call_count(), 1);
}

#[tokio::test]
async fn test_root_protection_short_circuits_confirmation() {
    let (gateway, channel, _audit) = Setup::safe().harness();

    let response = gateway
        .handle(CommandRequest::shell("alice", "pveum passwd root@pam"))
        .await
        .unwrap();

    assert!(matches!(
        response.error,
        Some(GatewayError::RootProtectionViolation { .. })
    ));
    assert!(response.confirmation_token().is_none());
    assert_eq!(channel.call_count(), 0);
}

#[tokio::test]
async fn test_api_call_against_protected_identity() {
    let (gateway, _channel, audit) = Setup::default().harness();

    let request = CommandRequest::new(
        "alice",
        Action::Api {
            method: HttpMethod::Put,
            path: "/access/password".to_string(),
            payload: Some(serde_json::json!({ "userid": "root@pam", "password": "hunter2" })),
        },
    );
    let response = gateway.handle(request).await.unwrap();

    assert_eq!(response.verdict.category, VerdictCategory::RootProtected);
    let record = &audit.records()[0];
    assert!(record.command.starts_with("api put /access/password"));
    assert!(!record.command.contains("hunter2"));
}

#[tokio::test]
async fn test_safe_mode_confirmation_flow() {
    let (gateway, channel, audit) = Setup::safe().harness();

    let first = gateway.handle(CommandRequest::shell("alice", "qm start 101")).await.unwrap();
    assert!(first.verdict.is_allowed());
    assert!(first.verdict.mutating);
    let token = first.confirmation_token().unwrap().to_string();
    assert!(matches!(
        first.error,
        Some(GatewayError::ConfirmationRequired { expires_in_secs: 300, .. })
    ));
    assert_eq!(channel.call_count(), 0);

    let confirmed = gateway
        .handle(CommandRequest::shell("alice", "qm start 101").with_token(&token))
        .await
        .unwrap();
    assert!(confirmed.error.is_none());
    assert_eq!(confirmed.result.unwrap().exit_code, Some(0));
    assert_eq!(channel.call_count(), 1);

    let reused = gateway
        .handle(CommandRequest::shell("alice", "qm start 101").with_token(&token))
        .await
        .unwrap();
    assert!(matches!(reused.error, Some(GatewayError::ConfirmationExpired { .. })));
    assert!(reused.result.is_none());
    assert_eq!(channel.call_count(), 1);

    assert_eq!(audit.len(), 3);
    for record in audit.records() {
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains(&token), "token leaked into audit: {json}");
    }
}

#[tokio::test]
async fn test_token_bound_to_command() {
    let (gateway, channel, _audit) = Setup::safe().harness();

    let first = gateway.handle(CommandRequest::shell("alice", "qm start 101")).await.unwrap();
    let token = first.confirmation_token().unwrap().to_string();

    let other = gateway
        .handle(CommandRequest::shell("alice", "qm stop 102").with_token(&token))
        .await
        .unwrap();
    assert_eq!(
        other.error,
        Some(GatewayError::ConfirmationExpired {
            reason: "token was issued for a different command".to_string(),
        })
    );
    assert_eq!(channel.call_count(), 0);
}

#[tokio::test]
async fn test_program_path_outside_trusted_path_denied() {
    let (gateway, channel, _audit) = Setup::safe().harness();

    let planted = gateway.handle(CommandRequest::shell("alice", "/tmp/x/uptime")).await.unwrap();
    assert_eq!(planted.verdict.category, VerdictCategory::Denied);
    assert_eq!(planted.verdict.rule_id, UNTRUSTED_PROGRAM_RULE);
    assert!(planted.result.is_none());

    let relative = gateway.handle(CommandRequest::shell("alice", "./uptime")).await.unwrap();
    assert_eq!(relative.verdict.rule_id, UNTRUSTED_PROGRAM_RULE);
    assert_eq!(channel.call_count(), 0);

    let trusted = gateway.handle(CommandRequest::shell("alice", "/usr/bin/UPTIME")).await.unwrap();
    assert_eq!(trusted.verdict.rule_id, "allow.uptime");
    assert!(trusted.error.is_none());
    let calls = channel.calls.lock().unwrap();
    assert_eq!(calls[0].invocation, Invocation::Argv(vec!["uptime".to_string()]));
}

#[tokio::test]
async fn test_token_not_redeemable_through_planted_program() {
    let (gateway, channel, _audit) = Setup::safe().harness();

    let first = gateway.handle(CommandRequest::shell("alice", "qm start 101")).await.unwrap();
    let token = first.confirmation_token().unwrap().to_string();

    let planted = gateway
        .handle(CommandRequest::shell("alice", "/tmp/x/qm start 101").with_token(&token))
        .await
        .unwrap();
    assert_eq!(planted.verdict.rule_id, UNTRUSTED_PROGRAM_RULE);
    assert_eq!(channel.call_count(), 0);

    let confirmed = gateway
        .handle(CommandRequest::shell("alice", "qm start 101").with_token(&token))
        .await
        .unwrap();
    assert!(confirmed.error.is_none());
    assert_eq!(channel.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_redemption_dispatches_once() {
    let (gateway, channel, audit) = Setup::safe().harness();

    let first = gateway.handle(CommandRequest::shell("alice", "qm start 101")).await.unwrap();
    let token = first.confirmation_token().unwrap().to_string();

    let request = CommandRequest::shell("alice", "qm start 101").with_token(&token);
    let (a, b) = tokio::join!(gateway.handle(request.clone()), gateway.handle(request));
    let responses = [a.unwrap(), b.unwrap()];

    let dispatched = responses.iter().filter(|r| r.dispatched()).count();
    let rejected = responses
        .iter()
        .filter(|r| matches!(r.error, Some(GatewayError::ConfirmationExpired { .. })))
        .count();
    assert_eq!(dispatched, 1);
    assert_eq!(rejected, 1);
    assert_eq!(channel.call_count(), 1);
    assert_eq!(audit.len(), 3);
}

#[tokio::test]
async fn test_token_not_usable_by_other_principal() {
    let (gateway, channel, _audit) = Setup::safe().harness();

    let first = gateway.handle(CommandRequest::shell("alice", "qm start 101")).await.unwrap();
    let token = first.confirmation_token().unwrap().to_string();

    let stolen = gateway
        .handle(CommandRequest::shell("mallory", "qm start 101").with_token(&token))
        .await
        .unwrap();
    assert!(matches!(stolen.error, Some(GatewayError::ConfirmationExpired { .. })));
    assert_eq!(channel.call_count(), 0);
}

#[tokio::test]
async fn test_read_only_runs_without_token_in_safe_mode() {
    let (gateway, channel, _audit) = Setup::safe().harness();

    let response = gateway.handle(CommandRequest::shell("alice", "uptime")).await.unwrap();
    assert!(response.error.is_none());
    assert_eq!(response.mode, ExecutionMode::Safe);
    assert_eq!(channel.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_expires_with_its_tokens() {
    let (gateway, channel, _audit) = Setup::safe().harness();

    let first = gateway.handle(CommandRequest::shell("alice", "qm start 101")).await.unwrap();
    let token = first.confirmation_token().unwrap().to_string();
    let old_session = first.session_id.unwrap();

    tokio::time::advance(Duration::from_secs(31 * 60)).await;

    let mut late = CommandRequest::shell("alice", "qm start 101").with_token(&token);
    late.session_id = Some(old_session);
    let response = gateway.handle(late).await.unwrap();

    assert_ne!(response.session_id, Some(old_session));
    assert_eq!(
        response.error,
        Some(GatewayError::ConfirmationExpired {
            reason: "session expired".to_string(),
        })
    );
    assert_eq!(channel.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_token_rejected_without_session_id() {
    let (gateway, channel, _audit) = Setup::safe().harness();

    let first = gateway.handle(CommandRequest::shell("alice", "qm start 101")).await.unwrap();
    let token = first.confirmation_token().unwrap().to_string();

    tokio::time::advance(Duration::from_secs(31 * 60)).await;

    let response = gateway
        .handle(CommandRequest::shell("alice", "qm start 101").with_token(&token))
        .await
        .unwrap();
    assert!(matches!(response.error, Some(GatewayError::ConfirmationExpired { .. })));
    assert_eq!(channel.call_count(), 0);
}

#[tokio::test]
async fn test_one_audit_record_per_attempt() {
    let (gateway, _channel, audit) = Setup::safe().harness();

    let requests = [
        CommandRequest::shell("alice", "uptime"),
        CommandRequest::shell("alice", "pkg install foo"),
        CommandRequest::shell("bob", "qm start 101"),
        CommandRequest::shell("bob", "echo 'unterminated"),
        CommandRequest::shell("carol", "account set-password admin --value X"),
    ];
    let mut ids = Vec::new();
    for request in requests {
        ids.push(gateway.handle(request).await.unwrap().audit_record_id);
    }

    let records = audit.records();
    assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
    assert!(records.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let bob = gateway
        .query_audit(&AuditQuery {
            principal: Some("bob".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(bob.len(), 2);
}

#[tokio::test]
async fn test_audit_failure_withholds_result() {
    let channel = Arc::new(FakeChannel::ok("secret output"));
    let gateway = Setup::default().build(channel.clone(), Arc::new(FailingAuditSink));

    let err = gateway
        .handle(CommandRequest::shell("alice", "service status"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AuditWriteFailure { .. }));
    assert_eq!(channel.call_count(), 1);

    let err = gateway
        .handle(CommandRequest::shell("alice", "pkg install foo"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AuditWriteFailure { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_still_audited() {
    let audit = Arc::new(MemoryAuditLog::new());
    let gateway = Setup::default().build(Arc::new(SlowChannel(Duration::from_secs(10))), audit.clone());

    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        gateway.handle(CommandRequest::shell("alice", "uptime")),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(audit.is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn test_timeout_reported_with_partial_result() {
    let partial = ExecutionResult {
        exit_code: None,
        duration_ms: 5_000,
        timed_out: true,
        ..ExecutionResult::internal("partial line")
    };
    let channel = Arc::new(FakeChannel::new(vec![Ok(partial)]));
    let audit = Arc::new(MemoryAuditLog::new());
    let gateway = Setup::default().build(channel, audit.clone());

    let response = gateway
        .handle(CommandRequest::shell("alice", "uptime").with_timeout(5))
        .await
        .unwrap();

    assert_eq!(response.error, Some(GatewayError::Timeout { after_secs: 5 }));
    let result = response.result.unwrap();
    assert!(result.timed_out);
    assert_eq!(result.stdout(), "partial line");
    assert!(matches!(
        audit.records()[0].outcome,
        AuditOutcome::Executed { timed_out: true, .. }
    ));
}

#[tokio::test]
async fn test_real_process_killed_at_timeout() {
    let mut rules = default_rules();
    rules.push(RuleSpec::allow("allow.sleep", "sleep *", false, "test sleeper"));
    let setup = Setup {
        rules,
        ..Setup::default()
    };
    let audit = Arc::new(MemoryAuditLog::new());
    let gateway = setup.build(Arc::new(LocalChannel::default()), audit.clone());

    let started = std::time::Instant::now();
    let response = gateway
        .handle(CommandRequest::shell("alice", "sleep 30").with_timeout(1))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(response.error, Some(GatewayError::Timeout { after_secs: 1 }));
    assert!(response.result.unwrap().timed_out);
    assert_eq!(audit.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retried_for_read_only_only() {
    let channel = Arc::new(FakeChannel::new(vec![
        Err(ChannelError::Transient("connection reset".to_string())),
        Ok(ExecutionResult::internal("up 3 days")),
        Err(ChannelError::Transient("connection reset".to_string())),
    ]));
    let gateway = Setup::default().build(channel.clone(), Arc::new(MemoryAuditLog::new()));

    let read = gateway.handle(CommandRequest::shell("alice", "uptime")).await.unwrap();
    assert_eq!(read.result.unwrap().stdout(), "up 3 days");
    assert_eq!(channel.call_count(), 2);

    let write = gateway.handle(CommandRequest::shell("alice", "qm start 101")).await.unwrap();
    assert!(matches!(
        write.error,
        Some(GatewayError::ExecutionChannelUnavailable { attempts: 1, .. })
    ));
    assert_eq!(channel.call_count(), 3);
}

#[tokio::test]
async fn test_vm_action_with_disabled_api() {
    let (gateway, channel, audit) = Setup::default().harness();

    let request = CommandRequest::new(
        "alice",
        Action::VmAction {
            node: "pve".to_string(),
            vmid: 101,
            op: VmOp::Restart,
        },
    );
    let response = gateway.handle(request).await.unwrap();

    assert_eq!(response.verdict.rule_id, "allow.api-vm-status");
    assert!(response.verdict.mutating);
    assert!(matches!(
        response.error,
        Some(GatewayError::ExecutionChannelUnavailable { ref channel, .. }) if channel == "api"
    ));
    assert_eq!(channel.call_count(), 0);
    assert_eq!(
        audit.records()[0].command,
        "api post /nodes/pve/qemu/101/status/reboot"
    );
    assert!(matches!(audit.records()[0].outcome, AuditOutcome::Failed { .. }));
}

#[tokio::test]
async fn test_invalid_vm_node_denied() {
    let (gateway, _channel, _audit) = Setup::default().harness();

    let request = CommandRequest::new(
        "alice",
        Action::VmAction {
            node: "pve;reboot".to_string(),
            vmid: 101,
            op: VmOp::Start,
        },
    );
    let response = gateway.handle(request).await.unwrap();
    assert!(matches!(
        response.error,
        Some(GatewayError::ClassificationDenied { ref rule_id, .. }) if rule_id == INVALID_ACTION_RULE
    ));
}

#[tokio::test]
async fn test_api_read_returns_body() {
    let setup = Setup {
        api: Arc::new(StaticApi(serde_json::json!({ "data": [{ "vmid": 101 }] }))),
        ..Setup::default()
    };
    let (gateway, _channel, _audit) = setup.harness();

    let request = CommandRequest::new(
        "alice",
        Action::Api {
            method: HttpMethod::Get,
            path: "/cluster/resources".to_string(),
            payload: None,
        },
    );
    let response = gateway.handle(request).await.unwrap();

    assert_eq!(response.verdict.rule_id, "allow.api-read");
    assert!(!response.verdict.mutating);
    assert!(response.result.unwrap().stdout().contains("\"vmid\": 101"));
}

#[tokio::test]
async fn test_api_path_cannot_climb_out_of_allowed_prefix() {
    let (gateway, _channel, audit) = Setup::default().harness();

    let action = Action::Api {
        method: HttpMethod::Post,
        path: "/nodes/pve/qemu/101/status/../../../../access/acl".to_string(),
        payload: Some(serde_json::json!({ "users": "alice@pve", "roles": "Administrator" })),
    };
    let (verdict, decision) = gateway.explain(&action);
    assert_eq!(verdict.category, VerdictCategory::Denied);
    assert_eq!(verdict.rule_id, INVALID_ACTION_RULE);
    assert!(matches!(decision, ExecutionDecision::Deny { .. }));

    let response = gateway.handle(CommandRequest::new("alice", action)).await.unwrap();
    assert!(!response.dispatched());
    assert!(matches!(audit.records()[0].outcome, AuditOutcome::Refused { .. }));

    // A wildcard segment never spans more than one path segment.
    let (verdict, _) = gateway.explain(&Action::Api {
        method: HttpMethod::Post,
        path: "/nodes/pve/qemu/101/status/start/extra".to_string(),
        payload: None,
    });
    assert_eq!(verdict.category, VerdictCategory::Unrecognized);
}

#[tokio::test]
async fn test_reserved_programs_not_reachable_from_shell() {
    let (gateway, channel, _audit) = Setup::default().harness();

    for command in ["api post /nodes/pve/qemu/101/status/start", "gateway mode normal"] {
        let response = gateway.handle(CommandRequest::shell("alice", command)).await.unwrap();
        assert_eq!(response.verdict.rule_id, RESERVED_COMMAND_RULE, "{command}");
    }
    assert_eq!(channel.call_count(), 0);
}

#[tokio::test]
async fn test_mode_toggle() {
    let (gateway, _channel, _audit) = Setup::safe().harness();
    let normal = Action::SetMode {
        mode: ExecutionMode::Normal,
    };

    // Relaxing the mode is itself confirmed.
    let first = gateway.handle(CommandRequest::new("alice", normal.clone())).await.unwrap();
    let token = first.confirmation_token().unwrap().to_string();
    assert_eq!(gateway.mode(), ExecutionMode::Safe);

    let confirmed = gateway
        .handle(CommandRequest::new("alice", normal).with_token(&token))
        .await
        .unwrap();
    assert!(confirmed.error.is_none());
    assert_eq!(gateway.mode(), ExecutionMode::Normal);

    // Tightening is not.
    let safe = gateway
        .handle(CommandRequest::new(
            "bob",
            Action::SetMode {
                mode: ExecutionMode::Safe,
            },
        ))
        .await
        .unwrap();
    assert!(safe.error.is_none());
    assert_eq!(gateway.mode(), ExecutionMode::Safe);

    let history = gateway.modes().history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].principal, "bob");
}

#[tokio::test]
async fn test_environment_overrides() {
    let (gateway, channel, _audit) = Setup::default().harness();

    let mut env = BTreeMap::new();
    env.insert("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string());
    let request = CommandRequest::new(
        "alice",
        Action::Shell {
            command: "uptime".to_string(),
            env,
        },
    );
    let response = gateway.handle(request).await.unwrap();
    assert_eq!(response.verdict.rule_id, ENV_OVERRIDE_RULE);
    assert_eq!(channel.call_count(), 0);

    let mut env = BTreeMap::new();
    env.insert("TZ".to_string(), "UTC".to_string());
    let request = CommandRequest::new(
        "alice",
        Action::Shell {
            command: "uptime".to_string(),
            env,
        },
    );
    let response = gateway.handle(request).await.unwrap();
    assert!(response.error.is_none());

    let calls = channel.calls.lock().unwrap();
    assert_eq!(calls[0].env.get("TZ"), Some("UTC"));
    assert_eq!(calls[0].env.get("HOME"), Some("/root"));
}

#[tokio::test]
async fn test_rate_limit_per_principal() {
    let setup = Setup {
        sessions: SessionConfig {
            rate_limit: 2,
            ..SessionConfig::default()
        },
        ..Setup::default()
    };
    let (gateway, channel, audit) = setup.harness();

    for _ in 0..2 {
        let response = gateway.handle(CommandRequest::shell("alice", "uptime")).await.unwrap();
        assert!(response.error.is_none());
    }
    let limited = gateway.handle(CommandRequest::shell("alice", "uptime")).await.unwrap();
    assert!(matches!(limited.error, Some(GatewayError::RateLimited { .. })));
    assert!(limited.session_id.is_none());

    // Other principals have their own window.
    let other = gateway.handle(CommandRequest::shell("bob", "uptime")).await.unwrap();
    assert!(other.error.is_none());

    assert_eq!(channel.call_count(), 3);
    assert_eq!(audit.len(), 4);
}

#[tokio::test]
async fn test_output_captured_before_response() {
    let dir = tempfile::tempdir().unwrap();
    let setup = Setup {
        capture_dir: Some(dir.path().to_path_buf()),
        ..Setup::default()
    };
    let (gateway, _channel, _audit) = setup.harness();

    let response = gateway.handle(CommandRequest::shell("alice", "service status")).await.unwrap();

    let path = CaptureStream::capture_path(dir.path(), response.session_id.unwrap());
    let content = std::fs::read_to_string(path).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(content.contains(&response.audit_record_id.to_string()));
    assert!(content.contains("\"text\":\"ok\""));
}

#[tokio::test]
async fn test_explain_has_no_side_effects() {
    let (gateway, channel, audit) = Setup::safe().harness();

    let (verdict, decision) = gateway.explain(&Action::shell("qm start 101"));
    assert!(verdict.is_allowed());
    assert!(matches!(decision, ExecutionDecision::RequireConfirmation { .. }));

    let (verdict, decision) = gateway.explain(&Action::shell("rm -rf /"));
    assert_eq!(verdict.rule_id, "deny.rm-root");
    assert!(matches!(decision, ExecutionDecision::Deny { .. }));

    assert_eq!(channel.call_count(), 0);
    assert!(audit.is_empty());
    assert_eq!(gateway.sessions().session_count(), 0);
}
