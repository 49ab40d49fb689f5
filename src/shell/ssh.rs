//! Remote execution through the system ssh client.

use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use super::channel::{ChannelError, ExecRequest, ExecutionChannel, Invocation, supervise};
use super::env::SanitizedEnv;
use super::output::ExecutionResult;

/// ssh reserves 255 for its own failures (connect, auth, host key).
const SSH_FAILURE_EXIT: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// ssh client binary.
    pub program: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: "root".to_string(),
            port: 22,
            key_path: None,
            connect_timeout_secs: 10,
            program: PathBuf::from("ssh"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshChannel {
    config: SshConfig,
}

impl SshChannel {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn destination(&self) -> String {
        if self.config.user.is_empty() {
            self.config.host.clone()
        } else {
            format!("{}@{}", self.config.user, self.config.host)
        }
    }

    /// Arguments for the local ssh client, destination last.
    fn client_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            "-T".to_string(),
            "-p".to_string(),
            self.config.port.to_string(),
        ];
        if let Some(key) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(self.destination());
        args
    }
}

/// The remote side runs whatever string we pass through its login shell, so
/// the environment is reset with `env -i` and every word is quoted.
pub fn remote_command(invocation: &Invocation, env: &SanitizedEnv) -> String {
    format!("{} {}", env.to_env_prefix(), invocation.to_shell())
}

impl ExecutionChannel for SshChannel {
    fn name(&self) -> &str {
        "ssh"
    }

    fn execute(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecutionResult, ChannelError>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.config.program);
            cmd.args(self.client_args());
            cmd.arg("--");
            cmd.arg(remote_command(&request.invocation, &request.env));
            // The local ssh client itself gets a minimal environment too.
            cmd.env_clear();
            cmd.envs(request.env.iter());

            debug!("ssh {} ({:?})", self.destination(), request.invocation);
            let result = supervise(cmd, &request).await?;

            if result.exit_code == Some(SSH_FAILURE_EXIT) {
                let reason = result.stderr();
                warn!("ssh to {} failed: {}", self.destination(), reason);
                return Err(ChannelError::Transient(if reason.is_empty() {
                    "ssh exited with status 255".to_string()
                } else {
                    reason
                }));
            }
            Ok(result)
        })
    }
}
