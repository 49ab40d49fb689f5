//! Execution channels.
//!
//! A channel runs one approved invocation under a timeout and reports the
//! captured output. The local channel spawns the process directly; the ssh
//! channel (see `ssh.rs`) drives the system ssh client through the same
//! supervision loop.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

use super::env::SanitizedEnv;
use super::output::{ExecutionResult, OutputCollector, OutputObserver, Stream};
use crate::security::normalize::{NormalizedCommand, shell_quote};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Spawned directly, no shell involved.
    Argv(Vec<String>),
    /// A validated chain that needs `sh -c`.
    Script(String),
}

impl Invocation {
    /// Single commands run argv-style; validated chains go through the shell
    /// with every token requoted. Programs always run by the name that was
    /// classified.
    pub fn from_command(command: &NormalizedCommand) -> Self {
        match command.segments() {
            [single] if !command.has_constructs() => Self::Argv(single.argv()),
            _ => Self::Script(command.to_shell_script()),
        }
    }

    /// The invocation as one line of POSIX shell.
    pub fn to_shell(&self) -> String {
        match self {
            Self::Argv(argv) => argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "),
            Self::Script(script) => format!("/bin/sh -c {}", shell_quote(script)),
        }
    }
}

#[derive(Clone)]
pub struct ExecRequest {
    pub invocation: Invocation,
    pub env: SanitizedEnv,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub observer: Option<Arc<dyn OutputObserver>>,
}

impl std::fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecRequest")
            .field("invocation", &self.invocation)
            .field("env", &self.env)
            .field("timeout", &self.timeout)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Worth retrying: the channel itself failed, not the command.
    #[error("transient channel failure: {0}")]
    Transient(String),
    #[error("channel failure: {0}")]
    Failed(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub trait ExecutionChannel: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecutionResult, ChannelError>>;
}

/// Runs commands on the gateway host.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    shell: PathBuf,
    working_dir: PathBuf,
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            working_dir: PathBuf::from("/"),
        }
    }
}

impl LocalChannel {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            ..Self::default()
        }
    }

    fn command(&self, invocation: &Invocation) -> Result<Command, ChannelError> {
        let cmd = match invocation {
            Invocation::Argv(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| ChannelError::Failed("empty argv".to_string()))?;
                let mut c = Command::new(program);
                c.args(args);
                c
            }
            Invocation::Script(script) => {
                let mut c = Command::new(&self.shell);
                c.arg("-c").arg(script);
                c
            }
        };
        Ok(cmd)
    }
}

impl ExecutionChannel for LocalChannel {
    fn name(&self) -> &str {
        "local"
    }

    fn execute(&self, request: ExecRequest) -> BoxFuture<'_, Result<ExecutionResult, ChannelError>> {
        Box::pin(async move {
            let mut cmd = self.command(&request.invocation)?;
            cmd.current_dir(&self.working_dir);
            cmd.env_clear();
            cmd.envs(request.env.iter());
            let result = supervise(cmd, &request).await?;
            Ok(result)
        })
    }
}

/// Spawn `cmd` in its own process group, stream its output into a bounded
/// collector and kill the whole group if the deadline passes.
pub(crate) async fn supervise(
    mut cmd: Command,
    request: &ExecRequest,
) -> Result<ExecutionResult, ChannelError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd.process_group(0);

    let started = Instant::now();
    let deadline = started + request.timeout;

    let mut child = cmd
        .spawn()
        .map_err(|e| ChannelError::Failed(format!("failed to spawn: {e}")))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ChannelError::Failed("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ChannelError::Failed("stderr not captured".to_string()))?;

    let out_lines = SplitStream::new(BufReader::new(stdout).split(b'\n')).map(|l| (Stream::Stdout, l));
    let err_lines = SplitStream::new(BufReader::new(stderr).split(b'\n')).map(|l| (Stream::Stderr, l));
    let mut lines = out_lines.merge(err_lines);

    let mut collector = OutputCollector::new(request.max_output_bytes);
    let observer = request.observer.clone();

    let outcome = tokio::time::timeout_at(deadline, async {
        while let Some((stream, line)) = lines.next().await {
            let bytes = match line {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read child {}: {}", stream, e);
                    break;
                }
            };
            let text = String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_string();
            if let Some(stored) = collector.push(stream, text) {
                if let Some(observer) = &observer {
                    observer.on_line(stored);
                }
            }
        }
        child.wait().await
    })
    .await;

    let (exit_code, timed_out) = match outcome {
        Ok(Ok(status)) => (status.code().or_else(|| status.signal().map(|s| 128 + s)), false),
        Ok(Err(e)) => return Err(ChannelError::Failed(format!("failed to wait for child: {e}"))),
        Err(_) => {
            warn!("Child {:?} exceeded {:?}, killing process group", pid, request.timeout);
            kill_process_group(pid);
            if let Err(e) = child.kill().await {
                debug!("child already gone: {}", e);
            }
            (None, true)
        }
    };

    let (output, truncated) = collector.into_lines();
    Ok(ExecutionResult {
        output,
        exit_code,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        timed_out,
        truncated,
    })
}

fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this child.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!("killpg({}) failed: {}", pgid, std::io::Error::last_os_error());
    }
}
