//! hostgate command line.
//!
//! `serve` reads one JSON `CommandRequest` per line on stdin and writes one
//! JSON reply per line on stdout. `audit` queries the audit trail and `check`
//! explains how a command would be treated without running it.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use hostgate::audit::{AuditQuery, AuditSink, FileAuditLog};
use hostgate::config::Config;
use hostgate::gateway::{Action, CommandRequest, Gateway, GatewayResponse};
use hostgate::security::ExecutionDecision;
use hostgate::utils::logger;

#[derive(Debug, Parser)]
#[command(name = "hostgate", version, about = "Authorization gateway for privileged host operations")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Handle newline-delimited JSON requests on stdin
    Serve,
    /// Print audit records as JSON lines
    Audit {
        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        principal: Option<String>,
    },
    /// Classify a command without running it
    Check {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct Reply {
    /// Echo of the request's `id`, if it had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<serde_json::Value>,
    #[serde(flatten)]
    body: ReplyBody,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ReplyBody {
    Response(Box<GatewayResponse>),
    Failure { error: serde_json::Value },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging before anything else
    let log_dir = cli.log_dir.clone().unwrap_or_else(logger::default_log_dir);
    let _log_guard = logger::init_logging(&log_dir);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config.build_gateway()?).await,
        Command::Audit {
            since,
            until,
            principal,
        } => print_audit(&config, AuditQuery { since, until, principal }),
        Command::Check { command } => {
            let gateway = config.build_gateway()?;
            check(&gateway, &command.join(" "));
            Ok(())
        }
    }
}

async fn serve(gateway: Gateway) -> Result<()> {
    let _reaper = gateway.sessions().clone().spawn_reaper();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = reply_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    info!("Serving requests on stdin ({} mode)", gateway.mode());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let gateway = gateway.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let reply = handle_line(&gateway, &line).await;
            match serde_json::to_string(&reply) {
                Ok(json) => {
                    if reply_tx.send(json).is_err() {
                        warn!("Reply dropped: stdout writer has stopped");
                    }
                }
                Err(e) => error!("Failed to serialize reply: {}", e),
            }
        });
    }

    info!("stdin closed, waiting for in-flight requests");
    drop(reply_tx);
    writer.await.context("stdout writer panicked")??;
    Ok(())
}

async fn handle_line(gateway: &Gateway, line: &str) -> Reply {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return invalid_request(None, &e.to_string()),
    };
    let id = value.get("id").cloned();
    let request: CommandRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => return invalid_request(id, &e.to_string()),
    };

    let body = match gateway.handle(request).await {
        Ok(response) => ReplyBody::Response(Box::new(response)),
        Err(e) => ReplyBody::Failure {
            error: serde_json::to_value(&e).unwrap_or_else(|_| serde_json::json!({ "kind": e.kind() })),
        },
    };
    Reply { id, body }
}

fn invalid_request(id: Option<serde_json::Value>, reason: &str) -> Reply {
    warn!("Rejected malformed request: {}", reason);
    Reply {
        id,
        body: ReplyBody::Failure {
            error: serde_json::json!({ "kind": "invalid_request", "reason": reason }),
        },
    }
}

fn print_audit(config: &Config, query: AuditQuery) -> Result<()> {
    let log = FileAuditLog::open(&config.audit.dir, config.audit.retention_days)
        .with_context(|| format!("Failed to open audit log at {}", config.audit.dir.display()))?;
    for record in log.query(&query).context("Audit query failed")? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn check(gateway: &Gateway, command: &str) {
    let (verdict, decision) = gateway.explain(&Action::shell(command));
    let mutating = if verdict.mutating { ", mutating" } else { "" };
    println!(
        "verdict:  {:?} ({}{}) - {}",
        verdict.category, verdict.rule_id, mutating, verdict.rationale
    );
    match decision {
        ExecutionDecision::Execute => println!("decision: execute ({} mode)", gateway.mode()),
        ExecutionDecision::RequireConfirmation { reason } => {
            println!("decision: confirmation required - {reason}")
        }
        ExecutionDecision::Deny { reason } => println!("decision: deny - {reason}"),
    }
}
