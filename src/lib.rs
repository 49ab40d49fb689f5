//! hostgate - an authorization gateway for privileged operations on a
//! virtualization host.
//!
//! Every request is classified against a declarative rule table, checked
//! against the protected superuser identity, gated on the operating mode,
//! dispatched under a timeout with a sanitized environment and audited
//! before the caller sees the outcome.
//!
//! # Example
//!
//! ```no_run
//! use hostgate::config::Config;
//! use hostgate::gateway::CommandRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let gateway = Config::load(None)?.build_gateway()?;
//!
//!     let response = gateway
//!         .handle(CommandRequest::shell("alice", "qm list"))
//!         .await?;
//!     println!("{:?} -> {:?}", response.verdict.category, response.result);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mode;
pub mod security;
pub mod session;
pub mod shell;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::GatewayError;
pub use gateway::{Action, CommandRequest, Gateway, GatewayResponse};
pub use mode::ExecutionMode;
pub use security::{ClassificationVerdict, VerdictCategory};
