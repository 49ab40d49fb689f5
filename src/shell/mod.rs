//! Command execution: environment sanitizing, channels and dispatch.
//!
//! Nothing in here decides *whether* a command may run; by the time a request
//! reaches the dispatcher the security policy has already approved it.

pub mod channel;
pub mod dispatcher;
pub mod env;
pub mod output;
pub mod ssh;

pub use channel::{ChannelError, ExecRequest, ExecutionChannel, Invocation, LocalChannel};
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use env::{EnvConfig, EnvError, EnvSanitizer, SanitizedEnv};
pub use output::{ExecutionResult, OutputLine, OutputObserver, Stream};
pub use ssh::{SshChannel, SshConfig};
