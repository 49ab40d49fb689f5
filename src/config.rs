//! Gateway configuration.
//!
//! Loaded from a TOML file where every field has a default, then adjusted by
//! a handful of environment variables (a `.env` file is honored). The result
//! is validated before anything is built from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::DisabledApi;
use crate::audit::FileAuditLog;
use crate::gateway::{Gateway, GatewayParts};
use crate::mode::persistence::default_mode_path;
use crate::mode::{ExecutionMode, ModeController};
use crate::security::defaults::default_rules;
use crate::security::rules::RuleError;
use crate::security::{Classifier, Policy, ProtectedIdentity, RootGuard, RuleSpec, RuleTable};
use crate::session::{SessionConfig, SessionGovernor};
use crate::shell::{
    DispatchConfig, Dispatcher, EnvConfig, EnvSanitizer, ExecutionChannel, LocalChannel, SshChannel, SshConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {name}: '{value}'")]
    InvalidOverride { name: String, value: String },
    #[error("invalid rule table: {0}")]
    Rules(#[from] RuleError),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Local,
    Ssh,
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "ssh" => Ok(Self::Ssh),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub dir: PathBuf,
    pub retention_days: u32,
    /// Write-ahead capture of command output next to the audit files.
    pub capture_output: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/log/hostgate"),
            retention_days: 7,
            capture_output: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protected_identity: String,
    pub identity_aliases: Vec<String>,
    pub default_mode: ExecutionMode,
    /// Keep the current mode across restarts. Off means every start is in
    /// `default_mode`.
    pub persist_mode: bool,
    /// Where the current mode is persisted.
    pub state_dir: PathBuf,
    /// Let `&&`, `||`, `;` and `|` chains through when every part is allowed.
    pub allow_validated_chains: bool,
    /// Replaces the built-in table when set.
    pub rules: Option<Vec<RuleSpec>>,
    /// Appended to whichever table is in effect.
    pub extra_rules: Vec<RuleSpec>,
    pub channel: ChannelKind,
    pub ssh: SshConfig,
    pub dispatch: DispatchConfig,
    pub env: EnvConfig,
    pub session: SessionConfig,
    pub audit: AuditConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protected_identity: "root".to_string(),
            identity_aliases: vec!["root@pam".to_string()],
            default_mode: ExecutionMode::Normal,
            persist_mode: false,
            state_dir: PathBuf::from("/var/lib/hostgate"),
            allow_validated_chains: false,
            rules: None,
            extra_rules: Vec::new(),
            channel: ChannelKind::Local,
            ssh: SshConfig::default(),
            dispatch: DispatchConfig::default(),
            env: EnvConfig::default(),
            session: SessionConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Config {
    /// Read `path` (or start from defaults), apply `.env` and process
    /// environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Ignoring .env file: {}", e);
            }
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config
            .apply_overrides(|name| std::env::var(name).ok())
            .context("Invalid environment override")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loading config from {}", path.display());
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply the supported environment variables through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let invalid = |name: &str, value: &str| ConfigError::InvalidOverride {
            name: name.to_string(),
            value: value.to_string(),
        };

        if let Some(v) = lookup("HOSTGATE_PROTECTED_IDENTITY") {
            self.protected_identity = v;
        }
        if let Some(v) = lookup("HOSTGATE_DEFAULT_MODE") {
            self.default_mode = v.parse().map_err(|_| invalid("HOSTGATE_DEFAULT_MODE", &v))?;
        }
        if let Some(v) = lookup("HOSTGATE_PERSIST_MODE") {
            self.persist_mode = v.trim().parse().map_err(|_| invalid("HOSTGATE_PERSIST_MODE", &v))?;
        }
        if let Some(v) = lookup("HOSTGATE_AUDIT_DIR") {
            self.audit.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOSTGATE_CHANNEL") {
            self.channel = v.parse().map_err(|_| invalid("HOSTGATE_CHANNEL", &v))?;
        }
        if let Some(v) = lookup("SSH_HOST") {
            self.ssh.host = v;
        }
        if let Some(v) = lookup("SSH_USER") {
            self.ssh.user = v;
        }
        if let Some(v) = lookup("SSH_PORT") {
            self.ssh.port = v.trim().parse().map_err(|_| invalid("SSH_PORT", &v))?;
        }
        if let Some(v) = lookup("SSH_KEY_PATH") {
            self.ssh.key_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// The rule table in effect, in declaration order.
    pub fn rule_specs(&self) -> Vec<RuleSpec> {
        let mut specs = self.rules.clone().unwrap_or_else(default_rules);
        specs.extend(self.extra_rules.iter().cloned());
        specs
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protected_identity.trim().is_empty() {
            return Err(ConfigError::Invalid("protected_identity must not be empty".to_string()));
        }
        if self.dispatch.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid("dispatch.default_timeout_secs must be positive".to_string()));
        }
        if self.dispatch.default_timeout_secs > self.dispatch.max_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "dispatch.default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                self.dispatch.default_timeout_secs, self.dispatch.max_timeout_secs
            )));
        }
        if self.audit.retention_days == 0 {
            return Err(ConfigError::Invalid("audit.retention_days must be at least 1".to_string()));
        }
        if self.session.max_concurrent == 0 || self.session.rate_limit == 0 {
            return Err(ConfigError::Invalid(
                "session.max_concurrent and session.rate_limit must be positive".to_string(),
            ));
        }
        if self.channel == ChannelKind::Ssh && self.ssh.host.trim().is_empty() {
            return Err(ConfigError::Invalid("ssh channel selected but ssh.host is empty".to_string()));
        }
        RuleTable::from_specs(&self.rule_specs())?;
        Ok(())
    }

    pub fn policy(&self) -> Result<Policy, ConfigError> {
        let table = RuleTable::from_specs(&self.rule_specs())?;
        let identity = ProtectedIdentity::new(&self.protected_identity, &self.identity_aliases);
        Ok(Policy::new(
            Classifier::new(table, self.allow_validated_chains),
            RootGuard::new(identity),
        ))
    }

    fn channel(&self) -> Arc<dyn ExecutionChannel> {
        match self.channel {
            ChannelKind::Local => Arc::new(LocalChannel::default()),
            ChannelKind::Ssh => Arc::new(SshChannel::new(self.ssh.clone())),
        }
    }

    /// Assemble a gateway backed by the file audit log and the configured
    /// execution channel. The management API client stays disabled.
    pub fn build_gateway(&self) -> anyhow::Result<Gateway> {
        let policy = self.policy().context("Failed to compile rule table")?;
        let audit = FileAuditLog::open(&self.audit.dir, self.audit.retention_days)
            .with_context(|| format!("Failed to open audit log at {}", self.audit.dir.display()))?;
        let modes = if self.persist_mode {
            ModeController::with_persistence(self.default_mode, default_mode_path(&self.state_dir))
        } else {
            ModeController::new(self.default_mode)
        };
        let channel = self.channel();

        info!(
            "Gateway ready: {} rule(s), protected identity '{}', {} mode, {} channel",
            policy.classifier().rule_count(),
            self.protected_identity,
            modes.snapshot(),
            channel.name()
        );

        Ok(Gateway::new(GatewayParts {
            policy,
            modes: Arc::new(modes),
            sanitizer: EnvSanitizer::new(self.env.clone()),
            dispatcher: Dispatcher::new(channel, self.dispatch.clone()),
            audit: Arc::new(audit),
            sessions: Arc::new(SessionGovernor::new(self.session.clone())),
            api: Arc::new(DisabledApi),
            capture_dir: self.audit.capture_output.then(|| self.audit.dir.clone()),
        }))
    }
}
