//! Execution environment sanitizer.
//!
//! Children never inherit the gateway's environment. Each dispatch gets a
//! fresh map built from fixed trusted values, a few passthrough names copied
//! from the gateway process, and caller overrides restricted to an
//! allow-listed subset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::normalize::shell_quote;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Always set, never overridable.
    pub fixed: BTreeMap<String, String>,
    /// Names a caller may supply.
    pub overridable: Vec<String>,
    /// Names copied from the gateway process when present.
    pub passthrough: Vec<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let fixed = [
            ("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"),
            ("HOME", "/root"),
            ("LANG", "C.UTF-8"),
            ("TERM", "dumb"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            fixed,
            overridable: vec!["LC_ALL".to_string(), "TZ".to_string(), "COLUMNS".to_string()],
            passthrough: vec!["TZ".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("environment variable '{0}' may not be overridden")]
    NotAllowed(String),
    #[error("environment variable '{0}' has an invalid value")]
    InvalidValue(String),
}

/// Environment handed to a child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedEnv(BTreeMap<String, String>);

impl SanitizedEnv {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `env -i NAME=value ...` for channels that cannot clear the remote
    /// environment themselves.
    pub fn to_env_prefix(&self) -> String {
        let mut prefix = String::from("env -i");
        for (k, v) in self.iter() {
            prefix.push(' ');
            prefix.push_str(&shell_quote(&format!("{k}={v}")));
        }
        prefix
    }
}

#[derive(Debug, Clone)]
pub struct EnvSanitizer {
    config: EnvConfig,
    inherited: BTreeMap<String, String>,
}

impl EnvSanitizer {
    pub fn new(config: EnvConfig) -> Self {
        Self::with_lookup(config, |name| std::env::var(name).ok())
    }

    /// Passthrough values are captured once through `lookup`.
    pub fn with_lookup(config: EnvConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let inherited = config
            .passthrough
            .iter()
            .filter(|name| !config.fixed.contains_key(*name))
            .filter_map(|name| lookup(name).map(|v| (name.clone(), v)))
            .filter(|(_, v)| valid_value(v))
            .collect();
        Self { config, inherited }
    }

    /// Directories of the fixed `PATH`; the only places a path-qualified
    /// program may name.
    pub fn trusted_dirs(&self) -> Vec<&str> {
        self.config
            .fixed
            .get("PATH")
            .map(|path| {
                path.split(':')
                    .filter(|dir| dir.starts_with('/'))
                    .map(trim_dir)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_trusted_dir(&self, dir: &str) -> bool {
        self.trusted_dirs().contains(&trim_dir(dir))
    }

    pub fn sanitize(&self, overrides: &BTreeMap<String, String>) -> Result<SanitizedEnv, EnvError> {
        let mut env = self.inherited.clone();

        for (name, value) in overrides {
            if self.config.fixed.contains_key(name) || !self.config.overridable.contains(name) {
                return Err(EnvError::NotAllowed(name.clone()));
            }
            if !valid_value(value) {
                return Err(EnvError::InvalidValue(name.clone()));
            }
            env.insert(name.clone(), value.clone());
        }

        for (name, value) in &self.config.fixed {
            env.insert(name.clone(), value.clone());
        }

        Ok(SanitizedEnv(env))
    }
}

fn trim_dir(dir: &str) -> &str {
    match dir.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn valid_value(value: &str) -> bool {
    !value.contains(['\0', '\n', '\r'])
}
