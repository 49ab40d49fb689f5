//! Operating mode controller.
//!
//! One shared value, `Normal` or `Safe`, behind a reader/writer lock. Each
//! request reads a single snapshot; the lock is never held across dispatch.

pub mod persistence;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use self::persistence::PersistedMode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Normal,
    Safe,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Safe => "safe",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "safe" => Ok(Self::Safe),
            other => Err(format!("unknown mode '{other}' (expected 'normal' or 'safe')")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: ExecutionMode,
    pub to: ExecutionMode,
    pub principal: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct ModeState {
    current: ExecutionMode,
    history: Vec<ModeTransition>,
}

#[derive(Debug)]
pub struct ModeController {
    state: RwLock<ModeState>,
    persist_path: Option<PathBuf>,
}

impl ModeController {
    pub fn new(initial: ExecutionMode) -> Self {
        Self {
            state: RwLock::new(ModeState {
                current: initial,
                history: Vec::new(),
            }),
            persist_path: None,
        }
    }

    /// Restore the last persisted mode, falling back to `default` when the
    /// state file is missing or unreadable.
    pub fn with_persistence(default: ExecutionMode, path: PathBuf) -> Self {
        let initial = if path.exists() {
            match persistence::load(&path) {
                Ok(state) => {
                    info!("Restored mode '{}' from {}", state.mode, path.display());
                    state.mode
                }
                Err(e) => {
                    warn!("Ignoring mode state file: {:#}", e);
                    default
                }
            }
        } else {
            default
        };

        Self {
            persist_path: Some(path),
            ..Self::new(initial)
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ModeState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ModeState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> ExecutionMode {
        self.read().current
    }

    pub fn history(&self) -> Vec<ModeTransition> {
        self.read().history.clone()
    }

    /// Switch to `to`. Returns the transition, or `None` when already there.
    /// With persistence enabled the new mode is on disk before it takes
    /// effect; a failed write leaves the mode unchanged.
    pub fn set(&self, to: ExecutionMode, principal: &str) -> anyhow::Result<Option<ModeTransition>> {
        let mut state = self.write();
        if state.current == to {
            return Ok(None);
        }

        if let Some(path) = &self.persist_path {
            persistence::save(path, &PersistedMode::new(to, principal))?;
        }

        let transition = ModeTransition {
            from: state.current,
            to,
            principal: principal.to_string(),
            at: Utc::now(),
        };
        state.current = to;
        state.history.push(transition.clone());
        info!("Mode changed {} -> {} by {}", transition.from, to, principal);
        Ok(Some(transition))
    }
}
