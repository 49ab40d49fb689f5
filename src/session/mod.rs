//! Session and rate governor.
//!
//! Requests are correlated per principal into a session that expires after a
//! period of inactivity. The session owns the request rate window, the
//! in-flight dispatch count and any outstanding confirmation tokens; when it
//! expires all of those go with it.

pub mod rate;
pub mod token;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::rate::SlidingWindow;
use self::token::{PendingConfirmation, generate_token, token_digest};
use crate::error::GatewayError;
use crate::utils::guard::Guard;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub max_concurrent: usize,
    pub rate_limit: usize,
    pub rate_window_secs: u64,
    pub token_ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            max_concurrent: 4,
            rate_limit: 60,
            rate_window_secs: 60,
            token_ttl_secs: 5 * 60,
            reap_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub principal: String,
    pub created_at: DateTime<Utc>,
    last_active: Instant,
    window: SlidingWindow,
    tokens: Vec<PendingConfirmation>,
    in_flight: Arc<AtomicUsize>,
}

impl Session {
    fn new(principal: &str, config: &SessionConfig, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal: principal.to_string(),
            created_at: Utc::now(),
            last_active: now,
            window: SlidingWindow::new(config.rate_limit, Duration::from_secs(config.rate_window_secs)),
            tokens: Vec::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_active) >= timeout
    }

    pub fn outstanding_tokens(&self) -> usize {
        self.tokens.len()
    }
}

/// Issued to the caller; the plain token is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Holds one concurrency slot until dropped.
pub struct DispatchPermit {
    _release: Guard<Box<dyn FnOnce() + Send + Sync>>,
}

impl std::fmt::Debug for DispatchPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DispatchPermit")
    }
}

/// A principal's live session, as seen by one request.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    session: Arc<Mutex<Session>>,
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct SessionGovernor {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    config: SessionConfig,
}

impl SessionGovernor {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Find or start the principal's session and count the request against
    /// its rate window. An idle session is replaced, dropping its tokens.
    pub fn admit(&self, principal: &str) -> Result<SessionHandle, GatewayError> {
        let now = Instant::now();
        let entry = self
            .sessions
            .entry(principal.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(principal, &self.config, now))))
            .clone();

        let mut session = lock(&entry);
        if session.is_idle(now, self.config.idle_timeout()) {
            info!(
                "Session {} for {} expired; dropping {} token(s)",
                session.id,
                principal,
                session.tokens.len()
            );
            let in_flight = session.in_flight.clone();
            *session = Session::new(principal, &self.config, now);
            session.in_flight = in_flight;
        }
        session.last_active = now;

        if let Err(retry_after) = session.window.try_acquire(now) {
            warn!("Rate limit hit for {}", principal);
            return Err(GatewayError::RateLimited {
                reason: format!(
                    "more than {} requests in {}s",
                    self.config.rate_limit, self.config.rate_window_secs
                ),
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        Ok(SessionHandle {
            id: session.id,
            session: entry.clone(),
        })
    }

    /// Take a concurrent-dispatch slot. The slot is returned when the permit
    /// drops, including when the request future is cancelled.
    pub fn acquire_slot(&self, handle: &SessionHandle) -> Result<DispatchPermit, GatewayError> {
        let counter = lock(&handle.session).in_flight.clone();
        let max = self.config.max_concurrent;
        let acquired = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok();
        if !acquired {
            return Err(GatewayError::RateLimited {
                reason: format!("more than {max} concurrent dispatches"),
                retry_after_secs: 1,
            });
        }

        let release: Box<dyn FnOnce() + Send + Sync> = Box::new(move || {
            counter.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(DispatchPermit {
            _release: Guard::with(release),
        })
    }

    pub fn in_flight(&self, handle: &SessionHandle) -> usize {
        lock(&handle.session).in_flight.load(Ordering::Acquire)
    }

    /// Issue a single-use token confirming the command with `fingerprint`.
    /// It never outlives the session's idle deadline.
    pub fn issue_token(&self, handle: &SessionHandle, fingerprint: &str) -> IssuedToken {
        let now = Instant::now();
        let ttl = Duration::from_secs(self.config.token_ttl_secs).min(self.config.idle_timeout());
        let token = generate_token();

        let mut session = lock(&handle.session);
        session.tokens.retain(|t| !t.is_expired(now));
        session.tokens.push(PendingConfirmation {
            digest: token_digest(&token),
            fingerprint: fingerprint.to_string(),
            expires_at: now + ttl,
        });
        debug!("Issued confirmation token in session {}", session.id);

        IssuedToken {
            token,
            expires_in: ttl,
        }
    }

    /// Spend a token. The token is removed under the session lock whether or
    /// not it matches, so it can never be redeemed twice.
    pub fn redeem(&self, handle: &SessionHandle, token: &str, fingerprint: &str) -> Result<(), GatewayError> {
        let now = Instant::now();
        let digest = token_digest(token);

        let mut session = lock(&handle.session);
        if session.id != handle.id {
            return Err(GatewayError::ConfirmationExpired {
                reason: "session expired".to_string(),
            });
        }

        let Some(pos) = session.tokens.iter().position(|t| t.digest == digest) else {
            return Err(GatewayError::ConfirmationExpired {
                reason: "unknown or already used token".to_string(),
            });
        };
        let pending = session.tokens.remove(pos);

        if pending.is_expired(now) {
            return Err(GatewayError::ConfirmationExpired {
                reason: "token expired".to_string(),
            });
        }
        if pending.fingerprint != fingerprint {
            return Err(GatewayError::ConfirmationExpired {
                reason: "token was issued for a different command".to_string(),
            });
        }
        Ok(())
    }

    pub fn outstanding_tokens(&self, handle: &SessionHandle) -> usize {
        lock(&handle.session).outstanding_tokens()
    }

    /// Drop idle sessions. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.idle_timeout();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !lock(session).is_idle(now, timeout));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!("Reaped {} idle session(s)", removed);
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn spawn_reaper(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.reap_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.reap();
            }
        })
    }
}
