//! Process-wide session registry keyed by workspace key.
//!
//! Grounded on the existing `ConnectionTracker`'s lock-free `DashMap` usage:
//! `get_or_create` takes a per-key entry lock so concurrent callers for the
//! same key serialize on construction rather than racing to spawn two
//! children, matching the single-flight requirement in the specification.
//! The background sweeper mirrors the periodic `tokio::spawn` + `interval`
//! pattern used for the existing metrics-flush background task.

use crate::error::SessionError;
use crate::pty::SpawnSpec;
use crate::session::Session;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Per-key construction lock plus the session slot itself. The lock is held
/// only while constructing or looking up; PTY I/O never happens under it.
struct Slot {
    session: Mutex<Option<Arc<Session>>>,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Slot>>,
    buffer_bytes: usize,
    child_grace: Duration,
}

impl SessionManager {
    pub fn new(buffer_bytes: usize, child_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            buffer_bytes,
            child_grace,
        })
    }

    /// Return the live Session for `key` if one exists and hasn't reached
    /// `Closed`, constructing one from `spec` otherwise. Concurrent callers
    /// for the same key serialize on the per-key slot lock.
    pub async fn get_or_create(
        self: &Arc<Self>,
        key: &str,
        spec: &SpawnSpec,
    ) -> Result<Arc<Session>, SessionError> {
        let slot = self
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    session: Mutex::new(None),
                })
            })
            .clone();

        let mut guard = slot.session.lock().await;
        if let Some(existing) = guard.as_ref() {
            use crate::session::SessionState;
            if !matches!(existing.state().await, SessionState::Closed) {
                return Ok(existing.clone());
            }
        }

        let session = Arc::new(Session::new(
            key.to_string(),
            spec,
            self.buffer_bytes,
            self.child_grace,
        )?);
        *guard = Some(session.clone());
        info!(session_id = %session.id(), key, "session created");
        Ok(session)
    }

    pub async fn lookup(&self, key: &str) -> Option<Arc<Session>> {
        let slot = self.sessions.get(key)?.clone();
        let guard = slot.session.lock().await;
        guard.clone()
    }

    /// Remove `key` from the registry. Invoked once a session reaches
    /// `Closed`.
    pub fn drop_session(&self, key: &str) {
        self.sessions.remove(key);
    }

    /// Spawn the background sweeper: every `sweep_interval`, close any
    /// detached session idle beyond `idle_timeout`. Attached sessions are
    /// never touched by the sweeper.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        sweep_interval: Duration,
        idle_timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                manager.sweep_once(idle_timeout).await;
            }
        })
    }

    async fn sweep_once(&self, idle_timeout: Duration) {
        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(session) = self.lookup(&key).await else {
                continue;
            };
            if session.is_attached().await {
                continue;
            }
            if session.idle_for().await > idle_timeout {
                warn!(session_id = %session.id(), key = %key, "idle sweep closing session");
                session.request_close("idle_timeout").await;
                self.drop_session(&key);
            }
        }
    }
}
