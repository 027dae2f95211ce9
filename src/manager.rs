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
use dashmap::mapref::entry::Entry;
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
        // The fast path (slot absent, or present and uncontended) claims the
        // slot's lock synchronously while `entry()`'s shard lock is still
        // held by its scrutinee temporary, so `prune_empty_slots` can never
        // observe the slot as empty-and-unlocked in the gap between this
        // call seeing it and actually locking it. The slow path (slot
        // present but its lock currently held by another in-flight caller)
        // releases the shard lock before the blocking wait instead of
        // holding it across the `.await` — otherwise an unrelated workspace
        // key hashing to the same shard would stall behind it. Since the
        // shard lock is released for that wait, the slot we waited on could
        // have been pruned (emptied, then removed) by the sweeper in the
        // meantime — a prune can only happen while the slot's own lock is
        // free, so we re-check the slot is still the one the map has for
        // `key` once we acquire it, retrying the whole attempt from scratch
        // if not. The retry loop means `slot`/`guard` are declared fresh
        // inside it and everything that uses `guard` runs before the next
        // iteration, rather than being threaded out of the loop: a `guard`
        // borrowed from `slot` can't be carried out alongside `slot` itself
        // without a move-while-borrowed conflict.
        loop {
            let slot: Arc<Slot>;
            let mut guard;
            match self.sessions.entry(key.to_string()) {
                Entry::Occupied(e) => {
                    slot = e.get().clone();
                    match slot.session.try_lock() {
                        Ok(g) => guard = g,
                        Err(_) => {
                            drop(e);
                            guard = slot.session.lock().await;
                            let still_current = self
                                .sessions
                                .get(key)
                                .map_or(false, |current| Arc::ptr_eq(&current, &slot));
                            if !still_current {
                                continue;
                            }
                        }
                    }
                }
                Entry::Vacant(e) => {
                    slot = Arc::new(Slot {
                        session: Mutex::new(None),
                    });
                    guard = slot
                        .session
                        .try_lock()
                        .expect("a brand new slot's mutex cannot already be contended");
                    e.insert(slot.clone());
                }
            }

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
            return Ok(session);
        }
    }

    pub async fn lookup(&self, key: &str) -> Option<Arc<Session>> {
        let slot = self.sessions.get(key)?.clone();
        let guard = slot.session.lock().await;
        guard.clone()
    }

    /// Clear the slot for `key`, but only if it still holds `session`, then
    /// try to remove the now-empty registry entry immediately. Invoked once
    /// a session reaches `Closed`. The identity check matters: without it, a
    /// slot that `get_or_create` has already replaced with a fresh session
    /// (because this one was seen `Closed`) could be wiped out from under
    /// the new session, orphaning its PTY.
    ///
    /// The removal is opportunistic, not the only line of defense:
    /// `prune_empty_slots` still runs on every sweep as a backstop. But a
    /// caller that never runs the sweeper (an embedding app driving its own
    /// server loop without `spawn_sweeper`) would otherwise leak one empty
    /// `Slot` per distinct workspace key ever used, for the life of the
    /// process.
    pub async fn drop_session(&self, key: &str, session: &Arc<Session>) {
        // Clone to an owned `Arc<Slot>` and drop the DashMap `Ref` before
        // awaiting the slot's own lock, same as `lookup` below — otherwise
        // an unrelated workspace key hashing to the same shard would stall
        // behind this wait.
        let Some(slot) = self.sessions.get(key).map(|r| r.clone()) else {
            return;
        };
        let mut guard = slot.session.lock().await;
        if matches!(guard.as_ref(), Some(current) if Arc::ptr_eq(current, session)) {
            *guard = None;
        }
        let emptied = guard.is_none();
        drop(guard);

        if emptied {
            // Re-resolve via `entry()` (not the `slot` we already have) so
            // the identity and emptiness checks happen under the shard
            // lock: if `get_or_create` installed a fresh session for this
            // key in the gap since we dropped `guard`, `try_lock` below
            // either fails (still contended) or succeeds with `Some`, and
            // either way the entry is left alone.
            if let Entry::Occupied(e) = self.sessions.entry(key.to_string()) {
                if Arc::ptr_eq(e.get(), &slot) {
                    if let Ok(g) = slot.session.try_lock() {
                        if g.is_none() {
                            drop(g);
                            e.remove();
                        }
                    }
                }
            }
        }
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

    /// Close every live session concurrently. Invoked on graceful shutdown
    /// so spawned children don't outlive the broker process. Closing
    /// one-at-a-time would make shutdown time scale with the number of live
    /// sessions (each close waits out `child_grace`); joining the closes
    /// instead bounds it to roughly one grace period regardless of count.
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let sessions: Vec<Arc<Session>> = futures::future::join_all(
            keys.iter().map(|key| self.lookup(key)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        futures::future::join_all(
            sessions
                .iter()
                .map(|session| session.request_close("server_shutdown")),
        )
        .await;
    }

    /// Repeat `close_all` until the registry's key set is unchanged between
    /// two consecutive sweeps, or `max_wait` elapses. A connection that read
    /// a "shutting down" flag as false moments before the caller set it can
    /// still be in the middle of `get_or_create` when the first sweep's
    /// snapshot is taken; a new key appearing on the next sweep means such a
    /// straggler just registered, so another sweep is needed to close it.
    pub async fn close_all_until_stable(&self, poll_interval: Duration, max_wait: Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut previous: Option<std::collections::HashSet<String>> = None;
        loop {
            self.close_all().await;
            let current: std::collections::HashSet<String> =
                self.sessions.iter().map(|e| e.key().clone()).collect();
            if previous.as_ref() == Some(&current) || tokio::time::Instant::now() >= deadline {
                break;
            }
            previous = Some(current);
            tokio::time::sleep(poll_interval).await;
        }
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
                self.drop_session(&key, &session).await;
            }
        }
        self.prune_empty_slots();
    }

    /// Drop registry entries for workspace keys with no session in them.
    /// `drop_session` only clears a slot's contents (to stay race-free
    /// against a concurrent `get_or_create`), so without this, every
    /// workspace key ever used would keep an empty `Slot` around forever.
    /// A slot currently locked by another in-flight call is left alone and
    /// retried on the next sweep rather than waited on.
    fn prune_empty_slots(&self) {
        self.sessions.retain(|_, slot| match slot.session.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> SpawnSpec {
        SpawnSpec::new("/bin/sh", PathBuf::from(std::env::temp_dir()))
    }

    #[tokio::test]
    async fn get_or_create_returns_same_session_for_same_key() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        let s1 = manager.get_or_create("ws", &spec()).await.unwrap();
        let s2 = manager.get_or_create("ws", &spec()).await.unwrap();
        assert_eq!(s1.id(), s2.id());
        s1.request_close("test").await;
    }

    #[tokio::test]
    async fn different_keys_get_different_sessions() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        let s1 = manager.get_or_create("ws-a", &spec()).await.unwrap();
        let s2 = manager.get_or_create("ws-b", &spec()).await.unwrap();
        assert_ne!(s1.id(), s2.id());
        s1.request_close("test").await;
        s2.request_close("test").await;
    }

    #[tokio::test]
    async fn lookup_returns_none_for_unknown_key() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        assert!(manager.lookup("nope").await.is_none());
    }

    #[tokio::test]
    async fn closed_session_is_replaced_by_get_or_create() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        let s1 = manager.get_or_create("ws", &spec()).await.unwrap();
        s1.request_close("test").await;

        let s2 = manager.get_or_create("ws", &spec()).await.unwrap();
        assert_ne!(s1.id(), s2.id());
        s2.request_close("test").await;
    }

    #[tokio::test]
    async fn sweeper_closes_only_idle_detached_sessions() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        let detached = manager.get_or_create("detached", &spec()).await.unwrap();
        let attached = manager.get_or_create("attached", &spec()).await.unwrap();

        let peer = crate::session::PeerId::new();
        attached.attach(peer).await.unwrap();

        manager.sweep_once(Duration::from_secs(0)).await;

        assert!(manager.lookup("detached").await.is_none());
        assert!(manager.lookup("attached").await.is_some());
        attached.request_close("test").await;
    }

    #[tokio::test]
    async fn sweeper_prunes_the_registry_entry_for_a_closed_idle_session() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        let session = manager.get_or_create("ws", &spec()).await.unwrap();
        manager.sweep_once(Duration::from_secs(0)).await;

        assert!(manager.lookup("ws").await.is_none());
        assert!(
            !manager.sessions.contains_key("ws"),
            "an empty slot must be removed from the registry, not just cleared"
        );
        drop(session);
    }

    #[tokio::test]
    async fn drop_session_removes_the_registry_entry_without_a_sweeper() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        let session = manager.get_or_create("ws", &spec()).await.unwrap();
        session.request_close("test").await;
        manager.drop_session("ws", &session).await;

        assert!(
            !manager.sessions.contains_key("ws"),
            "drop_session must remove the now-empty slot itself, not rely on a sweeper"
        );
    }

    #[tokio::test]
    async fn drop_session_does_not_remove_a_slot_a_concurrent_get_or_create_repopulated() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        let s1 = manager.get_or_create("ws", &spec()).await.unwrap();
        s1.request_close("test").await;

        // Simulate get_or_create already having replaced the closed session
        // by the time a stale drop_session(key, &s1) call runs.
        let s2 = manager.get_or_create("ws", &spec()).await.unwrap();
        manager.drop_session("ws", &s1).await;

        assert!(manager.sessions.contains_key("ws"));
        let looked_up = manager.lookup("ws").await.unwrap();
        assert_eq!(looked_up.id(), s2.id());
        s2.request_close("test").await;
    }

    #[tokio::test]
    async fn close_all_until_stable_closes_existing_sessions_and_returns_promptly() {
        let manager = SessionManager::new(1024, Duration::from_secs(1));
        let session = manager.get_or_create("ws", &spec()).await.unwrap();

        let start = std::time::Instant::now();
        manager
            .close_all_until_stable(Duration::from_millis(10), Duration::from_secs(2))
            .await;
        let elapsed = start.elapsed();

        assert_eq!(session.state().await, crate::session::SessionState::Closed);
        assert!(
            elapsed < Duration::from_secs(1),
            "a stable registry should return well before max_wait, took {:?}",
            elapsed
        );
    }
}
