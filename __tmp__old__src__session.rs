//! The unit of persistence: one PTY Device, a bounded replay buffer, a
//! single attachment slot, and the state machine from the specification.
//!
//! Concurrency model matches the PTY device's: a single mutex protects
//! `attachment`, `state`, `buffer`, and `last_activity`; long-running PTY I/O
//! happens outside the lock (the pumps call `append_output`/`snapshot_buffer`
//! only for the bookkeeping, never while awaiting PTY reads or writes).

use crate::buffer::RingBuffer;
use crate::error::SessionError;
use crate::pty::{PtyDevice, SpawnSpec};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Paused,
    Closing,
    Closed,
}

/// Opaque per-connection identity used to gate `attach`/`detach`. Each
/// Terminal Handler instance owns exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

impl PeerId {
    pub fn new() -> Self {
        PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    state: SessionState,
    attachment: Option<(PeerId, Arc<Notify>)>,
    buffer: RingBuffer,
    last_activity: Instant,
    resume_token: Option<String>,
}

/// One brokered PTY-backed child process, keyed externally by workspace key.
pub struct Session {
    id: String,
    key: String,
    pty: Arc<PtyDevice>,
    inner: Mutex<Inner>,
    child_grace: Duration,
}

impl Session {
    pub fn new(key: String, spec: &SpawnSpec, buffer_bytes: usize, child_grace: Duration) -> Result<Self, SessionError> {
        let pty = PtyDevice::spawn(spec)?;
        Ok(Session {
            id: Uuid::new_v4().to_string(),
            key,
            pty: Arc::new(pty),
            inner: Mutex::new(Inner {
                state: SessionState::Starting,
                attachment: None,
                buffer: RingBuffer::new(buffer_bytes),
                last_activity: Instant::now(),
                resume_token: spec.resume_token.clone(),
            }),
            child_grace,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pty(&self) -> &Arc<PtyDevice> {
        &self.pty
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.attachment.is_some()
    }

    /// Mark the session Running on first successful output (or immediately,
    /// if the caller already knows the child is ready).
    pub async fn mark_running(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Starting {
            inner.state = SessionState::Running;
        }
    }

    pub async fn mark_paused(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, SessionState::Running | SessionState::Starting) {
            inner.state = SessionState::Paused;
        }
    }

    pub async fn mark_resumed(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Paused {
            inner.state = SessionState::Running;
        }
    }

    /// Atomically transition `attachment: none -> peer`. Returns `Busy` if
    /// another peer already holds the slot. On success, returns the
    /// cancellation signal this peer's pumps should select on: it fires
    /// both when a sibling pump finishes (so the handler cancels its own
    /// pair) and when a later peer takes over this slot.
    pub async fn attach(&self, peer: PeerId) -> Result<Arc<Notify>, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.attachment.is_some() {
            return Err(SessionError::Busy);
        }
        let cancel = Arc::new(Notify::new());
        inner.attachment = Some((peer, cancel.clone()));
        Ok(cancel)
    }

    /// No-op unless `peer` currently holds the slot.
    pub async fn detach(&self, peer: PeerId) {
        let mut inner = self.inner.lock().await;
        if matches!(&inner.attachment, Some((p, _)) if *p == peer) {
            inner.attachment = None;
        }
    }

    /// Force the current attachment (if any) to release, regardless of
    /// identity, waking its pumps via the stored cancellation signal. Used
    /// by the takeover policy before a new peer retries `attach`.
    pub async fn force_detach(&self) {
        let mut inner = self.inner.lock().await;
        if let Some((_, cancel)) = inner.attachment.take() {
            cancel.notify_waiters();
        }
    }

    pub async fn current_peer(&self) -> Option<PeerId> {
        self.inner.lock().await.attachment.as_ref().map(|(p, _)| *p)
    }

    /// Record output bytes from the PTY: append to the replay buffer and
    /// bump `last_activity`. Called by the output pump only; never holds the
    /// lock across PTY I/O.
    pub async fn append_output(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.buffer.append(bytes);
        inner.last_activity = Instant::now();
    }

    /// Snapshot the replay buffer under the same lock that gates
    /// `append_output`, so the result is guaranteed to be a prefix of every
    /// byte the peer will subsequently observe.
    pub async fn snapshot_buffer(&self) -> Vec<u8> {
        self.inner.lock().await.buffer.snapshot()
    }

    pub async fn touch(&self) {
        self.inner.lock().await.last_activity = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_activity.elapsed()
    }

    pub async fn set_resume_token(&self, token: String) {
        let mut inner = self.inner.lock().await;
        inner.resume_token = Some(token);
        debug!(session_id = %self.id, "resume token recorded");
    }

    pub async fn resume_token(&self) -> Option<String> {
        self.inner.lock().await.resume_token.clone()
    }

    /// Idempotently begin closing: any state except `Closed` moves to
    /// `Closing`, terminates the child, then moves to `Closed`. Safe to call
    /// concurrently and repeatedly; only the first caller does the work.
    pub async fn request_close(&self, reason: &str) {
        {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            inner.state = SessionState::Closing;
        }

        info!(session_id = %self.id, reason, "closing session");
        self.pty.close(self.child_grace).await;

        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Closed;
        inner.attachment = None;
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
    async fn fresh_session_starts_in_starting_state() {
        let session = Session::new("ws-1".into(), &spec(), 1024, Duration::from_secs(1)).unwrap();
        assert_eq!(session.state().await, SessionState::Starting);
        session.request_close("test").await;
    }

    #[tokio::test]
    async fn attach_then_busy_then_detach_then_attach() {
        let session = Session::new("ws-1".into(), &spec(), 1024, Duration::from_secs(1)).unwrap();
        let a = PeerId::new();
        let b = PeerId::new();

        session.attach(a).await.unwrap();
        assert!(matches!(session.attach(b).await, Err(SessionError::Busy)));

        session.detach(a).await;
        assert!(session.current_peer().await.is_none());
        session.attach(b).await.unwrap();
        assert_eq!(session.current_peer().await, Some(b));
        session.request_close("test").await;
    }

    #[tokio::test]
    async fn detach_with_wrong_peer_is_noop() {
        let session = Session::new("ws-1".into(), &spec(), 1024, Duration::from_secs(1)).unwrap();
        let a = PeerId::new();
        let b = PeerId::new();
        session.attach(a).await.unwrap();
        session.detach(b).await;
        assert_eq!(session.current_peer().await, Some(a));
        session.request_close("test").await;
    }

    #[tokio::test]
    async fn append_then_snapshot_is_prefix_preserving() {
        let session = Session::new("ws-1".into(), &spec(), 1024, Duration::from_secs(1)).unwrap();
        session.append_output(b"abc").await;
        let s1 = session.snapshot_buffer().await;
        session.append_output(b"def").await;
        let s2 = session.snapshot_buffer().await;
        assert_eq!(s1, b"abc");
        assert_eq!(s2, b"abcdef");
        assert!(s2.starts_with(&s1));
        session.request_close("test").await;
    }

    #[tokio::test]
    async fn request_close_is_idempotent() {
        let session = Session::new("ws-1".into(), &spec(), 1024, Duration::from_secs(1)).unwrap();
        session.request_close("first").await;
        session.request_close("second").await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn pause_and_resume_transitions() {
        let session = Session::new("ws-1".into(), &spec(), 1024, Duration::from_secs(1)).unwrap();
        session.mark_running().await;
        assert_eq!(session.state().await, SessionState::Running);
        session.mark_paused().await;
        assert_eq!(session.state().await, SessionState::Paused);
        session.mark_resumed().await;
        assert_eq!(session.state().await, SessionState::Running);
        session.request_close("test").await;
    }
}


