//! The per-connection orchestrator: parses the wire protocol, runs the two
//! cooperating PTY<->WebSocket pump tasks, and drives attach/detach/replay.
//!
//! Structured-concurrency shape follows the existing WebSocket terminal
//! handler's `tokio::select!`-driven background task plus foreground receive
//! loop, generalized from "poll a TerminalSession on an interval" to "two
//! tasks, first-to-finish cancels the other", as the specification's design
//! notes require.

use crate::config::Config;
use crate::error::SessionError;
use crate::manager::SessionManager;
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage, SignalKind};
use crate::pty::{PtyDevice, Signal, SpawnSpec};
use crate::session::{PeerId, Session};
use crate::validator;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace, warn};

/// Detects application-level markers in the output stream, tolerant to a
/// marker being split across two reads by keeping a short lookback tail.
struct MarkerScanner {
    checkpoint_marker: Option<&'static str>,
    resume_marker_prefix: Option<&'static str>,
    tail: Vec<u8>,
}

const LOOKBACK: usize = 256;

impl MarkerScanner {
    fn new() -> Self {
        Self {
            checkpoint_marker: None,
            resume_marker_prefix: None,
            tail: Vec::new(),
        }
    }

    /// Scan `chunk` (with the saved tail prepended) for markers. Returns
    /// `(checkpoint_hit, resume_token)`.
    fn scan(&mut self, chunk: &[u8]) -> (bool, Option<String>) {
        let mut window = self.tail.clone();
        window.extend_from_slice(chunk);

        let mut checkpoint_hit = false;
        if let Some(marker) = self.checkpoint_marker {
            if contains(&window, marker.as_bytes()) {
                checkpoint_hit = true;
            }
        }

        let mut resume_token = None;
        if let Some(prefix) = self.resume_marker_prefix {
            if let Some(token) = extract_after(&window, prefix.as_bytes()) {
                resume_token = Some(token);
            }
        }

        let keep = window.len().min(LOOKBACK);
        self.tail = window[window.len() - keep..].to_vec();

        (checkpoint_hit, resume_token)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn extract_after(haystack: &[u8], prefix: &[u8]) -> Option<String> {
    let pos = haystack
        .windows(prefix.len())
        .position(|w| w == prefix)?;
    let rest = &haystack[pos + prefix.len()..];
    let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    let token = &rest[..end];
    if token.is_empty() {
        return None;
    }
    String::from_utf8(token.to_vec()).ok()
}

/// UTF-8 continuation buffer: carries partial multibyte sequences across PTY
/// read boundaries so the client never sees a split character.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut combined = std::mem::take(&mut self.pending);
        combined.extend_from_slice(chunk);

        match std::str::from_utf8(&combined) {
            Ok(s) => s.to_string(),
            Err(e) => {
                let valid_len = e.valid_up_to();
                let (valid, rest) = combined.split_at(valid_len);
                let text = String::from_utf8_lossy(valid).to_string();
                if rest.len() <= 4 && could_be_partial_utf8(rest) {
                    self.pending = rest.to_vec();
                    text
                } else {
                    // Not a trailing partial sequence; replace inline rather
                    // than buffering indefinitely.
                    format!("{}{}", text, String::from_utf8_lossy(rest))
                }
            }
        }
    }
}

fn could_be_partial_utf8(bytes: &[u8]) -> bool {
    matches!(bytes.first(), Some(b) if b & 0xC0 == 0xC0 || b & 0x80 != 0)
}

/// Everything the Terminal Handler needs from the embedding application: the
/// Session Manager plus a mapping from workspace key to spawn spec.
pub struct HandlerContext {
    pub manager: Arc<SessionManager>,
    pub config: Config,
    pub checkpoint_marker: Option<&'static str>,
    pub resume_marker_prefix: Option<&'static str>,
}

/// Run one WebSocket connection's full lifecycle against the workspace keyed
/// by `key`, spawning via `spec` if no live session exists yet.
pub async fn run(ctx: Arc<HandlerContext>, socket: WebSocket, key: String, spec: SpawnSpec) {
    let peer = PeerId::new();
    let (mut sender, mut receiver) = socket.split();

    if sender
        .send(Message::Text(ServerMessage::status(true, None).to_text()))
        .await
        .is_err()
    {
        return;
    }

    let deadline = Duration::from_secs(ctx.config.spawn_deadline_seconds);
    let session = match tokio::time::timeout(deadline, ctx.manager.get_or_create(&key, &spec)).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            error!(key = %key, error = %e, "session resolution failed");
            let _ = send_error(&mut sender, ErrorCode::SessionError, e.to_string()).await;
            let _ = close_with_code(&mut sender, 4000).await;
            return;
        }
        Err(_) => {
            error!(key = %key, "spawn deadline exceeded");
            let _ = send_error(&mut sender, ErrorCode::SessionError, "spawn deadline exceeded").await;
            let _ = close_with_code(&mut sender, 4000).await;
            return;
        }
    };

    let cancel = match attach_with_takeover(&session, peer).await {
        Ok(cancel) => cancel,
        Err(e) => {
            error!(session_id = %session.id(), error = %e, "attach failed after takeover retry");
            let _ = send_error(&mut sender, ErrorCode::SessionBusy, "session busy").await;
            let _ = close_with_code(&mut sender, 4000).await;
            return;
        }
    };
    session.mark_running().await;

    if sender
        .send(Message::Text(
            ServerMessage::status(true, Some(session.id().to_string())).to_text(),
        ))
        .await
        .is_err()
    {
        session.detach(peer).await;
        return;
    }

    let replay = session.snapshot_buffer().await;
    let replay_text = String::from_utf8_lossy(&replay).to_string();
    if sender
        .send(Message::Text(ServerMessage::Output { data: replay_text }.to_text()))
        .await
        .is_err()
    {
        session.detach(peer).await;
        return;
    }

    let sender = Arc::new(tokio::sync::Mutex::new(sender));

    let output_task = tokio::spawn(output_pump(
        ctx.clone(),
        session.clone(),
        sender.clone(),
        cancel.clone(),
    ));
    let input_task = tokio::spawn(input_pump(
        ctx.clone(),
        session.clone(),
        receiver,
        sender.clone(),
        cancel.clone(),
    ));

    let outcome = tokio::select! {
        r = output_task => r,
        r = input_task => r,
    };
    cancel.notify_waiters();

    match outcome {
        Ok(Outcome::PtyEof(exit_code)) => {
            let mut s = sender.lock().await;
            let _ = s.send(Message::Text(ServerMessage::Closed { exit_code }.to_text())).await;
            let _ = s.send(Message::Close(None)).await;
            drop(s);
            session.request_close("pty_eof").await;
            ctx.manager.drop_session(session.key());
        }
        Ok(Outcome::ClientDisconnected) => {
            session.detach(peer).await;
        }
        Ok(Outcome::Takeover) => {}
        Ok(Outcome::Error) | Err(_) => {
            session.detach(peer).await;
            let mut s = sender.lock().await;
            let _ = s.send(Message::Close(None)).await;
        }
    }
}

enum Outcome {
    PtyEof(Option<i32>),
    ClientDisconnected,
    Takeover,
    Error,
}

async fn attach_with_takeover(
    session: &Arc<Session>,
    peer: PeerId,
) -> Result<Arc<tokio::sync::Notify>, SessionError> {
    match session.attach(peer).await {
        Ok(cancel) => Ok(cancel),
        Err(SessionError::Busy) => {
            session.force_detach().await;
            session.attach(peer).await
        }
        Err(e) => Err(e),
    }
}

type WsSender = futures::stream::SplitSink<WebSocket, Message>;

async fn send_error(sender: &mut WsSender, code: ErrorCode, message: impl Into<String>) -> Result<(), axum::Error> {
    sender
        .send(Message::Text(ServerMessage::error(code, message).to_text()))
        .await
}

async fn close_with_code(sender: &mut WsSender, code: u16) -> Result<(), axum::Error> {
    sender
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: std::borrow::Cow::Borrowed(""),
        })))
        .await
}

/// PTY -> WS output pump: reads, appends to the replay buffer, forwards to
/// the client, and scans for checkpoint/resume markers.
async fn output_pump(
    ctx: Arc<HandlerContext>,
    session: Arc<Session>,
    sender: Arc<tokio::sync::Mutex<WsSender>>,
    cancel: Arc<tokio::sync::Notify>,
) -> Outcome {
    let pty = session.pty().clone();
    let mut scanner = MarkerScanner {
        checkpoint_marker: ctx.checkpoint_marker,
        resume_marker_prefix: ctx.resume_marker_prefix,
        tail: Vec::new(),
    };
    let mut carry = Utf8Carry::default();

    loop {
        let data = tokio::select! {
            _ = cancel.notified() => return Outcome::Takeover,
            read = pty.read() => match read {
                Ok(data) => data,
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "pty read error, treating as eof");
                    Vec::new()
                }
            },
        };

        if data.is_empty() {
            let exit_code = pty.wait().await.ok().flatten();
            return Outcome::PtyEof(exit_code);
        }

        session.append_output(&data).await;
        let (checkpoint, resume_token) = scanner.scan(&data);

        let text = carry.decode(&data);
        let mut s = sender.lock().await;
        if s.send(Message::Text(ServerMessage::Output { data: text }.to_text()))
            .await
            .is_err()
        {
            drop(s);
            return Outcome::ClientDisconnected;
        }

        if checkpoint {
            session.mark_paused().await;
            let _ = s
                .send(Message::Text(
                    ServerMessage::checkpoint_status(Some(session.id().to_string())).to_text(),
                ))
                .await;
        }
        drop(s);

        if let Some(token) = resume_token {
            session.set_resume_token(token).await;
        }
    }
}

/// WS -> PTY input pump: dispatches each message strictly in arrival order.
async fn input_pump(
    ctx: Arc<HandlerContext>,
    session: Arc<Session>,
    mut receiver: futures::stream::SplitStream<WebSocket>,
    sender: Arc<tokio::sync::Mutex<WsSender>>,
    cancel: Arc<tokio::sync::Notify>,
) -> Outcome {
    let pty = session.pty().clone();

    loop {
        let msg = tokio::select! {
            _ = cancel.notified() => return Outcome::Takeover,
            msg = receiver.next() => msg,
        };

        let Some(msg) = msg else {
            return Outcome::ClientDisconnected;
        };

        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "websocket receive error");
                return Outcome::ClientDisconnected;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(outcome) = dispatch(&ctx, &session, &pty, &text, &sender).await {
                    return outcome;
                }
            }
            Message::Close(_) => return Outcome::ClientDisconnected,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn dispatch(
    ctx: &HandlerContext,
    session: &Arc<Session>,
    pty: &Arc<PtyDevice>,
    text: &str,
    sender: &Arc<tokio::sync::Mutex<WsSender>>,
) -> Result<(), Outcome> {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            trace!(session_id = %session.id(), error = %e, "malformed client message");
            let mut s = sender.lock().await;
            let _ = s
                .send(Message::Text(
                    ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()).to_text(),
                ))
                .await;
            return Ok(());
        }
    };

    match msg {
        ClientMessage::Input { data } => {
            match validator::validate(data.as_bytes(), ctx.config.input_max_bytes) {
                Ok(()) => {
                    if pty.write(data.as_bytes()).await.is_err() {
                        return Err(Outcome::Error);
                    }
                }
                Err(e) => {
                    let mut s = sender.lock().await;
                    let _ = s
                        .send(Message::Text(
                            ServerMessage::error(ErrorCode::Validation, e.to_string()).to_text(),
                        ))
                        .await;
                }
            }
        }
        ClientMessage::Resize { rows, cols } => {
            if rows == 0
                || cols == 0
                || rows > ctx.config.resize_max_dim
                || cols > ctx.config.resize_max_dim
            {
                let mut s = sender.lock().await;
                let _ = s
                    .send(Message::Text(
                        ServerMessage::error(ErrorCode::Validation, "resize out of bounds").to_text(),
                    ))
                    .await;
            } else if let Err(e) = pty.resize(rows, cols).await {
                warn!(session_id = %session.id(), error = %e, "resize failed");
            }
        }
        ClientMessage::Signal { signal } => match signal {
            SignalKind::SIGINT => {
                let _ = pty.signal(Signal::Sigint);
            }
            SignalKind::SIGTERM => {
                let _ = pty.signal(Signal::Sigterm);
            }
            SignalKind::EOF => {
                if pty.write(&[0x04]).await.is_err() {
                    return Err(Outcome::Error);
                }
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_scanner_detects_split_checkpoint() {
        let mut scanner = MarkerScanner {
            checkpoint_marker: Some("PHASE_COMPLETE"),
            resume_marker_prefix: None,
            tail: Vec::new(),
        };
        let (hit1, _) = scanner.scan(b"...PHASE_COM");
        assert!(!hit1);
        let (hit2, _) = scanner.scan(b"PLETE...");
        assert!(hit2);
    }

    #[test]
    fn marker_scanner_extracts_resume_token_across_reads() {
        let mut scanner = MarkerScanner {
            checkpoint_marker: None,
            resume_marker_prefix: Some("RESUME_TOKEN="),
            tail: Vec::new(),
        };
        scanner.scan(b"...RESUME_TOK");
        let (_, token) = scanner.scan(b"EN=abc123\nmore output");
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn utf8_carry_buffers_split_multibyte_char() {
        let mut carry = Utf8Carry::default();
        let bytes = "héllo".as_bytes();
        let (first, second) = bytes.split_at(2); // splits inside 'é'
        let mut out = carry.decode(first);
        out.push_str(&carry.decode(second));
        assert_eq!(out, "héllo");
    }
}


