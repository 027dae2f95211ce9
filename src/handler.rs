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
    resume_marker: Option<&'static str>,
    resume_marker_prefix: Option<&'static str>,
    tail: Vec<u8>,
    /// Absolute stream offset of `tail[0]`, so a marker match's position can
    /// be compared across calls regardless of how much of the stream has
    /// scrolled out of the retained tail.
    bytes_before_tail: u64,
    /// Absolute end offset of the last firing for each marker, so the same
    /// occurrence lingering in the tail isn't re-fired, while a genuinely
    /// new occurrence starting after it still is.
    checkpoint_fired_until: Option<u64>,
    resume_fired_until: Option<u64>,
    /// Absolute end offset of the last *extracted* resume token, so the
    /// same token sitting in the tail across many reads doesn't keep
    /// re-triggering `Session::set_resume_token` (and its lock) on every
    /// single chunk for as long as it remains within the lookback window.
    resume_token_fired_until: Option<u64>,
}

const LOOKBACK: usize = 256;

impl MarkerScanner {
    /// Scan `chunk` (with the saved tail prepended) for markers. Returns
    /// `(checkpoint_end, resume_end, resume_token)`: each `_end` is the
    /// absolute stream offset just past the marker, if it fired on this
    /// call, so a caller handling both in the same call can tell which one
    /// actually occurred later in the byte stream and apply them in that
    /// order. `resume_end` fires on the literal resume marker,
    /// symmetrically with `checkpoint_end`; `resume_token` is the unrelated
    /// resume-*token* text extracted after `resume_marker_prefix`, used to
    /// resume a reconnecting peer rather than to unpause a live one.
    ///
    /// A marker fires only once per occurrence, tracked by absolute stream
    /// offset: each call searches only the part of the window at or after
    /// the end of the last occurrence that fired (taking the rightmost
    /// match in that span, so several fresh occurrences arriving in one
    /// chunk don't fire on each other's account), so a marker merely still
    /// sitting in the retained tail is not re-fired, but a second,
    /// genuinely new occurrence arriving within the same lookback window
    /// still is. `resume_token` follows the same rightmost-in-window rule,
    /// so a newer token emitted while an older one is still in the tail
    /// isn't shadowed by the stale one.
    fn scan(&mut self, chunk: &[u8]) -> (Option<u64>, Option<u64>, Option<String>) {
        let window_base = self.bytes_before_tail;
        let mut window = self.tail.clone();
        window.extend_from_slice(chunk);

        let mut checkpoint_end = None;
        if let Some(marker) = self.checkpoint_marker {
            let from = self
                .checkpoint_fired_until
                .map_or(0, |until| until.saturating_sub(window_base) as usize);
            if let Some(pos) = find_last(&window, marker.as_bytes(), from) {
                let end = window_base + pos as u64 + marker.len() as u64;
                checkpoint_end = Some(end);
                self.checkpoint_fired_until = Some(end);
            }
        }

        let mut resume_end = None;
        if let Some(marker) = self.resume_marker {
            let from = self
                .resume_fired_until
                .map_or(0, |until| until.saturating_sub(window_base) as usize);
            if let Some(pos) = find_last(&window, marker.as_bytes(), from) {
                let end = window_base + pos as u64 + marker.len() as u64;
                resume_end = Some(end);
                self.resume_fired_until = Some(end);
            }
        }

        let mut resume_token = None;
        if let Some(prefix) = self.resume_marker_prefix {
            let from = self
                .resume_token_fired_until
                .map_or(0, |until| until.saturating_sub(window_base) as usize);
            if let Some((token, end)) = extract_after_last(&window, prefix.as_bytes(), from) {
                resume_token = Some(token);
                self.resume_token_fired_until = Some(window_base + end as u64);
            }
        }

        let keep = window.len().min(LOOKBACK);
        self.bytes_before_tail = window_base + (window.len() - keep) as u64;
        self.tail = window[window.len() - keep..].to_vec();

        (checkpoint_end, resume_end, resume_token)
    }
}

/// Orders the checkpoint/resume application steps by which marker actually
/// occurred later in the byte stream, not a fixed checkpoint-then-resume
/// order: a single chunk can contain both, and the later one in the stream
/// must win so the session's final state matches reality. Each step is
/// `(is_checkpoint, fires)`; a caller skips steps where `fires` is false.
fn marker_apply_order(checkpoint_end: Option<u64>, resume_end: Option<u64>) -> [(bool, bool); 2] {
    let checkpoint_first = match (checkpoint_end, resume_end) {
        (Some(c), Some(r)) => c <= r,
        (Some(_), None) => true,
        _ => false,
    };
    if checkpoint_first {
        [(true, checkpoint_end.is_some()), (false, resume_end.is_some())]
    } else {
        [(false, resume_end.is_some()), (true, checkpoint_end.is_some())]
    }
}

/// Rightmost occurrence of `needle` in `haystack[from..]`, as an offset into
/// the full `haystack`.
fn find_last(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    let hay = &haystack[from..];
    if needle.is_empty() || needle.len() > hay.len() {
        return None;
    }
    hay.windows(needle.len()).rposition(|w| w == needle).map(|p| p + from)
}

/// Rightmost occurrence of `prefix` at or after `from`, so a fresher token
/// still within the lookback tail isn't shadowed by an older one earlier in
/// the window. Returns the token plus its absolute-in-`haystack` end offset
/// (just past the token, before any trailing newline), so a caller can
/// track the last-fired offset the same way marker matches do and skip
/// re-extracting the same occurrence on a later call.
fn extract_after_last(haystack: &[u8], prefix: &[u8], from: usize) -> Option<(String, usize)> {
    if from > haystack.len() || prefix.is_empty() || prefix.len() > haystack.len() - from {
        return None;
    }
    let pos = haystack[from..]
        .windows(prefix.len())
        .rposition(|w| w == prefix)?
        + from;
    let rest = &haystack[pos + prefix.len()..];
    let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    let token = &rest[..end];
    if token.is_empty() {
        return None;
    }
    let token = String::from_utf8(token.to_vec()).ok()?;
    Some((token, pos + prefix.len() + end))
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

        let mut out = String::new();
        let mut rest: &[u8] = &combined;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    return out;
                }
                Err(e) => {
                    let valid_len = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&rest[..valid_len]).unwrap());
                    match e.error_len() {
                        // The remaining bytes are a prefix of a valid sequence
                        // that simply hasn't arrived yet: carry them rather
                        // than replacing them.
                        None => {
                            self.pending = rest[valid_len..].to_vec();
                            return out;
                        }
                        // This run of bytes is invalid and will never become
                        // valid by appending more: replace it and keep
                        // scanning the remainder of this chunk, so a later
                        // genuinely-incomplete tail is still carried instead
                        // of being swept into the same lossy replacement.
                        Some(n) => {
                            out.push('\u{FFFD}');
                            rest = &rest[valid_len + n..];
                        }
                    }
                }
            }
        }
    }
}

/// Everything the Terminal Handler needs from the embedding application: the
/// Session Manager plus a mapping from workspace key to spawn spec.
pub struct HandlerContext {
    pub manager: Arc<SessionManager>,
    pub config: Config,
    /// Marks a pause point in the output stream (e.g. an interactive prompt
    /// awaiting input). Pairs with `resume_marker` below.
    pub checkpoint_marker: Option<&'static str>,
    /// Marks the output stream resuming after a checkpoint; moves the
    /// session back to `Running` symmetrically with `checkpoint_marker`.
    pub resume_marker: Option<&'static str>,
    /// Prefix preceding a resume *token* a reconnecting peer can present
    /// later; unrelated to `resume_marker` above.
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

    let (cancel_tx, cancel_rx) = match attach_with_takeover(&session, peer).await {
        Ok(pair) => pair,
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
        cancel_rx.clone(),
    ));
    let input_task = tokio::spawn(input_pump(
        ctx.clone(),
        session.clone(),
        receiver,
        sender.clone(),
        cancel_rx,
    ));

    let outcome = tokio::select! {
        r = output_task => r,
        r = input_task => r,
    };
    let _ = cancel_tx.send(true);

    match outcome {
        Ok(Outcome::PtyEof(exit_code)) => {
            let mut s = sender.lock().await;
            let _ = s.send(Message::Text(ServerMessage::Closed { exit_code }.to_text())).await;
            let _ = s.send(Message::Close(None)).await;
            drop(s);
            session.request_close("pty_eof").await;
            ctx.manager.drop_session(session.key(), &session).await;
        }
        Ok(Outcome::ClientDisconnected) => {
            session.detach(peer).await;
        }
        Ok(Outcome::Takeover) => {
            let mut s = sender.lock().await;
            let _ = close_with_code(&mut s, 4000).await;
        }
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
) -> Result<(tokio::sync::watch::Sender<bool>, tokio::sync::watch::Receiver<bool>), SessionError> {
    match session.attach(peer).await {
        Ok(pair) => Ok(pair),
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
    mut cancel: tokio::sync::watch::Receiver<bool>,
) -> Outcome {
    let pty = session.pty().clone();
    let mut scanner = MarkerScanner {
        checkpoint_marker: ctx.checkpoint_marker,
        resume_marker: ctx.resume_marker,
        resume_marker_prefix: ctx.resume_marker_prefix,
        tail: Vec::new(),
        bytes_before_tail: 0,
        checkpoint_fired_until: None,
        resume_fired_until: None,
        resume_token_fired_until: None,
    };
    let mut carry = Utf8Carry::default();

    loop {
        let data = tokio::select! {
            _ = cancel.changed() => return Outcome::Takeover,
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
        let (checkpoint_end, resume_end, resume_token) = scanner.scan(&data);

        let text = carry.decode(&data);
        let mut s = sender.lock().await;
        if s.send(Message::Text(ServerMessage::Output { data: text }.to_text()))
            .await
            .is_err()
        {
            drop(s);
            return Outcome::ClientDisconnected;
        }

        let steps = marker_apply_order(checkpoint_end, resume_end);

        // Only announce a transition to the client if it actually happened:
        // a checkpoint marker seen while already Paused (or a resume marker
        // seen while not Paused) is a no-op in `Session`, and reporting it
        // anyway would desync the client's checkpoint UI from the broker's
        // real state.
        async fn apply_checkpoint(session: &Session, s: &mut WsSender) {
            if !session.mark_paused().await {
                return;
            }
            let _ = s
                .send(Message::Text(
                    ServerMessage::checkpoint_status(Some(session.id().to_string())).to_text(),
                ))
                .await;
        }

        async fn apply_resume(session: &Session, s: &mut WsSender) {
            if !session.mark_resumed().await {
                return;
            }
            let _ = s
                .send(Message::Text(
                    ServerMessage::resume_status(Some(session.id().to_string())).to_text(),
                ))
                .await;
        }

        for (is_checkpoint, fires) in steps {
            if !fires {
                continue;
            }
            if is_checkpoint {
                apply_checkpoint(&session, &mut s).await;
            } else {
                apply_resume(&session, &mut s).await;
            }
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
    mut cancel: tokio::sync::watch::Receiver<bool>,
) -> Outcome {
    let pty = session.pty().clone();

    loop {
        let msg = tokio::select! {
            _ = cancel.changed() => return Outcome::Takeover,
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
            resume_marker: None,
            resume_marker_prefix: None,
            tail: Vec::new(),
            bytes_before_tail: 0,
            checkpoint_fired_until: None,
            resume_fired_until: None,
            resume_token_fired_until: None,
        };
        let (hit1, _, _) = scanner.scan(b"...PHASE_COM");
        assert!(hit1.is_none());
        let (hit2, _, _) = scanner.scan(b"PLETE...");
        assert!(hit2.is_some());
    }

    #[test]
    fn marker_scanner_detects_split_resume_marker() {
        let mut scanner = MarkerScanner {
            checkpoint_marker: None,
            resume_marker: Some("PHASE_RESUME"),
            resume_marker_prefix: None,
            tail: Vec::new(),
            bytes_before_tail: 0,
            checkpoint_fired_until: None,
            resume_fired_until: None,
            resume_token_fired_until: None,
        };
        let (_, hit1, _) = scanner.scan(b"...PHASE_RES");
        assert!(hit1.is_none());
        let (_, hit2, _) = scanner.scan(b"UME...");
        assert!(hit2.is_some());
    }

    #[test]
    fn marker_scanner_does_not_refire_for_a_second_copy_already_seen_in_one_scan() {
        let mut scanner = MarkerScanner {
            checkpoint_marker: Some("PHASE_COMPLETE"),
            resume_marker: None,
            resume_marker_prefix: None,
            tail: Vec::new(),
            bytes_before_tail: 0,
            checkpoint_fired_until: None,
            resume_fired_until: None,
            resume_token_fired_until: None,
        };
        let (hit1, _, _) = scanner.scan(b"PHASE_COMPLETE...PHASE_COMPLETE");
        assert!(hit1.is_some(), "first occurrence in the window should fire");

        let (hit2, _, _) = scanner.scan(b"...more output");
        assert!(
            hit2.is_none(),
            "the second occurrence already seen in the prior scan must not re-fire"
        );
    }

    #[test]
    fn marker_scanner_fires_again_for_a_genuinely_new_occurrence_in_the_tail() {
        let mut scanner = MarkerScanner {
            checkpoint_marker: Some("PHASE_COMPLETE"),
            resume_marker: None,
            resume_marker_prefix: None,
            tail: Vec::new(),
            bytes_before_tail: 0,
            checkpoint_fired_until: None,
            resume_fired_until: None,
            resume_token_fired_until: None,
        };
        let (hit1, _, _) = scanner.scan(b"PHASE_COMPLETE");
        assert!(hit1.is_some());

        let (hit2, _, _) = scanner.scan(b"...PHASE_COMPLETE");
        assert!(
            hit2.is_some(),
            "a second, later occurrence must still fire even though the first \
             is still within the retained tail"
        );
    }

    #[test]
    fn marker_scanner_extracts_resume_token_across_reads() {
        let mut scanner = MarkerScanner {
            checkpoint_marker: None,
            resume_marker: None,
            resume_marker_prefix: Some("RESUME_TOKEN="),
            tail: Vec::new(),
            bytes_before_tail: 0,
            checkpoint_fired_until: None,
            resume_fired_until: None,
            resume_token_fired_until: None,
        };
        scanner.scan(b"...RESUME_TOK");
        let (_, _, token) = scanner.scan(b"EN=abc123\nmore output");
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn marker_scanner_extracts_the_newest_resume_token_still_in_the_tail() {
        let mut scanner = MarkerScanner {
            checkpoint_marker: None,
            resume_marker: None,
            resume_marker_prefix: Some("RESUME_TOKEN="),
            tail: Vec::new(),
            bytes_before_tail: 0,
            checkpoint_fired_until: None,
            resume_fired_until: None,
            resume_token_fired_until: None,
        };
        let (_, _, token) =
            scanner.scan(b"RESUME_TOKEN=abc\nsome output\nRESUME_TOKEN=xyz\nmore output");
        assert_eq!(
            token.as_deref(),
            Some("xyz"),
            "a newer token in the same window must win over a stale one still in the tail"
        );
    }

    #[test]
    fn marker_apply_order_applies_resume_before_checkpoint_when_resume_occurs_first() {
        let steps = marker_apply_order(Some(40), Some(10));
        assert_eq!(steps, [(false, true), (true, true)]);
    }

    #[test]
    fn marker_apply_order_applies_checkpoint_before_resume_when_checkpoint_occurs_first() {
        let steps = marker_apply_order(Some(10), Some(40));
        assert_eq!(steps, [(true, true), (false, true)]);
    }

    #[test]
    fn marker_apply_order_skips_the_marker_that_did_not_fire() {
        assert_eq!(
            marker_apply_order(Some(10), None),
            [(true, true), (false, false)]
        );
        assert_eq!(
            marker_apply_order(None, Some(10)),
            [(false, true), (true, false)]
        );
        assert_eq!(marker_apply_order(None, None), [(false, false), (true, false)]);
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

    #[test]
    fn utf8_carry_replaces_genuinely_invalid_byte_immediately() {
        let mut carry = Utf8Carry::default();
        let out = carry.decode(&[b'a', 0xff, b'b']);
        assert_eq!(out, "a\u{FFFD}b");
        assert!(carry.pending.is_empty(), "an invalid byte must not be buffered as if partial");
    }

    #[test]
    fn utf8_carry_buffers_a_trailing_split_char_after_an_earlier_invalid_byte() {
        let mut carry = Utf8Carry::default();
        // 0xff is invalid on its own; 0xe2 0x82 are the first two bytes of
        // '€' (0xe2 0x82 0xac), split across this chunk and the next.
        let out = carry.decode(&[b'a', 0xff, 0xe2, 0x82]);
        assert_eq!(out, "a\u{FFFD}");
        assert_eq!(
            carry.pending,
            vec![0xe2, 0x82],
            "the truncated trailing sequence must be carried, not also replaced"
        );
        let out = carry.decode(&[0xac, b'b']);
        assert_eq!(out, "\u{20ac}b");
    }
}
