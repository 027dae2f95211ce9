//! Typed error taxonomy for the terminal session subsystem.
//!
//! Each component gets its own `thiserror` enum; the Terminal Handler is the
//! only place that ever turns one of these into a wire `ErrorCode` (see
//! `protocol::ErrorCode`). Internal layers never serialize errors themselves.

use thiserror::Error;

/// Errors constructing or operating a PTY Device.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    #[error("pty closed")]
    PtyClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid resize dimensions: rows={rows} cols={cols}")]
    InvalidResize { rows: u16, cols: u16 },
}

/// Reasons the Input Validator rejects a chunk.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("input chunk exceeds the configured size cap")]
    Oversize,

    #[error("input chunk contains an unterminated escape sequence")]
    UnsafeEscape,
}

/// Session lifecycle errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already attached to another peer")]
    Busy,

    #[error("session not found for workspace key")]
    NotFound,

    #[error("session has already finished")]
    AlreadyFinished,

    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Wire-protocol parsing errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}
