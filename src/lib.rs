//! termbroker - a PTY-backed terminal session broker served over WebSocket.
//!
//! Multiplexes interactive child processes (shells, REPLs, long-running
//! tools) behind a small set of session keys, replaying recent output to
//! reconnecting clients and forwarding signals and resizes to the real
//! process group.

pub mod buffer;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod session;
pub mod validator;

pub use config::Config;
pub use error::{PtyError, ProtocolError, SessionError, ValidationError};
pub use manager::SessionManager;
pub use pty::{PtyDevice, Signal, SpawnSpec};
pub use server::{build_router, run_server, FixedSpawnResolver, ServerState, SpawnResolver};
pub use session::{PeerId, Session, SessionState};
