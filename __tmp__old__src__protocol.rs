//! Wire-level message schema exchanged with the browser client over the
//! WebSocket terminal endpoint.
//!
//! Every frame is a JSON object with a `type` discriminator. Parsing never
//! panics: an unrecognized or malformed frame becomes a `ProtocolError` the
//! Terminal Handler reports as `INVALID_MESSAGE` without closing the socket.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Signal kinds a client may ask to forward to the child's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    SIGINT,
    SIGTERM,
    EOF,
}

/// Messages the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
    Signal { signal: SignalKind },
}

impl ClientMessage {
    /// Parse a single text frame. Never panics; malformed JSON or an unknown
    /// `type` both become a `ProtocolError`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// The wire error codes named in the subsystem specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoSession,
    InvalidId,
    NotFound,
    AlreadyFinished,
    SessionError,
    SessionBusy,
    Validation,
    InvalidMessage,
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output {
        data: String,
    },
    Status {
        connected: bool,
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        checkpoint: Option<bool>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Closed {
        exit_code: Option<i32>,
    },
}

impl ServerMessage {
    /// Serialize to the JSON text frame sent over the WebSocket.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage serialization is infallible")
    }

    pub fn status(connected: bool, session_id: Option<String>) -> Self {
        ServerMessage::Status {
            connected,
            session_id,
            checkpoint: None,
        }
    }

    pub fn checkpoint_status(session_id: Option<String>) -> Self {
        ServerMessage::Status {
            connected: true,
            session_id,
            checkpoint: Some(true),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_message() {
        let msg = ClientMessage::parse(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Input {
                data: "ls\n".to_string()
            }
        );
    }

    #[test]
    fn parses_resize_message() {
        let msg = ClientMessage::parse(r#"{"type":"resize","rows":24,"cols":80}"#).unwrap();
        assert_eq!(msg, ClientMessage::Resize { rows: 24, cols: 80 });
    }

    #[test]
    fn parses_signal_message() {
        let msg = ClientMessage::parse(r#"{"type":"signal","signal":"SIGINT"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Signal {
                signal: SignalKind::SIGINT
            }
        );
    }

    #[test]
    fn rejects_unknown_type() {
        let err = ClientMessage::parse(r#"{"type":"frobnicate"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = ClientMessage::parse("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn server_message_round_trips_error_codes() {
        let msg = ServerMessage::error(ErrorCode::Validation, "oversize");
        let text = msg.to_text();
        assert!(text.contains("\"code\":\"VALIDATION\""));
    }

    #[test]
    fn status_omits_checkpoint_when_absent() {
        let msg = ServerMessage::status(true, Some("abc".to_string()));
        let text = msg.to_text();
        assert!(!text.contains("checkpoint"));
    }

    #[test]
    fn checkpoint_status_includes_flag() {
        let msg = ServerMessage::checkpoint_status(Some("abc".to_string()));
        let text = msg.to_text();
        assert!(text.contains("\"checkpoint\":true"));
    }
}


