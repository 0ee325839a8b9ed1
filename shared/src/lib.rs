//! Wire vocabulary shared by the server and its clients.
//!
//! Both transports carry the same unit: a JSON object with a string `type`
//! tag and a numeric `timestamp`. The stream transport frames one object per
//! `\n`-terminated line, the datagram transport sends one object per packet.

pub mod envelope;
pub mod framing;

pub use envelope::{Envelope, EnvelopeError};
pub use framing::{FrameError, LineFramer};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Process-unique session identifier assigned by the server.
pub type SessionId = u64;

/// Largest serialized envelope the datagram transport will put on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// Largest line the stream framer buffers before giving up on it.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Field names with meaning to the transport layer.
pub mod fields {
    pub const TYPE: &str = "type";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SESSION_ID: &str = "session_id";
    pub const CLIENT_ADDRESS: &str = "client_address";
}

/// Type tags the server emits.
pub mod tags {
    pub const WELCOME: &str = "welcome";
    pub const PONG: &str = "pong";
    pub const LOGIN_OK: &str = "login_ok";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const CHARACTER_SELECTED: &str = "character_selected";
    pub const PLAYER_JOINED: &str = "player_joined";
    pub const PLAYER_LEFT: &str = "player_left";
    pub const PLAYER_MOVED: &str = "player_moved";
    pub const CHAT: &str = "chat";
    pub const WORLD_STATE: &str = "world_state";
    pub const ERROR: &str = "error";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

/// Client message kinds, resolved once from the `type` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Login,
    SelectCharacter,
    Move,
    Chat,
    Ping,
    Heartbeat,
    Disconnect,
    Unknown(String),
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "login" => MessageKind::Login,
            "select_character" => MessageKind::SelectCharacter,
            "move" => MessageKind::Move,
            "chat" => MessageKind::Chat,
            "ping" => MessageKind::Ping,
            "heartbeat" => MessageKind::Heartbeat,
            "disconnect" => MessageKind::Disconnect,
            other => MessageKind::Unknown(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            MessageKind::Login => "login",
            MessageKind::SelectCharacter => "select_character",
            MessageKind::Move => "move",
            MessageKind::Chat => "chat",
            MessageKind::Ping => "ping",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Disconnect => "disconnect",
            MessageKind::Unknown(tag) => tag,
        }
    }
}

/// Seconds since the Unix epoch, with sub-second precision.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_known_tags() {
        let kinds = [
            MessageKind::Login,
            MessageKind::SelectCharacter,
            MessageKind::Move,
            MessageKind::Chat,
            MessageKind::Ping,
            MessageKind::Heartbeat,
            MessageKind::Disconnect,
        ];

        for kind in kinds {
            assert_eq!(MessageKind::from_tag(kind.tag()), kind);
        }
    }

    #[test]
    fn test_message_kind_unknown_fallthrough() {
        let kind = MessageKind::from_tag("teleport");
        assert_eq!(kind, MessageKind::Unknown("teleport".to_string()));
        assert_eq!(kind.tag(), "teleport");
    }

    #[test]
    fn test_message_kind_is_case_sensitive() {
        assert_eq!(
            MessageKind::from_tag("PING"),
            MessageKind::Unknown("PING".to_string())
        );
    }

    #[test]
    fn test_unix_timestamp_advances() {
        let first = unix_timestamp();
        std::thread::sleep(Duration::from_millis(2));
        let second = unix_timestamp();

        assert!(first > 1_600_000_000.0);
        assert!(second > first);
    }
}
