//! Error types surfaced by the server library.

use std::net::SocketAddr;

/// Failures reported from [`crate::server::Server::start`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {transport} socket on {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server is already running")]
    AlreadyStarted,
    #[error("server has been stopped and cannot be restarted")]
    Stopped,
}

/// Failure raised by game logic while handling a single message.
///
/// The dispatcher logs it and moves on to the next queued entry.
#[derive(Debug, thiserror::Error)]
pub enum LogicError {
    #[error("message `{tag}` is missing field `{field}`")]
    MissingField { tag: String, field: &'static str },
    #[error("message from unknown session {0}")]
    UnknownSession(u64),
    #[error("{0}")]
    Rejected(String),
}
