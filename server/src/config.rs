//! Runtime configuration for a [`crate::server::Server`].

use std::net::SocketAddr;
use std::time::Duration;

/// Everything the server needs to bind, pace and police its sessions.
///
/// The binary fills this from command-line flags; tests build it directly,
/// usually with port 0 and short timeouts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub stream_addr: SocketAddr,
    pub datagram_addr: SocketAddr,
    /// Dispatcher cycles per second.
    pub tick_rate: u32,
    /// Wall-clock interval between `GameLogic::periodic_update` calls.
    pub world_update_interval: Duration,
    pub max_stream_sessions: usize,
    pub max_datagram_sessions: usize,
    pub stream_idle_timeout: Duration,
    /// Longer than the stream timeout: datagram peers only prove liveness
    /// through their own heartbeats.
    pub datagram_idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Upper bound on a single line write before the session is flagged.
    pub write_timeout: Duration,
    /// Outbound lines a TCP session may have queued before it is flagged.
    pub stream_queue_limit: usize,
    /// Total budget for joining worker tasks during shutdown.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            datagram_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            tick_rate: 20,
            world_update_interval: Duration::from_secs(1),
            max_stream_sessions: 64,
            max_datagram_sessions: 64,
            stream_idle_timeout: Duration::from_secs(30),
            datagram_idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(2),
            stream_queue_limit: 256,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}
