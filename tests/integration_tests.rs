//! Integration tests for the dual-transport server
//!
//! These tests run real servers on loopback ports and talk to them the way
//! clients do: newline-delimited JSON over TCP, one JSON object per UDP
//! datagram.

use server::dispatch::{DispatcherState, GameLogic, Response, SessionControl};
use server::game::World;
use server::{LogicError, Server, ServerConfig, ServerError};
use shared::{tags, Envelope, SessionId};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

fn loopback_config() -> ServerConfig {
    ServerConfig {
        stream_addr: "127.0.0.1:0".parse().unwrap(),
        datagram_addr: "127.0.0.1:0".parse().unwrap(),
        tick_rate: 100,
        shutdown_timeout: Duration::from_secs(1),
        ..ServerConfig::default()
    }
}

async fn start_world(config: ServerConfig) -> Server<World> {
    let mut server = Server::new(config, World::with_seed(7));
    assert_ok!(server.start().await);
    server
}

/// Line-oriented TCP test client.
struct TcpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    session_id: SessionId,
}

impl TcpClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
            session_id: 0,
        };
        let welcome = client.recv().await.expect("no welcome");
        assert_eq!(welcome.tag(), tags::WELCOME);
        client.session_id = welcome.session_id().unwrap();
        client
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, envelope: Envelope) {
        self.send_raw(envelope.to_line().as_bytes()).await;
    }

    /// Next envelope, or `None` on EOF or after [`WAIT`].
    async fn recv(&mut self) -> Option<Envelope> {
        self.recv_within(WAIT).await
    }

    async fn recv_within(&mut self, limit: Duration) -> Option<Envelope> {
        let mut line = String::new();
        match timeout(limit, self.reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => Some(Envelope::parse(line.trim_end()).unwrap()),
            _ => None,
        }
    }

    async fn recv_tag(&mut self, tag: &str) -> Envelope {
        loop {
            let envelope = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("gave up waiting for `{tag}`"));
            if envelope.tag() == tag {
                return envelope;
            }
        }
    }

    async fn login(&mut self, username: &str) {
        self.send(
            Envelope::new("login")
                .with("username", username)
                .with("password", "pw"),
        )
        .await;
        self.recv_tag(tags::LOGIN_OK).await;
    }
}

struct UdpClient {
    socket: UdpSocket,
}

impl UdpClient {
    async fn bind(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server).await.unwrap();
        Self { socket }
    }

    async fn send(&self, envelope: Envelope) {
        self.socket
            .send(envelope.to_string().as_bytes())
            .await
            .unwrap();
    }

    async fn recv_within(&self, limit: Duration) -> Option<Envelope> {
        let mut buf = [0u8; 2048];
        match timeout(limit, self.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => Some(Envelope::from_slice(&buf[..len]).unwrap()),
            _ => None,
        }
    }

    async fn recv_tag(&self, tag: &str) -> Envelope {
        loop {
            let envelope = self
                .recv_within(WAIT)
                .await
                .unwrap_or_else(|| panic!("gave up waiting for `{tag}`"));
            if envelope.tag() == tag {
                return envelope;
            }
        }
    }
}

/// Game logic that records session closures and answers pings.
#[derive(Clone, Default)]
struct Recorder {
    closed: Arc<Mutex<Vec<SessionId>>>,
}

impl GameLogic for Recorder {
    fn handle(
        &mut self,
        _ctx: &mut SessionControl,
        envelope: &Envelope,
    ) -> Result<Vec<Response>, LogicError> {
        let session_id = envelope.session_id().ok_or(LogicError::UnknownSession(0))?;
        Ok(vec![Response::unicast(session_id, Envelope::new(tags::PONG))])
    }

    fn on_session_closed(&mut self, _ctx: &mut SessionControl, session_id: SessionId) -> Vec<Response> {
        self.closed.lock().unwrap().push(session_id);
        Vec::new()
    }

    fn periodic_update(&mut self, _ctx: &mut SessionControl) -> Vec<Response> {
        Vec::new()
    }
}

/// STREAM TRANSPORT TESTS
mod stream_tests {
    use super::*;

    #[tokio::test]
    async fn ping_gets_pong_on_same_session() {
        let mut server = start_world(loopback_config()).await;
        let mut client = TcpClient::connect(server.stream_addr().unwrap()).await;

        client
            .send_raw(b"{\"type\":\"ping\",\"timestamp\":1.0}\n")
            .await;
        let pong = client.recv_tag(tags::PONG).await;
        assert!(pong.timestamp().unwrap() > 1.0);

        server.stop().await;
    }

    #[tokio::test]
    async fn chat_broadcast_skips_sender() {
        let mut server = start_world(loopback_config()).await;
        let addr = server.stream_addr().unwrap();
        let mut alice = TcpClient::connect(addr).await;
        let mut bob = TcpClient::connect(addr).await;
        alice.login("alice").await;
        bob.login("bob").await;

        alice
            .send(Envelope::new("chat").with("text", "héllo"))
            .await;

        let chat = bob.recv_tag(tags::CHAT).await;
        assert_eq!(chat.get_str("text"), Some("héllo"));
        assert_eq!(chat.get_str("from"), Some("alice"));
        assert_eq!(chat.session_id(), Some(alice.session_id));
        assert!(alice.recv_within(QUIET).await.is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn message_split_across_writes_is_reassembled() {
        let mut server = start_world(loopback_config()).await;
        let mut client = TcpClient::connect(server.stream_addr().unwrap()).await;

        let line = b"{\"type\":\"ping\",\"timestamp\":1.0}\n";
        for chunk in line.chunks(3) {
            client.send_raw(chunk).await;
            sleep(Duration::from_millis(5)).await;
        }

        client.recv_tag(tags::PONG).await;
        assert!(client.recv_within(QUIET).await.is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn malformed_line_does_not_affect_neighbours() {
        let mut server = start_world(loopback_config()).await;
        let mut client = TcpClient::connect(server.stream_addr().unwrap()).await;

        client
            .send_raw(b"{\"type\":\"ping\"}\n{\"type\": oops\n\n{\"type\":\"ping\"}\n")
            .await;

        client.recv_tag(tags::PONG).await;
        client.recv_tag(tags::PONG).await;
        assert!(client.recv_within(QUIET).await.is_none());
        assert_eq!(server.registered_session_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn connection_over_capacity_is_closed() {
        let config = ServerConfig {
            max_stream_sessions: 1,
            ..loopback_config()
        };
        let mut server = start_world(config).await;
        let addr = server.stream_addr().unwrap();

        let _first = TcpClient::connect(addr).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let read = timeout(WAIT, reader.read_line(&mut line)).await.unwrap();

        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.registered_session_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn idle_session_is_closed_exactly_once() {
        let recorder = Recorder::default();
        let config = ServerConfig {
            stream_idle_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(20),
            ..loopback_config()
        };
        let mut server = Server::new(config, recorder.clone());
        assert_ok!(server.start().await);

        let mut client = TcpClient::connect(server.stream_addr().unwrap()).await;
        let session_id = client.session_id;

        // The sweep closes the socket; the client sees EOF.
        assert!(client.recv().await.is_none());
        sleep(Duration::from_millis(100)).await;
        server.stop().await;

        assert_eq!(*recorder.closed.lock().unwrap(), vec![session_id]);
    }
}

/// DATAGRAM TRANSPORT TESTS
mod datagram_tests {
    use super::*;

    #[tokio::test]
    async fn same_address_keeps_its_session() {
        let mut server = start_world(loopback_config()).await;
        let client = UdpClient::bind(server.datagram_addr().unwrap()).await;

        client.send(Envelope::new("ping")).await;
        let welcome = client.recv_tag(tags::WELCOME).await;
        client.recv_tag(tags::PONG).await;
        client.send(Envelope::new("ping")).await;
        client.recv_tag(tags::PONG).await;

        assert!(welcome.session_id().is_some());
        assert_eq!(server.registered_session_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn new_address_over_capacity_is_ignored() {
        let config = ServerConfig {
            max_datagram_sessions: 1,
            ..loopback_config()
        };
        let mut server = start_world(config).await;
        let addr = server.datagram_addr().unwrap();

        let first = UdpClient::bind(addr).await;
        first.send(Envelope::new("ping")).await;
        first.recv_tag(tags::PONG).await;

        let second = UdpClient::bind(addr).await;
        second.send(Envelope::new("ping")).await;
        assert!(second.recv_within(QUIET).await.is_none());
        assert_eq!(server.registered_session_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn chat_crosses_transports() {
        let mut server = start_world(loopback_config()).await;
        let mut tcp = TcpClient::connect(server.stream_addr().unwrap()).await;
        let udp = UdpClient::bind(server.datagram_addr().unwrap()).await;

        tcp.login("tcp-user").await;
        udp.send(
            Envelope::new("login")
                .with("username", "udp-user")
                .with("password", "pw"),
        )
        .await;
        udp.recv_tag(tags::LOGIN_OK).await;

        udp.send(Envelope::new("chat").with("text", "over udp")).await;
        let chat = tcp.recv_tag(tags::CHAT).await;
        assert_eq!(chat.get_str("from"), Some("udp-user"));

        tcp.send(Envelope::new("chat").with("text", "over tcp")).await;
        let chat = udp.recv_tag(tags::CHAT).await;
        assert_eq!(chat.get_str("text"), Some("over tcp"));

        server.stop().await;
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn stop_notifies_clients_and_is_idempotent() {
        let mut server = start_world(loopback_config()).await;
        let mut tcp = TcpClient::connect(server.stream_addr().unwrap()).await;
        let udp = UdpClient::bind(server.datagram_addr().unwrap()).await;
        udp.send(Envelope::new("heartbeat")).await;
        udp.recv_tag(tags::WELCOME).await;

        server.stop().await;
        server.stop().await;

        assert_eq!(tcp.recv().await.unwrap().tag(), tags::SERVER_SHUTDOWN);
        assert!(tcp.recv().await.is_none());
        assert_eq!(udp.recv_tag(tags::SERVER_SHUTDOWN).await.tag(), tags::SERVER_SHUTDOWN);

        assert_eq!(server.state(), DispatcherState::Stopped);
        assert_eq!(server.registered_session_count(), 0);
        assert!(matches!(server.start().await, Err(ServerError::Stopped)));
    }

    #[tokio::test]
    async fn occupied_port_fails_start() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            datagram_addr: taken.local_addr().unwrap(),
            ..loopback_config()
        };

        let mut server = Server::new(config, World::with_seed(1));
        let err = server.start().await.unwrap_err();

        assert!(matches!(err, ServerError::Bind { transport: "UDP", .. }));
        assert!(server.stream_addr().is_none());
        assert!(server.logic().is_some());
    }

    #[tokio::test]
    async fn dispatcher_keeps_its_tick_rate() {
        let config = ServerConfig {
            tick_rate: 50,
            ..loopback_config()
        };
        let mut server = start_world(config).await;
        sleep(Duration::from_millis(400)).await;
        server.stop().await;

        // 20 ticks expected; leave room for a slow scheduler.
        let ticks = server.stats().unwrap().ticks;
        assert!((10..=30).contains(&ticks), "ran {ticks} ticks");
    }

    #[tokio::test]
    async fn world_snapshots_follow_wall_clock() {
        let config = ServerConfig {
            world_update_interval: Duration::from_millis(100),
            ..loopback_config()
        };
        let mut server = start_world(config).await;
        let mut client = TcpClient::connect(server.stream_addr().unwrap()).await;

        client.login("walker").await;
        client
            .send(Envelope::new("select_character").with("name", "Wren"))
            .await;
        client.recv_tag(tags::CHARACTER_SELECTED).await;
        client
            .send(Envelope::new("move").with("x", 12.5).with("y", 40.0))
            .await;

        let snapshot = client.recv_tag(tags::WORLD_STATE).await;
        let players = snapshot.get("players").unwrap().as_array().unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0]["name"], "Wren");

        server.stop().await;
        assert_eq!(server.logic().unwrap().player_count(), 0);
    }
}
