//! UDP transport binding
//!
//! One socket serves every peer. A peer's session is keyed by its source
//! address and exists from its first valid envelope until it disconnects or
//! goes quiet for longer than the idle timeout.
//!
//! Outgoing envelopes are queued and written by a single sender task, so
//! callers (the dispatcher included) never wait on the socket.

use crate::dispatch::Transport;
use crate::mailbox::{inbound_message, InboundEvent, Inbox, TransportKind};
use crate::session::{SessionIds, SessionRegistry};
use log::{debug, info, warn};
use shared::{fields, tags, Envelope, MessageKind, SessionId, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone)]
pub struct DatagramSettings {
    pub capacity: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug)]
enum Outgoing {
    Datagram { dest: SocketAddr, envelope: Envelope },
    /// Sent after everything else; the sender task exits on it.
    Close,
}

pub struct DatagramBinding {
    socket: Arc<UdpSocket>,
    registry: SessionRegistry<SocketAddr>,
    inbox: Inbox,
    settings: DatagramSettings,
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outgoing>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
}

impl DatagramBinding {
    pub async fn bind(
        addr: SocketAddr,
        settings: DatagramSettings,
        ids: SessionIds,
        inbox: Inbox,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport listening on {}", local_addr);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            registry: SessionRegistry::new(settings.capacity, ids),
            inbox,
            settings,
            local_addr,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the receive loop, the sender and the liveness sweep.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(
            Arc::clone(self).receive_loop(shutdown.clone()),
        )];

        let outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(outbound_rx) = outbound_rx {
            handles.push(tokio::spawn(Arc::clone(self).send_loop(outbound_rx)));
        }

        handles.push(tokio::spawn(Arc::clone(self).sweep_loop(shutdown)));
        handles
    }

    async fn receive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, remote)) => self.on_datagram(&buffer[..len], remote),
                    Err(e) => {
                        // ICMP port-unreachable from a departed peer surfaces here
                        // on some platforms; the socket itself is still fine.
                        debug!("UDP receive error: {}", e);
                    }
                },
            }
        }
        info!("UDP receive loop on {} stopped", self.local_addr);
    }

    fn on_datagram(&self, payload: &[u8], remote: SocketAddr) {
        let envelope = match Envelope::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", remote, e);
                return;
            }
        };
        let kind = envelope.kind();

        let session_id = match self.registry.find_by_addr(remote) {
            Some(id) => id,
            None if kind == MessageKind::Disconnect => {
                debug!("Ignoring disconnect from unknown peer {}", remote);
                return;
            }
            None => match self.registry.create(remote, remote) {
                Some(id) => {
                    self.greet(id, remote);
                    id
                }
                None => {
                    debug!("Ignoring datagram from {}: server full", remote);
                    return;
                }
            },
        };

        if kind == MessageKind::Disconnect {
            self.destroy(session_id, "client requested disconnect");
            return;
        }

        self.deliver(session_id, remote, envelope);
    }

    /// Queues a message for a live session. Returns false, queueing nothing,
    /// when the session was destroyed after it was looked up.
    fn deliver(&self, session_id: SessionId, remote: SocketAddr, envelope: Envelope) -> bool {
        if !self.registry.touch(session_id) {
            debug!("Dropping datagram for closed session {}", session_id);
            return false;
        }
        self.inbox.push(inbound_message(envelope, session_id, remote));
        true
    }

    fn greet(&self, session_id: SessionId, remote: SocketAddr) {
        self.inbox.push(InboundEvent::ClientConnected {
            session_id,
            transport: TransportKind::Datagram,
            remote,
        });
        let welcome = Envelope::new(tags::WELCOME).with(fields::SESSION_ID, session_id);
        self.enqueue(remote, welcome);
    }

    fn enqueue(&self, dest: SocketAddr, envelope: Envelope) -> bool {
        self.outbound
            .send(Outgoing::Datagram { dest, envelope })
            .is_ok()
    }

    async fn send_loop(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Outgoing>) {
        while let Some(item) = outbound.recv().await {
            let Outgoing::Datagram { dest, mut envelope } = item else {
                break;
            };

            envelope.stamp();
            let payload = envelope.to_string();
            if payload.len() > MAX_DATAGRAM_SIZE {
                warn!(
                    "Dropping `{}` for {}: {} bytes exceeds the {} byte limit",
                    envelope.tag(),
                    dest,
                    payload.len(),
                    MAX_DATAGRAM_SIZE
                );
                continue;
            }

            if let Err(e) = self.socket.send_to(payload.as_bytes(), dest).await {
                warn!("UDP send to {} failed: {}", dest, e);
            }
        }
        debug!("UDP sender on {} stopped", self.local_addr);
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    pub fn sweep(&self) -> usize {
        let expired = self.registry.sweep(self.settings.idle_timeout);
        for session in &expired {
            self.inbox.push(InboundEvent::ClientDisconnected {
                session_id: session.id,
                transport: TransportKind::Datagram,
            });
        }
        expired.len()
    }

    pub fn destroy(&self, session_id: SessionId, reason: &str) -> bool {
        let Some(session) = self.registry.evict(session_id) else {
            return false;
        };
        debug!("Destroying UDP session {} ({}): {}", session_id, session.remote, reason);
        self.inbox.push(InboundEvent::ClientDisconnected {
            session_id,
            transport: TransportKind::Datagram,
        });
        true
    }

    /// Queues `farewell` to every peer, forgets all sessions and releases
    /// the sender once the queue is flushed.
    pub fn shutdown(&self, farewell: Option<&Envelope>) -> usize {
        let sessions = self.registry.drain();
        for session in &sessions {
            if let Some(farewell) = farewell {
                self.enqueue(session.remote, farewell.clone());
            }
            self.inbox.push(InboundEvent::ClientDisconnected {
                session_id: session.id,
                transport: TransportKind::Datagram,
            });
        }
        let _ = self.outbound.send(Outgoing::Close);
        sessions.len()
    }

    pub fn registry(&self) -> &SessionRegistry<SocketAddr> {
        &self.registry
    }
}

impl Transport for DatagramBinding {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn owns(&self, session_id: SessionId) -> bool {
        self.registry.contains(session_id)
    }

    fn send(&self, session_id: SessionId, envelope: &Envelope) -> bool {
        match self.registry.remote(session_id) {
            Some(dest) => self.enqueue(dest, envelope.clone()),
            None => false,
        }
    }

    fn broadcast(&self, envelope: &Envelope, exclude: Option<SessionId>) -> usize {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|(session_id, _)| Some(*session_id) != exclude)
            .filter(|(_, dest)| self.enqueue(*dest, envelope.clone()))
            .count()
    }

    fn session_count(&self) -> usize {
        self.registry.len()
    }

    fn set_authenticated(&self, session_id: SessionId, authenticated: bool) -> bool {
        self.registry.set_authenticated(session_id, authenticated)
    }

    fn disconnect(&self, session_id: SessionId) -> bool {
        self.destroy(session_id, "closed by game logic")
    }
}
