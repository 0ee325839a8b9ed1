//! TCP transport binding
//!
//! Each accepted connection becomes a session with two tasks:
//! - a **reader** that feeds raw bytes through a [`LineFramer`] and pushes
//!   every parsed envelope into the inbound mailbox,
//! - a **writer** that owns the socket's write half and drains the session's
//!   outbound queue one line at a time, so writes never interleave.
//!
//! Sessions leave through one path, [`StreamBinding::destroy`], whether the
//! peer hung up, asked to disconnect, failed a write, or went idle.

use crate::dispatch::Transport;
use crate::mailbox::{inbound_message, InboundEvent, Inbox, TransportKind};
use crate::session::{SessionIds, SessionRegistry};
use log::{debug, info, warn};
use shared::{fields, tags, Envelope, LineFramer, MessageKind, SessionId};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const READ_BUFFER_SIZE: usize = 4096;

/// Tunables for the TCP binding.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub capacity: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub write_timeout: Duration,
    /// Lines a session may have waiting before it is flagged for eviction.
    pub queue_limit: usize,
}

/// Items on a session's outbound queue.
#[derive(Debug)]
enum Outgoing {
    Line(Arc<str>),
    /// Flush what is queued, then shut the write half.
    Close,
}

/// Handle used to reach one TCP session.
#[derive(Debug, Clone)]
pub struct StreamLink {
    outbound: mpsc::Sender<Outgoing>,
    hangup: Arc<Notify>,
}

impl StreamLink {
    /// Returns false when the queue is full or the writer is gone.
    fn push(&self, line: Arc<str>) -> bool {
        self.outbound.try_send(Outgoing::Line(line)).is_ok()
    }

    /// Queues a close behind any pending lines and stops the reader.
    /// On a full queue the writer ends once every link is dropped.
    fn close(&self) {
        let _ = self.outbound.try_send(Outgoing::Close);
        self.hangup.notify_one();
    }
}

pub struct StreamBinding {
    registry: SessionRegistry<StreamLink>,
    inbox: Inbox,
    settings: StreamSettings,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamBinding {
    /// Binds the listening socket. Nothing runs until [`Self::spawn`].
    pub async fn bind(
        addr: SocketAddr,
        settings: StreamSettings,
        ids: SessionIds,
        inbox: Inbox,
    ) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("TCP transport listening on {}", local_addr);

        Ok(Arc::new(Self {
            registry: SessionRegistry::new(settings.capacity, ids),
            inbox,
            settings,
            local_addr,
            listener: Mutex::new(Some(listener)),
            connections: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the accept loop and the liveness sweep.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            handles.push(tokio::spawn(
                Arc::clone(self).accept_loop(listener, shutdown.clone()),
            ));
        }
        handles.push(tokio::spawn(Arc::clone(self).sweep_loop(shutdown)));

        handles
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((_, remote)) if *shutdown.borrow() => {
                        debug!("Dropping TCP connection from {}: shutting down", remote);
                    }
                    Ok((stream, remote)) => self.admit(stream, remote),
                    Err(e) => {
                        warn!("TCP accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
        info!("TCP accept loop on {} stopped", self.local_addr);
    }

    /// Registers a new connection, or drops it when the registry is full
    /// or already drained for shutdown.
    fn admit(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let (tx, rx) = mpsc::channel(self.settings.queue_limit.max(1));
        let hangup = Arc::new(Notify::new());
        let link = StreamLink {
            outbound: tx,
            hangup: Arc::clone(&hangup),
        };

        let Some(session_id) = self.registry.create(remote, link.clone()) else {
            if self.registry.is_closed() {
                debug!("Refusing TCP connection from {}: shutting down", remote);
            } else {
                warn!("Refusing TCP connection from {}: server full", remote);
            }
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", remote, e);
        }
        let (reader, writer) = stream.into_split();

        let welcome = Envelope::new(tags::WELCOME).with(fields::SESSION_ID, session_id);
        link.push(Arc::from(welcome.to_line()));

        // Queued before either task can push a message or a disconnect.
        self.inbox.push(InboundEvent::ClientConnected {
            session_id,
            transport: TransportKind::Stream,
            remote,
        });

        let writer_task = tokio::spawn(Arc::clone(self).write_loop(session_id, writer, rx));
        let reader_task = tokio::spawn(Arc::clone(self).read_loop(session_id, remote, reader, hangup));

        {
            let mut connections = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            connections.retain(|handle| !handle.is_finished());
            connections.push(writer_task);
            connections.push(reader_task);
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        session_id: SessionId,
        remote: SocketAddr,
        mut reader: OwnedReadHalf,
        hangup: Arc<Notify>,
    ) {
        let mut framer = LineFramer::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = hangup.notified() => break,
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => {
                        self.destroy(session_id, "peer closed the connection");
                        break;
                    }
                    Ok(n) => {
                        framer.push(&buffer[..n]);
                        if !self.drain_lines(session_id, remote, &mut framer) {
                            break;
                        }
                    }
                    Err(e) => {
                        self.destroy(session_id, &format!("read error: {e}"));
                        break;
                    }
                },
            }
        }
        debug!("Reader for session {} finished", session_id);
    }

    /// Parses every complete line in the framer. Returns false once the
    /// session is gone and reading should stop.
    fn drain_lines(&self, session_id: SessionId, remote: SocketAddr, framer: &mut LineFramer) -> bool {
        while let Some(line) = framer.next_line() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Discarding input from session {}: {}", session_id, e);
                    continue;
                }
            };

            let envelope = match Envelope::parse(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping malformed line from session {}: {}", session_id, e);
                    continue;
                }
            };

            if envelope.kind() == MessageKind::Disconnect {
                self.destroy(session_id, "client requested disconnect");
                return false;
            }
            if !self.registry.touch(session_id) {
                return false;
            }
            self.inbox.push(inbound_message(envelope, session_id, remote));
        }
        true
    }

    async fn write_loop(
        self: Arc<Self>,
        session_id: SessionId,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Outgoing>,
    ) {
        while let Some(item) = outbound.recv().await {
            let Outgoing::Line(line) = item else {
                break;
            };

            let write = writer.write_all(line.as_bytes());
            match tokio::time::timeout(self.settings.write_timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Write to session {} failed: {}", session_id, e);
                    self.registry.mark_for_eviction(session_id);
                    break;
                }
                Err(_) => {
                    warn!(
                        "Write to session {} timed out after {:?}",
                        session_id, self.settings.write_timeout
                    );
                    self.registry.mark_for_eviction(session_id);
                    break;
                }
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of session {} socket failed: {}", session_id, e);
        }
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

    /// Evicts idle and flagged sessions. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let expired = self.registry.sweep(self.settings.idle_timeout);
        let count = expired.len();
        for session in expired {
            session.link.close();
            self.inbox.push(InboundEvent::ClientDisconnected {
                session_id: session.id,
                transport: TransportKind::Stream,
            });
        }
        count
    }

    /// The single teardown path for a session. Only the caller that actually
    /// removes the session raises the disconnect event.
    pub fn destroy(&self, session_id: SessionId, reason: &str) -> bool {
        let Some(session) = self.registry.evict(session_id) else {
            return false;
        };
        debug!("Destroying TCP session {}: {}", session_id, reason);
        session.link.close();
        self.inbox.push(InboundEvent::ClientDisconnected {
            session_id,
            transport: TransportKind::Stream,
        });
        true
    }

    /// Queues `farewell` for every session, then closes them all.
    pub fn shutdown(&self, farewell: Option<&Envelope>) -> usize {
        let line = farewell.map(|envelope| {
            let mut envelope = envelope.clone();
            envelope.stamp();
            Arc::<str>::from(envelope.to_line())
        });

        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            if let Some(line) = &line {
                session.link.push(Arc::clone(line));
            }
            session.link.close();
            self.inbox.push(InboundEvent::ClientDisconnected {
                session_id: session.id,
                transport: TransportKind::Stream,
            });
        }
        count
    }

    /// Hands over the per-connection task handles, for joining at shutdown.
    pub fn take_connection_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(
            &mut *self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn registry(&self) -> &SessionRegistry<StreamLink> {
        &self.registry
    }
}

impl Transport for StreamBinding {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn owns(&self, session_id: SessionId) -> bool {
        self.registry.contains(session_id)
    }

    fn send(&self, session_id: SessionId, envelope: &Envelope) -> bool {
        let Some(link) = self.registry.link(session_id) else {
            return false;
        };

        let mut envelope = envelope.clone();
        envelope.stamp();
        if link.push(Arc::from(envelope.to_line())) {
            true
        } else {
            self.registry.mark_for_eviction(session_id);
            false
        }
    }

    fn broadcast(&self, envelope: &Envelope, exclude: Option<SessionId>) -> usize {
        let mut envelope = envelope.clone();
        envelope.stamp();
        let line: Arc<str> = Arc::from(envelope.to_line());

        let mut delivered = 0;
        for (session_id, link) in self.registry.snapshot() {
            if Some(session_id) == exclude {
                continue;
            }
            if link.push(Arc::clone(&line)) {
                delivered += 1;
            } else {
                self.registry.mark_for_eviction(session_id);
            }
        }
        delivered
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
