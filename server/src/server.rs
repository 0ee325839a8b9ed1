//! Server lifecycle: binding both transports, running the dispatcher and the
//! ordered, idempotent shutdown.

use crate::config::ServerConfig;
use crate::datagram::{DatagramBinding, DatagramSettings};
use crate::dispatch::{DispatchStats, Dispatcher, DispatcherState, GameLogic, Router, StateCell, Transport};
use crate::error::ServerError;
use crate::mailbox::{InboundEvent, Inbox};
use crate::session::SessionIds;
use crate::stream::{StreamBinding, StreamSettings};
use log::{error, info, warn};
use shared::{tags, Envelope, SessionId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Everything that only exists between `start` and `stop`.
struct Running<L: GameLogic> {
    stream: Arc<StreamBinding>,
    datagram: Arc<DatagramBinding>,
    router: Router,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<Dispatcher<L>>,
}

/// A game server reachable over TCP and UDP at the same time.
///
/// A `Server` runs once: `start` binds and spawns, `stop` tears everything
/// down and hands the game logic back for inspection through [`Server::logic`].
pub struct Server<L: GameLogic> {
    config: ServerConfig,
    logic: Option<L>,
    inbox: Inbox,
    state: StateCell,
    ids: SessionIds,
    running: Option<Running<L>>,
    last_stats: Option<DispatchStats>,
    stopped: bool,
}

impl<L: GameLogic> Server<L> {
    pub fn new(config: ServerConfig, logic: L) -> Self {
        Self {
            config,
            logic: Some(logic),
            inbox: Inbox::new(),
            state: StateCell::new(DispatcherState::Stopped),
            ids: SessionIds::new(),
            running: None,
            last_stats: None,
            stopped: false,
        }
    }

    /// Binds both sockets and spawns every task.
    ///
    /// If either bind fails nothing is spawned and the error names the
    /// transport and address.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        if self.stopped {
            return Err(ServerError::Stopped);
        }

        let config = &self.config;
        let stream = StreamBinding::bind(
            config.stream_addr,
            StreamSettings {
                capacity: config.max_stream_sessions,
                idle_timeout: config.stream_idle_timeout,
                sweep_interval: config.sweep_interval,
                write_timeout: config.write_timeout,
                queue_limit: config.stream_queue_limit,
            },
            self.ids.clone(),
            self.inbox.clone(),
        )
        .await
        .map_err(|source| ServerError::Bind {
            transport: "TCP",
            addr: config.stream_addr,
            source,
        })?;

        let datagram = DatagramBinding::bind(
            config.datagram_addr,
            DatagramSettings {
                capacity: config.max_datagram_sessions,
                idle_timeout: config.datagram_idle_timeout,
                sweep_interval: config.sweep_interval,
            },
            self.ids.clone(),
            self.inbox.clone(),
        )
        .await
        .map_err(|source| ServerError::Bind {
            transport: "UDP",
            addr: config.datagram_addr,
            source,
        })?;

        let Some(logic) = self.logic.take() else {
            return Err(ServerError::Stopped);
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = stream.spawn(shutdown_rx.clone());
        workers.extend(datagram.spawn(shutdown_rx));

        let stream_transport: Arc<dyn Transport> = stream.clone();
        let datagram_transport: Arc<dyn Transport> = datagram.clone();
        let router = Router::new(vec![stream_transport, datagram_transport]);

        self.state.set(DispatcherState::Running);
        let dispatcher = Dispatcher::new(
            logic,
            self.inbox.clone(),
            router.clone(),
            self.state.clone(),
            self.config.tick_period(),
            self.config.world_update_interval,
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        info!(
            "Server started: TCP {} / UDP {} at {}Hz",
            stream.local_addr(),
            datagram.local_addr(),
            self.config.tick_rate
        );

        self.running = Some(Running {
            stream,
            datagram,
            router,
            shutdown,
            workers,
            dispatcher,
        });
        Ok(())
    }

    /// Stops the server. Calling it again, or before `start`, does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!("Stopping server");

        self.state.transition(DispatcherState::Running, DispatcherState::Draining);
        let _ = running.shutdown.send(true);

        let farewell = Envelope::new(tags::SERVER_SHUTDOWN);
        let closed = running.stream.shutdown(Some(&farewell))
            + running.datagram.shutdown(Some(&farewell));
        info!("Sent shutdown notice to {} sessions", closed);

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut tasks = running.workers;
        tasks.extend(running.stream.take_connection_tasks());

        let mut abandoned = 0;
        for task in tasks {
            // Dropping a timed-out handle detaches the task; it is not aborted.
            if timeout_at(deadline, task).await.is_err() {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!("Abandoned {} tasks that did not finish in time", abandoned);
        }

        match timeout_at(deadline, running.dispatcher).await {
            Ok(Ok(dispatcher)) => {
                self.last_stats = Some(dispatcher.stats());
                self.logic = Some(dispatcher.drain());
            }
            Ok(Err(e)) => error!("Dispatcher task failed: {}", e),
            Err(_) => warn!(
                "Dispatcher did not stop within {:?}; game state was not flushed",
                self.config.shutdown_timeout
            ),
        }

        self.state.set(DispatcherState::Stopped);
        self.stopped = true;
        info!("Server stopped");
    }

    /// Sends `envelope` to every registered session except `exclude`.
    /// Returns how many sessions it was queued for.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<SessionId>) -> usize {
        self.running
            .as_ref()
            .map_or(0, |running| running.router.broadcast(envelope, exclude))
    }

    pub fn send_to(&self, session_id: SessionId, envelope: &Envelope) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.router.send_to(session_id, envelope))
    }

    /// Takes everything currently queued for the dispatcher.
    ///
    /// While the server runs this competes with the dispatcher for events.
    /// Anything taken here never reaches the game logic.
    pub fn get_and_clear_inbound(&self) -> Vec<InboundEvent> {
        self.inbox.take()
    }

    pub fn registered_session_count(&self) -> usize {
        self.running
            .as_ref()
            .map_or(0, |running| running.router.session_count())
    }

    pub fn stream_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.stream.local_addr())
    }

    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.running
            .as_ref()
            .map(|running| running.datagram.local_addr())
    }

    pub fn state(&self) -> DispatcherState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The game logic, while it is not lent to a running dispatcher.
    pub fn logic(&self) -> Option<&L> {
        self.logic.as_ref()
    }

    /// Dispatcher counters from the last completed run.
    pub fn stats(&self) -> Option<DispatchStats> {
        self.last_stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl<L: GameLogic> Drop for Server<L> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            warn!("Server dropped without stop(); closing sessions without draining");
            self.state.set(DispatcherState::Stopped);
            let _ = running.shutdown.send(true);
            running.stream.shutdown(None);
            running.datagram.shutdown(None);
        }
    }
}
