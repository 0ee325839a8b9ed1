//! Tick dispatcher: the single authoritative loop between the network and
//! the game rules.
//!
//! Every cycle the dispatcher
//! 1. takes the whole inbound batch from the [`Inbox`],
//! 2. feeds each entry to the [`GameLogic`] collaborator,
//! 3. routes the returned [`Response`]s through the [`Router`],
//! 4. runs the periodic world update when its wall-clock interval is due,
//! 5. sleeps out the rest of the tick period, or logs an overrun.
//!
//! Game logic is only ever called from this loop, so world state needs no
//! locking of its own. Sends never block here: both transports enqueue.

use crate::error::LogicError;
use crate::mailbox::{InboundEvent, Inbox, TransportKind};
use log::{debug, error, info, warn};
use shared::{Envelope, SessionId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a response goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Unicast(SessionId),
    /// Every registered session on every transport, minus `exclude`.
    Broadcast { exclude: Option<SessionId> },
}

/// An instruction to deliver one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub target: Target,
    pub payload: Envelope,
}

impl Response {
    pub fn unicast(session_id: SessionId, payload: Envelope) -> Self {
        Self {
            target: Target::Unicast(session_id),
            payload,
        }
    }

    pub fn broadcast(payload: Envelope) -> Self {
        Self {
            target: Target::Broadcast { exclude: None },
            payload,
        }
    }

    pub fn broadcast_except(exclude: SessionId, payload: Envelope) -> Self {
        Self {
            target: Target::Broadcast {
                exclude: Some(exclude),
            },
            payload,
        }
    }
}

/// Session changes requested by game logic during one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    Authenticate(SessionId),
    Disconnect(SessionId),
}

/// Context handed to every game logic call.
///
/// Game logic never holds session handles; it asks for changes here and the
/// dispatcher applies them once the call's responses have been routed.
#[derive(Debug, Default)]
pub struct SessionControl {
    tick: u64,
    session_count: usize,
    updates: Vec<SessionUpdate>,
}

impl SessionControl {
    pub fn new(tick: u64, session_count: usize) -> Self {
        Self {
            tick,
            session_count,
            updates: Vec::new(),
        }
    }

    pub fn authenticate(&mut self, session_id: SessionId) {
        self.updates.push(SessionUpdate::Authenticate(session_id));
    }

    /// Closes the session after this call's responses have been queued.
    pub fn disconnect(&mut self, session_id: SessionId) {
        self.updates.push(SessionUpdate::Disconnect(session_id));
    }

    /// Dispatcher cycle this call belongs to.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Registered sessions across all transports when the call started.
    pub fn session_count(&self) -> usize {
        self.session_count
    }

    pub fn updates(&self) -> &[SessionUpdate] {
        &self.updates
    }
}

/// The game rules collaborator.
///
/// All methods run on the dispatcher task, one at a time.
pub trait GameLogic: Send + 'static {
    /// Handles one client envelope. `session_id` and the receive timestamp
    /// have already been injected.
    fn handle(
        &mut self,
        ctx: &mut SessionControl,
        envelope: &Envelope,
    ) -> Result<Vec<Response>, LogicError>;

    /// Called exactly once for every session that goes away.
    fn on_session_closed(&mut self, ctx: &mut SessionControl, session_id: SessionId)
        -> Vec<Response>;

    /// Called on a fixed wall-clock interval, independent of the tick count.
    fn periodic_update(&mut self, ctx: &mut SessionControl) -> Vec<Response>;

    /// Save hook, called once during shutdown.
    fn flush(&mut self) {}
}

/// A transport binding as seen by the dispatcher.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn owns(&self, session_id: SessionId) -> bool;

    /// Queues one envelope for one session. False if the session is unknown
    /// or its queue is gone; the failure stays local to that session.
    fn send(&self, session_id: SessionId, envelope: &Envelope) -> bool;

    /// Queues one envelope for every session except `exclude`. Returns the
    /// number of sessions it was queued for.
    fn broadcast(&self, envelope: &Envelope, exclude: Option<SessionId>) -> usize;

    fn session_count(&self) -> usize;

    fn set_authenticated(&self, session_id: SessionId, authenticated: bool) -> bool;

    /// Destroys the session as if the peer had disconnected.
    fn disconnect(&self, session_id: SessionId) -> bool;
}

/// Resolves session ids to the transport that owns them.
#[derive(Clone, Default)]
pub struct Router {
    transports: Vec<Arc<dyn Transport>>,
}

impl Router {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    fn owner(&self, session_id: SessionId) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.owns(session_id))
    }

    pub fn send_to(&self, session_id: SessionId, envelope: &Envelope) -> bool {
        match self.owner(session_id) {
            Some(transport) => transport.send(session_id, envelope),
            None => {
                debug!("Dropping `{}` for unknown session {}", envelope.tag(), session_id);
                false
            }
        }
    }

    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<SessionId>) -> usize {
        self.transports
            .iter()
            .map(|t| t.broadcast(envelope, exclude))
            .sum()
    }

    /// Delivers one response and returns how many sessions it was queued for.
    pub fn route(&self, response: &Response) -> usize {
        match response.target {
            Target::Unicast(session_id) => {
                usize::from(self.send_to(session_id, &response.payload))
            }
            Target::Broadcast { exclude } => self.broadcast(&response.payload, exclude),
        }
    }

    pub fn apply(&self, update: SessionUpdate) -> bool {
        match update {
            SessionUpdate::Authenticate(id) => self
                .owner(id)
                .is_some_and(|t| t.set_authenticated(id, true)),
            SessionUpdate::Disconnect(id) => self.owner(id).is_some_and(|t| t.disconnect(id)),
        }
    }

    pub fn session_count(&self) -> usize {
        self.transports.iter().map(|t| t.session_count()).sum()
    }
}

/// Lifecycle of the dispatcher. `Draining` only exists during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running,
    Draining,
    Stopped,
}

/// Shared, lock-free view of the dispatcher state.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new(state: DispatcherState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> DispatcherState {
        match self.0.load(Ordering::SeqCst) {
            0 => DispatcherState::Running,
            1 => DispatcherState::Draining,
            _ => DispatcherState::Stopped,
        }
    }

    pub fn set(&self, state: DispatcherState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Atomically moves from `from` to `to`; false if the state was different.
    pub fn transition(&self, from: DispatcherState, to: DispatcherState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Counters kept by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub ticks: u64,
    pub overruns: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub messages: u64,
    pub logic_failures: u64,
    pub world_updates: u64,
    pub deliveries: u64,
}

impl DispatchStats {
    /// Sessions known to the dispatcher, from its own event counts.
    pub fn active_sessions(&self) -> u64 {
        self.connects.saturating_sub(self.disconnects)
    }
}

/// Time left in the tick budget, or `None` when the cycle used all of it.
pub fn remaining_budget(elapsed: Duration, period: Duration) -> Option<Duration> {
    period.checked_sub(elapsed).filter(|rest| !rest.is_zero())
}

pub struct Dispatcher<L: GameLogic> {
    logic: L,
    inbox: Inbox,
    router: Router,
    state: StateCell,
    tick_period: Duration,
    world_update_interval: Duration,
    last_world_update: Instant,
    stats: DispatchStats,
}

impl<L: GameLogic> Dispatcher<L> {
    pub fn new(
        logic: L,
        inbox: Inbox,
        router: Router,
        state: StateCell,
        tick_period: Duration,
        world_update_interval: Duration,
    ) -> Self {
        Self {
            logic,
            inbox,
            router,
            state,
            tick_period,
            world_update_interval,
            last_world_update: Instant::now(),
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn logic(&self) -> &L {
        &self.logic
    }

    /// Runs cycles until the state leaves `Running`, then hands itself back
    /// for draining.
    pub async fn run(mut self) -> Self {
        info!(
            "Dispatcher running at {:.1}Hz",
            1.0 / self.tick_period.as_secs_f64()
        );

        while self.state.get() == DispatcherState::Running {
            let started = Instant::now();
            self.run_cycle();

            match remaining_budget(started.elapsed(), self.tick_period) {
                Some(rest) => tokio::time::sleep(rest).await,
                None => {
                    self.stats.overruns += 1;
                    warn!(
                        "Tick {} overran its {:?} budget ({:?})",
                        self.stats.ticks,
                        self.tick_period,
                        started.elapsed()
                    );
                    tokio::task::yield_now().await;
                }
            }

            if self.stats.ticks % 600 == 0 {
                debug!(
                    "Tick {}: {} sessions, {} messages, {} overruns",
                    self.stats.ticks,
                    self.router.session_count(),
                    self.stats.messages,
                    self.stats.overruns
                );
            }
        }

        info!("Dispatcher left its loop after {} ticks", self.stats.ticks);
        self
    }

    /// One full cycle without the pacing sleep. Returns the batch size.
    pub fn run_cycle(&mut self) -> usize {
        self.stats.ticks += 1;

        let batch = self.inbox.take();
        let processed = batch.len();
        for event in batch {
            self.process(event);
        }

        if self.last_world_update.elapsed() >= self.world_update_interval {
            self.last_world_update = Instant::now();
            self.stats.world_updates += 1;
            self.invoke("world update", |logic, ctx| Ok(logic.periodic_update(ctx)));
        }

        processed
    }

    /// Processes whatever is still queued, then calls the flush hook and
    /// returns the game logic.
    pub fn drain(mut self) -> L {
        let leftover = self.inbox.take();
        if !leftover.is_empty() {
            info!("Draining {} queued events", leftover.len());
        }
        for event in leftover {
            self.process(event);
        }

        info!(
            "Dispatcher totals: {} ticks, {} messages, {} connects, {} disconnects, {} overruns",
            self.stats.ticks,
            self.stats.messages,
            self.stats.connects,
            self.stats.disconnects,
            self.stats.overruns
        );

        self.logic.flush();
        self.logic
    }

    fn process(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::ClientConnected {
                session_id,
                transport,
                remote,
            } => {
                self.stats.connects += 1;
                debug!("Session {} connected over {} from {}", session_id, transport, remote);
            }
            InboundEvent::ClientDisconnected {
                session_id,
                transport,
            } => {
                self.stats.disconnects += 1;
                debug!("Session {} disconnected from {}", session_id, transport);
                self.invoke("session close", |logic, ctx| {
                    Ok(logic.on_session_closed(ctx, session_id))
                });
            }
            InboundEvent::Message(envelope) => {
                self.stats.messages += 1;
                self.invoke(envelope.tag(), |logic, ctx| logic.handle(ctx, &envelope));
            }
        }
    }

    /// Calls into game logic with panics and errors contained to this entry.
    fn invoke<F>(&mut self, label: &str, call: F)
    where
        F: FnOnce(&mut L, &mut SessionControl) -> Result<Vec<Response>, LogicError>,
    {
        let mut ctx = SessionControl::new(self.stats.ticks, self.router.session_count());
        let logic = &mut self.logic;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(logic, &mut ctx)));

        match outcome {
            Ok(Ok(responses)) => {
                for response in &responses {
                    self.stats.deliveries += self.router.route(response) as u64;
                }
                for update in ctx.updates {
                    if !self.router.apply(update) {
                        debug!("Session update {:?} had no target", update);
                    }
                }
            }
            Ok(Err(e)) => {
                self.stats.logic_failures += 1;
                warn!("Game logic rejected `{}`: {}", label, e);
            }
            Err(_) => {
                self.stats.logic_failures += 1;
                error!("Game logic panicked while handling `{}`", label);
            }
        }
    }
}
