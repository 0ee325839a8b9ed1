//! Session tracking shared by both transport bindings
//!
//! This module handles the server-side bookkeeping of remote peers:
//! - Session id allocation, unique across every binding in the process
//! - Creation under a capacity limit and lookup by id or remote address
//! - Liveness tracking and idle-session sweeps
//! - Eviction flags raised by failed writes
//!
//! A [`SessionRegistry`] is owned by exactly one transport binding. Everyone
//! else refers to sessions by [`SessionId`] only, so a binding can evict its
//! sessions without coordinating with the dispatcher.

use log::{debug, info};
use shared::SessionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Process-wide session id counter, cloned into every registry.
///
/// Ids start at 1 and only ever increase, so an id is never handed out
/// twice even when sessions come and go on different transports.
#[derive(Debug, Clone)]
pub struct SessionIds(Arc<AtomicU64>);

impl SessionIds {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn next(&self) -> SessionId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side record of one remote peer
///
/// `L` is the transport-specific handle used to reach the peer: the outbound
/// queue of a TCP connection, or simply the peer address for UDP.
#[derive(Debug)]
pub struct Session<L> {
    /// Unique id assigned by the registry
    pub id: SessionId,
    /// Transport address of the peer
    pub remote: SocketAddr,
    pub created_at: Instant,
    /// Last time a well-formed envelope arrived from this peer
    pub last_activity_at: Instant,
    /// Set by game logic after a successful login, never by the transport
    pub authenticated: bool,
    /// A send to this peer failed; the next sweep removes it
    pub evict_pending: bool,
    pub link: L,
}

impl<L> Session<L> {
    pub fn new(id: SessionId, remote: SocketAddr, link: L) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote,
            created_at: now,
            last_activity_at: now,
            authenticated: false,
            evict_pending: false,
            link,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    /// True if nothing arrived from the peer within `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity_at.elapsed() > timeout
    }
}

struct Roster<L> {
    sessions: HashMap<SessionId, Session<L>>,
    by_addr: HashMap<SocketAddr, SessionId>,
    closed: bool,
}

impl<L> Roster<L> {
    fn remove(&mut self, id: SessionId) -> Option<Session<L>> {
        let session = self.sessions.remove(&id)?;
        self.by_addr.remove(&session.remote);
        Some(session)
    }
}

/// Capacity-limited set of sessions behind an internal lock
///
/// Every method takes `&self` and holds the lock only for the duration of
/// the map operation. Nothing here touches the network, so callers may
/// snapshot links and then send without blocking other threads.
pub struct SessionRegistry<L> {
    inner: Mutex<Roster<L>>,
    ids: SessionIds,
    capacity: usize,
}

impl<L> SessionRegistry<L> {
    pub fn new(capacity: usize, ids: SessionIds) -> Self {
        Self {
            inner: Mutex::new(Roster {
                sessions: HashMap::new(),
                by_addr: HashMap::new(),
                closed: false,
            }),
            ids,
            capacity,
        }
    }

    fn roster(&self) -> MutexGuard<'_, Roster<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new peer.
    ///
    /// Returns `None` when the registry is full, drained, or the address
    /// already owns a session. The checks and the insert happen under one lock.
    pub fn create(&self, remote: SocketAddr, link: L) -> Option<SessionId> {
        let mut roster = self.roster();
        if roster.closed {
            debug!("Registry drained, refusing {}", remote);
            return None;
        }
        if roster.sessions.len() >= self.capacity {
            debug!("Registry full ({}), refusing {}", self.capacity, remote);
            return None;
        }
        if roster.by_addr.contains_key(&remote) {
            return None;
        }

        let id = self.ids.next();
        roster.sessions.insert(id, Session::new(id, remote, link));
        roster.by_addr.insert(remote, id);
        info!("Session {} opened for {}", id, remote);
        Some(id)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<SessionId> {
        self.roster().by_addr.get(&addr).copied()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.roster().sessions.contains_key(&id)
    }

    pub fn remote(&self, id: SessionId) -> Option<SocketAddr> {
        self.roster().sessions.get(&id).map(|s| s.remote)
    }

    /// Refreshes `last_activity_at`. Returns false for unknown ids.
    pub fn touch(&self, id: SessionId) -> bool {
        match self.roster().sessions.get_mut(&id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn set_authenticated(&self, id: SessionId, authenticated: bool) -> bool {
        match self.roster().sessions.get_mut(&id) {
            Some(session) => {
                session.authenticated = authenticated;
                true
            }
            None => false,
        }
    }

    pub fn is_authenticated(&self, id: SessionId) -> bool {
        self.roster()
            .sessions
            .get(&id)
            .is_some_and(|s| s.authenticated)
    }

    /// Flags a session so the next sweep evicts it.
    pub fn mark_for_eviction(&self, id: SessionId) -> bool {
        match self.roster().sessions.get_mut(&id) {
            Some(session) => {
                session.evict_pending = true;
                true
            }
            None => false,
        }
    }

    /// Removes a session. Only the first caller for a given id gets it back,
    /// which is what makes disconnect notifications exactly-once.
    pub fn evict(&self, id: SessionId) -> Option<Session<L>> {
        let session = self.roster().remove(id)?;
        info!("Session {} closed ({})", session.id, session.remote);
        Some(session)
    }

    /// Removes and returns every session idle past `idle_timeout` or flagged
    /// for eviction.
    pub fn sweep(&self, idle_timeout: Duration) -> Vec<Session<L>> {
        let mut roster = self.roster();
        let expired: Vec<SessionId> = roster
            .sessions
            .values()
            .filter(|s| s.evict_pending || s.is_idle(idle_timeout))
            .map(|s| s.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| roster.remove(id))
            .inspect(|s| {
                if s.evict_pending {
                    info!("Session {} evicted after a failed send", s.id);
                } else {
                    info!("Session {} timed out", s.id);
                }
            })
            .collect()
    }

    /// Removes every session and refuses new ones, for shutdown.
    pub fn drain(&self) -> Vec<Session<L>> {
        let mut roster = self.roster();
        roster.closed = true;
        roster.by_addr.clear();
        roster.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.roster().sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.roster().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster().sessions.is_empty()
    }

    /// True once [`Self::drain`] has run.
    pub fn is_closed(&self) -> bool {
        self.roster().closed
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<L: Clone> SessionRegistry<L> {
    /// Clones the transport handle for one session.
    pub fn link(&self, id: SessionId) -> Option<L> {
        self.roster().sessions.get(&id).map(|s| s.link.clone())
    }

    /// Point-in-time copy of every `(id, link)` pair, for broadcast fan-out.
    pub fn snapshot(&self) -> Vec<(SessionId, L)> {
        self.roster()
            .sessions
            .values()
            .map(|s| (s.id, s.link.clone()))
            .collect()
    }
}
