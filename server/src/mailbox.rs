//! Inbound mailbox between network tasks and the dispatcher.
//!
//! Any number of producers push; the dispatcher is the only consumer and
//! takes the whole batch at once, so the lock is never held while messages
//! are processed and new arrivals always land in the next batch.

use shared::{fields, Envelope, SessionId};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stream,
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("tcp"),
            TransportKind::Datagram => f.write_str("udp"),
        }
    }
}

/// One entry in the inbound mailbox.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A session was created by a transport binding.
    ClientConnected {
        session_id: SessionId,
        transport: TransportKind,
        remote: SocketAddr,
    },
    /// A session was destroyed. Raised exactly once per session.
    ClientDisconnected {
        session_id: SessionId,
        transport: TransportKind,
    },
    /// A parsed envelope with `session_id` and receive timestamp injected.
    Message(Envelope),
}

impl InboundEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            InboundEvent::ClientConnected { session_id, .. }
            | InboundEvent::ClientDisconnected { session_id, .. } => Some(*session_id),
            InboundEvent::Message(envelope) => envelope.session_id(),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            InboundEvent::ClientConnected { .. } => "client_connected",
            InboundEvent::ClientDisconnected { .. } => "client_disconnected",
            InboundEvent::Message(envelope) => envelope.tag(),
        }
    }
}

/// Wraps a freshly parsed envelope for the mailbox, injecting the session
/// id, the peer address and a receive-time timestamp.
pub fn inbound_message(
    mut envelope: Envelope,
    session_id: SessionId,
    remote: SocketAddr,
) -> InboundEvent {
    envelope.set_session_id(session_id);
    envelope.insert(fields::CLIENT_ADDRESS, remote.to_string());
    envelope.stamp();
    InboundEvent::Message(envelope)
}

/// Shared handle to the inbound queue.
#[derive(Debug, Clone, Default)]
pub struct Inbox(Arc<Mutex<Vec<InboundEvent>>>);

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, Vec<InboundEvent>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: InboundEvent) {
        self.queue().push(event);
    }

    /// Swaps the queue for an empty one and returns everything it held, in
    /// arrival order.
    pub fn take(&self) -> Vec<InboundEvent> {
        std::mem::take(&mut *self.queue())
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: SessionId, n: i64) -> InboundEvent {
        let mut envelope = Envelope::new("move").with("n", n);
        envelope.set_session_id(id);
        InboundEvent::Message(envelope)
    }

    #[test]
    fn test_take_returns_arrival_order_and_clears() {
        let inbox = Inbox::new();
        for n in 0..5 {
            inbox.push(message(1, n));
        }

        let batch = inbox.take();
        assert_eq!(batch.len(), 5);
        assert!(inbox.is_empty());

        let order: Vec<i64> = batch
            .iter()
            .map(|event| match event {
                InboundEvent::Message(env) => env.get("n").and_then(|v| v.as_i64()).unwrap(),
                _ => panic!("Unexpected event"),
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_arrivals_after_take_go_to_next_batch() {
        let inbox = Inbox::new();
        inbox.push(message(1, 0));

        let first = inbox.take();
        inbox.push(message(1, 1));

        assert_eq!(first.len(), 1);
        assert_eq!(inbox.take().len(), 1);
        assert!(inbox.take().is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        let inbox = Inbox::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let inbox = inbox.clone();
                std::thread::spawn(move || {
                    for n in 0..250 {
                        inbox.push(message(t, n));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(inbox.take().len(), 1000);
    }

    #[test]
    fn test_inbound_message_injects_server_fields() {
        let addr: SocketAddr = "10.0.0.5:4242".parse().unwrap();
        let envelope = Envelope::parse(r#"{"type":"ping","timestamp":1.0,"session_id":999}"#).unwrap();

        let InboundEvent::Message(envelope) = inbound_message(envelope, 12, addr) else {
            panic!("Unexpected event");
        };

        assert_eq!(envelope.session_id(), Some(12));
        assert_eq!(envelope.get_str(fields::CLIENT_ADDRESS), Some("10.0.0.5:4242"));
        assert!(envelope.timestamp().unwrap() > 1.0);
    }

    #[test]
    fn test_event_tags_and_ids() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let connected = InboundEvent::ClientConnected {
            session_id: 3,
            transport: TransportKind::Stream,
            remote: addr,
        };
        let disconnected = InboundEvent::ClientDisconnected {
            session_id: 3,
            transport: TransportKind::Datagram,
        };

        assert_eq!(connected.tag(), "client_connected");
        assert_eq!(disconnected.tag(), "client_disconnected");
        assert_eq!(connected.session_id(), Some(3));
        assert_eq!(message(7, 0).session_id(), Some(7));
        assert_eq!(message(7, 0).tag(), "move");
    }
}
