use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use tether_core::protocol::{ConnectionId, ServerEvent};


/// Per-connection outboxes for routed events.
///
/// Delivery is best effort: a full or closed outbox drops the event. The
/// last `reserved` slots of every outbox only take [`is_terminal`] events,
/// so a backlog of routine traffic cannot crowd out the end of a transfer
/// or session.
pub struct ConnectionHub {
    outboxes: RwLock<HashMap<ConnectionId, mpsc::Sender<ServerEvent>>>,
    capacity: usize,
    reserved: usize,
}

impl ConnectionHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            outboxes: RwLock::new(HashMap::new()),
            capacity,
            reserved: if capacity > 1 { (capacity / 16).max(1) } else { 0 },
        }
    }

    /// Opens an outbox for `connection_id`, replacing any previous one.
    pub fn register(&self, connection_id: ConnectionId) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outboxes.write().insert(connection_id, tx);
        rx
    }

    /// Drops the outbox; the receiving side sees the channel close once
    /// queued events are drained.
    pub fn unregister(&self, connection_id: ConnectionId) -> bool {
        self.outboxes.write().remove(&connection_id).is_some()
    }

    /// Queues `event` for `connection_id`. Returns whether it was queued.
    pub fn deliver(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let Some(tx) = self.outboxes.read().get(&connection_id).cloned() else {
            debug!(connection_id, "No outbox for connection, event dropped");
            return false;
        };
        if !is_terminal(&event) && tx.capacity() <= self.reserved {
            warn!(connection_id, "Outbox nearly full, routine event dropped");
            return false;
        }
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id, "Outbox full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id, "Outbox closed, event dropped");
                false
            }
        }
    }

    /// Queues a copy of `event` for every listed connection.
    pub fn deliver_all(&self, connection_ids: &[ConnectionId], event: &ServerEvent) -> usize {
        connection_ids
            .iter()
            .filter(|&&id| self.deliver(id, event.clone()))
            .count()
    }

    #[must_use]
    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.outboxes.read().contains_key(&connection_id)
    }
}

/// Events that close out a transfer or a session.
#[must_use]
pub fn is_terminal(event: &ServerEvent) -> bool {
    matches!(
        event,
        ServerEvent::TransferCompleted { .. }
            | ServerEvent::TransferFailed { .. }
            | ServerEvent::TransferRejected { .. }
            | ServerEvent::PeerDisconnected { .. }
            | ServerEvent::SessionEnded { .. }
    )
}
