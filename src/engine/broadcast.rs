//! Commit broadcast across connections of one store.

use super::{ConnectionId, EngineEvent};
use crate::types::Version;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::trace;

struct Peer {
    id: ConnectionId,
    sender: Sender<EngineEvent>,
}

/// Fans a "version advanced" wake out to every other connection open on
/// the same store. Delivery is FIFO per source; there is no global order
/// across sources beyond the engine's version ordering.
pub(crate) struct CommitBroadcaster {
    peers: Mutex<Vec<Peer>>,
}

impl CommitBroadcaster {
    pub(crate) fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Register a connection's event queue. Connections without an event
    /// queue never register; they cannot receive pushed wakes.
    pub(crate) fn register(&self, id: ConnectionId, sender: Sender<EngineEvent>) {
        self.peers.lock().push(Peer { id, sender });
    }

    pub(crate) fn unregister(&self, id: ConnectionId) {
        self.peers.lock().retain(|p| p.id != id);
    }

    /// Wake every peer except the committing connection, which runs its
    /// own dispatch pass synchronously.
    pub(crate) fn broadcast(&self, source: ConnectionId, version: Version) {
        let mut peers = self.peers.lock();
        peers.retain(|peer| {
            if peer.id == source {
                return true;
            }
            trace!(from = source.0, to = peer.id.0, version = version.0, "wake");
            // A failed send means the receiver is gone; drop the peer.
            peer.sender.send(EngineEvent::Wake { version }).is_ok()
        });
    }

    #[cfg(test)]
    pub(crate) fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}
