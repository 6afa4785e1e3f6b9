//! Message delivery between nodes
//!
//! The driver thread owns an [`Inbox`]; transports push inbound envelopes
//! into its sender. Sending is fire-and-forget: Raft retries on its own
//! schedule, so a dropped message only costs a round.
//!
//! [`LocalNetwork`] connects in-process nodes through channels and can cut
//! links to simulate partitions or cap message size like a frame limit.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use vdb_core::NodeId;

use crate::log::RaftMember;
use crate::message::Envelope;

/// What the driver thread receives
#[derive(Debug)]
pub enum Inbound {
    /// A message from a peer
    Message(Envelope),
    /// Local state changed (proposal appended); run a cycle now
    Wake,
    /// Stop the driver
    Shutdown,
}

/// Receiving half owned by the driver, plus a sender for transports
#[derive(Debug)]
pub struct Inbox {
    pub(crate) tx: Sender<Inbound>,
    pub(crate) rx: Receiver<Inbound>,
}

impl Inbox {
    /// New channel
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Inbox { tx, rx }
    }

    /// A sender a transport can deliver into
    pub fn sender(&self) -> Sender<Inbound> {
        self.tx.clone()
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound message delivery
pub trait Transport: Send + Sync {
    /// Queue `envelope` for delivery to `envelope.to`; never blocks on the network
    fn send(&self, envelope: Envelope);

    /// Membership changed; open or retire peer connections
    fn update_peers(&self, _members: &[RaftMember]) {}
}

// ============================================================================
// LocalNetwork
// ============================================================================

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, Sender<Inbound>>,
    isolated: HashSet<NodeId>,
    max_message_bytes: Option<usize>,
}

/// In-process network for tests
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LocalNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node; replaces an earlier registration with the same id
    pub fn register(&self, id: NodeId, sender: Sender<Inbound>) -> LocalTransport {
        self.state.write().nodes.insert(id, sender);
        LocalTransport {
            id,
            network: self.clone(),
        }
    }

    /// Drop every message to or from `id`
    pub fn isolate(&self, id: NodeId) {
        self.state.write().isolated.insert(id);
    }

    /// Reconnect `id`
    pub fn heal(&self, id: NodeId) {
        self.state.write().isolated.remove(&id);
    }

    /// Reconnect everyone
    pub fn heal_all(&self) {
        self.state.write().isolated.clear();
    }

    /// Drop messages whose encoded size exceeds `limit` bytes
    pub fn set_max_message_bytes(&self, limit: Option<usize>) {
        self.state.write().max_message_bytes = limit;
    }

    fn deliver(&self, from: NodeId, envelope: Envelope) {
        let state = self.state.read();
        if state.isolated.contains(&from) || state.isolated.contains(&envelope.to) {
            return;
        }
        if let Some(limit) = state.max_message_bytes {
            let len = rmp_serde::to_vec(&envelope).map(|b| b.len()).unwrap_or(usize::MAX);
            if len > limit {
                tracing::error!(
                    target: "vdb::raft",
                    from,
                    to = envelope.to,
                    kind = envelope.msg.kind(),
                    len,
                    limit,
                    "message exceeds the size limit and was dropped"
                );
                return;
            }
        }
        if let Some(tx) = state.nodes.get(&envelope.to) {
            let _ = tx.send(Inbound::Message(envelope));
        }
    }
}

/// One node's handle on a [`LocalNetwork`]
#[derive(Clone)]
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn send(&self, envelope: Envelope) {
        self.network.deliver(self.id, envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RaftMessage;

    fn envelope(from: NodeId, to: NodeId) -> Envelope {
        Envelope {
            from,
            from_endpoint: format!("node-{}", from),
            to,
            msg: RaftMessage::VoteResponse {
                term: 1,
                vote_granted: true,
            },
        }
    }

    #[test]
    fn test_local_delivery() {
        let net = LocalNetwork::new();
        let a = Inbox::new();
        let b = Inbox::new();
        let ta = net.register(1, a.sender());
        net.register(2, b.sender());

        ta.send(envelope(1, 2));
        assert!(matches!(b.rx.try_recv(), Ok(Inbound::Message(e)) if e.from == 1));
        assert!(a.rx.try_recv().is_err());
    }

    #[test]
    fn test_isolation_drops_both_directions() {
        let net = LocalNetwork::new();
        let a = Inbox::new();
        let b = Inbox::new();
        let ta = net.register(1, a.sender());
        let tb = net.register(2, b.sender());

        net.isolate(2);
        ta.send(envelope(1, 2));
        tb.send(envelope(2, 1));
        assert!(b.rx.try_recv().is_err());
        assert!(a.rx.try_recv().is_err());

        net.heal(2);
        ta.send(envelope(1, 2));
        assert!(b.rx.try_recv().is_ok());
    }

    #[test]
    fn test_oversize_messages_dropped() {
        let net = LocalNetwork::new();
        let a = Inbox::new();
        let b = Inbox::new();
        let ta = net.register(1, a.sender());
        net.register(2, b.sender());

        net.set_max_message_bytes(Some(8));
        ta.send(envelope(1, 2));
        assert!(b.rx.try_recv().is_err());

        net.set_max_message_bytes(None);
        ta.send(envelope(1, 2));
        assert!(b.rx.try_recv().is_ok());
    }

    #[test]
    fn test_unknown_destination_is_dropped() {
        let net = LocalNetwork::new();
        let a = Inbox::new();
        let ta = net.register(1, a.sender());
        ta.send(envelope(1, 9));
    }
}
