use anyhow::{ bail, Result };
use shared::key_info::NodeId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver, UnboundedSender };
use tracing::warn;

/// Transport abstraction the core consumes. The real network layer (NATS,
/// libp2p, whatever the host runs) implements this; the core only ever sees
/// framed bytes addressed by session and transport identity.
pub trait MessageBus: Send + Sync {
    /// Fan a frame out to every other session participant.
    fn send_to_group(&self, session_id: &str, from: &NodeId, bytes: Vec<u8>) -> Result<()>;

    /// Deliver a frame to a single peer.
    fn send_to_peer(&self, session_id: &str, to: &NodeId, bytes: Vec<u8>) -> Result<()>;
}

/// In-process hub connecting several engines, used by the integration tests
/// and by embedders that run multiple parties in one process. Broadcast
/// delivers to every registered peer except the sender.
#[derive(Default)]
pub struct LocalBus {
    peers: Mutex<HashMap<NodeId, UnboundedSender<(String, Vec<u8>)>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        LocalBus::default()
    }

    /// Attach a node; the caller drains the returned channel into its
    /// engine's `deliver_message`.
    pub fn register(&self, node: NodeId) -> UnboundedReceiver<(String, Vec<u8>)> {
        let (tx, rx) = unbounded_channel();
        self.peers.lock().expect("bus poisoned").insert(node, tx);
        rx
    }
}

impl MessageBus for LocalBus {
    fn send_to_group(&self, session_id: &str, from: &NodeId, bytes: Vec<u8>) -> Result<()> {
        let peers = self.peers.lock().expect("bus poisoned");
        for (node, tx) in peers.iter() {
            if node == from {
                continue;
            }
            if tx.send((session_id.to_string(), bytes.clone())).is_err() {
                warn!("peer {} is gone, dropping broadcast", node);
            }
        }
        Ok(())
    }

    fn send_to_peer(&self, session_id: &str, to: &NodeId, bytes: Vec<u8>) -> Result<()> {
        let peers = self.peers.lock().expect("bus poisoned");
        match peers.get(to) {
            Some(tx) => {
                if tx.send((session_id.to_string(), bytes)).is_err() {
                    warn!("peer {} is gone, dropping unicast", to);
                }
                Ok(())
            }
            None => bail!("unknown peer {to}"),
        }
    }
}
