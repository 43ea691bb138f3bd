//! Transport abstraction.
//!
//! The transport owns connections and delivers whole [`WireMessage`]s.
//! Implementations may sit on TCP, Tor or anything else.

use std::time::Duration;

use async_trait::async_trait;

use agora_core::{Capabilities, NodeId};

use crate::error::Result;
use crate::messages::WireMessage;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer: &NodeId, message: WireMessage) -> Result<()>;

    /// Next message from any peer.
    async fn recv(&self) -> Result<(NodeId, WireMessage)>;

    /// `None` if nothing arrives within `timeout`.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(NodeId, WireMessage)>>;

    fn local_node_id(&self) -> NodeId;

    async fn connected_peers(&self) -> Result<Vec<NodeId>>;

    async fn is_connected(&self, peer: &NodeId) -> bool;

    /// What the peer advertised on connect; `None` if not connected.
    async fn peer_capabilities(&self, peer: &NodeId) -> Option<Capabilities>;
}

/// An in-memory transport for tests. Every registered node is connected to
/// every other.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex, RwLock};

    use crate::error::SyncError;

    struct Envelope {
        from: NodeId,
        message: WireMessage,
    }

    struct Peer {
        sender: mpsc::Sender<Envelope>,
        capabilities: Capabilities,
    }

    pub struct MemoryNetwork {
        peers: RwLock<HashMap<NodeId, Peer>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn create_transport(
            self: &Arc<Self>,
            node_id: NodeId,
            capabilities: Capabilities,
        ) -> MemoryTransport {
            let (sender, receiver) = mpsc::channel(1000);
            self.peers.write().await.insert(
                node_id,
                Peer {
                    sender,
                    capabilities,
                },
            );
            MemoryTransport {
                node_id,
                network: Arc::clone(self),
                receiver: Mutex::new(receiver),
            }
        }

        /// Drop a node from the network; later sends to it fail.
        pub async fn disconnect(&self, node_id: &NodeId) {
            self.peers.write().await.remove(node_id);
        }
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self {
                peers: RwLock::new(HashMap::new()),
            }
        }
    }

    pub struct MemoryTransport {
        node_id: NodeId,
        network: Arc<MemoryNetwork>,
        receiver: Mutex<mpsc::Receiver<Envelope>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, peer: &NodeId, message: WireMessage) -> Result<()> {
            let sender = {
                let peers = self.network.peers.read().await;
                peers
                    .get(peer)
                    .map(|p| p.sender.clone())
                    .ok_or(SyncError::PeerNotConnected(*peer))?
            };
            sender
                .send(Envelope {
                    from: self.node_id,
                    message,
                })
                .await
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<(NodeId, WireMessage)> {
            let mut rx = self.receiver.lock().await;
            match rx.recv().await {
                Some(envelope) => Ok((envelope.from, envelope.message)),
                None => Err(SyncError::TransportError("channel closed".into())),
            }
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(NodeId, WireMessage)>> {
            let mut rx = self.receiver.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(envelope)) => Ok(Some((envelope.from, envelope.message))),
                Ok(None) => Err(SyncError::TransportError("channel closed".into())),
                Err(_) => Ok(None),
            }
        }

        fn local_node_id(&self) -> NodeId {
            self.node_id
        }

        async fn connected_peers(&self) -> Result<Vec<NodeId>> {
            let peers = self.network.peers.read().await;
            if !peers.contains_key(&self.node_id) {
                return Ok(Vec::new());
            }
            Ok(peers
                .keys()
                .filter(|id| *id != &self.node_id)
                .copied()
                .collect())
        }

        async fn is_connected(&self, peer: &NodeId) -> bool {
            peer != &self.node_id && self.network.peers.read().await.contains_key(peer)
        }

        async fn peer_capabilities(&self, peer: &NodeId) -> Option<Capabilities> {
            self.network
                .peers
                .read()
                .await
                .get(peer)
                .map(|p| p.capabilities.clone())
        }
    }
}
