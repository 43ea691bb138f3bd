//! Forwarding of accepted store mutations to directly connected peers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use agora_store::Outbound;

use crate::messages::WireMessage;
use crate::transport::Transport;

/// Drains the store's outbox and sends each message to every connected
/// peer except the one it came from. Peers lacking a required capability
/// are skipped.
pub struct GossipRelay {
    transport: Arc<dyn Transport>,
}

impl GossipRelay {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send one outbound message. Returns how many peers it reached.
    pub async fn relay(&self, outbound: Outbound) -> usize {
        let peers = match self.transport.connected_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list peers for gossip");
                return 0;
            }
        };

        let required = outbound.required_capabilities().to_vec();
        let message = WireMessage::Store(outbound.message);
        let mut delivered = 0;
        for peer in peers {
            if Some(peer) == outbound.exclude {
                continue;
            }
            let capable = self
                .transport
                .peer_capabilities(&peer)
                .await
                .map_or(false, |caps| caps.contains_all(&required));
            if !capable {
                tracing::trace!(%peer, "skipping peer without required capabilities");
                continue;
            }
            match self.transport.send(&peer, message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(%peer, error = %e, "gossip send failed"),
            }
        }
        delivered
    }

    /// Relay everything queued on `outbox` until it closes.
    pub fn spawn(self, mut outbox: mpsc::UnboundedReceiver<Outbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(outbound) = outbox.recv().await {
                self.relay(outbound).await;
            }
            tracing::debug!("gossip outbox closed");
        })
    }
}
