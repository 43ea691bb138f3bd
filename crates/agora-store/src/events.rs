//! Change notifications and the re-broadcast queue.
//!
//! Listeners subscribe to a bounded `tokio::sync::broadcast` channel. Events
//! are sent while the store's write lock is held, so every subscriber sees
//! them in the order they were applied; delivery itself is asynchronous and a
//! subscriber that falls behind by more than the channel capacity observes
//! `RecvError::Lagged`. Dropping the receiver unsubscribes.
//!
//! Re-broadcasts go the other way: the store hands an [`Outbound`] to its
//! [`Broadcaster`], which queues it for the network layer. Nothing here ever
//! blocks the writer.

use tokio::sync::mpsc;

use agora_core::{AppendOnlyPayload, Capability, NodeId, PayloadHash, StorageEntry};

use crate::messages::StoreMessage;

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Owner-signed remove (the receiver, for mailbox entries).
    Owner,
    /// TTL lapsed and the sweeper collected it.
    Expired,
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Added(StorageEntry),
    Removed {
        entry: StorageEntry,
        reason: RemovalReason,
    },
    Refreshed {
        key: PayloadHash,
        sequence_number: u64,
    },
    AppendOnlyAdded {
        hash: PayloadHash,
        payload: AppendOnlyPayload,
    },
}

/// A message queued for peers.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: StoreMessage,
    /// The peer we received it from; it already has it.
    pub exclude: Option<NodeId>,
}

impl Outbound {
    pub fn required_capabilities(&self) -> &[Capability] {
        self.message.required_capabilities()
    }
}

/// Sink for accepted mutations that must be forwarded to peers.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, outbound: Outbound);
}

/// Queues outbound messages on an unbounded channel drained by the gossip relay.
#[derive(Debug, Clone)]
pub struct QueueBroadcaster {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl QueueBroadcaster {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Broadcaster for QueueBroadcaster {
    fn broadcast(&self, outbound: Outbound) {
        if self.tx.send(outbound).is_err() {
            tracing::debug!("broadcast queue closed, dropping outbound message");
        }
    }
}

/// Discards everything. For nodes that never forward (and for tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast(&self, _outbound: Outbound) {}
}
