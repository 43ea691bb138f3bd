//! Store-and-forward delivery over the replicated store.
//!
//! The sender adds a mailbox entry signed with its own key; any node holds
//! and relays it, but only the receiver named in the payload can remove it.
//! An undelivered message lives until its TTL lapses and is then swept like
//! any other entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use agora_core::{MailboxPayload, PayloadHash, StorageEntry, MAILBOX_TTL_MS};
use agora_store::{AddResult, RemoveResult, ReplicatedStore, StoreEvent};

use crate::error::{MailboxError, Result};
use crate::message::{MailboxAddress, MailboxIdentity, MailboxMessage, ReceivedMessage};
use crate::sealed::SealedEnvelope;

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub ttl_ms: u64,
    /// Re-announce our own unexpired sent messages when the node starts.
    pub republish_on_start: bool,
    pub event_capacity: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            ttl_ms: MAILBOX_TTL_MS,
            republish_on_start: true,
            event_capacity: 256,
        }
    }
}

#[derive(Default)]
struct ChannelState {
    received: HashMap<String, ReceivedMessage>,
    /// Envelopes addressed to us that failed to open. Never retried.
    ignored_uids: HashSet<String>,
    sent: HashMap<PayloadHash, StorageEntry>,
}

pub struct MailboxChannel {
    store: Arc<ReplicatedStore>,
    identity: MailboxIdentity,
    config: MailboxConfig,
    state: Mutex<ChannelState>,
    received_tx: broadcast::Sender<ReceivedMessage>,
}

impl MailboxChannel {
    pub fn new(store: Arc<ReplicatedStore>, identity: MailboxIdentity, config: MailboxConfig) -> Self {
        let (received_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store,
            identity,
            config,
            state: Mutex::new(ChannelState::default()),
            received_tx,
        }
    }

    pub fn address(&self) -> MailboxAddress {
        self.identity.address()
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Notified once per newly delivered message.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.received_tx.subscribe()
    }

    /// Seal `body` for `receiver` and add it to the store. Returns the entry key.
    pub fn send(&self, body: impl Into<Bytes>, receiver: &MailboxAddress) -> Result<PayloadHash> {
        let message = MailboxMessage {
            sender: self.identity.address(),
            body: body.into(),
            sent_at: self.store.now_millis(),
        };
        let envelope = SealedEnvelope::seal(&message.to_bytes()?, &receiver.encryption_key)?;
        let mut payload = MailboxPayload::new(
            self.identity.signing_key().public_key(),
            receiver.signing_key,
            envelope.to_bytes()?,
        );
        payload.ttl_ms = self.config.ttl_ms;

        let entry = self.store.build_add(payload, self.identity.signing_key());
        let key = entry.key();
        match self.store.add(entry.clone(), None) {
            AddResult::Added => {
                tracing::debug!(%key, uid = %envelope.uid, "mailbox message sent");
                self.state.lock().sent.insert(key, entry);
                Ok(key)
            }
            AddResult::Rejected(reason) => Err(MailboxError::Rejected(reason)),
        }
    }

    /// Retire a processed message. Only works for entries addressed to us.
    pub fn acknowledge(&self, key: &PayloadHash) -> Result<()> {
        let entry = self.store.get(key).ok_or(MailboxError::NotFound(*key))?;
        let me = self.identity.signing_key().public_key();
        if entry.receiver_public_key() != Some(&me) {
            return Err(MailboxError::NotAddressedToUs(*key));
        }

        let mutation = self.store.build_remove(key, self.identity.signing_key());
        match self.store.remove(mutation, None) {
            RemoveResult::Removed => {
                tracing::debug!(%key, "mailbox message acknowledged");
                Ok(())
            }
            RemoveResult::Rejected(reason) => Err(MailboxError::Rejected(reason)),
        }
    }

    /// Try to deliver `entry`. Returns the message the first time an entry
    /// addressed to us opens successfully.
    pub fn process_entry(&self, entry: &StorageEntry) -> Option<ReceivedMessage> {
        let mailbox = entry.payload.as_mailbox()?;
        if mailbox.receiver != self.identity.signing_key().public_key() {
            return None;
        }
        let key = entry.key();

        let envelope = match SealedEnvelope::from_bytes(&mailbox.sealed) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(%key, error = %e, "undecodable mailbox envelope");
                return None;
            }
        };

        let mut state = self.state.lock();
        if state.received.contains_key(&envelope.uid) || state.ignored_uids.contains(&envelope.uid) {
            return None;
        }

        let opened = envelope
            .open(self.identity.encryption_secret())
            .and_then(|plain| MailboxMessage::from_bytes(&plain));
        let message = match opened {
            Ok(message) if message.sender.signing_key == mailbox.sender => message,
            Ok(_) => {
                tracing::warn!(%key, uid = %envelope.uid, "mailbox sender does not match envelope");
                state.ignored_uids.insert(envelope.uid);
                return None;
            }
            Err(e) => {
                tracing::info!(%key, uid = %envelope.uid, error = %e, "ignoring mailbox message we cannot open");
                state.ignored_uids.insert(envelope.uid);
                return None;
            }
        };

        let received = ReceivedMessage {
            key,
            uid: envelope.uid.clone(),
            message,
        };
        state.received.insert(envelope.uid, received.clone());
        drop(state);

        tracing::debug!(%key, uid = %received.uid, "mailbox message received");
        let _ = self.received_tx.send(received.clone());
        Some(received)
    }

    /// Deliver everything already in the store. Used at startup.
    pub fn process_existing(&self) -> usize {
        self.store
            .get_all(None)
            .iter()
            .filter_map(|entry| self.process_entry(entry))
            .count()
    }

    pub fn received_messages(&self) -> Vec<ReceivedMessage> {
        self.state.lock().received.values().cloned().collect()
    }

    pub fn ignored_uids(&self) -> Vec<String> {
        self.state.lock().ignored_uids.iter().cloned().collect()
    }

    /// Re-announce our own unexpired sent messages. Entries still in the
    /// store are broadcast again; entries the store lost are re-added.
    pub fn republish_sent(&self) -> usize {
        let me = self.identity.signing_key().public_key();
        let now = self.store.now_millis();

        let mut state = self.state.lock();
        for entry in self.store.get_all(None) {
            if entry.payload.as_mailbox().map_or(false, |m| m.sender == me) {
                state.sent.insert(entry.key(), entry);
            }
        }
        state.sent.retain(|_, entry| !entry.is_expired(now));
        let sent: Vec<StorageEntry> = state.sent.values().cloned().collect();
        drop(state);

        let republished = sent
            .into_iter()
            .filter(|entry| {
                let key = entry.key();
                self.store.rebroadcast(&key) || self.store.add(entry.clone(), None).is_added()
            })
            .count();
        if republished > 0 {
            tracing::info!(republished, "republished sent mailbox messages");
        }
        republished
    }

    /// Deliver store additions as they arrive until the handle is aborted.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        let mut events = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::Added(entry)) => {
                        channel.process_entry(&entry);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "mailbox listener lagged, rescanning store");
                        channel.process_existing();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
