//! The replicated store: signed add/refresh/remove over expiring payloads.
//!
//! Every mutation takes the single write lock, so two operations on the same
//! key are always applied one after the other and the sequence-number
//! comparison is linearizable. Reads take the read lock and treat entries
//! past their TTL as absent even before the sweeper has collected them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use agora_core::{
    AppendOnlyPayload, Capabilities, Clock, EntryBuilder, Keypair, NodeId, PayloadCapability,
    PayloadHash, SignedMutation, StorageEntry, StoragePayload, ValidationError,
    DEFAULT_DATE_TOLERANCE_MS, MAX_TTL_MS,
};

use crate::events::{Broadcaster, Outbound, RemovalReason, StoreEvent};
use crate::messages::StoreMessage;
use crate::sequence::{SequenceNumberMap, SequenceRecord, PURGE_AGE_MS};

/// Configuration for the replicated store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How often the sweeper removes expired entries.
    pub sweep_interval: Duration,
    /// The sequence map is purged only once it holds more records than this.
    pub max_sequence_map_size: usize,
    /// Age after which remembered sequence numbers may be purged.
    pub sequence_purge_age_ms: i64,
    /// Allowed clock skew for date-tolerant append-only payloads.
    pub date_tolerance_ms: i64,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Maximum entries of each kind in one initial-data response.
    pub max_get_data_entries: usize,
    /// Longest TTL accepted from anyone. Never above [`MAX_TTL_MS`].
    pub max_ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            max_sequence_map_size: 1_000,
            sequence_purge_age_ms: PURGE_AGE_MS,
            date_tolerance_ms: DEFAULT_DATE_TOLERANCE_MS,
            event_capacity: 1_024,
            max_get_data_entries: 10_000,
            max_ttl_ms: MAX_TTL_MS,
        }
    }
}

/// Predicate consulted on every add; `false` drops the payload.
pub type PayloadFilter = Arc<dyn Fn(&StoragePayload) -> bool + Send + Sync>;

/// Why a mutation was not applied. Rejections are silent on the network:
/// nothing is stored, no event fires, nothing is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Sequence number not above the remembered one.
    StaleSequence { current: u64, received: u64 },
    OwnerMismatch,
    Invalid(ValidationError),
    Expired,
    AddOnceAlreadyRemoved,
    Filtered,
    UnknownKey,
    NotRefreshable,
    OutsideDateTolerance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResult {
    Added,
    Rejected(RejectReason),
}

impl AddResult {
    pub fn is_added(&self) -> bool {
        matches!(self, AddResult::Added)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshResult {
    Refreshed,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveResult {
    Removed,
    Rejected(RejectReason),
}

/// Result of adding a content-addressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendResult {
    Added,
    /// Already held; content-addressed payloads are deduplicated by hash.
    AlreadyExists,
    Rejected(RejectReason),
}

pub(crate) struct StoreState {
    pub(crate) entries: HashMap<PayloadHash, StorageEntry>,
    pub(crate) sequence_numbers: SequenceNumberMap,
    pub(crate) removed_add_once: HashSet<PayloadHash>,
    pub(crate) append_only: HashMap<PayloadHash, AppendOnlyPayload>,
}

pub struct ReplicatedStore {
    pub(crate) state: RwLock<StoreState>,
    pub(crate) clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn Broadcaster>,
    events: broadcast::Sender<StoreEvent>,
    filter: RwLock<Option<PayloadFilter>>,
    pub(crate) config: StoreConfig,
}

impl ReplicatedStore {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            state: RwLock::new(StoreState {
                entries: HashMap::new(),
                sequence_numbers: SequenceNumberMap::new(),
                removed_add_once: HashSet::new(),
                append_only: HashMap::new(),
            }),
            clock,
            broadcaster,
            events,
            filter: RwLock::new(None),
            config,
        }
    }

    /// Receive every accepted change from now on. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn set_filter(&self, filter: Option<PayloadFilter>) {
        *self.filter.write() = filter;
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Signed entries
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or replace an entry. `origin` is the peer it came from, if any;
    /// it is skipped when the entry is forwarded.
    pub fn add(&self, entry: StorageEntry, origin: Option<NodeId>) -> AddResult {
        self.apply_add(entry, origin, true)
    }

    pub(crate) fn apply_add(
        &self,
        mut entry: StorageEntry,
        origin: Option<NodeId>,
        allow_broadcast: bool,
    ) -> AddResult {
        let key = entry.key();
        let now = self.clock.now_millis();
        let mut state = self.state.write();

        if let Err(reason) = self.check_add(&state, &key, &entry, now) {
            tracing::debug!(%key, seq = entry.sequence_number, ?reason, "add rejected");
            return AddResult::Rejected(reason);
        }

        entry.clamp_creation(now);
        state.sequence_numbers.record(key, entry.sequence_number, now);
        state.entries.insert(key, entry.clone());
        let _ = self.events.send(StoreEvent::Added(entry.clone()));

        if allow_broadcast {
            self.broadcaster.broadcast(Outbound {
                message: StoreMessage::AddDataRequest { entry },
                exclude: origin,
            });
        }
        AddResult::Added
    }

    fn check_add(
        &self,
        state: &StoreState,
        key: &PayloadHash,
        entry: &StorageEntry,
        now: i64,
    ) -> Result<(), RejectReason> {
        let stored = state.entries.get(key);
        let current = state
            .sequence_numbers
            .get(key)
            .into_iter()
            .chain(stored.map(|s| s.sequence_number))
            .max();

        // With the entry held, only a strictly newer add replaces it. With
        // just a remembered number, an equal add is a re-fetch after restart.
        if let Some(current) = current {
            let fresh = if stored.is_some() {
                entry.sequence_number > current
            } else {
                entry.sequence_number >= current
            };
            if !fresh {
                return Err(RejectReason::StaleSequence {
                    current,
                    received: entry.sequence_number,
                });
            }
        }

        if entry.payload.has_capability(PayloadCapability::AddOnce)
            && state.removed_add_once.contains(key)
        {
            return Err(RejectReason::AddOnceAlreadyRemoved);
        }

        if entry.is_expired(now) {
            return Err(RejectReason::Expired);
        }

        entry.is_valid_for_add().map_err(RejectReason::Invalid)?;

        let ttl_ms = entry.payload.ttl_ms();
        if ttl_ms > self.config.max_ttl_ms {
            return Err(RejectReason::Invalid(ValidationError::TtlTooLong {
                ttl_ms,
                limit_ms: self.config.max_ttl_ms,
            }));
        }

        if let Some(stored) = stored {
            if !entry.matches_relevant_pub_key(stored) {
                return Err(RejectReason::OwnerMismatch);
            }
        }

        if let Some(filter) = self.filter.read().as_ref() {
            if !filter(&entry.payload) {
                return Err(RejectReason::Filtered);
            }
        }
        Ok(())
    }

    /// Reset an entry's TTL clock under a higher sequence number.
    pub fn refresh(&self, mutation: SignedMutation, origin: Option<NodeId>) -> RefreshResult {
        let key = mutation.key;
        let now = self.clock.now_millis();
        let mut state = self.state.write();

        if let Err(reason) = check_owner_mutation(&state, &mutation, now, false) {
            tracing::debug!(%key, seq = mutation.sequence_number, ?reason, "refresh rejected");
            return RefreshResult::Rejected(reason);
        }

        state
            .sequence_numbers
            .record(key, mutation.sequence_number, now);
        if let Some(stored) = state.entries.get_mut(&key) {
            stored.sequence_number = mutation.sequence_number;
            stored.signature = mutation.signature;
            stored.creation_timestamp = now;
        }
        let _ = self.events.send(StoreEvent::Refreshed {
            key,
            sequence_number: mutation.sequence_number,
        });
        self.broadcaster.broadcast(Outbound {
            message: StoreMessage::RefreshRequest(mutation),
            exclude: origin,
        });
        RefreshResult::Refreshed
    }

    /// Owner-signed remove. For mailbox entries the owner is the receiver.
    pub fn remove(&self, mutation: SignedMutation, origin: Option<NodeId>) -> RemoveResult {
        let key = mutation.key;
        let now = self.clock.now_millis();
        let mut state = self.state.write();

        if let Err(reason) = check_owner_mutation(&state, &mutation, now, true) {
            tracing::debug!(%key, seq = mutation.sequence_number, ?reason, "remove rejected");
            return RemoveResult::Rejected(reason);
        }

        state
            .sequence_numbers
            .record(key, mutation.sequence_number, now);
        if let Some(entry) = state.entries.remove(&key) {
            if entry.payload.has_capability(PayloadCapability::AddOnce) {
                state.removed_add_once.insert(key);
            }
            let _ = self.events.send(StoreEvent::Removed {
                entry,
                reason: RemovalReason::Owner,
            });
        }
        self.broadcaster.broadcast(Outbound {
            message: StoreMessage::RemoveDataRequest(mutation),
            exclude: origin,
        });
        RemoveResult::Removed
    }

    /// Delete every entry whose TTL has lapsed at `now`. Returns the count.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let mut state = self.state.write();
        let expired: Vec<PayloadHash> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            if let Some(entry) = state.entries.remove(key) {
                let _ = self.events.send(StoreEvent::Removed {
                    entry,
                    reason: RemovalReason::Expired,
                });
            }
        }

        if state.sequence_numbers.len() > self.config.max_sequence_map_size {
            let purged = state
                .sequence_numbers
                .purge_older_than(now, self.config.sequence_purge_age_ms);
            if purged > 0 {
                tracing::info!(purged, "purged old sequence numbers");
            }
        }
        expired.len()
    }

    /// Backdate, by half their TTL, entries whose payload requires `peer` to
    /// stay online. Only unintended disconnects count.
    pub fn on_disconnect(&self, peer: &NodeId, intended: bool) -> usize {
        if intended {
            return 0;
        }
        let mut state = self.state.write();
        let mut backdated = 0;
        for entry in state.entries.values_mut() {
            if entry.payload.owner_node() == Some(peer) {
                entry.backdate();
                backdated += 1;
            }
        }
        if backdated > 0 {
            tracing::debug!(%peer, backdated, "backdated entries of disconnected owner");
        }
        backdated
    }

    /// Queue a held, live entry for broadcast again without changing it.
    pub fn rebroadcast(&self, key: &PayloadHash) -> bool {
        match self.get(key) {
            Some(entry) => {
                self.broadcaster.broadcast(Outbound {
                    message: StoreMessage::AddDataRequest { entry },
                    exclude: None,
                });
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get(&self, key: &PayloadHash) -> Option<StorageEntry> {
        let now = self.clock.now_millis();
        self.state
            .read()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Live entries, optionally only those a peer with `capabilities` may receive.
    pub fn get_all(&self, capabilities: Option<&Capabilities>) -> Vec<StorageEntry> {
        let now = self.clock.now_millis();
        self.state
            .read()
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .filter(|entry| {
                capabilities.map_or(true, |caps| {
                    caps.contains_all(entry.payload.required_capabilities())
                })
            })
            .cloned()
            .collect()
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequence_number(&self, key: &PayloadHash) -> Option<u64> {
        self.state.read().sequence_numbers.get(key)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content-addressed payloads
    // ─────────────────────────────────────────────────────────────────────────

    /// Store `payload` under `hash` unless already present. Never removable.
    pub fn add_if_absent(
        &self,
        hash: PayloadHash,
        payload: AppendOnlyPayload,
        origin: Option<NodeId>,
    ) -> AppendResult {
        self.apply_append(hash, payload, origin, true, true)
    }

    pub(crate) fn apply_append(
        &self,
        hash: PayloadHash,
        payload: AppendOnlyPayload,
        origin: Option<NodeId>,
        allow_broadcast: bool,
        check_date: bool,
    ) -> AppendResult {
        if let Err(e) = payload.verify_integrity(&hash) {
            tracing::warn!(%hash, error = %e, "append-only payload failed integrity check");
            return AppendResult::Rejected(RejectReason::Invalid(e));
        }
        let now = self.clock.now_millis();
        if check_date && !payload.is_within_date_tolerance(now, self.config.date_tolerance_ms) {
            tracing::debug!(%hash, "append-only payload outside date tolerance");
            return AppendResult::Rejected(RejectReason::OutsideDateTolerance);
        }

        let mut state = self.state.write();
        if state.append_only.contains_key(&hash) {
            return AppendResult::AlreadyExists;
        }
        state.append_only.insert(hash, payload.clone());
        let _ = self.events.send(StoreEvent::AppendOnlyAdded {
            hash,
            payload: payload.clone(),
        });
        if allow_broadcast {
            self.broadcaster.broadcast(Outbound {
                message: StoreMessage::AddAppendOnlyRequest { hash, payload },
                exclude: origin,
            });
        }
        AppendResult::Added
    }

    pub fn get_append_only(&self, hash: &PayloadHash) -> Option<AppendOnlyPayload> {
        self.state.read().append_only.get(hash).cloned()
    }

    pub fn append_only_len(&self) -> usize {
        self.state.read().append_only.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local publishing helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Sign a new entry with the next sequence number for its key.
    ///
    /// `signer` is the owner, or the sender for a mailbox payload.
    pub fn build_add(&self, payload: impl Into<StoragePayload>, signer: &Keypair) -> StorageEntry {
        let payload = payload.into();
        let seq = self.state.read().sequence_numbers.next_for(&payload.hash());
        EntryBuilder::new(payload)
            .sequence_number(seq)
            .timestamp(self.clock.now_millis())
            .sign(signer)
    }

    pub fn build_refresh(&self, key: &PayloadHash, owner: &Keypair) -> SignedMutation {
        let seq = self.state.read().sequence_numbers.next_for(key);
        SignedMutation::sign(*key, seq, owner)
    }

    pub fn build_remove(&self, key: &PayloadHash, owner: &Keypair) -> SignedMutation {
        self.build_refresh(key, owner)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence hooks
    // ─────────────────────────────────────────────────────────────────────────

    /// Load persisted state without forwarding any of it. Expired entries are
    /// dropped by the normal add checks. Returns the number of entries loaded.
    pub fn restore(
        &self,
        sequence_numbers: Vec<(PayloadHash, SequenceRecord)>,
        entries: Vec<StorageEntry>,
        append_only: Vec<(PayloadHash, AppendOnlyPayload)>,
    ) -> usize {
        self.state.write().sequence_numbers.restore(sequence_numbers);
        let loaded = entries
            .into_iter()
            .filter(|entry| self.apply_add(entry.clone(), None, false).is_added())
            .count();
        for (hash, payload) in append_only {
            self.apply_append(hash, payload, None, false, false);
        }
        loaded
    }

    pub fn sequence_snapshot(&self) -> Vec<(PayloadHash, SequenceRecord)> {
        self.state.read().sequence_numbers.snapshot()
    }

    /// Run [`Self::sweep_expired`] every `sweep_interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep_expired(store.clock.now_millis());
                if removed > 0 {
                    tracing::debug!(removed, "swept expired entries");
                }
            }
        })
    }
}

/// Shared checks for refresh and remove: the key must be held and live, the
/// sequence number must increase, and the signer must be the stored owner.
fn check_owner_mutation(
    state: &StoreState,
    mutation: &SignedMutation,
    now: i64,
    allow_mailbox: bool,
) -> Result<(), RejectReason> {
    let stored = state
        .entries
        .get(&mutation.key)
        .filter(|entry| !entry.is_expired(now))
        .ok_or(RejectReason::UnknownKey)?;

    if !allow_mailbox && stored.payload.as_mailbox().is_some() {
        return Err(RejectReason::NotRefreshable);
    }

    let current = state
        .sequence_numbers
        .get(&mutation.key)
        .unwrap_or(0)
        .max(stored.sequence_number);
    if mutation.sequence_number <= current {
        return Err(RejectReason::StaleSequence {
            current,
            received: mutation.sequence_number,
        });
    }

    mutation.verify().map_err(RejectReason::Invalid)?;

    if mutation.owner_public_key != stored.owner_public_key {
        return Err(RejectReason::OwnerMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{Capability, MailboxPayload, ManualClock, ProtectedPayload};
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    use crate::events::QueueBroadcaster;

    const T0: i64 = 1_700_000_000_000;
    const TTL: u64 = 60_000;

    struct Harness {
        store: Arc<ReplicatedStore>,
        clock: ManualClock,
        outbox: mpsc::UnboundedReceiver<Outbound>,
        owner: Keypair,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(T0);
        let (broadcaster, outbox) = QueueBroadcaster::channel();
        let store = ReplicatedStore::new(
            StoreConfig::default(),
            Arc::new(clock.clone()),
            Arc::new(broadcaster),
        );
        Harness {
            store: Arc::new(store),
            clock,
            outbox,
            owner: Keypair::from_seed(&[1; 32]),
        }
    }

    fn offer(owner: &Keypair) -> ProtectedPayload {
        ProtectedPayload::new(owner.public_key(), TTL, &b"offer"[..])
    }

    fn signed(owner: &Keypair, seq: u64, at: i64) -> StorageEntry {
        EntryBuilder::new(offer(owner))
            .sequence_number(seq)
            .timestamp(at)
            .sign(owner)
    }

    #[test]
    fn test_add_then_replay_rejected() {
        let h = harness();
        assert_eq!(h.store.add(signed(&h.owner, 1, T0), None), AddResult::Added);
        assert_eq!(
            h.store.add(signed(&h.owner, 1, T0), None),
            AddResult::Rejected(RejectReason::StaleSequence { current: 1, received: 1 })
        );
    }

    #[test]
    fn test_higher_sequence_replaces_entry() {
        let h = harness();
        let first = signed(&h.owner, 1, T0);
        let key = first.key();
        h.store.add(first, None);
        assert!(h.store.add(signed(&h.owner, 5, T0), None).is_added());
        assert_eq!(h.store.get(&key).map(|e| e.sequence_number), Some(5));
        assert!(!h.store.add(signed(&h.owner, 4, T0), None).is_added());
    }

    proptest! {
        #[test]
        fn prop_only_strictly_greater_sequence_replaces(first in 1u64..10_000, second in 1u64..10_000) {
            let h = harness();
            prop_assert!(h.store.add(signed(&h.owner, first, T0), None).is_added());
            let result = h.store.add(signed(&h.owner, second, T0), None);
            prop_assert_eq!(result.is_added(), second > first);
        }
    }

    #[test]
    fn test_ttl_lazy_expiry_boundary() {
        let h = harness();
        let entry = signed(&h.owner, 1, T0);
        let key = entry.key();
        h.store.add(entry, None);

        assert!(h.store.get(&key).is_some());
        h.clock.set(T0 + TTL as i64 - 1);
        assert!(h.store.get(&key).is_some());
        h.clock.set(T0 + TTL as i64 + 1);
        assert!(h.store.get(&key).is_none());
        assert!(h.store.get_all(None).is_empty());
        // Still held until swept.
        assert_eq!(h.store.len(), 1);
    }

    #[test]
    fn test_refresh_extends_lifetime() {
        let h = harness();
        let entry = signed(&h.owner, 1, T0);
        let key = entry.key();
        h.store.add(entry, None);

        h.clock.set(T0 + 50_000);
        let refresh = h.store.build_refresh(&key, &h.owner);
        assert_eq!(refresh.sequence_number, 2);
        assert_eq!(h.store.refresh(refresh, None), RefreshResult::Refreshed);

        h.clock.set(T0 + 50_000 + TTL as i64 - 1);
        assert!(h.store.get(&key).is_some());
        h.clock.set(T0 + 50_000 + TTL as i64 + 1);
        assert!(h.store.get(&key).is_none());
    }

    #[test]
    fn test_refresh_by_other_key_rejected() {
        let h = harness();
        let entry = signed(&h.owner, 1, T0);
        let key = entry.key();
        h.store.add(entry, None);
        let intruder = Keypair::from_seed(&[9; 32]);
        assert_eq!(
            h.store.refresh(SignedMutation::sign(key, 2, &intruder), None),
            RefreshResult::Rejected(RejectReason::OwnerMismatch)
        );
    }

    #[test]
    fn test_expired_on_arrival_rejected() {
        let h = harness();
        let stale = signed(&h.owner, 1, T0 - TTL as i64 - 1);
        assert_eq!(h.store.add(stale, None), AddResult::Rejected(RejectReason::Expired));
    }

    #[test]
    fn test_future_creation_clamped() {
        let h = harness();
        let entry = signed(&h.owner, 1, T0 + 3_600_000);
        let key = entry.key();
        assert!(h.store.add(entry, None).is_added());
        assert_eq!(h.store.get(&key).map(|e| e.creation_timestamp), Some(T0));
    }

    #[test]
    fn test_remove_then_replayed_add_rejected() {
        let h = harness();
        let entry = signed(&h.owner, 1, T0);
        let key = entry.key();
        h.store.add(entry.clone(), None);

        let remove = h.store.build_remove(&key, &h.owner);
        assert_eq!(h.store.remove(remove, None), RemoveResult::Removed);
        assert!(h.store.get(&key).is_none());

        // The old add is still below the remembered number.
        assert!(!h.store.add(entry, None).is_added());
        // A fresh add above it is fine.
        assert!(h.store.add(signed(&h.owner, 3, T0), None).is_added());
    }

    #[test]
    fn test_remove_unknown_key_rejected() {
        let h = harness();
        let mutation = SignedMutation::sign(PayloadHash::from_bytes([7; 32]), 1, &h.owner);
        assert_eq!(
            h.store.remove(mutation, None),
            RemoveResult::Rejected(RejectReason::UnknownKey)
        );
    }

    #[test]
    fn test_equal_sequence_allowed_when_only_remembered() {
        let h = harness();
        let entry = signed(&h.owner, 4, T0);
        h.store.restore(vec![(entry.key(), SequenceRecord { sequence_number: 4, recorded_at: T0 })], vec![], vec![]);
        assert!(h.store.add(entry, None).is_added());
        assert!(!h.store.add(signed(&h.owner, 3, T0), None).is_added());
    }

    #[test]
    fn test_mailbox_sender_cannot_remove() {
        let h = harness();
        let sender = Keypair::from_seed(&[2; 32]);
        let receiver = Keypair::from_seed(&[3; 32]);
        let payload = MailboxPayload::new(sender.public_key(), receiver.public_key(), &b"sealed"[..]);
        let entry = h.store.build_add(payload, &sender);
        let key = entry.key();
        assert!(h.store.add(entry, None).is_added());

        let by_sender = SignedMutation::sign(key, 2, &sender);
        assert_eq!(
            h.store.remove(by_sender, None),
            RemoveResult::Rejected(RejectReason::OwnerMismatch)
        );
        assert!(h.store.get(&key).is_some());

        let by_receiver = SignedMutation::sign(key, 2, &receiver);
        assert_eq!(h.store.remove(by_receiver, None), RemoveResult::Removed);
        assert!(h.store.get(&key).is_none());
    }

    #[test]
    fn test_mailbox_refresh_rejected() {
        let h = harness();
        let sender = Keypair::from_seed(&[2; 32]);
        let receiver = Keypair::from_seed(&[3; 32]);
        let entry = h.store.build_add(
            MailboxPayload::new(sender.public_key(), receiver.public_key(), &b"m"[..]),
            &sender,
        );
        let key = entry.key();
        h.store.add(entry, None);
        assert_eq!(
            h.store.refresh(SignedMutation::sign(key, 2, &receiver), None),
            RefreshResult::Rejected(RejectReason::NotRefreshable)
        );
    }

    #[test]
    fn test_add_once_cannot_return() {
        let h = harness();
        let payload = offer(&h.owner).add_once();
        let entry = h.store.build_add(payload.clone(), &h.owner);
        let key = entry.key();
        h.store.add(entry, None);
        h.store.remove(h.store.build_remove(&key, &h.owner), None);

        let again = h.store.build_add(payload, &h.owner);
        assert_eq!(
            h.store.add(again, None),
            AddResult::Rejected(RejectReason::AddOnceAlreadyRemoved)
        );
    }

    #[test]
    fn test_filter_predicate() {
        let h = harness();
        let banned = h.owner.public_key();
        h.store
            .set_filter(Some(Arc::new(move |p: &StoragePayload| p.owner_key() != &banned)));
        assert_eq!(
            h.store.add(signed(&h.owner, 1, T0), None),
            AddResult::Rejected(RejectReason::Filtered)
        );
        h.store.set_filter(None);
        assert!(h.store.add(signed(&h.owner, 1, T0), None).is_added());
    }

    #[test]
    fn test_sweep_removes_and_notifies() {
        let h = harness();
        let mut events = h.store.subscribe();
        h.store.add(signed(&h.owner, 1, T0), None);
        assert!(matches!(events.try_recv(), Ok(StoreEvent::Added(_))));

        assert_eq!(h.store.sweep_expired(T0 + TTL as i64), 0);
        assert_eq!(h.store.sweep_expired(T0 + TTL as i64 + 1), 1);
        assert!(h.store.is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(StoreEvent::Removed { reason: RemovalReason::Expired, .. })
        ));
    }

    #[test]
    fn test_rejection_fires_nothing() {
        let mut h = harness();
        let mut events = h.store.subscribe();
        let forged = EntryBuilder::new(offer(&h.owner))
            .timestamp(T0)
            .sign(&Keypair::from_seed(&[8; 32]));
        assert!(!h.store.add(forged, None).is_added());
        assert!(events.try_recv().is_err());
        assert!(h.outbox.try_recv().is_err());
    }

    #[test]
    fn test_accepted_add_queued_excluding_origin() {
        let mut h = harness();
        let origin = NodeId::from_bytes([4; 32]);
        h.store.add(signed(&h.owner, 1, T0), Some(origin));
        let outbound = h.outbox.try_recv().unwrap();
        assert_eq!(outbound.exclude, Some(origin));
        assert!(matches!(outbound.message, StoreMessage::AddDataRequest { .. }));
    }

    #[test]
    fn test_get_all_capability_filter() {
        let h = harness();
        let gated = h
            .store
            .build_add(offer(&h.owner).required_capabilities([Capability::PROPOSAL]), &h.owner);
        h.store.add(gated, None);
        h.store.add(
            h.store.build_add(ProtectedPayload::new(h.owner.public_key(), TTL, &b"plain"[..]), &h.owner),
            None,
        );

        assert_eq!(h.store.get_all(None).len(), 2);
        assert_eq!(h.store.get_all(Some(&Capabilities::none())).len(), 1);
        assert_eq!(
            h.store
                .get_all(Some(&Capabilities::new([Capability::PROPOSAL])))
                .len(),
            2
        );
    }

    #[test]
    fn test_unintended_disconnect_backdates_owner_entries() {
        let h = harness();
        let node = NodeId::from_bytes([5; 32]);
        let entry = h.store.build_add(offer(&h.owner).owner_node(node), &h.owner);
        let key = entry.key();
        h.store.add(entry, None);

        assert_eq!(h.store.on_disconnect(&node, true), 0);
        assert_eq!(h.store.on_disconnect(&node, false), 1);
        assert_eq!(
            h.store.get(&key).map(|e| e.creation_timestamp),
            Some(T0 - (TTL / 2) as i64)
        );
        h.clock.set(T0 + (TTL / 2) as i64 + 1);
        assert_eq!(h.store.sweep_expired(h.clock.now_millis()), 1);
    }

    #[test]
    fn test_unbounded_ttl_from_distant_past_rejected() {
        let h = harness();
        let mut payload = offer(&h.owner).owner_node(NodeId::from_bytes([5; 32]));
        payload.ttl_ms = i64::MAX as u64;
        let entry = EntryBuilder::new(payload)
            .timestamp(i64::MIN + 1)
            .sign(&h.owner);
        assert!(matches!(
            h.store.add(entry, None),
            AddResult::Rejected(RejectReason::Invalid(ValidationError::TtlTooLong { .. }))
        ));

        // Within the cap but created longer ago than the TTL.
        let mut payload = offer(&h.owner);
        payload.ttl_ms = MAX_TTL_MS;
        let stale = EntryBuilder::new(payload)
            .timestamp(i64::MIN + 1)
            .sign(&h.owner);
        assert_eq!(h.store.add(stale, None), AddResult::Rejected(RejectReason::Expired));

        assert_eq!(h.store.on_disconnect(&NodeId::from_bytes([5; 32]), false), 0);
        assert!(h.store.is_empty());
    }

    #[test]
    fn test_configured_ttl_limit() {
        let clock = ManualClock::new(T0);
        let (broadcaster, _outbox) = QueueBroadcaster::channel();
        let store = ReplicatedStore::new(
            StoreConfig {
                max_ttl_ms: TTL - 1,
                ..StoreConfig::default()
            },
            Arc::new(clock),
            Arc::new(broadcaster),
        );
        let owner = Keypair::from_seed(&[1; 32]);
        assert_eq!(
            store.add(signed(&owner, 1, T0), None),
            AddResult::Rejected(RejectReason::Invalid(ValidationError::TtlTooLong {
                ttl_ms: TTL,
                limit_ms: TTL - 1,
            }))
        );
    }

    #[test]
    fn test_add_if_absent_dedup_and_date_tolerance() {
        let h = harness();
        let payload = AppendOnlyPayload::new(&b"trade"[..]).dated(T0);
        let hash = payload.hash();
        assert_eq!(h.store.add_if_absent(hash, payload.clone(), None), AppendResult::Added);
        assert_eq!(h.store.add_if_absent(hash, payload, None), AppendResult::AlreadyExists);

        let old = AppendOnlyPayload::new(&b"old"[..]).dated(T0 - DEFAULT_DATE_TOLERANCE_MS - 1);
        assert_eq!(
            h.store.add_if_absent(old.hash(), old, None),
            AppendResult::Rejected(RejectReason::OutsideDateTolerance)
        );
    }

    #[test]
    fn test_add_if_absent_hash_mismatch() {
        let h = harness();
        let payload = AppendOnlyPayload::new(&b"trade"[..]);
        assert!(matches!(
            h.store.add_if_absent(PayloadHash::from_bytes([1; 32]), payload, None),
            AppendResult::Rejected(RejectReason::Invalid(_))
        ));
    }

    #[test]
    fn test_sequence_map_purged_when_oversized() {
        let clock = ManualClock::new(T0);
        let config = StoreConfig {
            max_sequence_map_size: 0,
            ..StoreConfig::default()
        };
        let store = ReplicatedStore::new(config, Arc::new(clock.clone()), Arc::new(crate::NoopBroadcaster));
        let owner = Keypair::from_seed(&[1; 32]);
        let entry = signed(&owner, 1, T0);
        let key = entry.key();
        store.add(entry, None);
        store.sweep_expired(T0 + TTL as i64 + 1);
        assert_eq!(store.sequence_number(&key), Some(1));
        store.sweep_expired(T0 + PURGE_AGE_MS + 1);
        assert_eq!(store.sequence_number(&key), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_on_interval() {
        let h = harness();
        h.store.add(signed(&h.owner, 1, T0), None);
        h.clock.set(T0 + TTL as i64 + 1);

        let handle = h.store.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.store.is_empty());
        handle.abort();
    }
}
