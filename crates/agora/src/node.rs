//! The node: one store, one mailbox, one accounting feed, one ledger.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use agora_core::{Clock, Keypair, NodeId, PayloadHash, StoragePayload, SystemClock};
use agora_ledger::{BalanceAggregator, PriceTable};
use agora_mailbox::{MailboxChannel, MailboxIdentity};
use agora_store::{
    should_persist, AddResult, MemoryPersistence, Outbound, Persistence, QueueBroadcaster, RefreshResult,
    RemoveResult, ReplicatedStore, SqlitePersistence, StoreEvent,
};
use agora_sync::{
    AccountingSync, ChainEvent, GossipRelay, LoggingFaultHandler, Oracle, PeerFaultHandler, Transport,
};

use crate::config::NodeConfig;
use crate::dispatch::Dispatcher;
use crate::error::{NodeError, Result};

/// Open the persistence layer named by `config.database_path`, falling back
/// to memory.
pub fn open_persistence(config: &NodeConfig) -> Result<Arc<dyn Persistence>> {
    Ok(match &config.database_path {
        Some(path) => Arc::new(SqlitePersistence::open(path)?),
        None => Arc::new(MemoryPersistence::new()),
    })
}

pub struct Node {
    config: NodeConfig,
    keypair: Keypair,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn Persistence>,
    store: Arc<ReplicatedStore>,
    mailbox: Arc<MailboxChannel>,
    accounting: Arc<AccountingSync>,
    balances: Arc<RwLock<BalanceAggregator>>,
    dispatcher: Arc<Dispatcher>,
    outbox: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>, persistence: Arc<dyn Persistence>) -> Result<Self> {
        Self::with_clock(config, transport, persistence, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_parts(config, transport, persistence, clock, Arc::new(LoggingFaultHandler))
    }

    /// Full constructor. `faults` receives connection-quality reports from
    /// the accounting sync.
    pub fn with_parts(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        faults: Arc<dyn PeerFaultHandler>,
    ) -> Result<Self> {
        let keypair = match &config.node_seed_hex {
            Some(seed) => Keypair::from_seed_hex(seed)?,
            None => Keypair::generate(),
        };

        let (broadcaster, outbox) = QueueBroadcaster::channel();
        let store = Arc::new(ReplicatedStore::new(config.store_config(), clock, Arc::new(broadcaster)));
        let mailbox = Arc::new(MailboxChannel::new(
            Arc::clone(&store),
            MailboxIdentity::from_keypair(keypair.clone()),
            config.mailbox_config(),
        ));

        let oracle = Arc::new(Oracle::from_config(&config.oracle)?);
        let accounting = Arc::new(
            AccountingSync::new(
                config.accounting_config(),
                oracle,
                Arc::clone(&transport),
                Some(Arc::clone(&persistence)),
            )
            .with_fault_handler(faults),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&accounting),
            Arc::clone(&transport),
            config.advertised_capabilities(),
        ));

        Ok(Self {
            config,
            keypair,
            transport,
            persistence,
            store,
            mailbox,
            accounting,
            balances: Arc::new(RwLock::new(BalanceAggregator::new(PriceTable::historical()))),
            dispatcher,
            outbox: Mutex::new(Some(outbox)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.transport.local_node_id()
    }

    pub fn public_key(&self) -> agora_core::Ed25519PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    pub fn mailbox(&self) -> &Arc<MailboxChannel> {
        &self.mailbox
    }

    pub fn accounting(&self) -> &Arc<AccountingSync> {
        &self.accounting
    }

    pub fn balances(&self) -> RwLockReadGuard<'_, BalanceAggregator> {
        self.balances.read()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Load persisted state, rebuild derived data, and spawn the background
    /// tasks.
    pub async fn start(&self) -> Result<()> {
        let outbox = self.outbox.lock().take().ok_or(NodeError::AlreadyStarted)?;

        let sequence_numbers = self.persistence.load_sequence_numbers().await?;
        let entries = self.persistence.load_entries().await?;
        let append_only = self.persistence.load_append_only().await?;
        let restored = self.store.restore(sequence_numbers, entries, append_only);

        self.accounting.load_persisted().await?;
        self.balances
            .write()
            .rebuild_from_genesis(&self.accounting.blocks())?;

        let received = self.mailbox.process_existing();
        let republished = if self.config.mailbox.republish_on_start {
            self.mailbox.republish_sent()
        } else {
            0
        };

        let mut tasks = Vec::new();
        tasks.push(self.spawn_persistence_bridge(self.store.subscribe()));
        tasks.push(self.spawn_balance_bridge(self.accounting.subscribe()));
        tasks.push(self.mailbox.spawn_listener());
        tasks.push(self.store.spawn_sweeper());
        tasks.push(GossipRelay::new(Arc::clone(&self.transport)).spawn(outbox));
        tasks.push(self.spawn_dispatch_loop());
        self.tasks.lock().extend(tasks);

        tracing::info!(
            node = %self.node_id(),
            restored,
            received,
            republished,
            accounting_height = self.accounting.last_height(),
            "node started"
        );
        Ok(())
    }

    /// Stop background tasks and request handlers, then save the
    /// sequence-number map.
    pub async fn shutdown(&self) -> Result<()> {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.accounting.shutdown();
        self.persistence
            .save_sequence_numbers(&self.store.sequence_snapshot())
            .await?;
        tracing::info!(node = %self.node_id(), "node stopped");
        Ok(())
    }

    /// Introduce ourselves to a newly connected peer.
    pub async fn greet(&self, peer: &NodeId) -> Result<()> {
        self.transport.send(peer, self.dispatcher.hello()).await?;
        Ok(())
    }

    /// A connection closed. `intended` is false for drops we did not ask for.
    pub fn on_peer_disconnected(&self, peer: &NodeId, intended: bool) {
        let backdated = self.store.on_disconnect(peer, intended);
        self.accounting.on_disconnect(peer);
        if backdated > 0 {
            tracing::debug!(%peer, backdated, "backdated entries of offline owner");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing our own payloads
    // ─────────────────────────────────────────────────────────────────────────

    pub fn publish(&self, payload: impl Into<StoragePayload>) -> AddResult {
        let entry = self.store.build_add(payload, &self.keypair);
        self.store.add(entry, None)
    }

    pub fn refresh(&self, key: &PayloadHash) -> RefreshResult {
        let mutation = self.store.build_refresh(key, &self.keypair);
        self.store.refresh(mutation, None)
    }

    pub fn withdraw(&self, key: &PayloadHash) -> RemoveResult {
        let mutation = self.store.build_remove(key, &self.keypair);
        self.store.remove(mutation, None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────────────────────────

    fn spawn_dispatch_loop(&self) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            loop {
                match transport.recv().await {
                    Ok((from, message)) => dispatcher.handle(from, message).await,
                    Err(e) => {
                        tracing::info!(error = %e, "transport closed, dispatch loop exiting");
                        break;
                    }
                }
            }
        })
    }

    /// Keep the ledger in step with the chain.
    fn spawn_balance_bridge(&self, mut events: broadcast::Receiver<ChainEvent>) -> JoinHandle<()> {
        let balances = Arc::clone(&self.balances);
        let accounting = Arc::clone(&self.accounting);
        tokio::spawn(async move {
            loop {
                let result = match events.recv().await {
                    Ok(ChainEvent::Appended(blocks)) => {
                        let mut balances = balances.write();
                        blocks
                            .iter()
                            .try_for_each(|block| balances.apply_block(block).map(drop))
                    }
                    Ok(ChainEvent::Purged { .. }) => {
                        balances.write().rebuild_from_genesis(&accounting.blocks()).map(drop)
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "balance bridge lagged, rebuilding");
                        balances.write().rebuild_from_genesis(&accounting.blocks()).map(drop)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to apply block to balances");
                }
            }
        })
    }

    /// Write persistable store changes through to the persistence layer.
    fn spawn_persistence_bridge(&self, mut events: broadcast::Receiver<StoreEvent>) -> JoinHandle<()> {
        let persistence = Arc::clone(&self.persistence);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            loop {
                let result = match events.recv().await {
                    Ok(StoreEvent::Added(entry)) if should_persist(&entry) => persistence.save_entry(&entry).await,
                    Ok(StoreEvent::Removed { entry, .. }) if should_persist(&entry) => {
                        persistence.delete_entry(&entry.key()).await
                    }
                    Ok(StoreEvent::Refreshed { key, .. }) => match store.get(&key) {
                        Some(entry) if should_persist(&entry) => persistence.save_entry(&entry).await,
                        _ => Ok(()),
                    },
                    Ok(StoreEvent::AppendOnlyAdded { hash, payload }) => {
                        persistence.save_append_only(&hash, &payload).await
                    }
                    Ok(_) => Ok(()),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "persistence bridge lagged, some changes not saved");
                        Ok(())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to persist store change");
                }
            }
        })
    }
}
