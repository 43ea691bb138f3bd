//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use agora::{Node, NodeConfig};
use agora_core::{
    AccountingBlock, AccountingTx, AccountingTxType, Blake3Hash, Capabilities, Capability, Clock,
    EntryBuilder, Keypair, ManualClock, NodeId, ProtectedPayload, StorageEntry, TxOutput,
};
use agora_store::{MemoryPersistence, Outbound, Persistence, QueueBroadcaster, ReplicatedStore, StoreConfig};
use agora_sync::{
    MemoryNetwork, MemoryTransport, Oracle, OracleConfig, WireMessage, DEV_ORACLE_PUBLIC_KEY_HEX,
    REGTEST_EARLIEST_HEIGHT,
};

/// 2022-01-01T00:00:00Z.
pub const T0: i64 = 1_640_995_200_000;

pub const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// A store on a manual clock with its outbox kept for inspection.
pub struct StoreFixture {
    pub clock: Arc<ManualClock>,
    pub store: Arc<ReplicatedStore>,
    pub owner: Keypair,
    pub outbox: mpsc::UnboundedReceiver<Outbound>,
}

impl StoreFixture {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let (broadcaster, outbox) = QueueBroadcaster::channel();
        let store = Arc::new(ReplicatedStore::new(config, clock.clone(), Arc::new(broadcaster)));
        Self {
            clock,
            store,
            owner: Keypair::from_seed(&[7; 32]),
            outbox,
        }
    }

    /// A one-hour protected payload owned by the fixture's key.
    pub fn payload(&self, data: &[u8]) -> ProtectedPayload {
        ProtectedPayload::new(self.owner.public_key(), ONE_HOUR_MS, data.to_vec())
    }

    /// An entry for `payload` at `seq`, stamped with the current clock.
    pub fn entry(&self, payload: ProtectedPayload, seq: u64) -> StorageEntry {
        EntryBuilder::new(payload)
            .sequence_number(seq)
            .timestamp(self.clock.now_millis())
            .sign(&self.owner)
    }

    pub fn advance(&self, millis: i64) {
        self.clock.advance(millis);
    }

    /// Everything queued for peers since the last call.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        let mut drained = Vec::new();
        while let Ok(outbound) = self.outbox.try_recv() {
            drained.push(outbound);
        }
        drained
    }
}

impl Default for StoreFixture {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Oracle
// ─────────────────────────────────────────────────────────────────────────────

/// The development oracle, as publisher and as verifier.
pub struct OracleFixture;

impl OracleFixture {
    pub fn publisher_config() -> OracleConfig {
        OracleConfig {
            use_dev_key: true,
            ..OracleConfig::default()
        }
    }

    pub fn verifier_config() -> OracleConfig {
        OracleConfig {
            public_key_hex: Some(DEV_ORACLE_PUBLIC_KEY_HEX.to_string()),
            ..OracleConfig::default()
        }
    }

    pub fn publisher() -> Oracle {
        Oracle::from_config(&Self::publisher_config()).expect("dev oracle key is valid")
    }

    pub fn verifier() -> Oracle {
        Oracle::from_config(&Self::verifier_config()).expect("dev oracle key is valid")
    }

    /// The broadcast a publishing oracle would send for `block`.
    pub fn broadcast(block: &AccountingBlock) -> WireMessage {
        let oracle = Self::publisher();
        WireMessage::NewAccountingBlockBroadcast {
            block: block.clone(),
            oracle_pub_key: oracle.public_key().expect("publisher has a key"),
            signature: oracle.sign_block(block).expect("publisher can sign"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Blocks
// ─────────────────────────────────────────────────────────────────────────────

/// Millisecond timestamp of the first instant of `year`-`month` (UTC).
pub fn month_start_ms(year: i32, month: u32) -> i64 {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp_millis())
        .unwrap_or_default()
}

/// Empty linked blocks covering `from..=to`.
pub fn block_chain(from: u64, to: u64) -> Vec<AccountingBlock> {
    let mut builder = BlockChainBuilder::starting_at(from);
    for _ in from..=to {
        builder = builder.next_block(T0);
    }
    builder.build()
}

/// Builds a linked chain block by block.
///
/// ```rust
/// use agora_testkit::fixtures::{month_start_ms, BlockChainBuilder};
///
/// let blocks = BlockChainBuilder::starting_at(111)
///     .next_block(month_start_ms(2021, 3))
///     .btc_fee("alice", 50_000)
///     .payout("bob", 20_000)
///     .build();
/// assert_eq!(blocks.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct BlockChainBuilder {
    next_height: u64,
    previous_hash: Blake3Hash,
    pending: Option<(u64, i64, Vec<AccountingTx>)>,
    blocks: Vec<AccountingBlock>,
    tx_counter: u64,
}

impl BlockChainBuilder {
    pub fn starting_at(height: u64) -> Self {
        Self::after(height, Blake3Hash::ZERO)
    }

    pub fn regtest() -> Self {
        Self::starting_at(REGTEST_EARLIEST_HEIGHT)
    }

    /// Continue an existing chain whose tip is at `height - 1` with `tip_hash`.
    pub fn after(height: u64, tip_hash: Blake3Hash) -> Self {
        Self {
            next_height: height,
            previous_hash: tip_hash,
            pending: None,
            blocks: Vec::new(),
            tx_counter: 0,
        }
    }

    /// Close the current block and open the next one.
    pub fn next_block(mut self, timestamp: i64) -> Self {
        self.seal();
        self.pending = Some((self.next_height, timestamp, Vec::new()));
        self.next_height += 1;
        self
    }

    pub fn btc_fee(self, recipient: &str, sats: u64) -> Self {
        self.tx(AccountingTxType::BtcTradeFee, recipient, sats)
    }

    pub fn payout(self, recipient: &str, sats: u64) -> Self {
        self.tx(AccountingTxType::DistributedPayout, recipient, sats)
    }

    fn tx(mut self, tx_type: AccountingTxType, recipient: &str, sats: u64) -> Self {
        self.tx_counter += 1;
        let tx_id = format!("{:08x}{}", self.tx_counter, "ab".repeat(28));
        if let Some((_, _, txs)) = self.pending.as_mut() {
            txs.push(AccountingTx::new(tx_id, tx_type, vec![TxOutput::new(recipient, sats)]));
        }
        self
    }

    fn seal(&mut self) {
        if let Some((height, timestamp, txs)) = self.pending.take() {
            let block = AccountingBlock::new(height, self.previous_hash, timestamp, txs);
            self.previous_hash = block.hash;
            self.blocks.push(block);
        }
    }

    pub fn build(mut self) -> Vec<AccountingBlock> {
        self.seal();
        self.blocks
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

/// Nodes on one in-memory network.
pub struct NetworkFixture {
    pub network: Arc<MemoryNetwork>,
}

/// A started node with the handles tests poke at.
pub struct NodeHandle {
    pub id: NodeId,
    pub node: Node,
    pub clock: Arc<ManualClock>,
    pub persistence: Arc<MemoryPersistence>,
}

impl NetworkFixture {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
        }
    }

    /// A regtest config. `oracle` selects the publishing oracle key.
    pub fn config(seed: u8, oracle: bool) -> NodeConfig {
        let mut config = NodeConfig::regtest();
        config.node_seed_hex = Some(format!("{:02x}", seed).repeat(32));
        config.capabilities = Capabilities::new([Capability::MAILBOX, Capability::ACCOUNTING]);
        config.accounting.retry_delay_secs = 1;
        if oracle {
            config.oracle = OracleFixture::publisher_config();
        }
        config
    }

    pub async fn spawn(&self, seed: u8, config: NodeConfig) -> NodeHandle {
        self.spawn_with(seed, config, Arc::new(MemoryPersistence::new())).await
    }

    /// Start a node on existing persistence, as after a restart.
    pub async fn spawn_with(&self, seed: u8, config: NodeConfig, persistence: Arc<MemoryPersistence>) -> NodeHandle {
        let id = NodeId::from_bytes([seed; 32]);
        let transport: Arc<MemoryTransport> =
            Arc::new(self.network.create_transport(id, config.advertised_capabilities()).await);
        let clock = Arc::new(ManualClock::new(T0));
        let node = Node::with_clock(
            config,
            transport,
            persistence.clone() as Arc<dyn Persistence>,
            clock.clone(),
        )
        .expect("valid fixture config");
        node.start().await.expect("node starts");
        NodeHandle {
            id,
            node,
            clock,
            persistence,
        }
    }

    /// Both sides say hello, as on a new connection.
    pub async fn connect(&self, a: &NodeHandle, b: &NodeHandle) {
        a.node.greet(&b.id).await.expect("greet");
        b.node.greet(&a.id).await.expect("greet");
    }
}

impl Default for NetworkFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `check` until it holds, yielding between attempts.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    check()
}
