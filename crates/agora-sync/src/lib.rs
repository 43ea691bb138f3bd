//! # Agora Sync
//!
//! Everything that moves between peers: the wire messages, the transport
//! seam, gossip of store mutations, and the oracle-fed accounting chain.
//!
//! ## Overview
//!
//! - [`GossipRelay`] drains the store's outbox and forwards each accepted
//!   mutation to every connected peer that advertises the payload's
//!   required capabilities, skipping the peer it came from.
//! - [`AccountingSync`] keeps a strictly linear chain of oracle-signed
//!   blocks. New blocks arrive by broadcast; gaps are filled by asking a
//!   peer for every block from a height onward.
//! - [`Oracle`] decides which key may sign blocks and checks signatures.
//!   With no key configured the accounting feed is off.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agora_core::{Capabilities, Capability, NodeId};
//! use agora_sync::{AccountingConfig, AccountingSync, MemoryNetwork, Oracle, OracleConfig};
//!
//! # async fn example() -> agora_sync::Result<()> {
//! let network = MemoryNetwork::new();
//! let me = NodeId::from_bytes([1; 32]);
//! let transport = Arc::new(
//!     network
//!         .create_transport(me, Capabilities::new([Capability::ACCOUNTING]))
//!         .await,
//! );
//!
//! let oracle = Arc::new(Oracle::from_config(&OracleConfig::default())?);
//! let sync = Arc::new(AccountingSync::new(AccountingConfig::regtest(), oracle, transport, None));
//! sync.request_backfill(sync.last_height() + 1, NodeId::from_bytes([2; 32])).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backfill Flow
//!
//! ```text
//! Node                                 Oracle node
//!   |-- GetAccountingBlocksRequest ----->|   (from_height, nonce)
//!   |<- GetAccountingBlocksResponse -----|   (blocks, nonce, batch signature)
//!   |                                    |
//!   |<- NewAccountingBlockBroadcast -----|   (block, oracle key, signature)
//! ```

pub mod accounting;
pub mod chain;
pub mod error;
pub mod gossip;
pub mod handlers;
pub mod messages;
pub mod oracle;
pub mod transport;

pub use accounting::{AccountingConfig, AccountingSync, BackfillSummary, BlockOutcome, ChainEvent};
pub use chain::{
    AccountingChain, ChainError, HeightState, DEFAULT_PURGE_COUNT, MAINNET_EARLIEST_HEIGHT,
    REGTEST_EARLIEST_HEIGHT,
};
pub use error::{Result, SyncError};
pub use gossip::GossipRelay;
pub use handlers::{LoggingFaultHandler, PeerFaultHandler};
pub use messages::{limits, WireMessage, PROTOCOL_VERSION};
pub use oracle::{
    Oracle, OracleConfig, DEV_ORACLE_PUBLIC_KEY_HEX, DEV_ORACLE_SEED_HEX, PERMITTED_ORACLE_KEYS,
};
pub use transport::{memory::MemoryNetwork, memory::MemoryTransport, Transport};
