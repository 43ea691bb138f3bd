//! # Agora
//!
//! A node of a replicated, signed, peer-to-peer data store.
//!
//! ## Overview
//!
//! Every node holds the same set of small signed payloads and keeps it in
//! step with its peers by gossip:
//!
//! - **Store**: owner-signed, expiring entries guarded by per-key sequence
//!   numbers, plus content-addressed append-only data
//! - **Mailbox**: sealed messages for one receiver, carried by the store
//! - **Accounting**: an oracle-signed block feed, backfilled on demand
//! - **Ledger**: per-recipient balances folded from the accounting blocks
//!
//! [`Node`] wires those together over a [`sync::Transport`] and a
//! [`store::Persistence`] layer.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use agora::{init_tracing, open_persistence, Node, NodeConfig};
//! use agora::sync::MemoryNetwork;
//! use agora::core::NodeId;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let config = NodeConfig::load("agora.json")?;
//!     init_tracing(&config.log)?;
//!
//!     let network = MemoryNetwork::new();
//!     let transport = network
//!         .create_transport(NodeId::from_bytes([1; 32]), config.capabilities.clone())
//!         .await;
//!     let transport = Arc::new(transport);
//!
//!     let node = Node::new(config.clone(), transport, open_persistence(&config)?)?;
//!     node.start().await?;
//!
//!     let balances = node.balances();
//!     println!("distributed: {} sats", balances.total_distributed_btc());
//!     drop(balances);
//!
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `agora::core` - payloads, entries, keys, accounting blocks
//! - `agora::store` - the replicated store and persistence
//! - `agora::mailbox` - the mailbox channel
//! - `agora::sync` - wire messages, transport, accounting sync
//! - `agora::ledger` - balance aggregation

pub mod config;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod telemetry;

pub use agora_core as core;
pub use agora_ledger as ledger;
pub use agora_mailbox as mailbox;
pub use agora_store as store;
pub use agora_sync as sync;

pub use config::{AccountingSettings, MailboxSettings, Network, NodeConfig, StoreSettings};
pub use dispatch::Dispatcher;
pub use error::{NodeError, Result};
pub use node::{open_persistence, Node};
pub use telemetry::{init_tracing, LogConfig, LogFormat};

pub use agora_core::{
    AccountingBlock, Capabilities, Capability, Keypair, MailboxPayload, NodeId, PayloadHash,
    ProtectedPayload, StoragePayload,
};
