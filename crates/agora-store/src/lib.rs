//! # Agora Store
//!
//! The replicated key/value store every node keeps, plus durable backends.
//!
//! ## Overview
//!
//! [`ReplicatedStore`] holds signed, expiring [`agora_core::StorageEntry`]s
//! and immutable content-addressed payloads. Every mutation is checked
//! against the remembered sequence number for its key and the owner's
//! signature; accepted mutations are announced to local subscribers and
//! queued for re-broadcast to peers. Rejections are silent.
//!
//! Durable state goes through the [`Persistence`] trait, with
//! [`SqlitePersistence`] as the primary backend and [`MemoryPersistence`]
//! for tests.
//!
//! ## Key Types
//!
//! - [`ReplicatedStore`] - In-memory store with add/refresh/remove semantics
//! - [`AddResult`], [`RefreshResult`], [`RemoveResult`], [`AppendResult`] - Outcomes
//! - [`StoreEvent`] - Change notification delivered to subscribers
//! - [`Broadcaster`] - Sink for accepted mutations to forward to peers
//! - [`Persistence`] - Async interface for durable state
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agora_core::{Keypair, ProtectedPayload, SystemClock};
//! use agora_store::{NoopBroadcaster, ReplicatedStore, StoreConfig};
//!
//! let store = ReplicatedStore::new(
//!     StoreConfig::default(),
//!     Arc::new(SystemClock),
//!     Arc::new(NoopBroadcaster),
//! );
//! let owner = Keypair::generate();
//! let offer = ProtectedPayload::new(owner.public_key(), 60_000, &b"offer"[..]);
//! let entry = store.build_add(offer, &owner);
//! assert!(store.add(entry, None).is_added());
//! ```

pub mod error;
pub mod events;
pub mod exchange;
pub mod memory;
pub mod messages;
pub mod migration;
pub mod persistence;
pub mod replicated;
pub mod sequence;
pub mod sqlite;

pub use error::{Result, StoreError};
pub use events::{Broadcaster, NoopBroadcaster, Outbound, QueueBroadcaster, RemovalReason, StoreEvent};
pub use exchange::ExchangeSummary;
pub use memory::MemoryPersistence;
pub use messages::{GetDataRequest, GetDataResponse, StoreMessage};
pub use persistence::{should_persist, Persistence};
pub use replicated::{
    AddResult, AppendResult, PayloadFilter, RefreshResult, RejectReason, RemoveResult,
    ReplicatedStore, StoreConfig,
};
pub use sequence::{SequenceNumberMap, SequenceRecord, PURGE_AGE_MS};
pub use sqlite::SqlitePersistence;
