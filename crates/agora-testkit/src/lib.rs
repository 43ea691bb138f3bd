//! # Agora Testkit
//!
//! Testing utilities for Agora.
//!
//! ## Overview
//!
//! - **Fixtures**: a store on a manual clock, the development oracle, linked
//!   block chains, and started nodes on an in-memory network
//! - **Generators**: proptest strategies for entries, sequence-number
//!   arrivals, accounting transactions and chains
//!
//! ## Test Fixtures
//!
//! ```rust
//! use agora_testkit::fixtures::StoreFixture;
//!
//! let fixture = StoreFixture::new();
//! let entry = fixture.entry(fixture.payload(b"offer"), 1);
//! assert!(fixture.store.add(entry, None).is_added());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use agora_testkit::generators::block_chain;
//!
//! proptest! {
//!     #[test]
//!     fn chain_is_linked(blocks in block_chain(111, 20)) {
//!         prop_assert_eq!(blocks[0].height, 111);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    block_chain, eventually, month_start_ms, BlockChainBuilder, NetworkFixture, NodeHandle, OracleFixture,
    StoreFixture, ONE_HOUR_MS, T0,
};
