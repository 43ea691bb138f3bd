//! # Agora Core
//!
//! Pure primitives for Agora: the payload model, signed storage entries and
//! the oracle's accounting blocks.
//!
//! This crate does no I/O, storage or networking.
//!
//! ## Key Types
//!
//! - [`StoragePayload`] - An owned, expiring record (offer, proposal, mailbox message)
//! - [`AppendOnlyPayload`] - Immutable content-addressed data
//! - [`StorageEntry`] - A payload plus owner key, sequence number and signature
//! - [`SignedMutation`] - Owner-signed refresh or remove of an existing key
//! - [`AccountingBlock`] - One hash-linked block of the oracle's accounting chain
//! - [`Clock`] - Time source, swappable for tests
//!
//! ## Canonicalization
//!
//! Hashes and signatures are computed over deterministic CBOR. See [`canonical`].

pub mod block;
pub mod canonical;
pub mod clock;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod payload;
pub mod types;

pub use block::{AccountingBlock, AccountingTx, AccountingTxType, TxOutput};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use entry::{EntryBuilder, SignedMutation, StorageEntry};
pub use error::{CoreError, ValidationError};
pub use payload::{
    AppendOnlyPayload, MailboxPayload, PayloadCapability, ProtectedPayload, StoragePayload,
    DEFAULT_DATE_TOLERANCE_MS, MAILBOX_TTL_MS, MAX_PAYLOAD_BYTES, MAX_TTL_MS,
};
pub use types::{Capabilities, Capability, NodeId, PayloadHash};
