//! # Agora Mailbox
//!
//! Offline-tolerant messages on top of the replicated store.
//!
//! A mailbox entry may be added by its sender and removed only by its
//! receiver, so a message survives the sender going offline and stays in the
//! network until the receiver acknowledges it or its 15-day TTL lapses.
//!
//! ## Key Types
//!
//! - [`MailboxChannel`] - `send`, `acknowledge` and delivery of incoming messages
//! - [`MailboxIdentity`] / [`MailboxAddress`] - Signing plus encryption keys
//! - [`SealedEnvelope`] - X25519 + ChaCha20-Poly1305 encryption to one receiver
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agora_core::SystemClock;
//! use agora_mailbox::{MailboxChannel, MailboxConfig, MailboxIdentity};
//! use agora_store::{NoopBroadcaster, ReplicatedStore, StoreConfig};
//!
//! let store = Arc::new(ReplicatedStore::new(
//!     StoreConfig::default(),
//!     Arc::new(SystemClock),
//!     Arc::new(NoopBroadcaster),
//! ));
//! let alice = MailboxChannel::new(store.clone(), MailboxIdentity::generate(), MailboxConfig::default());
//! let bob = MailboxIdentity::generate();
//! let key = alice.send(&b"hello"[..], &bob.address()).unwrap();
//! ```

pub mod channel;
pub mod error;
pub mod message;
pub mod sealed;

pub use channel::{MailboxChannel, MailboxConfig};
pub use error::{MailboxError, Result};
pub use message::{MailboxAddress, MailboxIdentity, MailboxMessage, ReceivedMessage};
pub use sealed::{SealedEnvelope, X25519PublicKey, X25519StaticSecret};
