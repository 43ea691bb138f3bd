//! The payload model.
//!
//! Payloads compose a handful of orthogonal capabilities instead of a type
//! hierarchy. A payload's capabilities are queried with
//! [`StoragePayload::has_capability`] / [`AppendOnlyPayload::has_capability`]:
//!
//! | capability              | [`ProtectedPayload`] | [`MailboxPayload`] | [`AppendOnlyPayload`] |
//! |-------------------------|----------------------|--------------------|-----------------------|
//! | `Expirable`             | always               | always             | never                 |
//! | `Owned`                 | always               | always (receiver)  | never                 |
//! | `MailboxCapable`        | never                | always             | never                 |
//! | `ContentAddressed`      | never                | never              | always                |
//! | `CapabilityGated`       | if caps listed       | always (`MAILBOX`) | if caps listed        |
//! | `DateTolerant`          | never                | never              | if dated              |
//! | `AddOnce`               | if flagged           | never              | never                 |
//! | `RequiresOwnerOnline`   | if owner node set    | never              | never                 |
//! | `Persistable`           | if flagged           | always             | always                |
//! | `DateSortedTruncatable` | never                | never              | if flagged            |

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::crypto::{Blake3Hash, Ed25519PublicKey};
use crate::error::ValidationError;
use crate::types::{Capability, NodeId, PayloadHash};

/// Mailbox messages survive this long when undelivered: 15 days.
pub const MAILBOX_TTL_MS: u64 = 15 * 24 * 60 * 60 * 1000;

/// Longest lifetime any protected payload may ask for: 180 days.
pub const MAX_TTL_MS: u64 = 180 * 24 * 60 * 60 * 1000;

/// Upper bound on the opaque data carried by any payload.
pub const MAX_PAYLOAD_BYTES: usize = 200 * 1024;

/// Default skew tolerated for date-tolerant payloads: 2 hours.
pub const DEFAULT_DATE_TOLERANCE_MS: i64 = 2 * 60 * 60 * 1000;

/// Capability tags a payload may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadCapability {
    Expirable,
    Owned,
    MailboxCapable,
    ContentAddressed,
    CapabilityGated,
    DateTolerant,
    AddOnce,
    RequiresOwnerOnline,
    Persistable,
    DateSortedTruncatable,
}

/// An owned, expiring record such as an offer or a governance proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedPayload {
    /// Key allowed to add, refresh and remove this payload.
    pub owner: Ed25519PublicKey,
    pub ttl_ms: u64,
    pub data: Bytes,
    pub required_capabilities: Vec<Capability>,
    /// Once removed, the payload may never be added again.
    pub add_once: bool,
    /// When set, the payload is only meaningful while this node is connected.
    pub owner_node: Option<NodeId>,
    pub persistable: bool,
}

impl ProtectedPayload {
    pub fn new(owner: Ed25519PublicKey, ttl_ms: u64, data: impl Into<Bytes>) -> Self {
        Self {
            owner,
            ttl_ms,
            data: data.into(),
            required_capabilities: Vec::new(),
            add_once: false,
            owner_node: None,
            persistable: false,
        }
    }

    pub fn required_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities = caps.into_iter().collect();
        self
    }

    pub fn add_once(mut self) -> Self {
        self.add_once = true;
        self
    }

    pub fn owner_node(mut self, node: NodeId) -> Self {
        self.owner_node = Some(node);
        self
    }

    pub fn persistable(mut self) -> Self {
        self.persistable = true;
        self
    }
}

/// A store-and-forward message: the sender may add it, only the receiver may
/// remove it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxPayload {
    pub sender: Ed25519PublicKey,
    pub receiver: Ed25519PublicKey,
    /// Encrypted envelope; opaque to the store.
    pub sealed: Bytes,
    pub ttl_ms: u64,
}

impl MailboxPayload {
    pub fn new(sender: Ed25519PublicKey, receiver: Ed25519PublicKey, sealed: impl Into<Bytes>) -> Self {
        Self {
            sender,
            receiver,
            sealed: sealed.into(),
            ttl_ms: MAILBOX_TTL_MS,
        }
    }
}

/// Any payload that lives in a signed [`crate::StorageEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoragePayload {
    Protected(ProtectedPayload),
    Mailbox(MailboxPayload),
}

impl StoragePayload {
    /// The logical key.
    pub fn hash(&self) -> PayloadHash {
        Blake3Hash::hash(&canonical::payload_bytes(self)).into()
    }

    pub fn ttl_ms(&self) -> u64 {
        match self {
            StoragePayload::Protected(p) => p.ttl_ms,
            StoragePayload::Mailbox(m) => m.ttl_ms,
        }
    }

    /// Key that owns the entry and is allowed to remove it. For mailbox
    /// payloads this is the receiver.
    pub fn owner_key(&self) -> &Ed25519PublicKey {
        match self {
            StoragePayload::Protected(p) => &p.owner,
            StoragePayload::Mailbox(m) => &m.receiver,
        }
    }

    /// Key whose signature authorizes an add. For mailbox payloads this is
    /// the sender.
    pub fn add_authority(&self) -> &Ed25519PublicKey {
        match self {
            StoragePayload::Protected(p) => &p.owner,
            StoragePayload::Mailbox(m) => &m.sender,
        }
    }

    pub fn required_capabilities(&self) -> &[Capability] {
        const MAILBOX_CAPS: &[Capability] = &[Capability::MAILBOX];
        match self {
            StoragePayload::Protected(p) => &p.required_capabilities,
            StoragePayload::Mailbox(_) => MAILBOX_CAPS,
        }
    }

    pub fn owner_node(&self) -> Option<&NodeId> {
        match self {
            StoragePayload::Protected(p) => p.owner_node.as_ref(),
            StoragePayload::Mailbox(_) => None,
        }
    }

    pub fn has_capability(&self, capability: PayloadCapability) -> bool {
        use PayloadCapability::*;
        match (self, capability) {
            (_, Expirable | Owned) => true,
            (StoragePayload::Mailbox(_), MailboxCapable | CapabilityGated | Persistable) => true,
            (StoragePayload::Protected(p), CapabilityGated) => !p.required_capabilities.is_empty(),
            (StoragePayload::Protected(p), AddOnce) => p.add_once,
            (StoragePayload::Protected(p), RequiresOwnerOnline) => p.owner_node.is_some(),
            (StoragePayload::Protected(p), Persistable) => p.persistable,
            _ => false,
        }
    }

    /// Structural checks that do not depend on signatures or local state.
    pub fn verify_integrity(&self) -> Result<(), ValidationError> {
        let ttl_ms = self.ttl_ms();
        if ttl_ms == 0 {
            return Err(ValidationError::InvalidTtl);
        }
        let limit_ms = match self {
            StoragePayload::Protected(_) => MAX_TTL_MS,
            StoragePayload::Mailbox(_) => MAILBOX_TTL_MS,
        };
        if ttl_ms > limit_ms {
            return Err(ValidationError::TtlTooLong { ttl_ms, limit_ms });
        }
        let size = match self {
            StoragePayload::Protected(p) => p.data.len(),
            StoragePayload::Mailbox(m) => m.sealed.len(),
        };
        if size > MAX_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        Ok(())
    }

    pub fn as_mailbox(&self) -> Option<&MailboxPayload> {
        match self {
            StoragePayload::Mailbox(m) => Some(m),
            StoragePayload::Protected(_) => None,
        }
    }
}

impl From<ProtectedPayload> for StoragePayload {
    fn from(p: ProtectedPayload) -> Self {
        StoragePayload::Protected(p)
    }
}

impl From<MailboxPayload> for StoragePayload {
    fn from(m: MailboxPayload) -> Self {
        StoragePayload::Mailbox(m)
    }
}

/// Immutable content-addressed data (trade statistics, account witnesses).
/// Identity is the hash of its content; it is never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOnlyPayload {
    pub data: Bytes,
    /// Embedded creation date; present only for date-tolerant payloads.
    pub date_ms: Option<i64>,
    pub required_capabilities: Vec<Capability>,
    /// When answering a bulk request, these are sent last, newest first kept.
    pub date_sorted_truncatable: bool,
}

impl AppendOnlyPayload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            date_ms: None,
            required_capabilities: Vec::new(),
            date_sorted_truncatable: false,
        }
    }

    pub fn dated(mut self, date_ms: i64) -> Self {
        self.date_ms = Some(date_ms);
        self
    }

    pub fn date_sorted_truncatable(mut self) -> Self {
        self.date_sorted_truncatable = true;
        self
    }

    pub fn required_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities = caps.into_iter().collect();
        self
    }

    pub fn hash(&self) -> PayloadHash {
        Blake3Hash::hash(&canonical::append_only_bytes(self)).into()
    }

    pub fn has_capability(&self, capability: PayloadCapability) -> bool {
        use PayloadCapability::*;
        match capability {
            ContentAddressed | Persistable => true,
            CapabilityGated => !self.required_capabilities.is_empty(),
            DateTolerant => self.date_ms.is_some(),
            DateSortedTruncatable => self.date_sorted_truncatable,
            _ => false,
        }
    }

    /// Size bounds plus agreement between the claimed key and the content.
    pub fn verify_integrity(&self, claimed: &PayloadHash) -> Result<(), ValidationError> {
        if self.data.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        if self.data.len() > MAX_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge {
                size: self.data.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        let computed = self.hash();
        if &computed != claimed {
            return Err(ValidationError::HashMismatch {
                claimed: claimed.to_hex(),
                computed: computed.to_hex(),
            });
        }
        Ok(())
    }

    /// Undated payloads are always within tolerance.
    pub fn is_within_date_tolerance(&self, now_ms: i64, skew_ms: i64) -> bool {
        match self.date_ms {
            Some(date) => (now_ms - date).abs() <= skew_ms,
            None => true,
        }
    }
}
