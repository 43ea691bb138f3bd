//! Identifier newtypes.
//!
//! Payload keys and peer identities are distinct types so one can never be
//! passed where the other is expected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::crypto::Blake3Hash;

/// The logical key of a stored payload: Blake3 of its canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PayloadHash(pub [u8; 32]);

impl PayloadHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Blake3Hash::from_hex(s).map(Self::from)
    }
}

impl fmt::Debug for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for PayloadHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Blake3Hash> for PayloadHash {
    fn from(hash: Blake3Hash) -> Self {
        Self(hash.0)
    }
}

impl TryFrom<&[u8]> for PayloadHash {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into()?))
    }
}

/// Identity of a peer connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// A random node id.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

/// A protocol feature a peer may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability(pub u16);

impl Capability {
    pub const SEED_NODE: Self = Self(0);
    pub const MAILBOX: Self = Self(1);
    /// Receives accounting block broadcasts.
    pub const ACCOUNTING: Self = Self(2);
    pub const PROPOSAL: Self = Self(3);
    pub const TRADE_STATISTICS: Self = Self(4);
    /// Answers accounting block requests. Only a node holding a permitted
    /// oracle key advertises it.
    pub const ACCOUNTING_PROVIDER: Self = Self(5);
}

/// The set of capabilities a peer has advertised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    /// No capabilities at all (a legacy peer).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap);
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// True if every capability in `required` is advertised.
    pub fn contains_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|cap| self.0.contains(cap))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }
}
