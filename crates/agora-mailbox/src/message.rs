//! Mailbox identities and the plaintext message.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use agora_core::{Blake3Hash, Ed25519PublicKey, Keypair, PayloadHash};

use crate::error::{MailboxError, Result};
use crate::sealed::{X25519PublicKey, X25519StaticSecret};

/// Where to deliver: the signing key owns the entry, the encryption key
/// seals the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxAddress {
    pub signing_key: Ed25519PublicKey,
    pub encryption_key: X25519PublicKey,
}

/// A node's mailbox keys.
pub struct MailboxIdentity {
    signing: Keypair,
    encryption: X25519StaticSecret,
}

impl MailboxIdentity {
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate())
    }

    /// The encryption secret is derived from the signing seed, so one seed
    /// restores both.
    pub fn from_keypair(signing: Keypair) -> Self {
        let derived = Blake3Hash::derive("agora mailbox v1 x25519", &signing.seed());
        Self {
            signing,
            encryption: X25519StaticSecret::from_bytes(*derived.as_bytes()),
        }
    }

    pub fn address(&self) -> MailboxAddress {
        MailboxAddress {
            signing_key: self.signing.public_key(),
            encryption_key: self.encryption.public_key(),
        }
    }

    pub fn signing_key(&self) -> &Keypair {
        &self.signing
    }

    pub(crate) fn encryption_secret(&self) -> &X25519StaticSecret {
        &self.encryption
    }
}

/// What the receiver sees after opening an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub sender: MailboxAddress,
    pub body: Bytes,
    /// Sender's clock, Unix milliseconds.
    pub sent_at: i64,
}

impl MailboxMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| MailboxError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| MailboxError::SerializationError(e.to_string()))
    }
}

/// A message delivered to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Store key of the entry; pass it to `acknowledge`.
    pub key: PayloadHash,
    pub uid: String,
    pub message: MailboxMessage,
}
