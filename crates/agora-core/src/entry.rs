//! Signed storage entries.
//!
//! A [`StorageEntry`] wraps a [`StoragePayload`] with the owner key, a sequence
//! number and a signature over `(hash(payload), sequence_number, owner key)`.
//! A mailbox entry is a storage entry whose payload is a
//! [`crate::MailboxPayload`]: its owner key is the receiver, but the add
//! signature comes from the sender named inside the payload.

use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::ValidationError;
use crate::payload::StoragePayload;
use crate::types::PayloadHash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub payload: StoragePayload,
    pub owner_public_key: Ed25519PublicKey,
    pub sequence_number: u64,
    pub signature: Ed25519Signature,
    /// Unix milliseconds. Reset by refresh; clamped to the receiver's clock.
    pub creation_timestamp: i64,
}

impl StorageEntry {
    pub fn key(&self) -> PayloadHash {
        self.payload.hash()
    }

    pub fn signing_message(&self) -> Vec<u8> {
        canonical::entry_signing_message(&self.key(), self.sequence_number, &self.owner_public_key)
    }

    /// Receiver key, for mailbox entries.
    pub fn receiver_public_key(&self) -> Option<&Ed25519PublicKey> {
        self.payload.as_mailbox().map(|m| &m.receiver)
    }

    /// Well-formed and signed by whoever may add this payload.
    pub fn is_valid_for_add(&self) -> Result<(), ValidationError> {
        self.payload.verify_integrity()?;
        if &self.owner_public_key != self.payload.owner_key() {
            return Err(ValidationError::OwnerMismatch);
        }
        self.payload
            .add_authority()
            .verify(&self.signing_message(), &self.signature)?;
        Ok(())
    }

    /// True once more than the payload's TTL has elapsed since creation.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        let ttl = i64::try_from(self.payload.ttl_ms()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.creation_timestamp) > ttl
    }

    /// A peer whose clock runs ahead must not extend the entry's lifetime.
    pub fn clamp_creation(&mut self, now_ms: i64) {
        if self.creation_timestamp > now_ms {
            self.creation_timestamp = now_ms;
        }
    }

    /// Move creation back by half the TTL.
    pub fn backdate(&mut self) {
        let half = i64::try_from(self.payload.ttl_ms() / 2).unwrap_or(i64::MAX);
        self.creation_timestamp = self.creation_timestamp.saturating_sub(half);
    }

    /// Metadata of a new operation must match what is stored for the key.
    pub fn matches_relevant_pub_key(&self, stored: &StorageEntry) -> bool {
        self.owner_public_key == stored.owner_public_key
            && self.receiver_public_key() == stored.receiver_public_key()
    }
}

/// Builds and signs a [`StorageEntry`].
///
/// For a mailbox payload the signing keypair must be the sender's.
pub struct EntryBuilder {
    payload: StoragePayload,
    sequence_number: u64,
    creation_timestamp: i64,
}

impl EntryBuilder {
    pub fn new(payload: impl Into<StoragePayload>) -> Self {
        Self {
            payload: payload.into(),
            sequence_number: 1,
            creation_timestamp: 0,
        }
    }

    pub fn sequence_number(mut self, seq: u64) -> Self {
        self.sequence_number = seq;
        self
    }

    pub fn timestamp(mut self, millis: i64) -> Self {
        self.creation_timestamp = millis;
        self
    }

    pub fn sign(self, keypair: &Keypair) -> StorageEntry {
        let owner_public_key = *self.payload.owner_key();
        let key = self.payload.hash();
        let message = canonical::entry_signing_message(&key, self.sequence_number, &owner_public_key);
        StorageEntry {
            payload: self.payload,
            owner_public_key,
            sequence_number: self.sequence_number,
            signature: keypair.sign(&message),
            creation_timestamp: self.creation_timestamp,
        }
    }
}

/// A refresh or remove of an existing key, signed by the entry's owner.
///
/// The owner key travels with the request so a remove can be authenticated
/// and recorded even when the entry itself has not been seen yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMutation {
    pub key: PayloadHash,
    pub sequence_number: u64,
    pub owner_public_key: Ed25519PublicKey,
    pub signature: Ed25519Signature,
}

impl SignedMutation {
    pub fn sign(key: PayloadHash, sequence_number: u64, owner: &Keypair) -> Self {
        let owner_public_key = owner.public_key();
        let message = canonical::entry_signing_message(&key, sequence_number, &owner_public_key);
        Self {
            key,
            sequence_number,
            owner_public_key,
            signature: owner.sign(&message),
        }
    }

    pub fn verify(&self) -> Result<(), ValidationError> {
        let message =
            canonical::entry_signing_message(&self.key, self.sequence_number, &self.owner_public_key);
        self.owner_public_key.verify(&message, &self.signature)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{MailboxPayload, ProtectedPayload, MAX_TTL_MS};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_expiry_and_backdate_never_overflow(
            created in any::<i64>(),
            ttl in 1..=MAX_TTL_MS,
            now in any::<i64>(),
        ) {
            let owner = Keypair::from_seed(&[1; 32]);
            let mut entry = EntryBuilder::new(ProtectedPayload::new(owner.public_key(), ttl, &b"o"[..]))
                .timestamp(created)
                .sign(&owner);
            let expired = entry.is_expired(now);
            entry.backdate();
            prop_assert!(entry.creation_timestamp <= created);
            // Backdating only ever brings expiry closer.
            prop_assert!(!expired || entry.is_expired(now));
        }

        #[test]
        fn prop_lives_exactly_ttl(created in -1_000_000_000_000i64..4_000_000_000_000, ttl in 1..=MAX_TTL_MS) {
            let owner = Keypair::from_seed(&[1; 32]);
            let entry = EntryBuilder::new(ProtectedPayload::new(owner.public_key(), ttl, &b"o"[..]))
                .timestamp(created)
                .sign(&owner);
            prop_assert!(!entry.is_expired(created + ttl as i64));
            prop_assert!(entry.is_expired(created + ttl as i64 + 1));
        }
    }

    #[test]
    fn test_owner_signed_entry_valid_for_add() {
        let owner = Keypair::from_seed(&[1; 32]);
        let entry = EntryBuilder::new(ProtectedPayload::new(owner.public_key(), 1_000, &b"o"[..]))
            .sequence_number(3)
            .sign(&owner);
        assert!(entry.is_valid_for_add().is_ok());
        assert_eq!(entry.owner_public_key, owner.public_key());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let owner = Keypair::from_seed(&[1; 32]);
        let thief = Keypair::from_seed(&[2; 32]);
        let entry = EntryBuilder::new(ProtectedPayload::new(owner.public_key(), 1_000, &b"o"[..]))
            .sign(&thief);
        assert_eq!(entry.is_valid_for_add(), Err(ValidationError::SignatureFailed));
    }

    #[test]
    fn test_sequence_number_is_signed() {
        let owner = Keypair::from_seed(&[1; 32]);
        let mut entry = EntryBuilder::new(ProtectedPayload::new(owner.public_key(), 1_000, &b"o"[..]))
            .sign(&owner);
        entry.sequence_number = 99;
        assert!(entry.is_valid_for_add().is_err());
    }

    #[test]
    fn test_mailbox_add_signed_by_sender() {
        let sender = Keypair::from_seed(&[1; 32]);
        let receiver = Keypair::from_seed(&[2; 32]);
        let payload = MailboxPayload::new(sender.public_key(), receiver.public_key(), &b"s"[..]);

        let by_sender = EntryBuilder::new(payload.clone()).sign(&sender);
        assert!(by_sender.is_valid_for_add().is_ok());
        assert_eq!(by_sender.owner_public_key, receiver.public_key());
        assert_eq!(by_sender.receiver_public_key(), Some(&receiver.public_key()));

        let by_receiver = EntryBuilder::new(payload).sign(&receiver);
        assert!(by_receiver.is_valid_for_add().is_err());
    }

    #[test]
    fn test_expiry_boundary() {
        let owner = Keypair::from_seed(&[1; 32]);
        let entry = EntryBuilder::new(ProtectedPayload::new(owner.public_key(), 1_000, &b"o"[..]))
            .timestamp(10_000)
            .sign(&owner);
        assert!(!entry.is_expired(10_999));
        assert!(!entry.is_expired(11_000));
        assert!(entry.is_expired(11_001));
    }

    #[test]
    fn test_clamp_and_backdate() {
        let owner = Keypair::from_seed(&[1; 32]);
        let mut entry = EntryBuilder::new(ProtectedPayload::new(owner.public_key(), 1_000, &b"o"[..]))
            .timestamp(50_000)
            .sign(&owner);
        entry.clamp_creation(20_000);
        assert_eq!(entry.creation_timestamp, 20_000);
        entry.clamp_creation(30_000);
        assert_eq!(entry.creation_timestamp, 20_000);
        entry.backdate();
        assert_eq!(entry.creation_timestamp, 19_500);
    }

    #[test]
    fn test_backdate_saturates_at_earliest_timestamp() {
        let owner = Keypair::from_seed(&[1; 32]);
        let mut payload = ProtectedPayload::new(owner.public_key(), 1_000, &b"o"[..]);
        payload.ttl_ms = u64::MAX;
        let mut entry = EntryBuilder::new(payload).timestamp(i64::MIN + 1).sign(&owner);
        entry.backdate();
        assert_eq!(entry.creation_timestamp, i64::MIN);
    }

    #[test]
    fn test_signed_mutation_verify() {
        let owner = Keypair::from_seed(&[1; 32]);
        let key = PayloadHash::from_bytes([5; 32]);
        let mut mutation = SignedMutation::sign(key, 2, &owner);
        assert!(mutation.verify().is_ok());
        mutation.sequence_number = 3;
        assert!(mutation.verify().is_err());
    }
}
