//! Sealed envelopes: a mailbox body encrypted to one receiver.
//!
//! The sender generates a one-time X25519 key, agrees a secret with the
//! receiver's static encryption key and derives a ChaCha20-Poly1305 key from
//! it with Blake3. Only the ephemeral public key, the nonce, the ciphertext
//! and a random uid travel in the clear.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{MailboxError, Result};

const KEY_CONTEXT: &str = "agora mailbox v1 sealing key";

/// An X25519 public key (32 bytes), used only for key agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey(pub [u8; 32]);

impl X25519PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(pk: PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

/// The receiver's long-lived decryption secret.
pub struct X25519StaticSecret(StaticSecret);

impl X25519StaticSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(StaticSecret::from(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn public_key(&self) -> X25519PublicKey {
        PublicKey::from(&self.0).into()
    }
}

/// The wire form of a sealed mailbox body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Random id; lets a receiver remember envelopes it could not open.
    pub uid: String,
    pub ephemeral_public: X25519PublicKey,
    pub nonce: [u8; 12],
    /// Includes the Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

fn derive_key(shared: &[u8; 32], ephemeral: &X25519PublicKey, receiver: &X25519PublicKey) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(KEY_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(receiver.as_bytes());
    *hasher.finalize().as_bytes()
}

pub fn new_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl SealedEnvelope {
    /// Encrypt `plaintext` so only the holder of `receiver`'s secret can read it.
    pub fn seal(plaintext: &[u8], receiver: &X25519PublicKey) -> Result<Self> {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let ephemeral_public = X25519PublicKey::from(PublicKey::from(&secret));
        let shared = secret.diffie_hellman(&receiver.to_dalek());
        let key = derive_key(shared.as_bytes(), &ephemeral_public, receiver);

        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| MailboxError::EncryptionError(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| MailboxError::EncryptionError(e.to_string()))?;

        Ok(Self {
            uid: new_uid(),
            ephemeral_public,
            nonce,
            ciphertext,
        })
    }

    pub fn open(&self, secret: &X25519StaticSecret) -> Result<Vec<u8>> {
        let shared = secret.0.diffie_hellman(&self.ephemeral_public.to_dalek());
        let key = derive_key(shared.as_bytes(), &self.ephemeral_public, &secret.public_key());
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| MailboxError::DecryptionError(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|e| MailboxError::DecryptionError(e.to_string()))
    }

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
