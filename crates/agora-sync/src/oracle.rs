//! Oracle keys: who may mint accounting blocks, and signature checks.
//!
//! Holding a keypair is not enough to publish. The public key must also be
//! on the permitted list, otherwise anyone could mint a self-signed chain.
//! With no key configured the accounting feed is simply off: verification
//! refuses everything and publishing does nothing.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use agora_core::{canonical, AccountingBlock, CoreError, Ed25519PublicKey, Ed25519Signature, Keypair};

use crate::error::{Result, SyncError};

/// Seed of the well-known development oracle. Never permitted on mainnet
/// unless `use_dev_key` is set.
pub const DEV_ORACLE_SEED_HEX: &str =
    "782c0452c8a4798b362e3099c3f8cedccd5388bfc10a7bf4c9c69072fa3bc04a";

pub const DEV_ORACLE_PUBLIC_KEY_HEX: &str =
    "fb3cdf322298d4e2555134c03f4222e566097e4cdcecc9d0bc757829eddf29a7";

/// Keys allowed to sign accounting blocks.
pub const PERMITTED_ORACLE_KEYS: &[&str] = &[
    "010806e3f1a838da2d95d3dd44ce60998857b78433496734a39a62c85cf39776",
    DEV_ORACLE_PUBLIC_KEY_HEX,
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Present only on the oracle node itself.
    pub keypair_seed_hex: Option<String>,
    /// Key to verify blocks against. Derived from the seed if omitted.
    pub public_key_hex: Option<String>,
    /// Use the development keypair instead of the configured one.
    pub use_dev_key: bool,
    /// Added to [`PERMITTED_ORACLE_KEYS`].
    pub permitted_keys: Vec<String>,
}

impl OracleConfig {
    /// Whether these settings hold a permitted signing key, without
    /// building the [`Oracle`].
    pub fn can_publish(&self) -> bool {
        let seed = if self.use_dev_key {
            Some(DEV_ORACLE_SEED_HEX)
        } else {
            self.keypair_seed_hex.as_deref()
        };
        let Some(Ok(keypair)) = seed.map(Keypair::from_seed_hex) else {
            return false;
        };
        let key = keypair.public_key().to_hex();
        PERMITTED_ORACLE_KEYS.contains(&key.as_str())
            || self.permitted_keys.iter().any(|k| k.eq_ignore_ascii_case(&key))
    }
}

pub struct Oracle {
    public_key: Option<Ed25519PublicKey>,
    keypair: Option<Keypair>,
    permitted: Vec<Ed25519PublicKey>,
    disabled_logged: AtomicBool,
}

impl Oracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self> {
        let keypair = if config.use_dev_key {
            Some(Keypair::from_seed_hex(DEV_ORACLE_SEED_HEX)?)
        } else {
            config
                .keypair_seed_hex
                .as_deref()
                .map(Keypair::from_seed_hex)
                .transpose()?
        };

        let public_key = match (&config.public_key_hex, &keypair) {
            (Some(hex), _) if !config.use_dev_key => {
                Some(Ed25519PublicKey::from_hex(hex).map_err(CoreError::from)?)
            }
            (_, Some(kp)) => Some(kp.public_key()),
            (_, None) => None,
        };

        let permitted = PERMITTED_ORACLE_KEYS
            .iter()
            .copied()
            .chain(config.permitted_keys.iter().map(String::as_str))
            .map(|hex| Ed25519PublicKey::from_hex(hex).map_err(CoreError::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let oracle = Self {
            public_key,
            keypair,
            permitted,
            disabled_logged: AtomicBool::new(false),
        };
        match oracle.public_key {
            Some(key) if oracle.is_permitted_pub_key(&key) => {
                tracing::info!(oracle = %key, publishing = oracle.keypair.is_some(), "accounting oracle configured");
            }
            Some(key) => tracing::warn!(oracle = %key, "configured oracle key is not permitted"),
            None => {}
        }
        Ok(oracle)
    }

    /// An oracle with nothing configured.
    pub fn disabled() -> Self {
        Self {
            public_key: None,
            keypair: None,
            permitted: Vec::new(),
            disabled_logged: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn public_key(&self) -> Option<Ed25519PublicKey> {
        self.public_key
    }

    pub fn is_permitted_pub_key(&self, key: &Ed25519PublicKey) -> bool {
        self.permitted.contains(key)
    }

    /// True on the oracle node with a permitted key.
    pub fn can_publish(&self) -> bool {
        self.keypair
            .as_ref()
            .map_or(false, |kp| self.is_permitted_pub_key(&kp.public_key()))
    }

    fn publishing_key(&self) -> Option<&Keypair> {
        if !self.can_publish() {
            self.log_disabled_once();
            return None;
        }
        self.keypair.as_ref()
    }

    pub fn sign_block(&self, block: &AccountingBlock) -> Option<Ed25519Signature> {
        self.publishing_key()
            .map(|kp| kp.sign(&canonical::block_signing_message(&block.hash)))
    }

    pub fn sign_batch(&self, nonce: u64, blocks: &[AccountingBlock]) -> Option<Ed25519Signature> {
        self.publishing_key()
            .map(|kp| kp.sign(&canonical::batch_signing_message(nonce, blocks)))
    }

    /// Check a broadcast block: the claimed key must be ours and permitted,
    /// and the signature must cover the block hash.
    pub fn verify_block(
        &self,
        block: &AccountingBlock,
        claimed_key: &Ed25519PublicKey,
        signature: &Ed25519Signature,
    ) -> Result<()> {
        let key = self.verifying_key()?;
        if claimed_key != &key {
            return Err(SyncError::OracleNotPermitted(claimed_key.to_hex()));
        }
        key.verify(&canonical::block_signing_message(&block.hash), signature)
            .map_err(|_| SyncError::OracleSignatureInvalid)
    }

    pub fn verify_batch(
        &self,
        nonce: u64,
        blocks: &[AccountingBlock],
        signature: &Ed25519Signature,
    ) -> Result<()> {
        let key = self.verifying_key()?;
        key.verify(&canonical::batch_signing_message(nonce, blocks), signature)
            .map_err(|_| SyncError::OracleSignatureInvalid)
    }

    fn verifying_key(&self) -> Result<Ed25519PublicKey> {
        let Some(key) = self.public_key else {
            self.log_disabled_once();
            return Err(SyncError::OracleDisabled);
        };
        if !self.is_permitted_pub_key(&key) {
            return Err(SyncError::OracleNotPermitted(key.to_hex()));
        }
        Ok(key)
    }

    fn log_disabled_once(&self) {
        if !self.disabled_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!("no permitted oracle key configured, accounting feed disabled");
        }
    }
}
