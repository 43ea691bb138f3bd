//! Node configuration, loadable from a JSON file.
//!
//! Durations are plain numbers with the unit in the field name. Every field
//! has a default, so `{}` is a valid (mainnet, verify-nothing) config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use agora_core::{Capabilities, Capability, Keypair, DEFAULT_DATE_TOLERANCE_MS, MAILBOX_TTL_MS, MAX_TTL_MS};
use agora_mailbox::MailboxConfig;
use agora_store::StoreConfig;
use agora_sync::{AccountingConfig, OracleConfig, MAINNET_EARLIEST_HEIGHT, REGTEST_EARLIEST_HEIGHT};

use crate::telemetry::LogConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Regtest,
}

impl Network {
    pub fn earliest_accounting_height(self) -> u64 {
        match self {
            Network::Mainnet => MAINNET_EARLIEST_HEIGHT,
            Network::Regtest => REGTEST_EARLIEST_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub sweep_interval_secs: u64,
    pub max_sequence_map_size: usize,
    pub date_tolerance_ms: i64,
    pub max_get_data_entries: usize,
    /// Payloads asking to live longer are rejected.
    pub max_ttl_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            max_sequence_map_size: 1_000,
            date_tolerance_ms: DEFAULT_DATE_TOLERANCE_MS,
            max_get_data_entries: 10_000,
            max_ttl_ms: MAX_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxSettings {
    pub ttl_ms: u64,
    pub republish_on_start: bool,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            ttl_ms: MAILBOX_TTL_MS,
            republish_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingSettings {
    /// Overrides the network's earliest height.
    pub earliest_height: Option<u64>,
    pub response_timeout_secs: u64,
    pub stale_handler_cleanup_secs: u64,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    pub max_buffered: usize,
}

impl Default for AccountingSettings {
    fn default() -> Self {
        Self {
            earliest_height: None,
            response_timeout_secs: 180,
            stale_handler_cleanup_secs: 120,
            retry_delay_secs: 10,
            max_retries: 3,
            max_buffered: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    /// Seed of the node's signing key (owner key for its payloads and its
    /// mailbox identity). A fresh key is generated when absent.
    pub node_seed_hex: Option<String>,
    /// Advertised to peers in `Hello`. See
    /// [`advertised_capabilities`](Self::advertised_capabilities).
    pub capabilities: Capabilities,
    /// SQLite file; in-memory persistence when absent.
    pub database_path: Option<PathBuf>,
    pub store: StoreSettings,
    pub mailbox: MailboxSettings,
    pub accounting: AccountingSettings,
    pub oracle: OracleConfig,
    pub log: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            node_seed_hex: None,
            capabilities: Capabilities::new([Capability::MAILBOX, Capability::ACCOUNTING]),
            database_path: None,
            store: StoreSettings::default(),
            mailbox: MailboxSettings::default(),
            accounting: AccountingSettings::default(),
            oracle: OracleConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// A regtest config using the development oracle key.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            oracle: OracleConfig {
                public_key_hex: Some(agora_sync::DEV_ORACLE_PUBLIC_KEY_HEX.to_string()),
                ..OracleConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn keypair(&self) -> anyhow::Result<Keypair> {
        match &self.node_seed_hex {
            Some(seed) => Keypair::from_seed_hex(seed).context("node_seed_hex"),
            None => Ok(Keypair::generate()),
        }
    }

    /// [`capabilities`](Self::capabilities) plus
    /// [`Capability::ACCOUNTING_PROVIDER`] exactly when the oracle settings
    /// hold a permitted signing key.
    pub fn advertised_capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::new(
            self.capabilities
                .iter()
                .copied()
                .filter(|cap| *cap != Capability::ACCOUNTING_PROVIDER),
        );
        if self.oracle.can_publish() {
            capabilities.insert(Capability::ACCOUNTING_PROVIDER);
        }
        capabilities
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            sweep_interval: Duration::from_secs(self.store.sweep_interval_secs.max(1)),
            max_sequence_map_size: self.store.max_sequence_map_size,
            date_tolerance_ms: self.store.date_tolerance_ms,
            max_get_data_entries: self.store.max_get_data_entries,
            max_ttl_ms: self.store.max_ttl_ms.min(MAX_TTL_MS),
            ..StoreConfig::default()
        }
    }

    pub fn mailbox_config(&self) -> MailboxConfig {
        MailboxConfig {
            ttl_ms: self.mailbox.ttl_ms.min(MAILBOX_TTL_MS),
            republish_on_start: self.mailbox.republish_on_start,
            ..MailboxConfig::default()
        }
    }

    pub fn accounting_config(&self) -> AccountingConfig {
        let settings = &self.accounting;
        AccountingConfig {
            earliest_height: settings
                .earliest_height
                .unwrap_or_else(|| self.network.earliest_accounting_height()),
            response_timeout: Duration::from_secs(settings.response_timeout_secs),
            stale_handler_cleanup: Duration::from_secs(settings.stale_handler_cleanup_secs),
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
            max_retries: settings.max_retries,
            max_buffered: settings.max_buffered,
            ..AccountingConfig::default()
        }
    }
}
