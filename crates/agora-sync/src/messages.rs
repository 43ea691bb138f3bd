//! Wire messages exchanged between peers.
//!
//! Every message is CBOR-encoded with `ciborium`. The transport delivers
//! whole messages; framing is its concern.

use serde::{Deserialize, Serialize};

use agora_core::{AccountingBlock, Capabilities, Capability, Ed25519PublicKey, Ed25519Signature, NodeId};
use agora_store::{GetDataRequest, GetDataResponse, StoreMessage};

use crate::error::{Result, SyncError};

pub const PROTOCOL_VERSION: u8 = 1;

pub mod limits {
    /// Largest encoded message we accept.
    pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

    /// Largest backfill batch a server sends in one response.
    pub const MAX_BLOCKS_PER_RESPONSE: usize = 10_000;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First message on a new connection.
    Hello {
        node_id: NodeId,
        protocol_version: u8,
        capabilities: Capabilities,
    },

    /// Gossip of an accepted store mutation.
    Store(StoreMessage),

    GetDataRequest(GetDataRequest),
    GetDataResponse(GetDataResponse),

    /// Ask for every accepted block at or above `from_height`.
    GetAccountingBlocksRequest { from_height: u64, nonce: u64 },

    /// Answer to a block request. `oracle_signature` covers the nonce and
    /// every block hash in order.
    GetAccountingBlocksResponse {
        blocks: Vec<AccountingBlock>,
        request_nonce: u64,
        oracle_signature: Ed25519Signature,
    },

    /// A freshly published block, signed by the oracle over its hash.
    NewAccountingBlockBroadcast {
        block: AccountingBlock,
        oracle_pub_key: Ed25519PublicKey,
        signature: Ed25519Signature,
    },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::Store(_) => "store",
            WireMessage::GetDataRequest(_) => "get_data_request",
            WireMessage::GetDataResponse(_) => "get_data_response",
            WireMessage::GetAccountingBlocksRequest { .. } => "get_blocks_request",
            WireMessage::GetAccountingBlocksResponse { .. } => "get_blocks_response",
            WireMessage::NewAccountingBlockBroadcast { .. } => "new_block",
        }
    }

    /// Capabilities a peer must advertise to be sent this message.
    pub fn required_capabilities(&self) -> &[Capability] {
        const ACCOUNTING: &[Capability] = &[Capability::ACCOUNTING];
        const PROVIDER: &[Capability] = &[Capability::ACCOUNTING_PROVIDER];
        match self {
            WireMessage::Store(msg) => msg.required_capabilities(),
            WireMessage::GetAccountingBlocksRequest { .. } => PROVIDER,
            WireMessage::GetAccountingBlocksResponse { .. }
            | WireMessage::NewAccountingBlockBroadcast { .. } => ACCOUNTING,
            _ => &[],
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > limits::MAX_MESSAGE_BYTES {
            return Err(SyncError::InvalidMessage(format!(
                "message of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        ciborium::from_reader(bytes).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }
}
