//! Messages the store gossips, and the initial-data exchange.

use serde::{Deserialize, Serialize};

use agora_core::{AppendOnlyPayload, Capability, PayloadHash, SignedMutation, StorageEntry};

/// Store mutations broadcast to directly connected peers on local acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMessage {
    AddDataRequest { entry: StorageEntry },
    RemoveDataRequest(SignedMutation),
    RefreshRequest(SignedMutation),
    AddAppendOnlyRequest { hash: PayloadHash, payload: AppendOnlyPayload },
}

impl StoreMessage {
    /// Capabilities a peer must advertise before this message may be sent to it.
    ///
    /// Removes and refreshes carry only a key, so they go to everyone.
    pub fn required_capabilities(&self) -> &[Capability] {
        match self {
            StoreMessage::AddDataRequest { entry } => entry.payload.required_capabilities(),
            StoreMessage::AddAppendOnlyRequest { payload, .. } => &payload.required_capabilities,
            StoreMessage::RemoveDataRequest(_) | StoreMessage::RefreshRequest(_) => &[],
        }
    }
}

/// Sent on connect: "here is what I already have".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataRequest {
    pub nonce: u64,
    pub excluded_keys: Vec<PayloadHash>,
}

/// Answer to a [`GetDataRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataResponse {
    pub request_nonce: u64,
    pub entries: Vec<StorageEntry>,
    pub append_only: Vec<(PayloadHash, AppendOnlyPayload)>,
    /// Set when the responder hit its entry limit.
    pub was_truncated: bool,
}
