//! Routes inbound wire messages to the component that owns them.

use std::sync::Arc;

use agora_core::{Capabilities, Capability, NodeId};
use agora_store::{ReplicatedStore, StoreMessage};
use agora_sync::{AccountingSync, Transport, WireMessage, PROTOCOL_VERSION};

pub struct Dispatcher {
    store: Arc<ReplicatedStore>,
    accounting: Arc<AccountingSync>,
    transport: Arc<dyn Transport>,
    capabilities: Capabilities,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ReplicatedStore>,
        accounting: Arc<AccountingSync>,
        transport: Arc<dyn Transport>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            store,
            accounting,
            transport,
            capabilities,
        }
    }

    pub fn hello(&self) -> WireMessage {
        WireMessage::Hello {
            node_id: self.transport.local_node_id(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: self.capabilities.clone(),
        }
    }

    /// Handle one message. Nothing a peer sends can make this fail; bad
    /// input is logged and dropped by the component that owns it.
    pub async fn handle(&self, from: NodeId, message: WireMessage) {
        tracing::trace!(peer = %from, kind = message.kind(), "inbound message");
        match message {
            WireMessage::Hello {
                protocol_version,
                capabilities,
                ..
            } => self.on_hello(from, protocol_version, capabilities).await,

            WireMessage::Store(message) => self.on_store_message(from, message),

            WireMessage::GetDataRequest(request) => {
                let capabilities = self.transport.peer_capabilities(&from).await.unwrap_or_default();
                let response = self.store.build_get_data_response(&request, &capabilities);
                self.send(&from, WireMessage::GetDataResponse(response)).await;
            }

            WireMessage::GetDataResponse(response) => {
                self.store.process_get_data_response(response, from);
            }

            WireMessage::GetAccountingBlocksRequest { from_height, nonce } => {
                self.accounting.on_backfill_request(from_height, nonce, from);
            }

            WireMessage::GetAccountingBlocksResponse {
                blocks,
                request_nonce,
                oracle_signature,
            } => {
                self.accounting
                    .on_backfill_response(blocks, request_nonce, oracle_signature, from)
                    .await;
            }

            WireMessage::NewAccountingBlockBroadcast {
                block,
                oracle_pub_key,
                signature,
            } => {
                self.accounting
                    .on_broadcast(block, oracle_pub_key, signature, from)
                    .await;
            }
        }
    }

    /// A peer introduced itself: ask for the store data we lack and, if it
    /// serves the accounting feed, for blocks past our tip.
    async fn on_hello(&self, from: NodeId, protocol_version: u8, capabilities: Capabilities) {
        if protocol_version != PROTOCOL_VERSION {
            tracing::warn!(peer = %from, peer_version = protocol_version, "protocol version mismatch, ignoring peer");
            return;
        }
        let nonce = rand::random();
        let request = self.store.build_get_data_request(nonce);
        self.send(&from, WireMessage::GetDataRequest(request)).await;

        if capabilities.contains(Capability::ACCOUNTING_PROVIDER) && self.accounting.oracle().is_enabled() {
            let from_height = self.accounting.last_height() + 1;
            if let Err(e) = self.accounting.request_backfill(from_height, from).await {
                tracing::debug!(peer = %from, error = %e, "initial block request failed");
            }
        }
    }

    fn on_store_message(&self, from: NodeId, message: StoreMessage) {
        let origin = Some(from);
        match message {
            StoreMessage::AddDataRequest { entry } => {
                self.store.add(entry, origin);
            }
            StoreMessage::RemoveDataRequest(mutation) => {
                self.store.remove(mutation, origin);
            }
            StoreMessage::RefreshRequest(mutation) => {
                self.store.refresh(mutation, origin);
            }
            StoreMessage::AddAppendOnlyRequest { hash, payload } => {
                self.store.add_if_absent(hash, payload, origin);
            }
        }
    }

    async fn send(&self, to: &NodeId, message: WireMessage) {
        let kind = message.kind();
        if let Err(e) = self.transport.send(to, message).await {
            tracing::debug!(peer = %to, kind, error = %e, "send failed");
        }
    }
}
