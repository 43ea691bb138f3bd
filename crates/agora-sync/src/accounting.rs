//! Oracle-fed accounting chain sync.
//!
//! Two ways in: the oracle broadcasts each new block, and any node can ask a
//! peer for everything from a height onward (backfill). Both funnel into the
//! same single-height linking rule in [`AccountingChain::try_append`].
//!
//! ```text
//! broadcast(h)                  chain tip t
//!   h == t+1, links      ->  append, drain buffer, persist, Appended event
//!   h >  t+1             ->  buffer, request backfill from t+1
//!   h == t+1, bad prev   ->  reject, request t+1.. from another peer
//!   h <= t               ->  ignore
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::broadcast;

use agora_core::{AccountingBlock, Capability, Ed25519PublicKey, Ed25519Signature, NodeId};
use agora_store::Persistence;

use crate::chain::{AccountingChain, ChainError, HeightState, MAINNET_EARLIEST_HEIGHT, REGTEST_EARLIEST_HEIGHT};
use crate::error::{Result, SyncError};
use crate::handlers::{HandlerMap, LoggingFaultHandler, PeerFaultHandler, RequestHandler, Retirer};
use crate::messages::{limits, WireMessage};
use crate::oracle::Oracle;
use crate::transport::Transport;

// ───────────────────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AccountingConfig {
    pub earliest_height: u64,
    /// How long a requester waits for a backfill response, and how long a
    /// server waits for its response to go out.
    pub response_timeout: Duration,
    /// Delay before a handler left behind by a duplicate request is removed.
    pub stale_handler_cleanup: Duration,
    /// Pause before retrying a failed request with another peer.
    pub retry_delay: Duration,
    pub max_retries: u32,
    /// Future blocks held while waiting for the gap to fill.
    pub max_buffered: usize,
    pub max_blocks_per_response: usize,
    pub event_capacity: usize,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            earliest_height: MAINNET_EARLIEST_HEIGHT,
            response_timeout: Duration::from_secs(180),
            stale_handler_cleanup: Duration::from_secs(120),
            retry_delay: Duration::from_secs(10),
            max_retries: 3,
            max_buffered: 1_000,
            max_blocks_per_response: limits::MAX_BLOCKS_PER_RESPONSE,
            event_capacity: 256,
        }
    }
}

impl AccountingConfig {
    pub fn regtest() -> Self {
        Self {
            earliest_height: REGTEST_EARLIEST_HEIGHT,
            ..Self::default()
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Outcomes and events
// ───────────────────────────────────────────────────────────────────────────────

/// What happened to a broadcast block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Appended, together with this many blocks from the buffer.
    Appended { drained: usize },
    /// Ahead of the tip; held and a backfill requested.
    Buffered,
    /// At or below the tip.
    Ignored,
    /// At the next height but not linking onto the tip.
    Inconsistent,
    /// Bad signature, unpermitted key, bad hash, or the feed is disabled.
    Rejected,
}

/// What a backfill response did to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackfillSummary {
    pub appended: usize,
    /// Blocks at or below the tip that were skipped.
    pub skipped: usize,
    /// Set when a block failed to link and the rest of the batch was dropped.
    pub broken: bool,
}

#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// Blocks newly accepted, ascending.
    Appended(Vec<AccountingBlock>),
    /// Everything at or above `from_height` was dropped.
    Purged { from_height: u64, count: usize },
}

// ───────────────────────────────────────────────────────────────────────────────
// AccountingSync
// ───────────────────────────────────────────────────────────────────────────────

pub struct AccountingSync {
    config: AccountingConfig,
    chain: RwLock<AccountingChain>,
    oracle: Arc<Oracle>,
    transport: Arc<dyn Transport>,
    persistence: Option<Arc<dyn Persistence>>,
    faults: Arc<dyn PeerFaultHandler>,
    handlers: HandlerMap,
    /// Highest height seen in any accepted backfill response.
    last_received_height: AtomicU64,
    events: broadcast::Sender<ChainEvent>,
}

impl AccountingSync {
    pub fn new(
        config: AccountingConfig,
        oracle: Arc<Oracle>,
        transport: Arc<dyn Transport>,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Self {
        let chain = AccountingChain::new(config.earliest_height, config.max_buffered);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            chain: RwLock::new(chain),
            oracle,
            transport,
            persistence,
            faults: Arc::new(LoggingFaultHandler),
            handlers: HandlerMap::new(),
            last_received_height: AtomicU64::new(0),
            events,
        }
    }

    pub fn with_fault_handler(mut self, faults: Arc<dyn PeerFaultHandler>) -> Self {
        self.faults = faults;
        self
    }

    pub fn config(&self) -> &AccountingConfig {
        &self.config
    }

    pub fn oracle(&self) -> &Oracle {
        &self.oracle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn last_height(&self) -> u64 {
        self.chain.read().last_height()
    }

    pub fn len(&self) -> usize {
        self.chain.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.read().is_empty()
    }

    /// Snapshot of the accepted chain, ascending.
    pub fn blocks(&self) -> Vec<AccountingBlock> {
        self.chain.read().blocks().to_vec()
    }

    pub fn blocks_from(&self, height: u64) -> Vec<AccountingBlock> {
        self.chain.read().blocks_from(height)
    }

    pub fn height_state(&self, height: u64) -> HeightState {
        self.chain.read().height_state(height)
    }

    /// Number of block requests currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.handlers.len()
    }

    /// Reload the chain from persistence. Does not emit events; consumers
    /// rebuild from [`blocks`](Self::blocks) at startup.
    pub async fn load_persisted(&self) -> Result<usize> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let blocks = persistence.load_blocks().await?;
        let loaded = self.chain.write().load(blocks);
        tracing::info!(loaded, last_height = self.last_height(), "accounting chain loaded");
        Ok(loaded)
    }

    // ─── Broadcast path ──────────────────────────────────────────────────────

    /// Handle a `NewAccountingBlockBroadcast` from `from`.
    pub async fn on_broadcast(
        self: &Arc<Self>,
        block: AccountingBlock,
        oracle_pub_key: Ed25519PublicKey,
        signature: Ed25519Signature,
        from: NodeId,
    ) -> BlockOutcome {
        if let Err(e) = self.oracle.verify_block(&block, &oracle_pub_key, &signature) {
            match e {
                SyncError::OracleDisabled => {}
                e => tracing::warn!(peer = %from, height = block.height, error = %e, "dropping block broadcast"),
            }
            return BlockOutcome::Rejected;
        }

        let height = block.height;
        let decision = {
            let mut chain = self.chain.write();
            let next = chain.last_height() + 1;
            if height < next {
                tracing::debug!(height, tip = next - 1, "ignoring block at or below tip");
                return BlockOutcome::Ignored;
            }
            match chain.try_append(block.clone()) {
                Ok(()) => {
                    let mut appended = vec![block];
                    appended.extend(chain.drain_buffered());
                    self.announce(&appended);
                    Ok(appended)
                }
                Err(ChainError::BlockHeightNotConnecting { expected, .. }) => {
                    chain.buffer(block);
                    Err((BlockOutcome::Buffered, expected))
                }
                Err(e @ ChainError::BlockHashNotConnecting { .. }) => {
                    chain.mark_rejected(height);
                    tracing::warn!(peer = %from, error = %e, "accounting chain inconsistency, keeping local chain");
                    Err((BlockOutcome::Inconsistent, next))
                }
                Err(e @ ChainError::InvalidBlock(_)) => {
                    tracing::warn!(peer = %from, error = %e, "dropping invalid block");
                    return BlockOutcome::Rejected;
                }
            }
        };

        match decision {
            Ok(appended) => {
                let drained = appended.len() - 1;
                self.persist(&appended).await;
                BlockOutcome::Appended { drained }
            }
            Err((BlockOutcome::Inconsistent, from_height)) => {
                match self.pick_peer(Some(from)).await {
                    Some(peer) => {
                        if let Err(e) = self.request_backfill(from_height, peer).await {
                            tracing::debug!(error = %e, "could not request blocks after inconsistency");
                        }
                    }
                    None => tracing::debug!(from_height, "no block provider to resolve inconsistency with"),
                }
                BlockOutcome::Inconsistent
            }
            Err((outcome, from_height)) => {
                let peer = if self.serves_blocks(&from).await {
                    Some(from)
                } else {
                    self.pick_peer(None).await
                };
                match peer {
                    Some(peer) => {
                        if let Err(e) = self.request_backfill(from_height, peer).await {
                            tracing::debug!(error = %e, "could not request missing blocks");
                        }
                    }
                    None => tracing::debug!(from_height, "no block provider to request missing blocks from"),
                }
                outcome
            }
        }
    }

    // ─── Client side of backfill ─────────────────────────────────────────────

    /// Ask `peer` for every block from `from_height`. Only one request per
    /// peer is kept in flight; a duplicate arms the stale-handler janitor
    /// and returns the outstanding nonce. Peers that do not advertise
    /// [`Capability::ACCOUNTING_PROVIDER`] are never asked.
    pub async fn request_backfill(self: &Arc<Self>, from_height: u64, peer: NodeId) -> Result<u64> {
        self.request_backfill_attempt(from_height, peer, 0).await
    }

    async fn request_backfill_attempt(self: &Arc<Self>, from_height: u64, peer: NodeId, retries: u32) -> Result<u64> {
        if !self.oracle.is_enabled() {
            return Err(SyncError::OracleDisabled);
        }
        if !self.serves_blocks(&peer).await {
            return Err(SyncError::NotBlockProvider(peer));
        }
        if let Some(outstanding) = self.handlers.outstanding(&peer) {
            self.arm_janitor(peer, outstanding);
            tracing::debug!(%peer, from_height, "block request already in flight");
            return Ok(outstanding);
        }

        let nonce: u64 = rand::thread_rng().gen();
        if !self.handlers.insert(peer, RequestHandler::new(nonce, from_height, retries)) {
            return self.handlers.outstanding(&peer).ok_or(SyncError::Cancelled);
        }
        self.chain.write().set_requested_from(Some(from_height));

        let timer = {
            let this = Arc::clone(self);
            let timeout = self.config.response_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                this.on_request_timeout(peer, nonce).await;
            })
        };
        self.handlers.arm_timeout(&peer, nonce, timer);

        let request = WireMessage::GetAccountingBlocksRequest { from_height, nonce };
        if let Err(e) = self.transport.send(&peer, request).await {
            tracing::debug!(%peer, error = %e, "block request send failed");
            if let Some(handler) = self.handlers.take_matching(&peer, nonce, Retirer::Response) {
                self.faults.report(&peer, "sending block request failed");
                self.schedule_retry(handler.from_height, peer, handler.retries);
            }
            return Err(e);
        }
        tracing::debug!(%peer, from_height, nonce, "requested accounting blocks");
        Ok(nonce)
    }

    fn arm_janitor(self: &Arc<Self>, peer: NodeId, nonce: u64) {
        let this = Arc::clone(self);
        let delay = self.config.stale_handler_cleanup;
        let janitor = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.handlers.take_matching(&peer, nonce, Retirer::Janitor).is_some() {
                tracing::debug!(%peer, nonce, "removed stale block request handler");
            }
        });
        self.handlers.arm_janitor(&peer, nonce, janitor);
    }

    async fn on_request_timeout(self: Arc<Self>, peer: NodeId, nonce: u64) {
        let Some(handler) = self.handlers.take_matching(&peer, nonce, Retirer::Timeout) else {
            tracing::trace!(%peer, nonce, "timeout for retired handler");
            return;
        };
        self.faults.report(&peer, "block request timed out");
        self.schedule_retry(handler.from_height, peer, handler.retries);
    }

    /// Retry later with some other connected peer, if any retries are left.
    fn schedule_retry(self: &Arc<Self>, from_height: u64, failed: NodeId, retries: u32) {
        if retries >= self.config.max_retries {
            tracing::warn!(from_height, retries, "giving up on block request");
            self.chain.write().set_requested_from(None);
            return;
        }
        let this = Arc::clone(self);
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.last_height() >= from_height {
                return;
            }
            let Some(peer) = this.pick_peer(Some(failed)).await else {
                tracing::debug!(from_height, "no peer to retry block request with");
                return;
            };
            if let Err(e) = this.request_backfill_attempt(from_height, peer, retries + 1).await {
                tracing::debug!(%peer, error = %e, "block request retry failed");
            }
        });
    }

    async fn serves_blocks(&self, peer: &NodeId) -> bool {
        self.transport
            .peer_capabilities(peer)
            .await
            .map_or(false, |caps| caps.contains(Capability::ACCOUNTING_PROVIDER))
    }

    /// A connected block provider, preferring anyone but `avoid`.
    async fn pick_peer(&self, avoid: Option<NodeId>) -> Option<NodeId> {
        let peers = self.transport.connected_peers().await.ok()?;
        let mut capable = Vec::new();
        for peer in peers {
            if self.serves_blocks(&peer).await {
                capable.push(peer);
            }
        }
        let others: Vec<NodeId> = capable.iter().copied().filter(|p| Some(*p) != avoid).collect();
        let pool = if others.is_empty() { capable } else { others };
        if pool.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..pool.len());
        Some(pool[index])
    }

    /// Handle a `GetAccountingBlocksResponse`. Responses whose nonce matches
    /// no live request are dropped without touching the chain.
    pub async fn on_backfill_response(
        self: &Arc<Self>,
        blocks: Vec<AccountingBlock>,
        request_nonce: u64,
        signature: Ed25519Signature,
        from: NodeId,
    ) -> Option<BackfillSummary> {
        let Some(handler) = self.handlers.take_matching(&from, request_nonce, Retirer::Response) else {
            tracing::debug!(peer = %from, nonce = request_nonce, "response for unknown or stopped request");
            return None;
        };

        if let Err(e) = self.oracle.verify_batch(request_nonce, &blocks, &signature) {
            tracing::warn!(peer = %from, error = %e, "dropping block batch");
            self.faults.report(&from, "invalid oracle signature on block batch");
            self.schedule_retry(handler.from_height, from, handler.retries);
            return None;
        }

        if let Some(first) = blocks.first() {
            let last_received = self.last_received_height.load(Ordering::Acquire);
            if first.height < last_received {
                tracing::debug!(first = first.height, last_received, "ignoring stale block batch");
                self.chain.write().set_requested_from(None);
                return Some(BackfillSummary::default());
            }
        }
        if let Some(last) = blocks.last() {
            self.last_received_height.fetch_max(last.height, Ordering::AcqRel);
        }

        let mut summary = BackfillSummary::default();
        let appended = {
            let mut chain = self.chain.write();
            let mut appended = Vec::new();
            for block in blocks {
                if block.height <= chain.last_height() {
                    summary.skipped += 1;
                    continue;
                }
                match chain.try_append(block.clone()) {
                    Ok(()) => appended.push(block),
                    Err(e) => {
                        tracing::warn!(peer = %from, error = %e, "block batch does not link, dropping remainder");
                        summary.broken = true;
                        break;
                    }
                }
            }
            appended.extend(chain.drain_buffered());
            chain.set_requested_from(None);
            if !appended.is_empty() {
                self.announce(&appended);
            }
            appended
        };
        summary.appended = appended.len();
        if !appended.is_empty() {
            self.persist(&appended).await;
        }
        Some(summary)
    }

    // ─── Server side of backfill ─────────────────────────────────────────────

    /// Answer a `GetAccountingBlocksRequest`. Only a node that can sign for
    /// the oracle answers. The response goes out on its own task; returns
    /// how many blocks it carries.
    pub fn on_backfill_request(&self, from_height: u64, nonce: u64, from: NodeId) -> usize {
        let mut blocks = self.blocks_from(from_height);
        blocks.truncate(self.config.max_blocks_per_response);
        let Some(oracle_signature) = self.oracle.sign_batch(nonce, &blocks) else {
            tracing::debug!(peer = %from, "not an oracle node, ignoring block request");
            return 0;
        };
        let count = blocks.len();
        let response = WireMessage::GetAccountingBlocksResponse {
            blocks,
            request_nonce: nonce,
            oracle_signature,
        };

        let transport = Arc::clone(&self.transport);
        let faults = Arc::clone(&self.faults);
        let timeout = self.config.response_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.send(&from, response)).await {
                Ok(Ok(())) => tracing::debug!(peer = %from, from_height, count, "sent accounting blocks"),
                Ok(Err(e)) => {
                    tracing::debug!(peer = %from, error = %e, "block response send failed");
                    faults.report(&from, "sending block response failed");
                }
                Err(_) => faults.report(&from, "sending block response timed out"),
            }
        });
        count
    }

    // ─── Publishing ──────────────────────────────────────────────────────────

    /// Sign and broadcast a new block, appending it locally first. Returns
    /// how many peers it was sent to; zero if this node may not publish.
    pub async fn publish_block(&self, block: AccountingBlock) -> Result<usize> {
        let Some(signature) = self.oracle.sign_block(&block) else {
            return Ok(0);
        };
        let Some(oracle_pub_key) = self.oracle.public_key() else {
            return Ok(0);
        };

        let appended = {
            let mut chain = self.chain.write();
            chain.try_append(block.clone())?;
            let mut appended = vec![block.clone()];
            appended.extend(chain.drain_buffered());
            self.announce(&appended);
            appended
        };
        self.persist(&appended).await;

        let message = WireMessage::NewAccountingBlockBroadcast {
            block,
            oracle_pub_key,
            signature,
        };
        let mut sent = 0;
        for peer in self.transport.connected_peers().await? {
            let capable = self
                .transport
                .peer_capabilities(&peer)
                .await
                .map_or(false, |caps| caps.contains(Capability::ACCOUNTING));
            if !capable {
                continue;
            }
            match self.transport.send(&peer, message.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(%peer, error = %e, "block broadcast send failed"),
            }
        }
        Ok(sent)
    }

    // ─── Administration ──────────────────────────────────────────────────────

    /// Drop the top `count` blocks locally and in persistence. Used to
    /// recover from a fork.
    pub async fn purge_last(&self, count: usize) -> Result<usize> {
        let removed = self.chain.write().purge_last(count);
        let Some(from_height) = removed.first().map(|b| b.height) else {
            return Ok(0);
        };
        self.last_received_height.store(0, Ordering::Release);
        if let Some(persistence) = &self.persistence {
            persistence.delete_blocks_from(from_height).await?;
        }
        tracing::info!(from_height, count = removed.len(), "purged accounting blocks");
        let _ = self.events.send(ChainEvent::Purged {
            from_height,
            count: removed.len(),
        });
        Ok(removed.len())
    }

    /// Close out any request to a peer that went away.
    pub fn on_disconnect(&self, peer: &NodeId) {
        if self.handlers.take(peer).is_some() {
            tracing::debug!(%peer, "dropped block request to disconnected peer");
        }
    }

    /// Stop every handler and its timers.
    pub fn shutdown(&self) {
        let stopped = self.handlers.clear();
        if stopped > 0 {
            tracing::debug!(stopped, "accounting sync handlers stopped");
        }
    }

    /// Called with the chain write lock held, so `Appended` events leave in
    /// height order.
    fn announce(&self, appended: &[AccountingBlock]) {
        if let Some(last) = appended.last() {
            tracing::debug!(height = last.height, count = appended.len(), "accounting blocks appended");
        }
        let _ = self.events.send(ChainEvent::Appended(appended.to_vec()));
    }

    async fn persist(&self, appended: &[AccountingBlock]) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save_blocks(appended).await {
                tracing::warn!(error = %e, "failed to persist accounting blocks");
            }
        }
    }
}
