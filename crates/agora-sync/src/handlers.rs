//! Bookkeeping for block requests in flight.
//!
//! At most one request is outstanding per peer. Each is tagged with its
//! nonce; every path that retires a handler (response, timeout, janitor,
//! disconnect, shutdown) goes through [`HandlerMap::take_matching`] or
//! [`HandlerMap::take`], so whichever path loses the race simply finds
//! nothing and returns. A handler taken out of the map is stopped: its timers
//! are aborted and later callbacks for its nonce are no-ops.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use agora_core::NodeId;

/// Connection-quality bookkeeping lives outside this crate. Faults are
/// reported here with a human-readable reason.
pub trait PeerFaultHandler: Send + Sync {
    fn report(&self, peer: &NodeId, reason: &str);
}

/// Logs faults and does nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFaultHandler;

impl PeerFaultHandler for LoggingFaultHandler {
    fn report(&self, peer: &NodeId, reason: &str) {
        tracing::info!(%peer, reason, "peer fault");
    }
}

/// One outstanding block request.
#[derive(Debug)]
pub(crate) struct RequestHandler {
    pub nonce: u64,
    pub from_height: u64,
    /// How many times this range has already been retried.
    pub retries: u32,
    stopped: bool,
    timeout: Option<JoinHandle<()>>,
    janitor: Option<JoinHandle<()>>,
}

impl RequestHandler {
    pub fn new(nonce: u64, from_height: u64, retries: u32) -> Self {
        Self {
            nonce,
            from_height,
            retries,
            stopped: false,
            timeout: None,
            janitor: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Abort timers. Idempotent.
    pub fn stop(&mut self) {
        self.stopped = true;
        if let Some(timer) = self.timeout.take() {
            timer.abort();
        }
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
    }
}

impl Drop for RequestHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Which path is retiring a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retirer {
    Response,
    Timeout,
    Janitor,
}

#[derive(Debug, Default)]
pub(crate) struct HandlerMap {
    inner: Mutex<HashMap<NodeId, RequestHandler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nonce of the request outstanding to `peer`, if any.
    pub fn outstanding(&self, peer: &NodeId) -> Option<u64> {
        self.inner.lock().get(peer).map(|h| h.nonce)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Register a new handler. Refuses if one is already outstanding.
    pub fn insert(&self, peer: NodeId, handler: RequestHandler) -> bool {
        let mut map = self.inner.lock();
        if map.contains_key(&peer) {
            return false;
        }
        map.insert(peer, handler);
        true
    }

    /// Attach the response timer. If the handler is already gone the timer
    /// is aborted on the spot.
    pub fn arm_timeout(&self, peer: &NodeId, nonce: u64, timer: JoinHandle<()>) {
        match self.inner.lock().get_mut(peer) {
            Some(handler) if handler.nonce == nonce && !handler.stopped => {
                if let Some(old) = handler.timeout.replace(timer) {
                    old.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    /// Attach the stale-handler janitor unless one is already running.
    /// Returns false (and aborts `janitor`) if it was not needed.
    pub fn arm_janitor(&self, peer: &NodeId, nonce: u64, janitor: JoinHandle<()>) -> bool {
        match self.inner.lock().get_mut(peer) {
            Some(handler) if handler.nonce == nonce && handler.janitor.is_none() => {
                handler.janitor = Some(janitor);
                true
            }
            _ => {
                janitor.abort();
                false
            }
        }
    }

    /// Remove and stop the handler for `peer` only if it still carries
    /// `nonce`. A newer handler for the same peer is left alone.
    ///
    /// A timer retiring its own handler detaches itself instead of being
    /// aborted, so it can carry on with the retry.
    pub fn take_matching(&self, peer: &NodeId, nonce: u64, by: Retirer) -> Option<RequestHandler> {
        let mut map = self.inner.lock();
        if map.get(peer).map(|h| h.nonce) != Some(nonce) {
            return None;
        }
        let mut handler = map.remove(peer)?;
        drop(map);
        match by {
            Retirer::Response => {}
            Retirer::Timeout => drop(handler.timeout.take()),
            Retirer::Janitor => drop(handler.janitor.take()),
        }
        handler.stop();
        Some(handler)
    }

    /// Remove and stop whatever is outstanding for `peer`.
    pub fn take(&self, peer: &NodeId) -> Option<RequestHandler> {
        let mut handler = self.inner.lock().remove(peer)?;
        handler.stop();
        Some(handler)
    }

    /// Stop and drop every handler.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.inner.lock().drain().collect();
        let count = drained.len();
        for (_, mut handler) in drained {
            handler.stop();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    #[test]
    fn test_one_handler_per_peer() {
        let map = HandlerMap::new();
        assert!(map.insert(peer(1), RequestHandler::new(7, 100, 0)));
        assert!(!map.insert(peer(1), RequestHandler::new(8, 100, 0)));
        assert!(map.insert(peer(2), RequestHandler::new(9, 100, 0)));
        assert_eq!(map.outstanding(&peer(1)), Some(7));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_take_matching_is_idempotent_and_nonce_scoped() {
        let map = HandlerMap::new();
        map.insert(peer(1), RequestHandler::new(7, 100, 0));

        assert!(map.take_matching(&peer(1), 99, Retirer::Response).is_none());
        let handler = map.take_matching(&peer(1), 7, Retirer::Timeout).unwrap();
        assert!(handler.is_stopped());
        assert!(map.take_matching(&peer(1), 7, Retirer::Response).is_none());
        assert!(map.take(&peer(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_aborted_when_taken() {
        let map = HandlerMap::new();
        map.insert(peer(1), RequestHandler::new(7, 100, 0));
        let timer = tokio::spawn(tokio::time::sleep(Duration::from_secs(60)));
        let abort_probe = timer.abort_handle();
        map.arm_timeout(&peer(1), 7, timer);

        map.take(&peer(1)).unwrap();
        tokio::task::yield_now().await;
        assert!(abort_probe.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_for_stale_nonce_aborted_immediately() {
        let map = HandlerMap::new();
        map.insert(peer(1), RequestHandler::new(7, 100, 0));
        let timer = tokio::spawn(tokio::time::sleep(Duration::from_secs(60)));
        let abort_probe = timer.abort_handle();
        map.arm_timeout(&peer(1), 8, timer);
        tokio::task::yield_now().await;
        assert!(abort_probe.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_janitor_per_handler() {
        let map = HandlerMap::new();
        map.insert(peer(1), RequestHandler::new(7, 100, 0));
        let first = tokio::spawn(tokio::time::sleep(Duration::from_secs(120)));
        let second = tokio::spawn(tokio::time::sleep(Duration::from_secs(120)));
        assert!(map.arm_janitor(&peer(1), 7, first));
        assert!(!map.arm_janitor(&peer(1), 7, second));
    }

    #[test]
    fn test_clear_stops_everything() {
        let map = HandlerMap::new();
        map.insert(peer(1), RequestHandler::new(1, 100, 0));
        map.insert(peer(2), RequestHandler::new(2, 100, 0));
        assert_eq!(map.clear(), 2);
        assert_eq!(map.len(), 0);
    }
}
