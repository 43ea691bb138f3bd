//! Initial-data exchange between a newly connected pair of peers.

use std::collections::HashSet;

use agora_core::{Capabilities, NodeId, PayloadCapability, PayloadHash};

use crate::messages::{GetDataRequest, GetDataResponse};
use crate::replicated::{AddResult, AppendResult, ReplicatedStore};

/// What a [`GetDataResponse`] contributed locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeSummary {
    pub entries_added: usize,
    pub append_only_added: usize,
    pub was_truncated: bool,
}

impl ReplicatedStore {
    /// List every key we hold so the peer skips them in its answer.
    pub fn build_get_data_request(&self, nonce: u64) -> GetDataRequest {
        let state = self.state.read();
        let excluded_keys = state
            .entries
            .keys()
            .chain(state.append_only.keys())
            .copied()
            .collect();
        GetDataRequest {
            nonce,
            excluded_keys,
        }
    }

    /// Answer a peer's request with everything it lacks and may receive.
    ///
    /// Content-addressed payloads that are not date-sorted come first; the
    /// date-sorted ones follow newest first, so truncation drops the oldest.
    pub fn build_get_data_response(
        &self,
        request: &GetDataRequest,
        peer_capabilities: &Capabilities,
    ) -> GetDataResponse {
        let now = self.clock.now_millis();
        let limit = self.config.max_get_data_entries;
        let excluded: HashSet<&PayloadHash> = request.excluded_keys.iter().collect();
        let state = self.state.read();

        let mut entries: Vec<_> = state
            .entries
            .iter()
            .filter(|(key, entry)| {
                !excluded.contains(key)
                    && !entry.is_expired(now)
                    && peer_capabilities.contains_all(entry.payload.required_capabilities())
            })
            .map(|(_, entry)| entry.clone())
            .collect();

        let (mut sorted, mut regular): (Vec<_>, Vec<_>) = state
            .append_only
            .iter()
            .filter(|(hash, payload)| {
                !excluded.contains(hash)
                    && peer_capabilities.contains_all(&payload.required_capabilities)
            })
            .map(|(hash, payload)| (*hash, payload.clone()))
            .partition(|(_, payload)| {
                payload.has_capability(PayloadCapability::DateSortedTruncatable)
            });
        drop(state);

        let mut was_truncated = false;
        if entries.len() > limit {
            entries.truncate(limit);
            was_truncated = true;
        }

        sorted.sort_by(|(_, a), (_, b)| b.date_ms.cmp(&a.date_ms));
        regular.append(&mut sorted);
        if regular.len() > limit {
            regular.truncate(limit);
            was_truncated = true;
        }

        if was_truncated {
            tracing::info!(nonce = request.nonce, limit, "initial data response truncated");
        }

        GetDataResponse {
            request_nonce: request.nonce,
            entries,
            append_only: regular,
            was_truncated,
        }
    }

    /// Apply a peer's answer. Items go through the normal checks but are not
    /// re-broadcast, and content-addressed data skips the date tolerance.
    pub fn process_get_data_response(
        &self,
        response: GetDataResponse,
        from: NodeId,
    ) -> ExchangeSummary {
        let mut summary = ExchangeSummary {
            was_truncated: response.was_truncated,
            ..ExchangeSummary::default()
        };
        for entry in response.entries {
            if self.apply_add(entry, Some(from), false) == AddResult::Added {
                summary.entries_added += 1;
            }
        }
        for (hash, payload) in response.append_only {
            if self.apply_append(hash, payload, Some(from), false, false) == AppendResult::Added {
                summary.append_only_added += 1;
            }
        }
        tracing::debug!(
            %from,
            entries = summary.entries_added,
            append_only = summary.append_only_added,
            "processed initial data response"
        );
        summary
    }
}
