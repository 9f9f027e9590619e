//! Relay of media-negotiation payloads between paired peers.
//!
//! The blob is opaque: only the outer shape is validated (claimed peer id,
//! object-ness, serialized size) and the inner object passes through
//! byte-for-byte. A message whose claimed peer is not the sender's current
//! partner is dropped without a reply, so a spoofed or stale peer id leaks
//! nothing about the pair map.

use std::sync::Arc;

use serde_json::Value;

use crate::events::ServerEvent;
use crate::pairs::PairManager;
use crate::registry::Registry;
use crate::store::StoreResult;

/// Upper bound on the serialized signal payload. SDP offers with many
/// candidates run a few KB; anything near this limit is garbage.
pub const MAX_SIGNAL_BYTES: usize = 50_000;

pub struct SignalRelay {
    pairs: Arc<PairManager>,
    registry: Arc<Registry>,
}

impl SignalRelay {
    pub fn new(pairs: Arc<PairManager>, registry: Arc<Registry>) -> Self {
        Self { pairs, registry }
    }

    /// Forward `signal` from `from` to its claimed partner. Invalid or
    /// unverifiable messages are dropped silently; only store failures
    /// surface to the caller.
    pub async fn relay(&self, from: &str, peer: &str, signal: Value) -> StoreResult<()> {
        if peer.is_empty() {
            tracing::debug!(conn_id = %from, "Dropping signal with empty peer id");
            return Ok(());
        }
        if !signal.is_object() {
            tracing::debug!(conn_id = %from, "Dropping non-object signal payload");
            return Ok(());
        }
        match serde_json::to_vec(&signal) {
            Ok(bytes) if bytes.len() <= MAX_SIGNAL_BYTES => {}
            _ => {
                tracing::debug!(conn_id = %from, "Dropping oversized signal payload");
                return Ok(());
            }
        }

        // Point-in-time partner check: the pair may dissolve right after,
        // in which case the peer's client ignores a signal from a stranger.
        let partner = self.pairs.partner(from).await?;
        if partner.as_deref() != Some(peer) {
            tracing::debug!(conn_id = %from, claimed = %peer, "Dropping signal for non-partner");
            return Ok(());
        }

        self.registry
            .deliver(
                peer,
                ServerEvent::Signal {
                    peer: from.to_string(),
                    signal,
                },
            )
            .await;
        Ok(())
    }
}
