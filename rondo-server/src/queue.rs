//! The global FIFO waiting queue.
//!
//! A single store-side list shared by every instance. Enqueue is
//! remove-then-push: not atomic as a whole, but a double entry created in
//! that window is harmless because the pop side re-validates each id.
//! Popping is destructive, so two instances matching at once can never hand
//! the same waiter to both callers.

use std::sync::Arc;

use crate::events::ServerEvent;
use crate::registry::Registry;
use crate::store::{Store, StoreResult};

pub const QUEUE_KEY: &str = "queue";

/// Stale or corrupt entries are skipped, but never more than this many per
/// pop, so a damaged store cannot spin a matcher forever.
const MAX_POP_ATTEMPTS: u32 = 50;

pub struct QueueManager {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    /// Append a connection to the tail and tell it it's waiting.
    /// Any prior occurrences are removed first (best-effort dedup).
    pub async fn enqueue(&self, conn_id: &str) -> StoreResult<()> {
        self.store.list_remove(QUEUE_KEY, conn_id).await?;
        self.store.list_push(QUEUE_KEY, conn_id).await?;
        self.registry.deliver(conn_id, ServerEvent::Waiting).await;
        Ok(())
    }

    /// Remove every occurrence of a connection. Idempotent.
    pub async fn remove(&self, conn_id: &str) -> StoreResult<()> {
        self.store.list_remove(QUEUE_KEY, conn_id).await?;
        Ok(())
    }

    /// Pop the earliest valid waiter, skipping the caller itself and ids
    /// whose connections have vanished without cleanup.
    pub async fn pop_valid(&self, exclude: &str) -> StoreResult<Option<String>> {
        for _ in 0..MAX_POP_ATTEMPTS {
            let Some(candidate) = self.store.list_pop(QUEUE_KEY).await? else {
                return Ok(None);
            };
            if candidate == exclude {
                continue;
            }
            if !self.registry.is_connected(&candidate).await {
                tracing::debug!(conn_id = %candidate, "Discarding stale queue entry");
                continue;
            }
            return Ok(Some(candidate));
        }
        tracing::warn!(
            "Gave up popping the waiting queue after {MAX_POP_ATTEMPTS} attempts; treating as empty"
        );
        Ok(None)
    }

    pub async fn len(&self) -> StoreResult<u64> {
        self.store.list_len(QUEUE_KEY).await
    }
}
