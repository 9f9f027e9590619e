//! The bidirectional pair registry.
//!
//! One store-side hash holds both directions of every pair: `A → B` and
//! `B → A`, always written and deleted as a single multi-field update so no
//! reader ever observes a one-sided pair from a completed operation. A
//! half-present pair can still exist transiently if an instance dies
//! mid-flow; `dissolve` tolerates the missing side.

use std::sync::Arc;

use crate::store::{Store, StoreResult};

pub const PAIRS_KEY: &str = "pairs";

pub struct PairManager {
    store: Arc<dyn Store>,
}

impl PairManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Bind two connections. Overwrites any existing binding on either side:
    /// the matchmaker only calls this when both sides are unpaired, so an
    /// overwrite can only happen under a race it resolves on its next read.
    pub async fn bind(&self, a: &str, b: &str) -> StoreResult<()> {
        self.store
            .hash_set_multi(PAIRS_KEY, &[(a, b), (b, a)])
            .await
    }

    /// The current partner of a connection, if any.
    pub async fn partner(&self, conn_id: &str) -> StoreResult<Option<String>> {
        self.store.hash_get(PAIRS_KEY, conn_id).await
    }

    /// Tear down the pair containing `conn_id`, given either side. Both
    /// directions are deleted before anyone is notified. Returns the pair
    /// `(conn_id, partner)` or `None` if it was already gone.
    pub async fn dissolve(&self, conn_id: &str) -> StoreResult<Option<(String, String)>> {
        let Some(partner) = self.partner(conn_id).await? else {
            return Ok(None);
        };
        self.store
            .hash_del_multi(PAIRS_KEY, &[conn_id, &partner])
            .await?;
        Ok(Some((conn_id.to_string(), partner)))
    }

    /// Number of paired connections (both directions counted).
    pub async fn entry_count(&self) -> StoreResult<u64> {
        self.store.hash_len(PAIRS_KEY).await
    }
}
