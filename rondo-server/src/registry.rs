//! Connection registry and cross-instance delivery.
//!
//! Each instance owns the connections it admitted: a local table mapping
//! connection id to the outbound event channel plus the remote IP. The
//! cluster-wide view is one `session:<id>` record per live connection in
//! the shared store, written at admission, refreshed by a heartbeat and
//! dropped at teardown — so a crashed instance's connections age out and
//! read as stale instead of lingering forever. Delivering an event either
//! hits the local table directly or rides the `deliver` bus channel to
//! whichever instance owns the target.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::{Envelope, ServerEvent};
use crate::store::Store;

/// Bus channel for cross-instance event delivery.
pub const DELIVER_CHANNEL: &str = "deliver";

/// Session records expire this long after the last heartbeat.
pub const SESSION_TTL_SECS: u64 = 180;
/// How often each instance refreshes its local connections' records.
pub const HEARTBEAT_SECS: u64 = 60;

pub fn session_key(conn_id: &str) -> String {
    format!("session:{conn_id}")
}

/// Local half of a registered connection.
struct ConnHandle {
    tx: mpsc::Sender<ServerEvent>,
    ip: IpAddr,
}

pub struct Registry {
    instance_id: String,
    store: Arc<dyn Store>,
    local: Mutex<HashMap<String, ConnHandle>>,
}

impl Registry {
    pub fn new(instance_id: String, store: Arc<dyn Store>) -> Self {
        Self {
            instance_id,
            store,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Admit a connection: local table plus the cluster session record.
    pub async fn register(&self, conn_id: &str, ip: IpAddr, tx: mpsc::Sender<ServerEvent>) {
        self.local
            .lock()
            .insert(conn_id.to_string(), ConnHandle { tx, ip });

        let key = session_key(conn_id);
        let ip_str = ip.to_string();
        let connected_at = chrono::Utc::now().timestamp().to_string();
        let fields = [
            ("instance", self.instance_id.as_str()),
            ("ip", ip_str.as_str()),
            ("connected_at", connected_at.as_str()),
        ];
        let write = async {
            self.store.hash_set_multi(&key, &fields).await?;
            self.store.expire(&key, SESSION_TTL_SECS).await
        };
        if let Err(e) = write.await {
            tracing::error!(%conn_id, "Failed to write session record: {e}");
        }
    }

    /// Remove a connection from both views. Idempotent.
    pub async fn unregister(&self, conn_id: &str) {
        self.local.lock().remove(conn_id);
        if let Err(e) = self.store.delete(&session_key(conn_id)).await {
            tracing::error!(%conn_id, "Failed to delete session record: {e}");
        }
    }

    /// Re-arm the TTL on every local connection's session record.
    pub async fn heartbeat(&self) {
        for conn_id in self.local_ids() {
            if let Err(e) = self
                .store
                .expire(&session_key(&conn_id), SESSION_TTL_SECS)
                .await
            {
                tracing::warn!(%conn_id, "Session heartbeat failed: {e}");
            }
        }
    }

    /// Deliver an event to a connection anywhere in the cluster.
    /// Best-effort: failures are logged and swallowed.
    pub async fn deliver(&self, conn_id: &str, event: ServerEvent) {
        if self.deliver_local(conn_id, event.clone()) {
            return;
        }
        let envelope = Envelope {
            target: conn_id.to_string(),
            event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(%conn_id, "Failed to encode delivery envelope: {e}");
                return;
            }
        };
        if let Err(e) = self.store.publish(DELIVER_CHANNEL, &payload).await {
            tracing::warn!(%conn_id, "Bus delivery failed: {e}");
        }
    }

    /// Deliver to a locally-owned connection. Returns false when the target
    /// is not ours, so the caller can fan out over the bus instead.
    pub fn deliver_local(&self, conn_id: &str, event: ServerEvent) -> bool {
        let local = self.local.lock();
        match local.get(conn_id) {
            Some(handle) => {
                if let Err(e) = handle.tx.try_send(event) {
                    tracing::warn!(%conn_id, "Dropping event for slow or closed connection: {e}");
                }
                true
            }
            None => false,
        }
    }

    /// Cluster-wide liveness test. Local table first (cheap and exact for
    /// our own connections), then the shared session record.
    pub async fn is_connected(&self, conn_id: &str) -> bool {
        if self.local.lock().contains_key(conn_id) {
            return true;
        }
        match self
            .store
            .hash_exists(&session_key(conn_id), "instance")
            .await
        {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(%conn_id, "Presence check failed, treating as gone: {e}");
                false
            }
        }
    }

    /// Remote IP for a connection, wherever it is admitted.
    pub async fn ip_of(&self, conn_id: &str) -> Option<IpAddr> {
        if let Some(handle) = self.local.lock().get(conn_id) {
            return Some(handle.ip);
        }
        let raw = self
            .store
            .hash_get(&session_key(conn_id), "ip")
            .await
            .ok()??;
        raw.parse().ok()
    }

    /// Ids of local connections admitted from the given IP.
    pub fn local_ids_with_ip(&self, ip: IpAddr) -> Vec<String> {
        self.local
            .lock()
            .iter()
            .filter(|(_, h)| h.ip == ip)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// All local connection ids.
    pub fn local_ids(&self) -> Vec<String> {
        self.local.lock().keys().cloned().collect()
    }

    pub fn local_count(&self) -> usize {
        self.local.lock().len()
    }

    /// Shutdown support: empty the local table, dropping every outbound
    /// sender so each connection task unblocks and runs its cleanup.
    pub fn drain_local(&self) {
        self.local.lock().clear();
    }
}
