//! Server state, runtime and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::abuse::{AbuseController, BanNotice, BANS_CHANNEL};
use crate::config::ServerConfig;
use crate::connid;
use crate::events::{Envelope, ServerEvent};
use crate::matchmaker::Matchmaker;
use crate::pairs::PairManager;
use crate::queue::QueueManager;
use crate::registry::{Registry, DELIVER_CHANNEL, HEARTBEAT_SECS};
use crate::relay::SignalRelay;
use crate::store::{RedisStore, Store};
use crate::web;

/// Everything a request or connection handler needs, shared by `Arc`.
pub struct SharedState {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub registry: Arc<Registry>,
    pub matchmaker: Matchmaker,
    pub relay: SignalRelay,
    pub abuse: AbuseController,
    pub started_at: Instant,
}

impl SharedState {
    /// Wire up the component graph over the given store. Each instance gets
    /// a fresh id; it only has to be unique across the live fleet, so the
    /// connection-id generator does fine.
    pub fn build(config: ServerConfig, store: Arc<dyn Store>) -> Arc<Self> {
        let instance_id = connid::generate();
        let registry = Arc::new(Registry::new(instance_id, store.clone()));
        let pairs = Arc::new(PairManager::new(store.clone()));
        let queue = QueueManager::new(store.clone(), registry.clone());
        let matchmaker = Matchmaker::new(queue, pairs.clone(), registry.clone());
        let relay = SignalRelay::new(pairs.clone(), registry.clone());
        let abuse = AbuseController::new(store.clone(), registry.clone(), pairs);
        Arc::new(Self {
            config,
            store,
            registry,
            matchmaker,
            relay,
            abuse,
            started_at: Instant::now(),
        })
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run the server until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let store = RedisStore::connect(&self.config.store_url)
            .await
            .with_context(|| format!("Failed to connect to store at {}", self.config.store_url))?;
        let state = SharedState::build(self.config, Arc::new(store));

        state
            .abuse
            .load_cache()
            .await
            .context("Failed to load the ban set")?;

        start_bus_listener(Arc::clone(&state))
            .await
            .context("Failed to subscribe to the event bus")?;

        // Keep our session records alive; a crashed instance's records
        // age out and its queued ids read as stale.
        let heartbeat_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
            loop {
                ticker.tick().await;
                heartbeat_state.registry.heartbeat().await;
            }
        });

        let listener = TcpListener::bind(&state.config.listen_addr).await?;
        tracing::info!(instance = %state.registry.instance_id(), "Listening on {}", state.config.listen_addr);

        let app = web::router(Arc::clone(&state));
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        shutdown(&state).await;
        Ok(())
    }
}

/// Pump the shared bus: cross-instance deliveries to our connections, and
/// ban notices for the local cache. Runs for the life of the process.
pub async fn start_bus_listener(state: Arc<SharedState>) -> Result<()> {
    let mut rx = state.store.subscribe(&[DELIVER_CHANNEL, BANS_CHANNEL]).await?;
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg.channel.as_str() {
                DELIVER_CHANNEL => match serde_json::from_str::<Envelope>(&msg.payload) {
                    Ok(envelope) => {
                        // Not ours is the common case: every instance sees
                        // every delivery and exactly one owns the target.
                        state.registry.deliver_local(&envelope.target, envelope.event);
                    }
                    Err(e) => tracing::warn!("Undecodable delivery envelope: {e}"),
                },
                BANS_CHANNEL => match serde_json::from_str::<BanNotice>(&msg.payload) {
                    Ok(notice) => state.abuse.apply_notice(notice).await,
                    Err(e) => tracing::warn!("Undecodable ban notice: {e}"),
                },
                other => tracing::debug!("Ignoring bus message on {other}"),
            }
        }
        tracing::warn!("Bus listener stopped");
    });
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    tracing::info!("Shutdown signal received");
}

/// Drain local connections: paired ones get a synthetic
/// `partner-disconnected` first, then every task's sender is dropped so it
/// unblocks and runs its own cleanup. The explicit cleanup loop below
/// covers tasks that never get to run (it is idempotent with theirs).
async fn shutdown(state: &Arc<SharedState>) {
    let ids = state.registry.local_ids();
    tracing::info!("Shutting down with {} local connections", ids.len());

    for conn_id in &ids {
        match state.matchmaker.pairs().partner(conn_id).await {
            Ok(Some(_)) => {
                state
                    .registry
                    .deliver_local(conn_id, ServerEvent::PartnerDisconnected);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%conn_id, "Partner lookup failed during shutdown: {e}"),
        }
    }

    state.registry.drain_local();

    for conn_id in &ids {
        state.registry.unregister(conn_id).await;
        if let Err(e) = state.matchmaker.on_disconnect(conn_id).await {
            tracing::warn!(%conn_id, "Shutdown cleanup failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn bus_listener_routes_deliveries_and_ban_notices() {
        let store = Arc::new(MemoryStore::new());
        let state = SharedState::build(ServerConfig::for_tests(), store.clone());
        start_bus_listener(Arc::clone(&state)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        state
            .registry
            .register("C1", "10.0.0.1".parse().unwrap(), tx)
            .await;

        // A delivery published by "another instance".
        let envelope = Envelope {
            target: "C1".into(),
            event: ServerEvent::Waiting,
        };
        store
            .publish(DELIVER_CHANNEL, &serde_json::to_string(&envelope).unwrap())
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(ServerEvent::Waiting));

        // A ban minted elsewhere lands in our cache.
        let notice = crate::abuse::BanNotice {
            op: crate::abuse::BanOp::Ban,
            ip: "1.2.3.4".parse().unwrap(),
            reason: Some("spam".into()),
            origin: "someone-else".into(),
        };
        store
            .publish(BANS_CHANNEL, &serde_json::to_string(&notice).unwrap())
            .await
            .unwrap();

        // The listener runs concurrently; poll until the cache flips.
        for _ in 0..50 {
            if !state.abuse.admission_allowed("1.2.3.4".parse().unwrap()) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("ban notice never applied");
    }

    #[tokio::test]
    async fn shutdown_notifies_paired_and_cleans_the_store() {
        let store = Arc::new(MemoryStore::new());
        let state = SharedState::build(ServerConfig::for_tests(), store.clone());

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        state.registry.register("A", "10.0.0.1".parse().unwrap(), tx_a).await;
        state.registry.register("B", "10.0.0.2".parse().unwrap(), tx_b).await;
        state.matchmaker.join("A").await.unwrap();
        state.matchmaker.join("B").await.unwrap();
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        shutdown(&state).await;

        assert_eq!(rx_a.recv().await, Some(ServerEvent::PartnerDisconnected));
        assert_eq!(rx_b.recv().await, Some(ServerEvent::PartnerDisconnected));
        assert_eq!(state.matchmaker.pairs().partner("A").await.unwrap(), None);
        assert!(!state.registry.is_connected("A").await);
        assert!(!state.registry.is_connected("B").await);
    }
}
