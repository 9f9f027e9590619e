//! The matchmaker: join / next / leave / disconnect flows.
//!
//! The only component that moves a connection between idle, waiting and
//! paired. All decisions are point-in-time reads against the shared store;
//! the flows stay correct under racing instances because queue pops are
//! destructive, binds are whole-pair writes and dissolves tolerate a
//! half-missing side. A store failure in any step is propagated to the
//! gateway, which logs it and emits an `error` event to the client that
//! triggered the operation.

use std::sync::Arc;

use crate::events::ServerEvent;
use crate::pairs::PairManager;
use crate::queue::QueueManager;
use crate::registry::Registry;
use crate::store::StoreResult;

pub struct Matchmaker {
    queue: QueueManager,
    pairs: Arc<PairManager>,
    registry: Arc<Registry>,
}

impl Matchmaker {
    pub fn new(queue: QueueManager, pairs: Arc<PairManager>, registry: Arc<Registry>) -> Self {
        Self {
            queue,
            pairs,
            registry,
        }
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn pairs(&self) -> &PairManager {
        &self.pairs
    }

    /// A client asked to be matched. No-op if already paired.
    pub async fn join(&self, conn_id: &str) -> StoreResult<()> {
        if self.pairs.partner(conn_id).await?.is_some() {
            return Ok(());
        }
        self.queue.remove(conn_id).await?;
        self.match_or_wait(conn_id).await
    }

    /// A client asked for a different partner. The cooldown check lives in
    /// the gateway (it owns the per-connection clock); by the time we run,
    /// the request is admissible.
    ///
    /// The caller is matched against the queue as it stood before the
    /// dropped partner goes back in, so the partner is never the caller's
    /// instant re-match. When nobody is waiting, the partner is requeued
    /// ahead of the caller and is first in line for the next arrival.
    pub async fn next(&self, conn_id: &str) -> StoreResult<()> {
        if let Some((_, partner)) = self.pairs.dissolve(conn_id).await? {
            self.registry
                .deliver(conn_id, ServerEvent::PartnerDisconnected)
                .await;
            self.registry
                .deliver(&partner, ServerEvent::PartnerDisconnected)
                .await;

            let matched = self.queue.pop_valid(conn_id).await?;
            if self.registry.is_connected(&partner).await {
                self.queue.enqueue(&partner).await?;
            }
            match matched {
                Some(other) => self.bind_and_notify(conn_id, &other).await,
                None => self.queue.enqueue(conn_id).await,
            }
        } else {
            // Pressed while waiting: drop any queue position and fall
            // through to the match step, which re-enqueues at the tail.
            self.queue.remove(conn_id).await?;
            self.match_or_wait(conn_id).await
        }
    }

    /// A client asked to stop. Tears down the pair (requeueing the partner)
    /// and acks with `left`.
    pub async fn leave(&self, conn_id: &str) -> StoreResult<()> {
        if let Some((_, partner)) = self.pairs.dissolve(conn_id).await? {
            self.registry
                .deliver(conn_id, ServerEvent::PartnerDisconnected)
                .await;
            self.registry
                .deliver(&partner, ServerEvent::PartnerDisconnected)
                .await;
            if self.registry.is_connected(&partner).await {
                self.queue.enqueue(&partner).await?;
            }
        }
        self.queue.remove(conn_id).await?;
        self.registry.deliver(conn_id, ServerEvent::Left).await;
        Ok(())
    }

    /// Terminal cleanup after a socket closes. Like `leave`, but nothing is
    /// delivered to the closing connection, and the surviving partner gets
    /// an immediate re-match attempt instead of just a queue slot. Safe to
    /// run more than once.
    pub async fn on_disconnect(&self, conn_id: &str) -> StoreResult<()> {
        if let Some((_, partner)) = self.pairs.dissolve(conn_id).await? {
            self.registry
                .deliver(&partner, ServerEvent::PartnerDisconnected)
                .await;
            if self.registry.is_connected(&partner).await {
                self.match_or_wait(&partner).await?;
            }
        }
        self.queue.remove(conn_id).await?;
        Ok(())
    }

    /// The shared match step: take the earliest valid waiter or join the
    /// queue.
    async fn match_or_wait(&self, conn_id: &str) -> StoreResult<()> {
        match self.queue.pop_valid(conn_id).await? {
            Some(other) => self.bind_and_notify(conn_id, &other).await,
            None => self.queue.enqueue(conn_id).await,
        }
    }

    /// Bind a fresh pair. The mover becomes the initiator — its client
    /// builds the offer, which keeps match-to-first-frame latency down.
    async fn bind_and_notify(&self, mover: &str, waiter: &str) -> StoreResult<()> {
        self.pairs.bind(mover, waiter).await?;
        self.registry
            .deliver(
                mover,
                ServerEvent::Paired {
                    peer: waiter.to_string(),
                    initiator: true,
                },
            )
            .await;
        self.registry
            .deliver(
                waiter,
                ServerEvent::Paired {
                    peer: mover.to_string(),
                    initiator: false,
                },
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QUEUE_KEY;
    use crate::store::{MemoryStore, Store};
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<Registry>,
        mm: Matchmaker,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new("inst-1".into(), store.clone()));
        let mm = Matchmaker::new(
            QueueManager::new(store.clone(), registry.clone()),
            Arc::new(PairManager::new(store.clone())),
            registry.clone(),
        );
        Fixture {
            store,
            registry,
            mm,
        }
    }

    async fn connect(fx: &Fixture, id: &str) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(16);
        fx.registry
            .register(id, "10.0.0.1".parse().unwrap(), tx)
            .await;
        rx
    }

    #[tokio::test]
    async fn join_while_paired_is_a_noop() {
        let fx = fixture();
        let mut a = connect(&fx, "A").await;
        let _b = connect(&fx, "B").await;

        fx.mm.join("A").await.unwrap();
        fx.mm.join("B").await.unwrap();
        assert_eq!(a.recv().await, Some(ServerEvent::Waiting));
        a.recv().await; // paired

        fx.mm.join("A").await.unwrap();
        assert_eq!(
            fx.mm.pairs.partner("A").await.unwrap().as_deref(),
            Some("B")
        );
        assert!(a.try_recv().is_err(), "no event for a redundant join");
    }

    #[tokio::test]
    async fn matchmaker_never_pairs_a_connection_with_itself() {
        let fx = fixture();
        let mut a = connect(&fx, "A").await;

        // A is already queued (twice, even) when its join arrives.
        fx.store.list_push(QUEUE_KEY, "A").await.unwrap();
        fx.store.list_push(QUEUE_KEY, "A").await.unwrap();
        fx.mm.join("A").await.unwrap();

        assert_eq!(fx.mm.pairs.partner("A").await.unwrap(), None);
        assert_eq!(a.recv().await, Some(ServerEvent::Waiting));
    }

    #[tokio::test]
    async fn pairing_removes_queue_presence() {
        let fx = fixture();
        let _a = connect(&fx, "A").await;
        let _b = connect(&fx, "B").await;

        fx.mm.join("A").await.unwrap();
        fx.mm.join("B").await.unwrap();

        // Neither paired connection may sit in the queue.
        assert_eq!(fx.store.list_len(QUEUE_KEY).await.unwrap(), 0);
        assert!(fx.mm.pairs.partner("A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn next_while_waiting_is_never_a_dead_click() {
        let fx = fixture();
        let mut a = connect(&fx, "A").await;
        let _b = connect(&fx, "B").await;
        let _c = connect(&fx, "C").await;

        // Seed three waiters directly; going through join would have
        // paired them already.
        for id in ["A", "B", "C"] {
            fx.store.list_push(QUEUE_KEY, id).await.unwrap();
        }

        fx.mm.next("A").await.unwrap();

        // A paired with the head waiter instead of staying put: a `next`
        // from a waiting connection is never a dead click.
        assert_eq!(
            fx.mm.pairs.partner("A").await.unwrap().as_deref(),
            Some("B")
        );
        assert_eq!(
            a.recv().await,
            Some(ServerEvent::Paired {
                peer: "B".into(),
                initiator: true
            })
        );
    }

    #[tokio::test]
    async fn next_pairs_the_earliest_waiter_and_requeues_the_partner() {
        let fx = fixture();
        let mut a = connect(&fx, "A").await;
        let mut b = connect(&fx, "B").await;
        let mut c = connect(&fx, "C").await;

        fx.mm.join("A").await.unwrap();
        fx.mm.join("B").await.unwrap();
        fx.mm.join("C").await.unwrap();
        while a.try_recv().is_ok() {}
        while b.try_recv().is_ok() {}
        assert_eq!(c.recv().await, Some(ServerEvent::Waiting));

        fx.mm.next("A").await.unwrap();

        assert_eq!(
            fx.mm.pairs.partner("A").await.unwrap().as_deref(),
            Some("C")
        );
        // The dropped partner holds the queue alone.
        assert_eq!(fx.store.list_range(QUEUE_KEY).await.unwrap(), vec!["B"]);
        assert_eq!(b.recv().await, Some(ServerEvent::PartnerDisconnected));
        assert_eq!(b.recv().await, Some(ServerEvent::Waiting));
    }

    #[tokio::test]
    async fn next_never_lands_straight_back_on_the_dropped_partner() {
        let fx = fixture();
        let mut a = connect(&fx, "A").await;
        let _b = connect(&fx, "B").await;

        fx.mm.join("A").await.unwrap();
        fx.mm.join("B").await.unwrap();
        while a.try_recv().is_ok() {}

        fx.mm.next("A").await.unwrap();

        assert_eq!(fx.mm.pairs.partner("A").await.unwrap(), None);
        assert_eq!(
            fx.store.list_range(QUEUE_KEY).await.unwrap(),
            vec!["B", "A"]
        );
    }

    #[tokio::test]
    async fn next_with_empty_queue_requeues_the_caller() {
        let fx = fixture();
        let mut a = connect(&fx, "A").await;

        fx.mm.join("A").await.unwrap();
        assert_eq!(a.recv().await, Some(ServerEvent::Waiting));

        fx.mm.next("A").await.unwrap();
        assert_eq!(a.recv().await, Some(ServerEvent::Waiting));
        assert_eq!(fx.store.list_range(QUEUE_KEY).await.unwrap(), vec!["A"]);
    }

    #[tokio::test]
    async fn disconnect_cleanup_is_idempotent() {
        let fx = fixture();
        let _a = connect(&fx, "A").await;
        let mut b = connect(&fx, "B").await;

        fx.mm.join("A").await.unwrap();
        fx.mm.join("B").await.unwrap();
        while b.try_recv().is_ok() {} // drain the paired event

        fx.registry.unregister("A").await;
        fx.mm.on_disconnect("A").await.unwrap();
        fx.mm.on_disconnect("A").await.unwrap();

        // B was notified once per cleanup that actually dissolved: exactly one.
        assert_eq!(b.recv().await, Some(ServerEvent::PartnerDisconnected));
        assert_eq!(b.recv().await, Some(ServerEvent::Waiting));
        assert!(b.try_recv().is_err());
        assert_eq!(fx.store.list_range(QUEUE_KEY).await.unwrap(), vec!["B"]);
    }

    #[tokio::test]
    async fn disconnect_rematches_the_survivor_immediately() {
        let fx = fixture();
        let _a = connect(&fx, "A").await;
        let mut b = connect(&fx, "B").await;
        let mut c = connect(&fx, "C").await;

        fx.mm.join("A").await.unwrap();
        fx.mm.join("B").await.unwrap();
        fx.mm.join("C").await.unwrap();
        while b.try_recv().is_ok() {}
        assert_eq!(c.recv().await, Some(ServerEvent::Waiting));

        fx.registry.unregister("A").await;
        fx.mm.on_disconnect("A").await.unwrap();

        assert_eq!(b.recv().await, Some(ServerEvent::PartnerDisconnected));
        assert_eq!(
            b.recv().await,
            Some(ServerEvent::Paired {
                peer: "C".into(),
                initiator: true
            })
        );
        assert_eq!(
            c.recv().await,
            Some(ServerEvent::Paired {
                peer: "B".into(),
                initiator: false
            })
        );
    }
}
