//! End-to-end matchmaking flows over the in-process store.
//!
//! Covers:
//! - first pairing: waiting, then paired with correct initiator flags
//! - signal relay between partners, verbatim, and spoofed-peer drops
//! - next while paired: teardown, partner requeue, caller re-match
//! - disconnect: survivor notified and re-matched with the next waiter
//! - join/leave round trip restoring the initial global state
//! - auto-ban after five reports, with the banned event to the subject
//! - two instances sharing one store and pairing across the bus

use std::sync::Arc;

use rondo_server::config::ServerConfig;
use rondo_server::events::ServerEvent;
use rondo_server::server::{start_bus_listener, SharedState};
use rondo_server::store::MemoryStore;
use serde_json::json;
use tokio::sync::mpsc;

fn test_config() -> ServerConfig {
    ServerConfig {
        store_url: "redis://unused".into(),
        listen_addr: "127.0.0.1:0".into(),
        admin_secret: None,
        allowed_origins: Vec::new(),
        stun_urls: vec!["stun:stun.l.google.com:19302".into()],
        turn_url: None,
        turn_username: None,
        turn_credential: None,
    }
}

fn single_instance() -> Arc<SharedState> {
    SharedState::build(test_config(), Arc::new(MemoryStore::new()))
}

async fn client(state: &Arc<SharedState>, id: &str, ip: &str) -> mpsc::Receiver<ServerEvent> {
    let (tx, rx) = mpsc::channel(32);
    state.registry.register(id, ip.parse().unwrap(), tx).await;
    rx
}

#[tokio::test]
async fn two_clients_pair_with_correct_initiator_flags() {
    let state = single_instance();
    let mut a = client(&state, "A", "10.0.0.1").await;
    let mut b = client(&state, "B", "10.0.0.2").await;

    state.matchmaker.join("A").await.unwrap();
    assert_eq!(a.recv().await, Some(ServerEvent::Waiting));

    state.matchmaker.join("B").await.unwrap();
    // B's join caused the match, so B builds the offer.
    assert_eq!(
        b.recv().await,
        Some(ServerEvent::Paired {
            peer: "A".into(),
            initiator: true
        })
    );
    assert_eq!(
        a.recv().await,
        Some(ServerEvent::Paired {
            peer: "B".into(),
            initiator: false
        })
    );
}

#[tokio::test]
async fn paired_clients_exchange_signals_verbatim() {
    let state = single_instance();
    let mut a = client(&state, "A", "10.0.0.1").await;
    let mut b = client(&state, "B", "10.0.0.2").await;
    state.matchmaker.join("A").await.unwrap();
    state.matchmaker.join("B").await.unwrap();
    while a.try_recv().is_ok() {}
    while b.try_recv().is_ok() {}

    let offer = json!({"sdp": "v=0"});
    state.relay.relay("A", "B", offer.clone()).await.unwrap();
    assert_eq!(
        b.recv().await,
        Some(ServerEvent::Signal {
            peer: "A".into(),
            signal: offer
        })
    );

    // Spoofed peer id: dropped, no state change, nothing delivered.
    state
        .relay
        .relay("A", "Z", json!({"sdp": "v=0"}))
        .await
        .unwrap();
    assert!(a.try_recv().is_err());
    assert!(b.try_recv().is_err());
    assert_eq!(
        state.matchmaker.pairs().partner("A").await.unwrap().as_deref(),
        Some("B")
    );
}

#[tokio::test]
async fn next_tears_down_and_requeues_both_sides() {
    let state = single_instance();
    let mut a = client(&state, "A", "10.0.0.1").await;
    let mut b = client(&state, "B", "10.0.0.2").await;
    state.matchmaker.join("A").await.unwrap();
    state.matchmaker.join("B").await.unwrap();
    while a.try_recv().is_ok() {}
    while b.try_recv().is_ok() {}

    state.matchmaker.next("A").await.unwrap();

    assert_eq!(a.recv().await, Some(ServerEvent::PartnerDisconnected));
    assert_eq!(b.recv().await, Some(ServerEvent::PartnerDisconnected));
    // With no one else available, A does not land straight back on B:
    // both wait, B ahead of A.
    assert_eq!(b.recv().await, Some(ServerEvent::Waiting));
    assert_eq!(a.recv().await, Some(ServerEvent::Waiting));
    assert_eq!(state.matchmaker.queue().len().await.unwrap(), 2);

    // The next arrival takes the front of the queue: B.
    let mut d = client(&state, "D", "10.0.0.4").await;
    state.matchmaker.join("D").await.unwrap();
    assert_eq!(
        d.recv().await,
        Some(ServerEvent::Paired {
            peer: "B".into(),
            initiator: true
        })
    );
    assert_eq!(
        b.recv().await,
        Some(ServerEvent::Paired {
            peer: "D".into(),
            initiator: false
        })
    );
}

#[tokio::test]
async fn next_with_nobody_else_leaves_the_caller_waiting() {
    let state = single_instance();
    let mut a = client(&state, "A", "10.0.0.1").await;
    state.matchmaker.join("A").await.unwrap();
    assert_eq!(a.recv().await, Some(ServerEvent::Waiting));

    state.matchmaker.next("A").await.unwrap();
    assert_eq!(a.recv().await, Some(ServerEvent::Waiting));
}

#[tokio::test]
async fn disconnect_rematches_survivor_with_next_waiter() {
    let state = single_instance();
    let _a = client(&state, "A", "10.0.0.1").await;
    let mut b = client(&state, "B", "10.0.0.2").await;
    let mut c = client(&state, "C", "10.0.0.3").await;

    state.matchmaker.join("A").await.unwrap();
    state.matchmaker.join("B").await.unwrap();
    state.matchmaker.join("C").await.unwrap();
    while b.try_recv().is_ok() {}
    assert_eq!(c.recv().await, Some(ServerEvent::Waiting));

    // A's socket dies.
    state.registry.unregister("A").await;
    state.matchmaker.on_disconnect("A").await.unwrap();

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

#[tokio::test]
async fn join_then_leave_restores_the_initial_state() {
    let state = single_instance();
    let mut a = client(&state, "A", "10.0.0.1").await;

    state.matchmaker.join("A").await.unwrap();
    assert_eq!(a.recv().await, Some(ServerEvent::Waiting));

    state.matchmaker.leave("A").await.unwrap();
    assert_eq!(a.recv().await, Some(ServerEvent::Left));

    assert_eq!(state.matchmaker.queue().len().await.unwrap(), 0);
    assert_eq!(state.matchmaker.pairs().entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn leave_while_paired_requeues_the_partner() {
    let state = single_instance();
    let mut a = client(&state, "A", "10.0.0.1").await;
    let mut b = client(&state, "B", "10.0.0.2").await;
    state.matchmaker.join("A").await.unwrap();
    state.matchmaker.join("B").await.unwrap();
    while a.try_recv().is_ok() {}
    while b.try_recv().is_ok() {}

    state.matchmaker.leave("B").await.unwrap();

    assert_eq!(b.recv().await, Some(ServerEvent::PartnerDisconnected));
    assert_eq!(b.recv().await, Some(ServerEvent::Left));
    assert_eq!(a.recv().await, Some(ServerEvent::PartnerDisconnected));
    assert_eq!(a.recv().await, Some(ServerEvent::Waiting));
    assert_eq!(state.matchmaker.queue().len().await.unwrap(), 1);
}

#[tokio::test]
async fn five_reports_ban_the_subject_ip() {
    let state = single_instance();
    let mut subject = client(&state, "S", "9.9.9.9").await;

    for i in 0..5 {
        let reporter = format!("R{i}");
        let mut rx = client(&state, &reporter, &format!("10.0.1.{i}")).await;
        state.matchmaker.pairs().bind(&reporter, "S").await.unwrap();
        state
            .abuse
            .report(&reporter, "S", "inappropriate")
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::ReportSubmitted { success: true })
        );
    }

    assert!(!state.abuse.admission_allowed("9.9.9.9".parse().unwrap()));
    assert_eq!(
        subject.recv().await,
        Some(ServerEvent::Banned {
            reason: "auto-ban: >=5 reports in 24h".into()
        })
    );
}

#[tokio::test]
async fn instances_sharing_a_store_pair_across_the_bus() {
    let store = Arc::new(MemoryStore::new());
    let inst1 = SharedState::build(test_config(), store.clone());
    let inst2 = SharedState::build(test_config(), store.clone());
    start_bus_listener(Arc::clone(&inst1)).await.unwrap();
    start_bus_listener(Arc::clone(&inst2)).await.unwrap();

    let mut a = client(&inst1, "A", "10.0.0.1").await;
    let mut b = client(&inst2, "B", "10.0.0.2").await;

    inst1.matchmaker.join("A").await.unwrap();
    assert_eq!(a.recv().await, Some(ServerEvent::Waiting));

    // B joins on the other instance; A's paired event rides the bus.
    inst2.matchmaker.join("B").await.unwrap();
    assert_eq!(
        b.recv().await,
        Some(ServerEvent::Paired {
            peer: "A".into(),
            initiator: true
        })
    );
    assert_eq!(
        a.recv().await,
        Some(ServerEvent::Paired {
            peer: "B".into(),
            initiator: false
        })
    );

    // Signals flow across instances the same way.
    let offer = json!({"sdp": "v=0"});
    inst2.relay.relay("B", "A", offer.clone()).await.unwrap();
    assert_eq!(
        a.recv().await,
        Some(ServerEvent::Signal {
            peer: "B".into(),
            signal: offer
        })
    );
}

#[tokio::test]
async fn ban_on_one_instance_propagates_to_the_other() {
    let store = Arc::new(MemoryStore::new());
    let inst1 = SharedState::build(test_config(), store.clone());
    let inst2 = SharedState::build(test_config(), store.clone());
    start_bus_listener(Arc::clone(&inst1)).await.unwrap();
    start_bus_listener(Arc::clone(&inst2)).await.unwrap();

    let mut victim = client(&inst2, "V", "9.9.9.9").await;

    inst1
        .abuse
        .ban("9.9.9.9".parse().unwrap(), "spam")
        .await
        .unwrap();

    // inst2 enforces on its own connection once the notice arrives.
    assert_eq!(
        victim.recv().await,
        Some(ServerEvent::Banned {
            reason: "spam".into()
        })
    );
    for _ in 0..50 {
        if !inst2.abuse.admission_allowed("9.9.9.9".parse().unwrap()) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("ban never reached the second instance's cache");
}
