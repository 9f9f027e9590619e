//! Per-client connection handler.
//!
//! Each admitted WebSocket gets one task that owns both halves of the
//! socket: inbound frames are dispatched one at a time (a connection never
//! races itself), outbound events arrive on the registry channel and are
//! serialized in order. A `banned` event closes the socket right after the
//! frame goes out.
//!
//! Nothing here propagates errors across the connection boundary: malformed
//! frames are logged and dropped, store failures surface to the client as an
//! `error` event, and the terminal cleanup runs exactly once when the loop
//! exits for any reason.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::abuse;
use crate::connid;
use crate::events::{ClientEvent, ServerEvent};
use crate::server::SharedState;
use crate::store::StoreResult;

/// Outbound event queue depth per connection. Signaling traffic is tiny;
/// a full queue means the client stopped reading.
const OUTBOUND_BUFFER: usize = 64;

pub async fn handle_socket(socket: WebSocket, ip: IpAddr, state: Arc<SharedState>) {
    let conn_id = connid::generate();
    tracing::info!(%conn_id, %ip, "Connection admitted");

    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
    state.registry.register(&conn_id, ip, tx).await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut last_next: Option<Instant> = None;

    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = dispatch(&state, &conn_id, &text, &mut last_next).await {
                            tracing::error!(%conn_id, "Operation failed: {e}");
                            state
                                .registry
                                .deliver_local(&conn_id, ServerEvent::Error {
                                    message: "internal error".into(),
                                });
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(%conn_id, "Socket error: {e}");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        let force_close = matches!(event, ServerEvent::Banned { .. });
                        let frame = match serde_json::to_string(&event) {
                            Ok(f) => f,
                            Err(e) => {
                                tracing::error!(%conn_id, "Failed to encode event: {e}");
                                continue;
                            }
                        };
                        if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                            break;
                        }
                        if force_close {
                            let _ = ws_tx.close().await;
                            break;
                        }
                    }
                    // Registry dropped our sender (shutdown or ban sweep).
                    None => break,
                }
            }
        }
    }

    state.registry.unregister(&conn_id).await;
    if let Err(e) = state.matchmaker.on_disconnect(&conn_id).await {
        tracing::error!(%conn_id, "Disconnect cleanup failed: {e}");
    }
    tracing::info!(%conn_id, "Connection closed");
}

/// Route one inbound frame. A malformed frame is dropped without a reply;
/// an `Err` from here means a store failure in an operation the client
/// asked for, and the caller answers with an `error` event.
async fn dispatch(
    state: &Arc<SharedState>,
    conn_id: &str,
    text: &str,
    last_next: &mut Option<Instant>,
) -> StoreResult<()> {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(%conn_id, "Malformed client frame: {e}");
            return Ok(());
        }
    };

    match event {
        ClientEvent::Join => state.matchmaker.join(conn_id).await,
        ClientEvent::Next => {
            let now = Instant::now();
            if !abuse::cooldown_ok(*last_next, now) {
                state
                    .registry
                    .deliver(conn_id, ServerEvent::Error {
                        message: "cooldown".into(),
                    })
                    .await;
                return Ok(());
            }
            *last_next = Some(now);
            state.matchmaker.next(conn_id).await
        }
        ClientEvent::Leave => state.matchmaker.leave(conn_id).await,
        ClientEvent::Signal { peer, signal } => {
            state.relay.relay(conn_id, &peer, signal).await
        }
        ClientEvent::Report { peer, reason } => {
            state.abuse.report(conn_id, &peer, &reason).await
        }
    }
}
