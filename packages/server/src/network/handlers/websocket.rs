//! WebSocket upgrade handler: the read/write loop every connection runs
//! (spec §3 "Connection"/"Channel", §4.1, §4.2).
//!
//! One task per connection drains the connection's shared outbound queue
//! and writes frames back in whichever encoding (text/binary) the client's
//! most recent inbound frame used (spec §4.1 "frame encoding mirrors the
//! client's"); the upgrade task itself reads inbound frames and feeds them
//! to [`crate::Hub::dispatch`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use hub_core::Message;
use tracing::{debug, warn};

use super::AppState;
use crate::network::connection::{ConnectionHandle, OutboundFrame};

/// How often the keepalive watcher wakes to check whether a ping is due or
/// the connection has timed out. Finer-grained than any realistic
/// interval/timeout so scenarios like S6 (1s/2s) fire on schedule.
const KEEPALIVE_TICK: Duration = Duration::from_millis(250);

/// Device registrations tighten their owning connection's keepalive to this
/// interval/timeout (spec §4.9 step 2).
const DEVICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const DEVICE_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn ws_upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _guard = state.shutdown.in_flight_guard();
    let (conn, out_rx) = state.registry.register(&state.config.connection);
    let (sink, mut stream) = socket.split();

    let write_task = tokio::spawn(run_write_loop(sink, out_rx, Arc::clone(&conn)));
    let mut keepalive_ticker = tokio::time::interval(KEEPALIVE_TICK);

    loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    WsMessage::Text(text) => {
                        conn.note_inbound_activity();
                        handle_frame(&state, &conn, text.as_bytes(), false).await;
                    }
                    WsMessage::Binary(bytes) => {
                        conn.note_inbound_activity();
                        handle_frame(&state, &conn, &bytes, true).await;
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) => conn.note_inbound_activity(),
                    WsMessage::Close(_) => break,
                }
            }
            _ = keepalive_ticker.tick() => {
                if conn.keepalive_expired() {
                    warn!("keepalive timeout, tearing down connection");
                    break;
                }
                if conn.keepalive_due() {
                    conn.send_ping();
                    conn.note_ping_sent();
                }
            }
        }
    }

    write_task.abort();
    for channel in state.registry.teardown(&conn) {
        state.hub.on_channel_disconnect(&channel.id);
    }
}

async fn run_write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut out_rx: tokio::sync::mpsc::Receiver<(String, OutboundFrame)>,
    conn: Arc<ConnectionHandle>,
) {
    while let Some((_uuid, frame)) = out_rx.recv().await {
        let binary = conn.binary_mode.load(Ordering::Relaxed);
        let sent = match frame {
            OutboundFrame::Message(message) => send_frame(&mut sink, &message, binary).await,
            OutboundFrame::Close(reason) => {
                let _ = sink
                    .send(WsMessage::Close(reason.map(|r| axum::extract::ws::CloseFrame {
                        code: 1000,
                        reason: r.into(),
                    })))
                    .await;
                break;
            }
        };
        if sent.is_err() {
            break;
        }
    }
}

async fn handle_frame(state: &AppState, conn: &Arc<ConnectionHandle>, bytes: &[u8], binary: bool) {
    let Ok(msg) = serde_json::from_slice::<Message>(bytes) else {
        warn!("dropping malformed inbound frame");
        return;
    };
    conn.binary_mode.store(binary, Ordering::Relaxed);

    if msg.command == "ping" {
        // A ping carries no uuid and is answered directly on the physical
        // link, not routed through a channel (spec §4.1, §4.2).
        conn.send(Message::new("pong"));
        return;
    }

    let Some(uuid) = msg.uuid.clone() else {
        // Legacy empty-uuid broadcast: reflect to every channel on this
        // physical connection rather than dispatching (spec §4.2).
        debug!("broadcasting empty-uuid legacy frame to local channels");
        conn.broadcast_local(&msg);
        return;
    };

    if msg.command == "connection:register" {
        state.registry.register_channel(conn, &uuid);
        return;
    }

    let channels = state.registry.channels();
    state.hub.dispatch(&channels, &msg, &uuid, now_millis()).await;

    if msg.command == "node:register" {
        state
            .registry
            .tighten_keepalive_for_channel(&uuid, DEVICE_KEEPALIVE_INTERVAL, DEVICE_KEEPALIVE_TIMEOUT);
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    message: &Message,
    binary: bool,
) -> Result<(), axum::Error> {
    let bytes = serde_json::to_vec(message).unwrap_or_default();
    if binary {
        sink.send(WsMessage::Binary(bytes.into())).await
    } else {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        sink.send(WsMessage::Text(text.into())).await
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
