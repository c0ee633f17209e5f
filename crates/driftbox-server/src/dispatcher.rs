//! Per-connection frame pump.
//!
//! Each WebSocket connection gets one read loop and one writer task. The
//! read loop owns the connection's `ConnState` and processes requests in
//! arrival order, so acks always return in send order. All outbound frames
//! (acks and broadcasts) funnel through the connection's registry queue,
//! which is what guarantees ack-before-own-broadcast ordering.
//!
//! Application errors never tear a connection down; only transport failure
//! or a close frame ends the loop.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use driftbox_shared::protocol::{MemberCountEvent, ServerEvent, WireFrame};

use crate::api::AppState;
use crate::handlers::{handle_frame, ConnState};

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    // Frame cap: one-shot uploads plus metadata headroom. Anything larger
    // must take the chunked path.
    let max_frame = state.config.max_file_size as usize + 1024 * 1024;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let conn_id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<bytes::Bytes>();
    state.rooms.register(conn_id, outbound_tx).await;
    debug!(conn = %conn_id, "Connection established");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnState::new(conn_id);
    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(Message::Binary(data)) => process_incoming(&state, &mut conn, &data).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(conn = %conn_id, error = %err, "Transport error");
                break;
            }
        }
    }

    disconnect(&state, &conn).await;
    writer.abort();
    debug!(conn = %conn_id, "Connection closed");
}

/// Decode and dispatch one raw inbound message. Undecodable bytes are a
/// protocol violation: logged, never acked.
pub async fn process_incoming(state: &AppState, conn: &mut ConnState, data: &[u8]) {
    match WireFrame::from_bytes(data) {
        Ok(frame) => handle_frame(state, conn, frame).await,
        Err(err) => {
            warn!(conn = %conn.id, error = %err, "Dropping undecodable frame");
        }
    }
}

/// Tear-down shared by close frames and transport errors: unbind the
/// member, tell the room, drop the outbound queue.
pub async fn disconnect(state: &AppState, conn: &ConnState) {
    state.rooms.unregister(conn.id).await;
    if let Some((code, remaining)) = state.store.remove_member(conn.id).await {
        let members = state.store.members_of(&code).await;
        state
            .rooms
            .broadcast(
                &members,
                &ServerEvent::MemberLeft(MemberCountEvent {
                    member_count: remaining,
                }),
            )
            .await;
    }
}
