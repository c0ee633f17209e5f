//! Request handlers, one per named operation.
//!
//! Every handler queues its ack on the caller's outbound channel before any
//! broadcast describing the same mutation, so a connection never sees an
//! event for its own request ahead of the ack.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use driftbox_shared::codes::{is_valid_file_id, is_valid_session_code, new_file_id};
use driftbox_shared::protocol::{
    decode, Ack, ChunkReceivedEvent, FileDeleteRequest, FileDeletedEvent, FileDownloadReply,
    FilePayload, FileReply, FileRequest, FrameKind, JoinRequest, MemberCountEvent,
    MessageDeleteRequest,
    MessageDeletedEvent, MessageReply, MessageSendRequest, OkReply, RequestName, ServerEvent,
    UploadChunkReply, UploadChunkRequest, UploadCompleteRequest, UploadRequest, UploadStartReply,
    UploadStartRequest, WireFrame,
};
use driftbox_shared::ErrorKind;
use driftbox_store::NewFile;

use crate::api::AppState;
use crate::error::{store_error_kind, store_error_kind_for_upload, upload_error_kind};
use crate::uploads::CompleteOutcome;

/// Per-connection dispatcher state. The store's binding map stays
/// authoritative; this mirrors it for the single task that owns the
/// connection, along with the display name given at join.
#[derive(Debug)]
pub struct ConnState {
    pub id: Uuid,
    pub session: Option<String>,
    pub display_name: Option<String>,
}

impl ConnState {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            session: None,
            display_name: None,
        }
    }
}

/// Entry point for one inbound frame. Protocol violations (wrong frame
/// kind, missing ack id, unknown name, undecodable payload) are logged and
/// dropped; application errors always travel back as negative acks.
pub async fn handle_frame(state: &AppState, conn: &mut ConnState, frame: WireFrame) {
    if frame.kind != FrameKind::Request {
        warn!(conn = %conn.id, name = %frame.name, "Dropping non-request frame");
        return;
    }
    let Some(ack_id) = frame.ack_id else {
        warn!(conn = %conn.id, name = %frame.name, "Dropping request without ack id");
        return;
    };
    let name = match RequestName::parse(&frame.name) {
        Ok(name) => name,
        Err(err) => {
            warn!(conn = %conn.id, error = %err, "Protocol violation");
            return;
        }
    };

    match name {
        RequestName::SessionCreate => session_create(state, conn, ack_id).await,
        RequestName::SessionJoin => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                session_join(state, conn, ack_id, req).await;
            }
        }
        RequestName::SessionLeave => session_leave(state, conn, ack_id).await,
        RequestName::FileUpload => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                file_upload(state, conn, ack_id, req).await;
            }
        }
        RequestName::FileUploadStart => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                file_upload_start(state, conn, ack_id, req).await;
            }
        }
        RequestName::FileUploadChunk => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                file_upload_chunk(state, conn, ack_id, req).await;
            }
        }
        RequestName::FileUploadComplete => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                file_upload_complete(state, conn, ack_id, req).await;
            }
        }
        RequestName::FileRequest => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                file_request(state, conn, ack_id, req).await;
            }
        }
        RequestName::FileDelete => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                file_delete(state, conn, ack_id, req).await;
            }
        }
        RequestName::MessageSend => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                message_send(state, conn, ack_id, req).await;
            }
        }
        RequestName::MessageDelete => {
            if let Some(req) = decode_request(conn, name, &frame.payload) {
                message_delete(state, conn, ack_id, req).await;
            }
        }
    }
}

fn decode_request<T: DeserializeOwned>(
    conn: &ConnState,
    name: RequestName,
    payload: &[u8],
) -> Option<T> {
    match decode(payload) {
        Ok(req) => Some(req),
        Err(err) => {
            warn!(
                conn = %conn.id,
                name = name.as_str(),
                error = %err,
                "Dropping request with undecodable payload"
            );
            None
        }
    }
}

async fn send_ok<T: Serialize>(
    state: &AppState,
    conn: Uuid,
    name: RequestName,
    ack_id: u64,
    reply: &T,
) {
    let ack: Ack<&T> = Ack::Ok(reply);
    state
        .rooms
        .send_frame(conn, &WireFrame::ack(name.as_str(), ack_id, &ack))
        .await;
}

async fn send_err(state: &AppState, conn: Uuid, name: RequestName, ack_id: u64, kind: ErrorKind) {
    let ack: Ack<()> = Ack::Err(kind.into());
    state
        .rooms
        .send_frame(conn, &WireFrame::ack(name.as_str(), ack_id, &ack))
        .await;
}

async fn broadcast_to_session(state: &AppState, code: &str, event: &ServerEvent) {
    let members = state.store.members_of(code).await;
    state.rooms.broadcast(&members, event).await;
}

async fn broadcast_to_others(state: &AppState, code: &str, except: Uuid, event: &ServerEvent) {
    let members = state.store.members_of(code).await;
    state.rooms.broadcast_except(&members, except, event).await;
}

/// The ack deadline this server runs with, advertised on create/join so
/// clients pick up the `RPC_TIMEOUT_MS` override.
fn rpc_timeout_ms(state: &AppState) -> u64 {
    state.config.rpc_timeout.as_millis() as u64
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

async fn session_create(state: &AppState, conn: &mut ConnState, ack_id: u64) {
    let reply = state
        .store
        .create_session(conn.id)
        .await
        .with_rpc_timeout(rpc_timeout_ms(state));

    send_ok(state, conn.id, RequestName::SessionCreate, ack_id, &reply).await;

    if let Ok(snapshot) = state.store.snapshot(&reply.session_id).await {
        let snapshot = snapshot.with_rpc_timeout(rpc_timeout_ms(state));
        state
            .rooms
            .send_event(conn.id, &ServerEvent::SessionCreated(snapshot))
            .await;
    }
}

async fn session_join(state: &AppState, conn: &mut ConnState, ack_id: u64, req: JoinRequest) {
    if !is_valid_session_code(&req.session_id) {
        send_err(
            state,
            conn.id,
            RequestName::SessionJoin,
            ack_id,
            ErrorKind::InvalidCode,
        )
        .await;
        return;
    }

    let outcome = match state.store.add_member(&req.session_id, conn.id).await {
        Ok(outcome) => outcome,
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::SessionJoin,
                ack_id,
                store_error_kind(&err),
            )
            .await;
            return;
        }
    };

    let snapshot = outcome.snapshot.with_rpc_timeout(rpc_timeout_ms(state));
    conn.session = Some(snapshot.session_id.clone());
    conn.display_name = req.display_name;

    send_ok(state, conn.id, RequestName::SessionJoin, ack_id, &snapshot).await;
    state
        .rooms
        .send_event(conn.id, &ServerEvent::SessionJoined(snapshot.clone()))
        .await;
    broadcast_to_others(
        state,
        &snapshot.session_id,
        conn.id,
        &ServerEvent::MemberJoined(MemberCountEvent {
            member_count: snapshot.member_count,
        }),
    )
    .await;

    // The room this connection silently moved out of hears about it too.
    if let Some((previous, remaining)) = outcome.previous {
        broadcast_to_session(
            state,
            &previous,
            &ServerEvent::MemberLeft(MemberCountEvent {
                member_count: remaining,
            }),
        )
        .await;
    }
}

async fn session_leave(state: &AppState, conn: &mut ConnState, ack_id: u64) {
    if let Some((code, remaining)) = state.store.remove_member(conn.id).await {
        broadcast_to_session(
            state,
            &code,
            &ServerEvent::MemberLeft(MemberCountEvent {
                member_count: remaining,
            }),
        )
        .await;
    }
    conn.session = None;
    conn.display_name = None;

    send_ok(
        state,
        conn.id,
        RequestName::SessionLeave,
        ack_id,
        &OkReply { ok: true },
    )
    .await;
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

async fn file_upload(state: &AppState, conn: &mut ConnState, ack_id: u64, req: UploadRequest) {
    let Some(code) = conn.session.clone() else {
        send_err(
            state,
            conn.id,
            RequestName::FileUpload,
            ack_id,
            ErrorKind::NotJoined,
        )
        .await;
        return;
    };

    let file = NewFile {
        id: new_file_id(),
        filename: req.filename,
        mime_type: req.mime_type,
        payload: Bytes::from(req.data),
        uploaded_by: conn.id,
    };

    match state.store.add_file(&code, file).await {
        Ok(metadata) => {
            info!(
                conn = %conn.id,
                session = %code,
                file = %metadata.file_id,
                size = metadata.size,
                "File uploaded"
            );
            send_ok(
                state,
                conn.id,
                RequestName::FileUpload,
                ack_id,
                &FileReply {
                    file: metadata.clone(),
                },
            )
            .await;
            broadcast_to_session(state, &code, &ServerEvent::FileAdded(FileReply { file: metadata }))
                .await;
        }
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::FileUpload,
                ack_id,
                store_error_kind_for_upload(&err),
            )
            .await;
        }
    }
}

async fn file_upload_start(
    state: &AppState,
    conn: &mut ConnState,
    ack_id: u64,
    req: UploadStartRequest,
) {
    let Some(code) = conn.session.clone() else {
        send_err(
            state,
            conn.id,
            RequestName::FileUploadStart,
            ack_id,
            ErrorKind::NotJoined,
        )
        .await;
        return;
    };

    match state
        .uploads
        .start(
            &code,
            conn.id,
            &req.filename,
            req.mime_type,
            req.size,
            req.total_chunks,
        )
        .await
    {
        Ok(upload_id) => {
            send_ok(
                state,
                conn.id,
                RequestName::FileUploadStart,
                ack_id,
                &UploadStartReply { upload_id },
            )
            .await;
        }
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::FileUploadStart,
                ack_id,
                upload_error_kind(&err),
            )
            .await;
        }
    }
}

async fn file_upload_chunk(
    state: &AppState,
    conn: &mut ConnState,
    ack_id: u64,
    req: UploadChunkRequest,
) {
    if conn.session.is_none() {
        send_err(
            state,
            conn.id,
            RequestName::FileUploadChunk,
            ack_id,
            ErrorKind::NotJoined,
        )
        .await;
        return;
    }

    match state
        .uploads
        .chunk(&req.upload_id, req.chunk_index, Bytes::from(req.chunk_data))
        .await
    {
        Ok(outcome) => {
            send_ok(
                state,
                conn.id,
                RequestName::FileUploadChunk,
                ack_id,
                &UploadChunkReply {
                    received: outcome.received,
                    total: outcome.total,
                    is_complete: outcome.is_complete,
                },
            )
            .await;
            state
                .rooms
                .send_event(
                    conn.id,
                    &ServerEvent::FileChunkReceived(ChunkReceivedEvent {
                        upload_id: req.upload_id,
                        chunk_index: req.chunk_index,
                        received: outcome.received,
                        total: outcome.total,
                        progress: outcome.received as f32 / outcome.total as f32,
                    }),
                )
                .await;
        }
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::FileUploadChunk,
                ack_id,
                upload_error_kind(&err),
            )
            .await;
        }
    }
}

async fn file_upload_complete(
    state: &AppState,
    conn: &mut ConnState,
    ack_id: u64,
    req: UploadCompleteRequest,
) {
    if conn.session.is_none() {
        send_err(
            state,
            conn.id,
            RequestName::FileUploadComplete,
            ack_id,
            ErrorKind::NotJoined,
        )
        .await;
        return;
    }

    let assembled = match state.uploads.complete(&req.upload_id).await {
        Ok(CompleteOutcome::Assembled(assembled)) => assembled,
        Ok(CompleteOutcome::AlreadyStored(metadata)) => {
            // Duplicate complete: re-ack with the same metadata, no rebroadcast.
            send_ok(
                state,
                conn.id,
                RequestName::FileUploadComplete,
                ack_id,
                &FileReply { file: metadata },
            )
            .await;
            return;
        }
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::FileUploadComplete,
                ack_id,
                upload_error_kind(&err),
            )
            .await;
            return;
        }
    };

    let code = assembled.session_code.clone();
    let file = NewFile {
        id: new_file_id(),
        filename: assembled.filename,
        mime_type: assembled.mime_type,
        payload: assembled.payload,
        uploaded_by: assembled.uploaded_by,
    };

    match state.store.add_file(&code, file).await {
        Ok(metadata) => {
            state.uploads.finish(&req.upload_id, metadata.clone()).await;
            info!(
                conn = %conn.id,
                session = %code,
                file = %metadata.file_id,
                size = metadata.size,
                upload = %req.upload_id,
                "Chunked upload completed"
            );
            send_ok(
                state,
                conn.id,
                RequestName::FileUploadComplete,
                ack_id,
                &FileReply {
                    file: metadata.clone(),
                },
            )
            .await;
            broadcast_to_session(state, &code, &ServerEvent::FileAdded(FileReply { file: metadata }))
                .await;
        }
        Err(err) => {
            // Chunks were not drained; the client may retry the complete.
            send_err(
                state,
                conn.id,
                RequestName::FileUploadComplete,
                ack_id,
                store_error_kind_for_upload(&err),
            )
            .await;
        }
    }
}

async fn file_request(state: &AppState, conn: &mut ConnState, ack_id: u64, req: FileRequest) {
    let Some(code) = conn.session.clone() else {
        send_err(
            state,
            conn.id,
            RequestName::FileRequest,
            ack_id,
            ErrorKind::NotJoined,
        )
        .await;
        return;
    };
    if !is_valid_file_id(&req.file_id) {
        send_err(
            state,
            conn.id,
            RequestName::FileRequest,
            ack_id,
            ErrorKind::InvalidCode,
        )
        .await;
        return;
    }

    match state.store.file_payload(&code, &req.file_id).await {
        Ok((metadata, payload)) => {
            // The Bytes handle keeps the payload alive even if the file is
            // deleted while this reply is in flight; the copy into the wire
            // record happens here, at the egress edge.
            let reply = FileDownloadReply {
                file: FilePayload {
                    file_id: metadata.file_id,
                    filename: metadata.filename,
                    mime_type: metadata.mime_type,
                    size: metadata.size,
                    data: payload.to_vec(),
                },
            };
            send_ok(state, conn.id, RequestName::FileRequest, ack_id, &reply).await;
        }
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::FileRequest,
                ack_id,
                store_error_kind(&err),
            )
            .await;
        }
    }
}

async fn file_delete(state: &AppState, conn: &mut ConnState, ack_id: u64, req: FileDeleteRequest) {
    let Some(code) = conn.session.clone() else {
        send_err(
            state,
            conn.id,
            RequestName::FileDelete,
            ack_id,
            ErrorKind::NotJoined,
        )
        .await;
        return;
    };
    if !is_valid_file_id(&req.file_id) {
        send_err(
            state,
            conn.id,
            RequestName::FileDelete,
            ack_id,
            ErrorKind::InvalidCode,
        )
        .await;
        return;
    }

    match state.store.delete_file(&code, &req.file_id).await {
        Ok(()) => {
            send_ok(
                state,
                conn.id,
                RequestName::FileDelete,
                ack_id,
                &OkReply { ok: true },
            )
            .await;
            broadcast_to_session(
                state,
                &code,
                &ServerEvent::FileDeleted(FileDeletedEvent {
                    file_id: req.file_id,
                }),
            )
            .await;
        }
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::FileDelete,
                ack_id,
                store_error_kind(&err),
            )
            .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn message_send(state: &AppState, conn: &mut ConnState, ack_id: u64, req: MessageSendRequest) {
    let Some(code) = conn.session.clone() else {
        send_err(
            state,
            conn.id,
            RequestName::MessageSend,
            ack_id,
            ErrorKind::NotJoined,
        )
        .await;
        return;
    };

    match state
        .store
        .add_message(&code, conn.id, conn.display_name.clone(), &req.content)
        .await
    {
        Ok(message) => {
            send_ok(
                state,
                conn.id,
                RequestName::MessageSend,
                ack_id,
                &MessageReply {
                    message: message.clone(),
                },
            )
            .await;
            broadcast_to_session(state, &code, &ServerEvent::MessageAdded(MessageReply { message }))
                .await;
        }
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::MessageSend,
                ack_id,
                store_error_kind(&err),
            )
            .await;
        }
    }
}

async fn message_delete(
    state: &AppState,
    conn: &mut ConnState,
    ack_id: u64,
    req: MessageDeleteRequest,
) {
    let Some(code) = conn.session.clone() else {
        send_err(
            state,
            conn.id,
            RequestName::MessageDelete,
            ack_id,
            ErrorKind::NotJoined,
        )
        .await;
        return;
    };

    match state
        .store
        .delete_message(&code, &req.message_id, conn.id)
        .await
    {
        Ok(()) => {
            send_ok(
                state,
                conn.id,
                RequestName::MessageDelete,
                ack_id,
                &OkReply { ok: true },
            )
            .await;
            broadcast_to_session(
                state,
                &code,
                &ServerEvent::MessageDeleted(MessageDeletedEvent {
                    message_id: req.message_id,
                }),
            )
            .await;
        }
        Err(err) => {
            send_err(
                state,
                conn.id,
                RequestName::MessageDelete,
                ack_id,
                store_error_kind(&err),
            )
            .await;
        }
    }
}
