//! Client-side session handle.
//!
//! A [`ClientSession`] owns the transport and the request/ack bookkeeping:
//! every operation is an explicit method taking the handle, with the current
//! session binding carried on the handle rather than in ambient state. Acks
//! are matched by id; a request the server does not acknowledge within the
//! RPC deadline surfaces as [`ClientError::Timeout`]. Room events arrive on
//! a separate stream handed out at connect time.

pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use driftbox_shared::constants::{RPC_TIMEOUT_MS, UPLOAD_CHUNK_SIZE};
use driftbox_shared::protocol::{
    decode, Ack, FileDeleteRequest, FileDownloadReply, FilePayload, FileMetadata, FileReply,
    FileRequest, FrameKind, JoinRequest, MessageDeleteRequest, MessageReply, MessageSendRequest,
    MessageView, OkReply, ProtocolError, RequestName, ServerEvent, SessionCreatedReply,
    SessionSnapshot, UploadChunkReply, UploadChunkRequest, UploadCompleteRequest, UploadRequest,
    UploadStartReply, UploadStartRequest, WireError, WireFrame,
};

use crate::transport::{FrameTransport, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request timed out")]
    Timeout,

    #[error("{}", .0.error)]
    Remote(WireError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,
}

impl ClientError {
    /// Machine tag of the failure, `"Timeout"` for a missed ack deadline.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Timeout => Some("Timeout"),
            ClientError::Remote(err) => Some(&err.code),
            _ => None,
        }
    }
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>>;

pub struct ClientSession {
    transport: Arc<dyn FrameTransport>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    /// Ack deadline in milliseconds. Starts at the stock default and is
    /// replaced by whatever the server advertises on create/join, so an
    /// `RPC_TIMEOUT_MS` override on the server reaches this surface.
    rpc_timeout_ms: AtomicU64,
    session: std::sync::Mutex<Option<String>>,
    demux: JoinHandle<()>,
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

impl ClientSession {
    /// Attach to a transport. Returns the handle plus the stream of room
    /// events pushed by the server.
    pub fn connect(
        transport: Arc<dyn FrameTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        Self::connect_with_timeout(transport, Duration::from_millis(RPC_TIMEOUT_MS))
    }

    pub fn connect_with_timeout(
        transport: Arc<dyn FrameTransport>,
        rpc_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let demux = tokio::spawn(demux_loop(transport.clone(), pending.clone(), events_tx));

        (
            Self {
                transport,
                pending,
                next_ack: AtomicU64::new(0),
                rpc_timeout_ms: AtomicU64::new(rpc_timeout.as_millis() as u64),
                session: std::sync::Mutex::new(None),
                demux,
            },
            events_rx,
        )
    }

    /// The session this handle is currently bound to, if any.
    pub fn session_code(&self) -> Option<String> {
        self.session.lock().unwrap().clone()
    }

    /// The ack deadline currently in effect.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms.load(Ordering::Relaxed))
    }

    fn adopt_rpc_timeout(&self, advertised_ms: u64) {
        if advertised_ms > 0 {
            self.rpc_timeout_ms.store(advertised_ms, Ordering::Relaxed);
        }
    }

    async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        name: RequestName,
        payload: &T,
    ) -> Result<R, ClientError> {
        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(ack_id, tx);

        if let Err(err) = self
            .transport
            .send(WireFrame::request(name, ack_id, payload))
            .await
        {
            self.pending.lock().await.remove(&ack_id);
            return Err(err.into());
        }

        let ack_payload = match tokio::time::timeout(self.rpc_timeout(), rx).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                // The server may still answer later; the stale entry is
                // dropped so the late ack is discarded, not misdelivered.
                self.pending.lock().await.remove(&ack_id);
                return Err(ClientError::Timeout);
            }
        };

        let ack: Ack<R> = decode(&ack_payload)?;
        ack.into_result().map_err(ClientError::Remote)
    }

    // -----------------------------------------------------------------------
    // Session operations
    // -----------------------------------------------------------------------

    pub async fn create_session(&self) -> Result<SessionCreatedReply, ClientError> {
        let reply: SessionCreatedReply = self.request(RequestName::SessionCreate, &()).await?;
        self.adopt_rpc_timeout(reply.rpc_timeout_ms);
        Ok(reply)
    }

    pub async fn join(
        &self,
        session_code: &str,
        display_name: Option<String>,
    ) -> Result<SessionSnapshot, ClientError> {
        let snapshot: SessionSnapshot = self
            .request(
                RequestName::SessionJoin,
                &JoinRequest {
                    session_id: session_code.to_string(),
                    display_name,
                },
            )
            .await?;
        *self.session.lock().unwrap() = Some(snapshot.session_id.clone());
        self.adopt_rpc_timeout(snapshot.rpc_timeout_ms);
        Ok(snapshot)
    }

    pub async fn leave(&self) -> Result<(), ClientError> {
        let _: OkReply = self.request(RequestName::SessionLeave, &()).await?;
        *self.session.lock().unwrap() = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Upload in one shot. Use [`ClientSession::upload_file`] to let the
    /// handle pick the chunked path for large payloads.
    pub async fn upload_small(
        &self,
        filename: &str,
        mime_type: Option<String>,
        data: Vec<u8>,
    ) -> Result<FileMetadata, ClientError> {
        let reply: FileReply = self
            .request(
                RequestName::FileUpload,
                &UploadRequest {
                    filename: filename.to_string(),
                    mime_type,
                    size: data.len() as u64,
                    data,
                },
            )
            .await?;
        Ok(reply.file)
    }

    pub async fn upload_start(
        &self,
        filename: &str,
        mime_type: Option<String>,
        size: u64,
        total_chunks: u32,
    ) -> Result<String, ClientError> {
        let reply: UploadStartReply = self
            .request(
                RequestName::FileUploadStart,
                &UploadStartRequest {
                    filename: filename.to_string(),
                    mime_type,
                    size,
                    total_chunks,
                },
            )
            .await?;
        Ok(reply.upload_id)
    }

    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        chunk_data: Vec<u8>,
    ) -> Result<UploadChunkReply, ClientError> {
        self.request(
            RequestName::FileUploadChunk,
            &UploadChunkRequest {
                upload_id: upload_id.to_string(),
                chunk_index,
                chunk_data,
            },
        )
        .await
    }

    pub async fn upload_complete(&self, upload_id: &str) -> Result<FileMetadata, ClientError> {
        let reply: FileReply = self
            .request(
                RequestName::FileUploadComplete,
                &UploadCompleteRequest {
                    upload_id: upload_id.to_string(),
                },
            )
            .await?;
        Ok(reply.file)
    }

    /// Upload a file, chunking transparently when the payload exceeds the
    /// chunk size. Chunk errors are retried once; idempotence on the server
    /// makes the retry safe.
    pub async fn upload_file(
        &self,
        filename: &str,
        mime_type: Option<String>,
        data: Vec<u8>,
    ) -> Result<FileMetadata, ClientError> {
        if data.len() <= UPLOAD_CHUNK_SIZE {
            return self.upload_small(filename, mime_type, data).await;
        }

        let total_chunks = data.len().div_ceil(UPLOAD_CHUNK_SIZE) as u32;
        let upload_id = self
            .upload_start(filename, mime_type, data.len() as u64, total_chunks)
            .await?;

        for (index, chunk) in data.chunks(UPLOAD_CHUNK_SIZE).enumerate() {
            let index = index as u32;
            match self.upload_chunk(&upload_id, index, chunk.to_vec()).await {
                Ok(_) => {}
                Err(ClientError::Timeout) => {
                    debug!(upload = %upload_id, chunk = index, "Chunk timed out, retrying");
                    self.upload_chunk(&upload_id, index, chunk.to_vec()).await?;
                }
                Err(err) => return Err(err),
            }
        }

        self.upload_complete(&upload_id).await
    }

    pub async fn download(&self, file_id: &str) -> Result<FilePayload, ClientError> {
        let reply: FileDownloadReply = self
            .request(
                RequestName::FileRequest,
                &FileRequest {
                    file_id: file_id.to_string(),
                },
            )
            .await?;
        Ok(reply.file)
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<(), ClientError> {
        let _: OkReply = self
            .request(
                RequestName::FileDelete,
                &FileDeleteRequest {
                    file_id: file_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub async fn send_message(&self, content: &str) -> Result<MessageView, ClientError> {
        let reply: MessageReply = self
            .request(
                RequestName::MessageSend,
                &MessageSendRequest {
                    content: content.to_string(),
                },
            )
            .await?;
        Ok(reply.message)
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<(), ClientError> {
        let _: OkReply = self
            .request(
                RequestName::MessageDelete,
                &MessageDeleteRequest {
                    message_id: message_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

/// Route inbound frames: acks to their waiting request, events to the
/// subscriber stream. Ends when the transport does.
async fn demux_loop(
    transport: Arc<dyn FrameTransport>,
    pending: PendingAcks,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    while let Some(frame) = transport.recv().await {
        match frame.kind {
            FrameKind::Ack => {
                let Some(ack_id) = frame.ack_id else {
                    warn!(name = %frame.name, "Ack frame without id");
                    continue;
                };
                match pending.lock().await.remove(&ack_id) {
                    // The receiver may have timed out; dropping the payload
                    // is exactly the discard the protocol calls for.
                    Some(tx) => {
                        let _ = tx.send(frame.payload);
                    }
                    None => debug!(ack_id, "Discarding ack for abandoned request"),
                }
            }
            FrameKind::Event => match ServerEvent::decode_frame(&frame) {
                Ok(event) => {
                    if events_tx.send(event).is_err() {
                        // Subscriber gone; keep draining acks regardless.
                        debug!("Event subscriber dropped");
                    }
                }
                Err(err) => warn!(name = %frame.name, error = %err, "Undecodable event"),
            },
            FrameKind::Request => {
                warn!(name = %frame.name, "Server sent a request frame; dropping");
            }
        }
    }
}
