//! Wire protocol between clients and the server.
//!
//! A frame on the wire is the tuple `(event name, payload, ack id?)`,
//! bincode-encoded over a binary WebSocket message. File and chunk bytes
//! travel as native byte arrays. Request and event names form closed sets;
//! an unknown name is a protocol violation, not an application error.
//!
//! All timestamps crossing the wire are milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorKind;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown request name: {0}")]
    UnknownRequest(String),

    #[error("Unknown event name: {0}")]
    UnknownEvent(String),

    #[error("Frame decode error: {0}")]
    Decode(#[from] bincode::Error),

    #[error("Malformed frame: {0}")]
    BadFrame(&'static str),
}

// ---------------------------------------------------------------------------
// Frame envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Client-originated operation expecting exactly one ack.
    Request,
    /// Server reply to a request, matched by ack id.
    Ack,
    /// Server-originated room event; never acked.
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub kind: FrameKind,
    /// Request or event name; for acks, the name of the operation acked.
    pub name: String,
    pub ack_id: Option<u64>,
    /// Bincode-encoded payload record for `name`.
    pub payload: Vec<u8>,
}

impl WireFrame {
    pub fn request<T: Serialize>(name: RequestName, ack_id: u64, payload: &T) -> Self {
        Self {
            kind: FrameKind::Request,
            name: name.as_str().to_string(),
            ack_id: Some(ack_id),
            payload: encode(payload),
        }
    }

    pub fn ack<T: Serialize>(name: &str, ack_id: u64, result: &Ack<T>) -> Self {
        Self {
            kind: FrameKind::Ack,
            name: name.to_string(),
            ack_id: Some(ack_id),
            payload: encode(result),
        }
    }

    pub fn event(event: &ServerEvent) -> Self {
        Self {
            kind: FrameKind::Event,
            name: event.name().as_str().to_string(),
            ack_id: None,
            payload: event.encode_payload(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Encode a payload record. Serialization of in-memory protocol types
/// cannot fail, mirroring how acks must always be producible.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("protocol type serialization")
}

pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(data)?)
}

// ---------------------------------------------------------------------------
// Request names (client -> server)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestName {
    SessionCreate,
    SessionJoin,
    SessionLeave,
    FileUpload,
    FileUploadStart,
    FileUploadChunk,
    FileUploadComplete,
    FileRequest,
    FileDelete,
    MessageSend,
    MessageDelete,
}

impl RequestName {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RequestName::SessionCreate => "session:create",
            RequestName::SessionJoin => "session:join",
            RequestName::SessionLeave => "session:leave",
            RequestName::FileUpload => "file:upload",
            RequestName::FileUploadStart => "file:upload-start",
            RequestName::FileUploadChunk => "file:upload-chunk",
            RequestName::FileUploadComplete => "file:upload-complete",
            RequestName::FileRequest => "file:request",
            RequestName::FileDelete => "file:delete",
            RequestName::MessageSend => "message:send",
            RequestName::MessageDelete => "message:delete",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "session:create" => Ok(RequestName::SessionCreate),
            "session:join" => Ok(RequestName::SessionJoin),
            "session:leave" => Ok(RequestName::SessionLeave),
            "file:upload" => Ok(RequestName::FileUpload),
            "file:upload-start" => Ok(RequestName::FileUploadStart),
            "file:upload-chunk" => Ok(RequestName::FileUploadChunk),
            "file:upload-complete" => Ok(RequestName::FileUploadComplete),
            "file:request" => Ok(RequestName::FileRequest),
            "file:delete" => Ok(RequestName::FileDelete),
            "message:send" => Ok(RequestName::MessageSend),
            "message:delete" => Ok(RequestName::MessageDelete),
            other => Err(ProtocolError::UnknownRequest(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Event names (server -> room)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    SessionCreated,
    SessionJoined,
    SessionExpired,
    FileAdded,
    FileDeleted,
    MessageAdded,
    MessageDeleted,
    MemberJoined,
    MemberLeft,
    FileChunkReceived,
}

impl EventName {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventName::SessionCreated => "session:created",
            EventName::SessionJoined => "session:joined",
            EventName::SessionExpired => "session:expired",
            EventName::FileAdded => "file:added",
            EventName::FileDeleted => "file:deleted",
            EventName::MessageAdded => "message:added",
            EventName::MessageDeleted => "message:deleted",
            EventName::MemberJoined => "member:joined",
            EventName::MemberLeft => "member:left",
            EventName::FileChunkReceived => "file:chunk-received",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "session:created" => Ok(EventName::SessionCreated),
            "session:joined" => Ok(EventName::SessionJoined),
            "session:expired" => Ok(EventName::SessionExpired),
            "file:added" => Ok(EventName::FileAdded),
            "file:deleted" => Ok(EventName::FileDeleted),
            "message:added" => Ok(EventName::MessageAdded),
            "message:deleted" => Ok(EventName::MessageDeleted),
            "member:joined" => Ok(EventName::MemberJoined),
            "member:left" => Ok(EventName::MemberLeft),
            "file:chunk-received" => Ok(EventName::FileChunkReceived),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Ack envelope
// ---------------------------------------------------------------------------

/// Negative-ack body: stable user-facing message plus machine tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub code: String,
    pub error: String,
}

impl From<ErrorKind> for WireError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            code: kind.code().to_string(),
            error: kind.to_string(),
        }
    }
}

/// Binary rendering of the `{success: true, ...}` / `{success: false, ...}`
/// ack shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Ack<T> {
    Ok(T),
    Err(WireError),
}

impl<T> Ack<T> {
    pub fn success(&self) -> bool {
        matches!(self, Ack::Ok(_))
    }

    pub fn into_result(self) -> Result<T, WireError> {
        match self {
            Ack::Ok(v) => Ok(v),
            Ack::Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub session_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStartRequest {
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: u64,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub upload_id: String,
    pub chunk_index: u32,
    pub chunk_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompleteRequest {
    pub upload_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDeleteRequest {
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSendRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleteRequest {
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// Reply payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_at: i64,
    pub uploaded_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub message_id: String,
    pub content: String,
    pub sent_by: String,
    pub sent_by_name: String,
    pub sent_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreatedReply {
    pub session_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    /// Ack deadline the server runs with; clients adopt it on receipt.
    pub rpc_timeout_ms: u64,
}

impl SessionCreatedReply {
    pub fn with_rpc_timeout(mut self, ms: u64) -> Self {
        self.rpc_timeout_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub files: Vec<FileMetadata>,
    pub messages: Vec<MessageView>,
    pub member_count: u32,
    /// Ack deadline the server runs with; clients adopt it on receipt.
    pub rpc_timeout_ms: u64,
}

impl SessionSnapshot {
    pub fn with_rpc_timeout(mut self, ms: u64) -> Self {
        self.rpc_timeout_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OkReply {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReply {
    pub file: FileMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStartReply {
    pub upload_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkReply {
    pub received: u32,
    pub total: u32,
    pub is_complete: bool,
}

/// Full file content, returned only by `file:request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub file_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadReply {
    pub file: FilePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReply {
    pub message: MessageView,
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExpiredEvent {
    pub session_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDeletedEvent {
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedEvent {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberCountEvent {
    pub member_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceivedEvent {
    pub upload_id: String,
    pub chunk_index: u32,
    pub received: u32,
    pub total: u32,
    pub progress: f32,
}

/// Typed union of everything the server pushes into a room.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    SessionCreated(SessionSnapshot),
    SessionJoined(SessionSnapshot),
    SessionExpired(SessionExpiredEvent),
    FileAdded(FileReply),
    FileDeleted(FileDeletedEvent),
    MessageAdded(MessageReply),
    MessageDeleted(MessageDeletedEvent),
    MemberJoined(MemberCountEvent),
    MemberLeft(MemberCountEvent),
    FileChunkReceived(ChunkReceivedEvent),
}

impl ServerEvent {
    pub fn name(&self) -> EventName {
        match self {
            ServerEvent::SessionCreated(_) => EventName::SessionCreated,
            ServerEvent::SessionJoined(_) => EventName::SessionJoined,
            ServerEvent::SessionExpired(_) => EventName::SessionExpired,
            ServerEvent::FileAdded(_) => EventName::FileAdded,
            ServerEvent::FileDeleted(_) => EventName::FileDeleted,
            ServerEvent::MessageAdded(_) => EventName::MessageAdded,
            ServerEvent::MessageDeleted(_) => EventName::MessageDeleted,
            ServerEvent::MemberJoined(_) => EventName::MemberJoined,
            ServerEvent::MemberLeft(_) => EventName::MemberLeft,
            ServerEvent::FileChunkReceived(_) => EventName::FileChunkReceived,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            ServerEvent::SessionCreated(p) => encode(p),
            ServerEvent::SessionJoined(p) => encode(p),
            ServerEvent::SessionExpired(p) => encode(p),
            ServerEvent::FileAdded(p) => encode(p),
            ServerEvent::FileDeleted(p) => encode(p),
            ServerEvent::MessageAdded(p) => encode(p),
            ServerEvent::MessageDeleted(p) => encode(p),
            ServerEvent::MemberJoined(p) => encode(p),
            ServerEvent::MemberLeft(p) => encode(p),
            ServerEvent::FileChunkReceived(p) => encode(p),
        }
    }

    /// Decode an event frame back into its typed form.
    pub fn decode_frame(frame: &WireFrame) -> Result<Self, ProtocolError> {
        if frame.kind != FrameKind::Event {
            return Err(ProtocolError::BadFrame("not an event frame"));
        }
        let name = EventName::parse(&frame.name)?;
        let payload = &frame.payload;
        Ok(match name {
            EventName::SessionCreated => ServerEvent::SessionCreated(decode(payload)?),
            EventName::SessionJoined => ServerEvent::SessionJoined(decode(payload)?),
            EventName::SessionExpired => ServerEvent::SessionExpired(decode(payload)?),
            EventName::FileAdded => ServerEvent::FileAdded(decode(payload)?),
            EventName::FileDeleted => ServerEvent::FileDeleted(decode(payload)?),
            EventName::MessageAdded => ServerEvent::MessageAdded(decode(payload)?),
            EventName::MessageDeleted => ServerEvent::MessageDeleted(decode(payload)?),
            EventName::MemberJoined => ServerEvent::MemberJoined(decode(payload)?),
            EventName::MemberLeft => ServerEvent::MemberLeft(decode(payload)?),
            EventName::FileChunkReceived => ServerEvent::FileChunkReceived(decode(payload)?),
        })
    }
}
