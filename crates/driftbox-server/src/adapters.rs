//! Boundary seams for the outer shells (HTTP share-target, UI assets).
//!
//! The core never calls outward; the shells call in through these hooks.

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use driftbox_shared::codes::new_file_id;
use driftbox_shared::protocol::{FileMetadata, FileReply, ServerEvent};
use driftbox_shared::ErrorKind;
use driftbox_store::NewFile;

use crate::api::AppState;
use crate::error::store_error_kind;
use crate::rooms::RoomRegistry;

/// "Notify session X of event Y with payload P": the only way the cleanup
/// scheduler and external shells reach members.
#[async_trait]
pub trait RoomNotifier: Send + Sync {
    async fn notify(&self, members: &[Uuid], event: &ServerEvent);
}

#[async_trait]
impl RoomNotifier for RoomRegistry {
    async fn notify(&self, members: &[Uuid], event: &ServerEvent) {
        self.broadcast(members, event).await;
    }
}

/// Synthesize a completed upload from an out-of-band drop (the HTTP
/// share-target hook). Takes the same admission path as a live upload and
/// broadcasts `file:added` to the room. The nil uploader id marks the file
/// as externally contributed.
pub async fn ingest_external_file(
    state: &AppState,
    session_code: &str,
    filename: &str,
    mime_type: Option<String>,
    payload: Bytes,
) -> Result<FileMetadata, ErrorKind> {
    let file = NewFile {
        id: new_file_id(),
        filename: filename.to_string(),
        mime_type,
        payload,
        uploaded_by: Uuid::nil(),
    };

    let metadata = state
        .store
        .add_file(session_code, file)
        .await
        .map_err(|e| store_error_kind(&e))?;

    let members = state.store.members_of(session_code).await;
    state
        .rooms
        .broadcast(
            &members,
            &ServerEvent::FileAdded(FileReply {
                file: metadata.clone(),
            }),
        )
        .await;
    Ok(metadata)
}
