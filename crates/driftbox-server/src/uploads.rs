//! Multi-part upload assembly.
//!
//! Each chunked upload is a small state machine: opened with declared
//! metadata, fed chunks in any order (idempotently), assembled into one
//! contiguous payload on complete, then handed to the store. Chunks are
//! only drained after the store has accepted the file; a failed hand-off
//! leaves the upload retriable. Drained state lingers briefly to absorb
//! duplicate complete calls from retrying clients.
//!
//! Uploads are not tied to the originating connection; a reconnecting
//! uploader may resume with the same upload id until the stale sweep
//! collects it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use driftbox_shared::codes::new_upload_id;
use driftbox_shared::constants::{
    DRAINED_UPLOAD_RETENTION_MS, MAX_CONCURRENT_UPLOADS_PER_SESSION, MAX_FILE_SIZE_BYTES,
    STALE_UPLOAD_THRESHOLD_MS,
};
use driftbox_shared::protocol::FileMetadata;
use driftbox_store::Clock;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Session already has {max} uploads in progress")]
    TooManyConcurrentUploads { max: usize },

    #[error("Upload not found")]
    UploadNotFound,

    #[error("Upload already completed")]
    AlreadyCompleted,

    #[error("Chunk index {index} out of range (total {total})")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("Upload incomplete: {received} of {total} chunks received")]
    Incomplete { received: u32, total: u32 },

    #[error("Chunk {index} missing")]
    MissingChunk { index: u32 },

    #[error("Assembled {actual} bytes but {declared} were declared")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Declared size {size} exceeds the per-file limit {max}")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Declared size is zero")]
    EmptyFile,
}

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_concurrent_per_session: usize,
    pub max_file_size: u64,
    pub stale_after: Duration,
    pub drained_retention: Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_concurrent_per_session: MAX_CONCURRENT_UPLOADS_PER_SESSION,
            max_file_size: MAX_FILE_SIZE_BYTES,
            stale_after: Duration::milliseconds(STALE_UPLOAD_THRESHOLD_MS as i64),
            drained_retention: Duration::milliseconds(DRAINED_UPLOAD_RETENTION_MS as i64),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkOutcome {
    pub received: u32,
    pub total: u32,
    pub is_complete: bool,
    pub duplicate: bool,
}

/// A fully assembled upload, ready for store admission.
#[derive(Debug)]
pub struct AssembledUpload {
    pub session_code: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub uploaded_by: Uuid,
    pub payload: Bytes,
}

#[derive(Debug)]
pub enum CompleteOutcome {
    /// Chunks assembled; caller must admit the file and then call `finish`.
    Assembled(AssembledUpload),
    /// A retry of an already-finished upload; the stored metadata is
    /// returned again so the ack is identical.
    AlreadyStored(FileMetadata),
}

#[derive(Debug)]
struct Drained {
    metadata: FileMetadata,
    completed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct UploadState {
    session_code: String,
    filename: String,
    mime_type: Option<String>,
    uploaded_by: Uuid,
    declared_size: u64,
    total_chunks: u32,
    chunks: HashMap<u32, Bytes>,
    received: u32,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    drained: Option<Drained>,
}

impl UploadState {
    fn buffered_bytes(&self) -> usize {
        self.chunks.values().map(Bytes::len).sum()
    }
}

pub struct UploadAssembler {
    uploads: Mutex<HashMap<String, UploadState>>,
    clock: Arc<dyn Clock>,
    limits: UploadLimits,
}

impl UploadAssembler {
    pub fn new(clock: Arc<dyn Clock>, limits: UploadLimits) -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            clock,
            limits,
        }
    }

    /// Open a new upload for a session the caller is bound to.
    pub async fn start(
        &self,
        session_code: &str,
        uploaded_by: Uuid,
        filename: &str,
        mime_type: Option<String>,
        declared_size: u64,
        total_chunks: u32,
    ) -> Result<String, UploadError> {
        if declared_size == 0 {
            return Err(UploadError::EmptyFile);
        }
        if declared_size > self.limits.max_file_size {
            return Err(UploadError::FileTooLarge {
                size: declared_size,
                max: self.limits.max_file_size,
            });
        }
        if total_chunks == 0 {
            return Err(UploadError::InvalidChunkIndex { index: 0, total: 0 });
        }

        let now = self.clock.now();
        let mut uploads = self.uploads.lock().await;

        let receiving = uploads
            .values()
            .filter(|u| u.session_code == session_code && u.drained.is_none())
            .count();
        if receiving >= self.limits.max_concurrent_per_session {
            return Err(UploadError::TooManyConcurrentUploads {
                max: self.limits.max_concurrent_per_session,
            });
        }

        let upload_id = new_upload_id();
        uploads.insert(
            upload_id.clone(),
            UploadState {
                session_code: session_code.to_string(),
                filename: filename.to_string(),
                mime_type,
                uploaded_by,
                declared_size,
                total_chunks,
                chunks: HashMap::new(),
                received: 0,
                started_at: now,
                last_activity_at: now,
                drained: None,
            },
        );

        debug!(
            upload = %upload_id,
            session = %session_code,
            size = declared_size,
            chunks = total_chunks,
            "Upload opened"
        );
        Ok(upload_id)
    }

    /// Accept one chunk. Duplicates succeed without changing state.
    pub async fn chunk(
        &self,
        upload_id: &str,
        index: u32,
        data: Bytes,
    ) -> Result<ChunkOutcome, UploadError> {
        let now = self.clock.now();
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .get_mut(upload_id)
            .ok_or(UploadError::UploadNotFound)?;

        if upload.drained.is_some() {
            return Err(UploadError::AlreadyCompleted);
        }
        if index >= upload.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index,
                total: upload.total_chunks,
            });
        }

        let duplicate = upload.chunks.contains_key(&index);
        if !duplicate {
            upload.chunks.insert(index, data);
            upload.received += 1;
        }
        upload.last_activity_at = now;

        Ok(ChunkOutcome {
            received: upload.received,
            total: upload.total_chunks,
            is_complete: upload.received == upload.total_chunks,
            duplicate,
        })
    }

    /// Assemble the payload in ascending chunk order. State is left intact
    /// until [`UploadAssembler::finish`] confirms the store accepted it.
    pub async fn complete(&self, upload_id: &str) -> Result<CompleteOutcome, UploadError> {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .get_mut(upload_id)
            .ok_or(UploadError::UploadNotFound)?;

        if let Some(drained) = &upload.drained {
            return Ok(CompleteOutcome::AlreadyStored(drained.metadata.clone()));
        }

        if upload.received != upload.total_chunks {
            return Err(UploadError::Incomplete {
                received: upload.received,
                total: upload.total_chunks,
            });
        }

        let mut payload = BytesMut::with_capacity(upload.declared_size as usize);
        for index in 0..upload.total_chunks {
            let chunk = upload
                .chunks
                .get(&index)
                .ok_or(UploadError::MissingChunk { index })?;
            payload.extend_from_slice(chunk);
        }

        let actual = payload.len() as u64;
        if actual != upload.declared_size {
            return Err(UploadError::SizeMismatch {
                declared: upload.declared_size,
                actual,
            });
        }

        Ok(CompleteOutcome::Assembled(AssembledUpload {
            session_code: upload.session_code.clone(),
            filename: upload.filename.clone(),
            mime_type: upload.mime_type.clone(),
            uploaded_by: upload.uploaded_by,
            payload: payload.freeze(),
        }))
    }

    /// Record that the assembled file was admitted, freeing chunk memory
    /// eagerly. The metadata sticks around for the retention window so a
    /// duplicate complete gets the same answer.
    pub async fn finish(&self, upload_id: &str, metadata: FileMetadata) {
        let now = self.clock.now();
        let mut uploads = self.uploads.lock().await;
        if let Some(upload) = uploads.get_mut(upload_id) {
            let freed = upload.buffered_bytes();
            upload.chunks.clear();
            upload.drained = Some(Drained {
                metadata,
                completed_at: now,
            });
            debug!(upload = %upload_id, freed, "Upload drained");
        }
    }

    /// Drop an upload and its buffered chunks.
    pub async fn cancel(&self, upload_id: &str) -> bool {
        self.uploads.lock().await.remove(upload_id).is_some()
    }

    /// Drop uploads with no recent activity, and drained records past the
    /// retention window. Returns how many were removed.
    pub async fn sweep_stale(&self) -> usize {
        let now = self.clock.now();
        let stale_after = self.limits.stale_after;
        let retention = self.limits.drained_retention;
        let mut uploads = self.uploads.lock().await;

        let before = uploads.len();
        uploads.retain(|id, upload| {
            let keep = match &upload.drained {
                Some(drained) => now - drained.completed_at <= retention,
                None => now - upload.last_activity_at <= stale_after,
            };
            if !keep {
                debug!(
                    upload = %id,
                    session = %upload.session_code,
                    drained = upload.drained.is_some(),
                    "Sweeping upload"
                );
            }
            keep
        });
        before - uploads.len()
    }

    /// Uploads currently buffering chunks for a session.
    pub async fn receiving_count(&self, session_code: &str) -> usize {
        self.uploads
            .lock()
            .await
            .values()
            .filter(|u| u.session_code == session_code && u.drained.is_none())
            .count()
    }

    pub async fn session_of(&self, upload_id: &str) -> Option<String> {
        self.uploads
            .lock()
            .await
            .get(upload_id)
            .map(|u| u.session_code.clone())
    }

    /// When the upload began, for diagnostics.
    pub async fn started_at(&self, upload_id: &str) -> Option<DateTime<Utc>> {
        self.uploads
            .lock()
            .await
            .get(upload_id)
            .map(|u| u.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftbox_store::ManualClock;
    use uuid::Uuid;

    const CHUNK_SIZE: usize = 2_097_152;

    fn assembler() -> (Arc<ManualClock>, UploadAssembler) {
        let clock = Arc::new(ManualClock::starting_now());
        let assembler = UploadAssembler::new(clock.clone(), UploadLimits::default());
        (clock, assembler)
    }

    fn metadata(id: &str, size: u64) -> FileMetadata {
        FileMetadata {
            file_id: id.to_string(),
            filename: "big.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            size,
            uploaded_at: 0,
            uploaded_by: Uuid::nil().to_string(),
        }
    }

    #[tokio::test]
    async fn test_chunked_upload_out_of_order_with_duplicate() {
        let (_clock, assembler) = assembler();
        let conn = Uuid::new_v4();

        let original: Vec<u8> = (0..5_000_000u32).map(|i| (i % 251) as u8).collect();
        let total_chunks = original.len().div_ceil(CHUNK_SIZE) as u32;
        assert_eq!(total_chunks, 3);

        let upload_id = assembler
            .start("ABCDE", conn, "big.bin", None, original.len() as u64, total_chunks)
            .await
            .unwrap();

        for index in [2u32, 0, 1] {
            let start = index as usize * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(original.len());
            let outcome = assembler
                .chunk(&upload_id, index, Bytes::copy_from_slice(&original[start..end]))
                .await
                .unwrap();
            assert!(!outcome.duplicate);
        }

        // Resending an already-received chunk is a no-op success.
        let outcome = assembler
            .chunk(
                &upload_id,
                1,
                Bytes::copy_from_slice(&original[CHUNK_SIZE..2 * CHUNK_SIZE]),
            )
            .await
            .unwrap();
        assert!(outcome.duplicate);
        assert_eq!(outcome.received, 3);
        assert!(outcome.is_complete);

        match assembler.complete(&upload_id).await.unwrap() {
            CompleteOutcome::Assembled(assembled) => {
                assert_eq!(assembled.payload.len(), original.len());
                assert_eq!(assembled.payload.as_ref(), original.as_slice());
                assert_eq!(assembled.session_code, "ABCDE");
            }
            CompleteOutcome::AlreadyStored(_) => panic!("upload was never finished"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_complete_returns_same_metadata() {
        let (_clock, assembler) = assembler();
        let upload_id = assembler
            .start("ABCDE", Uuid::new_v4(), "a.txt", None, 2, 1)
            .await
            .unwrap();
        assembler
            .chunk(&upload_id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap();

        match assembler.complete(&upload_id).await.unwrap() {
            CompleteOutcome::Assembled(a) => assert_eq!(a.payload.as_ref(), b"ab"),
            CompleteOutcome::AlreadyStored(_) => panic!("not finished yet"),
        }
        assembler.finish(&upload_id, metadata("f1", 2)).await;

        match assembler.complete(&upload_id).await.unwrap() {
            CompleteOutcome::AlreadyStored(meta) => assert_eq!(meta.file_id, "f1"),
            CompleteOutcome::Assembled(_) => panic!("chunks were drained"),
        }

        // Late chunks after the drain are rejected, not re-buffered.
        let err = assembler
            .chunk(&upload_id, 0, Bytes::from_static(b"ab"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AlreadyCompleted));
    }

    #[tokio::test]
    async fn test_concurrent_upload_cap() {
        let (_clock, assembler) = assembler();
        let conn = Uuid::new_v4();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                assembler
                    .start("ABCDE", conn, "f", None, 1, 1)
                    .await
                    .unwrap(),
            );
        }

        let err = assembler
            .start("ABCDE", conn, "f", None, 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::TooManyConcurrentUploads { max: 5 }
        ));

        // Another session is unaffected.
        assembler
            .start("FGHJK", conn, "f", None, 1, 1)
            .await
            .unwrap();

        // Finishing one frees a slot.
        assembler
            .chunk(&ids[0], 0, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(matches!(
            assembler.complete(&ids[0]).await.unwrap(),
            CompleteOutcome::Assembled(_)
        ));
        assembler.finish(&ids[0], metadata("f1", 1)).await;

        assembler
            .start("ABCDE", conn, "f", None, 1, 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_validation() {
        let (_clock, assembler) = assembler();
        let conn = Uuid::new_v4();

        assert!(matches!(
            assembler.start("ABCDE", conn, "f", None, 0, 1).await,
            Err(UploadError::EmptyFile)
        ));
        assert!(matches!(
            assembler
                .start("ABCDE", conn, "f", None, MAX_FILE_SIZE_BYTES + 1, 1)
                .await,
            Err(UploadError::FileTooLarge { .. })
        ));
        assert!(matches!(
            assembler.start("ABCDE", conn, "f", None, 1, 0).await,
            Err(UploadError::InvalidChunkIndex { .. })
        ));
    }

    #[tokio::test]
    async fn test_chunk_errors() {
        let (_clock, assembler) = assembler();
        let upload_id = assembler
            .start("ABCDE", Uuid::new_v4(), "f", None, 4, 2)
            .await
            .unwrap();

        let err = assembler
            .chunk("0".repeat(32).as_str(), 0, Bytes::from_static(b"xx"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::UploadNotFound));

        let err = assembler
            .chunk(&upload_id, 2, Bytes::from_static(b"xx"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::InvalidChunkIndex { index: 2, total: 2 }
        ));

        let err = assembler.complete(&upload_id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Incomplete {
                received: 0,
                total: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let (_clock, assembler) = assembler();
        let upload_id = assembler
            .start("ABCDE", Uuid::new_v4(), "f", None, 10, 2)
            .await
            .unwrap();

        assembler
            .chunk(&upload_id, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assembler
            .chunk(&upload_id, 1, Bytes::from_static(b"def"))
            .await
            .unwrap();

        let err = assembler.complete(&upload_id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::SizeMismatch {
                declared: 10,
                actual: 6
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_sweep() {
        let (clock, assembler) = assembler();
        let upload_id = assembler
            .start("ABCDE", Uuid::new_v4(), "f", None, 4, 2)
            .await
            .unwrap();

        clock.advance(Duration::minutes(29));
        assembler
            .chunk(&upload_id, 0, Bytes::from_static(b"xx"))
            .await
            .unwrap();

        // Activity refreshed the deadline; not stale yet.
        clock.advance(Duration::minutes(29));
        assert_eq!(assembler.sweep_stale().await, 0);

        clock.advance(Duration::minutes(2));
        assert_eq!(assembler.sweep_stale().await, 1);
        assert!(matches!(
            assembler.complete(&upload_id).await.unwrap_err(),
            UploadError::UploadNotFound
        ));
    }

    #[tokio::test]
    async fn test_drained_retention_expires() {
        let (clock, assembler) = assembler();
        let upload_id = assembler
            .start("ABCDE", Uuid::new_v4(), "f", None, 1, 1)
            .await
            .unwrap();
        assembler
            .chunk(&upload_id, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(matches!(
            assembler.complete(&upload_id).await.unwrap(),
            CompleteOutcome::Assembled(_)
        ));
        assembler.finish(&upload_id, metadata("f1", 1)).await;

        clock.advance(Duration::seconds(61));
        assert_eq!(assembler.sweep_stale().await, 1);
        assert!(matches!(
            assembler.complete(&upload_id).await.unwrap_err(),
            UploadError::UploadNotFound
        ));
    }

    #[tokio::test]
    async fn test_cancel_drops_state() {
        let (_clock, assembler) = assembler();
        let upload_id = assembler
            .start("ABCDE", Uuid::new_v4(), "f", None, 2, 2)
            .await
            .unwrap();

        assert!(assembler.cancel(&upload_id).await);
        assert!(!assembler.cancel(&upload_id).await);
        assert_eq!(assembler.receiving_count("ABCDE").await, 0);
    }

    #[tokio::test]
    async fn test_chunk_idempotence_preserves_bytes() {
        let (_clock, assembler) = assembler();
        let upload_id = assembler
            .start("ABCDE", Uuid::new_v4(), "f", None, 4, 2)
            .await
            .unwrap();

        assembler
            .chunk(&upload_id, 0, Bytes::from_static(b"AA"))
            .await
            .unwrap();
        // Retry with different bytes must not overwrite the first delivery.
        assembler
            .chunk(&upload_id, 0, Bytes::from_static(b"ZZ"))
            .await
            .unwrap();
        assembler
            .chunk(&upload_id, 1, Bytes::from_static(b"BB"))
            .await
            .unwrap();

        match assembler.complete(&upload_id).await.unwrap() {
            CompleteOutcome::Assembled(a) => assert_eq!(a.payload.as_ref(), b"AABB"),
            CompleteOutcome::AlreadyStored(_) => panic!("not finished"),
        }
    }
}
