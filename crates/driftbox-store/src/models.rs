use std::collections::HashSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use driftbox_shared::codes::sanitize_filename;
use driftbox_shared::constants::{DEFAULT_DISPLAY_NAME, DEFAULT_MIME_TYPE, RPC_TIMEOUT_MS};
use driftbox_shared::protocol::{FileMetadata, MessageView, SessionSnapshot};

/// One stored binary blob plus metadata, owned by its session.
///
/// The payload is a refcounted `Bytes`, so handing it to the transport for a
/// download never copies, and a concurrent delete cannot pull the buffer out
/// from under an in-flight send.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub payload: Bytes,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: Uuid,
}

impl FileRecord {
    pub fn new(
        id: String,
        declared_name: &str,
        mime_type: Option<String>,
        payload: Bytes,
        uploaded_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        let sanitized = sanitize_filename(declared_name);
        let filename = if sanitized == "unnamed" && declared_name != "unnamed" {
            format!("file-{id}")
        } else {
            sanitized
        };

        let mime_type = match mime_type {
            Some(m) if !m.trim().is_empty() => m,
            _ => DEFAULT_MIME_TYPE.to_string(),
        };

        Self {
            id,
            filename,
            mime_type,
            payload,
            uploaded_at: now,
            uploaded_by,
        }
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            file_id: self.id.clone(),
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size(),
            uploaded_at: self.uploaded_at.timestamp_millis(),
            uploaded_by: self.uploaded_by.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub content: String,
    pub sent_by: Uuid,
    pub sent_by_name: String,
    pub sent_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        id: String,
        content: String,
        sent_by: Uuid,
        sent_by_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let sent_by_name = match sent_by_name {
            Some(n) if !n.trim().is_empty() => n,
            _ => DEFAULT_DISPLAY_NAME.to_string(),
        };

        Self {
            id,
            content,
            sent_by,
            sent_by_name,
            sent_at: now,
        }
    }

    pub fn view(&self) -> MessageView {
        MessageView {
            message_id: self.id.clone(),
            content: self.content.clone(),
            sent_by: self.sent_by.to_string(),
            sent_by_name: self.sent_by_name.clone(),
            sent_at: self.sent_at.timestamp_millis(),
        }
    }
}

/// An ephemeral shared room. Files keep insertion order for enumeration.
#[derive(Debug)]
pub struct Session {
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Connection that created the session, while it remains a member.
    /// Cleared once the creator leaves; message deletion then falls back
    /// to sender-only.
    pub created_by: Option<Uuid>,
    pub files: Vec<FileRecord>,
    pub messages: Vec<MessageRecord>,
    pub members: HashSet<Uuid>,
}

impl Session {
    pub fn new(
        code: String,
        created_by: Uuid,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            created_at,
            expires_at,
            created_by: Some(created_by),
            files: Vec::new(),
            messages: Vec::new(),
            members: HashSet::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn file(&self, file_id: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.id == file_id)
    }

    pub fn payload_bytes(&self) -> u64 {
        self.files.iter().map(FileRecord::size).sum()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.code.clone(),
            created_at: self.created_at.timestamp_millis(),
            expires_at: self.expires_at.timestamp_millis(),
            files: self.files.iter().map(FileRecord::metadata).collect(),
            messages: self.messages.iter().map(MessageRecord::view).collect(),
            member_count: self.members.len() as u32,
            rpc_timeout_ms: RPC_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_file_record_defaults() {
        let now = Utc::now();
        let record = FileRecord::new(
            "ab".repeat(16),
            "../secret.txt",
            None,
            Bytes::from_static(b"hello"),
            Uuid::new_v4(),
            now,
        );

        assert_eq!(record.filename, "secret.txt");
        assert_eq!(record.mime_type, "application/octet-stream");
        assert_eq!(record.size(), 5);
    }

    #[test]
    fn test_file_record_fallback_name() {
        let id = "cd".repeat(16);
        let record = FileRecord::new(
            id.clone(),
            "///",
            Some("image/png".to_string()),
            Bytes::from_static(b"x"),
            Uuid::new_v4(),
            Utc::now(),
        );

        assert_eq!(record.filename, format!("file-{id}"));
        assert_eq!(record.mime_type, "image/png");
    }

    #[test]
    fn test_message_record_anonymous_default() {
        let record = MessageRecord::new(
            "msg_1_deadbeef".into(),
            "hi".into(),
            Uuid::new_v4(),
            Some("   ".into()),
            Utc::now(),
        );
        assert_eq!(record.sent_by_name, "Anonymous");
    }

    #[test]
    fn test_session_expiry_boundary() {
        let now = Utc::now();
        let session = Session::new("ABCDE".into(), Uuid::new_v4(), now, now + Duration::hours(5));

        assert!(!session.is_expired(now + Duration::hours(5)));
        assert!(session.is_expired(now + Duration::hours(5) + Duration::milliseconds(1)));
    }

    #[test]
    fn test_snapshot_timestamps_are_millis() {
        let now = Utc::now();
        let session = Session::new("ABCDE".into(), Uuid::new_v4(), now, now + Duration::hours(5));
        let snapshot = session.snapshot();

        assert_eq!(snapshot.created_at, now.timestamp_millis());
        assert_eq!(snapshot.member_count, 0);
        assert!(snapshot.files.is_empty());
    }
}
