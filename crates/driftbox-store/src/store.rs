//! Process-wide owner of all session state.
//!
//! Every mutation goes through the store-level write lock, so byte
//! accounting and cap checks are always consistent with the registry.
//! Expired sessions are purged transparently on first touch; callers only
//! ever observe them as absent.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use driftbox_shared::codes::{canonical_session_code, new_message_id, new_session_code};
use driftbox_shared::constants::{
    MAX_FILES_PER_SESSION, MAX_FILE_SIZE_BYTES, MAX_MESSAGES_PER_SESSION, MAX_MESSAGE_CHARS,
    MAX_TOTAL_BYTES, RPC_TIMEOUT_MS, SESSION_TTL_MS,
};
use driftbox_shared::protocol::{
    FileMetadata, MessageView, SessionCreatedReply, SessionSnapshot,
};

use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::models::{FileRecord, MessageRecord, Session};

#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub session_ttl: Duration,
    pub max_file_size: u64,
    pub max_total_bytes: u64,
    pub max_files_per_session: usize,
    pub max_messages_per_session: usize,
    pub max_message_chars: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            session_ttl: Duration::milliseconds(SESSION_TTL_MS as i64),
            max_file_size: MAX_FILE_SIZE_BYTES,
            max_total_bytes: MAX_TOTAL_BYTES,
            max_files_per_session: MAX_FILES_PER_SESSION,
            max_messages_per_session: MAX_MESSAGES_PER_SESSION,
            max_message_chars: MAX_MESSAGE_CHARS,
        }
    }
}

/// A file handed to the store for admission.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub payload: Bytes,
    pub uploaded_by: Uuid,
}

/// Result of binding a connection to a session. `previous` reports the room
/// the connection was moved out of, with its remaining member count, so the
/// dispatcher can notify it.
#[derive(Debug)]
pub struct JoinOutcome {
    pub snapshot: SessionSnapshot,
    pub previous: Option<(String, u32)>,
}

struct StoreInner {
    sessions: HashMap<String, Session>,
    /// connection id -> session code; one session per connection.
    bindings: HashMap<Uuid, String>,
    total_bytes: u64,
}

impl StoreInner {
    fn remove_session(&mut self, code: &str) -> Option<Session> {
        let session = self.sessions.remove(code)?;
        self.total_bytes -= session.payload_bytes();
        for conn in &session.members {
            self.bindings.remove(conn);
        }
        Some(session)
    }

    fn purge_if_expired(&mut self, code: &str, now: chrono::DateTime<chrono::Utc>) {
        let expired = self
            .sessions
            .get(code)
            .map(|s| s.is_expired(now))
            .unwrap_or(false);
        if expired {
            debug!(session = %code, "Purging expired session on access");
            self.remove_session(code);
        }
    }

    fn live_mut(
        &mut self,
        code: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<&mut Session> {
        self.purge_if_expired(code, now);
        self.sessions
            .get_mut(code)
            .ok_or(StoreError::SessionNotFound)
    }
}

pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    clock: Arc<dyn Clock>,
    limits: StoreLimits,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>, limits: StoreLimits) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                sessions: HashMap::new(),
                bindings: HashMap::new(),
                total_bytes: 0,
            }),
            clock,
            limits,
        }
    }

    /// Register a fresh session with a non-colliding code.
    pub async fn create_session(&self, creator: Uuid) -> SessionCreatedReply {
        let now = self.clock.now();
        let expires_at = now + self.limits.session_ttl;
        let mut inner = self.inner.write().await;

        let code = loop {
            let candidate = new_session_code();
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Session::new(code.clone(), creator, now, expires_at);
        inner.sessions.insert(code.clone(), session);

        info!(session = %code, "Session created");
        SessionCreatedReply {
            session_id: code,
            created_at: now.timestamp_millis(),
            expires_at: expires_at.timestamp_millis(),
            rpc_timeout_ms: RPC_TIMEOUT_MS,
        }
    }

    pub async fn snapshot(&self, code: &str) -> Result<SessionSnapshot> {
        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        Ok(inner.live_mut(&code, now)?.snapshot())
    }

    /// Bind a connection to a session, replacing any prior binding.
    pub async fn add_member(&self, code: &str, conn: Uuid) -> Result<JoinOutcome> {
        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;

        inner.purge_if_expired(&code, now);
        if !inner.sessions.contains_key(&code) {
            return Err(StoreError::SessionNotFound);
        }

        let prior = inner.bindings.get(&conn).cloned();
        let previous = match prior {
            Some(prev) if prev != code => inner.sessions.get_mut(&prev).map(|session| {
                session.members.remove(&conn);
                if session.created_by == Some(conn) {
                    session.created_by = None;
                }
                (prev.clone(), session.members.len() as u32)
            }),
            _ => None,
        };

        let session = inner
            .sessions
            .get_mut(&code)
            .ok_or(StoreError::SessionNotFound)?;
        session.members.insert(conn);
        let snapshot = session.snapshot();
        inner.bindings.insert(conn, code.clone());

        debug!(session = %code, conn = %conn, members = snapshot.member_count, "Member joined");
        Ok(JoinOutcome { snapshot, previous })
    }

    /// Unbind a connection. Returns the session it was in and the remaining
    /// member count, for broadcast purposes. Safe on unknown connections.
    pub async fn remove_member(&self, conn: Uuid) -> Option<(String, u32)> {
        let mut inner = self.inner.write().await;
        let code = inner.bindings.remove(&conn)?;
        let session = inner.sessions.get_mut(&code)?;

        session.members.remove(&conn);
        if session.created_by == Some(conn) {
            session.created_by = None;
        }
        let remaining = session.members.len() as u32;

        debug!(session = %code, conn = %conn, members = remaining, "Member left");
        Some((code, remaining))
    }

    pub async fn session_of(&self, conn: Uuid) -> Option<String> {
        self.inner.read().await.bindings.get(&conn).cloned()
    }

    pub async fn members_of(&self, code: &str) -> Vec<Uuid> {
        let code = canonical_session_code(code);
        self.inner
            .read()
            .await
            .sessions
            .get(&code)
            .map(|s| s.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Admit a file into a session. Atomic: the file is observable only
    /// after every check has passed and the byte account moved.
    pub async fn add_file(&self, code: &str, file: NewFile) -> Result<FileMetadata> {
        let size = file.payload.len() as u64;
        if size == 0 {
            return Err(StoreError::EmptyFile);
        }
        if size > self.limits.max_file_size {
            return Err(StoreError::FileTooLarge {
                size,
                max: self.limits.max_file_size,
            });
        }

        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;

        inner.purge_if_expired(&code, now);
        if !inner.sessions.contains_key(&code) {
            return Err(StoreError::SessionNotFound);
        }

        {
            let session = &inner.sessions[&code];
            if session.files.len() >= self.limits.max_files_per_session {
                return Err(StoreError::FileCapReached {
                    max: self.limits.max_files_per_session,
                });
            }
        }
        if inner.total_bytes + size >= self.limits.max_total_bytes {
            return Err(StoreError::OutOfMemory {
                requested: size,
                available: self.limits.max_total_bytes - inner.total_bytes,
            });
        }

        let record = FileRecord::new(
            file.id,
            &file.filename,
            file.mime_type,
            file.payload,
            file.uploaded_by,
            now,
        );
        let metadata = record.metadata();

        inner.total_bytes += size;
        let session = inner
            .sessions
            .get_mut(&code)
            .ok_or(StoreError::SessionNotFound)?;
        session.files.push(record);

        debug!(
            session = %code,
            file = %metadata.file_id,
            size,
            "File stored"
        );
        Ok(metadata)
    }

    pub async fn file_metadata(&self, code: &str, file_id: &str) -> Result<FileMetadata> {
        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let session = inner.live_mut(&code, now)?;
        session
            .file(file_id)
            .map(FileRecord::metadata)
            .ok_or(StoreError::FileNotFound)
    }

    /// Fetch metadata plus the payload itself. The returned `Bytes` is a
    /// refcounted handle; a later delete cannot invalidate it.
    pub async fn file_payload(&self, code: &str, file_id: &str) -> Result<(FileMetadata, Bytes)> {
        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let session = inner.live_mut(&code, now)?;
        session
            .file(file_id)
            .map(|f| (f.metadata(), f.payload.clone()))
            .ok_or(StoreError::FileNotFound)
    }

    pub async fn list_files(&self, code: &str) -> Result<Vec<FileMetadata>> {
        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let session = inner.live_mut(&code, now)?;
        Ok(session.files.iter().map(FileRecord::metadata).collect())
    }

    pub async fn delete_file(&self, code: &str, file_id: &str) -> Result<()> {
        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;

        let session = inner.live_mut(&code, now)?;
        let index = session
            .files
            .iter()
            .position(|f| f.id == file_id)
            .ok_or(StoreError::FileNotFound)?;
        let removed = session.files.remove(index);
        inner.total_bytes -= removed.size();

        debug!(session = %code, file = %file_id, size = removed.size(), "File deleted");
        Ok(())
    }

    pub async fn add_message(
        &self,
        code: &str,
        sent_by: Uuid,
        sent_by_name: Option<String>,
        content: &str,
    ) -> Result<MessageView> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::EmptyMessage);
        }
        if content.chars().count() > self.limits.max_message_chars {
            return Err(StoreError::MessageTooLong {
                max: self.limits.max_message_chars,
            });
        }

        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let max_messages = self.limits.max_messages_per_session;

        let session = inner.live_mut(&code, now)?;
        if session.messages.len() >= max_messages {
            return Err(StoreError::MessageCapReached { max: max_messages });
        }

        let record = MessageRecord::new(
            new_message_id(now.timestamp_millis()),
            content.to_string(),
            sent_by,
            sent_by_name,
            now,
        );
        let view = record.view();
        session.messages.push(record);

        debug!(session = %code, message = %view.message_id, "Message stored");
        Ok(view)
    }

    /// Delete a message. Allowed for the sender, or for the session creator
    /// while the creator connection is still around.
    pub async fn delete_message(&self, code: &str, message_id: &str, caller: Uuid) -> Result<()> {
        let code = canonical_session_code(code);
        let now = self.clock.now();
        let mut inner = self.inner.write().await;

        let session = inner.live_mut(&code, now)?;
        let index = session
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or(StoreError::MessageNotFound)?;

        let is_sender = session.messages[index].sent_by == caller;
        let is_creator = session.created_by == Some(caller);
        if !is_sender && !is_creator {
            return Err(StoreError::Forbidden);
        }

        session.messages.remove(index);
        debug!(session = %code, message = %message_id, "Message deleted");
        Ok(())
    }

    /// Drop a session and free everything it owns.
    pub async fn delete_session(&self, code: &str) -> bool {
        let code = canonical_session_code(code);
        let mut inner = self.inner.write().await;
        let removed = inner.remove_session(&code);
        if removed.is_some() {
            info!(session = %code, "Session deleted");
        }
        removed.is_some()
    }

    pub async fn expired_session_codes(&self) -> Vec<String> {
        let now = self.clock.now();
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.code.clone())
            .collect()
    }

    /// The `n` oldest sessions by creation time, for emergency eviction.
    pub async fn oldest_session_codes(&self, n: usize) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<_> = inner
            .sessions
            .values()
            .map(|s| (s.created_at, s.code.clone()))
            .collect();
        sessions.sort();
        sessions.into_iter().take(n).map(|(_, code)| code).collect()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.inner.read().await.total_bytes
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn file_count(&self) -> usize {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .map(|s| s.files.len())
            .sum()
    }

    pub async fn binding_count(&self) -> usize {
        self.inner.read().await.bindings.len()
    }

    pub async fn member_count(&self) -> usize {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .map(|s| s.members.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let limits = StoreLimits {
            max_total_bytes: 100,
            max_file_size: 50,
            max_files_per_session: 3,
            max_messages_per_session: 4,
            max_message_chars: 20,
            ..StoreLimits::default()
        };
        let store = MemoryStore::new(clock.clone(), limits);
        (clock, store)
    }

    fn new_file(id: u8, payload: impl Into<Bytes>, by: Uuid) -> NewFile {
        NewFile {
            id: format!("{id:02x}").repeat(16),
            filename: "data.bin".to_string(),
            mime_type: None,
            payload: payload.into(),
            uploaded_by: by,
        }
    }

    #[tokio::test]
    async fn test_store_and_fetch_roundtrip() {
        let (_clock, store) = test_store();
        let conn = Uuid::new_v4();

        let created = store.create_session(conn).await;
        store.add_member(&created.session_id, conn).await.unwrap();

        let meta = store
            .add_file(&created.session_id, new_file(1, &b"Hello"[..], conn))
            .await
            .unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(store.total_bytes().await, 5);

        let (fetched, payload) = store
            .file_payload(&created.session_id, &meta.file_id)
            .await
            .unwrap();
        assert_eq!(fetched, meta);
        assert_eq!(payload.as_ref(), b"Hello");

        assert_eq!(
            store
                .file_metadata(&created.session_id, &meta.file_id)
                .await
                .unwrap(),
            meta
        );
        assert_eq!(store.list_files(&created.session_id).await.unwrap(), vec![meta]);
    }

    #[tokio::test]
    async fn test_join_is_case_insensitive() {
        let (_clock, store) = test_store();
        let conn = Uuid::new_v4();

        let created = store.create_session(conn).await;
        let lowered = created.session_id.to_ascii_lowercase();

        let outcome = store.add_member(&lowered, conn).await.unwrap();
        assert_eq!(outcome.snapshot.session_id, created.session_id);
    }

    #[tokio::test]
    async fn test_ttl_expiry_releases_everything() {
        let (clock, store) = test_store();
        let conn = Uuid::new_v4();

        let created = store.create_session(conn).await;
        store.add_member(&created.session_id, conn).await.unwrap();
        store
            .add_file(&created.session_id, new_file(1, &b"payload"[..], conn))
            .await
            .unwrap();

        clock.advance(Duration::hours(5) + Duration::seconds(1));

        assert!(matches!(
            store.snapshot(&created.session_id).await,
            Err(StoreError::SessionNotFound)
        ));
        assert_eq!(store.session_count().await, 0);
        assert_eq!(store.total_bytes().await, 0);
        assert_eq!(store.binding_count().await, 0);
    }

    #[tokio::test]
    async fn test_global_budget_rejects_at_capacity() {
        // Budget 100: nine 10-byte files fit, the tenth would exhaust it.
        let limits = StoreLimits {
            max_total_bytes: 100,
            max_file_size: 50,
            max_files_per_session: 100,
            ..StoreLimits::default()
        };
        let store = MemoryStore::new(Arc::new(ManualClock::starting_now()), limits);
        let conn = Uuid::new_v4();
        let created = store.create_session(conn).await;
        store.add_member(&created.session_id, conn).await.unwrap();

        for i in 0..9 {
            store
                .add_file(&created.session_id, new_file(i, &b"0123456789"[..], conn))
                .await
                .unwrap();
        }
        assert_eq!(store.total_bytes().await, 90);

        let err = store
            .add_file(&created.session_id, new_file(9, &b"0123456789"[..], conn))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfMemory { .. }));
        assert_eq!(store.total_bytes().await, 90);
    }

    #[tokio::test]
    async fn test_file_validation() {
        let (_clock, store) = test_store();
        let conn = Uuid::new_v4();
        let created = store.create_session(conn).await;

        let err = store
            .add_file(&created.session_id, new_file(1, &b""[..], conn))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EmptyFile));

        let err = store
            .add_file(&created.session_id, new_file(2, vec![0u8; 51], conn))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FileTooLarge { size: 51, max: 50 }));
    }

    #[tokio::test]
    async fn test_file_cap_per_session() {
        let (_clock, store) = test_store();
        let conn = Uuid::new_v4();
        let created = store.create_session(conn).await;

        for i in 0..3 {
            store
                .add_file(&created.session_id, new_file(i, &b"x"[..], conn))
                .await
                .unwrap();
        }
        let err = store
            .add_file(&created.session_id, new_file(4, &b"x"[..], conn))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FileCapReached { max: 3 }));
    }

    #[tokio::test]
    async fn test_delete_file_frees_bytes() {
        let (_clock, store) = test_store();
        let conn = Uuid::new_v4();
        let created = store.create_session(conn).await;

        let meta = store
            .add_file(&created.session_id, new_file(1, &b"12345678"[..], conn))
            .await
            .unwrap();
        assert_eq!(store.total_bytes().await, 8);

        store
            .delete_file(&created.session_id, &meta.file_id)
            .await
            .unwrap();
        assert_eq!(store.total_bytes().await, 0);

        let err = store
            .delete_file(&created.session_id, &meta.file_id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FileNotFound));
    }

    #[tokio::test]
    async fn test_message_validation() {
        let (_clock, store) = test_store();
        let conn = Uuid::new_v4();
        let created = store.create_session(conn).await;

        let err = store
            .add_message(&created.session_id, conn, None, "   \n\t  ")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EmptyMessage));

        let err = store
            .add_message(&created.session_id, conn, None, &"x".repeat(21))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MessageTooLong { max: 20 }));

        let view = store
            .add_message(&created.session_id, conn, None, "  hello  ")
            .await
            .unwrap();
        assert_eq!(view.content, "hello");
        assert_eq!(view.sent_by_name, "Anonymous");
        assert!(view.message_id.starts_with("msg_"));
    }

    #[tokio::test]
    async fn test_message_cap() {
        let (_clock, store) = test_store();
        let conn = Uuid::new_v4();
        let created = store.create_session(conn).await;

        for i in 0..4 {
            store
                .add_message(&created.session_id, conn, None, &format!("m{i}"))
                .await
                .unwrap();
        }
        let err = store
            .add_message(&created.session_id, conn, None, "overflow")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MessageCapReached { max: 4 }));
    }

    #[tokio::test]
    async fn test_message_delete_authorization() {
        let (_clock, store) = test_store();
        let creator = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();

        let created = store.create_session(creator).await;
        let code = created.session_id;
        store.add_member(&code, creator).await.unwrap();
        store.add_member(&code, sender).await.unwrap();
        store.add_member(&code, other).await.unwrap();

        // Creator may delete another member's message.
        let m1 = store
            .add_message(&code, sender, None, "first")
            .await
            .unwrap();
        store
            .delete_message(&code, &m1.message_id, creator)
            .await
            .unwrap();

        // A third member may not.
        let m2 = store
            .add_message(&code, sender, None, "second")
            .await
            .unwrap();
        let err = store
            .delete_message(&code, &m2.message_id, other)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden));

        // Once the creator leaves, only the sender remains authorized.
        store.remove_member(creator).await.unwrap();
        let m3 = store
            .add_message(&code, sender, None, "third")
            .await
            .unwrap();
        store.add_member(&code, creator).await.unwrap();
        let err = store
            .delete_message(&code, &m3.message_id, creator)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden));
        store
            .delete_message(&code, &m3.message_id, sender)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rebinding_moves_membership() {
        let (_clock, store) = test_store();
        let conn = Uuid::new_v4();

        let a = store.create_session(conn).await;
        let b = store.create_session(conn).await;

        store.add_member(&a.session_id, conn).await.unwrap();
        let outcome = store.add_member(&b.session_id, conn).await.unwrap();

        assert_eq!(outcome.previous, Some((a.session_id.clone(), 0)));
        assert_eq!(store.session_of(conn).await, Some(b.session_id.clone()));
        assert_eq!(store.binding_count().await, 1);
        assert_eq!(store.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_member_unknown_is_safe() {
        let (_clock, store) = test_store();
        assert!(store.remove_member(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_and_oldest_listings() {
        let (clock, store) = test_store();
        let conn = Uuid::new_v4();

        let first = store.create_session(conn).await;
        clock.advance(Duration::minutes(1));
        let second = store.create_session(conn).await;

        let oldest = store.oldest_session_codes(1).await;
        assert_eq!(oldest, vec![first.session_id.clone()]);

        clock.advance(Duration::hours(5));
        let expired = store.expired_session_codes().await;
        assert_eq!(expired, vec![first.session_id.clone()]);
        let _ = second;
    }

    #[tokio::test]
    async fn test_delete_session_unbinds_members() {
        let (_clock, store) = test_store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let created = store.create_session(a).await;
        store.add_member(&created.session_id, a).await.unwrap();
        store.add_member(&created.session_id, b).await.unwrap();
        store
            .add_file(&created.session_id, new_file(1, &b"abc"[..], a))
            .await
            .unwrap();

        assert!(store.delete_session(&created.session_id).await);
        assert!(!store.delete_session(&created.session_id).await);
        assert_eq!(store.total_bytes().await, 0);
        assert_eq!(store.binding_count().await, 0);
        assert!(store.session_of(a).await.is_none());
    }
}
