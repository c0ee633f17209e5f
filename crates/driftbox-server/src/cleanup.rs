//! Periodic maintenance: TTL sweeps, stale uploads, memory pressure.
//!
//! Each evicted session is handled independently so one slow room cannot
//! stall the tick, and ticks never hold the dispatcher up: everything goes
//! through the same store and registry locks as normal requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use driftbox_shared::constants::{
    EMERGENCY_EVICTION_COUNT, MEMORY_CRITICAL_THRESHOLD, MEMORY_WARNING_THRESHOLD,
};
use driftbox_shared::protocol::{ServerEvent, SessionExpiredEvent};
use driftbox_store::MemoryStore;

use crate::adapters::RoomNotifier;
use crate::uploads::UploadAssembler;

pub struct CleanupService {
    store: Arc<MemoryStore>,
    uploads: Arc<UploadAssembler>,
    notifier: Arc<dyn RoomNotifier>,
    max_total_bytes: u64,
}

impl CleanupService {
    pub fn new(
        store: Arc<MemoryStore>,
        uploads: Arc<UploadAssembler>,
        notifier: Arc<dyn RoomNotifier>,
        max_total_bytes: u64,
    ) -> Self {
        Self {
            store,
            uploads,
            notifier,
            max_total_bytes,
        }
    }

    /// One full maintenance pass. Exposed so tests can tick deterministically.
    pub async fn run_once(&self) {
        for code in self.store.expired_session_codes().await {
            self.expire_session(&code, "expired").await;
        }

        let swept = self.uploads.sweep_stale().await;
        if swept > 0 {
            debug!(count = swept, "Swept stale uploads");
        }

        let used = self.store.total_bytes().await;
        let usage = used as f64 / self.max_total_bytes as f64;
        if usage >= MEMORY_CRITICAL_THRESHOLD {
            warn!(
                used,
                budget = self.max_total_bytes,
                "Memory critical, evicting oldest sessions"
            );
            for code in self
                .store
                .oldest_session_codes(EMERGENCY_EVICTION_COUNT)
                .await
            {
                self.expire_session(&code, "evicted").await;
            }
        } else if usage >= MEMORY_WARNING_THRESHOLD {
            warn!(used, budget = self.max_total_bytes, "Memory usage high");
        }
    }

    /// Members hear `session:expired` before the bytes go away.
    async fn expire_session(&self, code: &str, reason: &str) {
        let members = self.store.members_of(code).await;
        self.notifier
            .notify(
                &members,
                &ServerEvent::SessionExpired(SessionExpiredEvent {
                    session_id: code.to_string(),
                    reason: reason.to_string(),
                }),
            )
            .await;
        if self.store.delete_session(code).await {
            info!(session = %code, reason, "Session evicted");
        }
    }

    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use driftbox_shared::protocol::WireFrame;
    use driftbox_store::{ManualClock, MemoryStore, NewFile, StoreLimits};

    use super::*;
    use crate::rooms::RoomRegistry;
    use crate::uploads::UploadLimits;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        uploads: Arc<UploadAssembler>,
        rooms: Arc<RoomRegistry>,
        cleanup: CleanupService,
    }

    fn fixture(max_total_bytes: u64) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone(), StoreLimits::default()));
        let uploads = Arc::new(UploadAssembler::new(clock.clone(), UploadLimits::default()));
        let rooms = Arc::new(RoomRegistry::new());
        let cleanup = CleanupService::new(
            store.clone(),
            uploads.clone(),
            rooms.clone(),
            max_total_bytes,
        );
        Fixture {
            clock,
            store,
            uploads,
            rooms,
            cleanup,
        }
    }

    fn file(id: u8, size: usize) -> NewFile {
        NewFile {
            id: format!("{id:02x}").repeat(16),
            filename: "f.bin".into(),
            mime_type: None,
            payload: Bytes::from(vec![0u8; size]),
            uploaded_by: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_ttl_sweep_notifies_then_deletes() {
        let fx = fixture(1_000_000);
        let member = Uuid::new_v4();
        let created = fx.store.create_session(member).await;
        fx.store
            .add_member(&created.session_id, member)
            .await
            .unwrap();
        fx.store
            .add_file(&created.session_id, file(1, 10))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.rooms.register(member, tx).await;

        fx.clock
            .advance(ChronoDuration::hours(5) + ChronoDuration::seconds(1));
        fx.cleanup.run_once().await;

        let frame = WireFrame::from_bytes(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.name, "session:expired");
        assert_eq!(fx.store.session_count().await, 0);
        assert_eq!(fx.store.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_pressure_evicts_five_oldest() {
        let fx = fixture(100);

        let mut codes = Vec::new();
        for i in 0..7u8 {
            let created = fx.store.create_session(Uuid::new_v4()).await;
            fx.store
                .add_file(&created.session_id, file(i, 14))
                .await
                .unwrap();
            codes.push(created.session_id);
            fx.clock.advance(ChronoDuration::seconds(1));
        }
        // 7 * 14 = 98 bytes against a budget of 100: critical.
        assert_eq!(fx.store.total_bytes().await, 98);

        fx.cleanup.run_once().await;

        assert_eq!(fx.store.session_count().await, 2);
        for survivor in &codes[5..] {
            assert!(fx.store.snapshot(survivor).await.is_ok());
        }
        assert_eq!(fx.store.total_bytes().await, 28);
    }

    #[tokio::test]
    async fn test_warning_zone_only_logs() {
        let fx = fixture(100);
        let created = fx.store.create_session(Uuid::new_v4()).await;
        fx.store
            .add_file(&created.session_id, file(1, 85))
            .await
            .unwrap();

        fx.cleanup.run_once().await;

        assert_eq!(fx.store.session_count().await, 1);
        assert_eq!(fx.store.total_bytes().await, 85);
    }

    #[tokio::test]
    async fn test_tick_sweeps_stale_uploads() {
        let fx = fixture(1_000_000);
        let created = fx.store.create_session(Uuid::new_v4()).await;
        fx.uploads
            .start(&created.session_id, Uuid::new_v4(), "f", None, 10, 2)
            .await
            .unwrap();

        fx.clock.advance(ChronoDuration::minutes(31));
        fx.cleanup.run_once().await;

        assert_eq!(fx.uploads.receiving_count(&created.session_id).await, 0);
    }
}
