//! Outbound frame routing.
//!
//! The registry maps connection ids to their outbound frame queues. Room
//! targeting is resolved by the caller from the store's member sets, so the
//! registry itself stays a dumb fan-out: events are encoded once and the
//! encoded bytes are refcounted to every recipient.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;
use uuid::Uuid;

use driftbox_shared::protocol::{ServerEvent, WireFrame};

pub type FrameSender = mpsc::UnboundedSender<Bytes>;

#[derive(Default)]
pub struct RoomRegistry {
    connections: RwLock<HashMap<Uuid, FrameSender>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: Uuid, sender: FrameSender) {
        self.connections.write().await.insert(conn, sender);
    }

    pub async fn unregister(&self, conn: Uuid) {
        self.connections.write().await.remove(&conn);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Queue a frame for one connection. A send to a connection that is
    /// tearing down is silently dropped; the disconnect path cleans up.
    pub async fn send_frame(&self, conn: Uuid, frame: &WireFrame) {
        let encoded = Bytes::from(frame.to_bytes());
        if let Some(sender) = self.connections.read().await.get(&conn) {
            let _ = sender.send(encoded);
        }
    }

    pub async fn send_event(&self, conn: Uuid, event: &ServerEvent) {
        self.send_frame(conn, &WireFrame::event(event)).await;
    }

    /// Deliver an event to every listed member, encoding it exactly once.
    pub async fn broadcast(&self, members: &[Uuid], event: &ServerEvent) {
        if members.is_empty() {
            return;
        }
        let encoded = Bytes::from(WireFrame::event(event).to_bytes());
        let connections = self.connections.read().await;
        for member in members {
            if let Some(sender) = connections.get(member) {
                let _ = sender.send(encoded.clone());
            }
        }
        trace!(
            event = event.name().as_str(),
            recipients = members.len(),
            "Broadcast"
        );
    }

    /// Broadcast to everyone in the list except one connection, for events
    /// that describe that connection to the rest of the room.
    pub async fn broadcast_except(&self, members: &[Uuid], except: Uuid, event: &ServerEvent) {
        let others: Vec<Uuid> = members.iter().copied().filter(|m| *m != except).collect();
        self.broadcast(&others, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftbox_shared::protocol::{FrameKind, MemberCountEvent};

    fn member_event(count: u32) -> ServerEvent {
        ServerEvent::MemberJoined(MemberCountEvent {
            member_count: count,
        })
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a, tx_a).await;
        registry.register(b, tx_b).await;

        registry.broadcast(&[a, b], &member_event(2)).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = WireFrame::from_bytes(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame.kind, FrameKind::Event);
            assert_eq!(frame.name, "member:joined");
        }
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_origin() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a, tx_a).await;
        registry.register(b, tx_b).await;

        registry.broadcast_except(&[a, b], a, &member_event(2)).await;

        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unregistered_is_noop() {
        let registry = RoomRegistry::new();
        registry.send_event(Uuid::new_v4(), &member_event(1)).await;
        assert_eq!(registry.connection_count().await, 0);
    }
}
