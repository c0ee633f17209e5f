//! Pluggable frame transport.
//!
//! The client core is transport-agnostic: anything that can move
//! `WireFrame`s in both directions works. Production wires this to a
//! WebSocket; tests and in-process embedding use the channel pair.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use driftbox_shared::protocol::WireFrame;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
}

#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    async fn send(&self, frame: WireFrame) -> Result<(), TransportError>;

    /// The next inbound frame, or `None` once the peer is gone.
    async fn recv(&self) -> Option<WireFrame>;
}

/// In-memory duplex: two halves, each seeing the other's sends.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<WireFrame>,
    rx: Mutex<mpsc::UnboundedReceiver<WireFrame>>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                tx: left_tx,
                rx: Mutex::new(right_rx),
            },
            ChannelTransport {
                tx: right_tx,
                rx: Mutex::new(left_rx),
            },
        )
    }
}

#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<WireFrame> {
        self.rx.lock().await.recv().await
    }
}
