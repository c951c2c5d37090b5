//! Frame-level transport seen by the registry and device sessions.
//!
//! A transport is an opaque duplex channel of binary frames, one envelope per
//! frame. TLS, reconnect and backoff belong to whoever provides it.

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

/// Inbound frames in arrival order. The stream ends when the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Write half of a transport. Cloneable; closing any clone closes all.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

impl FrameSender {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, closed: CancellationToken) -> Self {
        Self { tx, closed }
    }

    /// Queue one frame for the writer. Never waits on the socket.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::TransportClosed);
        }
        self.tx.send(frame).map_err(|_| HubError::TransportClosed)
    }

    /// Idempotent; closing a dead transport is a no-op.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Completes once the transport is closed from either side.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

pub struct Transport {
    pub sender: FrameSender,
    pub frames: FrameStream,
}

/// Far end of an in-memory transport: what a device would hold.
pub struct PeerLink {
    /// Frames from the device to the hub. Dropping it ends the hub's stream.
    pub to_hub: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames from the hub to the device.
    pub from_hub: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Cancelled when the hub closes the transport.
    pub closed: CancellationToken,
}

/// In-process transport pair, for tests and for embedding the hub behind
/// another frame carrier.
pub fn memory() -> (Transport, PeerLink) {
    let (hub_tx, from_hub) = mpsc::unbounded_channel();
    let (to_hub, hub_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let transport = Transport {
        sender: FrameSender::new(hub_tx, closed.clone()),
        frames: Box::pin(UnboundedReceiverStream::new(hub_rx)),
    };
    let peer = PeerLink {
        to_hub,
        from_hub,
        closed,
    };
    (transport, peer)
}
