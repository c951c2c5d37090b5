use std::time::Duration;

use ahand_protocol::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("device {device_id} is not connected")]
    NotConnected { device_id: String },

    #[error("transport closed")]
    TransportClosed,

    #[error("outbox full: {capacity} unacknowledged messages retained")]
    OutboxFull { capacity: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no hello within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("session closed before a response arrived")]
    SessionClosed,

    #[error("job {0} is already in flight")]
    DuplicateJob(String),
}

impl HubError {
    /// Whether the transport that produced this error must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HubError::Protocol(_) | HubError::Codec(_) | HubError::HandshakeTimeout(_)
        )
    }
}
