use std::sync::Arc;
use std::time::Duration;

use ahand_protocol::envelope::Payload;
use ahand_protocol::{Hello, decode, payload_name};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::device::{DeviceInfo, DeviceSession};
use crate::error::HubError;
use crate::events::{DeviceEvent, HubEvent};
use crate::outbox::Outbox;
use crate::transport::{FrameSender, FrameStream, Transport};

/// Tracks the live session of every connected device.
///
/// Holds at most one session per device id. A Hello for a device that is
/// still registered replaces the old session and carries its outbox over.
pub struct Registry {
    sessions: DashMap<String, Arc<DeviceSession>>,
    events: broadcast::Sender<HubEvent>,
    outbox_capacity: usize,
    handshake_timeout: Option<Duration>,
}

impl Registry {
    pub fn new(config: &HubConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            sessions: DashMap::new(),
            events,
            outbox_capacity: config.outbox_capacity,
            handshake_timeout: config.handshake_timeout(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// The current session for a device, cloned so the caller doesn't hold
    /// the map entry.
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.get(device_id).map(|r| Arc::clone(r.value()))
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        let sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(r.value())).collect();
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run one transport to completion: handshake, then feed every inbound
    /// frame to the device session until either side closes.
    ///
    /// Protocol violations close the transport and are returned; the device
    /// is expected to reconnect on its own.
    pub async fn serve(&self, transport: Transport) -> Result<(), HubError> {
        let Transport { sender, mut frames } = transport;

        let (device_id, hello) = match self.handshake(&mut frames).await {
            Ok(hello) => hello,
            Err(e) => {
                warn!(error = %e, "handshake failed, closing transport");
                sender.close();
                return Err(e);
            }
        };

        let session = self.attach(device_id, hello, sender);

        let result = loop {
            tokio::select! {
                _ = session.closed() => break Ok(()),
                frame = frames.next() => {
                    let Some(frame) = frame else {
                        break Ok(());
                    };
                    match decode(&frame) {
                        Ok(envelope) => session.handle_envelope(envelope),
                        Err(e) => {
                            warn!(device_id = %session.device_id(), error = %e, "undecodable frame, closing transport");
                            break Err(HubError::from(e));
                        }
                    }
                }
            }
        };

        self.detach(&session);
        result
    }

    async fn handshake(&self, frames: &mut FrameStream) -> Result<(String, Hello), HubError> {
        let first = match self.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, frames.next())
                .await
                .map_err(|_| HubError::HandshakeTimeout(limit))?,
            None => frames.next().await,
        };
        let frame =
            first.ok_or_else(|| HubError::Protocol("transport closed before hello".to_string()))?;

        let envelope = decode(&frame)?;
        let hello = match envelope.payload {
            Some(Payload::Hello(hello)) => hello,
            Some(other) => {
                return Err(HubError::Protocol(format!(
                    "first frame must be Hello, got {}",
                    payload_name(&other)
                )));
            }
            None => return Err(HubError::Protocol("first frame has no payload".to_string())),
        };
        if envelope.device_id.is_empty() {
            return Err(HubError::Protocol("hello without device id".to_string()));
        }
        Ok((envelope.device_id, hello))
    }

    /// Install a session for a freshly greeted transport.
    ///
    /// The map entry stays locked from lookup to insert, so a concurrent
    /// Hello or close for the same device cannot interleave. Replay is queued
    /// on the new transport before the session becomes reachable.
    fn attach(&self, device_id: String, hello: Hello, sender: FrameSender) -> Arc<DeviceSession> {
        match self.sessions.entry(device_id.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = Arc::clone(slot.get());
                let taken = previous.retire();
                let resumed = taken.is_some();
                let mut outbox = taken.unwrap_or_else(|| Outbox::new(self.outbox_capacity));
                if !outbox.on_peer_ack(hello.last_ack) {
                    warn!(device_id = %device_id, last_ack = hello.last_ack, next_seq = outbox.next_seq(), "hello acks seqs never sent, ignored");
                }

                let replay = outbox.drain_unacked();
                for frame in &replay {
                    if sender.send(frame.clone()).is_err() {
                        break;
                    }
                }

                let session = Arc::new(DeviceSession::new(
                    device_id.clone(),
                    hello.clone(),
                    outbox,
                    sender,
                    self.events.clone(),
                ));
                slot.insert(Arc::clone(&session));

                info!(device_id = %device_id, last_ack = hello.last_ack, resumed, replayed = replay.len(), "device reconnected");
                self.emit(
                    device_id,
                    DeviceEvent::Connected {
                        hello,
                        resumed,
                        replayed: replay.len(),
                    },
                );
                session
            }
            Entry::Vacant(slot) => {
                let session = Arc::new(DeviceSession::new(
                    device_id.clone(),
                    hello.clone(),
                    Outbox::new(self.outbox_capacity),
                    sender,
                    self.events.clone(),
                ));
                slot.insert(Arc::clone(&session));

                info!(
                    device_id = %device_id,
                    hostname = %hello.hostname,
                    os = %hello.os,
                    version = %hello.version,
                    "device connected"
                );
                self.emit(
                    device_id,
                    DeviceEvent::Connected {
                        hello,
                        resumed: false,
                        replayed: 0,
                    },
                );
                session
            }
        }
    }

    /// Tear down a finished session, unregistering it only if it is still
    /// the current one for its device.
    fn detach(&self, session: &Arc<DeviceSession>) {
        // Unregister before retiring, so a Hello racing this close either
        // finds the slot empty or still finds the outbox to carry over.
        let removed = self
            .sessions
            .remove_if(session.device_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        session.retire();

        if removed {
            info!(device_id = %session.device_id(), "device disconnected");
            self.emit(session.device_id().to_string(), DeviceEvent::Disconnected);
        } else {
            debug!(device_id = %session.device_id(), "superseded session closed");
        }
    }

    fn emit(&self, device_id: String, event: DeviceEvent) {
        let _ = self.events.send(HubEvent { device_id, event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ExecOptions;
    use crate::transport::memory;

    fn hello(last_ack: u64) -> Hello {
        Hello {
            hostname: "laptop".to_string(),
            last_ack,
            ..Default::default()
        }
    }

    fn registry() -> Registry {
        Registry::new(&HubConfig {
            outbox_capacity: 8,
            ..HubConfig::default()
        })
    }

    #[tokio::test]
    async fn replaced_session_without_outbox_is_not_resumed() {
        let registry = registry();
        let mut events = registry.subscribe();

        let (first, _first_peer) = memory();
        let old = registry.attach("dev-1".to_string(), hello(0), first.sender);
        old.exec("ls", vec![], ExecOptions::default()).unwrap();
        events.recv().await.unwrap();

        // The old connection already gave its outbox up.
        assert!(old.retire().is_some());

        let (second, mut second_peer) = memory();
        registry.attach("dev-1".to_string(), hello(0), second.sender);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.event,
            DeviceEvent::Connected {
                resumed: false,
                replayed: 0,
                ..
            }
        ));
        assert!(second_peer.from_hub.try_recv().is_err());
    }

    #[tokio::test]
    async fn detach_of_current_session_unregisters_and_reports() {
        let registry = registry();
        let mut events = registry.subscribe();
        let (transport, peer) = memory();
        let session = registry.attach("dev-1".to_string(), hello(0), transport.sender);
        events.recv().await.unwrap();

        registry.detach(&session);

        assert!(registry.get("dev-1").is_none());
        assert!(peer.closed.is_cancelled());
        assert_eq!(events.recv().await.unwrap().event, DeviceEvent::Disconnected);
        assert!(session.retire().is_none());
    }

    #[tokio::test]
    async fn hello_ack_past_sent_frames_keeps_them_for_replay() {
        let registry = registry();
        let (first, _first_peer) = memory();
        let old = registry.attach("dev-1".to_string(), hello(0), first.sender);
        old.exec("ls", vec![], ExecOptions::default()).unwrap();

        let (second, mut second_peer) = memory();
        registry.attach("dev-1".to_string(), hello(7), second.sender);

        let replayed = ahand_protocol::decode(&second_peer.from_hub.try_recv().unwrap()).unwrap();
        assert_eq!(replayed.seq, 1);
        assert!(matches!(replayed.payload, Some(Payload::JobRequest(_))));
    }
}
