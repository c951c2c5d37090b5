#![allow(dead_code)]

use std::time::Duration;

use ahand_hub::transport::{PeerLink, Transport, memory};
use ahand_hub::{HubConfig, Outbox, Registry};
use ahand_protocol::envelope::Payload;
use ahand_protocol::{Envelope, Hello, decode, encode};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn registry() -> Registry {
    Registry::new(&HubConfig {
        outbox_capacity: 64,
        handshake_timeout_secs: 0,
        ..HubConfig::default()
    })
}

/// Device end of an in-memory transport, with its own seq/ack bookkeeping.
pub struct FakeDevice {
    pub device_id: String,
    pub link: PeerLink,
    pub outbox: Outbox,
}

impl FakeDevice {
    pub fn connect(device_id: &str) -> (Self, Transport) {
        let (transport, link) = memory();
        let device = Self {
            device_id: device_id.to_string(),
            link,
            outbox: Outbox::new(64),
        };
        (device, transport)
    }

    pub fn send_raw(&self, frame: Vec<u8>) {
        self.link.to_hub.send(frame).expect("hub side dropped");
    }

    pub fn hello(&self, last_ack: u64) {
        let envelope = Envelope {
            device_id: self.device_id.clone(),
            payload: Some(Payload::Hello(Hello {
                version: "0.1.0".to_string(),
                hostname: "test-host".to_string(),
                os: "linux".to_string(),
                capabilities: vec!["exec".to_string()],
                last_ack,
            })),
            ..Default::default()
        };
        self.send_raw(encode(&envelope));
    }

    /// Send a payload on the reliable stream, stamped with seq and ack.
    pub fn send(&mut self, payload: Payload) -> u64 {
        let mut envelope = Envelope {
            device_id: self.device_id.clone(),
            payload: Some(payload),
            ..Default::default()
        };
        let (seq, frame) = self.outbox.prepare(&mut envelope).expect("device outbox full");
        self.send_raw(frame);
        seq
    }

    /// Next frame from the hub, recorded as received.
    pub async fn recv(&mut self) -> Envelope {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.link.from_hub.recv())
            .await
            .expect("timed out waiting for hub frame")
            .expect("hub closed the transport");
        let envelope = decode(&frame).expect("hub sent an undecodable frame");
        self.outbox.on_recv(envelope.seq);
        envelope
    }

    pub async fn wait_closed(&self) {
        tokio::time::timeout(RECV_TIMEOUT, self.link.closed.cancelled())
            .await
            .expect("hub did not close the transport");
    }
}
