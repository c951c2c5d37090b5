use std::collections::VecDeque;

use ahand_protocol::Envelope;

use crate::error::HubError;

/// Outbox tracks outbound seq, inbound ack, and retains unacknowledged
/// frames for replay on reconnect.
///
/// An outbox belongs to one device, not to one socket: on reconnect the
/// registry moves it into the new session.
#[derive(Debug)]
pub struct Outbox {
    next_seq: u64,
    /// Highest seq the peer has acknowledged.
    peer_ack: u64,
    /// Highest seq we have received from the peer.
    local_ack: u64,
    /// (seq, encoded envelope), ascending by seq.
    buffer: VecDeque<(u64, Vec<u8>)>,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            peer_ack: 0,
            local_ack: 0,
            buffer: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Assign the next seq and the current local ack to an outbound envelope.
    /// Returns the assigned seq.
    pub fn stamp(&mut self, envelope: &mut Envelope) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        envelope.seq = seq;
        envelope.ack = self.local_ack;
        seq
    }

    /// Retain an encoded frame until the peer acknowledges it.
    ///
    /// Unacknowledged frames are never evicted; a full outbox refuses.
    pub fn store(&mut self, seq: u64, data: Vec<u8>) -> Result<(), HubError> {
        if self.is_full() {
            return Err(HubError::OutboxFull {
                capacity: self.capacity,
            });
        }
        debug_assert!(self.buffer.back().is_none_or(|(last, _)| *last < seq));
        self.buffer.push_back((seq, data));
        Ok(())
    }

    /// Stamp, encode and retain in one step. Checks capacity before
    /// stamping so a refused send does not burn a seq.
    pub fn prepare(&mut self, envelope: &mut Envelope) -> Result<(u64, Vec<u8>), HubError> {
        if self.is_full() {
            return Err(HubError::OutboxFull {
                capacity: self.capacity,
            });
        }
        let seq = self.stamp(envelope);
        let data = ahand_protocol::encode(envelope);
        self.store(seq, data.clone())?;
        Ok((seq, data))
    }

    /// Record a seq received from the peer.
    pub fn on_recv(&mut self, seq: u64) {
        if seq > self.local_ack {
            self.local_ack = seq;
        }
    }

    /// Apply the peer's ack and drop every frame it covers.
    ///
    /// An ack at or past `next_seq` names frames this outbox never sent and
    /// is ignored whole; returns false in that case.
    pub fn on_peer_ack(&mut self, ack: u64) -> bool {
        if ack >= self.next_seq {
            return false;
        }
        if ack > self.peer_ack {
            self.peer_ack = ack;
        }
        while let Some((seq, _)) = self.buffer.front() {
            if *seq <= self.peer_ack {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
        true
    }

    /// Take back the most recently prepared frame after its send failed.
    /// Only the newest frame can be retracted, which also returns its seq.
    pub fn retract(&mut self, seq: u64) -> bool {
        if self.buffer.back().is_some_and(|(last, _)| *last == seq) && seq + 1 == self.next_seq {
            self.buffer.pop_back();
            self.next_seq = seq;
            return true;
        }
        false
    }

    /// Unacknowledged frames in send order. They stay retained until acked.
    pub fn drain_unacked(&self) -> Vec<Vec<u8>> {
        self.buffer.iter().map(|(_, data)| data.clone()).collect()
    }

    pub fn local_ack(&self) -> u64 {
        self.local_ack
    }

    pub fn peer_ack(&self) -> u64 {
        self.peer_ack
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Number of retained (unacked) frames.
    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }
}
