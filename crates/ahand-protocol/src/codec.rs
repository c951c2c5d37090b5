use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use prost::Message;
use prost::encoding::{DecodeContext, WireType, decode_key, skip_field};
use thiserror::Error;

use crate::v1::Envelope;
use crate::v1::envelope::Payload;

/// Field numbers reserved for `Envelope.payload` variants.
pub const PAYLOAD_TAGS: RangeInclusive<u32> = 10..=25;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope carries no payload")]
    MissingPayload,

    #[error("envelope carries more than one payload (fields {tags:?})")]
    MultiplePayloads { tags: Vec<u32> },
}

pub fn encode(envelope: &Envelope) -> Vec<u8> {
    envelope.encode_to_vec()
}

/// Decode one frame into an envelope with exactly one payload variant.
///
/// Unknown top-level fields are skipped. Protobuf decodes a oneof as
/// last-field-wins, so the populated variants are counted on the raw wire
/// before the decoded envelope is accepted.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let envelope = Envelope::decode(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let tags = payload_tags(bytes)?;
    if tags.len() > 1 {
        return Err(CodecError::MultiplePayloads {
            tags: tags.into_iter().collect(),
        });
    }
    if envelope.payload.is_none() {
        return Err(CodecError::MissingPayload);
    }
    Ok(envelope)
}

fn payload_tags(mut buf: &[u8]) -> Result<BTreeSet<u32>, CodecError> {
    let mut tags = BTreeSet::new();
    while !buf.is_empty() {
        let (tag, wire_type) =
            decode_key(&mut buf).map_err(|e| CodecError::Malformed(e.to_string()))?;
        if PAYLOAD_TAGS.contains(&tag) && wire_type == WireType::LengthDelimited {
            tags.insert(tag);
        }
        skip_field(wire_type, tag, &mut buf, DecodeContext::default())
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
    }
    Ok(tags)
}

/// Short variant name for logs.
pub fn payload_name(payload: &Payload) -> &'static str {
    match payload {
        Payload::Hello(_) => "Hello",
        Payload::JobRequest(_) => "JobRequest",
        Payload::JobEvent(_) => "JobEvent",
        Payload::JobFinished(_) => "JobFinished",
        Payload::JobRejected(_) => "JobRejected",
        Payload::CancelJob(_) => "CancelJob",
        Payload::ApprovalRequest(_) => "ApprovalRequest",
        Payload::ApprovalResponse(_) => "ApprovalResponse",
        Payload::PolicyQuery(_) => "PolicyQuery",
        Payload::PolicyState(_) => "PolicyState",
        Payload::PolicyUpdate(_) => "PolicyUpdate",
        Payload::SetSessionMode(_) => "SetSessionMode",
        Payload::SessionQuery(_) => "SessionQuery",
        Payload::SessionState(_) => "SessionState",
        Payload::BrowserRequest(_) => "BrowserRequest",
        Payload::BrowserResponse(_) => "BrowserResponse",
    }
}
