//! Wire types for the hub ↔ device protocol and the envelope codec.
//!
//! The generated types live under [`v1`] and are re-exported at the crate
//! root, so `ahand_protocol::Envelope` and `ahand_protocol::envelope::Payload`
//! both resolve.

pub mod codec;

pub mod v1 {
    tonic::include_proto!("ahand.v1");
}

pub use codec::{CodecError, decode, encode, payload_name};
pub use v1::*;

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_reasonable() {
        let ms = now_ms();
        assert!(ms > 1_704_067_200_000);
        assert!(ms < 4_102_444_800_000);
    }

    #[test]
    fn session_mode_prefix_is_stripped() {
        assert_eq!(SessionMode::AutoAccept as i32, 3);
        assert_eq!(SessionMode::try_from(2).ok(), Some(SessionMode::Trust));
    }
}
