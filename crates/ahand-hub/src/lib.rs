//! Hub side of the ahand device protocol.
//!
//! Devices dial in over an outbound-only transport and greet with a Hello.
//! The [`Registry`] keeps one [`DeviceSession`] per device; each session
//! multiplexes jobs and correlated requests over that device's connection
//! while its [`Outbox`] makes delivery resumable across reconnects.

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod job;
pub mod outbox;
pub mod registry;
pub mod transport;
pub mod ws;

pub use config::HubConfig;
pub use device::{DeviceInfo, DeviceSession, ExecOptions, PendingResponse};
pub use error::HubError;
pub use events::{DeviceEvent, HubEvent};
pub use job::{Job, JobOutcome, JobStatus, JobUpdate};
pub use outbox::Outbox;
pub use registry::Registry;
pub use transport::{FrameSender, FrameStream, PeerLink, Transport};
