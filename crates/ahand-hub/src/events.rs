use ahand_protocol::{ApprovalRequest, ApprovalResponse, Hello, PolicyState, SessionState};

/// Device-level notifications for consumers such as the dashboard.
/// Per-job output goes to the job itself, not here.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected {
        hello: Hello,
        /// True when an existing outbox was carried over from a previous
        /// connection of the same device.
        resumed: bool,
        /// Frames replayed to the device before live traffic resumed.
        replayed: usize,
    },
    Disconnected,
    ApprovalRequested(ApprovalRequest),
    ApprovalResolved(ApprovalResponse),
    CancelRequested { job_id: String },
    PolicyState(PolicyState),
    SessionState(SessionState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    pub device_id: String,
    pub event: DeviceEvent,
}
