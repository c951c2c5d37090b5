use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahand_protocol::envelope::Payload;
use ahand_protocol::{
    ApprovalResponse, BrowserRequest, BrowserResponse, CancelJob, Envelope, Hello, JobRequest,
    PolicyQuery, PolicyUpdate, SessionMode, SessionQuery, SetSessionMode, job_event, payload_name,
};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::events::{DeviceEvent, HubEvent};
use crate::job::{Job, JobOutcome, JobUpdate};
use crate::outbox::Outbox;
use crate::transport::FrameSender;

/// Options for [`DeviceSession::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    /// 0 leaves the timeout to the device.
    pub timeout_ms: u64,
    pub trace_id: Option<String>,
}

/// Snapshot of a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub hostname: String,
    pub os: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub connected_at_ms: u64,
    pub unacked: usize,
    pub active_jobs: usize,
}

/// A correlated request waiting for its response.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<BrowserResponse>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the matching response. There is no timeout here; wrap in
    /// `tokio::time::timeout` and call [`DeviceSession::forget_request`]
    /// when giving up.
    pub async fn response(self) -> Result<BrowserResponse, HubError> {
        self.rx.await.map_err(|_| HubError::SessionClosed)
    }
}

struct SessionState {
    /// Taken by the registry when this connection is superseded.
    outbox: Option<Outbox>,
    jobs: HashMap<String, Arc<Job>>,
    pending: HashMap<String, oneshot::Sender<BrowserResponse>>,
}

/// One live connection to one device.
///
/// Inbound envelopes are handled by the registry's read loop for this
/// connection; outbound calls may come from any task. Both go through the
/// same state lock, which also keeps frames on the wire in seq order.
pub struct DeviceSession {
    device_id: String,
    hello: Hello,
    connected_at_ms: u64,
    sender: FrameSender,
    state: Mutex<SessionState>,
    events: broadcast::Sender<HubEvent>,
}

impl DeviceSession {
    pub(crate) fn new(
        device_id: String,
        hello: Hello,
        outbox: Outbox,
        sender: FrameSender,
        events: broadcast::Sender<HubEvent>,
    ) -> Self {
        Self {
            device_id,
            hello,
            connected_at_ms: ahand_protocol::now_ms(),
            sender,
            state: Mutex::new(SessionState {
                outbox: Some(outbox),
                jobs: HashMap::new(),
                pending: HashMap::new(),
            }),
            events,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn info(&self) -> DeviceInfo {
        let state = self.state();
        DeviceInfo {
            device_id: self.device_id.clone(),
            hostname: self.hello.hostname.clone(),
            os: self.hello.os.clone(),
            version: self.hello.version.clone(),
            capabilities: self.hello.capabilities.clone(),
            connected_at_ms: self.connected_at_ms,
            unacked: state.outbox.as_ref().map_or(0, Outbox::pending_count),
            active_jobs: state.jobs.len(),
        }
    }

    pub fn job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.state().jobs.get(job_id).cloned()
    }

    /// Start a tool on the device. Returns as soon as the request is queued.
    pub fn exec(
        &self,
        tool: &str,
        args: Vec<String>,
        opts: ExecOptions,
    ) -> Result<Arc<Job>, HubError> {
        self.exec_with_id(uuid::Uuid::new_v4().to_string(), tool, args, opts)
    }

    /// Like [`exec`](Self::exec) with a caller-chosen job id.
    pub fn exec_with_id(
        &self,
        job_id: String,
        tool: &str,
        args: Vec<String>,
        opts: ExecOptions,
    ) -> Result<Arc<Job>, HubError> {
        let mut state = self.state();
        if state.jobs.contains_key(&job_id) {
            return Err(HubError::DuplicateJob(job_id));
        }

        let job = Arc::new(Job::new(job_id.clone(), tool.to_string(), args.clone()));
        let request = JobRequest {
            job_id: job_id.clone(),
            tool: tool.to_string(),
            args,
            cwd: opts.cwd.unwrap_or_default(),
            env: opts.env,
            timeout_ms: opts.timeout_ms,
        };
        let seq = self.send_locked(
            &mut state,
            Payload::JobRequest(request),
            opts.trace_id.unwrap_or_default(),
        )?;
        job.mark_running();
        state.jobs.insert(job_id.clone(), Arc::clone(&job));

        info!(device_id = %self.device_id, job_id = %job_id, tool, seq, "job dispatched");
        Ok(job)
    }

    /// Ask the device to cancel a job. The job stays live until the device
    /// reports how it ended.
    pub fn cancel_job(&self, job_id: &str) -> Result<u64, HubError> {
        self.send(Payload::CancelJob(CancelJob {
            job_id: job_id.to_string(),
        }))
    }

    pub fn approve_job(
        &self,
        job_id: &str,
        approved: bool,
        remember: bool,
        reason: &str,
    ) -> Result<u64, HubError> {
        let mut state = self.state();
        let seq = self.send_locked(
            &mut state,
            Payload::ApprovalResponse(ApprovalResponse {
                job_id: job_id.to_string(),
                approved,
                remember,
                reason: reason.to_string(),
            }),
            String::new(),
        )?;
        if let Some(job) = state.jobs.get(job_id) {
            job.leave_approval();
        }
        Ok(seq)
    }

    /// The answer arrives later as [`DeviceEvent::PolicyState`].
    pub fn query_policy(&self) -> Result<u64, HubError> {
        self.send(Payload::PolicyQuery(PolicyQuery {}))
    }

    pub fn update_policy(&self, update: PolicyUpdate) -> Result<u64, HubError> {
        self.send(Payload::PolicyUpdate(update))
    }

    /// The answer arrives later as [`DeviceEvent::SessionState`].
    pub fn set_session_mode(
        &self,
        caller_uid: &str,
        mode: SessionMode,
        trust_timeout_mins: u64,
    ) -> Result<u64, HubError> {
        self.send(Payload::SetSessionMode(SetSessionMode {
            caller_uid: caller_uid.to_string(),
            mode: mode.into(),
            trust_timeout_mins,
        }))
    }

    /// An empty `caller_uid` asks for every caller.
    pub fn query_session(&self, caller_uid: &str) -> Result<u64, HubError> {
        self.send(Payload::SessionQuery(SessionQuery {
            caller_uid: caller_uid.to_string(),
        }))
    }

    /// Send a request matched to its response by a fresh request id.
    pub fn send_correlated(
        &self,
        session_id: &str,
        action: &str,
        params_json: &str,
        timeout_ms: u64,
    ) -> Result<PendingResponse, HubError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let mut state = self.state();
        self.send_locked(
            &mut state,
            Payload::BrowserRequest(BrowserRequest {
                request_id: request_id.clone(),
                session_id: session_id.to_string(),
                action: action.to_string(),
                params_json: params_json.to_string(),
                timeout_ms,
            }),
            String::new(),
        )?;
        state.pending.insert(request_id.clone(), tx);

        debug!(device_id = %self.device_id, request_id = %request_id, action, "correlated request sent");
        Ok(PendingResponse { request_id, rx })
    }

    /// Drop the resolver for a request the caller stopped waiting for.
    pub fn forget_request(&self, request_id: &str) -> bool {
        self.state().pending.remove(request_id).is_some()
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub(crate) async fn closed(&self) {
        self.sender.closed().await
    }

    /// Close the transport and give up everything owned by this connection.
    /// Returns the outbox unless a successor already took it.
    ///
    /// Pending correlated requests fail with `SessionClosed`; jobs are
    /// dropped from routing without being resolved.
    pub(crate) fn retire(&self) -> Option<Outbox> {
        // Close under the lock so no send can store a frame after the
        // closed check and then fail to write it.
        let mut state = self.state();
        self.sender.close();
        state.pending.clear();
        state.jobs.clear();
        state.outbox.take()
    }

    /// Apply one decoded inbound envelope.
    pub(crate) fn handle_envelope(&self, envelope: Envelope) {
        let mut state = self.state();
        if let Some(outbox) = state.outbox.as_mut() {
            outbox.on_recv(envelope.seq);
            if !outbox.on_peer_ack(envelope.ack) {
                warn!(device_id = %self.device_id, ack = envelope.ack, next_seq = outbox.next_seq(), "ack beyond last sent seq ignored");
            }
        }

        let Some(payload) = envelope.payload else {
            return;
        };

        match payload {
            Payload::JobEvent(event) => {
                let Some(job) = state.jobs.get(&event.job_id) else {
                    debug!(device_id = %self.device_id, job_id = %event.job_id, "event for unknown job dropped");
                    return;
                };
                let update = match event.event {
                    Some(job_event::Event::StdoutChunk(data)) => JobUpdate::Stdout(data),
                    Some(job_event::Event::StderrChunk(data)) => JobUpdate::Stderr(data),
                    Some(job_event::Event::Progress(p)) => JobUpdate::Progress(p),
                    None => return,
                };
                job.push(update);
            }
            Payload::JobFinished(finished) => {
                self.finish_job(
                    &mut state,
                    &finished.job_id,
                    JobOutcome::Finished {
                        exit_code: finished.exit_code,
                        error: finished.error,
                    },
                );
            }
            Payload::JobRejected(rejected) => {
                self.finish_job(
                    &mut state,
                    &rejected.job_id,
                    JobOutcome::Rejected {
                        reason: rejected.reason,
                    },
                );
            }
            Payload::ApprovalRequest(request) => {
                if let Some(job) = state.jobs.get(&request.job_id) {
                    job.enter_approval(request.clone());
                }
                info!(device_id = %self.device_id, job_id = %request.job_id, tool = %request.tool, "approval requested");
                self.emit(DeviceEvent::ApprovalRequested(request));
            }
            Payload::ApprovalResponse(response) => {
                if let Some(job) = state.jobs.get(&response.job_id) {
                    job.leave_approval();
                }
                self.emit(DeviceEvent::ApprovalResolved(response));
            }
            Payload::CancelJob(cancel) => {
                self.emit(DeviceEvent::CancelRequested {
                    job_id: cancel.job_id,
                });
            }
            Payload::PolicyState(policy) => self.emit(DeviceEvent::PolicyState(policy)),
            Payload::SessionState(session) => self.emit(DeviceEvent::SessionState(session)),
            Payload::BrowserResponse(response) => {
                match state.pending.remove(&response.request_id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        debug!(device_id = %self.device_id, request_id = %response.request_id, "response for unknown request dropped");
                    }
                }
            }
            Payload::Hello(_) => {
                warn!(device_id = %self.device_id, "duplicate hello on established connection ignored");
            }
            other @ (Payload::JobRequest(_)
            | Payload::PolicyQuery(_)
            | Payload::PolicyUpdate(_)
            | Payload::SetSessionMode(_)
            | Payload::SessionQuery(_)
            | Payload::BrowserRequest(_)) => {
                debug!(device_id = %self.device_id, payload = payload_name(&other), "hub-bound payload of the wrong direction ignored");
            }
        }
    }

    fn finish_job(&self, state: &mut SessionState, job_id: &str, outcome: JobOutcome) {
        let Some(job) = state.jobs.remove(job_id) else {
            debug!(device_id = %self.device_id, job_id, "outcome for unknown job dropped");
            return;
        };
        info!(device_id = %self.device_id, job_id, outcome = ?outcome, "job ended");
        job.complete(outcome);
    }

    fn send(&self, payload: Payload) -> Result<u64, HubError> {
        let mut state = self.state();
        self.send_locked(&mut state, payload, String::new())
    }

    fn send_locked(
        &self,
        state: &mut SessionState,
        payload: Payload,
        trace_id: String,
    ) -> Result<u64, HubError> {
        let not_connected = || HubError::NotConnected {
            device_id: self.device_id.clone(),
        };
        if self.sender.is_closed() {
            return Err(not_connected());
        }
        let outbox = state.outbox.as_mut().ok_or_else(not_connected)?;

        let mut envelope = Envelope {
            device_id: self.device_id.clone(),
            trace_id,
            msg_id: uuid::Uuid::new_v4().to_string(),
            ts_ms: ahand_protocol::now_ms(),
            payload: Some(payload),
            ..Default::default()
        };
        let (seq, frame) = outbox.prepare(&mut envelope).inspect_err(|e| {
            warn!(device_id = %self.device_id, error = %e, "outbound message refused");
        })?;
        if self.sender.send(frame).is_err() {
            // Peer went away after the closed check; keep the frame out of
            // any later replay since the caller is told it failed.
            outbox.retract(seq);
            return Err(not_connected());
        }
        Ok(seq)
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(HubEvent {
            device_id: self.device_id.clone(),
            event,
        });
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
