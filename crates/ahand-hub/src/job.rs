use std::sync::{Mutex, MutexGuard, PoisonError};

use ahand_protocol::ApprovalRequest;
use tokio::sync::{mpsc, watch};

/// Lifecycle of a job as seen from the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Running,
    /// Running, but the device is holding it for a user decision.
    AwaitingApproval,
    Finished,
    Rejected,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Rejected)
    }
}

/// The single terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Finished { exit_code: i32, error: String },
    Rejected { reason: String },
}

/// Updates delivered to whoever started the job, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Progress(u32),
    ApprovalRequested(ApprovalRequest),
    Done(JobOutcome),
}

/// One outstanding tool invocation on a device.
///
/// The device session owns the routing entry; the `Arc<Job>` handed back
/// from `exec` is shared with the caller. The session lets go of its handle
/// when the job ends, so buffered output is freed with the caller's handle.
#[derive(Debug)]
pub struct Job {
    id: String,
    tool: String,
    args: Vec<String>,
    created_at_ms: u64,
    status: Mutex<JobStatus>,
    updates_tx: mpsc::UnboundedSender<JobUpdate>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<JobUpdate>>>,
    outcome: watch::Sender<Option<JobOutcome>>,
}

impl Job {
    pub(crate) fn new(id: String, tool: String, args: Vec<String>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            tool,
            args,
            created_at_ms: ahand_protocol::now_ms(),
            status: Mutex::new(JobStatus::Created),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            outcome,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn status(&self) -> JobStatus {
        *self.lock_status()
    }

    /// Take the update stream. Only the first caller gets it; updates that
    /// arrived before the call are buffered.
    ///
    /// The buffer is unbounded and lives as long as the `Job`: output of a
    /// job nobody takes the stream of stays in memory until the last
    /// `Arc<Job>` is dropped. Callers that only want the outcome should use
    /// [`done`](Self::done) and drop the job once it resolves.
    pub fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<JobUpdate>> {
        self.updates_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The outcome if the job has already ended.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome.borrow().clone()
    }

    /// Resolves once with the terminal outcome.
    ///
    /// Never resolves if the device never reports one, e.g. when the job was
    /// in flight on a connection that has since been replaced.
    pub async fn done(&self) -> JobOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub(crate) fn mark_running(&self) {
        let mut status = self.lock_status();
        if *status == JobStatus::Created {
            *status = JobStatus::Running;
        }
    }

    /// Forward an output/progress update. Dropped once the job is terminal.
    pub(crate) fn push(&self, update: JobUpdate) -> bool {
        let mut status = self.lock_status();
        if status.is_terminal() {
            return false;
        }
        *status = JobStatus::Running;
        let _ = self.updates_tx.send(update);
        true
    }

    pub(crate) fn enter_approval(&self, request: ApprovalRequest) -> bool {
        let mut status = self.lock_status();
        if status.is_terminal() {
            return false;
        }
        *status = JobStatus::AwaitingApproval;
        let _ = self.updates_tx.send(JobUpdate::ApprovalRequested(request));
        true
    }

    pub(crate) fn leave_approval(&self) {
        let mut status = self.lock_status();
        if *status == JobStatus::AwaitingApproval {
            *status = JobStatus::Running;
        }
    }

    /// Seal the job with its outcome. Returns false if it was already sealed.
    pub(crate) fn complete(&self, outcome: JobOutcome) -> bool {
        let mut status = self.lock_status();
        if status.is_terminal() {
            return false;
        }
        *status = match outcome {
            JobOutcome::Finished { .. } => JobStatus::Finished,
            JobOutcome::Rejected { .. } => JobStatus::Rejected,
        };
        let _ = self.updates_tx.send(JobUpdate::Done(outcome.clone()));
        let sealed = self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        debug_assert!(sealed, "job outcome set twice");
        sealed
    }

    fn lock_status(&self) -> MutexGuard<'_, JobStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
