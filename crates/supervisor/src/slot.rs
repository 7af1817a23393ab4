//! Runtime state of one supervised worker.

use std::fmt;

use {
    serde::{Deserialize, Serialize},
    tgrelay_config::WorkerDescriptor,
    tokio::time::Instant,
};

use crate::process::WorkerProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Waiting for the next tick to launch.
    Starting,
    Running,
    /// Exited; relaunch scheduled.
    CoolingDown,
    /// Another process holds the session lock.
    WaitingForSession,
    /// Halted until the operator intervenes or the config changes.
    Failed,
    Stopped,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::CoolingDown => "cooling_down",
            Self::WaitingForSession => "waiting_for_session",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct WorkerSlot {
    pub descriptor: WorkerDescriptor,
    /// Fingerprint of `descriptor` at launch time.
    pub fingerprint: String,
    pub status: WorkerStatus,
    pub restart_count: u32,
    pub started_at: Option<Instant>,
    pub process: Option<Box<dyn WorkerProcess>>,
    /// Earliest relaunch while cooling down.
    pub restart_at: Option<Instant>,
    /// When the session lock was first found held.
    pub lock_wait_since: Option<Instant>,
    /// Why the worker failed, for the status file.
    pub detail: Option<String>,
}

impl WorkerSlot {
    pub fn new(descriptor: WorkerDescriptor) -> Self {
        Self {
            fingerprint: descriptor.fingerprint(),
            descriptor,
            status: WorkerStatus::Starting,
            restart_count: 0,
            started_at: None,
            process: None,
            restart_at: None,
            lock_wait_since: None,
            detail: None,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.descriptor.worker_id
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    pub(crate) fn fail(&mut self, detail: impl Into<String>) {
        self.status = WorkerStatus::Failed;
        self.detail = Some(detail.into());
        self.restart_at = None;
        self.lock_wait_since = None;
    }
}
