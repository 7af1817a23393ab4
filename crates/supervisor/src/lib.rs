//! Multi-process worker supervisor: one OS process per configured worker,
//! restarted with cool-downs and reconciled against config changes.

pub mod error;
pub mod process;
pub mod slot;
pub mod status;
pub mod supervisor;

pub use {
    error::{Error, Result},
    process::{CommandLauncher, WorkerExit, WorkerLauncher, WorkerProcess},
    slot::{WorkerSlot, WorkerStatus},
    status::{SupervisorStatus, WorkerStatusEntry, read_status, write_status},
    supervisor::Supervisor,
};
