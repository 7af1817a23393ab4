//! Launching and stopping worker processes.

use std::{
    fs::OpenOptions,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use {
    async_trait::async_trait,
    tgrelay_common::EXIT_SESSION_LOCKED,
    tgrelay_config::{StoragePaths, WorkerDescriptor},
    tokio::process::{Child, Command},
    tracing::{debug, info, warn},
};

use crate::{Result, error::Error};

/// How a worker process ended. `code` is `None` when it was killed by a
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

impl WorkerExit {
    #[must_use]
    pub fn exited(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// The worker gave up waiting for its session lock.
    #[must_use]
    pub fn is_session_locked(&self) -> bool {
        self.code == Some(EXIT_SESSION_LOCKED)
    }
}

/// A running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> Result<Option<WorkerExit>>;

    /// Ask the worker to terminate, force-killing it after `timeout`.
    async fn stop(&mut self, timeout: Duration) -> Result<WorkerExit>;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, descriptor: &WorkerDescriptor) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches `<program> [global args] worker --worker-id <id>` with output
/// appended to the worker's log file.
pub struct CommandLauncher {
    program: PathBuf,
    global_args: Vec<String>,
    paths: StoragePaths,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, global_args: Vec<String>, paths: StoragePaths) -> Self {
        Self {
            program: program.into(),
            global_args,
            paths,
        }
    }

    /// Re-invoke the running executable.
    pub fn current_exe(global_args: Vec<String>, paths: StoragePaths) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, global_args, paths))
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, descriptor: &WorkerDescriptor) -> Result<Box<dyn WorkerProcess>> {
        let worker_id = descriptor.worker_id.as_str();
        let log_path = self.paths.worker_log_file(worker_id);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let log_err = log.try_clone()?;

        let child = Command::new(&self.program)
            .args(&self.global_args)
            .args(["worker", "--worker-id", worker_id])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::launch(worker_id, e))?;

        info!(
            worker_id,
            pid = child.id(),
            log = %log_path.display(),
            "worker process started"
        );
        Ok(Box::new(ChildProcess {
            worker_id: worker_id.to_string(),
            child,
        }))
    }
}

struct ChildProcess {
    worker_id: String,
    child: Child,
}

impl ChildProcess {
    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::{
            sys::signal::{self, Signal},
            unistd::Pid,
        };

        let Some(pid) = self.child.id().and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(worker_id = %self.worker_id, pid, error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(worker_id = %self.worker_id, error = %e, "kill failed");
        }
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Result<Option<WorkerExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| WorkerExit { code: status.code() }))
    }

    async fn stop(&mut self, timeout: Duration) -> Result<WorkerExit> {
        if let Some(exit) = self.try_exit()? {
            return Ok(exit);
        }
        self.terminate();
        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    timeout_secs = timeout.as_secs(),
                    "worker did not stop in time, killing"
                );
                self.child.kill().await?;
                self.child.wait().await?
            },
        };
        Ok(WorkerExit {
            code: status.code(),
        })
    }
}
