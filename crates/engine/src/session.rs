//! Exclusive use of a platform session across processes.
//!
//! Two processes driving the same session corrupt it, so each worker holds
//! an advisory lock on `<sessions_dir>/<session>.session.lock` for its whole
//! lifetime. The supervisor probes the same file before spawning.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    fd_lock::{RwLock, RwLockWriteGuard},
    tokio::time::Instant,
    tracing::{debug, info},
};

use crate::{Result, error::Error};

const PROBE_INTERVAL: Duration = Duration::from_secs(2);

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
}

/// `true` if another handle currently holds the lock on `path`.
pub fn is_locked(path: &Path) -> io::Result<bool> {
    let mut probe = RwLock::new(open_lock_file(path)?);
    match probe.try_write() {
        Ok(_guard) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
        Err(e) => Err(e),
    }
}

pub struct SessionLock {
    lock: RwLock<File>,
    path: PathBuf,
}

impl SessionLock {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open_lock_file(&path)?;
        Ok(Self {
            lock: RwLock::new(file),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn session_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.trim_end_matches(".session.lock").to_string())
            .unwrap_or_default()
    }

    /// Wait up to `wait` for the session to become free, then take it. The
    /// lock is released when the returned guard drops.
    pub async fn acquire(&mut self, wait: Duration) -> Result<RwLockWriteGuard<'_, File>> {
        let started = Instant::now();
        while is_locked(&self.path)? {
            if started.elapsed() >= wait {
                return Err(Error::SessionLocked {
                    session: self.session_name(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            debug!(path = %self.path.display(), "session busy, waiting");
            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        let session = self.session_name();
        let waited_secs = started.elapsed().as_secs();
        match self.lock.try_write() {
            Ok(guard) => {
                info!(session = %session, "session lock acquired");
                Ok(guard)
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::SessionLocked {
                session,
                waited_secs,
            }),
            Err(e) => Err(e.into()),
        }
    }
}
