//! Single-instance guard for the probe
//!
//! The marker file holds the pid of the running probe. A marker naming a
//! live process blocks startup; a stale one is overwritten.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

#[derive(Debug)]
pub enum LockError {
    AlreadyRunning { pid: u32 },
    Io(io::Error),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::AlreadyRunning { pid } => {
                write!(f, "another probe is already running (pid {})", pid)
            }
            LockError::Io(e) => write!(f, "lock file error: {}", e),
        }
    }
}

impl std::error::Error for LockError {}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        LockError::Io(err)
    }
}

/// Held for the lifetime of the probe; removes the marker on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();

        match std::fs::read_to_string(&path) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(pid) if process_alive(pid) => return Err(LockError::AlreadyRunning { pid }),
                Ok(pid) => debug!("overwriting stale lock of pid {pid}"),
                Err(_) => warn!("overwriting unreadable lock file {}", path.display()),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {e}", self.path.display());
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
