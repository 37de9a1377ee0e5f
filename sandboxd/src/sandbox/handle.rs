use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Child;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to reap worker {pid:?}: {source}")]
    Reap {
        pid: Option<u32>,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove scratch directory: {0}")]
    Workdir(#[source] std::io::Error),
}

/// Resources bound to one execution: the worker process (leader of its own
/// process group) and its scratch directory.
///
/// Owned by the request until the response exists, then by the reaper.
#[derive(Debug)]
pub struct SandboxHandle {
    id: Uuid,
    pid: Option<u32>,
    child: Child,
    workdir: Option<TempDir>,
}

impl SandboxHandle {
    pub(crate) fn new(id: Uuid, child: Child, workdir: TempDir) -> Self {
        Self {
            id,
            pid: child.id(),
            child,
            workdir: Some(workdir),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Kill the worker's process group, then the worker itself.
    pub(crate) fn terminate(&mut self) {
        if self.is_running() {
            if let Some(pid) = self.pid {
                kill_process_group(pid);
            }
        }
        // Err means the child was already reaped.
        let _ = self.child.start_kill();
    }

    /// True until the child has been reaped. The group is only signalled while
    /// this holds, so a recycled pid is never targeted.
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill anything left in the process group, reap the worker, and remove
    /// the scratch directory.
    pub async fn release(mut self) -> Result<(), CleanupError> {
        self.terminate();
        let status = self.child.wait().await.map_err(|source| CleanupError::Reap {
            pid: self.pid,
            source,
        })?;
        debug!(execution_id = %self.id, %status, "worker reaped");

        if let Some(workdir) = self.workdir.take() {
            workdir.close().map_err(CleanupError::Workdir)?;
        }
        Ok(())
    }
}

/// SIGKILL every process in the group led by `pid`. A group that is already
/// gone is not an error.
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the process group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pid, error = %err, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: u32) {}
