use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use capsules_js_exec::{Frame, MAX_FRAME_BYTES};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, Command};
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Execution, ExecutionOutcome, FrameReader, LogBuffer, ResourceLimits, SandboxError,
    SandboxHandle,
};
use crate::config::SandboxConfig;
use crate::decoder::ProgramSource;

/// How long a worker gets to exit on its own once its stream has ended.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Worker stderr forwarded to the service log, per execution.
const STDERR_FORWARD_BYTES: u64 = 64 * 1024;

/// Spawns and polices worker processes.
#[derive(Debug)]
pub struct Sandbox {
    config: Arc<SandboxConfig>,
    limits: ResourceLimits,
    permits: Arc<Semaphore>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            limits: ResourceLimits::for_config(&config),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one program to completion or until the deadline.
    ///
    /// Program failures, timeouts and worker crashes are all outcomes. Only
    /// failing to start a worker at all is an error.
    pub async fn execute(&self, source: ProgramSource) -> Result<Execution, SandboxError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Closed)?;

        let id = Uuid::new_v4();
        let workdir = tempfile::Builder::new()
            .prefix("sandboxd-")
            .tempdir()
            .map_err(SandboxError::Workdir)?;

        let mut child = self.command(workdir.path()).spawn().map_err(|source| {
            SandboxError::Spawn {
                path: self.config.worker_path.clone(),
                source,
            }
        })?;
        let stdin = child.stdin.take().ok_or(SandboxError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SandboxError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SandboxError::MissingPipe("stderr"))?;

        let started = Instant::now();
        let mut handle = SandboxHandle::new(id, child, workdir);
        debug!(execution_id = %id, pid = ?handle.pid(), "worker spawned");

        tokio::spawn(feed_source(id, stdin, source.into_string()));
        tokio::spawn(forward_stderr(id, stderr));

        let deadline = sleep_until(started + self.config.timeout);
        tokio::pin!(deadline);
        let mut frames = FrameReader::new(BufReader::new(stdout), MAX_FRAME_BYTES);
        let mut logs = LogBuffer::new(self.config.max_log_entries, self.config.max_log_bytes);

        // Not biased: a worker that logs in a tight loop must not starve the deadline.
        let outcome = loop {
            tokio::select! {
                frame = frames.next_frame() => match frame {
                    Ok(Some(Frame::Log { line })) => logs.push(line),
                    Ok(Some(Frame::Done { report })) => {
                        settle(&mut handle).await;
                        break ExecutionOutcome::from(report);
                    }
                    Ok(None) => break crashed(&mut handle).await,
                    Err(err) => {
                        warn!(execution_id = %id, error = %err, "worker broke protocol");
                        handle.terminate();
                        break ExecutionOutcome::Failed(format!("Sandbox protocol violation: {err}"));
                    }
                },
                _ = &mut deadline => {
                    debug!(execution_id = %id, "deadline reached; killing worker");
                    handle.terminate();
                    break ExecutionOutcome::Failed(format!(
                        "Script execution timed out after {}ms",
                        self.config.timeout_ms()
                    ));
                }
            }
        };

        if logs.dropped() > 0 {
            debug!(execution_id = %id, dropped = logs.dropped(), "log buffer truncated");
        }

        Ok(Execution {
            id,
            outcome,
            logs: logs.into_entries(),
            handle,
            elapsed: started.elapsed(),
        })
    }

    fn command(&self, workdir: &std::path::Path) -> Command {
        let mut command = Command::new(&self.config.worker_path);
        command
            .arg("worker")
            .arg("--heap-limit-mb")
            .arg(self.config.heap_limit_mb.to_string())
            .arg("--max-result-nodes")
            .arg(self.config.max_result_nodes.to_string())
            .env_clear()
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let limits = self.limits;
            // SAFETY: `apply` only issues async-signal-safe syscalls.
            unsafe {
                command.pre_exec(move || limits.apply());
            }
        }
        command
    }
}

/// The worker sent its report; give it a moment to exit cleanly.
async fn settle(handle: &mut SandboxHandle) {
    if timeout(SETTLE_TIMEOUT, handle.child_mut().wait())
        .await
        .is_err()
    {
        debug!(execution_id = %handle.id(), "worker lingered after reporting");
        handle.terminate();
    }
}

/// The worker's output ended without a report.
async fn crashed(handle: &mut SandboxHandle) -> ExecutionOutcome {
    match timeout(SETTLE_TIMEOUT, handle.child_mut().wait()).await {
        Ok(Ok(status)) => {
            warn!(execution_id = %handle.id(), %status, "worker exited without a report");
            ExecutionOutcome::Failed(crash_message(status))
        }
        Ok(Err(err)) => {
            handle.terminate();
            ExecutionOutcome::Failed(format!("Sandbox terminated unexpectedly ({err})"))
        }
        Err(_) => {
            handle.terminate();
            ExecutionOutcome::Failed(
                "Sandbox terminated unexpectedly (output closed)".to_string(),
            )
        }
    }
}

fn crash_message(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGXCPU) {
            return "CPU time limit exceeded".to_string();
        }
    }
    format!("Sandbox terminated unexpectedly ({status})")
}

async fn feed_source(id: Uuid, mut stdin: ChildStdin, source: String) {
    // A worker that dies early closes the pipe; its outcome is reported elsewhere.
    if let Err(err) = stdin.write_all(source.as_bytes()).await {
        debug!(execution_id = %id, error = %err, "failed to write program to worker");
        return;
    }
    let _ = stdin.shutdown().await;
}

async fn forward_stderr(id: Uuid, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr.take(STDERR_FORWARD_BYTES)).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(execution_id = %id, "worker: {}", line);
    }
    // Keep draining so a noisy worker never blocks on a full pipe.
    let mut rest = lines.into_inner().into_inner().into_inner();
    let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
}
