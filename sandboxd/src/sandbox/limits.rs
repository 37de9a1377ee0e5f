use std::time::Duration;

use crate::config::SandboxConfig;

const OPEN_FILES: u64 = 64;

/// OS limits applied to a worker between fork and exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU seconds before the kernel sends SIGXCPU. A backstop: the supervisor
    /// deadline normally fires first. The hard limit sits one second above, so
    /// the catchable signal always arrives before SIGKILL.
    pub cpu_seconds: u64,
    pub address_space_bytes: Option<u64>,
    pub open_files: u64,
}

impl ResourceLimits {
    pub fn for_config(config: &SandboxConfig) -> Self {
        Self {
            cpu_seconds: cpu_seconds_for(config.timeout),
            address_space_bytes: config.address_space_mb.map(|mb| mb * 1024 * 1024),
            open_files: OPEN_FILES,
        }
    }

    /// Put the calling process in its own process group and lower its limits.
    ///
    /// Runs in the forked child before exec, so it must stay async-signal-safe:
    /// no allocation, no locks.
    #[cfg(unix)]
    pub fn apply(&self) -> std::io::Result<()> {
        // SAFETY: plain syscalls on the current process with valid arguments.
        unsafe {
            check(libc::setpgid(0, 0))?;
            check(libc::setrlimit(
                libc::RLIMIT_CPU,
                &soft_limit(self.cpu_seconds, self.cpu_seconds + 1),
            ))?;
            check(libc::setrlimit(libc::RLIMIT_FSIZE, &rlimit(0)))?;
            check(libc::setrlimit(libc::RLIMIT_CORE, &rlimit(0)))?;
            check(libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit(self.open_files)))?;
            if let Some(bytes) = self.address_space_bytes {
                check(libc::setrlimit(libc::RLIMIT_AS, &rlimit(bytes)))?;
            }
        }
        Ok(())
    }
}

fn cpu_seconds_for(timeout: Duration) -> u64 {
    let whole = timeout.as_secs();
    let ceil = if timeout.subsec_nanos() > 0 { whole + 1 } else { whole };
    ceil + 1
}

#[cfg(unix)]
fn rlimit(value: u64) -> libc::rlimit {
    soft_limit(value, value)
}

#[cfg(unix)]
fn soft_limit(soft: u64, hard: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    }
}

#[cfg(unix)]
fn check(rc: libc::c_int) -> std::io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
