//! Command line and environment configuration.

use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::encoder::{EncoderLimits, MAX_SUPPORTED_DEPTH};

/// Runs hex-encoded JavaScript in disposable sandbox processes
#[derive(Debug, Clone, Parser)]
#[command(name = "sandboxd", version)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

impl Cli {
    /// The command to run; no subcommand means `serve`.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve the HTTP API (default)
    Serve(ServeArgs),

    /// Run one program read from stdin (internal; spawned by the service)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 82)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Wall-clock deadline for one execution, in milliseconds
    #[arg(long, env = "EXEC_TIMEOUT_MS", default_value_t = 60_000)]
    pub timeout_ms: u64,

    /// Delay between responding and releasing sandbox resources (defaults to the timeout)
    #[arg(long, env = "REAPER_GRACE_MS")]
    pub grace_ms: Option<u64>,

    /// V8 heap limit per worker, in MiB
    #[arg(long, env = "WORKER_HEAP_LIMIT_MB", default_value_t = 128)]
    pub heap_limit_mb: usize,

    /// Address space rlimit per worker, in MiB (unset: no limit)
    #[arg(long, env = "WORKER_ADDRESS_SPACE_MB")]
    pub address_space_mb: Option<u64>,

    /// Maximum number of live worker processes
    #[arg(long, env = "MAX_CONCURRENT_EXECUTIONS", default_value_t = 32)]
    pub max_concurrent: usize,

    /// Maximum log entries kept per execution
    #[arg(long, env = "MAX_LOG_ENTRIES", default_value_t = 10_000)]
    pub max_log_entries: usize,

    /// Maximum total bytes of log entries kept per execution
    #[arg(long, env = "MAX_LOG_BYTES", default_value_t = 1024 * 1024)]
    pub max_log_bytes: usize,

    /// Maximum nesting depth of an encoded result (at most 1024)
    #[arg(long, env = "MAX_RESULT_DEPTH", default_value_t = 256)]
    pub max_result_depth: usize,

    /// Maximum number of values in an encoded result
    #[arg(long, env = "MAX_RESULT_NODES", default_value_t = 100_000)]
    pub max_result_nodes: usize,

    /// Executable to spawn as the worker (defaults to this binary)
    #[arg(long, env = "WORKER_PATH")]
    pub worker_path: Option<PathBuf>,

    /// Output logs in JSON format
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    #[arg(long, default_value_t = 128)]
    pub heap_limit_mb: usize,

    #[arg(long, default_value_t = 100_000)]
    pub max_result_nodes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("{name} must be at most {max}")]
    TooLarge { name: &'static str, max: usize },

    #[error("cannot locate the current executable: {0}")]
    CurrentExe(#[source] std::io::Error),
}

/// What the supervisor needs to spawn and police one worker.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    pub worker_path: PathBuf,
    pub heap_limit_mb: usize,
    pub address_space_mb: Option<u64>,
    pub max_concurrent: usize,
    pub max_log_entries: usize,
    pub max_log_bytes: usize,
    pub max_result_nodes: usize,
}

impl SandboxConfig {
    /// Defaults for everything except the worker executable.
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            timeout: Duration::from_millis(60_000),
            worker_path: worker_path.into(),
            heap_limit_mb: 128,
            address_space_mb: None,
            max_concurrent: 32,
            max_log_entries: 10_000,
            max_log_bytes: 1024 * 1024,
            max_result_nodes: 100_000,
        }
    }

    /// Timeout as rendered in the timeout error message.
    pub fn timeout_ms(&self) -> u128 {
        self.timeout.as_millis()
    }
}

/// Validated service configuration, frozen at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub sandbox: SandboxConfig,
    pub encoder: EncoderLimits,
    pub grace_period: Duration,
    pub log_json: bool,
}

impl ServiceConfig {
    /// Configuration around an existing sandbox config, grace period equal to
    /// its timeout. Used by tests and embedders that skip the CLI.
    pub fn from_sandbox(sandbox: SandboxConfig) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            grace_period: sandbox.timeout,
            encoder: EncoderLimits::default(),
            sandbox,
            log_json: false,
        }
    }
}

impl ServeArgs {
    pub fn into_config(self) -> Result<ServiceConfig, ConfigError> {
        for (name, value) in [
            ("timeout-ms", self.timeout_ms as usize),
            ("heap-limit-mb", self.heap_limit_mb),
            ("max-concurrent", self.max_concurrent),
            ("max-log-entries", self.max_log_entries),
            ("max-log-bytes", self.max_log_bytes),
            ("max-result-depth", self.max_result_depth),
            ("max-result-nodes", self.max_result_nodes),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        if self.max_result_depth > MAX_SUPPORTED_DEPTH {
            return Err(ConfigError::TooLarge {
                name: "max-result-depth",
                max: MAX_SUPPORTED_DEPTH,
            });
        }
        if self.address_space_mb == Some(0) {
            return Err(ConfigError::Zero {
                name: "address-space-mb",
            });
        }

        let worker_path = match self.worker_path {
            Some(path) => path,
            None => std::env::current_exe().map_err(ConfigError::CurrentExe)?,
        };
        let timeout = Duration::from_millis(self.timeout_ms);

        Ok(ServiceConfig {
            listen_addr: SocketAddr::new(self.bind_addr, self.port),
            sandbox: SandboxConfig {
                timeout,
                worker_path,
                heap_limit_mb: self.heap_limit_mb,
                address_space_mb: self.address_space_mb,
                max_concurrent: self.max_concurrent,
                max_log_entries: self.max_log_entries,
                max_log_bytes: self.max_log_bytes,
                max_result_nodes: self.max_result_nodes,
            },
            encoder: EncoderLimits {
                max_depth: self.max_result_depth,
                max_nodes: self.max_result_nodes,
            },
            grace_period: self
                .grace_ms
                .map(Duration::from_millis)
                .unwrap_or(timeout),
            log_json: self.log_json,
        })
    }
}
