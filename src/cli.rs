//! Command-line interface definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use shmtask::config::{
    ByteSize, DEFAULT_GRACE_INTERVALS, DEFAULT_INPUT_CAPACITY, DEFAULT_LEASE,
    DEFAULT_MAX_RESTARTS, DEFAULT_OPERATION_CAPACITY, DEFAULT_POLL_INTERVAL,
    DEFAULT_RESULT_CAPACITY, DEFAULT_SLOT_COUNT, DEFAULT_WORKER_COUNT, PoolConfig, QueueConfig,
    WorkerMode,
};
use shmtask::error::{Result, ShmtaskError};
use shmtask::logging::LogFormat;
use shmtask::paths;
use shmtask::transform::{DEFAULT_COMMAND_TIMEOUT, TransformKind};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// Offload data transformations to worker processes through a shared-memory task queue.
#[derive(Parser, Debug)]
#[command(name = "shmtask")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Log format: pretty, compact or json.
    #[arg(long, global = true, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the shared region (or attach to an existing one).
    Init(InitArgs),

    /// Start the worker pool and lease reaper on a region until interrupted.
    Serve(ServeArgs),

    /// Submit one request to a served region and print the raw result.
    Submit(SubmitArgs),

    /// Run one transformation end to end on a private queue.
    #[command(alias = "run")]
    Transform(TransformArgs),

    /// Show slot states and counters of a region.
    Status(StatusArgs),

    /// Worker process entry point, started by `serve`.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Which shared region to use.
#[derive(Args, Debug)]
pub struct RegionArgs {
    /// Path of the region file.
    #[arg(long, env = "SHMTASK_REGION", default_value_os_t = paths::default_region_path())]
    pub region: PathBuf,
}

impl RegionArgs {
    pub fn path(&self) -> PathBuf {
        paths::expand_tilde(&self.region)
    }
}

/// Shape of a region. Only used when the region is created.
#[derive(Args, Debug)]
pub struct QueueArgs {
    /// Number of task slots.
    #[arg(long, env = "SHMTASK_SLOTS", default_value_t = DEFAULT_SLOT_COUNT)]
    pub slots: u32,

    /// Input buffer capacity per slot (e.g., 8K, 64KiB).
    #[arg(long, default_value_t = DEFAULT_INPUT_CAPACITY)]
    pub input_capacity: ByteSize,

    /// Operation buffer capacity per slot.
    #[arg(long, default_value_t = DEFAULT_OPERATION_CAPACITY)]
    pub operation_capacity: ByteSize,

    /// Result buffer capacity per slot.
    #[arg(long, default_value_t = DEFAULT_RESULT_CAPACITY)]
    pub result_capacity: ByteSize,

    /// Lease in milliseconds before a stuck slot is recovered.
    #[arg(long, env = "SHMTASK_LEASE_MS", default_value_t = DEFAULT_LEASE.as_millis() as u64)]
    pub lease_ms: u64,
}

impl QueueArgs {
    pub fn to_config(&self) -> Result<QueueConfig> {
        let config = QueueConfig::default()
            .with_slot_count(self.slots)
            .with_lease(Duration::from_millis(self.lease_ms))
            .with_capacities(
                self.input_capacity,
                self.operation_capacity,
                self.result_capacity,
            );
        config.validate()?;
        Ok(config)
    }
}

/// Kind of transform a worker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TransformArg {
    /// Built-in JSON pipeline interpreter.
    #[default]
    Sandbox,
    /// External program: input on stdin, operation in SHMTASK_OPERATION.
    Command,
}

/// Transform selection, shared by the host and the worker entry point.
#[derive(Args, Debug)]
pub struct TransformSelection {
    /// Transform workers apply to each request.
    #[arg(long, value_enum, default_value_t = TransformArg::Sandbox)]
    pub transform: TransformArg,

    /// Program run by the command transform.
    #[arg(long, value_name = "PROGRAM")]
    pub command: Option<PathBuf>,

    /// Argument for the command transform (repeatable).
    #[arg(long = "command-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub command_args: Vec<String>,

    /// Milliseconds one command invocation may run before it is killed.
    #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT.as_millis() as u64)]
    pub command_timeout_ms: u64,
}

impl TransformSelection {
    pub fn to_kind(&self) -> Result<TransformKind> {
        match self.transform {
            TransformArg::Sandbox => Ok(TransformKind::Sandbox),
            TransformArg::Command => {
                let program = self.command.clone().ok_or_else(|| {
                    ShmtaskError::Config("--transform command requires --command".to_string())
                })?;
                Ok(TransformKind::Command {
                    program,
                    args: self.command_args.clone(),
                    timeout: Duration::from_millis(self.command_timeout_ms),
                })
            }
        }
    }
}

/// Worker pool settings.
#[derive(Args, Debug)]
pub struct PoolArgs {
    /// Number of workers.
    #[arg(short, long, env = "SHMTASK_WORKERS", default_value_t = DEFAULT_WORKER_COUNT)]
    pub workers: usize,

    /// How workers are hosted: process or thread.
    #[arg(long, default_value = "process")]
    pub mode: WorkerMode,

    /// Polling interval of idle workers and waiting producers, in milliseconds.
    #[arg(long, env = "SHMTASK_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub poll_interval_ms: u64,

    /// Polling intervals workers get to exit before they are stopped hard.
    #[arg(long, default_value_t = DEFAULT_GRACE_INTERVALS)]
    pub grace_intervals: u32,

    /// Respawns allowed per worker.
    #[arg(long, default_value_t = DEFAULT_MAX_RESTARTS)]
    pub max_restarts: usize,

    #[command(flatten)]
    pub transform: TransformSelection,
}

impl PoolArgs {
    pub fn to_config(&self) -> Result<PoolConfig> {
        let mut config = PoolConfig::default()
            .with_workers(self.workers)
            .with_mode(self.mode)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_transform(self.transform.to_kind()?);
        config.grace_intervals = self.grace_intervals;
        config.max_restarts = self.max_restarts;
        config.validate()?;
        Ok(config)
    }
}

/// Request payload source.
#[derive(Args, Debug)]
pub struct InputArgs {
    /// Input data. Read from stdin when neither this nor --input-file is given.
    #[arg(short, long, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Read input data from a file.
    #[arg(long, value_name = "FILE")]
    pub input_file: Option<PathBuf>,

    /// Operation descriptor, e.g. "increment by 10 | sum".
    #[arg(short, long)]
    pub operation: String,
}

impl InputArgs {
    pub fn read_input(&self) -> Result<Vec<u8>> {
        if let Some(input) = &self.input {
            return Ok(input.clone().into_bytes());
        }
        if let Some(path) = &self.input_file {
            return Ok(std::fs::read(path)?);
        }
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Arguments for the init command.
#[derive(Args, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub region: RegionArgs,

    #[command(flatten)]
    pub queue: QueueArgs,
}

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub region: RegionArgs,

    #[command(flatten)]
    pub queue: QueueArgs,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Arguments for the submit command.
#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub region: RegionArgs,

    #[command(flatten)]
    pub input: InputArgs,

    /// Give up waiting after this many milliseconds (default: twice the lease).
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Polling interval while waiting, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub poll_interval_ms: u64,
}

/// Arguments for the transform command.
#[derive(Args, Debug)]
pub struct TransformArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub queue: QueueArgs,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub region: RegionArgs,

    /// Print machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the hidden worker command.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Region to attach to.
    #[arg(long)]
    pub region: PathBuf,

    #[arg(long)]
    pub worker_id: u32,

    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub poll_interval_ms: u64,

    #[command(flatten)]
    pub transform: TransformSelection,
}
