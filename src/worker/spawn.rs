//! Worker subprocess spawning.
//!
//! Workers are this same executable started with the hidden `worker`
//! subcommand. Everything a worker needs is passed on its command line; the
//! queue geometry comes from the region header.

use super::proc::Proc;
use crate::config::PoolConfig;
use crate::error::{Result, ShmtaskError};
use crate::transform::TransformKind;
use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

/// Arguments that start worker `worker_id` on the region at `region`.
pub fn worker_args(region: &Path, worker_id: u32, config: &PoolConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "worker".into(),
        "--region".into(),
        region.as_os_str().to_owned(),
        "--worker-id".into(),
        worker_id.to_string().into(),
        "--poll-interval-ms".into(),
        config.poll_interval.as_millis().to_string().into(),
        "--transform".into(),
        config.transform.name().into(),
    ];

    if let TransformKind::Command {
        program,
        args: program_args,
        timeout,
    } = &config.transform
    {
        args.push("--command".into());
        args.push(program.as_os_str().to_owned());
        for arg in program_args {
            args.push("--command-arg".into());
            args.push(arg.into());
        }
        args.push("--command-timeout-ms".into());
        args.push(timeout.as_millis().to_string().into());
    }
    args
}

/// Start one worker subprocess.
///
/// stdin and stdout are closed; stderr is inherited so worker logs land next
/// to the host's.
pub fn spawn_worker(region: &Path, worker_id: u32, config: &PoolConfig) -> Result<Proc> {
    let exe_path = std::env::current_exe()
        .map_err(|e| ShmtaskError::Worker(format!("Failed to get current executable: {}", e)))?;

    let child = Command::new(&exe_path)
        .args(worker_args(region, worker_id, config))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| ShmtaskError::Worker(format!("Failed to spawn worker {}: {}", worker_id, e)))?;

    tracing::debug!(worker_id, pid = child.id(), "Spawned worker process");
    Ok(Proc::from_child(child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sandbox_worker_args() {
        let config = PoolConfig::default().with_poll_interval(Duration::from_millis(25));
        let args = worker_args(Path::new("/dev/shm/q"), 3, &config);
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            [
                "worker",
                "--region",
                "/dev/shm/q",
                "--worker-id",
                "3",
                "--poll-interval-ms",
                "25",
                "--transform",
                "sandbox"
            ]
        );
    }

    #[test]
    fn test_command_worker_args() {
        let config = PoolConfig::default().with_transform(TransformKind::Command {
            program: "/usr/bin/python3".into(),
            args: vec!["-c".into(), "print(1)".into()],
            timeout: Duration::from_secs(2),
        });
        let args: Vec<String> = worker_args(Path::new("r"), 0, &config)
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        let tail = &args[args.len() - 8..];
        assert_eq!(
            tail,
            [
                "--command",
                "/usr/bin/python3",
                "--command-arg",
                "-c",
                "--command-arg",
                "print(1)",
                "--command-timeout-ms",
                "2000"
            ]
        );
    }
}
