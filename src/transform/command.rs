//! Transform backed by an external program.
//!
//! The program receives the input payload on stdin and the operation in the
//! `SHMTASK_OPERATION` environment variable. Whatever it prints on stdout
//! (minus trailing whitespace) is the result. A non-zero exit turns stderr
//! into the execution error.

use super::{Transform, TransformError};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Environment variable carrying the operation descriptor.
pub const OPERATION_ENV: &str = "SHMTASK_OPERATION";

/// How long one invocation may run before it is killed. Kept below the
/// default lease so a slow command is killed before its claim expires.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

const EXIT_POLL: Duration = Duration::from_millis(2);

#[derive(Debug)]
pub struct CommandTransform {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    invocations: u64,
}

impl CommandTransform {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
            invocations: 0,
        }
    }

    fn spawn(&self, operation: &str) -> Result<Child, TransformError> {
        Command::new(&self.program)
            .args(&self.args)
            .env(OPERATION_ENV, operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TransformError::Command(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })
    }
}

/// Drain a pipe on its own thread so the child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl Transform for CommandTransform {
    fn name(&self) -> &str {
        "command"
    }

    fn apply(&mut self, input: &[u8], operation: &[u8]) -> Result<Vec<u8>, TransformError> {
        let operation =
            std::str::from_utf8(operation).map_err(|_| TransformError::OperationNotUtf8)?;
        let mut child = self.spawn(operation)?;
        self.invocations += 1;

        let stdin = child.stdin.take();
        let input = input.to_vec();
        let feeder = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // The program may exit without reading everything.
                let _ = stdin.write_all(&input);
            }
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                tracing::warn!(
                    program = %self.program.display(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Transform command timed out, killing it"
                );
                let _ = child.kill();
                let _ = child.wait();
                let _ = feeder.join();
                return Err(TransformError::TimedOut(self.timeout.as_millis() as u64));
            }
            thread::sleep(EXIT_POLL);
        };

        let _ = feeder.join();
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.program.display(), status)
            } else {
                format!("{} exited with {}: {}", self.program.display(), status, stderr)
            };
            return Err(TransformError::Command(message));
        }

        Ok(stdout.trim_ascii_end().to_vec())
    }

    fn teardown(&mut self) {
        tracing::debug!(
            program = %self.program.display(),
            invocations = self.invocations,
            "Command transform torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandTransform {
        CommandTransform::new(
            PathBuf::from("sh"),
            vec!["-c".to_string(), script.to_string()],
            DEFAULT_COMMAND_TIMEOUT,
        )
    }

    #[test]
    fn test_stdin_to_stdout() {
        let mut t = sh("tr a-z A-Z");
        assert_eq!(t.apply(b"hello\n", b"upper").unwrap(), b"HELLO");
    }

    #[test]
    fn test_operation_in_environment() {
        let mut t = sh("printf '%s' \"$SHMTASK_OPERATION\"");
        assert_eq!(t.apply(b"", b"increment by 10").unwrap(), b"increment by 10");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let mut t = sh("echo 'bad operation' >&2; exit 3");
        let err = t.apply(b"[]", b"x").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad operation"), "{msg}");
        assert!(msg.contains("exit"), "{msg}");
    }

    #[test]
    fn test_missing_program() {
        let mut t = CommandTransform::new(
            PathBuf::from("/nonexistent/shmtask-transform"),
            vec![],
            DEFAULT_COMMAND_TIMEOUT,
        );
        let err = t.apply(b"", b"").unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[test]
    fn test_timeout_kills_program() {
        let mut t = CommandTransform::new(
            PathBuf::from("sleep"),
            vec!["5".to_string()],
            Duration::from_millis(50),
        );
        let started = Instant::now();
        let err = t.apply(b"", b"").unwrap_err();
        assert!(matches!(err, TransformError::TimedOut(50)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_large_output_does_not_deadlock() {
        let mut t = sh("head -c 200000 /dev/zero | tr '\\0' a");
        let out = t.apply(b"", b"").unwrap();
        assert_eq!(out.len(), 200_000);
    }
}
