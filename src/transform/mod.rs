//! Transformations executed by workers.
//!
//! The queue only moves bytes. A [`Transform`] turns an input payload and an
//! operation descriptor into a result payload or a diagnostic. Workers own
//! one instance each, build it at startup and tear it down on exit.

mod command;
mod sandbox;

pub use command::{CommandTransform, DEFAULT_COMMAND_TIMEOUT, OPERATION_ENV};
pub use sandbox::{Pipeline, Sandbox};

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a transformation produced no result.
///
/// The display text is what the producer receives as the execution error.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("operation descriptor is not valid UTF-8")]
    OperationNotUtf8,

    #[error("unsupported operation step '{0}'")]
    Unsupported(String),

    #[error("invalid operation step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("{0}")]
    Data(String),

    #[error("{0}")]
    Command(String),

    #[error("transformation timed out after {0} ms")]
    TimedOut(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes operations on request payloads.
pub trait Transform: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run `operation` against `input`.
    fn apply(&mut self, input: &[u8], operation: &[u8]) -> Result<Vec<u8>, TransformError>;

    /// Release resources. Called once when the worker exits.
    fn teardown(&mut self) {}
}

/// Which transform workers should build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransformKind {
    /// Built-in interpreter with a fixed allow-list of steps.
    #[default]
    Sandbox,
    /// External program fed the input on stdin.
    Command {
        program: PathBuf,
        args: Vec<String>,
        timeout: Duration,
    },
}

impl TransformKind {
    pub fn command(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self::Command {
            program: program.into(),
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Command { .. } => "command",
        }
    }

    /// Longest a single request may run, if the transform enforces a limit.
    pub fn time_limit(&self) -> Option<Duration> {
        match self {
            Self::Sandbox => None,
            Self::Command { timeout, .. } => Some(*timeout),
        }
    }

    pub fn build(&self) -> Box<dyn Transform> {
        match self {
            Self::Sandbox => Box::new(Sandbox::new()),
            Self::Command {
                program,
                args,
                timeout,
            } => Box::new(CommandTransform::new(program.clone(), args.clone(), *timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_kind_is_sandbox() {
        let kind = TransformKind::default();
        assert_eq!(kind.name(), "sandbox");
        assert_eq!(kind.time_limit(), None);
        let mut t = kind.build();
        assert_eq!(t.name(), "sandbox");
        assert_eq!(t.apply(b"[1,2]", b"sum").unwrap(), b"3");
    }

    #[test]
    fn test_command_kind_builds_command() {
        let kind = TransformKind::command("cat", vec![]);
        assert_eq!(kind.name(), "command");
        assert_eq!(kind.time_limit(), Some(DEFAULT_COMMAND_TIMEOUT));
        let mut t = kind.build();
        assert_eq!(t.apply(b"[1]", b"ignored").unwrap(), b"[1]");
        t.teardown();
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            TransformError::Unsupported("explode".into()).to_string(),
            "unsupported operation step 'explode'"
        );
        assert_eq!(
            TransformError::TimedOut(50).to_string(),
            "transformation timed out after 50 ms"
        );
    }
}
