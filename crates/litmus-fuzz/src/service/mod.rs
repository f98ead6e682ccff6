//! Models of the external services the harness drives: compilers and
//! memory-model backends, plus the subprocess plumbing they share.

pub mod backend;
pub mod compiler;
pub mod process;

use serde::{Deserialize, Serialize};

/// How to invoke an external service binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl RunInfo {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replaces this run info if `new` is present.
    pub fn override_if_present(&mut self, new: Option<&RunInfo>) {
        if let Some(new) = new {
            *self = new.clone();
        }
    }
}

/// Errors shared by every external driver (compiler, backend, fuzzer).
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("job timed out")]
    Timeout,
    #[error("job cancelled")]
    Cancelled,
    #[error("driver failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
