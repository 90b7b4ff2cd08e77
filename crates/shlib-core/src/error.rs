//! Error taxonomy for shlib.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Stable classification of a [`ShlibError`], used when reporting a
/// scenario failure by its originating error kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IoFailure,
    ScanError,
    CompileError,
    UnresolvedSymbol,
    Timeout,
    RunFailed,
    InvalidTransition,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::ScanError => "scan_error",
            ErrorKind::CompileError => "compile_error",
            ErrorKind::UnresolvedSymbol => "unresolved_symbol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RunFailed => "run_failed",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the workspace store, registry, engine and harness.
#[derive(Debug, thiserror::Error)]
pub enum ShlibError {
    #[error("workspace io failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot scan workspace {}: {reason}", path.display())]
    Scan { path: PathBuf, reason: String },

    #[error("failed to compile `{symbol}`: {cause}")]
    Compile { symbol: String, cause: String },

    #[error("unresolved symbol `{name}`")]
    UnresolvedSymbol { name: String },

    #[error("run {run_id} did not finish within {limit_ms}ms")]
    Timeout { run_id: String, limit_ms: u64 },

    #[error("run failed ({} log line(s))", log.len())]
    RunFailed { log: Vec<String> },

    #[error("cannot {operation} while scenario is {state}")]
    InvalidTransition {
        state: &'static str,
        operation: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ShlibError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ShlibError::Io {
            path: path.into(),
            source,
        }
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShlibError::Io { .. } => ErrorKind::IoFailure,
            ShlibError::Scan { .. } => ErrorKind::ScanError,
            ShlibError::Compile { .. } => ErrorKind::CompileError,
            ShlibError::UnresolvedSymbol { .. } => ErrorKind::UnresolvedSymbol,
            ShlibError::Timeout { .. } => ErrorKind::Timeout,
            ShlibError::RunFailed { .. } => ErrorKind::RunFailed,
            ShlibError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            ShlibError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Result type for shlib operations.
pub type Result<T> = std::result::Result<T, ShlibError>;
