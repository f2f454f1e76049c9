use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the supervisor engine.
///
/// Most variants are recoverable and stay inside [`crate::controller::RestartController`];
/// only [`SupervisorError::Fatal`] is meant to reach `main` and set the process exit code.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn `{binary}`: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("spawn retries exhausted after {attempts} attempt(s) for `{binary}`")]
    SpawnRetriesExhausted { binary: PathBuf, attempts: u32 },

    #[error("proxy-synthesized request `{id}` timed out after {timeout:?}")]
    ProtocolTimeout { id: String, timeout: Duration },

    #[error("failed to terminate child pid {pid}: {reason}")]
    ProcessKillFailed { pid: u32, reason: String },

    #[error("hook `{hook}` failed: {reason}")]
    HookError { hook: &'static str, reason: String },

    #[error("malformed line from {source_label}: {reason}")]
    ParseError {
        source_label: &'static str,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
