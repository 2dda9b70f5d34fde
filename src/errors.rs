//! Error types for the provisioning orchestrator.
//!
//! Every external-command failure surfaces as either `Timeout` or
//! `NonZeroExit`; the pipeline driver hands these to the fault classifier
//! to decide whether the run continues.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// External command exceeded its execution bound.
    #[error("command timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    /// External command exited with a failure status.
    #[error("command failed with exit code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// The virtualization daemon failed its liveness probe.
    #[error("virtualization daemon unresponsive: {0}")]
    DaemonUnresponsive(String),

    /// Malformed or missing record in the persisted configuration store.
    #[error("configuration store error: {0}")]
    Store(String),

    /// Invalid operator input at the interactive boundary.
    #[error("invalid operator input: {0}")]
    Input(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

impl ProvisionError {
    /// True for errors that should route through daemon recovery before
    /// the classifier sees them.
    pub fn is_daemon_unresponsive(&self) -> bool {
        matches!(self, ProvisionError::DaemonUnresponsive(_))
    }
}
