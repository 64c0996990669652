//! Error types for the update-job orchestrator.

use thiserror::Error;

use crate::types::{Classification, JobSlot};

/// Errors reported by the remote package-job service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service could not be reached.
    #[error("Remote job service unavailable: {0}")]
    Unavailable(String),

    /// The job path does not exist (anymore).
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The service refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Errors reported by the update-log service.
#[derive(Error, Debug)]
pub enum LogFetchError {
    /// Transport-level failure.
    #[error("Failed to fetch update logs: {0}")]
    Transport(String),

    /// The payload was not a valid update-log document.
    #[error("Failed to parse update logs: {0}")]
    Parse(#[from] serde_json::Error),

    /// The server answered with a non-zero application code.
    #[error("Update-log server returned code {code}: {message}")]
    Server { code: i64, message: String },
}

/// Why a command was refused before touching any state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreconditionError {
    /// `All` is an aggregate view and cannot be upgraded directly.
    #[error("Classification '{0}' is an aggregate and cannot be upgraded directly")]
    AggregateClassification(Classification),

    /// An atomic-upgrade backup is already running.
    #[error("Backup in progress (requested for {running:?})")]
    BackupInProgress { running: Option<Classification> },

    /// Download or install already owns the slot.
    #[error("Job already active: {0}")]
    JobAlreadyActive(JobSlot),

    /// No packages are pending for the classification.
    #[error("Nothing to upgrade for {0}")]
    NothingToUpgrade(Classification),

    /// Free space is below the classification's download size.
    #[error("Insufficient disk space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    /// The policy gate refused the transition.
    #[error("Denied by policy: {0}")]
    PolicyDenied(PolicyDenial),

    /// The error kind cannot be repaired by a fix-error job.
    #[error("Error '{0}' cannot be fixed automatically")]
    NotFixable(crate::types::UpdateErrorType),
}

/// Policy gate verdicts that block a transition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyDenial {
    #[error("battery at {percentage:.0}% while discharging (minimum {minimum:.0}%)")]
    LowBattery { percentage: f64, minimum: f64 },

    #[error("{0} updates are disabled by the update mode")]
    ClassificationDisabled(Classification),
}

/// Errors returned synchronously by orchestrator commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Result type alias for orchestrator commands.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
