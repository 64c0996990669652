//! Presentation model notifications.
//!
//! Provides the statuses and change events the orchestrator publishes for the
//! layer that renders update screens.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{BackupStatus, Classification, JobKind, UpdateErrorType};

/// Current status of one classification's update pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Nothing pending
    UpToDate,

    /// Packages available, nothing started
    UpdatesAvailable,

    /// Atomic-upgrade backup running before the download
    BackingUp,

    /// Download job queued or running
    Downloading,

    /// Download job paused by the user
    DownloadPaused,

    /// Download finished, install not started
    Downloaded,

    /// Install job queued or running
    Installing,

    /// Install job finished
    InstallComplete,

    /// Pipeline stopped; a retry starts from a clean slot
    UpdateFailed(UpdateErrorType),

    /// Fix-error job running
    FixingError,

    /// Fix-error job finished; the upgrade may be retried
    FixErrorComplete,
}

impl UpdateStatus {
    /// Check if this status represents an error
    pub fn is_error(&self) -> bool {
        matches!(self, UpdateStatus::UpdateFailed(_))
    }

    /// Check if a job is currently working for this classification
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            UpdateStatus::BackingUp
                | UpdateStatus::Downloading
                | UpdateStatus::DownloadPaused
                | UpdateStatus::Installing
                | UpdateStatus::FixingError
        )
    }
}

/// Status of the repository refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Checking,
    UpToDate,
    UpdatesAvailable,
    Failed(UpdateErrorType),
}

/// Change notification for the presentation model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModelEvent {
    /// `init` settled
    InitCompleted,

    CheckStatusChanged { status: CheckStatus },

    /// A classification gained or lost its pending packages
    AvailabilityChanged {
        classification: Classification,
        available: bool,
    },

    /// Updates found and the user asked to be told
    UpdatesNotification { classifications: Vec<Classification> },

    StatusChanged {
        classification: Classification,
        status: UpdateStatus,
    },

    /// Debounced, non-decreasing job progress in `[0, 1]`
    ProgressChanged {
        classification: Classification,
        kind: JobKind,
        progress: f64,
    },

    /// Version, change log or publish date changed
    ItemInfoChanged { classification: Classification },

    ErrorOccurred {
        classification: Option<Classification>,
        kind: JobKind,
        error: UpdateErrorType,
    },

    BackupStatusChanged {
        classification: Classification,
        status: BackupStatus,
    },

    LowBatteryChanged { low: bool },

    /// Version logs could not be fetched; the cached ones stay in place
    UpdateLogFailed {
        classification: Classification,
        reason: String,
    },

    ReleaseNoteInstallCompleted,

    LicenseRefreshRequested,
}

pub type ModelSender = mpsc::UnboundedSender<ModelEvent>;
pub type ModelReceiver = mpsc::UnboundedReceiver<ModelEvent>;
