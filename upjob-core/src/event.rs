//! Orchestrator inbox.
//!
//! Every asynchronous input (remote notifications, finished log fetches,
//! watchdog ticks) is an [`OrchestratorEvent`] delivered through one ordered
//! channel, so handlers never re-enter each other.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::logcache::UpdateLogEntry;
use crate::types::Classification;

/// Asynchronous input to the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Authoritative list of job paths known to the remote service.
    JobListChanged(Vec<String>),
    /// Raw status string reported for a job.
    StatusChanged {
        path: String,
        status: String,
        description: String,
    },
    /// Raw progress value reported for a job.
    ProgressChanged { path: String, value: f64 },
    /// The remote service recomputed its classified package map.
    PackagesChanged(HashMap<String, Vec<String>>),
    /// A dispatched update-log fetch finished.
    LogsReceived {
        classification: Classification,
        result: Result<Vec<UpdateLogEntry>, String>,
    },
    /// Run the job watchdog.
    WatchdogTick,
    /// Stop the run loop.
    Shutdown,
}

impl OrchestratorEvent {
    pub fn status(path: impl Into<String>, status: impl Into<String>) -> Self {
        OrchestratorEvent::StatusChanged {
            path: path.into(),
            status: status.into(),
            description: String::new(),
        }
    }

    pub fn failed(path: impl Into<String>, description: impl Into<String>) -> Self {
        OrchestratorEvent::StatusChanged {
            path: path.into(),
            status: "failed".to_string(),
            description: description.into(),
        }
    }

    pub fn progress(path: impl Into<String>, value: f64) -> Self {
        OrchestratorEvent::ProgressChanged { path: path.into(), value }
    }
}

pub type EventSender = mpsc::UnboundedSender<OrchestratorEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<OrchestratorEvent>;

/// Create an inbox channel.
pub fn inbox() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
