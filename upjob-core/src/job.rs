//! Local proxy for one remote job.
//!
//! A handle mirrors what has been observed about the job at `path`. Once it is
//! invalidated (the job ended, vanished or was replaced) every mutator becomes
//! a no-op, so a stale handle can never feed state back into the registry.

use std::time::{Duration, Instant};

use crate::remote::JobInfo;
use crate::types::{JobKind, JobSlot, JobStatus};

/// A status transition accepted by a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: JobStatus,
    pub current: JobStatus,
}

/// Observed state of one remote job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    path: String,
    slot: JobSlot,
    status: JobStatus,
    progress: f64,
    relayed_progress: f64,
    description: String,
    valid: bool,
    last_activity: Instant,
}

impl JobHandle {
    /// Handle for a job this process just created.
    pub fn new(path: impl Into<String>, slot: JobSlot, now: Instant) -> Self {
        Self {
            path: path.into(),
            slot,
            status: JobStatus::Pending,
            progress: 0.0,
            relayed_progress: 0.0,
            description: String::new(),
            valid: true,
            last_activity: now,
        }
    }

    /// Handle for a job found already running on the remote service.
    pub fn adopted(info: &JobInfo, slot: JobSlot, now: Instant) -> Self {
        let mut handle = Self::new(info.path.clone(), slot, now);
        handle.status = JobStatus::from_remote(&info.status).unwrap_or(JobStatus::Pending);
        handle.progress = clamp_progress(info.progress).unwrap_or(0.0);
        handle.description = info.description.clone();
        handle
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn slot(&self) -> JobSlot {
        self.slot
    }

    pub fn kind(&self) -> JobKind {
        self.slot.kind()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Valid and not yet in a terminal status.
    pub fn is_active(&self) -> bool {
        self.valid && self.status.is_active()
    }

    /// Apply a reported status.
    ///
    /// Terminal statuses are sticky: after Succeeded or Failed only Removed is
    /// accepted, and nothing is accepted after Removed or invalidation.
    pub fn apply_status(&mut self, status: JobStatus, now: Instant) -> Option<StatusChange> {
        if !self.valid || self.status == JobStatus::Removed {
            return None;
        }
        if self.status.is_terminal() && status != JobStatus::Removed {
            return None;
        }
        self.last_activity = now;
        if self.status == status {
            return None;
        }

        let previous = self.status;
        self.status = status;
        if status == JobStatus::Succeeded {
            self.progress = 1.0;
        }
        Some(StatusChange { previous, current: status })
    }

    /// Apply a reported progress value.
    ///
    /// Values are clamped to `[0, 1]` and never move backwards. Returns the new
    /// progress when it increased.
    pub fn apply_progress(&mut self, value: f64, now: Instant) -> Option<f64> {
        if !self.is_active() {
            return None;
        }
        let value = clamp_progress(value)?;
        self.last_activity = now;
        if value <= self.progress {
            return None;
        }
        self.progress = value;
        Some(value)
    }

    /// Decide whether the current progress is worth relaying.
    ///
    /// Relays when the progress moved at least `threshold` since the last relay,
    /// and always relays completion.
    pub fn take_relay(&mut self, threshold: f64) -> Option<f64> {
        if !self.valid {
            return None;
        }
        let delta = self.progress - self.relayed_progress;
        let completed = self.progress >= 1.0 && self.relayed_progress < 1.0;
        if delta > 0.0 && (delta >= threshold || completed) {
            self.relayed_progress = self.progress;
            return Some(self.progress);
        }
        None
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        if self.valid {
            self.description = description.into();
        }
    }

    /// Time since the last status or progress report.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Mark the handle dead. Called when it leaves its registry slot.
    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
        self.status = JobStatus::Removed;
    }
}

/// Clamp a progress report to `[0, 1]`, rejecting NaN.
pub fn clamp_progress(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value.clamp(0.0, 1.0))
    }
}
