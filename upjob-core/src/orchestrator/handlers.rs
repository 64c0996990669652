//! Handlers for job notifications arriving through the inbox.

use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use super::Orchestrator;
use crate::classify::analyze_job_error_message;
use crate::job::StatusChange;
use crate::logcache::UpdateLogEntry;
use crate::policy;
use crate::registry::JobTable;
use crate::status::{CheckStatus, ModelEvent, UpdateStatus};
use crate::types::{BackupStatus, Classification, JobCtrl, JobKind, JobSlot, JobStatus, UpdateErrorType};

impl Orchestrator {
    // =========================================================================
    // Status
    // =========================================================================

    /// Apply a raw status report for the job at `path`.
    ///
    /// Reports for paths not in the registry are ignored.
    #[instrument(skip(self, description))]
    pub async fn on_job_status_changed(&self, path: &str, status: &str, description: &str) {
        let Some(status) = JobStatus::from_remote(status) else {
            warn!(path, status, "Ignoring unrecognized job status");
            return;
        };
        let now = self.now();

        let mut jobs = self.jobs.lock().await;
        let Some(slot) = jobs.slot_of(path) else {
            debug!(path, %status, "Status for untracked job");
            return;
        };
        let Some(handle) = jobs.get_mut(slot) else {
            return;
        };
        if !description.is_empty() {
            handle.set_description(description);
        }
        let Some(change) = handle.apply_status(status, now) else {
            return;
        };
        let description = handle.description().to_string();
        debug!(%slot, previous = %change.previous, current = %change.current, "Job status changed");

        match slot {
            JobSlot::Check => self.on_check_status(&mut jobs, change, &description).await,
            JobSlot::Download(c) => self.on_download_status(&mut jobs, c, change, &description).await,
            JobSlot::Install(c) => self.on_install_status(&mut jobs, c, change, &description).await,
            JobSlot::Backup => self.on_backup_status(&mut jobs, change, &description).await,
            JobSlot::FixError => self.on_fix_error_status(&mut jobs, change, &description).await,
        }
    }

    /// Status report addressed by classification instead of job path.
    pub async fn on_download_status_changed(
        &self,
        classification: Classification,
        status: &str,
        description: &str,
    ) {
        let path = self.slot_path(JobSlot::Download(classification)).await;
        match path {
            Some(path) => self.on_job_status_changed(&path, status, description).await,
            None => debug!(%classification, "No download job to update"),
        }
    }

    /// Status report addressed by classification instead of job path.
    pub async fn on_install_status_changed(
        &self,
        classification: Classification,
        status: &str,
        description: &str,
    ) {
        let path = self.slot_path(JobSlot::Install(classification)).await;
        match path {
            Some(path) => self.on_job_status_changed(&path, status, description).await,
            None => debug!(%classification, "No install job to update"),
        }
    }

    async fn slot_path(&self, slot: JobSlot) -> Option<String> {
        self.jobs.lock().await.get(slot).map(|h| h.path().to_string())
    }

    async fn on_check_status(&self, jobs: &mut JobTable, change: StatusChange, description: &str) {
        match change.current {
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused => {}
            JobStatus::Succeeded => {
                jobs.remove(JobSlot::Check);
                self.on_check_succeeded(jobs).await;
            }
            JobStatus::Failed => {
                let kind = analyze_job_error_message(description);
                self.fail_slot(jobs, JobSlot::Check, kind, true).await;
            }
            JobStatus::Removed => self.on_vanished(jobs, JobSlot::Check, change).await,
        }
    }

    /// Refresh the package lists and run the post-check policy decisions.
    async fn on_check_succeeded(&self, jobs: &mut JobTable) {
        let packages = match self.remote.classified_updatable_packages().await {
            Ok(packages) => packages,
            Err(e) => {
                error!(error = %e, "Failed to read packages after check");
                self.emit(ModelEvent::CheckStatusChanged {
                    status: CheckStatus::Failed(UpdateErrorType::Unknown),
                });
                self.emit(ModelEvent::ErrorOccurred {
                    classification: None,
                    kind: JobKind::Check,
                    error: UpdateErrorType::Unknown,
                });
                return;
            }
        };

        let available = self.apply_packages(jobs, packages).await;

        // A fresh set of updates needs a fresh backup.
        if !jobs.backup().is_running() {
            jobs.set_backup(BackupStatus::Idle, None);
        }

        let status = if available.is_empty() {
            CheckStatus::UpToDate
        } else {
            CheckStatus::UpdatesAvailable
        };
        info!(available = ?available, "Check finished");
        self.emit(ModelEvent::CheckStatusChanged { status });

        let policy = self.policy.snapshot();
        if policy::should_notify(&policy, !available.is_empty()) {
            self.emit(ModelEvent::UpdatesNotification { classifications: available.clone() });
        }
        self.request_update_log();

        for classification in available {
            if !policy::should_auto_download(&policy, classification)
                || jobs.pipeline_active(classification)
                || jobs.backup().is_running()
            {
                continue;
            }
            if let Err(e) = self.start_download(jobs, classification, false).await {
                warn!(%classification, error = %e, "Automatic download failed to start");
                self.report(classification, JobKind::Download, UpdateErrorType::Unknown);
            }
        }
    }

    async fn on_download_status(
        &self,
        jobs: &mut JobTable,
        classification: Classification,
        change: StatusChange,
        description: &str,
    ) {
        let slot = JobSlot::Download(classification);
        match change.current {
            JobStatus::Pending | JobStatus::Running => {
                if change.previous == JobStatus::Paused {
                    self.emit(ModelEvent::StatusChanged {
                        classification,
                        status: UpdateStatus::Downloading,
                    });
                }
            }
            JobStatus::Paused => self.emit(ModelEvent::StatusChanged {
                classification,
                status: UpdateStatus::DownloadPaused,
            }),
            JobStatus::Succeeded => {
                self.relay_progress(jobs, slot).await;
                if let Some(done) = jobs.remove(slot) {
                    self.remove_remote(done.path()).await;
                }
                info!(%classification, "Download finished");
                self.emit(ModelEvent::StatusChanged {
                    classification,
                    status: UpdateStatus::Downloaded,
                });

                let explicit = jobs.intent(classification).is_some_and(|i| i.explicit);
                jobs.clear_intent(classification);
                if jobs.active(JobSlot::Install(classification)).is_none() {
                    self.install_after_download(jobs, classification, explicit).await;
                }
            }
            JobStatus::Failed => {
                let kind = analyze_job_error_message(description);
                self.fail_slot(jobs, slot, kind, true).await;
            }
            JobStatus::Removed => self.on_vanished(jobs, slot, change).await,
        }
    }

    /// Start the install of a finished download if the current policy allows.
    ///
    /// Explicit upgrades only need enough battery. Automatic pipelines also
    /// need auto-install, and never chain while atomic upgrades are on since
    /// the backup only runs for explicit upgrades.
    async fn install_after_download(
        &self,
        jobs: &mut JobTable,
        classification: Classification,
        explicit: bool,
    ) {
        let policy = self.policy.snapshot();
        if explicit {
            if let Err(denial) = policy::check_battery(&policy) {
                warn!(%classification, %denial, "Install held back");
                self.report(classification, JobKind::Install, UpdateErrorType::LowBattery);
                return;
            }
        } else if !policy::should_auto_install(&policy, classification)
            || policy::needs_backup(&policy)
        {
            debug!(%classification, "Leaving downloaded packages for a later install");
            return;
        }

        if let Err(e) = self.start_install(jobs, classification).await {
            warn!(%classification, error = %e, "Install failed to start");
            self.report(classification, JobKind::Install, UpdateErrorType::Unknown);
        }
    }

    async fn on_install_status(
        &self,
        jobs: &mut JobTable,
        classification: Classification,
        change: StatusChange,
        description: &str,
    ) {
        let slot = JobSlot::Install(classification);
        match change.current {
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused => {}
            JobStatus::Succeeded => {
                self.relay_progress(jobs, slot).await;
                if let Some(done) = jobs.remove(slot) {
                    self.remove_remote(done.path()).await;
                }
                self.ledger.lock().await.mark_installed(classification);

                info!(%classification, "Install finished");
                self.emit(ModelEvent::StatusChanged {
                    classification,
                    status: UpdateStatus::InstallComplete,
                });
                self.emit(ModelEvent::AvailabilityChanged { classification, available: false });
                if classification == Classification::System {
                    self.emit(ModelEvent::ReleaseNoteInstallCompleted);
                }
            }
            JobStatus::Failed => {
                let kind = analyze_job_error_message(description);
                self.fail_slot(jobs, slot, kind, true).await;
            }
            JobStatus::Removed => self.on_vanished(jobs, slot, change).await,
        }
    }

    async fn on_backup_status(&self, jobs: &mut JobTable, change: StatusChange, description: &str) {
        match change.current {
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused => {}
            JobStatus::Succeeded => {
                if let Some(done) = jobs.remove(JobSlot::Backup) {
                    self.remove_remote(done.path()).await;
                }
                let requested = jobs.backup().classification;
                jobs.set_backup(BackupStatus::Succeeded, requested);
                let Some(classification) = requested else {
                    info!("Adopted backup finished");
                    return;
                };

                info!(%classification, "Backup finished, starting download");
                self.emit(ModelEvent::BackupStatusChanged {
                    classification,
                    status: BackupStatus::Succeeded,
                });
                let explicit = jobs.intent(classification).map_or(true, |i| i.explicit);
                if let Err(e) = self.start_download(jobs, classification, explicit).await {
                    warn!(%classification, error = %e, "Download failed to start after backup");
                    jobs.clear_intent(classification);
                    self.report(classification, JobKind::Download, UpdateErrorType::Unknown);
                }
            }
            JobStatus::Failed => {
                debug!(description, "Backup job failed");
                self.fail_slot(jobs, JobSlot::Backup, UpdateErrorType::BackupFailed, true)
                    .await;
            }
            JobStatus::Removed => self.on_vanished(jobs, JobSlot::Backup, change).await,
        }
    }

    async fn on_fix_error_status(
        &self,
        jobs: &mut JobTable,
        change: StatusChange,
        description: &str,
    ) {
        match change.current {
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused => {}
            JobStatus::Succeeded => {
                if let Some(done) = jobs.remove(JobSlot::FixError) {
                    self.remove_remote(done.path()).await;
                }
                for classification in jobs.take_fix_requests() {
                    info!(%classification, "Fix-error job finished");
                    self.emit(ModelEvent::StatusChanged {
                        classification,
                        status: UpdateStatus::FixErrorComplete,
                    });
                }
            }
            JobStatus::Failed => {
                let kind = analyze_job_error_message(description);
                self.fail_slot(jobs, JobSlot::FixError, kind, true).await;
            }
            JobStatus::Removed => self.on_vanished(jobs, JobSlot::FixError, change).await,
        }
    }

    /// A job reported "end" or dropped out of the job list.
    ///
    /// Normal after success; anything else means the job vanished under us.
    pub(super) async fn on_vanished(&self, jobs: &mut JobTable, slot: JobSlot, change: StatusChange) {
        if change.previous == JobStatus::Succeeded || change.previous == JobStatus::Failed {
            jobs.remove(slot);
            return;
        }
        warn!(%slot, previous = %change.previous, "Job vanished before finishing");
        self.fail_slot(jobs, slot, UpdateErrorType::Unknown, false).await;
    }

    // =========================================================================
    // Failure
    // =========================================================================

    /// Clear a slot and report the failure to the presentation model.
    ///
    /// No retry is started. With `discard` the remote job is removed too.
    pub(super) async fn fail_slot(
        &self,
        jobs: &mut JobTable,
        slot: JobSlot,
        kind: UpdateErrorType,
        discard: bool,
    ) {
        let removed = jobs.remove(slot);
        error!(%slot, error = %kind, "Job failed");

        match slot {
            JobSlot::Check => {
                self.emit(ModelEvent::CheckStatusChanged { status: CheckStatus::Failed(kind) });
                self.emit(ModelEvent::ErrorOccurred {
                    classification: None,
                    kind: JobKind::Check,
                    error: kind,
                });
            }
            JobSlot::Download(c) | JobSlot::Install(c) => {
                jobs.clear_intent(c);
                self.ledger.lock().await.reset_progress(c);
                self.report(c, slot.kind(), kind);
            }
            JobSlot::Backup => {
                let requested = jobs.backup().classification;
                jobs.set_backup(BackupStatus::Failed, requested);
                let classification = requested.unwrap_or(Classification::All);
                if let Some(c) = requested {
                    jobs.clear_intent(c);
                }
                self.emit(ModelEvent::BackupStatusChanged {
                    classification,
                    status: BackupStatus::Failed,
                });
                self.report(classification, JobKind::Backup, kind);
            }
            JobSlot::FixError => {
                let waiting = jobs.take_fix_requests();
                if waiting.is_empty() {
                    self.emit(ModelEvent::ErrorOccurred {
                        classification: None,
                        kind: JobKind::FixError,
                        error: kind,
                    });
                }
                for c in waiting {
                    self.report(c, JobKind::FixError, kind);
                }
            }
        }

        if discard {
            if let Some(handle) = removed {
                self.remove_remote(handle.path()).await;
            }
        }
    }

    /// Error plus failed status for one classification.
    fn report(&self, classification: Classification, kind: JobKind, error: UpdateErrorType) {
        self.emit(ModelEvent::ErrorOccurred {
            classification: Some(classification),
            kind,
            error,
        });
        self.emit(ModelEvent::StatusChanged {
            classification,
            status: UpdateStatus::UpdateFailed(error),
        });
    }

    async fn remove_remote(&self, path: &str) {
        if let Err(e) = self.remote.remove_job(path).await {
            debug!(path, error = %e, "Failed to remove finished remote job");
        }
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Apply a raw progress report for the job at `path`.
    pub async fn on_job_progress_changed(&self, path: &str, value: f64) {
        let now = self.now();
        let mut jobs = self.jobs.lock().await;
        let Some(slot) = jobs.slot_of(path) else {
            debug!(path, "Progress for untracked job");
            return;
        };
        let Some(handle) = jobs.get_mut(slot) else {
            return;
        };
        if handle.apply_progress(value, now).is_none() {
            return;
        }
        self.relay_progress(&mut jobs, slot).await;
    }

    /// Progress report addressed by classification instead of job path.
    pub async fn on_download_progress_changed(&self, classification: Classification, value: f64) {
        if let Some(path) = self.slot_path(JobSlot::Download(classification)).await {
            self.on_job_progress_changed(&path, value).await;
        }
    }

    /// Progress report addressed by classification instead of job path.
    pub async fn on_install_progress_changed(&self, classification: Classification, value: f64) {
        if let Some(path) = self.slot_path(JobSlot::Install(classification)).await {
            self.on_job_progress_changed(&path, value).await;
        }
    }

    /// Mirror a handle's progress into the ledger and relay it if it moved
    /// far enough.
    async fn relay_progress(&self, jobs: &mut JobTable, slot: JobSlot) {
        let classification = match slot {
            JobSlot::Download(c) | JobSlot::Install(c) => c,
            JobSlot::Backup => match jobs.backup().classification {
                Some(c) => c,
                None => return,
            },
            JobSlot::Check | JobSlot::FixError => return,
        };
        let Some(handle) = jobs.get_mut(slot) else {
            return;
        };
        let current = handle.progress();
        let relay = handle.take_relay(self.config.progress_debounce);

        match slot {
            JobSlot::Download(c) => self.ledger.lock().await.set_download_progress(c, current),
            JobSlot::Install(c) => self.ledger.lock().await.set_install_progress(c, current),
            _ => {}
        }

        if let Some(progress) = relay {
            self.emit(ModelEvent::ProgressChanged {
                classification,
                kind: slot.kind(),
                progress,
            });
        }
    }

    // =========================================================================
    // Update logs
    // =========================================================================

    /// Store a finished update-log fetch and refresh the item's release info.
    pub async fn on_update_logs_received(
        &self,
        classification: Classification,
        result: Result<Vec<UpdateLogEntry>, String>,
    ) {
        let entries = match result {
            Ok(entries) => entries,
            Err(reason) => {
                warn!(%classification, error = %reason, "Update log fetch failed");
                self.emit(ModelEvent::UpdateLogFailed { classification, reason });
                return;
            }
        };

        let latest = {
            let mut logs = self.logs.write().await;
            logs.replace(classification, entries);
            logs.latest(classification).cloned()
        };
        let Some(latest) = latest else {
            debug!(%classification, "No update log published");
            return;
        };

        let change_log = latest.localized(&self.config.locale).to_string();
        self.ledger.lock().await.set_release_info(
            classification,
            latest.system_version.clone(),
            change_log,
            latest.publish_time,
        );
        debug!(%classification, version = %latest.system_version, "Release info updated");
        self.emit(ModelEvent::ItemInfoChanged { classification });
    }

    // =========================================================================
    // Watchdog
    // =========================================================================

    /// Fail every pending or running job that has been silent for the
    /// watchdog interval. Paused jobs wait for the user and never expire.
    pub async fn check_timeouts(&self) -> Vec<JobSlot> {
        self.check_timeouts_at(self.now()).await
    }

    /// [`Orchestrator::check_timeouts`] against an explicit clock reading.
    pub async fn check_timeouts_at(&self, now: Instant) -> Vec<JobSlot> {
        let mut jobs = self.jobs.lock().await;
        let expired: Vec<(JobSlot, String)> = jobs
            .handles()
            .filter(|h| {
                h.is_active()
                    && h.status() != JobStatus::Paused
                    && h.idle_for(now) >= self.config.watchdog_interval
            })
            .map(|h| (h.slot(), h.path().to_string()))
            .collect();

        for (slot, path) in &expired {
            warn!(%slot, path = %path, "Job timed out");
            self.fail_slot(&mut jobs, *slot, UpdateErrorType::Timeout, false)
                .await;
            if let Err(e) = self.remote.control_job(path, JobCtrl::Cancel).await {
                debug!(path = %path, error = %e, "Failed to cancel timed out job");
            }
        }

        expired.into_iter().map(|(slot, _)| slot).collect()
    }
}
