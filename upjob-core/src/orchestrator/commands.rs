//! Commands issued by the presentation layer.
//!
//! Every command validates its preconditions before mutating anything, so a
//! refused command leaves the registry exactly as it found it.

use std::collections::HashMap;

use tracing::{debug, info, instrument, warn};

use super::Orchestrator;
use crate::error::{PreconditionError, Result};
use crate::event::OrchestratorEvent;
use crate::job::JobHandle;
use crate::policy::{self, PolicySnapshot};
use crate::registry::{JobTable, LedgerChange, PipelineIntent};
use crate::status::{CheckStatus, ModelEvent, UpdateStatus};
use crate::types::{
    BackupStatus, Classification, JobCtrl, JobKind, JobSlot, UpdateErrorType, UpdateMode,
};

impl Orchestrator {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Adopt the jobs already running on the remote service and load the
    /// package lists.
    ///
    /// Concurrent calls coalesce: a caller arriving while an init is in
    /// flight waits for it to settle and returns without starting another.
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<()> {
        let _gate = match self.init_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                debug!("Init already in flight, waiting for it to settle");
                let _settled = self.init_gate.lock().await;
                return Ok(());
            }
        };

        let paths = self.remote.list_jobs().await?;
        info!(jobs = paths.len(), "Initializing from remote job list");
        self.on_job_list_changed(paths).await;

        match self.remote.classified_updatable_packages().await {
            Ok(packages) => {
                self.on_classified_updatable_packages_changed(packages).await;
            }
            Err(e) => warn!(error = %e, "Failed to load updatable packages during init"),
        }

        self.emit(ModelEvent::InitCompleted);
        Ok(())
    }

    /// Start a repository refresh.
    ///
    /// If the remote service hands back the path of a check that is already
    /// running, that job is adopted instead of being replaced.
    #[instrument(skip(self))]
    pub async fn check_for_updates(&self) -> Result<()> {
        let path = self.remote.create_check_job().await?;
        let now = self.now();

        let superseded = {
            let mut jobs = self.jobs.lock().await;
            if jobs.active(JobSlot::Check).is_some_and(|h| h.path() == path) {
                debug!(path = %path, "Check job already tracked");
                return Ok(());
            }
            let superseded = jobs.active(JobSlot::Check).map(|h| h.path().to_string());
            jobs.insert(JobHandle::new(path.clone(), JobSlot::Check, now));
            superseded
        };

        if let Some(old) = superseded {
            info!(old = %old, new = %path, "Replacing running check job");
            if let Err(e) = self.remote.control_job(&old, JobCtrl::Cancel).await {
                warn!(path = %old, error = %e, "Failed to cancel superseded check job");
            }
        }

        info!(path = %path, "Checking for updates");
        self.emit(ModelEvent::CheckStatusChanged { status: CheckStatus::Checking });
        Ok(())
    }

    /// Fetch the version logs of the System and Safe classifications.
    ///
    /// Fetches run in the background; results come back through the inbox.
    pub fn request_update_log(&self) {
        for classification in [Classification::System, Classification::Safe] {
            let service = self.log_service.clone();
            let inbox = self.inbox.clone();
            tokio::spawn(async move {
                let result = service
                    .fetch_update_logs(classification)
                    .await
                    .map_err(|e| e.to_string());
                if inbox
                    .send(OrchestratorEvent::LogsReceived { classification, result })
                    .is_err()
                {
                    debug!(%classification, "Inbox closed before update logs arrived");
                }
            });
        }
    }

    // =========================================================================
    // Upgrades
    // =========================================================================

    /// Download and install the pending packages of one classification.
    ///
    /// With atomic upgrades enabled a backup job runs first; the download only
    /// starts once it succeeds.
    #[instrument(skip(self))]
    pub async fn dist_upgrade(&self, classification: Classification) -> Result<()> {
        if classification.is_aggregate() {
            return Err(PreconditionError::AggregateClassification(classification).into());
        }
        let policy = self.policy.snapshot();

        let mut jobs = self.jobs.lock().await;
        let backup = jobs.backup();
        if backup.is_running() {
            return Err(PreconditionError::BackupInProgress {
                running: backup.classification,
            }
            .into());
        }
        for slot in [JobSlot::Download(classification), JobSlot::Install(classification)] {
            if jobs.active(slot).is_some() {
                return Err(PreconditionError::JobAlreadyActive(slot).into());
            }
        }

        let needed = {
            let ledger = self.ledger.lock().await;
            match ledger.item(classification) {
                Some(item) if item.available => {
                    item.download_size.saturating_sub(item.downloaded_bytes)
                }
                _ => return Err(PreconditionError::NothingToUpgrade(classification).into()),
            }
        };

        policy::permits_upgrade(&policy, classification)
            .map_err(PreconditionError::PolicyDenied)?;

        if let Some(available) = self.space.available_bytes() {
            if available < needed {
                return Err(PreconditionError::InsufficientSpace { needed, available }.into());
            }
        }

        if policy::needs_backup(&policy) && backup.status != BackupStatus::Succeeded {
            return self.backup_to_atomic_upgrade(&mut jobs, classification).await;
        }

        self.start_download(&mut jobs, classification, true).await
    }

    /// Start the pre-upgrade backup for `classification`.
    ///
    /// Only one backup runs at a time; the caller holds the jobs lock and has
    /// checked the gate. The download starts when the backup succeeds.
    pub(super) async fn backup_to_atomic_upgrade(
        &self,
        jobs: &mut JobTable,
        classification: Classification,
    ) -> Result<()> {
        let path = self.remote.create_backup_job().await?;
        jobs.insert(JobHandle::new(path.clone(), JobSlot::Backup, self.now()));
        jobs.set_backup(BackupStatus::BackingUp, Some(classification));
        jobs.set_intent(classification, PipelineIntent { explicit: true });

        info!(path = %path, classification = %classification, "Backing up before upgrade");
        self.emit(ModelEvent::BackupStatusChanged {
            classification,
            status: BackupStatus::BackingUp,
        });
        self.emit(ModelEvent::StatusChanged {
            classification,
            status: UpdateStatus::BackingUp,
        });
        Ok(())
    }

    /// Create the download job and record who asked for it.
    pub(super) async fn start_download(
        &self,
        jobs: &mut JobTable,
        classification: Classification,
        explicit: bool,
    ) -> Result<()> {
        let path = self.remote.create_download_job(classification).await?;
        jobs.insert(JobHandle::new(
            path.clone(),
            JobSlot::Download(classification),
            self.now(),
        ));
        jobs.set_intent(classification, PipelineIntent { explicit });
        self.ledger.lock().await.reset_progress(classification);

        info!(%classification, path = %path, explicit, "Download job created");
        self.emit(ModelEvent::StatusChanged {
            classification,
            status: UpdateStatus::Downloading,
        });
        Ok(())
    }

    pub(super) async fn start_install(
        &self,
        jobs: &mut JobTable,
        classification: Classification,
    ) -> Result<()> {
        let path = self.remote.create_install_job(classification).await?;
        jobs.insert(JobHandle::new(
            path.clone(),
            JobSlot::Install(classification),
            self.now(),
        ));

        info!(%classification, path = %path, "Install job created");
        self.emit(ModelEvent::StatusChanged {
            classification,
            status: UpdateStatus::Installing,
        });
        Ok(())
    }

    /// Pause, resume or cancel the download or install job of a
    /// classification. `All` addresses every concrete classification.
    ///
    /// Does nothing when no such job is active. The effect shows up as a
    /// later status notification.
    #[instrument(skip(self))]
    pub async fn control_job(
        &self,
        classification: Classification,
        kind: JobKind,
        ctrl: JobCtrl,
    ) -> Result<()> {
        let targets: Vec<Classification> = if classification.is_aggregate() {
            Classification::CONCRETE.to_vec()
        } else {
            vec![classification]
        };

        let paths: Vec<String> = {
            let jobs = self.jobs.lock().await;
            targets
                .into_iter()
                .filter_map(|c| match kind {
                    JobKind::Download => Some(JobSlot::Download(c)),
                    JobKind::Install => Some(JobSlot::Install(c)),
                    _ => None,
                })
                .filter_map(|slot| jobs.active(slot).map(|h| h.path().to_string()))
                .collect()
        };

        if paths.is_empty() {
            debug!("No active job to control");
            return Ok(());
        }

        for path in paths {
            info!(path = %path, %ctrl, "Controlling job");
            self.remote.control_job(&path, ctrl).await?;
        }
        Ok(())
    }

    /// Pause, resume or cancel a classification's download.
    pub async fn on_download_job_ctrl(
        &self,
        classification: Classification,
        ctrl: JobCtrl,
    ) -> Result<()> {
        self.control_job(classification, JobKind::Download, ctrl).await
    }

    /// Start a fix-error job for a failed classification.
    ///
    /// Several classifications can wait on the same fix-error job; all of them
    /// hear about its outcome.
    #[instrument(skip(self))]
    pub async fn on_fix_error(
        &self,
        classification: Classification,
        error: UpdateErrorType,
    ) -> Result<()> {
        if !error.is_fixable() {
            return Err(PreconditionError::NotFixable(error).into());
        }

        let mut jobs = self.jobs.lock().await;
        if jobs.active(JobSlot::FixError).is_none() {
            let path = self.remote.create_fix_error_job(error).await?;
            info!(path = %path, %error, "Fix-error job created");
            jobs.insert(JobHandle::new(path, JobSlot::FixError, self.now()));
        } else {
            debug!("Joining running fix-error job");
        }
        jobs.request_fix(classification);

        self.emit(ModelEvent::StatusChanged {
            classification,
            status: UpdateStatus::FixingError,
        });
        Ok(())
    }

    /// Classify a failed job's description.
    pub fn analyze_job_error_message(&self, description: &str) -> UpdateErrorType {
        crate::classify::analyze_job_error_message(description)
    }

    // =========================================================================
    // Package lists
    // =========================================================================

    /// Apply a classified package map from the remote service.
    ///
    /// Applying the same map twice is a no-op. A classification whose
    /// download or install is active keeps its packages when the map reports
    /// none for it. Returns the classifications that have packages pending.
    #[instrument(skip(self, packages))]
    pub async fn on_classified_updatable_packages_changed(
        &self,
        packages: HashMap<String, Vec<String>>,
    ) -> Vec<Classification> {
        let jobs = self.jobs.lock().await;
        self.apply_packages(&jobs, packages).await
    }

    pub(super) async fn apply_packages(
        &self,
        jobs: &JobTable,
        packages: HashMap<String, Vec<String>>,
    ) -> Vec<Classification> {
        let mut incoming: HashMap<Classification, Vec<String>> = HashMap::new();
        for (key, list) in packages {
            match Classification::from_package_key(&key) {
                Some(c) => incoming.entry(c).or_default().extend(list),
                None => debug!(key = %key, "Ignoring unknown package class"),
            }
        }

        let all_before = self.ledger_available(Classification::All).await;

        for classification in Classification::CONCRETE {
            let mut list = incoming.remove(&classification).unwrap_or_default();
            list.sort();
            list.dedup();

            if self.ledger.lock().await.packages(classification) == list.as_slice() {
                continue;
            }
            let pipeline_active = jobs.pipeline_active(classification);
            if list.is_empty() && pipeline_active {
                debug!(%classification, "Keeping packages of active pipeline");
                continue;
            }

            // Without a size the space check cannot run, so the item keeps its
            // old contents and the next identical map queries again.
            let size = if list.is_empty() {
                0
            } else {
                match self.remote.packages_download_size(&list).await {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(%classification, error = %e, "Failed to query download size");
                        self.emit(ModelEvent::ErrorOccurred {
                            classification: Some(classification),
                            kind: JobKind::Check,
                            error: self.analyze_job_error_message(&e.to_string()),
                        });
                        continue;
                    }
                }
            };

            let count = list.len();
            let change = self
                .ledger
                .lock()
                .await
                .apply_packages(classification, list, size);
            debug!(%classification, packages = count, size, ?change, "Package list applied");

            match change {
                LedgerChange::Unchanged => {}
                LedgerChange::Updated => {
                    self.emit(ModelEvent::ItemInfoChanged { classification });
                }
                LedgerChange::AvailabilityChanged(available) => {
                    self.emit(ModelEvent::AvailabilityChanged { classification, available });
                    if !pipeline_active {
                        let status = if available {
                            UpdateStatus::UpdatesAvailable
                        } else {
                            UpdateStatus::UpToDate
                        };
                        self.emit(ModelEvent::StatusChanged { classification, status });
                    }
                }
            }
        }

        let all_after = self.ledger_available(Classification::All).await;
        if all_after != all_before {
            self.emit(ModelEvent::AvailabilityChanged {
                classification: Classification::All,
                available: all_after,
            });
        }

        let ledger = self.ledger.lock().await;
        Classification::CONCRETE
            .into_iter()
            .filter(|c| ledger.item(*c).is_some_and(|i| i.available))
            .collect()
    }

    async fn ledger_available(&self, classification: Classification) -> bool {
        self.ledger
            .lock()
            .await
            .item(classification)
            .is_some_and(|i| i.available)
    }

    // =========================================================================
    // Policy setters
    // =========================================================================

    fn update_policy<F>(&self, setting: &'static str, change: F) -> (bool, bool)
    where
        F: FnOnce(&mut PolicySnapshot),
    {
        let (previous, next) = self.policy.update(change);
        info!(setting, "Policy updated");
        (previous.is_low_battery(), next.is_low_battery())
    }

    pub fn set_auto_check_updates(&self, enabled: bool) {
        self.update_policy("auto_check", |p| p.auto_check = enabled);
    }

    pub fn set_auto_download_updates(&self, enabled: bool) {
        self.update_policy("auto_download", |p| p.auto_download = enabled);
    }

    pub fn set_auto_install_updates(&self, enabled: bool) {
        self.update_policy("auto_install", |p| p.auto_install = enabled);
    }

    pub fn set_update_mode(&self, mode: UpdateMode) {
        self.update_policy("update_mode", |p| p.update_mode = mode);
    }

    pub fn set_auto_clean_cache(&self, enabled: bool) {
        self.update_policy("auto_clean_cache", |p| p.auto_clean_cache = enabled);
    }

    pub fn set_update_notify(&self, enabled: bool) {
        self.update_policy("update_notify", |p| p.update_notify = enabled);
    }

    pub fn set_atomic_upgrade(&self, enabled: bool) {
        self.update_policy("atomic_upgrade", |p| p.atomic_upgrade = enabled);
    }

    pub fn set_on_battery(&self, on_battery: bool) {
        let (was_low, low) = self.update_policy("on_battery", |p| p.on_battery = on_battery);
        self.relay_low_battery(was_low, low);
    }

    pub fn set_battery_percentage(&self, percentage: f64) {
        let percentage = percentage.clamp(0.0, 100.0);
        let (was_low, low) =
            self.update_policy("battery_percentage", |p| p.battery_percentage = percentage);
        self.relay_low_battery(was_low, low);
    }

    fn relay_low_battery(&self, was_low: bool, low: bool) {
        if was_low != low {
            info!(low, "Low battery state changed");
            self.emit(ModelEvent::LowBatteryChanged { low });
        }
    }

    /// The license state changed; the presentation layer re-reads it.
    pub fn on_license_state_changed(&self) {
        self.emit(ModelEvent::LicenseRefreshRequested);
    }
}
