//! Job-list reconciliation.
//!
//! The remote service periodically publishes the full list of job paths it
//! knows. Reconciling against it:
//!
//! 1. clears local handles whose path is gone (a vanished active job is a
//!    failure),
//! 2. adopts unknown remote jobs with a recognized id into empty slots,
//! 3. keeps everything else as is.
//!
//! The list is sorted and deduplicated first, and when two remote jobs compete
//! for one slot the smallest path wins, so applying the same set of paths in
//! any order or any number of times ends in the same registry.

use std::collections::BTreeSet;

use tracing::{debug, info, instrument, warn};

use super::Orchestrator;
use crate::job::JobHandle;
use crate::registry::PipelineIntent;
use crate::remote::JobInfo;
use crate::status::{CheckStatus, ModelEvent, UpdateStatus};
use crate::types::{BackupStatus, JobSlot, JobStatus};

impl Orchestrator {
    /// Reconcile the registry against the authoritative remote job list.
    #[instrument(skip(self, paths), fields(remote_jobs = paths.len()))]
    pub async fn on_job_list_changed(&self, paths: Vec<String>) {
        let remote: BTreeSet<String> = paths.into_iter().collect();
        let now = self.now();

        // Vanished jobs and paths we have never seen.
        let unknown: Vec<String> = {
            let mut jobs = self.jobs.lock().await;
            let gone: Vec<JobSlot> = jobs
                .handles()
                .filter(|h| !remote.contains(h.path()))
                .map(|h| h.slot())
                .collect();

            for slot in gone {
                let Some(change) = jobs
                    .get_mut(slot)
                    .and_then(|h| h.apply_status(JobStatus::Removed, now))
                else {
                    jobs.remove(slot);
                    continue;
                };
                self.on_vanished(&mut jobs, slot, change).await;
            }

            remote
                .iter()
                .filter(|p| jobs.slot_of(p).is_none())
                .cloned()
                .collect()
        };

        if unknown.is_empty() {
            return;
        }

        let mut candidates: Vec<JobInfo> = Vec::new();
        for path in unknown {
            match self.remote.job_info(&path).await {
                Ok(info) => candidates.push(info),
                Err(e) => debug!(path = %path, error = %e, "Skipping unreadable job"),
            }
        }

        // Sorted so the smallest path claims a contested slot.
        candidates.sort_by(|a, b| a.path.cmp(&b.path));

        let mut jobs = self.jobs.lock().await;
        for info in candidates {
            let Some(slot) = JobSlot::from_job_id(&info.id) else {
                debug!(path = %info.path, id = %info.id, "Ignoring unrecognized job");
                continue;
            };
            let status = JobStatus::from_remote(&info.status);
            if !status.is_some_and(JobStatus::is_active) {
                debug!(path = %info.path, status = %info.status, "Not adopting finished job");
                continue;
            }
            if jobs.get(slot).is_some() || jobs.slot_of(&info.path).is_some() {
                debug!(path = %info.path, %slot, "Slot already occupied");
                continue;
            }

            let handle = JobHandle::adopted(&info, slot, now);
            let paused = handle.status() == JobStatus::Paused;
            let progress = handle.progress();
            jobs.insert(handle);
            info!(path = %info.path, %slot, "Adopted remote job");

            match slot {
                JobSlot::Check => {
                    self.emit(ModelEvent::CheckStatusChanged { status: CheckStatus::Checking });
                }
                JobSlot::Download(c) => {
                    if jobs.intent(c).is_none() {
                        jobs.set_intent(c, PipelineIntent { explicit: false });
                    }
                    self.ledger.lock().await.set_download_progress(c, progress);
                    let status = if paused {
                        UpdateStatus::DownloadPaused
                    } else {
                        UpdateStatus::Downloading
                    };
                    self.emit(ModelEvent::StatusChanged { classification: c, status });
                }
                JobSlot::Install(c) => {
                    self.ledger.lock().await.set_install_progress(c, progress);
                    self.emit(ModelEvent::StatusChanged {
                        classification: c,
                        status: UpdateStatus::Installing,
                    });
                }
                JobSlot::Backup => {
                    let requested = jobs.backup().classification;
                    jobs.set_backup(BackupStatus::BackingUp, requested);
                    if let Some(classification) = requested {
                        self.emit(ModelEvent::BackupStatusChanged {
                            classification,
                            status: BackupStatus::BackingUp,
                        });
                    }
                }
                JobSlot::FixError => {
                    warn!(path = %info.path, "Adopted fix-error job has no waiting classification");
                }
            }
        }
    }
}
