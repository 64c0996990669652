//! Classification registry.
//!
//! The registry is split in two partitions that are locked independently by
//! the orchestrator:
//!
//! - [`JobTable`]: which job handle occupies which slot, pipeline intents and
//!   the backup gate.
//! - [`DownloadLedger`]: per-classification package lists, download sizes,
//!   progress and change-log metadata.
//!
//! When both are needed the job table is locked first.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::job::JobHandle;
use crate::types::{BackupStatus, Classification, JobSlot};

// =============================================================================
// JOB TABLE
// =============================================================================

/// How a classification's running pipeline was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineIntent {
    /// The user asked for this upgrade. Otherwise the install after the
    /// download is up to the policy in force when the download succeeds.
    pub explicit: bool,
}

/// Backup gate state for atomic upgrades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupGate {
    pub status: BackupStatus,
    /// Classification whose upgrade requested the running or last backup.
    pub classification: Option<Classification>,
}

impl BackupGate {
    pub fn is_running(&self) -> bool {
        self.status == BackupStatus::BackingUp
    }
}

/// Slot table of job handles. The single source of truth for which job is
/// active where.
#[derive(Debug, Default)]
pub struct JobTable {
    slots: HashMap<JobSlot, JobHandle>,
    paths: HashMap<String, JobSlot>,
    intents: HashMap<Classification, PipelineIntent>,
    backup: BackupGate,
    fix_requested: BTreeSet<Classification>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a handle in its slot, returning the handle it replaced.
    ///
    /// The replaced handle is invalidated before it is handed back.
    pub fn insert(&mut self, handle: JobHandle) -> Option<JobHandle> {
        let slot = handle.slot();
        let replaced = self.remove(slot);
        self.paths.insert(handle.path().to_string(), slot);
        self.slots.insert(slot, handle);
        replaced
    }

    /// Clear a slot. The returned handle is already invalidated.
    pub fn remove(&mut self, slot: JobSlot) -> Option<JobHandle> {
        let mut handle = self.slots.remove(&slot)?;
        self.paths.remove(handle.path());
        handle.invalidate();
        Some(handle)
    }

    pub fn get(&self, slot: JobSlot) -> Option<&JobHandle> {
        self.slots.get(&slot).filter(|h| h.is_valid())
    }

    pub fn get_mut(&mut self, slot: JobSlot) -> Option<&mut JobHandle> {
        self.slots.get_mut(&slot).filter(|h| h.is_valid())
    }

    /// Handle in `slot` if it is still pending, running or paused.
    pub fn active(&self, slot: JobSlot) -> Option<&JobHandle> {
        self.get(slot).filter(|h| h.is_active())
    }

    /// Slot occupied by the job at `path`.
    pub fn slot_of(&self, path: &str) -> Option<JobSlot> {
        self.paths.get(path).copied()
    }

    pub fn handles(&self) -> impl Iterator<Item = &JobHandle> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether any download or install job is active for the classification.
    pub fn pipeline_active(&self, classification: Classification) -> bool {
        self.active(JobSlot::Download(classification)).is_some()
            || self.active(JobSlot::Install(classification)).is_some()
    }

    /// Snapshot of `(slot, path)` pairs, sorted. Used to compare registry states.
    pub fn snapshot(&self) -> Vec<(JobSlot, String)> {
        let mut out: Vec<_> = self
            .slots
            .iter()
            .map(|(slot, h)| (*slot, h.path().to_string()))
            .collect();
        out.sort();
        out
    }

    pub fn intent(&self, classification: Classification) -> Option<PipelineIntent> {
        self.intents.get(&classification).copied()
    }

    pub fn set_intent(&mut self, classification: Classification, intent: PipelineIntent) {
        self.intents.insert(classification, intent);
    }

    pub fn clear_intent(&mut self, classification: Classification) {
        self.intents.remove(&classification);
    }

    pub fn backup(&self) -> BackupGate {
        self.backup
    }

    pub fn set_backup(&mut self, status: BackupStatus, classification: Option<Classification>) {
        self.backup = BackupGate { status, classification };
    }

    pub fn request_fix(&mut self, classification: Classification) {
        self.fix_requested.insert(classification);
    }

    /// Classifications waiting on the fix-error job, drained.
    pub fn take_fix_requests(&mut self) -> Vec<Classification> {
        std::mem::take(&mut self.fix_requested).into_iter().collect()
    }
}

// =============================================================================
// DOWNLOAD LEDGER
// =============================================================================

/// Presentation-facing record of one classification's pending update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateItem {
    pub classification: Classification,
    pub packages: Vec<String>,
    /// Bytes still to download for `packages`
    pub download_size: u64,
    pub downloaded_bytes: u64,
    pub download_progress: f64,
    pub install_progress: f64,
    /// Change log in the configured locale
    pub change_log: String,
    pub version: String,
    pub publish_time: Option<DateTime<FixedOffset>>,
    pub available: bool,
}

impl UpdateItem {
    pub fn new(classification: Classification) -> Self {
        Self {
            classification,
            packages: Vec::new(),
            download_size: 0,
            downloaded_bytes: 0,
            download_progress: 0.0,
            install_progress: 0.0,
            change_log: String::new(),
            version: String::new(),
            publish_time: None,
            available: false,
        }
    }
}

/// Result of applying a package list to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerChange {
    /// Same list as before; nothing touched.
    Unchanged,
    /// Packages or size changed; availability stayed the same.
    Updated,
    /// Availability flipped.
    AvailabilityChanged(bool),
}

/// Package lists, sizes and progress per classification.
#[derive(Debug, Clone)]
pub struct DownloadLedger {
    items: BTreeMap<Classification, UpdateItem>,
}

impl Default for DownloadLedger {
    fn default() -> Self {
        let items = Classification::CONCRETE
            .into_iter()
            .chain(std::iter::once(Classification::All))
            .map(|c| (c, UpdateItem::new(c)))
            .collect();
        Self { items }
    }
}

impl DownloadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(&self, classification: Classification) -> Option<&UpdateItem> {
        self.items.get(&classification)
    }

    pub fn items(&self) -> impl Iterator<Item = &UpdateItem> {
        self.items.values()
    }

    /// Packages currently recorded for a classification.
    pub fn packages(&self, classification: Classification) -> &[String] {
        self.items
            .get(&classification)
            .map(|i| i.packages.as_slice())
            .unwrap_or(&[])
    }

    /// Replace a concrete classification's package list and size.
    ///
    /// `packages` must already be sorted and deduplicated.
    pub fn apply_packages(
        &mut self,
        classification: Classification,
        packages: Vec<String>,
        download_size: u64,
    ) -> LedgerChange {
        let item = self
            .items
            .entry(classification)
            .or_insert_with(|| UpdateItem::new(classification));
        if item.packages == packages && item.download_size == download_size {
            return LedgerChange::Unchanged;
        }

        let was_available = item.available;
        item.available = !packages.is_empty();
        item.packages = packages;
        item.download_size = download_size;
        item.downloaded_bytes = item.downloaded_bytes.min(download_size);
        let available = item.available;

        self.recompute_all();
        if available != was_available {
            LedgerChange::AvailabilityChanged(available)
        } else {
            LedgerChange::Updated
        }
    }

    /// Rebuild the `All` aggregate from the concrete classifications.
    fn recompute_all(&mut self) {
        let mut packages = BTreeSet::new();
        let mut size = 0u64;
        let mut downloaded = 0u64;
        for c in Classification::CONCRETE {
            if let Some(item) = self.items.get(&c) {
                packages.extend(item.packages.iter().cloned());
                size = size.saturating_add(item.download_size);
                downloaded = downloaded.saturating_add(item.downloaded_bytes);
            }
        }

        let all = self
            .items
            .entry(Classification::All)
            .or_insert_with(|| UpdateItem::new(Classification::All));
        all.available = !packages.is_empty();
        all.packages = packages.into_iter().collect();
        all.download_size = size;
        all.downloaded_bytes = downloaded;
        all.download_progress = if size > 0 {
            downloaded as f64 / size as f64
        } else {
            0.0
        };
    }

    pub fn set_download_progress(&mut self, classification: Classification, progress: f64) {
        if let Some(item) = self.items.get_mut(&classification) {
            item.download_progress = progress;
            item.downloaded_bytes = (item.download_size as f64 * progress) as u64;
        }
        self.recompute_all();
    }

    pub fn set_install_progress(&mut self, classification: Classification, progress: f64) {
        if let Some(item) = self.items.get_mut(&classification) {
            item.install_progress = progress;
        }
    }

    /// Zero the progress fields when a new job replaces the old one.
    pub fn reset_progress(&mut self, classification: Classification) {
        if let Some(item) = self.items.get_mut(&classification) {
            item.download_progress = 0.0;
            item.downloaded_bytes = 0;
            item.install_progress = 0.0;
        }
        self.recompute_all();
    }

    /// Mark a classification installed: nothing left to do for it.
    pub fn mark_installed(&mut self, classification: Classification) {
        if let Some(item) = self.items.get_mut(&classification) {
            item.install_progress = 1.0;
            item.available = false;
            item.packages.clear();
            item.download_size = 0;
            item.downloaded_bytes = 0;
        }
        self.recompute_all();
    }

    /// Copy release metadata onto a classification's item.
    pub fn set_release_info(
        &mut self,
        classification: Classification,
        version: String,
        change_log: String,
        publish_time: Option<DateTime<FixedOffset>>,
    ) {
        if let Some(item) = self.items.get_mut(&classification) {
            item.version = version;
            item.change_log = change_log;
            item.publish_time = publish_time;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;
    use std::time::Instant;

    fn pkgs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_replaces_and_invalidates() {
        let mut table = JobTable::new();
        let slot = JobSlot::Download(Classification::Safe);
        let now = Instant::now();

        assert!(table.insert(JobHandle::new("/job/1", slot, now)).is_none());
        let old = table.insert(JobHandle::new("/job/2", slot, now)).unwrap();

        assert!(!old.is_valid());
        assert_eq!(old.status(), JobStatus::Removed);
        assert_eq!(table.slot_of("/job/1"), None);
        assert_eq!(table.slot_of("/job/2"), Some(slot));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_active_excludes_terminal_jobs() {
        let mut table = JobTable::new();
        let slot = JobSlot::Install(Classification::System);
        let now = Instant::now();
        table.insert(JobHandle::new("/job/7", slot, now));
        assert!(table.pipeline_active(Classification::System));

        table.get_mut(slot).unwrap().apply_status(JobStatus::Succeeded, now);
        assert!(table.active(slot).is_none());
        assert!(table.get(slot).is_some());
        assert!(!table.pipeline_active(Classification::System));
    }

    #[test]
    fn test_ledger_availability_and_aggregate() {
        let mut ledger = DownloadLedger::new();
        let change = ledger.apply_packages(Classification::System, pkgs(&["a", "b"]), 300);
        assert_eq!(change, LedgerChange::AvailabilityChanged(true));
        ledger.apply_packages(Classification::Safe, pkgs(&["b", "c"]), 100);

        let all = ledger.item(Classification::All).unwrap();
        assert_eq!(all.packages, pkgs(&["a", "b", "c"]));
        assert_eq!(all.download_size, 400);
        assert!(all.available);

        assert_eq!(
            ledger.apply_packages(Classification::System, pkgs(&["a", "b"]), 300),
            LedgerChange::Unchanged
        );
        assert_eq!(
            ledger.apply_packages(Classification::System, Vec::new(), 0),
            LedgerChange::AvailabilityChanged(false)
        );
    }

    #[test]
    fn test_download_progress_tracks_bytes() {
        let mut ledger = DownloadLedger::new();
        ledger.apply_packages(Classification::Unknown, pkgs(&["x"]), 1000);
        ledger.set_download_progress(Classification::Unknown, 0.25);
        assert_eq!(ledger.item(Classification::Unknown).unwrap().downloaded_bytes, 250);
        assert_eq!(ledger.item(Classification::All).unwrap().downloaded_bytes, 250);

        ledger.mark_installed(Classification::Unknown);
        let item = ledger.item(Classification::Unknown).unwrap();
        assert!(!item.available);
        assert!(item.packages.is_empty());
    }
}
