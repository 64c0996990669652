//! Type definitions shared by the registry, the policy gate and the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Partition of the updatable packages.
///
/// `All` is an aggregate view over the concrete classifications and never owns
/// a download or install job of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    System,
    Safe,
    Unknown,
    All,
}

impl Classification {
    /// Classifications that own real jobs, in pipeline order.
    pub const CONCRETE: [Classification; 3] = [
        Classification::System,
        Classification::Safe,
        Classification::Unknown,
    ];

    /// Whether this is the derived `All` view.
    pub fn is_aggregate(self) -> bool {
        self == Classification::All
    }

    /// Remote job id used for this classification's download job.
    pub fn download_job_id(self) -> Option<&'static str> {
        match self {
            Classification::System => Some("prepare_system_upgrade"),
            Classification::Safe => Some("prepare_security_upgrade"),
            Classification::Unknown => Some("prepare_unknown_upgrade"),
            Classification::All => None,
        }
    }

    /// Remote job id used for this classification's install job.
    ///
    /// The same names key the classified-package map.
    pub fn install_job_id(self) -> Option<&'static str> {
        match self {
            Classification::System => Some("system_upgrade"),
            Classification::Safe => Some("security_upgrade"),
            Classification::Unknown => Some("unknown_upgrade"),
            Classification::All => None,
        }
    }

    /// Look up a classification by its key in the classified-package map.
    pub fn from_package_key(key: &str) -> Option<Self> {
        Self::CONCRETE
            .into_iter()
            .find(|c| c.install_job_id() == Some(key))
    }

    /// Bit in the update-mode mask that enables this classification.
    pub fn mode_bit(self) -> u64 {
        match self {
            Classification::System => 1 << 0,
            Classification::Safe => 1 << 2,
            Classification::Unknown => 1 << 3,
            Classification::All => (1 << 0) | (1 << 2) | (1 << 3),
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::System => write!(f, "system"),
            Classification::Safe => write!(f, "safe"),
            Classification::Unknown => write!(f, "unknown"),
            Classification::All => write!(f, "all"),
        }
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Classification::System),
            "safe" | "security" => Ok(Classification::Safe),
            "unknown" => Ok(Classification::Unknown),
            "all" => Ok(Classification::All),
            other => Err(format!(
                "Invalid classification '{}'. Must be system, safe, unknown or all",
                other
            )),
        }
    }
}

/// Bit mask of classifications the user wants updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateMode(pub u64);

impl UpdateMode {
    /// Every concrete classification enabled.
    pub const ALL: UpdateMode = UpdateMode((1 << 0) | (1 << 2) | (1 << 3));

    /// Check whether a classification is enabled.
    pub fn contains(self, classification: Classification) -> bool {
        let bit = classification.mode_bit();
        if classification.is_aggregate() {
            self.0 & bit != 0
        } else {
            self.0 & bit == bit
        }
    }
}

impl Default for UpdateMode {
    fn default() -> Self {
        Self::ALL
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// What a remote job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Check,
    Download,
    Install,
    FixError,
    Backup,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Check => write!(f, "check"),
            JobKind::Download => write!(f, "download"),
            JobKind::Install => write!(f, "install"),
            JobKind::FixError => write!(f, "fix_error"),
            JobKind::Backup => write!(f, "backup"),
        }
    }
}

/// Registry slot a job occupies. At most one handle lives in each slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobSlot {
    Check,
    FixError,
    Backup,
    Download(Classification),
    Install(Classification),
}

impl JobSlot {
    pub const CHECK_JOB_ID: &'static str = "update_source";
    pub const FIX_ERROR_JOB_ID: &'static str = "fix_error";
    pub const BACKUP_JOB_ID: &'static str = "atomic_backup";

    pub fn kind(self) -> JobKind {
        match self {
            JobSlot::Check => JobKind::Check,
            JobSlot::FixError => JobKind::FixError,
            JobSlot::Backup => JobKind::Backup,
            JobSlot::Download(_) => JobKind::Download,
            JobSlot::Install(_) => JobKind::Install,
        }
    }

    pub fn classification(self) -> Option<Classification> {
        match self {
            JobSlot::Download(c) | JobSlot::Install(c) => Some(c),
            _ => None,
        }
    }

    /// Recognize a remote job id. Unrecognized ids are not adopted.
    pub fn from_job_id(id: &str) -> Option<Self> {
        match id {
            Self::CHECK_JOB_ID => return Some(JobSlot::Check),
            Self::FIX_ERROR_JOB_ID => return Some(JobSlot::FixError),
            Self::BACKUP_JOB_ID => return Some(JobSlot::Backup),
            _ => {}
        }

        Classification::CONCRETE.into_iter().find_map(|c| {
            if c.download_job_id() == Some(id) {
                Some(JobSlot::Download(c))
            } else if c.install_job_id() == Some(id) {
                Some(JobSlot::Install(c))
            } else {
                None
            }
        })
    }
}

impl fmt::Display for JobSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.classification() {
            Some(c) => write!(f, "{}/{}", self.kind(), c),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// Observed status of a remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Paused,
    Removed,
}

impl JobStatus {
    /// Map a status string reported by the remote service.
    pub fn from_remote(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "ready" | "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "succeed" | "success" | "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "end" | "removed" => Some(JobStatus::Removed),
            _ => None,
        }
    }

    /// A terminal status never changes again for the same job.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Removed)
    }

    /// Pending, running or paused: the job still holds its slot.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Removed => write!(f, "removed"),
        }
    }
}

/// Control request forwarded to an active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCtrl {
    Pause,
    Resume,
    Cancel,
}

impl fmt::Display for JobCtrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobCtrl::Pause => write!(f, "pause"),
            JobCtrl::Resume => write!(f, "resume"),
            JobCtrl::Cancel => write!(f, "cancel"),
        }
    }
}

impl FromStr for JobCtrl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pause" => Ok(JobCtrl::Pause),
            "resume" | "start" => Ok(JobCtrl::Resume),
            "cancel" | "stop" => Ok(JobCtrl::Cancel),
            other => Err(format!("Invalid job control '{}'", other)),
        }
    }
}

// =============================================================================
// ERRORS AND BACKUP
// =============================================================================

/// Typed cause of a failed remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateErrorType {
    /// Not enough disk space to download or unpack
    DiskSpace,
    /// Mirror unreachable, DNS failure or fetch error
    Network,
    /// Broken or unmet package dependencies
    Dependency,
    /// A previous dpkg run was interrupted
    DpkgInterrupted,
    /// Repository authentication or signature failure
    Auth,
    /// Job made no progress within the watchdog interval
    Timeout,
    /// Atomic-upgrade backup did not complete
    BackupFailed,
    /// Battery too low to start the install
    LowBattery,
    /// Anything not recognized above
    Unknown,
}

impl UpdateErrorType {
    /// Errors a FixError job can repair.
    pub fn is_fixable(self) -> bool {
        matches!(self, UpdateErrorType::DpkgInterrupted | UpdateErrorType::Dependency)
    }

    /// Name the remote service expects when asked to fix this error.
    pub fn remote_name(self) -> &'static str {
        match self {
            UpdateErrorType::DiskSpace => "insufficientSpace",
            UpdateErrorType::Network => "fetchFailed",
            UpdateErrorType::Dependency => "dependenciesBroken",
            UpdateErrorType::DpkgInterrupted => "dpkgInterrupted",
            UpdateErrorType::Auth => "authFailed",
            UpdateErrorType::Timeout => "timeout",
            UpdateErrorType::BackupFailed => "backupFailed",
            UpdateErrorType::LowBattery => "lowBattery",
            UpdateErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for UpdateErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateErrorType::DiskSpace => write!(f, "insufficient disk space"),
            UpdateErrorType::Network => write!(f, "network unreachable"),
            UpdateErrorType::Dependency => write!(f, "dependency conflict"),
            UpdateErrorType::DpkgInterrupted => write!(f, "dpkg interrupted"),
            UpdateErrorType::Auth => write!(f, "authentication failure"),
            UpdateErrorType::Timeout => write!(f, "timed out"),
            UpdateErrorType::BackupFailed => write!(f, "backup failed"),
            UpdateErrorType::LowBattery => write!(f, "battery too low"),
            UpdateErrorType::Unknown => write!(f, "unknown error"),
        }
    }
}

/// State of the atomic-upgrade pre-backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    #[default]
    Idle,
    BackingUp,
    Succeeded,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_conventions_round_trip() {
        for c in Classification::CONCRETE {
            let download = c.download_job_id().unwrap();
            let install = c.install_job_id().unwrap();
            assert_eq!(JobSlot::from_job_id(download), Some(JobSlot::Download(c)));
            assert_eq!(JobSlot::from_job_id(install), Some(JobSlot::Install(c)));
            assert_eq!(Classification::from_package_key(install), Some(c));
        }
        assert_eq!(JobSlot::from_job_id("update_source"), Some(JobSlot::Check));
        assert_eq!(JobSlot::from_job_id("install_foo"), None);
        assert_eq!(Classification::All.download_job_id(), None);
    }

    #[test]
    fn test_remote_status_mapping() {
        assert_eq!(JobStatus::from_remote("ready"), Some(JobStatus::Pending));
        assert_eq!(JobStatus::from_remote("succeed"), Some(JobStatus::Succeeded));
        assert_eq!(JobStatus::from_remote(" Failed "), Some(JobStatus::Failed));
        assert_eq!(JobStatus::from_remote("end"), Some(JobStatus::Removed));
        assert_eq!(JobStatus::from_remote("bogus"), None);
        assert!(JobStatus::Paused.is_active());
        assert!(JobStatus::Removed.is_terminal());
    }

    #[test]
    fn test_update_mode_bits() {
        let only_system = UpdateMode(Classification::System.mode_bit());
        assert!(only_system.contains(Classification::System));
        assert!(!only_system.contains(Classification::Safe));
        assert!(only_system.contains(Classification::All));
        assert!(!UpdateMode(0).contains(Classification::All));
        assert!(UpdateMode::default().contains(Classification::Unknown));
    }

    #[test]
    fn test_classification_parsing() {
        assert_eq!("security".parse::<Classification>(), Ok(Classification::Safe));
        assert_eq!("SYSTEM".parse::<Classification>(), Ok(Classification::System));
        assert!("apps".parse::<Classification>().is_err());
    }
}
