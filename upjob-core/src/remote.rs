//! Collaborator boundaries consumed by the orchestrator.
//!
//! The remote package-job service, the update-log service and the free-space
//! lookup are traits so the orchestrator can run against the real services or
//! the in-memory mocks in [`crate::mock`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LogFetchError, RemoteError};
use crate::logcache::UpdateLogEntry;
use crate::types::{Classification, JobCtrl, UpdateErrorType};

/// Result type alias for remote job service calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Properties of a remote job, as read when adopting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Object path of the job
    pub path: String,
    /// Job name, e.g. `prepare_system_upgrade`
    pub id: String,
    /// Raw status string
    pub status: String,
    /// Progress in `[0, 1]`
    pub progress: f64,
    /// Error description for failed jobs
    pub description: String,
}

/// Remote package-job service.
///
/// Creation calls return the new job's path. Status and progress changes are
/// not returned here; they arrive later as events in the orchestrator inbox.
#[async_trait]
pub trait RemoteJobService: Send + Sync {
    // =========================================================================
    // Job creation
    // =========================================================================

    /// Start (or join) a repository refresh. Returns the existing path if one
    /// is already running.
    async fn create_check_job(&self) -> RemoteResult<String>;

    async fn create_download_job(&self, classification: Classification) -> RemoteResult<String>;

    async fn create_install_job(&self, classification: Classification) -> RemoteResult<String>;

    async fn create_fix_error_job(&self, error: UpdateErrorType) -> RemoteResult<String>;

    /// Start the atomic-upgrade pre-backup.
    async fn create_backup_job(&self) -> RemoteResult<String>;

    // =========================================================================
    // Job inspection and control
    // =========================================================================

    async fn list_jobs(&self) -> RemoteResult<Vec<String>>;

    async fn job_info(&self, path: &str) -> RemoteResult<JobInfo>;

    /// Fire-and-forget: the effect shows up as a later status notification.
    async fn control_job(&self, path: &str, ctrl: JobCtrl) -> RemoteResult<()>;

    async fn remove_job(&self, path: &str) -> RemoteResult<()>;

    // =========================================================================
    // Package queries
    // =========================================================================

    /// Updatable packages keyed by install job id (`system_upgrade`, ...).
    async fn classified_updatable_packages(&self) -> RemoteResult<HashMap<String, Vec<String>>>;

    /// Bytes that still need downloading for `packages`.
    async fn packages_download_size(&self, packages: &[String]) -> RemoteResult<u64>;
}

/// Source of version logs shown next to each update.
#[async_trait]
pub trait UpdateLogService: Send + Sync {
    async fn fetch_update_logs(
        &self,
        classification: Classification,
    ) -> std::result::Result<Vec<UpdateLogEntry>, LogFetchError>;
}

/// Free space on the volume that receives downloaded packages.
pub trait FreeSpace: Send + Sync {
    /// `None` when the volume cannot be inspected; the space check is skipped.
    fn available_bytes(&self) -> Option<u64>;
}

/// [`FreeSpace`] backed by the mounted disk list.
pub struct SysinfoFreeSpace {
    path: PathBuf,
}

impl SysinfoFreeSpace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FreeSpace for SysinfoFreeSpace {
    fn available_bytes(&self) -> Option<u64> {
        let disks = sysinfo::Disks::new_with_refreshed_list();

        // Deepest mount point containing the path wins.
        let disk = disks
            .list()
            .iter()
            .filter(|d| self.path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;

        debug!(
            path = %self.path.display(),
            mount = %disk.mount_point().display(),
            available = disk.available_space(),
            "Read free space"
        );
        Some(disk.available_space())
    }
}
