//! In-memory collaborators for testing and development.
//!
//! [`MockJobService`] keeps remote jobs in a map and records every call made
//! against it. In auto-run mode it also drives each created job through
//! running, progress and a final status, pushing the notifications into an
//! attached orchestrator inbox the way the real service would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::{LogFetchError, RemoteError};
use crate::event::{EventSender, OrchestratorEvent};
use crate::logcache::UpdateLogEntry;
use crate::remote::{FreeSpace, JobInfo, RemoteJobService, RemoteResult, UpdateLogService};
use crate::types::{Classification, JobCtrl, JobSlot, JobStatus, UpdateErrorType};

const JOB_PATH_PREFIX: &str = "/org/upjob/jobs/job";

/// A call received by [`MockJobService`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    CreateCheck,
    CreateDownload(Classification),
    CreateInstall(Classification),
    CreateFixError(UpdateErrorType),
    CreateBackup,
    ListJobs,
    JobInfo(String),
    Control(String, JobCtrl),
    Remove(String),
    ClassifiedPackages,
    DownloadSize(Vec<String>),
}

impl RemoteCall {
    /// Whether the call created a job.
    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            RemoteCall::CreateCheck
                | RemoteCall::CreateDownload(_)
                | RemoteCall::CreateInstall(_)
                | RemoteCall::CreateFixError(_)
                | RemoteCall::CreateBackup
        )
    }
}

/// A job held by the mock service.
#[derive(Debug, Clone, PartialEq)]
pub struct MockJob {
    pub id: String,
    pub status: String,
    pub progress: f64,
    pub description: String,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    jobs: BTreeMap<String, MockJob>,
    packages: HashMap<String, Vec<String>>,
    package_size: u64,
    calls: Vec<RemoteCall>,
    /// Job id → failure description reported by auto-run
    failures: HashMap<String, String>,
    reject_next: Option<RemoteError>,
    latency: Duration,
}

struct Inner {
    state: Mutex<MockState>,
    events: Mutex<Option<EventSender>>,
    step: Option<Duration>,
}

impl Inner {
    fn state(&self) -> RemoteResult<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| RemoteError::Unavailable("Lock poisoned".to_string()))
    }

    fn send(&self, event: OrchestratorEvent) {
        let sender = self.events.lock().ok().and_then(|s| s.clone());
        if let Some(sender) = sender {
            if sender.send(event).is_err() {
                debug!("Mock event dropped, inbox closed");
            }
        }
    }

    fn publish_job_list(&self) {
        let paths: Vec<String> = match self.state() {
            Ok(state) => state.jobs.keys().cloned().collect(),
            Err(_) => return,
        };
        self.send(OrchestratorEvent::JobListChanged(paths));
    }

    /// Update a job and notify. Returns false once the job is gone.
    fn update(&self, path: &str, status: Option<&str>, progress: Option<f64>) -> bool {
        {
            let Ok(mut state) = self.state() else {
                return false;
            };
            let Some(job) = state.jobs.get_mut(path) else {
                return false;
            };
            if let Some(status) = status {
                job.status = status.to_string();
            }
            if let Some(progress) = progress {
                job.progress = progress;
            }
        }
        if let Some(progress) = progress {
            self.send(OrchestratorEvent::progress(path, progress));
        }
        if let Some(status) = status {
            self.send(OrchestratorEvent::status(path, status));
        }
        true
    }

    fn job(&self, path: &str) -> Option<MockJob> {
        self.state().ok()?.jobs.get(path).cloned()
    }
}

/// In-memory remote package-job service.
#[derive(Clone)]
pub struct MockJobService {
    inner: Arc<Inner>,
}

impl MockJobService {
    /// Service whose jobs only change when a test says so.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Service that drives every created job to completion, one notification
    /// per `step`. Notifications go to the inbox passed to [`Self::attach`].
    pub fn with_auto_run(step: Duration) -> Self {
        info!(step_ms = step.as_millis() as u64, "Creating auto-running mock job service");
        Self::build(Some(step))
    }

    fn build(step: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MockState {
                    package_size: 1024 * 1024,
                    ..Default::default()
                }),
                events: Mutex::new(None),
                step,
            }),
        }
    }

    /// Deliver job notifications to an orchestrator inbox.
    pub fn attach(&self, inbox: EventSender) {
        if let Ok(mut events) = self.inner.events.lock() {
            *events = Some(inbox);
        }
    }

    // =========================================================================
    // Test controls
    // =========================================================================

    /// Set the packages reported under an install job id.
    pub fn set_packages(&self, key: &str, packages: &[&str]) {
        if let Ok(mut state) = self.inner.state() {
            state
                .packages
                .insert(key.to_string(), packages.iter().map(|p| p.to_string()).collect());
        }
    }

    /// Download size reported per package.
    pub fn set_package_size(&self, bytes: u64) {
        if let Ok(mut state) = self.inner.state() {
            state.package_size = bytes;
        }
    }

    /// Make auto-run fail jobs with this id, reporting `description`.
    pub fn fail_jobs_with_id(&self, id: &str, description: &str) {
        if let Ok(mut state) = self.inner.state() {
            state.failures.insert(id.to_string(), description.to_string());
        }
    }

    /// Delay every call by `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut state) = self.inner.state() {
            state.latency = latency;
        }
    }

    /// Fail the next call with `error`.
    pub fn reject_next(&self, error: RemoteError) {
        if let Ok(mut state) = self.inner.state() {
            state.reject_next = Some(error);
        }
    }

    /// Put a job on the service as if someone else had created it.
    pub fn insert_job(&self, id: &str, status: &str, progress: f64) -> String {
        let Ok(mut state) = self.inner.state() else {
            return String::new();
        };
        let path = next_path(&mut state);
        state.jobs.insert(
            path.clone(),
            MockJob {
                id: id.to_string(),
                status: status.to_string(),
                progress,
                description: String::new(),
            },
        );
        path
    }

    /// Change a stored job's status without notifying anyone.
    pub fn set_job_status(&self, path: &str, status: &str) {
        if let Ok(mut state) = self.inner.state() {
            if let Some(job) = state.jobs.get_mut(path) {
                job.status = status.to_string();
            }
        }
    }

    /// Drop a job without notifying anyone.
    pub fn forget_job(&self, path: &str) {
        if let Ok(mut state) = self.inner.state() {
            state.jobs.remove(path);
        }
    }

    pub fn job(&self, path: &str) -> Option<MockJob> {
        self.inner.job(path)
    }

    pub fn job_paths(&self) -> Vec<String> {
        self.inner
            .state()
            .map(|s| s.jobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Calls received so far, oldest first.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner
            .state()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Calls that created a job.
    pub fn creations(&self) -> Vec<RemoteCall> {
        self.calls().into_iter().filter(RemoteCall::is_creation).collect()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn delay(&self) {
        let latency = self
            .inner
            .state()
            .map(|s| s.latency)
            .unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Record a call, consuming an injected rejection.
    fn record(&self, call: RemoteCall) -> RemoteResult<MutexGuard<'_, MockState>> {
        let mut state = self.inner.state()?;
        state.calls.push(call);
        match state.reject_next.take() {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }

    fn create(&self, call: RemoteCall, id: &str) -> RemoteResult<String> {
        let path = {
            let mut state = self.record(call)?;
            if id == JobSlot::CHECK_JOB_ID {
                let running = state.jobs.iter().find(|(_, job)| {
                    job.id == id
                        && JobStatus::from_remote(&job.status).is_some_and(JobStatus::is_active)
                });
                if let Some((path, _)) = running {
                    return Ok(path.clone());
                }
            }

            let path = next_path(&mut state);
            state.jobs.insert(
                path.clone(),
                MockJob {
                    id: id.to_string(),
                    status: "ready".to_string(),
                    progress: 0.0,
                    description: String::new(),
                },
            );
            path
        };

        debug!(path = %path, id, "Mock job created");
        if let Some(step) = self.inner.step {
            self.inner.publish_job_list();
            tokio::spawn(drive(self.inner.clone(), path.clone(), step));
        }
        Ok(path)
    }
}

impl Default for MockJobService {
    fn default() -> Self {
        Self::new()
    }
}

fn next_path(state: &mut MockState) -> String {
    state.next_id += 1;
    format!("{}{}", JOB_PATH_PREFIX, state.next_id)
}

/// Walk one job through its life the way the remote service reports it.
async fn drive(inner: Arc<Inner>, path: String, step: Duration) {
    tokio::time::sleep(step).await;
    if !inner.update(&path, Some("running"), None) {
        return;
    }

    let mut progress = 0.0;
    while progress < 1.0 {
        tokio::time::sleep(step).await;
        match inner.job(&path) {
            None => return,
            Some(job) if job.status == "paused" => continue,
            Some(_) => {}
        }
        progress = (progress + 0.25_f64).min(1.0);
        if !inner.update(&path, None, Some(progress)) {
            return;
        }
    }

    tokio::time::sleep(step).await;
    let Some(job) = inner.job(&path) else {
        return;
    };
    let failure = inner
        .state()
        .ok()
        .and_then(|s| s.failures.get(&job.id).cloned());

    match failure {
        Some(description) => {
            if let Ok(mut state) = inner.state() {
                if let Some(job) = state.jobs.get_mut(&path) {
                    job.status = "failed".to_string();
                    job.description = description.clone();
                }
            }
            inner.send(OrchestratorEvent::failed(&path, description));
        }
        None => {
            inner.update(&path, Some("succeed"), None);
            // An installed class has nothing left to offer.
            if let Ok(mut state) = inner.state() {
                state.packages.remove(&job.id);
            }
        }
    }

    tokio::time::sleep(step).await;
    let removed = inner
        .state()
        .map(|mut s| s.jobs.remove(&path).is_some())
        .unwrap_or(false);
    if removed {
        inner.send(OrchestratorEvent::status(&path, "end"));
        inner.publish_job_list();
    }
}

#[async_trait]
impl RemoteJobService for MockJobService {
    #[instrument(skip(self))]
    async fn create_check_job(&self) -> RemoteResult<String> {
        self.delay().await;
        self.create(RemoteCall::CreateCheck, JobSlot::CHECK_JOB_ID)
    }

    async fn create_download_job(&self, classification: Classification) -> RemoteResult<String> {
        self.delay().await;
        let id = classification.download_job_id().ok_or_else(|| {
            RemoteError::Rejected(format!("no download job for {}", classification))
        })?;
        self.create(RemoteCall::CreateDownload(classification), id)
    }

    async fn create_install_job(&self, classification: Classification) -> RemoteResult<String> {
        self.delay().await;
        let id = classification.install_job_id().ok_or_else(|| {
            RemoteError::Rejected(format!("no install job for {}", classification))
        })?;
        self.create(RemoteCall::CreateInstall(classification), id)
    }

    async fn create_fix_error_job(&self, error: UpdateErrorType) -> RemoteResult<String> {
        self.delay().await;
        self.create(RemoteCall::CreateFixError(error), JobSlot::FIX_ERROR_JOB_ID)
    }

    async fn create_backup_job(&self) -> RemoteResult<String> {
        self.delay().await;
        self.create(RemoteCall::CreateBackup, JobSlot::BACKUP_JOB_ID)
    }

    async fn list_jobs(&self) -> RemoteResult<Vec<String>> {
        self.delay().await;
        let state = self.record(RemoteCall::ListJobs)?;
        Ok(state.jobs.keys().cloned().collect())
    }

    async fn job_info(&self, path: &str) -> RemoteResult<JobInfo> {
        self.delay().await;
        let state = self.record(RemoteCall::JobInfo(path.to_string()))?;
        let job = state
            .jobs
            .get(path)
            .ok_or_else(|| RemoteError::JobNotFound(path.to_string()))?;
        Ok(JobInfo {
            path: path.to_string(),
            id: job.id.clone(),
            status: job.status.clone(),
            progress: job.progress,
            description: job.description.clone(),
        })
    }

    #[instrument(skip(self))]
    async fn control_job(&self, path: &str, ctrl: JobCtrl) -> RemoteResult<()> {
        self.delay().await;
        let status = {
            let mut state = self.record(RemoteCall::Control(path.to_string(), ctrl))?;
            if !state.jobs.contains_key(path) {
                return Err(RemoteError::JobNotFound(path.to_string()));
            }
            match ctrl {
                JobCtrl::Pause => "paused",
                JobCtrl::Resume => "running",
                JobCtrl::Cancel => {
                    state.jobs.remove(path);
                    "end"
                }
            }
        };

        if ctrl != JobCtrl::Cancel {
            self.set_job_status(path, status);
        }
        if self.inner.step.is_some() {
            self.inner.send(OrchestratorEvent::status(path, status));
            if ctrl == JobCtrl::Cancel {
                self.inner.publish_job_list();
            }
        }
        Ok(())
    }

    async fn remove_job(&self, path: &str) -> RemoteResult<()> {
        self.delay().await;
        let mut state = self.record(RemoteCall::Remove(path.to_string()))?;
        state
            .jobs
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| RemoteError::JobNotFound(path.to_string()))
    }

    async fn classified_updatable_packages(&self) -> RemoteResult<HashMap<String, Vec<String>>> {
        self.delay().await;
        let state = self.record(RemoteCall::ClassifiedPackages)?;
        Ok(state.packages.clone())
    }

    async fn packages_download_size(&self, packages: &[String]) -> RemoteResult<u64> {
        self.delay().await;
        let state = self.record(RemoteCall::DownloadSize(packages.to_vec()))?;
        Ok(state.package_size * packages.len() as u64)
    }
}

/// Update-log service serving a fixed list of entries.
#[derive(Debug, Default, Clone)]
pub struct StaticUpdateLogService {
    entries: Vec<UpdateLogEntry>,
    failure: Option<String>,
}

impl StaticUpdateLogService {
    pub fn new(entries: Vec<UpdateLogEntry>) -> Self {
        Self { entries, failure: None }
    }

    /// Service whose every fetch fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            failure: Some(message.into()),
        }
    }
}

#[async_trait]
impl UpdateLogService for StaticUpdateLogService {
    async fn fetch_update_logs(
        &self,
        classification: Classification,
    ) -> Result<Vec<UpdateLogEntry>, LogFetchError> {
        if let Some(message) = &self.failure {
            return Err(LogFetchError::Transport(message.clone()));
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| e.classification() == Some(classification))
            .cloned()
            .collect())
    }
}

/// Reports a fixed amount of free space.
#[derive(Debug, Clone, Copy)]
pub struct FixedFreeSpace(pub Option<u64>);

impl FreeSpace for FixedFreeSpace {
    fn available_bytes(&self) -> Option<u64> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;

    #[tokio::test]
    async fn test_running_check_job_is_joined() {
        let service = MockJobService::new();
        let first = service.create_check_job().await.unwrap();
        let second = service.create_check_job().await.unwrap();
        assert_eq!(first, second);

        service.set_job_status(&first, "succeed");
        let third = service.create_check_job().await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_control_and_remove() {
        let service = MockJobService::new();
        let path = service.create_download_job(Classification::System).await.unwrap();

        service.control_job(&path, JobCtrl::Pause).await.unwrap();
        assert_eq!(service.job(&path).unwrap().status, "paused");

        service.remove_job(&path).await.unwrap();
        assert!(matches!(
            service.job_info(&path).await,
            Err(RemoteError::JobNotFound(_))
        ));
        assert!(service.create_download_job(Classification::All).await.is_err());
    }

    #[tokio::test]
    async fn test_rejection_is_consumed_once() {
        let service = MockJobService::new();
        service.reject_next(RemoteError::Unavailable("down".into()));
        assert!(service.list_jobs().await.is_err());
        assert!(service.list_jobs().await.is_ok());
        assert_eq!(service.calls(), vec![RemoteCall::ListJobs, RemoteCall::ListJobs]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_run_reports_success() {
        let service = MockJobService::with_auto_run(Duration::from_millis(10));
        let (tx, mut rx) = event::inbox();
        service.attach(tx);
        service.set_packages("system_upgrade", &["base-files"]);

        let path = service.create_install_job(Classification::System).await.unwrap();

        let mut statuses = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let OrchestratorEvent::StatusChanged { path: p, status, .. } = ev {
                assert_eq!(p, path);
                let done = status == "end";
                statuses.push(status);
                if done {
                    break;
                }
            }
        }
        assert_eq!(statuses, vec!["running", "succeed", "end"]);
        assert!(service.job_paths().is_empty());
        assert!(service.classified_updatable_packages().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_run_reports_failure() {
        let service = MockJobService::with_auto_run(Duration::from_millis(10));
        let (tx, mut rx) = event::inbox();
        service.attach(tx);
        service.fail_jobs_with_id("prepare_security_upgrade", "E: No space left on device");

        service.create_download_job(Classification::Safe).await.unwrap();

        let description = loop {
            match rx.recv().await {
                Some(OrchestratorEvent::StatusChanged { status, description, .. })
                    if status == "failed" =>
                {
                    break description
                }
                Some(_) => continue,
                None => panic!("inbox closed"),
            }
        };
        assert!(description.contains("No space left"));
    }
}
