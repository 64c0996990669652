//! # Update-job orchestrator
//!
//! Drives the check → download → install pipelines of the three concrete
//! classifications over the remote package-job service.
//!
//! ## Architecture
//!
//! ```text
//!  presentation / CLI                      remote job service
//!         │ commands                              │ notifications
//!         ▼                                       ▼
//! ┌─────────────────────┐   inbox    ┌──────────────────────────┐
//! │ Orchestrator        │◄───────────┤ OrchestratorEvent channel │
//! │  commands.rs        │            └──────────────────────────┘
//! │  handlers.rs        │
//! │  reconcile.rs       │──► ModelEvent channel ──► presentation
//! └──┬──────────┬───────┘
//!    │ jobs     │ ledger          (two independent locks,
//!    ▼          ▼                  jobs is taken first)
//! JobTable   DownloadLedger
//! ```
//!
//! Commands run on the caller's task and return precondition failures
//! directly. Everything asynchronous goes through the inbox and is applied in
//! arrival order by [`Orchestrator::run`].

mod commands;
mod handlers;
mod reconcile;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

use crate::event::{self, EventReceiver, EventSender, OrchestratorEvent};
use crate::job::JobHandle;
use crate::logcache::{UpdateLogCache, UpdateLogEntry, LOCALE_EN_US};
use crate::policy::{PolicySnapshot, PolicyStore};
use crate::registry::{DownloadLedger, JobTable, UpdateItem};
use crate::remote::{FreeSpace, RemoteJobService, UpdateLogService};
use crate::status::{ModelEvent, ModelReceiver, ModelSender};
use crate::types::{BackupStatus, Classification, JobSlot};

/// Default time a job may stay silent before it is failed.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default minimum progress delta relayed to the presentation model.
pub const DEFAULT_PROGRESS_DEBOUNCE: f64 = 0.01;

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Silence after which an active job is treated as Failed(timeout)
    pub watchdog_interval: Duration,
    /// Minimum progress increase relayed to the presentation model
    pub progress_debounce: f64,
    /// Preferred locale for change logs
    pub locale: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            progress_debounce: DEFAULT_PROGRESS_DEBOUNCE,
            locale: LOCALE_EN_US.to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// How often the run loop checks for silent jobs.
    pub fn watchdog_tick(&self) -> Duration {
        (self.watchdog_interval / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// The update-job orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    remote: Arc<dyn RemoteJobService>,
    log_service: Arc<dyn UpdateLogService>,
    space: Arc<dyn FreeSpace>,
    jobs: Mutex<JobTable>,
    ledger: Mutex<DownloadLedger>,
    logs: RwLock<UpdateLogCache>,
    policy: PolicyStore,
    init_gate: Mutex<()>,
    inbox: EventSender,
    model: ModelSender,
}

impl Orchestrator {
    /// Create an orchestrator.
    ///
    /// Returns the orchestrator, the receiving end of its inbox (hand it to
    /// [`Orchestrator::run`]) and the presentation event stream.
    pub fn new(
        config: OrchestratorConfig,
        remote: Arc<dyn RemoteJobService>,
        log_service: Arc<dyn UpdateLogService>,
        space: Arc<dyn FreeSpace>,
        policy: PolicySnapshot,
    ) -> (Self, EventReceiver, ModelReceiver) {
        let (inbox, inbox_rx) = event::inbox();
        let (model, model_rx) = tokio::sync::mpsc::unbounded_channel();

        let orchestrator = Self {
            config,
            remote,
            log_service,
            space,
            jobs: Mutex::new(JobTable::new()),
            ledger: Mutex::new(DownloadLedger::new()),
            logs: RwLock::new(UpdateLogCache::new()),
            policy: PolicyStore::new(policy),
            init_gate: Mutex::new(()),
            inbox,
            model,
        };
        (orchestrator, inbox_rx, model_rx)
    }

    /// Sender for the inbox. Remote notification sources push into this.
    pub fn inbox(&self) -> EventSender {
        self.inbox.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Apply inbox events in arrival order and run the watchdog until the
    /// inbox closes or a `Shutdown` event arrives.
    #[instrument(skip(self, inbox))]
    pub async fn run(&self, mut inbox: EventReceiver) {
        let mut ticker = tokio::time::interval(self.config.watchdog_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        info!(
            watchdog_secs = self.config.watchdog_interval.as_secs(),
            "Orchestrator event loop started"
        );

        loop {
            tokio::select! {
                event = inbox.recv() => match event {
                    None | Some(OrchestratorEvent::Shutdown) => break,
                    Some(event) => self.handle_event(event).await,
                },
                _ = ticker.tick() => {
                    self.check_timeouts().await;
                }
            }
        }

        info!("Orchestrator event loop stopped");
    }

    /// Apply one inbox event.
    pub async fn handle_event(&self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::JobListChanged(paths) => self.on_job_list_changed(paths).await,
            OrchestratorEvent::StatusChanged { path, status, description } => {
                self.on_job_status_changed(&path, &status, &description).await
            }
            OrchestratorEvent::ProgressChanged { path, value } => {
                self.on_job_progress_changed(&path, value).await
            }
            OrchestratorEvent::PackagesChanged(packages) => {
                self.on_classified_updatable_packages_changed(packages).await;
            }
            OrchestratorEvent::LogsReceived { classification, result } => {
                self.on_update_logs_received(classification, result).await
            }
            OrchestratorEvent::WatchdogTick => {
                self.check_timeouts().await;
            }
            OrchestratorEvent::Shutdown => {}
        }
    }

    // =========================================================================
    // Read access
    // =========================================================================

    /// Copy of a classification's update item.
    pub async fn update_item(&self, classification: Classification) -> Option<UpdateItem> {
        self.ledger.lock().await.item(classification).cloned()
    }

    /// Copy of the handle in `slot`, if the slot is occupied.
    pub async fn job(&self, slot: JobSlot) -> Option<JobHandle> {
        self.jobs.lock().await.get(slot).cloned()
    }

    /// Sorted `(slot, path)` pairs of every tracked job.
    pub async fn job_snapshot(&self) -> Vec<(JobSlot, String)> {
        self.jobs.lock().await.snapshot()
    }

    pub async fn backup_status(&self) -> BackupStatus {
        self.jobs.lock().await.backup().status
    }

    /// Newest cached version log for a classification.
    pub async fn latest_update_log(&self, classification: Classification) -> Option<UpdateLogEntry> {
        self.logs.read().await.latest(classification).cloned()
    }

    /// Policy snapshot the next decision will use.
    pub fn policy(&self) -> Arc<PolicySnapshot> {
        self.policy.snapshot()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn emit(&self, event: ModelEvent) {
        if self.model.send(event).is_err() {
            debug!("Presentation model receiver dropped, event discarded");
        }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}
