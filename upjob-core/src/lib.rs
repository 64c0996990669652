//! # upjob core
//!
//! Update-job orchestration over a remote package-job service.
//!
//! Pending updates are split in three concrete classifications (system,
//! security, unknown) plus the derived `All` view. Each classification runs
//! its own check → download → install pipeline as remote jobs:
//!
//! ```text
//!          ┌────────────────────────────────────┐
//!          │            Orchestrator            │
//!          │  commands · handlers · reconcile   │
//!          └───────┬───────────────┬────────────┘
//!                  │               │
//!     ┌────────────▼──┐      ┌─────▼──────────┐
//!     │   JobTable    │      │ DownloadLedger │
//!     │ slots, intent │      │ packages, size │
//!     └───────────────┘      └────────────────┘
//!                  │
//!     ┌────────────▼─────────────────────────┐
//!     │ RemoteJobService (trait)             │
//!     │   MockJobService / real service      │
//!     └──────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use upjob_core::{
//!     Classification, FixedFreeSpace, MockJobService, Orchestrator, OrchestratorConfig,
//!     PolicySnapshot, StaticUpdateLogService,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let remote = MockJobService::new();
//!     let (orchestrator, inbox, mut model) = Orchestrator::new(
//!         OrchestratorConfig::default(),
//!         Arc::new(remote),
//!         Arc::new(StaticUpdateLogService::default()),
//!         Arc::new(FixedFreeSpace(None)),
//!         PolicySnapshot::default(),
//!     );
//!
//!     orchestrator.init().await.unwrap();
//!     orchestrator.check_for_updates().await.unwrap();
//! }
//! ```

pub mod classify;
pub mod error;
pub mod event;
pub mod job;
pub mod logcache;
pub mod mock;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod remote;
pub mod status;
pub mod types;

pub use classify::analyze_job_error_message;
pub use error::{LogFetchError, OrchestratorError, PolicyDenial, PreconditionError, RemoteError};
pub use event::{EventReceiver, EventSender, OrchestratorEvent};
pub use job::JobHandle;
pub use logcache::{parse_update_logs, UpdateLogCache, UpdateLogEntry};
pub use mock::{FixedFreeSpace, MockJobService, RemoteCall, StaticUpdateLogService};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use policy::PolicySnapshot;
pub use registry::UpdateItem;
pub use remote::{FreeSpace, JobInfo, RemoteJobService, SysinfoFreeSpace, UpdateLogService};
pub use status::{CheckStatus, ModelEvent, ModelReceiver, UpdateStatus};
pub use types::{
    BackupStatus, Classification, JobCtrl, JobKind, JobSlot, JobStatus, UpdateErrorType,
    UpdateMode,
};
