//! Property tests for job-list reconciliation and progress relaying.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use upjob_core::mock::RemoteCall;
use upjob_core::{
    Classification, FixedFreeSpace, JobKind, JobSlot, JobStatus, MockJobService, ModelEvent,
    Orchestrator, OrchestratorConfig, PolicySnapshot, StaticUpdateLogService,
};

const JOB_IDS: &[&str] = &[
    "update_source",
    "prepare_system_upgrade",
    "prepare_security_upgrade",
    "system_upgrade",
    "unknown_upgrade",
    "atomic_backup",
    "not_ours",
];

const STATUSES: &[&str] = &["ready", "running", "paused", "succeed", "failed"];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn orchestrator(
    remote: &MockJobService,
    policy: PolicySnapshot,
) -> (Orchestrator, upjob_core::ModelReceiver) {
    let (orchestrator, _inbox, model) = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(remote.clone()),
        Arc::new(StaticUpdateLogService::default()),
        Arc::new(FixedFreeSpace(None)),
        policy,
    );
    (orchestrator, model)
}

/// Remote jobs as `(id index, status index)` pairs.
fn remote_jobs() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..JOB_IDS.len(), 0..STATUSES.len()), 1..10)
}

/// Job lists as `(membership mask, rotation, duplicates)`.
fn job_lists() -> impl Strategy<Value = Vec<(u32, prop::sample::Index, usize)>> {
    prop::collection::vec((any::<u32>(), any::<prop::sample::Index>(), 0usize..3), 1..6)
}

/// Paths of `pool` selected by `mask`, in pool order.
fn select(pool: &[String], mask: u32) -> Vec<String> {
    pool.iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, p)| p.clone())
        .collect()
}

/// The same list delivered out of order and with repeats.
fn scramble(list: &[String], rotation: &prop::sample::Index, duplicates: usize) -> Vec<String> {
    let mut out = list.to_vec();
    if out.is_empty() {
        return out;
    }
    let len = out.len();
    out.rotate_left(rotation.index(len));
    out.reverse();
    for i in 0..duplicates {
        let extra = out[i % out.len()].clone();
        out.push(extra);
    }
    out
}

/// Listed jobs that may occupy each slot: recognized and still active.
fn candidates(remote: &MockJobService, list: &[String]) -> BTreeMap<JobSlot, Vec<String>> {
    let mut out: BTreeMap<JobSlot, Vec<String>> = BTreeMap::new();
    for path in list {
        let Some(job) = remote.job(path) else { continue };
        let active = JobStatus::from_remote(&job.status).is_some_and(JobStatus::is_active);
        if let (true, Some(slot)) = (active, JobSlot::from_job_id(&job.id)) {
            let paths = out.entry(slot).or_default();
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
    }
    out
}

fn slots(snapshot: &[(JobSlot, String)]) -> Vec<JobSlot> {
    snapshot.iter().map(|(slot, _)| *slot).collect()
}

#[derive(Debug, Clone)]
enum DownloadReport {
    Status(&'static str),
    Progress(f64),
}

fn download_reports() -> impl Strategy<Value = Vec<DownloadReport>> {
    let report = prop_oneof![
        prop::sample::select(vec!["ready", "running", "paused"]).prop_map(DownloadReport::Status),
        prop_oneof![-0.5f64..1.5, Just(1.0), Just(f64::NAN)].prop_map(DownloadReport::Progress),
    ];
    prop::collection::vec(report, 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any ordering of the same paths, duplicates included, ends in the same
    /// registry, and applying the list again changes nothing.
    #[test]
    fn prop_reconciliation_is_order_independent(
        jobs in remote_jobs(),
        shuffle in any::<prop::sample::Index>(),
        duplicates in 0usize..4,
    ) {
        let remote = MockJobService::new();
        let paths: Vec<String> = jobs
            .iter()
            .map(|(id, status)| remote.insert_job(JOB_IDS[*id], STATUSES[*status], 0.0))
            .collect();
        let permuted = scramble(&paths, &shuffle, duplicates);

        let rt = runtime();
        let (a, b, again) = rt.block_on(async {
            let (first, _m1) = orchestrator(&remote, PolicySnapshot::default());
            first.on_job_list_changed(paths.clone()).await;
            let a = first.job_snapshot().await;
            first.on_job_list_changed(permuted.clone()).await;
            let again = first.job_snapshot().await;

            let (second, _m2) = orchestrator(&remote, PolicySnapshot::default());
            second.on_job_list_changed(permuted).await;
            let b = second.job_snapshot().await;
            (a, b, again)
        });

        prop_assert_eq!(&a, &b);
        prop_assert_eq!(&a, &again);

        // Every adopted slot holds a recognized, still-active job.
        for (slot, path) in &a {
            let job = remote.job(path).unwrap();
            prop_assert!(matches!(job.status.as_str(), "ready" | "running" | "paused"));
            prop_assert_eq!(JobSlot::from_job_id(&job.id), Some(*slot));
        }
    }

    /// Through a sequence of job lists where jobs appear, vanish and compete
    /// for slots, the registry ends up tracking exactly the slots a fresh
    /// orchestrator fills from the last list alone, each with a listed
    /// candidate. Delivery order and repeats within each list do not matter.
    #[test]
    fn prop_reconciliation_converges_over_job_list_sequences(
        jobs in remote_jobs(),
        lists in job_lists(),
    ) {
        let remote = MockJobService::new();
        let pool: Vec<String> = jobs
            .iter()
            .map(|(id, status)| remote.insert_job(JOB_IDS[*id], STATUSES[*status], 0.0))
            .collect();

        let rt = runtime();
        let (ordered, scrambled, fresh, last) = rt.block_on(async {
            let (ordered, _m1) = orchestrator(&remote, PolicySnapshot::default());
            let (scrambled, _m2) = orchestrator(&remote, PolicySnapshot::default());
            let mut last = Vec::new();
            for (mask, rotation, duplicates) in &lists {
                let list = select(&pool, *mask);
                ordered.on_job_list_changed(list.clone()).await;
                scrambled
                    .on_job_list_changed(scramble(&list, rotation, *duplicates))
                    .await;
                last = list;
            }

            let (fresh, _m3) = orchestrator(&remote, PolicySnapshot::default());
            fresh.on_job_list_changed(last.clone()).await;
            (
                ordered.job_snapshot().await,
                scrambled.job_snapshot().await,
                fresh.job_snapshot().await,
                last,
            )
        });

        prop_assert_eq!(&ordered, &scrambled);

        let candidates = candidates(&remote, &last);
        prop_assert_eq!(slots(&ordered), candidates.keys().copied().collect::<Vec<_>>());
        prop_assert_eq!(slots(&ordered), slots(&fresh));

        for (slot, path) in &ordered {
            prop_assert!(candidates[slot].contains(path));
        }
        // Without history the smallest listed path claims the slot.
        for (slot, path) in &fresh {
            prop_assert_eq!(Some(path), candidates[slot].iter().min());
        }
        // Uncontested slots agree exactly.
        for ((slot, a), (_, b)) in ordered.iter().zip(&fresh) {
            if candidates[slot].len() == 1 {
                prop_assert_eq!(a, b);
            }
        }
    }

    /// Relayed progress stays in `[0, 1]` and never decreases.
    #[test]
    fn prop_relayed_progress_is_monotonic(
        values in prop::collection::vec(prop_oneof![-1.0f64..2.0, Just(f64::NAN)], 1..40),
    ) {
        let remote = MockJobService::new();
        remote.set_packages("system_upgrade", &["a"]);

        let rt = runtime();
        let relayed = rt.block_on(async {
            let (orchestrator, mut model) = orchestrator(&remote, PolicySnapshot::default());
            orchestrator.init().await.unwrap();
            orchestrator.dist_upgrade(Classification::System).await.unwrap();
            let path = orchestrator
                .job(JobSlot::Download(Classification::System))
                .await
                .unwrap()
                .path()
                .to_string();

            for value in &values {
                orchestrator.on_job_progress_changed(&path, *value).await;
            }

            let mut relayed = Vec::new();
            while let Ok(event) = model.try_recv() {
                if let ModelEvent::ProgressChanged { progress, kind: JobKind::Download, .. } = event {
                    relayed.push(progress);
                }
            }
            relayed
        });

        for pair in relayed.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
        for p in &relayed {
            prop_assert!((0.0..=1.0).contains(p));
        }
    }

    /// No install job is created before its download succeeded, whatever
    /// status and progress reports the download sends first.
    #[test]
    fn prop_install_waits_for_download_success(
        reports in download_reports(),
        outcome in prop::sample::select(vec!["succeed", "failed", "end"]),
    ) {
        let remote = MockJobService::new();
        remote.set_packages("system_upgrade", &["a"]);

        let rt = runtime();
        let (installs_before, installs_after) = rt.block_on(async {
            let (orchestrator, _model) = orchestrator(&remote, PolicySnapshot::default());
            orchestrator.init().await.unwrap();
            orchestrator.dist_upgrade(Classification::System).await.unwrap();
            let path = orchestrator
                .job(JobSlot::Download(Classification::System))
                .await
                .unwrap()
                .path()
                .to_string();

            let mut installs_before = 0;
            for report in &reports {
                match report {
                    DownloadReport::Status(status) => {
                        orchestrator.on_job_status_changed(&path, status, "").await;
                    }
                    DownloadReport::Progress(value) => {
                        orchestrator.on_job_progress_changed(&path, *value).await;
                    }
                }
                installs_before = installs_before.max(count_installs(&remote));
            }
            orchestrator.on_job_status_changed(&path, outcome, "").await;
            (installs_before, count_installs(&remote))
        });

        prop_assert_eq!(installs_before, 0);
        let expected = usize::from(outcome == "succeed");
        prop_assert_eq!(installs_after, expected);
    }
}

fn count_installs(remote: &MockJobService) -> usize {
    remote
        .creations()
        .iter()
        .filter(|c| matches!(c, RemoteCall::CreateInstall(_)))
        .count()
}
