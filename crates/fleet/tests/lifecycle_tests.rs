//! Integration tests for guest actions, stabilization and pending cleanup.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{snapshot, vm, FakeCluster, Fault};
use fleet::{
    ClientError, ClusterClient, MigrateOptions, PendingOperationTracker, QueueSettings,
    StabilizeOutcome, StabilizeSettings, TaskError, TaskQueue, TaskStatus, Vm, VmAction,
    VmOperations, VmStatus,
};

fn tagged(mut guest: Vm) -> Vm {
    guest.source_profile = "lab".to_string();
    guest
}

fn operations(settings: StabilizeSettings) -> VmOperations {
    let tracker = Arc::new(PendingOperationTracker::new());
    let queue = Arc::new(TaskQueue::new(Arc::clone(&tracker), QueueSettings::default()));
    VmOperations::new(queue, tracker, settings)
}

fn quick() -> StabilizeSettings {
    StabilizeSettings {
        poll_interval_secs: 1,
        max_wait_secs: 5,
        ..StabilizeSettings::default()
    }
}

// =============================================================================
// Submit and settle
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_settles_and_clears_pending() {
    let guest = tagged(vm(101, "pve1", VmStatus::Stopped));
    let cluster = FakeCluster::new(snapshot(&["pve1"], vec![guest.clone()]));
    cluster.set_op_delay(Duration::from_millis(200));
    let ops = operations(quick());

    let submission = ops.submit(cluster.clone(), guest.clone(), VmAction::Start).unwrap();
    assert_eq!(
        ops.queue().tracker().is_pending(&guest.target()).as_deref(),
        Some("Starting")
    );

    let outcome = submission.settled().await.unwrap();
    assert!(outcome.is_settled());
    assert!(ops.queue().tracker().is_pending(&guest.target()).is_none());
    assert_eq!(cluster.guest(101).unwrap().status, VmStatus::Running);
    assert_eq!(cluster.calls(), vec!["start:101"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_action_is_rejected_while_settling() {
    let guest = tagged(vm(101, "pve1", VmStatus::Running));
    let cluster = FakeCluster::new(snapshot(&["pve1"], vec![guest.clone()]));
    cluster.set_op_delay(Duration::from_millis(200));
    let ops = operations(quick());

    let submission = ops.submit(cluster.clone(), guest.clone(), VmAction::Shutdown).unwrap();
    let err = ops
        .submit(cluster.clone(), guest.clone(), VmAction::Stop)
        .unwrap_err();
    assert!(err.is_conflict());

    submission.settled().await.unwrap();
    assert_eq!(cluster.calls(), vec!["shutdown:101"]);

    // Free again once settled.
    let guest = cluster.guest(101).map(tagged).unwrap();
    ops.submit(cluster.clone(), guest, VmAction::Start)
        .unwrap()
        .settled()
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_migration_settles_by_polling_target_node() {
    let guest = tagged(vm(300, "pve1", VmStatus::Running));
    let cluster = FakeCluster::new(snapshot(&["pve1", "pve2"], vec![guest.clone()]));
    let ops = operations(quick());

    let action = VmAction::Migrate(MigrateOptions {
        target_node: "pve2".to_string(),
        online: true,
    });
    let outcome = ops
        .submit(cluster.clone(), guest.clone(), action)
        .unwrap()
        .settled()
        .await
        .unwrap();

    assert_eq!(outcome, StabilizeOutcome::Settled { polls: 1 });
    assert_eq!(cluster.guest(300).unwrap().node, "pve2");
    assert!(!ops.queue().tracker().has_any());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_settles_when_guest_is_gone() {
    let guest = tagged(vm(400, "pve1", VmStatus::Stopped));
    let cluster = FakeCluster::new(snapshot(&["pve1"], vec![guest.clone()]));
    let ops = operations(quick());

    let outcome = ops
        .submit(cluster.clone(), guest, VmAction::Delete { force: false })
        .unwrap()
        .settled()
        .await
        .unwrap();

    assert!(outcome.is_settled());
    assert!(cluster.guest(400).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_operation_clears_pending_without_polling() {
    let guest = tagged(vm(101, "pve1", VmStatus::Running));
    let cluster = FakeCluster::new(snapshot(&["pve1"], vec![guest.clone()]));
    cluster.fail_operations(Some(ClientError::Api {
        status: 500,
        message: "VM 101 is locked (backup)".to_string(),
    }));
    let ops = operations(quick());

    let err = ops
        .submit(cluster.clone(), guest.clone(), VmAction::Stop)
        .unwrap()
        .settled()
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::Operation { ref target, .. } if *target == guest.target()));
    assert!(ops.queue().tracker().is_pending(&guest.target()).is_none());
    assert_eq!(cluster.status_polls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsettled_guest_times_out_and_still_clears() {
    let guest = tagged(vm(101, "pve1", VmStatus::Stopped));
    let cluster = FakeCluster::new(snapshot(&["pve1"], vec![guest.clone()]));
    cluster.freeze();
    let ops = operations(StabilizeSettings {
        poll_interval_secs: 2,
        max_wait_secs: 10,
        ..StabilizeSettings::default()
    });

    let outcome = ops
        .submit(cluster.clone(), guest.clone(), VmAction::Start)
        .unwrap()
        .settled()
        .await
        .unwrap();

    assert!(matches!(outcome, StabilizeOutcome::TimedOut { polls } if polls >= 5));
    assert!(ops.queue().tracker().is_pending(&guest.target()).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_status_poll_still_clears_pending() {
    let guest = tagged(vm(101, "pve1", VmStatus::Stopped));
    let cluster = FakeCluster::new(snapshot(&["pve1"], vec![guest.clone()]));
    cluster.set_status_fault(Fault::Panic);
    let ops = operations(quick());

    let err = ops
        .submit(cluster.clone(), guest.clone(), VmAction::Start)
        .unwrap()
        .settled()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TaskError::Panicked { ref target, ref message }
            if *target == guest.target() && message == "status decode bug"
    ));
    assert!(ops.queue().tracker().is_pending(&guest.target()).is_none());

    cluster.set_status_fault(Fault::None);
    let guest = cluster.guest(101).map(tagged).unwrap();
    let outcome = ops
        .submit(cluster.clone(), guest, VmAction::Stop)
        .unwrap()
        .settled()
        .await
        .unwrap();
    assert!(outcome.is_settled());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_status_poll_times_out_at_deadline() {
    let guest = tagged(vm(101, "pve1", VmStatus::Stopped));
    let cluster = FakeCluster::new(snapshot(&["pve1"], vec![guest.clone()]));
    cluster.set_status_fault(Fault::Hang);
    let ops = operations(StabilizeSettings {
        poll_interval_secs: 1,
        max_wait_secs: 2,
        ..StabilizeSettings::default()
    });

    let outcome = ops
        .submit(cluster.clone(), guest.clone(), VmAction::Start)
        .unwrap()
        .settled()
        .await
        .unwrap();

    assert_eq!(outcome, StabilizeOutcome::TimedOut { polls: 1 });
    assert!(ops.queue().tracker().is_pending(&guest.target()).is_none());
}

// =============================================================================
// Remote tasks
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_remote_task_fails_submission() {
    let guest = tagged(vm(300, "pve1", VmStatus::Running));
    let cluster = FakeCluster::new(snapshot(&["pve1", "pve2"], vec![guest.clone()]));
    cluster.fail_remote_tasks("migration aborted: target storage full");
    let ops = operations(quick());

    let action = VmAction::Migrate(MigrateOptions {
        target_node: "pve2".to_string(),
        online: true,
    });
    let err = ops
        .submit(cluster.clone(), guest.clone(), action)
        .unwrap()
        .settled()
        .await
        .unwrap_err();

    match err {
        TaskError::Operation { target, source } => {
            assert_eq!(target, guest.target());
            assert!(matches!(
                source,
                ClientError::TaskFailed { ref exit_status, .. }
                    if exit_status == "migration aborted: target storage full"
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(cluster.status_polls(), 0);
    assert!(ops.queue().tracker().is_pending(&guest.target()).is_none());
    assert_eq!(cluster.guest(300).unwrap().node, "pve1");

    ops.queue().wait_idle().await;
    assert_eq!(ops.queue().history()[0].status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_task_stays_running_until_remote_task_stops() {
    let guest = tagged(vm(101, "pve1", VmStatus::Stopped));
    let cluster = FakeCluster::new(snapshot(&["pve1"], vec![guest.clone()]));
    cluster.set_task_running_polls(2);
    let ops = operations(StabilizeSettings {
        task_poll_interval_secs: 1,
        ..quick()
    });

    let submission = ops.submit(cluster.clone(), guest.clone(), VmAction::Start).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let active = ops.queue().active_task(&guest.target()).unwrap();
    assert_eq!(active.status, TaskStatus::Running);
    assert_eq!(cluster.status_polls(), 0);

    let outcome = submission.settled().await.unwrap();
    assert!(outcome.is_settled());
    assert_eq!(cluster.task_polls(), 3);
}

// =============================================================================
// Batch actions
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_reports_one_summary() {
    let running = tagged(vm(1, "pve1", VmStatus::Running));
    let stopped = tagged(vm(2, "pve1", VmStatus::Stopped));
    let busy = tagged(vm(3, "pve1", VmStatus::Running));
    let mut orphan = tagged(vm(4, "pve1", VmStatus::Running));
    orphan.source_profile = "offline".to_string();

    let cluster = FakeCluster::new(snapshot(
        &["pve1"],
        vec![running.clone(), stopped.clone(), busy.clone()],
    ));
    let ops = operations(quick());
    ops.queue().tracker().set_pending(busy.target(), "Migrating");

    let client: Arc<dyn ClusterClient> = cluster.clone();
    let mut summary = ops.submit_batch(
        vec![running, stopped, busy, orphan],
        &VmAction::Shutdown,
        |guest| (guest.source_profile == "lab").then(|| Arc::clone(&client)),
    );

    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.message("Shutdown"), "Shutdown: 1 submitted, 2 skipped, 1 failed");

    let outcomes = summary.wait_all().await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].1.is_ok());
    assert_eq!(cluster.calls(), vec!["shutdown:1"]);
}

#[test]
fn test_ineligible_actions() {
    let stopped = vm(5, "pve1", VmStatus::Stopped);
    let mut container = vm(6, "pve1", VmStatus::Running);
    container.guest = fleet::GuestType::Lxc;

    assert!(!VmAction::Stop.is_eligible(&stopped));
    assert!(!VmAction::Reset.is_eligible(&container));
    assert!(VmAction::Restart.is_eligible(&container));
}
