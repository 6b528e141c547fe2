//! Integration tests for the container lifecycle manager.
//!
//! Runs against the in-memory runtime in `common`, so no container engine
//! is needed.

mod common;

use common::{Harness, IMAGE};
use forgerun::{
    ContainerRuntime, ContainerStatus, CreateOutcome, Error, ImageRef, ProjectStatus,
    RejectReason,
};

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_starts_container_and_enters_wait() {
    let h = Harness::new(8, 1);

    let outcome = h.lifecycle.create(h.request(7, 2, 1)).await.unwrap();
    let CreateOutcome::Created(handle) = outcome else {
        panic!("expected Created");
    };

    assert_eq!(handle.name, "project_7");
    assert_eq!(handle.image, IMAGE);
    assert_eq!(
        h.runtime.container_id("project_7").as_deref(),
        Some(handle.container_id.as_str())
    );
    assert_eq!(h.lifecycle.status(7).await.unwrap(), ContainerStatus::Running);
    assert_eq!(h.lifecycle.project_status(7), ProjectStatus::Wait);
    assert_eq!(h.store.status(7), Some(ProjectStatus::Wait));

    let snap = h.ledger.snapshot();
    assert_eq!((snap.cpu_used, snap.gpu_used), (2, 1));
}

#[tokio::test]
async fn test_create_publishes_host_port() {
    let h = Harness::new(8, 1);
    let mut request = h.request(3, 1, 0);
    request.host_port = Some(18080);

    assert!(h.lifecycle.create(request).await.unwrap().is_created());
    assert_eq!(h.runtime.host_port("project_3"), Some(18080));
}

#[tokio::test]
async fn test_rejection_reports_every_reason_and_touches_nothing() {
    let h = Harness::new(2, 0);
    let mut request = h.request(1, 4, 1);
    request.image = ImageRef::parse("missing:v1").unwrap();

    let outcome = h.lifecycle.create(request).await.unwrap();
    let CreateOutcome::Rejected(reasons) = outcome else {
        panic!("expected Rejected");
    };

    assert_eq!(
        reasons,
        vec![
            RejectReason::GpuInsufficient {
                requested: 1,
                available: 0
            },
            RejectReason::CpuInsufficient {
                requested: 4,
                available: 2
            },
            RejectReason::ImageMissing {
                image: "missing:v1".to_string()
            },
        ]
    );
    assert!(h.runtime.created().is_empty());
    assert_eq!(h.ledger.snapshot().cpu_used, 0);
    assert_eq!(h.lifecycle.project_status(1), ProjectStatus::Init);
}

#[tokio::test]
async fn test_second_project_rejected_when_capacity_taken() {
    let h = Harness::new(2, 1);
    assert!(h.lifecycle.create(h.request(1, 2, 1)).await.unwrap().is_created());

    let outcome = h.lifecycle.create(h.request(2, 1, 0)).await.unwrap();
    assert!(!outcome.is_created());
    assert_eq!(h.runtime.live(), vec!["project_1"]);

    h.lifecycle.stop(1).await.unwrap();
    assert!(h.lifecycle.create(h.request(2, 1, 0)).await.unwrap().is_created());
}

#[tokio::test]
async fn test_create_again_supersedes_previous_container() {
    let h = Harness::new(4, 1);
    assert!(h.lifecycle.create(h.request(5, 3, 1)).await.unwrap().is_created());
    let first_id = h.runtime.container_id("project_5").unwrap();

    // 3 CPU are already held by this project; the new 4 CPU request fits
    // only because the old reservation is credited.
    assert!(h.lifecycle.create(h.request(5, 4, 1)).await.unwrap().is_created());
    let second_id = h.runtime.container_id("project_5").unwrap();

    assert_ne!(first_id, second_id);
    assert_eq!(h.runtime.live(), vec!["project_5"]);
    assert_eq!(h.runtime.removed(), vec!["project_5"]);
    let snap = h.ledger.snapshot();
    assert_eq!((snap.cpu_used, snap.gpu_used), (4, 1));
    assert_eq!(h.lifecycle.handles().len(), 1);
}

#[tokio::test]
async fn test_failed_supersede_keeps_previous_container_accounted() {
    let h = Harness::new(2, 0);
    assert!(h.lifecycle.create(h.request(1, 2, 0)).await.unwrap().is_created());
    let first_id = h.runtime.container_id("project_1").unwrap();
    h.runtime.fail_next_remove();

    let err = h.lifecycle.create(h.request(1, 2, 0)).await.unwrap_err();
    assert!(matches!(err, Error::DeleteFailed { .. }));

    assert_eq!(h.runtime.live(), vec!["project_1"]);
    let handle = h.lifecycle.handle(1).expect("previous handle kept");
    assert_eq!(handle.container_id, first_id);
    assert_eq!(h.ledger.snapshot().cpu_used, 2);
    assert_eq!(h.lifecycle.project_status(1), ProjectStatus::Wait);

    // The surviving container still holds the capacity.
    assert!(!h.lifecycle.create(h.request(2, 2, 0)).await.unwrap().is_created());
    assert_eq!(h.runtime.live(), vec!["project_1"]);
}

#[tokio::test]
async fn test_smaller_supersede_frees_surplus_after_teardown() {
    let h = Harness::new(4, 0);
    assert!(h.lifecycle.create(h.request(5, 3, 0)).await.unwrap().is_created());
    assert!(h.lifecycle.create(h.request(5, 1, 0)).await.unwrap().is_created());

    assert_eq!(h.ledger.snapshot().cpu_used, 1);
    assert_eq!(h.lifecycle.handle(5).unwrap().reservation.cpu, 1);
    assert!(h.lifecycle.create(h.request(6, 3, 0)).await.unwrap().is_created());
}

#[tokio::test]
async fn test_create_recovers_stale_container() {
    let h = Harness::new(4, 0);
    h.runtime.inject_container("project_9", ContainerStatus::Exited);

    assert!(h.lifecycle.create(h.request(9, 1, 0)).await.unwrap().is_created());

    assert_eq!(h.runtime.removed(), vec!["project_9"]);
    assert!(h.runtime.container_id("project_9").unwrap().starts_with('c'));
}

#[tokio::test]
async fn test_create_rolls_back_on_start_failure() {
    let h = Harness::new(4, 1);
    h.runtime.fail_next_start();

    let err = h.lifecycle.create(h.request(2, 2, 1)).await.unwrap_err();
    assert!(matches!(err, Error::StartFailed { .. }));

    assert!(h.runtime.live().is_empty());
    assert!(h.lifecycle.handle(2).is_none());
    let snap = h.ledger.snapshot();
    assert_eq!((snap.cpu_used, snap.gpu_used), (0, 0));
}

#[tokio::test]
async fn test_supersede_with_failed_start_leaves_project_stopped() {
    let h = Harness::new(4, 0);
    assert!(h.lifecycle.create(h.request(3, 2, 0)).await.unwrap().is_created());
    h.runtime.fail_next_start();

    let err = h.lifecycle.create(h.request(3, 2, 0)).await.unwrap_err();
    assert!(matches!(err, Error::StartFailed { .. }));

    assert!(h.runtime.live().is_empty());
    assert!(h.lifecycle.handle(3).is_none());
    assert_eq!(h.ledger.snapshot().cpu_used, 0);
    assert_eq!(h.lifecycle.project_status(3), ProjectStatus::Stopped);
}

#[tokio::test]
async fn test_create_failure_releases_reservation() {
    let h = Harness::new(4, 0);
    h.runtime.fail_next_create();

    assert!(h.lifecycle.create(h.request(2, 4, 0)).await.is_err());
    assert_eq!(h.ledger.snapshot().cpu_used, 0);
    assert!(h.lifecycle.create(h.request(2, 4, 0)).await.unwrap().is_created());
}

#[tokio::test]
async fn test_concurrent_creates_leave_one_container() {
    let h = Harness::new(16, 0);
    let a = h.lifecycle.create(h.request(4, 2, 0));
    let b = h.lifecycle.create(h.request(4, 2, 0));
    let (a, b) = tokio::join!(a, b);
    assert!(a.unwrap().is_created());
    assert!(b.unwrap().is_created());

    assert_eq!(h.runtime.live(), vec!["project_4"]);
    assert_eq!(h.ledger.snapshot().cpu_used, 2);
}

// =============================================================================
// Stop and status
// =============================================================================

#[tokio::test]
async fn test_stop_releases_and_is_idempotent() {
    let h = Harness::new(4, 1);
    h.create(6).await;

    h.lifecycle.stop(6).await.unwrap();
    assert!(h.runtime.live().is_empty());
    assert_eq!(h.lifecycle.project_status(6), ProjectStatus::Stopped);
    assert_eq!(h.ledger.snapshot().cpu_used, 0);

    h.lifecycle.stop(6).await.unwrap();
    assert_eq!(h.lifecycle.project_status(6), ProjectStatus::Stopped);
    assert_eq!(h.ledger.snapshot().cpu_used, 0);
}

#[tokio::test]
async fn test_stop_tolerates_container_removed_externally() {
    let h = Harness::new(4, 0);
    h.create(8).await;
    h.runtime.remove("project_8", true).await.unwrap();

    h.lifecycle.stop(8).await.unwrap();
    assert_eq!(h.lifecycle.project_status(8), ProjectStatus::Stopped);
    assert_eq!(h.ledger.snapshot().cpu_used, 0);
}

#[tokio::test]
async fn test_stop_unknown_project_removes_leftover_by_name() {
    let h = Harness::new(4, 0);
    h.runtime.inject_container("project_11", ContainerStatus::Running);

    h.lifecycle.stop(11).await.unwrap();
    assert!(h.runtime.live().is_empty());
}

#[tokio::test]
async fn test_status_unknown_without_container() {
    let h = Harness::new(4, 0);
    assert_eq!(h.lifecycle.status(42).await.unwrap(), ContainerStatus::Unknown);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let h = Harness::new(4, 0);
    h.create(1).await;
    h.lifecycle.stop(1).await.unwrap();
    h.create(1).await;
    assert_eq!(h.lifecycle.project_status(1), ProjectStatus::Wait);
    assert_eq!(
        h.store.history(1),
        vec![ProjectStatus::Wait, ProjectStatus::Stopped, ProjectStatus::Wait]
    );
}

// =============================================================================
// Orphans
// =============================================================================

#[tokio::test]
async fn test_sweep_removes_only_untracked_project_containers() {
    let h = Harness::new(4, 0);
    h.create(1).await;
    h.runtime.inject_container("project_2", ContainerStatus::Running);
    h.runtime.inject_container("project_3", ContainerStatus::Exited);
    h.runtime.inject_container("postgres", ContainerStatus::Running);

    let removed = h.lifecycle.sweep_orphans().await.unwrap();

    assert_eq!(removed, vec!["project_2", "project_3"]);
    assert_eq!(h.runtime.live(), vec!["postgres", "project_1"]);
}

#[tokio::test]
async fn test_sweep_leaves_padded_names_alone() {
    let h = Harness::new(4, 0);
    h.runtime.inject_container("project_007", ContainerStatus::Running);
    h.runtime.inject_container("project_8", ContainerStatus::Running);

    let removed = h.lifecycle.sweep_orphans().await.unwrap();

    assert_eq!(removed, vec!["project_8"]);
    assert_eq!(h.runtime.removed(), vec!["project_8"]);
    assert_eq!(h.runtime.live(), vec!["project_007"]);
}
