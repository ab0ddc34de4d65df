//! Integration tests for the expiry and stuck-error sweeps.

use std::time::Duration;

use chrono::Utc;
use lab_core::{Lab, LabStatus, ServiceKind};
use lab_orchestrator::test_utils::TestHarness;
use lab_orchestrator::{start_sweeper_task, LabRepository, OrchestratorSettings, SweepReport};
use tokio_util::sync::CancellationToken;

async fn harness_with_template() -> TestHarness {
    let harness = TestHarness::new();
    harness
        .add_service("cfg-a", harness.service("openstack", ServiceKind::OpenstackProject))
        .await;
    harness.add_template("t", &["cfg-a"]);
    harness
}

#[tokio::test]
async fn test_sweep_expires_labs_past_their_end() {
    let harness = harness_with_template().await;
    let lab = harness.provision("t").await;
    assert!(harness.manager.get_progress(&lab.id).is_some());

    // Not yet due
    let report = harness.manager.sweep_expired(lab.ends_at).await;
    assert_eq!(report, SweepReport::default());

    let report = harness
        .manager
        .sweep_expired(lab.ends_at + chrono::Duration::seconds(1))
        .await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 0);
    let lab = harness.manager.get_lab(&lab.id).await.unwrap();
    assert_eq!(lab.status, LabStatus::Expired);
    assert!(harness.manager.get_progress(&lab.id).is_none());
    assert_eq!(harness.calls.cleanups(), vec!["openstack"]);

    // Expired labs are not picked up again
    let again = harness
        .manager
        .sweep_expired(lab.ends_at + chrono::Duration::seconds(2))
        .await;
    assert_eq!(again.expired, 0);
}

#[tokio::test]
async fn test_sweep_deletes_labs_stuck_in_error() {
    let harness = harness_with_template().await;

    let mut stuck = Lab::new("stuck", "alice", Some("t".into()), chrono::Duration::hours(4));
    stuck.status = LabStatus::Error;
    stuck.used_services = vec!["cfg-a".to_string()];
    stuck.updated_at = Utc::now() - chrono::Duration::hours(2);
    harness.repository.create_lab(&stuck).await.unwrap();

    let mut recent = Lab::new("recent", "alice", Some("t".into()), chrono::Duration::hours(4));
    recent.status = LabStatus::Error;
    harness.repository.create_lab(&recent).await.unwrap();

    let report = harness.manager.sweep_stuck_errors(Utc::now()).await;

    assert_eq!(report.deleted, 1);
    assert!(harness
        .repository
        .get_lab_by_id(&stuck.id)
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(
        harness.repository.get_lab_by_id(&recent.id).await.unwrap().status,
        LabStatus::Error
    );
    assert_eq!(harness.calls.cleanups(), vec!["openstack"]);
}

#[tokio::test]
async fn test_stuck_error_lab_past_end_is_deleted_not_expired() {
    let harness = harness_with_template().await;

    let mut lab = Lab::new("old", "alice", Some("t".into()), chrono::Duration::hours(1));
    lab.status = LabStatus::Error;
    lab.used_services = vec!["cfg-a".to_string()];
    lab.started_at = Utc::now() - chrono::Duration::hours(3);
    lab.ends_at = Utc::now() - chrono::Duration::hours(2);
    lab.updated_at = Utc::now() - chrono::Duration::hours(2);
    harness.repository.create_lab(&lab).await.unwrap();

    let report = harness.manager.run_sweep().await;

    assert_eq!(report.deleted, 1);
    assert_eq!(report.expired, 0);
    assert!(harness.manager.get_lab(&lab.id).await.is_err());
    // Cleaned once, by the deletion
    assert_eq!(harness.calls.cleanups(), vec!["openstack"]);
}

#[tokio::test]
async fn test_recently_failed_lab_past_end_waits_for_stuck_sweep() {
    let harness = harness_with_template().await;

    let mut lab = Lab::new("failed", "alice", Some("t".into()), chrono::Duration::hours(1));
    lab.status = LabStatus::Error;
    lab.used_services = vec!["cfg-a".to_string()];
    lab.updated_at = Utc::now() - chrono::Duration::minutes(10);
    lab.ends_at = Utc::now() - chrono::Duration::minutes(1);
    harness.repository.create_lab(&lab).await.unwrap();

    // Past its end but not yet stuck: left alone
    let report = harness.manager.run_sweep().await;
    assert_eq!(report, SweepReport::default());
    assert_eq!(
        harness.repository.get_lab_by_id(&lab.id).await.unwrap().status,
        LabStatus::Error
    );
    assert!(harness.calls.cleanups().is_empty());

    // Once the threshold passes it is deleted
    let later = Utc::now() + chrono::Duration::hours(3);
    let report = harness.manager.sweep_stuck_errors(later).await;
    assert_eq!(report.deleted, 1);
    assert!(harness
        .repository
        .get_lab_by_id(&lab.id)
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(harness.calls.cleanups(), vec!["openstack"]);
}

#[tokio::test]
async fn test_sweeper_task_stops_on_cancel() {
    let harness = TestHarness::with_settings(OrchestratorSettings::default());

    let mut lab = Lab::new("due", "alice", None, chrono::Duration::hours(1));
    lab.status = LabStatus::Ready;
    lab.ends_at = Utc::now() - chrono::Duration::seconds(5);
    harness.repository.create_lab(&lab).await.unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(start_sweeper_task(
        harness.manager.clone(),
        Duration::from_secs(1),
        cancel.clone(),
    ));

    // The first tick fires immediately
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stored = harness.repository.get_lab_by_id(&lab.id).await.unwrap();
            if stored.status == LabStatus::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sweeper never expired the lab");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}
