//! Integration tests for teardown: stop, delete, cleanup policies and
//! operator cleanup.

use std::collections::BTreeMap;

use lab_config::CleanupPolicy;
use lab_core::kind::ProxmoxUserParams;
use lab_core::{CleanupParams, Lab, LabStatus, ServiceConfig, ServiceKind};
use lab_orchestrator::test_utils::TestHarness;
use lab_orchestrator::{
    AdminCleanupRequest, LabRepository, OrchestratorError, OrchestratorSettings,
};

fn stop_on_error() -> OrchestratorSettings {
    OrchestratorSettings {
        cleanup_policy: CleanupPolicy::StopOnError,
        ..Default::default()
    }
}

async fn add_three(harness: &TestHarness, fail_first_cleanup: bool) {
    let first = harness.service("openstack", ServiceKind::OpenstackProject);
    let first = if fail_first_cleanup {
        first.failing_cleanup()
    } else {
        first
    };
    harness.add_service("cfg-a", first).await;
    harness
        .add_service("cfg-b", harness.service("proxmox", ServiceKind::ProxmoxUser))
        .await;
    harness
        .add_service(
            "cfg-c",
            harness.service("terraform", ServiceKind::TerraformWorkspace),
        )
        .await;
    harness.add_template("full", &["cfg-a", "cfg-b", "cfg-c"]);
}

#[tokio::test]
async fn test_lab_without_usage_record_cleans_every_service() {
    let harness = TestHarness::new();
    add_three(&harness, false).await;

    // A record from before usage tracking: ready, nothing recorded
    let mut lab = Lab::new("legacy", "alice", None, chrono::Duration::hours(1));
    lab.status = LabStatus::Ready;
    harness.repository.create_lab(&lab).await.unwrap();

    let report = harness.manager.stop_lab(&lab.id).await.unwrap();

    let cleanup = report.cleanup.expect("cleanup report");
    assert!(cleanup.used_fallback);
    assert_eq!(
        harness.calls.cleanups(),
        vec!["openstack", "proxmox", "terraform"]
    );
    assert_eq!(report.lab.status, LabStatus::Expired);
}

#[tokio::test]
async fn test_continue_on_error_attempts_every_service() {
    let harness = TestHarness::new();
    add_three(&harness, true).await;
    let lab = harness.provision("full").await;

    let report = harness.manager.stop_lab(&lab.id).await.unwrap();

    assert!(!report.is_clean());
    let failures = report.failures.expect("failures");
    assert_eq!(failures.failures.len(), 1);
    assert_eq!(failures.failures[0].config_id.as_deref(), Some("cfg-a"));
    assert_eq!(failures.cleaned, vec!["cfg-b", "cfg-c"]);
    assert!(failures.not_attempted.is_empty());
    assert_eq!(
        harness.calls.cleanups(),
        vec!["openstack", "proxmox", "terraform"]
    );

    // A failed cleanup does not keep the lab alive
    let stored = harness.repository.get_lab_by_id(&lab.id).await.unwrap();
    assert_eq!(stored.status, LabStatus::Expired);
}

#[tokio::test]
async fn test_stop_on_error_leaves_later_services() {
    let harness = TestHarness::with_settings(stop_on_error());
    add_three(&harness, true).await;
    let lab = harness.provision("full").await;

    let report = harness.manager.stop_lab(&lab.id).await.unwrap();

    let failures = report.failures.expect("failures");
    assert_eq!(failures.failures.len(), 1);
    assert!(failures.cleaned.is_empty());
    assert_eq!(failures.not_attempted, vec!["cfg-b", "cfg-c"]);
    assert_eq!(harness.calls.cleanups(), vec!["openstack"]);
    assert_eq!(report.lab.status, LabStatus::Expired);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let harness = TestHarness::new();
    add_three(&harness, false).await;
    let lab = harness.provision("full").await;

    harness.manager.stop_lab(&lab.id).await.unwrap();
    harness.calls.clear();
    let again = harness.manager.stop_lab(&lab.id).await.unwrap();

    assert_eq!(again.lab.status, LabStatus::Expired);
    assert!(again.cleanup.is_none());
    assert!(harness.calls.cleanups().is_empty());
}

#[tokio::test]
async fn test_delete_removes_lab_and_credentials() {
    let harness = TestHarness::new();
    harness
        .add_service(
            "cfg-a",
            harness
                .service("guacamole", ServiceKind::GuacamoleUser)
                .with_credential(lab_core::NewCredential::new("Desk", "student", "pw")),
        )
        .await;
    harness.add_template("desk", &["cfg-a"]);
    let lab = harness.provision("desk").await;

    let report = harness.manager.delete_lab(&lab.id).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(harness.calls.cleanups(), vec!["guacamole"]);
    assert!(matches!(
        harness.manager.get_lab(&lab.id).await,
        Err(OrchestratorError::NotFound { .. })
    ));
    assert!(harness
        .repository
        .get_credentials_by_lab_id(&lab.id)
        .await
        .unwrap()
        .is_empty());
    assert!(harness.manager.get_progress(&lab.id).is_none());
}

#[tokio::test]
async fn test_deactivated_config_is_still_cleaned() {
    let harness = TestHarness::new();
    let config = harness
        .add_service("cfg-a", harness.service("proxmox", ServiceKind::ProxmoxUser))
        .await;
    harness.add_template("t", &["cfg-a"]);
    let lab = harness.provision("t").await;

    harness
        .repository
        .save_service_config(&ServiceConfig {
            is_active: false,
            ..config
        })
        .await
        .unwrap();
    let report = harness.manager.stop_lab(&lab.id).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(harness.calls.cleanups(), vec!["proxmox"]);
}

#[tokio::test]
async fn test_deleted_config_is_skipped() {
    let harness = TestHarness::new();
    add_three(&harness, false).await;
    let lab = harness.provision("full").await;

    harness
        .repository
        .delete_service_config("cfg-b")
        .await
        .unwrap();
    let report = harness.manager.stop_lab(&lab.id).await.unwrap();

    let cleanup = report.cleanup.expect("cleanup report");
    assert_eq!(cleanup.skipped, vec!["cfg-b"]);
    assert_eq!(cleanup.cleaned, vec!["cfg-a", "cfg-c"]);
    assert_eq!(harness.calls.cleanups(), vec!["openstack", "terraform"]);
}

#[tokio::test]
async fn test_admin_cleanup_by_type_synthesizes_identifiers() {
    let harness = TestHarness::new();
    harness
        .add_service("cfg-pve", harness.service("proxmox", ServiceKind::ProxmoxUser))
        .await;

    let report = harness
        .manager
        .admin_cleanup(AdminCleanupRequest::ByType {
            service_type: "proxmox_user".to_string(),
            lab_id: Some("abc123".to_string()),
            params: BTreeMap::new(),
        })
        .await
        .unwrap();

    let expected = CleanupParams::ProxmoxUser(ProxmoxUserParams {
        username: "lab-abc123@pve".to_string(),
        pool: "lab-abc123-pool".to_string(),
    });
    assert!(report.all_succeeded());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].params, expected);
    assert_eq!(report.outcomes[0].config_id.as_deref(), Some("cfg-pve"));
    assert_eq!(harness.calls.cleanup_params(), vec![Some(expected)]);
}

#[tokio::test]
async fn test_admin_cleanup_by_type_prefers_operator_values() {
    let harness = TestHarness::new();
    harness
        .add_service("cfg-pve", harness.service("proxmox", ServiceKind::ProxmoxUser))
        .await;

    let params = BTreeMap::from([("username".to_string(), "stray@pam".to_string())]);
    let report = harness
        .manager
        .admin_cleanup(AdminCleanupRequest::ByType {
            service_type: "proxmox_user".to_string(),
            lab_id: Some("abc123".to_string()),
            params,
        })
        .await
        .unwrap();

    assert_eq!(
        report.outcomes[0].params,
        CleanupParams::ProxmoxUser(ProxmoxUserParams {
            username: "stray@pam".to_string(),
            pool: "lab-abc123-pool".to_string(),
        })
    );
}

#[tokio::test]
async fn test_admin_cleanup_rejects_unknown_type_and_config() {
    let harness = TestHarness::new();

    let err = harness
        .manager
        .admin_cleanup(AdminCleanupRequest::ByType {
            service_type: "nope".to_string(),
            lab_id: None,
            params: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = harness
        .manager
        .admin_cleanup(AdminCleanupRequest::ByConfig {
            config_id: "missing".to_string(),
            lab_id: "abc123".to_string(),
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_admin_cleanup_by_config() {
    let harness = TestHarness::new();
    harness
        .add_service(
            "cfg-tf",
            harness.service("terraform", ServiceKind::TerraformWorkspace),
        )
        .await;

    let report = harness
        .manager
        .admin_cleanup(AdminCleanupRequest::ByConfig {
            config_id: "cfg-tf".to_string(),
            lab_id: "zz99".to_string(),
        })
        .await
        .unwrap();

    assert!(report.all_succeeded());
    assert_eq!(report.lab_id.as_deref(), Some("zz99"));
    assert_eq!(report.outcomes[0].config_id.as_deref(), Some("cfg-tf"));
    assert_eq!(
        report.outcomes[0].params.to_map().get("workspace_name"),
        Some(&"lab-zz99".to_string())
    );
}

#[tokio::test]
async fn test_admin_cleanup_by_lab_id_reports_each_service() {
    let harness = TestHarness::new();
    harness
        .add_service(
            "cfg-os",
            harness.service("openstack", ServiceKind::OpenstackProject),
        )
        .await;
    harness
        .add_service(
            "cfg-pve",
            harness
                .service("proxmox", ServiceKind::ProxmoxUser)
                .failing_cleanup(),
        )
        .await;

    let report = harness
        .manager
        .admin_cleanup(AdminCleanupRequest::ByLabId {
            lab_id: "abc123".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert!(!report.all_succeeded());
    let failed: Vec<_> = report.failed().map(|o| o.service.as_str()).collect();
    assert_eq!(failed, vec!["proxmox"]);
    assert_eq!(report.outcomes[0].service_type, "openstack_project");
    assert_eq!(
        report.outcomes[0].params.to_map().get("project_name"),
        Some(&"lab-abc123".to_string())
    );
}

#[tokio::test]
async fn test_admin_cleanup_keeps_config_secrets_out_of_params() {
    let harness = TestHarness::new();
    let config = harness
        .add_service(
            "cfg-hook",
            harness.service("hooks", ServiceKind::Custom("script".into())),
        )
        .await;
    harness
        .repository
        .save_service_config(&config.with_setting("api_token", "hunter2"))
        .await
        .unwrap();

    let report = harness
        .manager
        .admin_cleanup(AdminCleanupRequest::ByConfig {
            config_id: "cfg-hook".to_string(),
            lab_id: "abc123".to_string(),
        })
        .await
        .unwrap();

    assert!(report.all_succeeded());
    let params = report.outcomes[0].params.to_map();
    assert_eq!(params.get("lab_id").map(String::as_str), Some("abc123"));
    assert!(!params.contains_key("api_token"));
    assert!(!params.values().any(|v| v == "hunter2"));

    let passed = harness.calls.cleanup_params();
    let passed = passed[0].as_ref().expect("explicit params").to_map();
    assert!(!passed.values().any(|v| v == "hunter2"));
}
