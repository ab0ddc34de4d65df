//! Operator-driven cleanup that bypasses the usage record.
//!
//! Used to reclaim resources of labs whose records are gone or incomplete.
//! Identifiers are synthesized from the lab id the same way services derive
//! them at setup time, unless the operator supplies them explicitly.

use std::collections::BTreeMap;
use std::sync::Arc;

use lab_core::{CleanupParams, Lab, ServiceConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cleanup::CleanupTarget;
use crate::error::{OrchestratorError, Result};
use crate::handle::LabHandle;
use crate::manager::LabManager;
use crate::service::LabService;

/// Lab id used when an operator cleans by type without naming a lab.
const UNKNOWN_LAB_ID: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCleanupRequest {
    /// Run one service type's cleanup with operator-supplied identifiers.
    ByType {
        service_type: String,
        lab_id: Option<String>,
        params: BTreeMap<String, String>,
    },
    /// Run one config's cleanup for a bare lab id.
    ByConfig { config_id: String, lab_id: String },
    /// Run every registered service's cleanup for a bare lab id.
    ByLabId { lab_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCleanupOutcome {
    pub service: String,
    pub service_type: String,
    pub config_id: Option<String>,
    pub params: CleanupParams,
    pub error: Option<String>,
}

impl AdminCleanupOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminCleanupReport {
    pub lab_id: Option<String>,
    pub outcomes: Vec<AdminCleanupOutcome>,
}

impl AdminCleanupReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(AdminCleanupOutcome::succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &AdminCleanupOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }
}

impl LabManager {
    /// Per-service failures are reported in the outcome list; only an
    /// unusable request (unknown type or config) is an error.
    #[instrument(skip(self))]
    pub async fn admin_cleanup(&self, request: AdminCleanupRequest) -> Result<AdminCleanupReport> {
        match request {
            AdminCleanupRequest::ByType {
                service_type,
                lab_id,
                params,
            } => {
                let service = self.dispatcher.by_type(&service_type).ok_or_else(|| {
                    OrchestratorError::NotFound {
                        entity: "Service type",
                        id: service_type.clone(),
                    }
                })?;
                let config = self.dispatcher.config_for_type(&service_type).await;
                let lab_key = lab_id.as_deref().unwrap_or(UNKNOWN_LAB_ID);
                let cleanup_params = synthesize(service.as_ref(), lab_key, config.as_ref())
                    .with_overrides(&params);

                let lab = self
                    .admin_lab(lab_key, Vec::new(), cleanup_params.to_map())
                    .await;
                let outcome = self.admin_run(&lab, service, config, cleanup_params).await;
                Ok(AdminCleanupReport {
                    lab_id,
                    outcomes: vec![outcome],
                })
            }
            AdminCleanupRequest::ByConfig { config_id, lab_id } => {
                let config = self
                    .repository
                    .get_service_config(&config_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::NotFound {
                        entity: "Service config",
                        id: config_id.clone(),
                    })?;
                let service = self.dispatcher.by_type(&config.service_type).ok_or_else(|| {
                    OrchestratorError::InvalidInput(format!(
                        "no service registered for type '{}'",
                        config.service_type
                    ))
                })?;
                let cleanup_params = synthesize(service.as_ref(), &lab_id, Some(&config));

                let lab = self
                    .admin_lab(&lab_id, vec![config_id], cleanup_params.to_map())
                    .await;
                let outcome = self
                    .admin_run(&lab, service, Some(config), cleanup_params)
                    .await;
                Ok(AdminCleanupReport {
                    lab_id: Some(lab_id),
                    outcomes: vec![outcome],
                })
            }
            AdminCleanupRequest::ByLabId { lab_id } => {
                let lab = self.admin_lab(&lab_id, Vec::new(), BTreeMap::new()).await;
                let mut report = AdminCleanupReport {
                    lab_id: Some(lab_id.clone()),
                    outcomes: Vec::new(),
                };
                for service in self.registry.all() {
                    let config = self.dispatcher.config_for_type(service.kind().as_str()).await;
                    let cleanup_params = synthesize(service.as_ref(), &lab_id, config.as_ref());
                    let outcome = self.admin_run(&lab, service, config, cleanup_params).await;
                    report.outcomes.push(outcome);
                }
                info!(
                    "Admin cleanup of lab {}: {} of {} service(s) succeeded",
                    lab_id,
                    report.outcomes.iter().filter(|o| o.succeeded()).count(),
                    report.outcomes.len()
                );
                Ok(report)
            }
        }
    }

    /// The live lab if one exists, otherwise a synthetic stand-in seeded
    /// with the identifiers being cleaned.
    async fn admin_lab(
        &self,
        lab_id: &str,
        used_services: Vec<String>,
        seed: BTreeMap<String, String>,
    ) -> LabHandle {
        if let Some(handle) = self.handles.get(lab_id) {
            return handle;
        }
        if lab_id != UNKNOWN_LAB_ID {
            match self.repository.get_lab_by_id(lab_id).await {
                Ok(lab) => return LabHandle::new(lab),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Could not load lab {}: {}", lab_id, e),
            }
        }
        let mut lab = Lab::synthetic(lab_id, used_services);
        lab.service_data = seed;
        LabHandle::new(lab)
    }

    async fn admin_run(
        &self,
        lab: &LabHandle,
        service: Arc<dyn LabService>,
        config: Option<ServiceConfig>,
        params: CleanupParams,
    ) -> AdminCleanupOutcome {
        let service_name = service.name().to_string();
        let service_type = service.kind().as_str().to_string();
        let config_id = config.as_ref().map(|c| c.id.clone());
        let target = CleanupTarget {
            service,
            config,
            params: Some(params.clone()),
        };

        let error = self
            .cleanup
            .run_target(lab, target, &CancellationToken::new())
            .await
            .err()
            .map(|failure| failure.message);

        AdminCleanupOutcome {
            service: service_name,
            service_type,
            config_id,
            params,
            error,
        }
    }
}

fn synthesize(service: &dyn LabService, lab_id: &str, config: Option<&ServiceConfig>) -> CleanupParams {
    let empty = BTreeMap::new();
    let settings = config.map(|c| &c.settings).unwrap_or(&empty);
    CleanupParams::synthesize(&service.kind(), lab_id, settings)
}
