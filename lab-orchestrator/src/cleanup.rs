//! Cleanup orchestrator
//!
//! Reverses what a lab's pipeline built. Only the services recorded in
//! `used_services` are cleaned; a lab with no record at all (created before
//! recording existed) gets every registered service.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use lab_config::CleanupPolicy;
use lab_core::CleanupParams;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::ServiceDispatcher;
use crate::error::{CleanupFailures, OrchestratorError, Result, ServiceError, ServiceFailure};
use crate::handle::LabHandle;
use crate::pipeline::panic_message;
use crate::service::{CleanupContext, LabService};

/// Successful cleanup summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub lab_id: String,
    /// Config ids (or service names, for the legacy fallback) cleaned.
    pub cleaned: Vec<String>,
    /// Recorded config ids that could no longer be dispatched.
    pub skipped: Vec<String>,
    pub used_fallback: bool,
}

/// One cleanup invocation to make.
pub struct CleanupTarget {
    pub service: Arc<dyn LabService>,
    pub config: Option<lab_core::ServiceConfig>,
    pub params: Option<CleanupParams>,
}

impl CleanupTarget {
    /// Label used in reports: the config id, or the service name without one.
    pub fn label(&self) -> String {
        match &self.config {
            Some(config) => config.id.clone(),
            None => self.service.name().to_string(),
        }
    }
}

pub struct CleanupOrchestrator {
    dispatcher: Arc<ServiceDispatcher>,
    policy: CleanupPolicy,
}

impl CleanupOrchestrator {
    pub fn new(dispatcher: Arc<ServiceDispatcher>, policy: CleanupPolicy) -> Self {
        Self { dispatcher, policy }
    }

    pub fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    /// Clean up everything `lab` used. Failures are aggregated (or stop the
    /// run under `StopOnError`) and returned as `OrchestratorError::Cleanup`.
    #[instrument(skip_all, fields(lab_id = %lab.id()))]
    pub async fn cleanup_lab(&self, lab: &LabHandle, cancel: &CancellationToken) -> Result<CleanupReport> {
        let used_services = lab.lock().await.used_services.clone();
        let mut report = CleanupReport {
            lab_id: lab.id().to_string(),
            ..Default::default()
        };

        let mut targets = Vec::new();
        if used_services.is_empty() {
            info!("No service usage recorded, cleaning up every registered service");
            report.used_fallback = true;
            for service in self.dispatcher.registry().all() {
                let config = self
                    .dispatcher
                    .config_for_type(service.kind().as_str())
                    .await;
                targets.push(CleanupTarget {
                    service,
                    config,
                    params: None,
                });
            }
        } else {
            for config_id in &used_services {
                match self.dispatcher.bind_for_cleanup(config_id).await {
                    Some(bound) => targets.push(CleanupTarget {
                        service: bound.service,
                        config: Some(bound.config),
                        params: None,
                    }),
                    None => {
                        warn!("Skipping cleanup of {}: cannot dispatch", config_id);
                        report.skipped.push(config_id.clone());
                    }
                }
            }
        }

        let mut failures = CleanupFailures {
            lab_id: report.lab_id.clone(),
            ..Default::default()
        };

        let mut remaining = targets.into_iter();
        while let Some(target) = remaining.next() {
            let label = target.label();
            match self.run_target(lab, target, cancel).await {
                Ok(()) => report.cleaned.push(label),
                Err(failure) => {
                    failures.failures.push(failure);
                    if self.policy == CleanupPolicy::StopOnError {
                        failures.not_attempted = remaining.by_ref().map(|t| t.label()).collect();
                        break;
                    }
                }
            }
        }

        if failures.failures.is_empty() {
            info!("Cleaned up {} service(s)", report.cleaned.len());
            return Ok(report);
        }

        failures.cleaned = report.cleaned;
        Err(OrchestratorError::Cleanup(failures))
    }

    /// Invoke one cleanup, containing panics.
    pub async fn run_target(
        &self,
        lab: &LabHandle,
        target: CleanupTarget,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ServiceFailure> {
        let label = target.label();
        let service_name = target.service.name().to_string();
        let config_id = target.config.as_ref().map(|c| c.id.clone());

        let mut ctx = CleanupContext::new(lab.clone(), target.config, cancel.child_token());
        if let Some(params) = target.params {
            ctx = ctx.with_params(params);
        }

        debug!("Cleaning up {} ({})", service_name, label);
        let result = AssertUnwindSafe(target.service.execute_cleanup(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ServiceError::Panicked(panic_message(panic))));

        result.map_err(|e| {
            error!("Cleanup of {} ({}) failed: {}", service_name, label, e);
            ServiceFailure {
                service: service_name,
                config_id,
                message: e.to_string(),
            }
        })
    }
}
