//! Provisioning pipeline
//!
//! Runs the template's services for one lab, in template order, and decides
//! the lab's terminal status. Every config id is recorded in `used_services`
//! and persisted before its setup runs, so a crash mid-setup still leaves the
//! service in cleanup scope.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use lab_core::LabStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::{BoundService, ServiceDispatcher};
use crate::error::ServiceError;
use crate::handle::LabHandle;
use crate::progress::ProgressTracker;
use crate::repository::LabRepository;
use crate::service::{SetupContext, StepReporter};
use crate::templates::TemplateCatalog;

/// `service_data` key holding the config id whose setup failed.
pub const FAILED_SERVICE_KEY: &str = "pipeline.failed_service";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Ready,
    Failed {
        service_id: Option<String>,
        message: String,
    },
    /// The lab left `Provisioning` (stopped, expired) or the run was
    /// cancelled before all services ran.
    Halted { status: LabStatus },
}

pub struct ProvisioningPipeline {
    repository: Arc<dyn LabRepository>,
    dispatcher: Arc<ServiceDispatcher>,
    templates: Arc<TemplateCatalog>,
    progress: Arc<ProgressTracker>,
}

struct PlannedService {
    name: String,
    bound: BoundService,
}

impl ProvisioningPipeline {
    pub fn new(
        repository: Arc<dyn LabRepository>,
        dispatcher: Arc<ServiceDispatcher>,
        templates: Arc<TemplateCatalog>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            templates,
            progress,
        }
    }

    #[instrument(skip_all, fields(lab_id = %lab.id()))]
    pub async fn run(&self, lab: LabHandle, cancel: CancellationToken) -> PipelineOutcome {
        let lab_id = lab.id().to_string();
        if !self.progress.contains(&lab_id) {
            self.progress.start_lab(&lab_id);
        }

        let template_id = lab.lock().await.template_id.clone();
        let Some(template_id) = template_id else {
            debug!("Ad hoc lab, no services to set up");
            return self.finish_ready(&lab).await;
        };

        let Some(template) = self.templates.get(&template_id) else {
            let message = format!("Template {template_id} not found");
            return self.fail(&lab, None, message).await;
        };

        // Pre-registration: resolve everything first so the checklist and
        // percentage cover the whole run from the start.
        let mut plan = Vec::with_capacity(template.services.len());
        for reference in &template.services {
            match self.dispatcher.resolve(&reference.service_id).await {
                Ok(bound) => {
                    self.progress.register_service(
                        &lab_id,
                        &bound.config.id,
                        &reference.name,
                        &bound.config.service_type,
                        &bound.service.expected_steps(),
                    );
                    plan.push(PlannedService {
                        name: reference.name.clone(),
                        bound,
                    });
                }
                Err(e) => {
                    warn!("Skipping service {}: {}", reference.service_id, e);
                    self.progress.log(
                        &lab_id,
                        format!("Skipping {} ({}): {}", reference.name, reference.service_id, e),
                    );
                }
            }
        }

        for planned in plan {
            if let Some(outcome) = self.halted(&lab, &cancel).await {
                return outcome;
            }

            let config_id = planned.bound.config.id.clone();
            lab.lock().await.record_used_service(&config_id);
            if let Err(e) = lab.persist(self.repository.as_ref()).await {
                let message = format!("Failed to record {} before setup: {}", planned.name, e);
                return self.fail(&lab, Some(config_id), message).await;
            }

            info!("Setting up {} ({})", planned.name, config_id);
            self.progress.start_service(&lab_id, &config_id);

            let ctx = SetupContext::new(
                lab.clone(),
                planned.bound.config.clone(),
                self.repository.clone(),
                cancel.child_token(),
            )
            .await
            .with_progress(StepReporter::new(self.progress.clone(), &lab_id, &config_id));

            match run_setup(&planned.bound, &ctx).await {
                Ok(()) => {
                    info!("{} ready", planned.name);
                    self.progress.complete_service(&lab_id, &config_id);
                }
                Err(e) => {
                    error!("Setup of {} failed: {}", planned.name, e);
                    self.progress.fail_service(&lab_id, &config_id, &e.to_string());
                    // A cancelled setup may have stopped half way; keep it in scope
                    if !matches!(e, ServiceError::Cancelled) {
                        self.withdraw_failed(&lab, &config_id).await;
                    }
                    let message = format!("{} failed: {}", planned.name, e);
                    return self.fail(&lab, Some(config_id), message).await;
                }
            }
        }

        self.finish_ready(&lab).await
    }

    /// `Some` when the run must not start another service.
    async fn halted(&self, lab: &LabHandle, cancel: &CancellationToken) -> Option<PipelineOutcome> {
        let status = lab.status().await;
        if status != LabStatus::Provisioning {
            info!("Lab is {} now, stopping provisioning", status);
            self.progress
                .log(lab.id(), format!("Provisioning stopped, lab is {status}"));
            return Some(PipelineOutcome::Halted { status });
        }
        if cancel.is_cancelled() {
            info!("Provisioning cancelled");
            self.progress.log(lab.id(), "Provisioning cancelled");
            return Some(PipelineOutcome::Halted { status });
        }
        None
    }

    /// A failed setup is taken back out of cleanup scope unless it is the
    /// only recorded service.
    async fn withdraw_failed(&self, lab: &LabHandle, config_id: &str) {
        let mut lab = lab.lock().await;
        if lab.used_services.len() > 1 {
            lab.used_services.retain(|id| id != config_id);
        }
        lab.service_data
            .insert(FAILED_SERVICE_KEY.to_string(), config_id.to_string());
        lab.touch();
    }

    async fn fail(&self, lab: &LabHandle, service_id: Option<String>, message: String) -> PipelineOutcome {
        error!("Provisioning failed: {}", message);
        self.progress.fail_lab(lab.id(), &message);

        let transitioned = lab.lock().await.transition(LabStatus::Error);
        match transitioned {
            Ok(()) => {
                if let Err(e) = lab.persist(self.repository.as_ref()).await {
                    error!("Failed to persist error status: {}", e);
                }
                PipelineOutcome::Failed {
                    service_id,
                    message,
                }
            }
            Err(e) => {
                // Stopped while the failing service ran
                debug!("Not marking lab as error: {}", e);
                PipelineOutcome::Halted {
                    status: lab.status().await,
                }
            }
        }
    }

    async fn finish_ready(&self, lab: &LabHandle) -> PipelineOutcome {
        let transitioned = lab.lock().await.transition(LabStatus::Ready);
        if let Err(e) = transitioned {
            info!("Lab left provisioning before completion: {}", e);
            return PipelineOutcome::Halted {
                status: lab.status().await,
            };
        }

        if let Err(e) = lab.persist(self.repository.as_ref()).await {
            error!("Failed to persist ready status: {}", e);
        }
        self.progress.complete_lab(lab.id(), "Lab is ready");
        info!("Lab is ready");
        PipelineOutcome::Ready
    }
}

/// Run one setup, turning a panic inside the implementation into an error.
async fn run_setup(bound: &BoundService, ctx: &SetupContext) -> Result<(), ServiceError> {
    AssertUnwindSafe(bound.service.execute_setup(ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ServiceError::Panicked(panic_message(panic))))
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
