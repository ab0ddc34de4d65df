//! Lab lifecycle manager
//!
//! Entry point for creating, inspecting, stopping and deleting labs. Owns
//! the per-lab handles and pipeline tasks; every teardown path (stop,
//! delete, sweeps, shutdown) goes through here and the cleanup orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lab_config::{CleanupPolicy, LabConfig};
use lab_core::{Lab, LabStatus, LabTemplate};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::cleanup::{CleanupOrchestrator, CleanupReport};
use crate::dispatch::ServiceDispatcher;
use crate::error::{CleanupFailures, OrchestratorError, Result, ServiceFailure};
use crate::handle::{LabHandle, LabHandles};
use crate::pipeline::{PipelineOutcome, ProvisioningPipeline};
use crate::progress::{LabProgress, ProgressTracker, DEFAULT_LOG_LIMIT};
use crate::registry::ServiceRegistry;
use crate::repository::LabRepository;
use crate::templates::TemplateCatalog;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Lifetime of labs created without a template or explicit duration.
    pub default_duration: Duration,
    /// How long a lab may sit in `Error` before the sweeper deletes it.
    pub stuck_error_threshold: Duration,
    pub cleanup_policy: CleanupPolicy,
    pub progress_log_limit: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(2 * 3600),
            stuck_error_threshold: Duration::from_secs(3600),
            cleanup_policy: CleanupPolicy::default(),
            progress_log_limit: DEFAULT_LOG_LIMIT,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &LabConfig) -> Result<Self> {
        Ok(Self {
            default_duration: config.default_duration()?,
            stuck_error_threshold: config.stuck_error_threshold(),
            cleanup_policy: config.cleanup_policy,
            progress_log_limit: config.progress_log_limit,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateLabRequest {
    pub name: String,
    pub owner_id: String,
    pub template_id: Option<String>,
    /// Overrides the template's expiration; still capped by service limits.
    pub duration: Option<Duration>,
}

/// Result of stopping or deleting a lab. Cleanup failures never block the
/// teardown itself; they are reported here.
#[derive(Debug, Clone)]
pub struct TeardownReport {
    pub lab: Lab,
    pub cleanup: Option<CleanupReport>,
    pub failures: Option<CleanupFailures>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_none()
    }
}


pub struct LabManager {
    pub(crate) repository: Arc<dyn LabRepository>,
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) dispatcher: Arc<ServiceDispatcher>,
    pub(crate) templates: Arc<TemplateCatalog>,
    pub(crate) progress: Arc<ProgressTracker>,
    pub(crate) pipeline: Arc<ProvisioningPipeline>,
    pub(crate) cleanup: CleanupOrchestrator,
    pub(crate) handles: LabHandles,
    tasks: Mutex<HashMap<String, JoinHandle<PipelineOutcome>>>,
    pub(crate) settings: OrchestratorSettings,
    pub(crate) shutdown: CancellationToken,
}

impl LabManager {
    pub fn new(
        repository: Arc<dyn LabRepository>,
        registry: Arc<ServiceRegistry>,
        templates: Arc<TemplateCatalog>,
        settings: OrchestratorSettings,
    ) -> Self {
        let dispatcher = Arc::new(ServiceDispatcher::new(registry.clone(), repository.clone()));
        let progress = Arc::new(ProgressTracker::new(settings.progress_log_limit));
        let pipeline = Arc::new(ProvisioningPipeline::new(
            repository.clone(),
            dispatcher.clone(),
            templates.clone(),
            progress.clone(),
        ));
        let cleanup = CleanupOrchestrator::new(dispatcher.clone(), settings.cleanup_policy);

        Self {
            repository,
            registry,
            dispatcher,
            templates,
            progress,
            pipeline,
            cleanup,
            handles: LabHandles::new(),
            tasks: Mutex::new(HashMap::new()),
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn repository(&self) -> &Arc<dyn LabRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<ServiceDispatcher> {
        &self.dispatcher
    }

    pub fn templates(&self) -> &Arc<TemplateCatalog> {
        &self.templates
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn pipeline(&self) -> &Arc<ProvisioningPipeline> {
        &self.pipeline
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Token cancelled on shutdown; the sweeper and every pipeline derive
    /// their tokens from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The live handle for a lab, loading it from the repository if needed.
    pub async fn handle(&self, lab_id: &str) -> Result<LabHandle> {
        self.handles
            .get_or_load(lab_id, self.repository.as_ref())
            .await
    }

    /// Validate, persist and start provisioning a lab. Returns as soon as the
    /// pipeline task is spawned.
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    pub async fn create_lab(&self, request: CreateLabRequest) -> Result<Lab> {
        if request.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "lab name must not be empty".into(),
            ));
        }
        if request.owner_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "owner id must not be empty".into(),
            ));
        }
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::InvalidState(
                "orchestrator is shutting down".into(),
            ));
        }

        let template = match request.template_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => Some(self.templates.get(id).ok_or_else(|| OrchestratorError::NotFound {
                entity: "Template",
                id: id.to_string(),
            })?),
            None => None,
        };

        let mut duration = match (request.duration, &template) {
            (Some(duration), _) => duration,
            (None, Some(template)) => template.expiration_duration()?,
            (None, None) => self.settings.default_duration,
        };
        if duration.is_zero() {
            return Err(OrchestratorError::InvalidInput(
                "lab duration must be positive".into(),
            ));
        }

        if let Some(template) = &template {
            duration = self.check_template(template, duration).await?;
        }

        let lifetime = chrono::Duration::from_std(duration)
            .map_err(|_| OrchestratorError::InvalidInput("lab duration is too large".into()))?;
        let lab = Lab::new(
            request.name,
            request.owner_id,
            template.map(|t| t.id),
            lifetime,
        );
        self.repository.create_lab(&lab).await?;
        info!(lab_id = %lab.id, "Created lab '{}' until {}", lab.name, lab.ends_at);

        self.progress.start_lab(&lab.id);
        let handle = self.handles.insert(lab.clone());
        self.spawn_pipeline(handle);

        Ok(lab)
    }

    /// Every referenced config must be usable, and service limits must allow
    /// another lab. Returns `duration` capped by those limits.
    async fn check_template(&self, template: &LabTemplate, mut duration: Duration) -> Result<Duration> {
        let mut labs: Option<Vec<Lab>> = None;

        for reference in &template.services {
            let config = self
                .repository
                .get_service_config(&reference.service_id)
                .await?
                .filter(|config| config.is_active)
                .ok_or_else(|| {
                    OrchestratorError::InvalidInput(format!(
                        "template {} references unavailable service {}",
                        template.id, reference.service_id
                    ))
                })?;
            self.dispatcher.bind(config)?;

            let Some(limit) = self.repository.get_service_limit(&reference.service_id).await? else {
                continue;
            };
            if limit.max_labs.is_some() && limit.is_active {
                if labs.is_none() {
                    labs = Some(self.repository.get_all_labs().await?);
                }
                let active = labs
                    .as_deref()
                    .map(|labs| self.count_active_using(labs, &reference.service_id))
                    .unwrap_or(0);
                if !limit.allows_another_lab(active) {
                    return Err(OrchestratorError::LimitExceeded {
                        service_id: reference.service_id.clone(),
                        max_labs: limit.max_labs.unwrap_or(0),
                    });
                }
            }
            duration = limit.clamp_duration(duration);
        }

        Ok(duration)
    }

    /// Non-terminal labs that use, or are about to use, `service_id`.
    fn count_active_using(&self, labs: &[Lab], service_id: &str) -> usize {
        labs.iter()
            .filter(|lab| lab.status.is_active())
            .filter(|lab| {
                lab.used_services.iter().any(|id| id == service_id)
                    || lab
                        .template_id
                        .as_deref()
                        .and_then(|id| self.templates.get(id))
                        .is_some_and(|t| t.references_service(service_id))
            })
            .count()
    }

    fn spawn_pipeline(&self, handle: LabHandle) {
        let lab_id = handle.id().to_string();
        // Only shutdown cancels a running setup
        let cancel = self.shutdown.child_token();
        let pipeline = self.pipeline.clone();
        let join = tokio::spawn(async move { pipeline.run(handle, cancel).await });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(lab_id, join);
    }

    fn take_task(&self, lab_id: &str) -> Option<JoinHandle<PipelineOutcome>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(lab_id)
    }

    /// Wait for the lab's pipeline run. `None` if no run is in flight (or it
    /// was already awaited).
    pub async fn wait_for_provisioning(&self, lab_id: &str) -> Result<Option<PipelineOutcome>> {
        let Some(task) = self.take_task(lab_id) else {
            return Ok(None);
        };
        join_pipeline(lab_id, task).await.map(Some)
    }

    /// Move a provisioning lab to `Expired` so its pipeline stops before the
    /// next service, then wait for the setup in flight to return. Afterwards
    /// `used_services` is final and cleanup may read it.
    async fn halt_pipeline(&self, handle: &LabHandle) -> Result<()> {
        {
            let mut lab = handle.lock().await;
            if lab.status == LabStatus::Provisioning {
                lab.transition(LabStatus::Expired)?;
            }
        }
        if let Some(task) = self.take_task(handle.id()) {
            if let Err(e) = join_pipeline(handle.id(), task).await {
                warn!(lab_id = %handle.id(), "Pipeline ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    pub async fn get_lab(&self, lab_id: &str) -> Result<Lab> {
        match self.handles.get(lab_id) {
            Some(handle) => Ok(handle.snapshot().await),
            None => self.repository.get_lab_by_id(lab_id).await,
        }
    }

    pub async fn list_labs_for_owner(&self, owner_id: &str) -> Result<Vec<Lab>> {
        self.repository.get_labs_by_owner_id(owner_id).await
    }

    pub async fn list_labs(&self) -> Result<Vec<Lab>> {
        self.repository.get_all_labs().await
    }

    pub fn get_progress(&self, lab_id: &str) -> Option<LabProgress> {
        self.progress.get(lab_id)
    }

    /// Clean up and mark the lab `Expired`. Stopping an expired lab is a no-op;
    /// a failed lab is cleaned up but stays `Error` until it is deleted.
    #[instrument(skip(self))]
    pub async fn stop_lab(&self, lab_id: &str) -> Result<TeardownReport> {
        let handle = self.handle(lab_id).await?;
        if handle.status().await == LabStatus::Expired {
            self.handles.remove(lab_id);
            return Ok(TeardownReport {
                lab: handle.snapshot().await,
                cleanup: None,
                failures: None,
            });
        }
        info!("Stopping lab");
        self.expire(&handle).await
    }

    /// Clean up and remove the lab with its credentials. Cleanup failures are
    /// reported but do not prevent the removal.
    #[instrument(skip(self))]
    pub async fn delete_lab(&self, lab_id: &str) -> Result<TeardownReport> {
        let handle = self.handle(lab_id).await?;
        info!("Deleting lab");

        self.halt_pipeline(&handle).await?;
        let (cleanup, failures) = self.run_cleanup(&handle).await;

        self.repository.delete_lab(lab_id).await?;
        self.progress.remove(lab_id);
        self.handles.remove(lab_id);
        info!("Lab deleted");

        Ok(TeardownReport {
            lab: handle.snapshot().await,
            cleanup,
            failures,
        })
    }

    /// Shared by stop and the expiry sweep.
    pub(crate) async fn expire(&self, handle: &LabHandle) -> Result<TeardownReport> {
        let lab_id = handle.id().to_string();
        self.halt_pipeline(handle).await?;
        let (cleanup, failures) = self.run_cleanup(handle).await;

        let status = {
            let mut lab = handle.lock().await;
            if lab.status == LabStatus::Ready {
                lab.transition(LabStatus::Expired)?;
            }
            lab.status
        };
        handle.persist(self.repository.as_ref()).await?;
        self.handles.remove(&lab_id);
        if status == LabStatus::Expired {
            self.progress.remove(&lab_id);
            info!(lab_id = %lab_id, "Lab expired");
        } else {
            info!(lab_id = %lab_id, "Lab cleaned up, left as {}", status);
        }

        Ok(TeardownReport {
            lab: handle.snapshot().await,
            cleanup,
            failures,
        })
    }

    pub(crate) async fn run_cleanup(
        &self,
        handle: &LabHandle,
    ) -> (Option<CleanupReport>, Option<CleanupFailures>) {
        match self
            .cleanup
            .cleanup_lab(handle, &CancellationToken::new())
            .await
        {
            Ok(report) => (Some(report), None),
            Err(OrchestratorError::Cleanup(failures)) => {
                error!(lab_id = %handle.id(), "{}", failures);
                (None, Some(failures))
            }
            Err(e) => {
                error!(lab_id = %handle.id(), "Cleanup failed: {}", e);
                let failures = CleanupFailures {
                    lab_id: handle.id().to_string(),
                    failures: vec![ServiceFailure {
                        service: "cleanup".to_string(),
                        config_id: None,
                        message: e.to_string(),
                    }],
                    ..Default::default()
                };
                (None, Some(failures))
            }
        }
    }

    /// Labs left in `Provisioning` by a previous process have lost their
    /// pipeline. Mark them `Error` so the stuck-error sweep reclaims them.
    pub async fn fail_interrupted(&self) -> Result<usize> {
        let labs = self
            .repository
            .get_labs_by_status(LabStatus::Provisioning)
            .await?;

        let mut failed = 0;
        for lab in labs {
            if self.handles.get(&lab.id).is_some() {
                continue;
            }
            let handle = LabHandle::new(lab);
            handle.lock().await.transition(LabStatus::Error)?;
            handle.persist(self.repository.as_ref()).await?;
            warn!(lab_id = %handle.id(), "Provisioning was interrupted, marked as error");
            failed += 1;
        }
        Ok(failed)
    }

    /// Cancel the sweeper and in-flight pipelines, then wait for the
    /// pipeline tasks to wind down.
    pub async fn shutdown(&self) {
        info!("Shutting down lab manager");
        self.shutdown.cancel();

        let tasks: Vec<(String, JoinHandle<PipelineOutcome>)> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (lab_id, task) in tasks {
            if let Err(e) = join_pipeline(&lab_id, task).await {
                warn!(lab_id = %lab_id, "Pipeline ended abnormally: {}", e);
            }
        }
    }
}

async fn join_pipeline(lab_id: &str, join: JoinHandle<PipelineOutcome>) -> Result<PipelineOutcome> {
    join.await.map_err(|e| {
        OrchestratorError::InvalidState(format!("pipeline task for lab {lab_id} failed: {e}"))
    })
}
