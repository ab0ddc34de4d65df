//! The setup/cleanup contract every service implementation fulfils.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lab_core::{CleanupParams, Credential, NewCredential, ServiceConfig, ServiceKind};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::handle::LabHandle;
use crate::progress::{ProgressTracker, StepStatus};
use crate::repository::LabRepository;

/// One implementation per service type. Instances are shared across labs;
/// per-lab state lives in the lab's `service_data`, per-config state arrives
/// through the bound [`ServiceConfig`] in each context.
#[async_trait]
pub trait LabService: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// The service type this implementation handles.
    fn kind(&self) -> ServiceKind;

    /// Settings a config must provide before it can be bound to this service.
    fn required_params(&self) -> &[&str] {
        &[]
    }

    /// Step checklist reported to the progress tracker.
    fn expected_steps(&self) -> Vec<String> {
        self.kind().expected_steps()
    }

    /// Called at most once per lab. An error aborts the lab's pipeline.
    async fn execute_setup(&self, ctx: &SetupContext) -> Result<(), ServiceError>;

    /// Must tolerate partial `service_data` and treat "nothing to delete"
    /// as success.
    async fn execute_cleanup(&self, ctx: &CleanupContext) -> Result<(), ServiceError>;
}

/// Reports step transitions for one service of one lab.
#[derive(Clone)]
pub struct StepReporter {
    tracker: Arc<ProgressTracker>,
    lab_id: String,
    service_id: String,
}

impl StepReporter {
    pub fn new(tracker: Arc<ProgressTracker>, lab_id: &str, service_id: &str) -> Self {
        Self {
            tracker,
            lab_id: lab_id.to_string(),
            service_id: service_id.to_string(),
        }
    }

    pub fn report(&self, step: &str, status: StepStatus, message: &str) {
        self.tracker
            .update_step(&self.lab_id, &self.service_id, step, status, message);
    }
}

pub struct SetupContext {
    pub lab_id: String,
    pub lab_name: String,
    pub owner_id: String,
    pub duration: Duration,
    pub ends_at: DateTime<Utc>,
    pub config: ServiceConfig,
    pub cancel: CancellationToken,
    pub lab: LabHandle,
    repository: Arc<dyn LabRepository>,
    progress: Option<StepReporter>,
}

impl SetupContext {
    pub async fn new(
        lab: LabHandle,
        config: ServiceConfig,
        repository: Arc<dyn LabRepository>,
        cancel: CancellationToken,
    ) -> Self {
        let snapshot = lab.snapshot().await;
        Self {
            lab_id: snapshot.id.clone(),
            lab_name: snapshot.name.clone(),
            owner_id: snapshot.owner_id.clone(),
            duration: snapshot.duration(),
            ends_at: snapshot.ends_at,
            config,
            cancel,
            lab,
            repository,
            progress: None,
        }
    }

    pub fn with_progress(mut self, reporter: StepReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    /// Persist a credential for this lab and append it to the lab record.
    /// The credential expires together with the lab. A persistence failure
    /// is returned to the caller and should fail the setup.
    pub async fn add_credential(&self, credential: NewCredential) -> Result<Credential, ServiceError> {
        let mut lab = self.lab.lock().await;
        let credential = credential.into_credential(&lab.id, lab.ends_at);
        self.repository
            .create_credential(&credential)
            .await
            .map_err(|e| ServiceError::Persistence {
                what: format!("credential '{}'", credential.label),
                message: e.to_string(),
            })?;
        lab.credentials.push(credential.clone());
        Ok(credential)
    }

    /// No-op when the pipeline runs without a progress tracker.
    pub fn update_step(&self, step: &str, status: StepStatus, message: &str) {
        if let Some(progress) = &self.progress {
            progress.report(step, status, message);
        }
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.config.setting(key)
    }

    /// Fail fast once the lab has been stopped or the process is shutting down.
    pub fn check_cancelled(&self) -> Result<(), ServiceError> {
        if self.cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        Ok(())
    }
}

pub struct CleanupContext {
    pub lab_id: String,
    pub cancel: CancellationToken,
    pub lab: LabHandle,
    pub config: Option<ServiceConfig>,
    /// Identifiers supplied by an operator (admin cleanup) instead of being
    /// read back from `service_data`.
    pub params: Option<CleanupParams>,
}

impl CleanupContext {
    pub fn new(lab: LabHandle, config: Option<ServiceConfig>, cancel: CancellationToken) -> Self {
        Self {
            lab_id: lab.id().to_string(),
            cancel,
            lab,
            config,
            params: None,
        }
    }

    pub fn with_params(mut self, params: CleanupParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.config.as_ref().and_then(|c| c.setting(key))
    }

    /// Explicit parameters if given, otherwise the identifiers a service of
    /// `kind` would have derived from the lab id.
    pub fn params_or_synthesized(&self, kind: &ServiceKind) -> CleanupParams {
        if let Some(params) = &self.params {
            return params.clone();
        }
        let empty = Default::default();
        let settings = self.config.as_ref().map(|c| &c.settings).unwrap_or(&empty);
        CleanupParams::synthesize(kind, &self.lab_id, settings)
    }
}
