//! Test doubles shared by unit and integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lab_core::{
    lab_resource_name, CleanupParams, Lab, LabTemplate, NewCredential, ServiceConfig, ServiceKind,
    ServiceReference,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::error::ServiceError;
use crate::manager::{CreateLabRequest, LabManager, OrchestratorSettings};
use crate::progress::StepStatus;
use crate::registry::ServiceRegistry;
use crate::repository::{InMemoryLabRepository, LabRepository};
use crate::service::{CleanupContext, LabService, SetupContext};
use crate::templates::TemplateCatalog;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // One connection that never recycles, so the in-memory database lives
    // as long as the pool.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    Setup {
        service: String,
        lab_id: String,
        config_id: String,
    },
    Cleanup {
        service: String,
        lab_id: String,
        config_id: Option<String>,
        params: Option<CleanupParams>,
    },
}

impl ServiceCall {
    pub fn service(&self) -> &str {
        match self {
            ServiceCall::Setup { service, .. } | ServiceCall::Cleanup { service, .. } => service,
        }
    }
}

/// Ordered record of every setup and cleanup call, shared across services.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<ServiceCall>>>);

impl CallLog {
    fn record(&self, call: ServiceCall) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Config ids whose setup ran, in order.
    pub fn setups(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ServiceCall::Setup { config_id, .. } => Some(config_id),
                ServiceCall::Cleanup { .. } => None,
            })
            .collect()
    }

    /// Service names whose cleanup ran, in order.
    pub fn cleanups(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ServiceCall::Cleanup { service, .. } => Some(service),
                ServiceCall::Setup { .. } => None,
            })
            .collect()
    }

    /// Parameters passed to the cleanups, in order.
    pub fn cleanup_params(&self) -> Vec<Option<CleanupParams>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ServiceCall::Cleanup { params, .. } => Some(params),
                ServiceCall::Setup { .. } => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Scriptable service that records its calls.
///
/// Setup walks the kind's step checklist, stores `{name}.resource` in the
/// lab's service data and optionally issues a credential. Cleanup removes
/// that key.
pub struct RecordingService {
    name: String,
    kind: ServiceKind,
    log: CallLog,
    required: Vec<&'static str>,
    fail_setup: AtomicBool,
    fail_cleanup: AtomicBool,
    panic_setup: bool,
    credential: Option<NewCredential>,
    setup_delay: Option<Duration>,
}

impl RecordingService {
    pub fn new(name: &str, kind: ServiceKind, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            kind,
            log,
            required: Vec::new(),
            fail_setup: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            panic_setup: false,
            credential: None,
            setup_delay: None,
        }
    }

    pub fn failing_setup(self) -> Self {
        self.fail_setup.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_cleanup(self) -> Self {
        self.fail_cleanup.store(true, Ordering::SeqCst);
        self
    }

    pub fn panicking_setup(mut self) -> Self {
        self.panic_setup = true;
        self
    }

    pub fn with_credential(mut self, credential: NewCredential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_required_params(mut self, params: &[&'static str]) -> Self {
        self.required = params.to_vec();
        self
    }

    /// Setup waits this long (or until cancelled) before finishing.
    pub fn with_setup_delay(mut self, delay: Duration) -> Self {
        self.setup_delay = Some(delay);
        self
    }

    pub fn set_fail_cleanup(&self, fail: bool) {
        self.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    fn resource_key(&self) -> String {
        format!("{}.resource", self.name)
    }
}

#[async_trait]
impl LabService for RecordingService {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Recording test service"
    }

    fn kind(&self) -> ServiceKind {
        self.kind.clone()
    }

    fn required_params(&self) -> &[&str] {
        &self.required
    }

    async fn execute_setup(&self, ctx: &SetupContext) -> Result<(), ServiceError> {
        self.log.record(ServiceCall::Setup {
            service: self.name.clone(),
            lab_id: ctx.lab_id.clone(),
            config_id: ctx.config.id.clone(),
        });

        if self.panic_setup {
            panic!("{} exploded", self.name);
        }

        if let Some(delay) = self.setup_delay {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ServiceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let steps = self.expected_steps();
        if self.fail_setup.load(Ordering::SeqCst) {
            if let Some(first) = steps.first() {
                ctx.update_step(first, StepStatus::Running, "calling API");
            }
            return Err(ServiceError::Api(format!("{} rejected the request", self.name)));
        }

        for step in &steps {
            ctx.update_step(step, StepStatus::Running, "");
            ctx.update_step(step, StepStatus::Completed, "");
        }

        ctx.lab
            .set_service_data(self.resource_key(), lab_resource_name(&ctx.lab_id))
            .await;
        if let Some(credential) = &self.credential {
            ctx.add_credential(credential.clone()).await?;
        }
        Ok(())
    }

    async fn execute_cleanup(&self, ctx: &CleanupContext) -> Result<(), ServiceError> {
        self.log.record(ServiceCall::Cleanup {
            service: self.name.clone(),
            lab_id: ctx.lab_id.clone(),
            config_id: ctx.config.as_ref().map(|c| c.id.clone()),
            params: ctx.params.clone(),
        });

        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(ServiceError::Api(format!("{} cleanup refused", self.name)));
        }

        // Nothing recorded is nothing to delete
        ctx.lab.remove_service_data(&self.resource_key()).await;
        Ok(())
    }
}

/// A manager over an in-memory repository, plus the pieces tests poke at.
pub struct TestHarness {
    pub repository: Arc<InMemoryLabRepository>,
    pub registry: Arc<ServiceRegistry>,
    pub templates: Arc<TemplateCatalog>,
    pub manager: Arc<LabManager>,
    pub calls: CallLog,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(OrchestratorSettings::default())
    }

    pub fn with_settings(settings: OrchestratorSettings) -> Self {
        let repository = Arc::new(InMemoryLabRepository::new());
        let registry = Arc::new(ServiceRegistry::new());
        let templates = Arc::new(TemplateCatalog::new());
        let manager = Arc::new(LabManager::new(
            repository.clone(),
            registry.clone(),
            templates.clone(),
            settings,
        ));
        Self {
            repository,
            registry,
            templates,
            manager,
            calls: CallLog::default(),
        }
    }

    /// A recording service wired to the harness call log.
    pub fn service(&self, name: &str, kind: ServiceKind) -> RecordingService {
        RecordingService::new(name, kind, self.calls.clone())
    }

    /// Register `service` and store a config `config_id` of its kind.
    pub async fn add_service(&self, config_id: &str, service: RecordingService) -> ServiceConfig {
        let config = ServiceConfig::new(config_id, config_id, service.kind().as_str());
        self.registry.register(Arc::new(service));
        self.repository
            .save_service_config(&config)
            .await
            .expect("save service config");
        config
    }

    /// A two-hour template running `config_ids` in order.
    pub fn add_template(&self, id: &str, config_ids: &[&str]) -> LabTemplate {
        let services = config_ids
            .iter()
            .map(|config_id| ServiceReference::new(*config_id, *config_id))
            .collect();
        let template = LabTemplate::new(id, id, "2h", services);
        self.templates.insert(template.clone());
        template
    }

    /// Create a lab from `template_id` and wait for its pipeline.
    pub async fn provision(&self, template_id: &str) -> Lab {
        let lab = self
            .manager
            .create_lab(CreateLabRequest {
                name: format!("{template_id}-lab"),
                owner_id: "alice".to_string(),
                template_id: Some(template_id.to_string()),
                duration: None,
            })
            .await
            .expect("create lab");
        self.manager
            .wait_for_provisioning(&lab.id)
            .await
            .expect("pipeline task");
        self.manager.get_lab(&lab.id).await.expect("get lab")
    }
}
