//! Maps service configs to implementations.
//!
//! Binding pairs a shared implementation with one config's settings for a
//! single invocation, so two configs of the same type never see each other's
//! settings.

use std::sync::Arc;

use lab_core::ServiceConfig;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::registry::ServiceRegistry;
use crate::repository::LabRepository;
use crate::service::LabService;

/// An implementation together with the config it runs against.
#[derive(Clone)]
pub struct BoundService {
    pub service: Arc<dyn LabService>,
    pub config: ServiceConfig,
}

impl BoundService {
    pub fn config_id(&self) -> &str {
        &self.config.id
    }
}

pub struct ServiceDispatcher {
    registry: Arc<ServiceRegistry>,
    repository: Arc<dyn LabRepository>,
}

impl ServiceDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, repository: Arc<dyn LabRepository>) -> Self {
        Self {
            registry,
            repository,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn by_type(&self, service_type: &str) -> Option<Arc<dyn LabService>> {
        self.registry.by_type(service_type)
    }

    /// Bind `config` to the implementation for its type, checking the
    /// implementation's required settings. Activity is not checked here.
    pub fn bind(&self, config: ServiceConfig) -> Result<BoundService> {
        let service = self.by_type(&config.service_type).ok_or_else(|| {
            OrchestratorError::InvalidInput(format!(
                "no service registered for type '{}' (config {})",
                config.service_type, config.id
            ))
        })?;

        let missing = config.missing_settings(service.required_params());
        if !missing.is_empty() {
            return Err(OrchestratorError::InvalidInput(format!(
                "config {} is missing required settings: {}",
                config.id,
                missing.join(", ")
            )));
        }

        Ok(BoundService { service, config })
    }

    /// Resolve an active config by id and bind it, explaining any failure.
    pub async fn resolve(&self, config_id: &str) -> Result<BoundService> {
        let config = self
            .repository
            .get_service_config(config_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "Service config",
                id: config_id.to_string(),
            })?;

        if !config.is_active {
            return Err(OrchestratorError::InvalidState(format!(
                "service config {config_id} is inactive"
            )));
        }

        self.bind(config)
    }

    /// Lookup form of [`ServiceDispatcher::resolve`]; any failure is `None`.
    pub async fn by_config_id(&self, config_id: &str) -> Option<BoundService> {
        match self.resolve(config_id).await {
            Ok(bound) => Some(bound),
            Err(e) => {
                warn!("Cannot dispatch service config {}: {}", config_id, e);
                None
            }
        }
    }

    /// Bind by id regardless of the config's active flag. Cleanup must still
    /// reach resources created while a since-deactivated config was active.
    pub async fn bind_for_cleanup(&self, config_id: &str) -> Option<BoundService> {
        let config = match self.repository.get_service_config(config_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("Service config {} no longer exists", config_id);
                return None;
            }
            Err(e) => {
                warn!("Failed to load service config {}: {}", config_id, e);
                return None;
            }
        };

        match self.by_type(&config.service_type) {
            Some(service) => Some(BoundService { service, config }),
            None => {
                warn!(
                    "No service registered for type '{}' (config {})",
                    config.service_type, config_id
                );
                None
            }
        }
    }

    /// First config of `service_type`, preferring active ones.
    pub async fn config_for_type(&self, service_type: &str) -> Option<ServiceConfig> {
        let wanted = service_type.trim().to_ascii_lowercase();
        let configs = match self.repository.list_service_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!("Failed to list service configs: {}", e);
                return None;
            }
        };
        let mut matching = configs
            .into_iter()
            .filter(|c| c.service_type.trim().to_ascii_lowercase() == wanted);
        let first = matching.next()?;
        if first.is_active {
            return Some(first);
        }
        matching.find(|c| c.is_active).or(Some(first))
    }
}
