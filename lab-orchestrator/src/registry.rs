//! Service registry
//!
//! Name-keyed lookup table of service implementations, with a secondary
//! index from service type to implementation used by the dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::service::LabService;

#[derive(Default)]
struct Entries {
    services: IndexMap<String, Arc<dyn LabService>>,
    /// service type -> service name
    types: HashMap<String, String>,
}

/// Registry of service implementations. Lookups never fail; a missing entry
/// is `None`.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<Entries>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the service's own name. A second registration with the
    /// same name replaces the first.
    pub fn register(&self, service: Arc<dyn LabService>) {
        let name = service.name().to_string();
        let kind = type_key(service.kind().as_str());
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = entries.services.insert(name.clone(), service) {
            warn!("Service '{}' registered twice, replacing the earlier one", name);
            let previous_kind = type_key(previous.kind().as_str());
            if entries.types.get(&previous_kind) == Some(&name) {
                entries.types.remove(&previous_kind);
            }
        }

        if let Some(existing) = entries.types.insert(kind.clone(), name.clone()) {
            if existing != name {
                warn!(
                    "Service type '{}' now handled by '{}' instead of '{}'",
                    kind, name, existing
                );
            }
        }
        debug!("Registered service '{}' for type '{}'", name, kind);
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn LabService>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .get(name)
            .cloned()
    }

    /// The implementation handling `service_type`. The type is matched the
    /// way `ServiceKind` parses it (trimmed, case-insensitive).
    pub fn by_type(&self, service_type: &str) -> Option<Arc<dyn LabService>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let name = entries.types.get(&type_key(service_type))?;
        entries.services.get(name).cloned()
    }

    /// All services in registration order.
    pub fn all(&self) -> Vec<Arc<dyn LabService>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .values()
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn type_key(service_type: &str) -> String {
    service_type.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CallLog, RecordingService};
    use lab_core::ServiceKind;

    #[test]
    fn test_lookup_by_name_and_type() {
        let log = CallLog::default();
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(RecordingService::new(
            "proxmox",
            ServiceKind::ProxmoxUser,
            log.clone(),
        )));
        registry.register(Arc::new(RecordingService::new(
            "guacamole",
            ServiceKind::GuacamoleUser,
            log,
        )));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_type("PROXMOX_USER ").unwrap().name(), "proxmox");
        assert_eq!(registry.by_name("guacamole").unwrap().kind(), ServiceKind::GuacamoleUser);
        assert!(registry.by_type("terraform_workspace").is_none());
        assert!(registry.by_name("missing").is_none());
        assert_eq!(registry.names(), vec!["proxmox", "guacamole"]);
    }

    #[test]
    fn test_name_collision_last_write_wins() {
        let log = CallLog::default();
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(RecordingService::new(
            "infra",
            ServiceKind::ProxmoxUser,
            log.clone(),
        )));
        registry.register(Arc::new(RecordingService::new(
            "infra",
            ServiceKind::TerraformWorkspace,
            log,
        )));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.by_name("infra").unwrap().kind(),
            ServiceKind::TerraformWorkspace
        );
        // The replaced service's type no longer dispatches
        assert!(registry.by_type("proxmox_user").is_none());
        assert!(registry.by_type("terraform_workspace").is_some());
    }
}
