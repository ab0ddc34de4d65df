//! Service catalog file.
//!
//! ```yaml
//! services:
//!   - id: pve-main
//!     name: Proxmox cluster
//!     service_type: proxmox_user
//!     settings:
//!       endpoint: https://pve.example:8006
//!       token: ${PVE_TOKEN}
//! limits:
//!   - service_id: pve-main
//!     max_labs: 20
//!     max_duration: 14400
//! ```
//!
//! `${VAR}` references in setting values are expanded from the environment
//! at load time so that secrets stay out of the file.

use std::fs;
use std::path::Path;

use lab_core::{ServiceConfig, ServiceLimit};
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceCatalog {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub limits: Vec<ServiceLimit>,
}

impl ServiceCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut catalog: ServiceCatalog =
            serde_yaml_ng::from_str(content).map_err(|source| ConfigError::Parse {
                path: Default::default(),
                source,
            })?;
        catalog.expand_settings()?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn expand_settings(&mut self) -> Result<()> {
        for service in &mut self.services {
            for value in service.settings.values_mut() {
                let expanded = shellexpand::env(value.as_str())
                    .map_err(|e| ConfigError::MissingVariable(e.var_name))?;
                *value = expanded.into_owned();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        for service in &self.services {
            if !ids.insert(service.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service id '{}'",
                    service.id
                )));
            }
            service.kind()?;
        }

        for limit in &self.limits {
            if !ids.contains(limit.service_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "limit references unknown service '{}'",
                    limit.service_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    #[serial]
    fn test_parse_catalog_expands_env() {
        std::env::set_var("LAB_TEST_PVE_TOKEN", "tok-123");
        let catalog = ServiceCatalog::parse(
            r#"
services:
  - id: pve-main
    name: Proxmox
    service_type: proxmox_user
    settings:
      endpoint: https://pve.example:8006
      token: ${LAB_TEST_PVE_TOKEN}
  - id: guac
    name: Desktop
    service_type: guacamole_user
    is_active: false
limits:
  - service_id: pve-main
    max_labs: 3
    max_duration: 3600
"#,
        )
        .unwrap();
        std::env::remove_var("LAB_TEST_PVE_TOKEN");

        assert_eq!(catalog.services.len(), 2);
        assert_eq!(catalog.services[0].setting("token"), Some("tok-123"));
        assert!(!catalog.services[1].is_active);
        assert_eq!(catalog.limits[0].max_labs, Some(3));
        assert_eq!(
            catalog.limits[0].max_duration,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    #[serial]
    fn test_missing_env_variable_is_reported() {
        std::env::remove_var("LAB_TEST_UNSET_VAR");
        let err = ServiceCatalog::parse(
            "services:\n  - id: a\n    name: A\n    service_type: script\n    settings:\n      token: ${LAB_TEST_UNSET_VAR}\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable(ref v) if v == "LAB_TEST_UNSET_VAR"));
    }

    #[test]
    fn test_limit_for_unknown_service_is_invalid() {
        let err = ServiceCatalog::parse("limits:\n  - service_id: ghost\n    max_labs: 1\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_service_ids_are_invalid() {
        let err = ServiceCatalog::parse(
            "services:\n  - id: a\n    name: A\n    service_type: script\n  - id: a\n    name: B\n    service_type: script\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
