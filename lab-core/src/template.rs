use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::Result;

/// One entry of a template: which service config to set up, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    pub name: String,
    pub service_id: String,
    #[serde(default)]
    pub description: String,
}

impl ServiceReference {
    pub fn new(name: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_id: service_id.into(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Lab lifetime, e.g. `"2h"` or `"1h30m"`.
    pub expiration: String,
    #[serde(default)]
    pub services: Vec<ServiceReference>,
}

impl LabTemplate {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        expiration: impl Into<String>,
        services: Vec<ServiceReference>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            expiration: expiration.into(),
            services,
        }
    }

    pub fn expiration_duration(&self) -> Result<Duration> {
        parse_duration(&self.expiration)
    }

    pub fn references_service(&self, service_id: &str) -> bool {
        self.services.iter().any(|s| s.service_id == service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_template() {
        let yaml = r#"
id: k8s-intro
name: Kubernetes Intro
expiration: 3h
services:
  - name: Cloud project
    service_id: openstack-main
    description: Tenant for the cluster nodes
  - name: Desktop
    service_id: guac-main
"#;
        let template: LabTemplate =
            serde_yaml_ng::from_str(yaml).expect("should deserialize template");
        assert_eq!(template.services.len(), 2);
        assert_eq!(template.services[1].service_id, "guac-main");
        assert_eq!(
            template.expiration_duration().unwrap(),
            Duration::from_secs(3 * 3600)
        );
        assert!(template.references_service("openstack-main"));
        assert!(!template.references_service("pve-main"));
    }
}
