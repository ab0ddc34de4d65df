//! Service kinds and the per-kind identifier conventions.
//!
//! A `ServiceConfig` names its kind with a plain string (`service_type`). The
//! well-known kinds get their own variant so that step checklists and cleanup
//! parameters are typed; anything else is carried as `Custom` and dispatched
//! purely through the registry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

pub const OPENSTACK_PROJECT: &str = "openstack_project";
pub const PROXMOX_USER: &str = "proxmox_user";
pub const TERRAFORM_WORKSPACE: &str = "terraform_workspace";
pub const GUACAMOLE_USER: &str = "guacamole_user";

const DEFAULT_USER_DOMAIN: &str = "labs.local";
const DEFAULT_PROXMOX_REALM: &str = "pve";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Cloud control-plane project with a dedicated user and API key.
    OpenstackProject,
    /// Hypervisor user account with its own resource pool.
    ProxmoxUser,
    /// Infrastructure-as-code workspace.
    TerraformWorkspace,
    /// Remote-desktop gateway account.
    GuacamoleUser,
    Custom(String),
}

impl ServiceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceKind::OpenstackProject => OPENSTACK_PROJECT,
            ServiceKind::ProxmoxUser => PROXMOX_USER,
            ServiceKind::TerraformWorkspace => TERRAFORM_WORKSPACE,
            ServiceKind::GuacamoleUser => GUACAMOLE_USER,
            ServiceKind::Custom(name) => name,
        }
    }

    /// The checklist a service of this kind reports progress against.
    pub fn expected_steps(&self) -> Vec<String> {
        let steps: &[&str] = match self {
            ServiceKind::OpenstackProject => &[
                "Create Project",
                "Create User",
                "Configure Access",
                "Generate API Key",
                "Create Edge Token",
            ],
            ServiceKind::ProxmoxUser => &[
                "Create User",
                "Create Resource Pool",
                "Allocate VLAN",
                "Assign Permissions",
            ],
            ServiceKind::TerraformWorkspace => {
                &["Create Workspace", "Configure Variables", "Apply Plan"]
            }
            ServiceKind::GuacamoleUser => {
                &["Create User", "Create Connection", "Grant Permissions"]
            }
            ServiceKind::Custom(_) => &["Setup"],
        };
        steps.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "" => return Err(CoreError::EmptyServiceType),
            OPENSTACK_PROJECT => ServiceKind::OpenstackProject,
            PROXMOX_USER => ServiceKind::ProxmoxUser,
            TERRAFORM_WORKSPACE => ServiceKind::TerraformWorkspace,
            GUACAMOLE_USER => ServiceKind::GuacamoleUser,
            _ => ServiceKind::Custom(normalized),
        })
    }
}

impl Serialize for ServiceKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServiceKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Base name every per-lab remote object is derived from.
pub fn lab_resource_name(lab_id: &str) -> String {
    format!("lab-{lab_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenstackProjectParams {
    pub project_name: String,
    pub user_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxmoxUserParams {
    pub username: String,
    pub pool: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerraformWorkspaceParams {
    pub workspace_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuacamoleUserParams {
    pub username: String,
}

/// Explicit identifiers handed to a cleanup call when no live setup context
/// exists, e.g. admin-triggered cleanup for a lab that was never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleanupParams {
    OpenstackProject(OpenstackProjectParams),
    ProxmoxUser(ProxmoxUserParams),
    TerraformWorkspace(TerraformWorkspaceParams),
    GuacamoleUser(GuacamoleUserParams),
    Custom { values: BTreeMap<String, String> },
}

impl CleanupParams {
    /// Derive the identifiers a service of `kind` would have created for
    /// `lab_id`. `settings` may override the naming domain (`user_domain`)
    /// or authentication realm (`realm`); no other setting is copied, so
    /// secrets in a config never end up in cleanup parameters.
    pub fn synthesize(
        kind: &ServiceKind,
        lab_id: &str,
        settings: &BTreeMap<String, String>,
    ) -> Self {
        let base = lab_resource_name(lab_id);
        match kind {
            ServiceKind::OpenstackProject => {
                let domain = settings
                    .get("user_domain")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_USER_DOMAIN);
                CleanupParams::OpenstackProject(OpenstackProjectParams {
                    project_name: base,
                    user_email: format!("lab+{lab_id}@{domain}"),
                })
            }
            ServiceKind::ProxmoxUser => {
                let realm = settings
                    .get("realm")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_PROXMOX_REALM);
                CleanupParams::ProxmoxUser(ProxmoxUserParams {
                    username: format!("{base}@{realm}"),
                    pool: format!("{base}-pool"),
                })
            }
            ServiceKind::TerraformWorkspace => {
                CleanupParams::TerraformWorkspace(TerraformWorkspaceParams {
                    workspace_name: base,
                })
            }
            ServiceKind::GuacamoleUser => {
                CleanupParams::GuacamoleUser(GuacamoleUserParams { username: base })
            }
            ServiceKind::Custom(_) => {
                let mut values = BTreeMap::new();
                values.insert("lab_id".to_string(), lab_id.to_string());
                values.insert("resource_name".to_string(), base);
                CleanupParams::Custom { values }
            }
        }
    }

    /// Replace identifiers with the explicitly given ones. Keys that do not
    /// belong to the kind are ignored, except for `Custom` which takes all.
    pub fn with_overrides(self, overrides: &BTreeMap<String, String>) -> Self {
        let pick = |key: &str, fallback: String| overrides.get(key).cloned().unwrap_or(fallback);

        match self {
            CleanupParams::OpenstackProject(p) => {
                CleanupParams::OpenstackProject(OpenstackProjectParams {
                    project_name: pick("project_name", p.project_name),
                    user_email: pick("user_email", p.user_email),
                })
            }
            CleanupParams::ProxmoxUser(p) => CleanupParams::ProxmoxUser(ProxmoxUserParams {
                username: pick("username", p.username),
                pool: pick("pool", p.pool),
            }),
            CleanupParams::TerraformWorkspace(p) => {
                CleanupParams::TerraformWorkspace(TerraformWorkspaceParams {
                    workspace_name: pick("workspace_name", p.workspace_name),
                })
            }
            CleanupParams::GuacamoleUser(p) => {
                CleanupParams::GuacamoleUser(GuacamoleUserParams {
                    username: pick("username", p.username),
                })
            }
            CleanupParams::Custom { mut values } => {
                values.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
                CleanupParams::Custom { values }
            }
        }
    }

    /// Flatten into key/value pairs, e.g. for seeding a synthetic lab's
    /// service data.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        match self {
            CleanupParams::OpenstackProject(p) => {
                map.insert("project_name".to_string(), p.project_name.clone());
                map.insert("user_email".to_string(), p.user_email.clone());
            }
            CleanupParams::ProxmoxUser(p) => {
                map.insert("username".to_string(), p.username.clone());
                map.insert("pool".to_string(), p.pool.clone());
            }
            CleanupParams::TerraformWorkspace(p) => {
                map.insert("workspace_name".to_string(), p.workspace_name.clone());
            }
            CleanupParams::GuacamoleUser(p) => {
                map.insert("username".to_string(), p.username.clone());
            }
            CleanupParams::Custom { values } => map.extend(values.clone()),
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_kinds() {
        assert_eq!(
            "proxmox_user".parse::<ServiceKind>().unwrap(),
            ServiceKind::ProxmoxUser
        );
        assert_eq!(
            " OpenStack_Project ".parse::<ServiceKind>().unwrap(),
            ServiceKind::OpenstackProject
        );
        assert_eq!(
            "script".parse::<ServiceKind>().unwrap(),
            ServiceKind::Custom("script".to_string())
        );
        assert!("  ".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_kind_round_trips_through_display() {
        for kind in [
            ServiceKind::OpenstackProject,
            ServiceKind::ProxmoxUser,
            ServiceKind::TerraformWorkspace,
            ServiceKind::GuacamoleUser,
        ] {
            assert_eq!(kind.to_string().parse::<ServiceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_expected_steps_for_cloud_project() {
        let steps = ServiceKind::OpenstackProject.expected_steps();
        assert_eq!(
            steps,
            vec![
                "Create Project",
                "Create User",
                "Configure Access",
                "Generate API Key",
                "Create Edge Token"
            ]
        );
        assert_eq!(ServiceKind::Custom("x".into()).expected_steps(), vec!["Setup"]);
    }

    #[test]
    fn test_synthesize_proxmox_identifiers() {
        let params =
            CleanupParams::synthesize(&ServiceKind::ProxmoxUser, "abc123", &BTreeMap::new());
        assert_eq!(
            params,
            CleanupParams::ProxmoxUser(ProxmoxUserParams {
                username: "lab-abc123@pve".to_string(),
                pool: "lab-abc123-pool".to_string(),
            })
        );
    }

    #[test]
    fn test_synthesize_openstack_uses_configured_domain() {
        let mut settings = BTreeMap::new();
        settings.insert("user_domain".to_string(), "example.org".to_string());
        let params =
            CleanupParams::synthesize(&ServiceKind::OpenstackProject, "abc123", &settings);
        assert_eq!(
            params,
            CleanupParams::OpenstackProject(OpenstackProjectParams {
                project_name: "lab-abc123".to_string(),
                user_email: "lab+abc123@example.org".to_string(),
            })
        );
    }

    #[test]
    fn test_overrides_ignore_foreign_keys() {
        let mut overrides = BTreeMap::new();
        overrides.insert("pool".to_string(), "legacy-pool".to_string());
        overrides.insert("project_name".to_string(), "ignored".to_string());
        let params = CleanupParams::synthesize(&ServiceKind::ProxmoxUser, "abc123", &BTreeMap::new())
            .with_overrides(&overrides);
        assert_eq!(
            params,
            CleanupParams::ProxmoxUser(ProxmoxUserParams {
                username: "lab-abc123@pve".to_string(),
                pool: "legacy-pool".to_string(),
            })
        );
    }

    #[test]
    fn test_custom_params_carry_lab_id() {
        let params = CleanupParams::synthesize(
            &ServiceKind::Custom("script".into()),
            "xyz",
            &BTreeMap::new(),
        );
        let map = params.to_map();
        assert_eq!(map.get("lab_id").map(String::as_str), Some("xyz"));
        assert_eq!(map.get("resource_name").map(String::as_str), Some("lab-xyz"));
    }

    #[test]
    fn test_custom_params_leave_settings_out() {
        let mut settings = BTreeMap::new();
        settings.insert("api_token".to_string(), "hunter2".to_string());
        settings.insert("setup_command".to_string(), "./up.sh".to_string());
        let mut overrides = BTreeMap::new();
        overrides.insert("bucket".to_string(), "lab-xyz-data".to_string());

        let map = CleanupParams::synthesize(&ServiceKind::Custom("script".into()), "xyz", &settings)
            .with_overrides(&overrides)
            .to_map();

        assert_eq!(
            map.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["bucket", "lab_id", "resource_name"]
        );
        assert!(!map.values().any(|v| v == "hunter2"));
    }
}
