//! Core data model for ephemeral lab environments.
//!
//! Labs, credentials, service configurations, templates and the service-kind
//! conventions shared by the configuration loader and the orchestrator.

pub mod duration;
pub mod error;
pub mod kind;
pub mod lab;
pub mod service_config;
pub mod template;

pub use error::{CoreError, Result};
pub use kind::{lab_resource_name, CleanupParams, ServiceKind};
pub use lab::{Credential, Lab, LabStatus, NewCredential};
pub use service_config::{ServiceConfig, ServiceLimit};
pub use template::{LabTemplate, ServiceReference};
