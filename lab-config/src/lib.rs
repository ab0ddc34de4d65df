//! Configuration for the lab orchestrator: engine settings, lab templates
//! and the service catalog.

pub mod catalog;
pub mod config;
pub mod error;
pub mod templates;

pub use catalog::ServiceCatalog;
pub use config::{CleanupPolicy, LabConfig};
pub use error::{ConfigError, Result};
pub use templates::{load_template_file, load_templates_from_dir, validate_template};
