//! Template discovery.
//!
//! Each `*.yaml` / `*.yml` file in the templates directory holds exactly one
//! `LabTemplate`. A file that fails to parse or validate is logged and
//! skipped so that one bad template never hides the others.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use lab_core::LabTemplate;
use tracing::{debug, warn};

use crate::error::{ConfigError, Result};

/// Load every template in `dir`. A missing directory yields no templates.
pub fn load_templates_from_dir(dir: &Path) -> Result<Vec<LabTemplate>> {
    let mut templates: Vec<LabTemplate> = Vec::new();

    if !dir.exists() {
        debug!("Template directory {} does not exist", dir.display());
        return Ok(templates);
    }

    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    let mut seen = HashSet::new();
    for path in paths {
        match load_template_file(&path) {
            Ok(template) => {
                if !seen.insert(template.id.clone()) {
                    warn!(
                        "Duplicate template id '{}' in {}, keeping the first definition",
                        template.id,
                        path.display()
                    );
                    continue;
                }
                templates.push(template);
            }
            Err(e) => warn!("Skipping template {}: {}", path.display(), e),
        }
    }

    Ok(templates)
}

pub fn load_template_file(path: &Path) -> Result<LabTemplate> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let template: LabTemplate =
        serde_yaml_ng::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    validate_template(&template)?;
    Ok(template)
}

/// Structural checks that need no knowledge of the service catalog.
pub fn validate_template(template: &LabTemplate) -> Result<()> {
    if template.id.trim().is_empty() {
        return Err(ConfigError::Invalid("template id must not be empty".into()));
    }

    template.expiration_duration()?;

    let mut seen = HashSet::new();
    for reference in &template.services {
        if reference.service_id.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "template '{}' has a service reference without service_id",
                template.id
            )));
        }
        if !seen.insert(reference.service_id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "template '{}' references service '{}' more than once",
                template.id, reference.service_id
            )));
        }
    }

    Ok(())
}
