//! Wiring: database, catalog, templates, services and the lab manager.

use std::sync::Arc;

use anyhow::{Context, Result};
use lab_config::{load_templates_from_dir, LabConfig, ServiceCatalog};
use lab_orchestrator::db::{backup_database, create_pool, run_migrations};
use lab_orchestrator::{
    LabManager, LabRepository, OrchestratorSettings, ServiceRegistry, SqliteLabRepository,
    TagAllocator, TemplateCatalog,
};
use tracing::info;

use crate::services::{register_builtin, reserve_recorded_tags};

pub struct Daemon {
    pub config: LabConfig,
    pub repository: Arc<SqliteLabRepository>,
    pub manager: Arc<LabManager>,
}

impl Daemon {
    /// Open the database and build the manager. With `backup`, the existing
    /// database file is copied aside before migrations run.
    pub async fn open(config: LabConfig, backup: bool) -> Result<Self> {
        let db_path = &config.db_path;
        info!("Database path: {}", db_path.display());

        if backup {
            if let Some(backup_path) = backup_database(db_path)? {
                info!("Database backed up to: {}", backup_path.display());
            }
        }

        let pool = create_pool(db_path).await?;
        run_migrations(&pool).await?;
        let repository = Arc::new(SqliteLabRepository::new(pool));

        if let Some(path) = &config.services_file {
            let catalog = ServiceCatalog::load(path)?;
            seed_catalog(repository.as_ref(), &catalog).await?;
        }

        let templates = load_templates_from_dir(&config.templates_dir)?;
        info!(
            "Loaded {} template(s) from {}",
            templates.len(),
            config.templates_dir.display()
        );
        let templates = Arc::new(TemplateCatalog::from_templates(templates));

        let (low, high) = config.vlan_tags()?;
        let allocator = Arc::new(TagAllocator::new(low, high)?);
        let labs = repository.get_all_labs().await?;
        let reserved = reserve_recorded_tags(&labs, &allocator);
        if reserved > 0 {
            info!("Reserved {} VLAN tag(s) held by active labs", reserved);
        }

        let registry = Arc::new(ServiceRegistry::new());
        register_builtin(&registry, allocator);

        let settings = OrchestratorSettings::from_config(&config)?;
        let manager = Arc::new(LabManager::new(
            repository.clone(),
            registry,
            templates,
            settings,
        ));

        Ok(Self {
            config,
            repository,
            manager,
        })
    }

    /// Re-read the templates directory, replacing the whole catalog. Labs
    /// already running keep the template they were created from.
    pub fn reload_templates(&self) -> Result<usize> {
        let templates = load_templates_from_dir(&self.config.templates_dir)?;
        let count = templates.len();
        self.manager.templates().replace_all(templates);
        Ok(count)
    }
}

/// Upsert the catalog's configs and limits. Entries missing from the file
/// are left in place: labs may still reference them for cleanup.
pub async fn seed_catalog(repository: &dyn LabRepository, catalog: &ServiceCatalog) -> Result<()> {
    for config in &catalog.services {
        repository
            .save_service_config(config)
            .await
            .with_context(|| format!("failed to save service config '{}'", config.id))?;
    }
    for limit in &catalog.limits {
        repository
            .save_service_limit(limit)
            .await
            .with_context(|| format!("failed to save limit for '{}'", limit.service_id))?;
    }
    info!(
        "Service catalog seeded: {} config(s), {} limit(s)",
        catalog.services.len(),
        catalog.limits.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_orchestrator::InMemoryLabRepository;
    use std::fs;
    use tempfile::TempDir;

    const CATALOG: &str = r#"
services:
  - id: net
    name: Lab network
    service_type: script
    settings:
      setup_command: "true"
limits:
  - service_id: net
    max_labs: 2
"#;

    #[tokio::test]
    async fn test_seed_catalog_is_idempotent() {
        let repo = InMemoryLabRepository::new();
        let catalog = ServiceCatalog::parse(CATALOG).unwrap();

        seed_catalog(&repo, &catalog).await.unwrap();
        seed_catalog(&repo, &catalog).await.unwrap();

        assert_eq!(repo.list_service_configs().await.unwrap().len(), 1);
        assert_eq!(
            repo.get_service_limit("net").await.unwrap().and_then(|l| l.max_labs),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_open_wires_everything() {
        let dir = TempDir::new().unwrap();
        let templates_dir = dir.path().join("templates");
        fs::create_dir_all(&templates_dir).unwrap();
        fs::write(
            templates_dir.join("net.yaml"),
            "id: net-lab\nname: Network lab\nexpiration: 1h\nservices:\n  - name: Network\n    service_id: net\n",
        )
        .unwrap();
        let services_file = dir.path().join("services.yaml");
        fs::write(&services_file, CATALOG).unwrap();

        let config = LabConfig {
            db_path: dir.path().join("labd.db"),
            templates_dir,
            services_file: Some(services_file),
            ..LabConfig::default()
        };
        let daemon = Daemon::open(config, true).await.unwrap();

        assert!(daemon.manager.templates().get("net-lab").is_some());
        assert!(daemon.manager.registry().by_type("script").is_some());
        assert_eq!(daemon.repository.list_service_configs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_templates_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        let templates_dir = dir.path().join("templates");
        fs::create_dir_all(&templates_dir).unwrap();
        fs::write(
            templates_dir.join("old.yaml"),
            "id: old-lab\nname: Old lab\nexpiration: 1h\nservices: []\n",
        )
        .unwrap();

        let config = LabConfig {
            db_path: dir.path().join("labd.db"),
            templates_dir: templates_dir.clone(),
            services_file: None,
            ..LabConfig::default()
        };
        let daemon = Daemon::open(config, false).await.unwrap();
        assert!(daemon.manager.templates().get("old-lab").is_some());

        fs::remove_file(templates_dir.join("old.yaml")).unwrap();
        fs::write(
            templates_dir.join("new.yaml"),
            "id: new-lab\nname: New lab\nexpiration: 2h\nservices: []\n",
        )
        .unwrap();

        assert_eq!(daemon.reload_templates().unwrap(), 1);
        assert!(daemon.manager.templates().get("new-lab").is_some());
        assert!(daemon.manager.templates().get("old-lab").is_none());
    }
}
