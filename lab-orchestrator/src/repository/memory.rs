use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use lab_core::{Credential, Lab, LabStatus, ServiceConfig, ServiceLimit};
use tokio::sync::RwLock;

use super::LabRepository;
use crate::error::{OrchestratorError, Result};

/// Repository kept entirely in process memory behind one coarse lock.
#[derive(Debug, Default)]
pub struct InMemoryLabRepository {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    labs: HashMap<String, Lab>,
    configs: IndexMap<String, ServiceConfig>,
    limits: IndexMap<String, ServiceLimit>,
}

impl InMemoryLabRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut labs: Vec<Lab>) -> Vec<Lab> {
    labs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    labs
}

#[async_trait]
impl LabRepository for InMemoryLabRepository {
    async fn create_lab(&self, lab: &Lab) -> Result<()> {
        let mut state = self.state.write().await;
        if state.labs.contains_key(&lab.id) {
            return Err(OrchestratorError::InvalidInput(format!(
                "lab {} already exists",
                lab.id
            )));
        }
        state.labs.insert(lab.id.clone(), lab.clone());
        Ok(())
    }

    async fn get_lab_by_id(&self, id: &str) -> Result<Lab> {
        let state = self.state.read().await;
        state
            .labs
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::lab_not_found(id))
    }

    async fn get_labs_by_owner_id(&self, owner_id: &str) -> Result<Vec<Lab>> {
        let state = self.state.read().await;
        Ok(newest_first(
            state
                .labs
                .values()
                .filter(|lab| lab.owner_id == owner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_all_labs(&self) -> Result<Vec<Lab>> {
        let state = self.state.read().await;
        Ok(newest_first(state.labs.values().cloned().collect()))
    }

    async fn get_labs_by_status(&self, status: LabStatus) -> Result<Vec<Lab>> {
        let state = self.state.read().await;
        Ok(newest_first(
            state
                .labs
                .values()
                .filter(|lab| lab.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn get_expired_labs(&self, now: DateTime<Utc>) -> Result<Vec<Lab>> {
        let state = self.state.read().await;
        let mut labs: Vec<Lab> = state
            .labs
            .values()
            .filter(|lab| lab.status.is_active() && lab.is_expired_at(now))
            .cloned()
            .collect();
        labs.sort_by(|a, b| a.ends_at.cmp(&b.ends_at));
        Ok(labs)
    }

    async fn update_lab(&self, lab: &Lab) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .labs
            .get_mut(&lab.id)
            .ok_or_else(|| OrchestratorError::lab_not_found(&lab.id))?;
        let credentials = std::mem::take(&mut stored.credentials);
        *stored = Lab {
            credentials,
            ..lab.clone()
        };
        Ok(())
    }

    async fn delete_lab(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .labs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::lab_not_found(id))
    }

    async fn create_credential(&self, credential: &Credential) -> Result<()> {
        let mut state = self.state.write().await;
        let lab = state
            .labs
            .get_mut(&credential.lab_id)
            .ok_or_else(|| OrchestratorError::lab_not_found(&credential.lab_id))?;
        lab.credentials.push(credential.clone());
        Ok(())
    }

    async fn get_credentials_by_lab_id(&self, lab_id: &str) -> Result<Vec<Credential>> {
        let state = self.state.read().await;
        Ok(state
            .labs
            .get(lab_id)
            .map(|lab| lab.credentials.clone())
            .unwrap_or_default())
    }

    async fn save_service_config(&self, config: &ServiceConfig) -> Result<()> {
        let mut state = self.state.write().await;
        state.configs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn get_service_config(&self, id: &str) -> Result<Option<ServiceConfig>> {
        Ok(self.state.read().await.configs.get(id).cloned())
    }

    async fn list_service_configs(&self) -> Result<Vec<ServiceConfig>> {
        Ok(self.state.read().await.configs.values().cloned().collect())
    }

    async fn delete_service_config(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.configs.shift_remove(id).ok_or_else(|| OrchestratorError::NotFound {
            entity: "Service config",
            id: id.to_string(),
        })?;
        state.limits.shift_remove(id);
        Ok(())
    }

    async fn save_service_limit(&self, limit: &ServiceLimit) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.configs.contains_key(&limit.service_id) {
            return Err(OrchestratorError::NotFound {
                entity: "Service config",
                id: limit.service_id.clone(),
            });
        }
        state.limits.insert(limit.service_id.clone(), limit.clone());
        Ok(())
    }

    async fn get_service_limit(&self, service_id: &str) -> Result<Option<ServiceLimit>> {
        Ok(self.state.read().await.limits.get(service_id).cloned())
    }

    async fn list_service_limits(&self) -> Result<Vec<ServiceLimit>> {
        Ok(self.state.read().await.limits.values().cloned().collect())
    }

    async fn delete_service_limit(&self, service_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .limits
            .shift_remove(service_id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "Service limit",
                id: service_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lab_core::NewCredential;

    #[tokio::test]
    async fn test_update_keeps_stored_credentials() {
        let repo = InMemoryLabRepository::new();
        let lab = Lab::new("lab", "alice", None, Duration::hours(1));
        repo.create_lab(&lab).await.unwrap();

        let cred = NewCredential::new("SSH", "lab-user", "pw").into_credential(&lab.id, lab.ends_at);
        repo.create_credential(&cred).await.unwrap();

        // A stale copy without credentials must not wipe them
        let mut stale = lab.clone();
        stale.service_data.insert("k".into(), "v".into());
        repo.update_lab(&stale).await.unwrap();

        let stored = repo.get_lab_by_id(&lab.id).await.unwrap();
        assert_eq!(stored.credentials.len(), 1);
        assert_eq!(stored.service_data.get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_delete_cascades_credentials() {
        let repo = InMemoryLabRepository::new();
        let lab = Lab::new("lab", "alice", None, Duration::hours(1));
        repo.create_lab(&lab).await.unwrap();
        let cred = NewCredential::new("SSH", "u", "p").into_credential(&lab.id, lab.ends_at);
        repo.create_credential(&cred).await.unwrap();

        repo.delete_lab(&lab.id).await.unwrap();
        assert!(repo.get_credentials_by_lab_id(&lab.id).await.unwrap().is_empty());
        assert!(repo.get_lab_by_id(&lab.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_expired_query_skips_failed_and_expired_labs() {
        let repo = InMemoryLabRepository::new();
        let now = chrono::Utc::now();
        let mut labs = Vec::new();
        for status in [LabStatus::Ready, LabStatus::Error, LabStatus::Expired] {
            let mut lab = Lab::new(status.as_str(), "alice", None, Duration::hours(1));
            lab.status = status;
            lab.ends_at = now - Duration::minutes(1);
            repo.create_lab(&lab).await.unwrap();
            labs.push(lab);
        }

        let due = repo.get_expired_labs(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, labs[0].id);
    }

    #[tokio::test]
    async fn test_limit_requires_known_config() {
        let repo = InMemoryLabRepository::new();
        let limit = ServiceLimit {
            service_id: "ghost".into(),
            max_labs: Some(1),
            max_duration: None,
            is_active: true,
        };
        assert!(repo.save_service_limit(&limit).await.is_err());
    }
}
