//! Per-lab mutation handle.
//!
//! Every status or `service_data` change to a live lab goes through its
//! [`LabHandle`], whoever makes it (pipeline, stop, admin cleanup, sweeper).
//! The lock is never held across a service call.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use lab_core::{Lab, LabStatus};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::repository::LabRepository;

#[derive(Clone, Debug)]
pub struct LabHandle {
    id: Arc<str>,
    inner: Arc<Mutex<Lab>>,
}

impl LabHandle {
    pub fn new(lab: Lab) -> Self {
        Self {
            id: Arc::from(lab.id.as_str()),
            inner: Arc::new(Mutex::new(lab)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, Lab> {
        self.inner.lock().await
    }

    pub async fn snapshot(&self) -> Lab {
        self.inner.lock().await.clone()
    }

    pub async fn status(&self) -> LabStatus {
        self.inner.lock().await.status
    }

    pub async fn service_data(&self, key: &str) -> Option<String> {
        self.inner.lock().await.service_data.get(key).cloned()
    }

    pub async fn set_service_data(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut lab = self.inner.lock().await;
        lab.service_data.insert(key.into(), value.into());
        lab.touch();
    }

    pub async fn remove_service_data(&self, key: &str) -> Option<String> {
        let mut lab = self.inner.lock().await;
        let removed = lab.service_data.remove(key);
        if removed.is_some() {
            lab.touch();
        }
        removed
    }

    /// Write the current state through to the repository. The lock is held
    /// for the write so a concurrent mutation cannot be overwritten by an
    /// older snapshot.
    pub async fn persist(&self, repository: &dyn LabRepository) -> Result<()> {
        let lab = self.inner.lock().await;
        repository.update_lab(&lab).await
    }
}

/// Handles for the labs the process is currently working on.
#[derive(Debug, Default)]
pub struct LabHandles {
    handles: RwLock<HashMap<String, LabHandle>>,
}

impl LabHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, lab_id: &str) -> Option<LabHandle> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(lab_id)
            .cloned()
    }

    /// Register `lab`, or return the handle already registered for its id.
    pub fn insert(&self, lab: Lab) -> LabHandle {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        handles
            .entry(lab.id.clone())
            .or_insert_with(|| LabHandle::new(lab))
            .clone()
    }

    /// The live handle, or one freshly loaded from the repository.
    pub async fn get_or_load(&self, lab_id: &str, repository: &dyn LabRepository) -> Result<LabHandle> {
        if let Some(handle) = self.get(lab_id) {
            return Ok(handle);
        }
        let lab = repository.get_lab_by_id(lab_id).await?;
        Ok(self.insert(lab))
    }

    pub fn remove(&self, lab_id: &str) -> Option<LabHandle> {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(lab_id)
    }

    pub fn len(&self) -> usize {
        self.handles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryLabRepository;
    use chrono::Duration;

    #[tokio::test]
    async fn test_persist_writes_current_state() {
        let repo = InMemoryLabRepository::new();
        let lab = Lab::new("lab", "alice", None, Duration::hours(1));
        repo.create_lab(&lab).await.unwrap();

        let handle = LabHandle::new(lab.clone());
        handle.set_service_data("proxmox.pool", "lab-x-pool").await;
        handle.persist(&repo).await.unwrap();

        let stored = repo.get_lab_by_id(&lab.id).await.unwrap();
        assert_eq!(
            stored.service_data.get("proxmox.pool").map(String::as_str),
            Some("lab-x-pool")
        );
    }

    #[tokio::test]
    async fn test_get_or_load_shares_one_handle() {
        let repo = InMemoryLabRepository::new();
        let lab = Lab::new("lab", "alice", None, Duration::hours(1));
        repo.create_lab(&lab).await.unwrap();

        let handles = LabHandles::new();
        let a = handles.get_or_load(&lab.id, &repo).await.unwrap();
        let b = handles.get_or_load(&lab.id, &repo).await.unwrap();
        a.set_service_data("k", "v").await;
        assert_eq!(b.service_data("k").await.as_deref(), Some("v"));
        assert_eq!(handles.len(), 1);

        handles.remove(&lab.id);
        assert!(handles.is_empty());
    }
}
