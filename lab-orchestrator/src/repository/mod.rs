//! Storage collaborator for labs, credentials and the service catalog.
//!
//! The engine only depends on [`LabRepository`]; two implementations ship
//! with the crate: an in-memory one for tests and single-shot tools, and a
//! SQLite one for the daemon.

mod memory;
mod sqlite;

pub use memory::InMemoryLabRepository;
pub use sqlite::SqliteLabRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lab_core::{Credential, Lab, LabStatus, ServiceConfig, ServiceLimit};

use crate::error::Result;

#[async_trait]
pub trait LabRepository: Send + Sync {
    async fn create_lab(&self, lab: &Lab) -> Result<()>;

    /// Fails with `NotFound` when no lab has this id. Credentials are loaded.
    async fn get_lab_by_id(&self, id: &str) -> Result<Lab>;

    async fn get_labs_by_owner_id(&self, owner_id: &str) -> Result<Vec<Lab>>;

    async fn get_all_labs(&self) -> Result<Vec<Lab>>;

    async fn get_labs_by_status(&self, status: LabStatus) -> Result<Vec<Lab>>;

    /// Labs whose `ends_at` is before `now` and which are not yet `Expired`.
    async fn get_expired_labs(&self, now: DateTime<Utc>) -> Result<Vec<Lab>>;

    /// Write every lab field except credentials, which are append-only
    /// through [`LabRepository::create_credential`].
    async fn update_lab(&self, lab: &Lab) -> Result<()>;

    /// Remove the lab and its credentials.
    async fn delete_lab(&self, id: &str) -> Result<()>;

    async fn create_credential(&self, credential: &Credential) -> Result<()>;

    async fn get_credentials_by_lab_id(&self, lab_id: &str) -> Result<Vec<Credential>>;

    /// Insert or replace a service config.
    async fn save_service_config(&self, config: &ServiceConfig) -> Result<()>;

    async fn get_service_config(&self, id: &str) -> Result<Option<ServiceConfig>>;

    async fn list_service_configs(&self) -> Result<Vec<ServiceConfig>>;

    async fn delete_service_config(&self, id: &str) -> Result<()>;

    /// Insert or replace the limit for `limit.service_id`.
    async fn save_service_limit(&self, limit: &ServiceLimit) -> Result<()>;

    async fn get_service_limit(&self, service_id: &str) -> Result<Option<ServiceLimit>>;

    async fn list_service_limits(&self) -> Result<Vec<ServiceLimit>>;

    async fn delete_service_limit(&self, service_id: &str) -> Result<()>;
}
