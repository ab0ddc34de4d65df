use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lab_core::{Credential, Lab, LabStatus, ServiceConfig, ServiceLimit};
use sqlx::SqlitePool;

use super::LabRepository;
use crate::error::{OrchestratorError, Result};

const LAB_COLUMNS: &str = "id, name, status, owner_id, template_id, started_at, ends_at, \
                           created_at, updated_at, service_data, used_services";

/// Repository backed by a SQLite database. Timestamps are stored as unix
/// seconds; maps and lists as JSON text.
#[derive(Clone)]
pub struct SqliteLabRepository {
    pool: SqlitePool,
}

impl SqliteLabRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_labs(&self, rows: Vec<LabRow>) -> Result<Vec<Lab>> {
        let mut labs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut lab = Lab::try_from(row)?;
            lab.credentials = self.get_credentials_by_lab_id(&lab.id).await?;
            labs.push(lab);
        }
        Ok(labs)
    }
}

#[async_trait]
impl LabRepository for SqliteLabRepository {
    async fn create_lab(&self, lab: &Lab) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO labs (id, name, status, owner_id, template_id, started_at, ends_at, created_at, updated_at, service_data, used_services)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&lab.id)
        .bind(&lab.name)
        .bind(lab.status.as_str())
        .bind(&lab.owner_id)
        .bind(&lab.template_id)
        .bind(lab.started_at.timestamp())
        .bind(lab.ends_at.timestamp())
        .bind(lab.created_at.timestamp())
        .bind(lab.updated_at.timestamp())
        .bind(serde_json::to_string(&lab.service_data)?)
        .bind(serde_json::to_string(&lab.used_services)?)
        .execute(&self.pool)
        .await?;

        for credential in &lab.credentials {
            self.create_credential(credential).await?;
        }
        Ok(())
    }

    async fn get_lab_by_id(&self, id: &str) -> Result<Lab> {
        let row = sqlx::query_as::<_, LabRow>(&format!("SELECT {LAB_COLUMNS} FROM labs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::lab_not_found(id))?;

        let mut lab = Lab::try_from(row)?;
        lab.credentials = self.get_credentials_by_lab_id(id).await?;
        Ok(lab)
    }

    async fn get_labs_by_owner_id(&self, owner_id: &str) -> Result<Vec<Lab>> {
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs WHERE owner_id = ? ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        self.fetch_labs(rows).await
    }

    async fn get_all_labs(&self) -> Result<Vec<Lab>> {
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        self.fetch_labs(rows).await
    }

    async fn get_labs_by_status(&self, status: LabStatus) -> Result<Vec<Lab>> {
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs WHERE status = ? ORDER BY created_at DESC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.fetch_labs(rows).await
    }

    async fn get_expired_labs(&self, now: DateTime<Utc>) -> Result<Vec<Lab>> {
        let rows = sqlx::query_as::<_, LabRow>(&format!(
            "SELECT {LAB_COLUMNS} FROM labs WHERE ends_at < ? AND status IN (?, ?) ORDER BY ends_at ASC"
        ))
        .bind(now.timestamp())
        .bind(LabStatus::Provisioning.as_str())
        .bind(LabStatus::Ready.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.fetch_labs(rows).await
    }

    async fn update_lab(&self, lab: &Lab) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE labs
            SET name = ?, status = ?, owner_id = ?, template_id = ?, started_at = ?, ends_at = ?,
                updated_at = ?, service_data = ?, used_services = ?
            WHERE id = ?
            "#,
        )
        .bind(&lab.name)
        .bind(lab.status.as_str())
        .bind(&lab.owner_id)
        .bind(&lab.template_id)
        .bind(lab.started_at.timestamp())
        .bind(lab.ends_at.timestamp())
        .bind(lab.updated_at.timestamp())
        .bind(serde_json::to_string(&lab.service_data)?)
        .bind(serde_json::to_string(&lab.used_services)?)
        .bind(&lab.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::lab_not_found(&lab.id));
        }
        Ok(())
    }

    async fn delete_lab(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM credentials WHERE lab_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM labs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::lab_not_found(id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (id, lab_id, label, username, secret, url, notes, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.lab_id)
        .bind(&credential.label)
        .bind(&credential.username)
        .bind(&credential.secret)
        .bind(&credential.url)
        .bind(&credential.notes)
        .bind(credential.expires_at.timestamp())
        .bind(credential.created_at.timestamp())
        .bind(credential.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_credentials_by_lab_id(&self, lab_id: &str) -> Result<Vec<Credential>> {
        let rows = sqlx::query_as::<_, CredentialRow>(
            "SELECT * FROM credentials WHERE lab_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(lab_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Credential::try_from).collect()
    }

    async fn save_service_config(&self, config: &ServiceConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_configs (id, name, service_type, description, settings, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                service_type = excluded.service_type,
                description = excluded.description,
                settings = excluded.settings,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(&config.service_type)
        .bind(&config.description)
        .bind(serde_json::to_string(&config.settings)?)
        .bind(config.is_active)
        .bind(config.created_at.timestamp())
        .bind(config.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_service_config(&self, id: &str) -> Result<Option<ServiceConfig>> {
        let row = sqlx::query_as::<_, ServiceConfigRow>("SELECT * FROM service_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ServiceConfig::try_from).transpose()
    }

    async fn list_service_configs(&self) -> Result<Vec<ServiceConfig>> {
        let rows = sqlx::query_as::<_, ServiceConfigRow>(
            "SELECT * FROM service_configs ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ServiceConfig::try_from).collect()
    }

    async fn delete_service_config(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM service_configs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound {
                entity: "Service config",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn save_service_limit(&self, limit: &ServiceLimit) -> Result<()> {
        if self.get_service_config(&limit.service_id).await?.is_none() {
            return Err(OrchestratorError::NotFound {
                entity: "Service config",
                id: limit.service_id.clone(),
            });
        }

        let max_duration_secs = limit
            .max_duration
            .map(|d| i64::try_from(d.as_secs()))
            .transpose()
            .map_err(|_| OrchestratorError::InvalidInput("max_duration is too large".into()))?;

        sqlx::query(
            r#"
            INSERT INTO service_limits (service_id, max_labs, max_duration_secs, is_active)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(service_id) DO UPDATE SET
                max_labs = excluded.max_labs,
                max_duration_secs = excluded.max_duration_secs,
                is_active = excluded.is_active
            "#,
        )
        .bind(&limit.service_id)
        .bind(limit.max_labs.map(i64::from))
        .bind(max_duration_secs)
        .bind(limit.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_service_limit(&self, service_id: &str) -> Result<Option<ServiceLimit>> {
        let row = sqlx::query_as::<_, ServiceLimitRow>(
            "SELECT * FROM service_limits WHERE service_id = ?",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ServiceLimit::try_from).transpose()
    }

    async fn list_service_limits(&self) -> Result<Vec<ServiceLimit>> {
        let rows = sqlx::query_as::<_, ServiceLimitRow>(
            "SELECT * FROM service_limits ORDER BY service_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ServiceLimit::try_from).collect()
    }

    async fn delete_service_limit(&self, service_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM service_limits WHERE service_id = ?")
            .bind(service_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound {
                entity: "Service limit",
                id: service_id.to_string(),
            });
        }
        Ok(())
    }
}

// Database row types

#[derive(sqlx::FromRow)]
struct LabRow {
    id: String,
    name: String,
    status: String,
    owner_id: String,
    template_id: Option<String>,
    started_at: i64,
    ends_at: i64,
    created_at: i64,
    updated_at: i64,
    service_data: String,
    used_services: String,
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    lab_id: String,
    label: String,
    username: String,
    secret: String,
    url: Option<String>,
    notes: Option<String>,
    expires_at: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct ServiceConfigRow {
    id: String,
    name: String,
    service_type: String,
    description: String,
    settings: String,
    is_active: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct ServiceLimitRow {
    service_id: String,
    max_labs: Option<i64>,
    max_duration_secs: Option<i64>,
    is_active: bool,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| OrchestratorError::InvalidState(format!("invalid stored timestamp {secs}")))
}

impl TryFrom<LabRow> for Lab {
    type Error = OrchestratorError;

    fn try_from(row: LabRow) -> Result<Self> {
        Ok(Lab {
            status: row.status.parse()?,
            started_at: timestamp(row.started_at)?,
            ends_at: timestamp(row.ends_at)?,
            created_at: timestamp(row.created_at)?,
            updated_at: timestamp(row.updated_at)?,
            credentials: Vec::new(),
            service_data: serde_json::from_str::<BTreeMap<String, String>>(&row.service_data)?,
            used_services: serde_json::from_str(&row.used_services)?,
            template_id: row.template_id.filter(|t| !t.is_empty()),
            id: row.id,
            name: row.name,
            owner_id: row.owner_id,
        })
    }
}

impl TryFrom<CredentialRow> for Credential {
    type Error = OrchestratorError;

    fn try_from(row: CredentialRow) -> Result<Self> {
        Ok(Credential {
            id: row.id,
            lab_id: row.lab_id,
            label: row.label,
            username: row.username,
            secret: row.secret,
            url: row.url,
            notes: row.notes,
            expires_at: timestamp(row.expires_at)?,
            created_at: timestamp(row.created_at)?,
            updated_at: timestamp(row.updated_at)?,
        })
    }
}

impl TryFrom<ServiceConfigRow> for ServiceConfig {
    type Error = OrchestratorError;

    fn try_from(row: ServiceConfigRow) -> Result<Self> {
        Ok(ServiceConfig {
            id: row.id,
            name: row.name,
            service_type: row.service_type,
            description: row.description,
            settings: serde_json::from_str(&row.settings)?,
            is_active: row.is_active,
            created_at: timestamp(row.created_at)?,
            updated_at: timestamp(row.updated_at)?,
        })
    }
}

impl TryFrom<ServiceLimitRow> for ServiceLimit {
    type Error = OrchestratorError;

    fn try_from(row: ServiceLimitRow) -> Result<Self> {
        let max_labs = row
            .max_labs
            .map(u32::try_from)
            .transpose()
            .map_err(|_| OrchestratorError::InvalidState("stored max_labs out of range".into()))?;
        let max_duration = row
            .max_duration_secs
            .map(u64::try_from)
            .transpose()
            .map_err(|_| {
                OrchestratorError::InvalidState("stored max_duration out of range".into())
            })?
            .map(Duration::from_secs);

        Ok(ServiceLimit {
            service_id: row.service_id,
            max_labs,
            max_duration,
            is_active: row.is_active,
        })
    }
}
