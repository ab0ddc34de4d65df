use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Service {service_id} is at its limit of {max_labs} concurrent labs")]
    LimitExceeded { service_id: String, max_labs: u32 },

    #[error("Service {service} failed: {source}")]
    Service {
        service: String,
        #[source]
        source: ServiceError,
    },

    #[error("{0}")]
    Cleanup(CleanupFailures),

    #[error(transparent)]
    Core(#[from] lab_core::CoreError),

    #[error(transparent)]
    Config(#[from] lab_config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn lab_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Lab",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors a service implementation reports back from setup or cleanup.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Missing required parameter: {0}")]
    MissingParam(String),

    #[error("Remote API error: {0}")]
    Api(String),

    #[error("Failed to persist {what}: {message}")]
    Persistence { what: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Service panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One service whose cleanup did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: String,
    pub config_id: Option<String>,
    pub message: String,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.config_id {
            Some(id) => write!(f, "{} ({}): {}", self.service, id, self.message),
            None => write!(f, "{}: {}", self.service, self.message),
        }
    }
}

/// Aggregated cleanup result when at least one service failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupFailures {
    pub lab_id: String,
    pub failures: Vec<ServiceFailure>,
    /// Services cleaned successfully before (or despite) the failures.
    pub cleaned: Vec<String>,
    /// Services never attempted because the run stopped at the first error.
    pub not_attempted: Vec<String>,
}

impl fmt::Display for CleanupFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cleanup of lab {} failed for {} service(s)",
            self.lab_id,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        if !self.not_attempted.is_empty() {
            write!(f, "; not attempted: {}", self.not_attempted.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_failures_message_lists_everything() {
        let failures = CleanupFailures {
            lab_id: "abc123".to_string(),
            failures: vec![ServiceFailure {
                service: "proxmox".to_string(),
                config_id: Some("pve-main".to_string()),
                message: "connection refused".to_string(),
            }],
            cleaned: vec!["openstack-main".to_string()],
            not_attempted: vec!["guac-main".to_string()],
        };
        let message = OrchestratorError::Cleanup(failures).to_string();
        assert!(message.contains("abc123"));
        assert!(message.contains("proxmox (pve-main): connection refused"));
        assert!(message.contains("not attempted: guac-main"));
    }

    #[test]
    fn test_not_found_message() {
        let err = OrchestratorError::lab_not_found("abc123");
        assert_eq!(err.to_string(), "Lab not found: abc123");
        assert!(err.is_not_found());
    }
}
