use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Length of the opaque lab identifier.
const LAB_ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabStatus {
    Provisioning,
    Ready,
    Error,
    Expired,
}

impl LabStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabStatus::Provisioning => "provisioning",
            LabStatus::Ready => "ready",
            LabStatus::Error => "error",
            LabStatus::Expired => "expired",
        }
    }

    /// Provisioning and Ready labs still hold external resources.
    pub fn is_active(&self) -> bool {
        matches!(self, LabStatus::Provisioning | LabStatus::Ready)
    }

    pub fn can_transition_to(&self, next: LabStatus) -> bool {
        use LabStatus::*;
        matches!(
            (self, next),
            (Provisioning, Ready)
                | (Provisioning, Error)
                | (Provisioning, Expired)
                | (Ready, Expired)
        )
    }
}

impl fmt::Display for LabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LabStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "provisioning" => Ok(LabStatus::Provisioning),
            "ready" => Ok(LabStatus::Ready),
            "error" => Ok(LabStatus::Error),
            "expired" => Ok(LabStatus::Expired),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub lab_id: String,
    pub label: String,
    pub username: String,
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Credential data as produced by a service during setup, before it is
/// bound to a lab.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewCredential {
    pub label: String,
    pub username: String,
    pub secret: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewCredential {
    pub fn new(
        label: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            username: username.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Bind to a lab. The credential expires together with the lab.
    pub fn into_credential(self, lab_id: &str, expires_at: DateTime<Utc>) -> Credential {
        let now = Utc::now();
        Credential {
            id: Uuid::new_v4().to_string(),
            lab_id: lab_id.to_string(),
            label: self.label,
            username: self.username,
            secret: self.secret,
            url: self.url,
            notes: self.notes,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lab {
    pub id: String,
    pub name: String,
    pub status: LabStatus,
    pub owner_id: String,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub credentials: Vec<Credential>,

    /// Scratch store that service implementations use to remember whatever
    /// they need for a later cleanup.
    #[serde(default)]
    pub service_data: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    /// Service config IDs invoked during setup, in invocation order.
    #[serde(default)]
    pub used_services: Vec<String>,
}

impl Lab {
    /// A fresh lab in `Provisioning`, running for `duration` from now.
    pub fn new(
        name: impl Into<String>,
        owner_id: impl Into<String>,
        template_id: Option<String>,
        duration: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_lab_id(),
            name: name.into(),
            status: LabStatus::Provisioning,
            owner_id: owner_id.into(),
            started_at: now,
            ends_at: now + duration,
            created_at: now,
            updated_at: now,
            credentials: Vec::new(),
            service_data: BTreeMap::new(),
            template_id: template_id.filter(|t| !t.is_empty()),
            used_services: Vec::new(),
        }
    }

    /// Minimal stand-in for a lab that has no stored record, used by admin
    /// cleanup so services still receive a lab to read from.
    pub fn synthetic(lab_id: impl Into<String>, used_services: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: lab_id.into(),
            name: String::new(),
            status: LabStatus::Expired,
            owner_id: String::new(),
            started_at: now,
            ends_at: now,
            created_at: now,
            updated_at: now,
            credentials: Vec::new(),
            service_data: BTreeMap::new(),
            template_id: None,
            used_services,
        }
    }

    pub fn duration(&self) -> Duration {
        self.ends_at - self.started_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at < now
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: LabStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                lab_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record a service config as invoked. Repeated IDs are kept once.
    pub fn record_used_service(&mut self, config_id: &str) {
        if !self.used_services.iter().any(|id| id == config_id) {
            self.used_services.push(config_id.to_string());
            self.touch();
        }
    }
}

fn generate_lab_id() -> String {
    Uuid::new_v4().simple().to_string()[..LAB_ID_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lab_starts_provisioning() {
        let lab = Lab::new("web-lab", "alice", Some("tpl".into()), Duration::hours(2));
        assert_eq!(lab.status, LabStatus::Provisioning);
        assert_eq!(lab.id.len(), 8);
        assert_eq!(lab.duration(), Duration::hours(2));
        assert_eq!(lab.template_id.as_deref(), Some("tpl"));
        assert!(lab.used_services.is_empty());
    }

    #[test]
    fn test_empty_template_id_means_ad_hoc() {
        let lab = Lab::new("adhoc", "alice", Some(String::new()), Duration::hours(1));
        assert!(lab.template_id.is_none());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut lab = Lab::new("lab", "alice", None, Duration::hours(1));
        lab.transition(LabStatus::Ready).unwrap();
        lab.transition(LabStatus::Expired).unwrap();

        let err = lab.transition(LabStatus::Provisioning).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let mut failed = Lab::new("lab", "alice", None, Duration::hours(1));
        failed.transition(LabStatus::Error).unwrap();
        assert!(failed.transition(LabStatus::Ready).is_err());
        // Failed labs are deleted, never expired
        assert!(failed.transition(LabStatus::Expired).is_err());
    }

    #[test]
    fn test_nothing_returns_to_provisioning() {
        for status in [LabStatus::Ready, LabStatus::Error, LabStatus::Expired] {
            assert!(!status.can_transition_to(LabStatus::Provisioning));
        }
    }

    #[test]
    fn test_record_used_service_keeps_order_without_duplicates() {
        let mut lab = Lab::new("lab", "alice", None, Duration::hours(1));
        lab.record_used_service("a");
        lab.record_used_service("b");
        lab.record_used_service("a");
        assert_eq!(lab.used_services, vec!["a", "b"]);
    }

    #[test]
    fn test_credential_expiry_follows_lab() {
        let lab = Lab::new("lab", "alice", None, Duration::hours(3));
        let cred = NewCredential::new("Console", "lab-user", "s3cret")
            .with_url("https://console.example")
            .into_credential(&lab.id, lab.ends_at);
        assert_eq!(cred.lab_id, lab.id);
        assert_eq!(cred.expires_at, lab.ends_at);
        assert_eq!(cred.url.as_deref(), Some("https://console.example"));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            LabStatus::Provisioning,
            LabStatus::Ready,
            LabStatus::Error,
            LabStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<LabStatus>().unwrap(), status);
        }
        assert!("paused".parse::<LabStatus>().is_err());
    }
}
