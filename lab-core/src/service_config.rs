use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kind::ServiceKind;

/// A named, parameterized declaration of one usable service instance.
///
/// Several configs may share a `service_type`; they are served by the same
/// implementation, bound to different settings per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub name: String,
    pub service_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl ServiceConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        service_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            service_type: service_type.into(),
            description: String::new(),
            settings: BTreeMap::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> Result<ServiceKind> {
        self.service_type.parse()
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Required keys that are absent or blank.
    pub fn missing_settings(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|key| self.setting(key).map_or(true, |v| v.trim().is_empty()))
            .map(|key| key.to_string())
            .collect()
    }
}

/// Per-service ceiling on concurrent labs and lab duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLimit {
    pub service_id: String,
    #[serde(default)]
    pub max_labs: Option<u32>,
    #[serde(default, with = "optional_secs")]
    pub max_duration: Option<Duration>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl ServiceLimit {
    /// Cap `requested` at the configured maximum, if any.
    pub fn clamp_duration(&self, requested: Duration) -> Duration {
        match self.max_duration {
            Some(max) if self.is_active => requested.min(max),
            _ => requested,
        }
    }

    pub fn allows_another_lab(&self, active_labs: usize) -> bool {
        match self.max_labs {
            Some(max) if self.is_active => active_labs < max as usize,
            _ => true,
        }
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
