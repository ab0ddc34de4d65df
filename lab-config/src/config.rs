use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use lab_core::duration::parse_duration;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// What the cleanup orchestrator does when one service's cleanup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Clean every service and report all failures together.
    #[default]
    ContinueOnError,
    /// Abort on the first failure, leaving later services untouched.
    StopOnError,
}

impl FromStr for CleanupPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue_on_error" | "continue" => Ok(CleanupPolicy::ContinueOnError),
            "stop_on_error" | "stop" => Ok(CleanupPolicy::StopOnError),
            other => Err(ConfigError::Invalid(format!(
                "unknown cleanup policy '{other}' (expected continue_on_error or stop_on_error)"
            ))),
        }
    }
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupPolicy::ContinueOnError => f.write_str("continue_on_error"),
            CleanupPolicy::StopOnError => f.write_str("stop_on_error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,

    #[serde(default = "default_services_file")]
    pub services_file: Option<PathBuf>,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_stuck_error_threshold")]
    pub stuck_error_threshold_secs: u64,

    #[serde(default = "default_progress_log_limit")]
    pub progress_log_limit: usize,

    #[serde(default = "default_lab_duration")]
    pub default_lab_duration: String,

    #[serde(default = "default_cleanup_policy")]
    pub cleanup_policy: CleanupPolicy,

    /// Inclusive VLAN tag range, e.g. `"100-4000"`.
    #[serde(default = "default_vlan_range")]
    pub vlan_range: String,
}

fn env_or<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("LAB_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".lab").join("labd.db")
}

fn default_templates_dir() -> PathBuf {
    std::env::var("LAB_TEMPLATES_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("templates"))
}

fn default_services_file() -> Option<PathBuf> {
    std::env::var("LAB_SERVICES_FILE").ok().map(PathBuf::from)
}

fn default_sweep_interval() -> u64 {
    env_or("LAB_SWEEP_INTERVAL", 300) // 5 minutes
}

fn default_stuck_error_threshold() -> u64 {
    env_or("LAB_STUCK_ERROR_THRESHOLD", 3600) // 1 hour
}

fn default_progress_log_limit() -> usize {
    env_or("LAB_PROGRESS_LOG_LIMIT", 100)
}

fn default_lab_duration() -> String {
    std::env::var("LAB_DEFAULT_DURATION").unwrap_or_else(|_| "2h".to_string())
}

fn default_cleanup_policy() -> CleanupPolicy {
    env_or("LAB_CLEANUP_POLICY", CleanupPolicy::default())
}

fn default_vlan_range() -> String {
    std::env::var("LAB_VLAN_RANGE").unwrap_or_else(|_| "100-4000".to_string())
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            templates_dir: default_templates_dir(),
            services_file: default_services_file(),
            sweep_interval_secs: default_sweep_interval(),
            stuck_error_threshold_secs: default_stuck_error_threshold(),
            progress_log_limit: default_progress_log_limit(),
            default_lab_duration: default_lab_duration(),
            cleanup_policy: default_cleanup_policy(),
            vlan_range: default_vlan_range(),
        }
    }
}

impl LabConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Load from `path` (or `LAB_CONFIG` when `path` is `None`). Keys the file
    /// omits keep their environment defaults. Without a file this is
    /// `from_env`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var("LAB_CONFIG").ok().map(PathBuf::from);
        let config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                if content.trim().is_empty() {
                    Self::from_env()
                } else {
                    serde_yaml_ng::from_str(&content)
                        .map_err(|source| ConfigError::Parse { path, source })?
                }
            }
            None => Self::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.progress_log_limit == 0 {
            return Err(ConfigError::Invalid(
                "progress_log_limit must be greater than zero".to_string(),
            ));
        }
        self.default_duration()?;
        self.vlan_tags()?;
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stuck_error_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_error_threshold_secs)
    }

    pub fn default_duration(&self) -> Result<Duration> {
        Ok(parse_duration(&self.default_lab_duration)?)
    }

    /// Parse `vlan_range` into its inclusive bounds.
    pub fn vlan_tags(&self) -> Result<(u16, u16)> {
        let invalid = || {
            ConfigError::Invalid(format!(
                "vlan_range must look like '100-4000', got '{}'",
                self.vlan_range
            ))
        };
        let (low, high) = self.vlan_range.split_once('-').ok_or_else(invalid)?;
        let low: u16 = low.trim().parse().map_err(|_| invalid())?;
        let high: u16 = high.trim().parse().map_err(|_| invalid())?;

        // 802.1Q tags 0 and 4095 are reserved.
        if low == 0 || high >= 4095 || low > high {
            return Err(invalid());
        }
        Ok((low, high))
    }
}
