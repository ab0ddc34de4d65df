//! Script service implementation
//!
//! Runs operator-provided shell hooks for setup and cleanup. Config settings:
//!
//! - `setup_command` (required): run once per lab during provisioning
//! - `cleanup_command`: run on teardown; without it cleanup only releases
//!   the VLAN tag
//! - `shell`: interpreter invoked as `<shell> -c <command>` (default `sh`)
//! - `allocate_vlan`: `true` to hand the hook a VLAN tag in `LAB_VLAN`
//!
//! Hooks receive `LAB_ID`, `LAB_NAME`, `LAB_OWNER`, `LAB_ENDS_AT`,
//! `LAB_RESOURCE_NAME`, `LAB_CONFIG_ID` and every setting as
//! `LAB_SETTING_<KEY>`. A setup hook reports back on stdout:
//!
//! ```text
//! credential:{"label":"Console","username":"student","secret":"..."}
//! data:host=10.0.0.5
//! ```

use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lab_core::{lab_resource_name, Lab, NewCredential, ServiceKind};
use lab_orchestrator::{
    CleanupContext, LabHandle, LabService, ServiceError, SetupContext, StepStatus, TagAllocator,
};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SCRIPT: &str = "script";

const SETUP_COMMAND: &str = "setup_command";
const CLEANUP_COMMAND: &str = "cleanup_command";
const SHELL: &str = "shell";
const ALLOCATE_VLAN: &str = "allocate_vlan";
const DEFAULT_SHELL: &str = "sh";

const CREDENTIAL_PREFIX: &str = "credential:";
const DATA_PREFIX: &str = "data:";
const VLAN_SUFFIX: &str = ".vlan";

const STEP_VLAN: &str = "Allocate VLAN";
const STEP_HOOK: &str = "Run Setup Hook";
const STEP_OUTPUTS: &str = "Record Outputs";

/// `service_data` key holding the VLAN tag allocated for `config_id`.
pub fn vlan_key(config_id: &str) -> String {
    format!("{config_id}{VLAN_SUFFIX}")
}

/// Mark the tags recorded by still-active labs as taken, so a restarted
/// daemon does not hand them out twice. Returns how many were reserved.
pub fn reserve_recorded_tags(labs: &[Lab], allocator: &TagAllocator) -> usize {
    let mut reserved = 0;
    for lab in labs.iter().filter(|lab| lab.status.is_active()) {
        for (key, value) in &lab.service_data {
            if !key.ends_with(VLAN_SUFFIX) {
                continue;
            }
            match value.parse::<u16>() {
                Ok(tag) if allocator.reserve(tag) => reserved += 1,
                Ok(tag) => warn!(lab_id = %lab.id, "VLAN {} is outside the range or already taken", tag),
                Err(_) => warn!(lab_id = %lab.id, "Ignoring malformed VLAN entry {}={}", key, value),
            }
        }
    }
    reserved
}

/// What a setup hook printed for the orchestrator.
#[derive(Debug, Default, PartialEq, Eq)]
struct HookOutputs {
    credentials: Vec<NewCredential>,
    data: BTreeMap<String, String>,
}

fn parse_outputs(stdout: &str) -> Result<HookOutputs, ServiceError> {
    let mut outputs = HookOutputs::default();
    for line in stdout.lines().map(str::trim) {
        if let Some(json) = line.strip_prefix(CREDENTIAL_PREFIX) {
            let credential: NewCredential = serde_json::from_str(json.trim())
                .map_err(|e| ServiceError::Api(format!("invalid credential line: {e}")))?;
            outputs.credentials.push(credential);
        } else if let Some(pair) = line.strip_prefix(DATA_PREFIX) {
            match pair.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    outputs
                        .data
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
                _ => warn!("Ignoring malformed data line: {}", line),
            }
        }
    }
    Ok(outputs)
}

fn wants_vlan(setting: Option<&str>) -> bool {
    matches!(
        setting.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "yes" | "1")
    )
}

fn env_name(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Tail of a hook's stderr for error messages.
fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

async fn run_hook(mut command: Command, cancel: &CancellationToken) -> Result<Output, ServiceError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().context("failed to start hook")?;
    tokio::select! {
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        output = child.wait_with_output() => Ok(output.context("failed to wait for hook")?),
    }
}

/// Shell hook service that implements the LabService trait
pub struct ScriptService {
    allocator: Arc<TagAllocator>,
}

impl ScriptService {
    pub fn new(allocator: Arc<TagAllocator>) -> Self {
        Self { allocator }
    }

    fn command(&self, shell: Option<&str>, script: &str, settings: &BTreeMap<String, String>) -> Command {
        let mut command = Command::new(shell.unwrap_or(DEFAULT_SHELL));
        command.arg("-c").arg(script);
        for (key, value) in settings {
            command.env(format!("LAB_SETTING_{}", env_name(key)), value);
        }
        command
    }

    async fn release_tag(&self, lab: &LabHandle, key: &str) {
        if let Some(value) = lab.remove_service_data(key).await {
            match value.parse::<u16>() {
                Ok(tag) => {
                    self.allocator.release(tag);
                    debug!("Released VLAN {}", tag);
                }
                Err(_) => warn!("Dropping malformed VLAN entry {}={}", key, value),
            }
        }
    }

    async fn run_setup_hook(&self, ctx: &SetupContext, script: &str, vlan: Option<u16>) -> Result<(), ServiceError> {
        ctx.update_step(STEP_HOOK, StepStatus::Running, "");
        let mut command = self.command(ctx.setting(SHELL), script, &ctx.config.settings);
        command
            .env("LAB_ID", &ctx.lab_id)
            .env("LAB_NAME", &ctx.lab_name)
            .env("LAB_OWNER", &ctx.owner_id)
            .env("LAB_ENDS_AT", ctx.ends_at.to_rfc3339())
            .env("LAB_RESOURCE_NAME", lab_resource_name(&ctx.lab_id))
            .env("LAB_CONFIG_ID", &ctx.config.id);
        if let Some(tag) = vlan {
            command.env("LAB_VLAN", tag.to_string());
        }

        let output = run_hook(command, &ctx.cancel).await?;
        if !output.status.success() {
            return Err(ServiceError::Api(format!(
                "setup hook exited with {}: {}",
                output.status,
                stderr_tail(&output)
            )));
        }
        ctx.update_step(STEP_HOOK, StepStatus::Completed, "");

        ctx.update_step(STEP_OUTPUTS, StepStatus::Running, "");
        let outputs = parse_outputs(&String::from_utf8_lossy(&output.stdout))?;
        for (key, value) in outputs.data {
            ctx.lab
                .set_service_data(format!("{}.{}", ctx.config.id, key), value)
                .await;
        }
        let count = outputs.credentials.len();
        for credential in outputs.credentials {
            ctx.add_credential(credential).await?;
        }
        ctx.update_step(
            STEP_OUTPUTS,
            StepStatus::Completed,
            &format!("{count} credential(s)"),
        );
        Ok(())
    }
}

#[async_trait]
impl LabService for ScriptService {
    fn name(&self) -> &str {
        SCRIPT
    }

    fn description(&self) -> &str {
        "Runs operator-provided shell hooks"
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::Custom(SCRIPT.to_string())
    }

    fn required_params(&self) -> &[&str] {
        &[SETUP_COMMAND]
    }

    fn expected_steps(&self) -> Vec<String> {
        [STEP_VLAN, STEP_HOOK, STEP_OUTPUTS]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn execute_setup(&self, ctx: &SetupContext) -> Result<(), ServiceError> {
        let script = ctx
            .setting(SETUP_COMMAND)
            .ok_or_else(|| ServiceError::MissingParam(SETUP_COMMAND.to_string()))?
            .to_string();
        ctx.check_cancelled()?;

        ctx.update_step(STEP_VLAN, StepStatus::Running, "");
        let key = vlan_key(&ctx.config.id);
        let vlan = if wants_vlan(ctx.setting(ALLOCATE_VLAN)) {
            let tag = self
                .allocator
                .allocate()
                .map_err(|e| ServiceError::Api(e.to_string()))?;
            ctx.lab.set_service_data(key.clone(), tag.to_string()).await;
            ctx.update_step(STEP_VLAN, StepStatus::Completed, &format!("VLAN {tag}"));
            Some(tag)
        } else {
            ctx.update_step(STEP_VLAN, StepStatus::Completed, "not requested");
            None
        };

        info!(lab_id = %ctx.lab_id, "Running setup hook for {}", ctx.config.id);
        let result = self.run_setup_hook(ctx, &script, vlan).await;
        // A cancelled lab keeps its tag until cleanup runs the cleanup hook
        if vlan.is_some() && matches!(&result, Err(e) if !matches!(e, ServiceError::Cancelled)) {
            self.release_tag(&ctx.lab, &key).await;
        }
        result
    }

    async fn execute_cleanup(&self, ctx: &CleanupContext) -> Result<(), ServiceError> {
        let Some(config) = &ctx.config else {
            debug!(lab_id = %ctx.lab_id, "No script config bound, nothing to clean up");
            return Ok(());
        };
        let key = vlan_key(&config.id);
        let vlan = ctx.lab.service_data(&key).await;

        if let Some(script) = config.setting(CLEANUP_COMMAND) {
            let mut command = self.command(config.setting(SHELL), script, &config.settings);
            command
                .env("LAB_ID", &ctx.lab_id)
                .env("LAB_RESOURCE_NAME", lab_resource_name(&ctx.lab_id))
                .env("LAB_CONFIG_ID", &config.id);
            if let Some(tag) = &vlan {
                command.env("LAB_VLAN", tag);
            }
            for (key, value) in ctx.params_or_synthesized(&self.kind()).to_map() {
                command.env(format!("LAB_PARAM_{}", env_name(&key)), value);
            }

            info!(lab_id = %ctx.lab_id, "Running cleanup hook for {}", config.id);
            let output = run_hook(command, &ctx.cancel).await?;
            if !output.status.success() {
                return Err(ServiceError::Api(format!(
                    "cleanup hook exited with {}: {}",
                    output.status,
                    stderr_tail(&output)
                )));
            }
        }

        self.release_tag(&ctx.lab, &key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use lab_core::{LabStatus, ServiceConfig};
    use lab_orchestrator::{InMemoryLabRepository, LabRepository};

    fn allocator() -> Arc<TagAllocator> {
        Arc::new(TagAllocator::new(100, 101).unwrap())
    }

    async fn setup_context(
        repo: Arc<InMemoryLabRepository>,
        config: ServiceConfig,
        cancel: CancellationToken,
    ) -> SetupContext {
        let lab = Lab::new("shell", "alice", None, Duration::hours(1));
        repo.create_lab(&lab).await.unwrap();
        SetupContext::new(LabHandle::new(lab), config, repo, cancel).await
    }

    #[test]
    fn test_parse_outputs() {
        let stdout = "creating things\n\
                      credential:{\"label\":\"Console\",\"username\":\"student\",\"secret\":\"pw\"}\n\
                      data:host = 10.0.0.5\n\
                      data:broken\n";
        let outputs = parse_outputs(stdout).unwrap();

        assert_eq!(
            outputs.credentials,
            vec![NewCredential::new("Console", "student", "pw")]
        );
        assert_eq!(outputs.data.get("host").map(String::as_str), Some("10.0.0.5"));
        assert_eq!(outputs.data.len(), 1);

        assert!(parse_outputs("credential:{not json}").is_err());
    }

    #[test]
    fn test_env_names() {
        assert_eq!(env_name("api-token"), "API_TOKEN");
        assert_eq!(env_name("region.name"), "REGION_NAME");
    }

    #[test]
    fn test_reserve_recorded_tags_skips_inactive_labs() {
        let allocator = TagAllocator::new(100, 110).unwrap();

        let mut ready = Lab::new("a", "alice", None, Duration::hours(1));
        ready.status = LabStatus::Ready;
        ready.service_data.insert(vlan_key("net"), "105".to_string());
        ready.service_data.insert("net.host".to_string(), "x".to_string());
        let mut expired = Lab::new("b", "alice", None, Duration::hours(1));
        expired.status = LabStatus::Expired;
        expired.service_data.insert(vlan_key("net"), "106".to_string());

        assert_eq!(reserve_recorded_tags(&[ready, expired], &allocator), 1);
        assert!(allocator.is_allocated(105));
        assert!(!allocator.is_allocated(106));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_setup_and_cleanup_hooks() {
        let repo = Arc::new(InMemoryLabRepository::new());
        let tags = allocator();
        let service = ScriptService::new(tags.clone());
        let config = ServiceConfig::new("net", "Network", SCRIPT)
            .with_setting(
                SETUP_COMMAND,
                r#"test "$LAB_VLAN" = 100 || exit 9
echo 'credential:{"label":"Shell","username":"u","secret":"p"}'
echo "data:owner=$LAB_OWNER""#,
            )
            .with_setting(
                CLEANUP_COMMAND,
                r#"test "$LAB_VLAN" = 100 && test "$LAB_RESOURCE_NAME" = "lab-$LAB_ID""#,
            )
            .with_setting(ALLOCATE_VLAN, "true");

        let ctx = setup_context(repo.clone(), config.clone(), CancellationToken::new()).await;
        service.execute_setup(&ctx).await.unwrap();

        let lab = ctx.lab.snapshot().await;
        assert_eq!(lab.service_data.get("net.vlan").map(String::as_str), Some("100"));
        assert_eq!(lab.service_data.get("net.owner").map(String::as_str), Some("alice"));
        assert_eq!(lab.credentials.len(), 1);
        assert_eq!(lab.credentials[0].expires_at, lab.ends_at);
        assert!(tags.is_allocated(100));

        let cleanup = CleanupContext::new(ctx.lab.clone(), Some(config), CancellationToken::new());
        service.execute_cleanup(&cleanup).await.unwrap();
        assert!(!tags.is_allocated(100));
        assert!(ctx.lab.service_data("net.vlan").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_setup_releases_tag() {
        let repo = Arc::new(InMemoryLabRepository::new());
        let tags = allocator();
        let service = ScriptService::new(tags.clone());
        let config = ServiceConfig::new("net", "Network", SCRIPT)
            .with_setting(SETUP_COMMAND, "echo nope >&2; exit 3")
            .with_setting(ALLOCATE_VLAN, "yes");

        let ctx = setup_context(repo, config, CancellationToken::new()).await;
        let err = service.execute_setup(&ctx).await.unwrap_err();

        assert!(err.to_string().contains("nope"), "unexpected error: {err}");
        assert_eq!(tags.allocated_count(), 0);
        assert!(ctx.lab.service_data("net.vlan").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_hook_is_killed() {
        let repo = Arc::new(InMemoryLabRepository::new());
        let service = ScriptService::new(allocator());
        let config = ServiceConfig::new("slow", "Slow", SCRIPT).with_setting(SETUP_COMMAND, "sleep 30");

        let cancel = CancellationToken::new();
        let ctx = setup_context(repo, config, cancel.clone()).await;
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            service.execute_setup(&ctx),
        )
        .await
        .expect("hook was not interrupted");
        assert!(matches!(result, Err(ServiceError::Cancelled)));
        trigger.await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_without_config_is_noop() {
        let service = ScriptService::new(allocator());
        let lab = LabHandle::new(Lab::synthetic("abc123", Vec::new()));
        let ctx = CleanupContext::new(lab, None, CancellationToken::new());
        service.execute_cleanup(&ctx).await.unwrap();
    }
}
