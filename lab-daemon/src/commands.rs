//! Command execution for the `labd` binary.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use lab_config::LabConfig;
use lab_core::Lab;
use lab_orchestrator::{
    start_sweeper_task, AdminCleanupReport, AdminCleanupRequest, CreateLabRequest, PipelineOutcome,
    TeardownReport,
};
use tracing::{info, warn};

use crate::cli::{Args, CleanupCommand, Command};
use crate::daemon::Daemon;

pub async fn execute_command(args: Args) -> Result<()> {
    let config = LabConfig::load(args.config.as_deref())?;
    let backup = matches!(args.command, Command::Serve);
    let daemon = Daemon::open(config, backup).await?;
    let manager = daemon.manager.clone();

    match args.command {
        Command::Serve => serve(daemon).await,
        Command::Create {
            name,
            owner,
            template,
            duration,
        } => {
            let lab = manager
                .create_lab(CreateLabRequest {
                    name,
                    owner_id: owner,
                    template_id: template,
                    duration,
                })
                .await?;
            println!("Created lab {} ({}), provisioning...", lab.id, lab.name);

            let outcome = manager.wait_for_provisioning(&lab.id).await?;
            let lab = manager.get_lab(&lab.id).await?;
            print_lab(&lab)?;
            match outcome {
                Some(PipelineOutcome::Failed { message, .. }) => bail!("Provisioning failed: {message}"),
                Some(PipelineOutcome::Halted { status }) => bail!("Provisioning stopped, lab is {status}"),
                Some(PipelineOutcome::Ready) | None => Ok(()),
            }
        }
        Command::List { owner } => {
            let labs = match owner {
                Some(owner) => manager.list_labs_for_owner(&owner).await?,
                None => manager.list_labs().await?,
            };
            if labs.is_empty() {
                println!("No labs");
            }
            for lab in labs {
                println!(
                    "{:<10} {:<13} {:<12} {:<24} ends {}",
                    lab.id,
                    lab.status,
                    lab.owner_id,
                    lab.name,
                    lab.ends_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Command::Show { lab_id } => {
            let lab = manager.get_lab(&lab_id).await?;
            print_lab(&lab)
        }
        Command::Stop { lab_id } => {
            let report = manager.stop_lab(&lab_id).await?;
            print_teardown("Stopped", &report)
        }
        Command::Delete { lab_id } => {
            let report = manager.delete_lab(&lab_id).await?;
            print_teardown("Deleted", &report)
        }
        Command::Cleanup { target } => {
            let request = match target {
                CleanupCommand::Type {
                    service_type,
                    lab_id,
                    params,
                } => AdminCleanupRequest::ByType {
                    service_type,
                    lab_id,
                    params: params.into_iter().collect::<BTreeMap<_, _>>(),
                },
                CleanupCommand::Config { config_id, lab_id } => {
                    AdminCleanupRequest::ByConfig { config_id, lab_id }
                }
                CleanupCommand::Lab { lab_id } => AdminCleanupRequest::ByLabId { lab_id },
            };
            let report = manager.admin_cleanup(request).await?;
            print_admin_report(&report)
        }
        Command::Sweep => {
            let report = manager.run_sweep().await;
            println!(
                "Sweep finished: {} expired, {} deleted, {} failed",
                report.expired, report.deleted, report.failed
            );
            if report.failed > 0 {
                bail!("{} lab(s) could not be swept", report.failed);
            }
            Ok(())
        }
        Command::Templates => {
            let templates = manager.templates().list();
            if templates.is_empty() {
                println!("No templates in {}", daemon.config.templates_dir.display());
            }
            for template in templates {
                let services: Vec<&str> = template
                    .services
                    .iter()
                    .map(|s| s.service_id.as_str())
                    .collect();
                println!(
                    "{:<16} {:<28} {:>6}  {}",
                    template.id,
                    template.name,
                    template.expiration,
                    services.join(", ")
                );
            }
            Ok(())
        }
    }
}

async fn serve(daemon: Daemon) -> Result<()> {
    let manager = daemon.manager.clone();

    let interrupted = manager.fail_interrupted().await?;
    if interrupted > 0 {
        warn!("{} lab(s) were left provisioning by a previous run", interrupted);
    }

    let sweeper = tokio::spawn(start_sweeper_task(
        manager.clone(),
        daemon.config.sweep_interval(),
        manager.shutdown_token(),
    ));
    info!(
        "Sweeper task started (interval: {}s)",
        daemon.config.sweep_interval_secs
    );

    wait_for_shutdown(&daemon).await?;
    info!("Interrupt received, shutting down");

    manager.shutdown().await;
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl-C. On unix, SIGHUP reloads the templates directory.
#[cfg(unix)]
async fn wait_for_shutdown(daemon: &Daemon) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => match daemon.reload_templates() {
                Ok(count) => info!("Reloaded {} template(s)", count),
                Err(e) => warn!("Template reload failed: {:#}", e),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_daemon: &Daemon) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn print_lab(lab: &Lab) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(lab)?);
    Ok(())
}

fn print_teardown(action: &str, report: &TeardownReport) -> Result<()> {
    println!("{} lab {} (status: {})", action, report.lab.id, report.lab.status);
    if let Some(cleanup) = &report.cleanup {
        if cleanup.used_fallback {
            println!("  no usage recorded, cleaned every registered service");
        }
        for id in &cleanup.cleaned {
            println!("  cleaned  {id}");
        }
        for id in &cleanup.skipped {
            println!("  skipped  {id} (no longer dispatchable)");
        }
    }
    if let Some(failures) = &report.failures {
        for id in &failures.cleaned {
            println!("  cleaned  {id}");
        }
        for failure in &failures.failures {
            println!("  FAILED   {failure}");
        }
        for id in &failures.not_attempted {
            println!("  skipped  {id} (not attempted)");
        }
        bail!("Cleanup incomplete for lab {}", report.lab.id);
    }
    Ok(())
}

fn print_admin_report(report: &AdminCleanupReport) -> Result<()> {
    for outcome in &report.outcomes {
        let params: Vec<String> = outcome
            .params
            .to_map()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        match &outcome.error {
            None => println!("  ok      {} [{}]", outcome.service, params.join(" ")),
            Some(error) => println!("  FAILED  {} [{}]: {}", outcome.service, params.join(" "), error),
        }
    }
    if !report.all_succeeded() {
        bail!("{} cleanup(s) failed", report.failed().count());
    }
    Ok(())
}
