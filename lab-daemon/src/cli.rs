// CLI argument parsing and definitions

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "labd")]
#[command(about = "Provision and reclaim ephemeral training labs")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the engine configuration file (overrides LAB_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the sweeper until interrupted
    Serve,
    /// Create a lab and wait for it to be provisioned
    Create {
        /// Display name of the lab
        #[arg(long)]
        name: String,
        /// Owner (user id) of the lab
        #[arg(long)]
        owner: String,
        /// Template to provision from (omit for an empty lab)
        #[arg(long)]
        template: Option<String>,
        /// Lab lifetime, e.g. "90m" (defaults to the template's expiration)
        #[arg(long, value_parser = parse_duration_arg)]
        duration: Option<Duration>,
    },
    /// List labs
    List {
        /// Only labs of this owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show one lab with its credentials
    Show { lab_id: String },
    /// Clean up a lab and mark it expired
    Stop { lab_id: String },
    /// Clean up a lab and remove it
    Delete { lab_id: String },
    /// Run service cleanups outside the normal lab lifecycle
    Cleanup {
        #[command(subcommand)]
        target: CleanupCommand,
    },
    /// Run one expiry and stuck-error sweep
    Sweep,
    /// List the loaded templates
    Templates,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CleanupCommand {
    /// Clean one service type with explicit identifiers
    Type {
        service_type: String,
        /// Lab the identifiers are derived from
        #[arg(long)]
        lab_id: Option<String>,
        /// Explicit identifier, e.g. --param username=lab-abc@pve
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Clean one service config for a lab id
    Config {
        config_id: String,
        #[arg(long)]
        lab_id: String,
    },
    /// Clean every registered service for a lab id
    Lab { lab_id: String },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    lab_core::duration::parse_duration(s).map_err(|e| e.to_string())
}
