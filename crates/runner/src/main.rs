//! InstanceGuard.Runner - Reference Application Shell
//!
//! This process shows how an application wires the single-instance service
//! into its startup routine:
//! - First launch becomes primary and keeps running
//! - Later launches forward their command-line arguments and exit
//! - The primary logs every forwarded activation (where a GUI would focus its
//!   window or open the forwarded file)

use anyhow::{Context, Result};
use instance_guard_core::{config, startup, Startup};
use tracing_subscriber::EnvFilter;

const APP_ID: &str = "InstanceGuard";

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("InstanceGuard.Runner starting...");

    let guard_config = config::load_config(APP_ID);
    let args: Vec<String> = std::env::args().skip(1).collect();

    let instance = match startup(guard_config, args.clone())
        .context("Failed to determine whether another instance is running")?
    {
        Startup::Primary(instance) => instance,
        Startup::Secondary { forwarded } => {
            // Never fall through to a second primary, even when forwarding failed
            if forwarded {
                tracing::info!("Handed {:?} to the running instance, exiting", args);
            } else {
                tracing::warn!("Running instance unreachable, exiting without forwarding");
            }
            return Ok(());
        }
    };

    let activations = instance
        .subscribe()
        .context("Failed to register activation listener")?;

    tracing::info!("Primary instance started with {:?}", args);
    if !instance.is_listening() {
        tracing::warn!("Activation endpoint unavailable; later launches will not be forwarded");
    }

    // Runs until the process is terminated
    for activation in activations.iter() {
        tracing::info!("Activated by another launch: {:?}", activation.args);
    }

    instance.shutdown();
    Ok(())
}
