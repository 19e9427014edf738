//! `qimi unmount` — Unmount an image and release its device.

use clap::Args;
use qimi_common::config::QimiConfig;

/// Arguments for the `unmount` command.
#[derive(Args, Debug)]
pub struct UnmountArgs {
    /// Image path or mount name.
    pub target: String,
}

/// Executes the `unmount` command.
///
/// # Errors
///
/// Returns an error if the target is unknown or any unmount step fails.
pub fn execute(args: UnmountArgs, config: QimiConfig) -> anyhow::Result<()> {
    let engine = super::privileged_engine(config)?;
    let _ = engine
        .unmount(&args.target)
        .map_err(|e| anyhow::anyhow!("error unmounting {}: {e}", args.target))?;
    println!("Successfully unmounted {}", args.target);
    Ok(())
}
