//! `qimi cleanup` — Drop stale mount entries.

use clap::Args;
use qimi_common::config::QimiConfig;
use qimi_runtime::engine::Engine;

/// Arguments for the `cleanup` command.
#[derive(Args, Debug)]
pub struct CleanupArgs {}

/// Executes the `cleanup` command.
///
/// # Errors
///
/// Returns an error if the mount table cannot be read or saved.
pub fn execute(_args: CleanupArgs, config: QimiConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let removed = engine.cleanup().map_err(|e| anyhow::anyhow!("{e}"))?;
    if removed > 0 {
        println!("Cleaned up {removed} stale mount(s)");
    } else {
        println!("No stale mounts found");
    }
    Ok(())
}
