//! `qimi ls` — List mounted images.

use clap::Args;
use qimi_common::config::QimiConfig;
use qimi_runtime::engine::{Engine, MountStatus};

use crate::output;

/// Arguments for the `ls` command.
#[derive(Args, Debug)]
pub struct LsArgs {}

/// Executes the `ls` command.
///
/// # Errors
///
/// Returns an error if the mount table cannot be read.
pub fn execute(_args: LsArgs, config: QimiConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let mounts = engine.list();
    if mounts.is_empty() {
        println!("No images currently mounted");
        return Ok(());
    }
    print!("{}", render(&mounts));
    Ok(())
}

fn render(mounts: &[MountStatus]) -> String {
    let rows: Vec<Vec<String>> = mounts
        .iter()
        .map(|m| {
            vec![
                m.record.name.clone().unwrap_or_else(|| "-".into()),
                m.record.image_path.clone(),
                m.record.mount_point.display().to_string(),
                output::yes_no(m.record.read_only).into(),
                if m.active { "active" } else { "stale" }.into(),
            ]
        })
        .collect();
    output::table(
        &["NAME", "IMAGE", "MOUNT POINT", "READ-ONLY", "STATUS"],
        &rows,
    )
}
