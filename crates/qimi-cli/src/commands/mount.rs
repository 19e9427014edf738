//! `qimi mount` — Attach an image and mount its root filesystem.

use std::path::PathBuf;

use clap::Args;
use qimi_common::config::QimiConfig;

/// Arguments for the `mount` command.
#[derive(Args, Debug)]
pub struct MountArgs {
    /// Image file (.qcow2, .qcow2c, .raw).
    pub image: PathBuf,

    /// Optional name to refer to the mount by.
    pub name: Option<String>,

    /// Mount the image read-only.
    #[arg(long)]
    pub read_only: bool,

    /// Partition to mount (e.g. 1, p2, partition3). Auto-detected if omitted.
    #[arg(short, long)]
    pub partition: Option<String>,
}

/// Executes the `mount` command.
///
/// # Errors
///
/// Returns an error if privileges or dependencies are missing, or the
/// mount fails.
pub fn execute(args: MountArgs, config: QimiConfig) -> anyhow::Result<()> {
    let engine = super::privileged_engine(config)?;
    let record = engine
        .mount(
            &args.image,
            args.name.as_deref(),
            args.read_only,
            args.partition.as_deref(),
        )
        .map_err(|e| anyhow::anyhow!("error mounting image: {e}"))?;

    match &record.name {
        Some(name) => println!(
            "Successfully mounted {} as '{name}' at {}",
            args.image.display(),
            record.mount_point.display()
        ),
        None => println!(
            "Successfully mounted {} at {}",
            args.image.display(),
            record.mount_point.display()
        ),
    }
    Ok(())
}
