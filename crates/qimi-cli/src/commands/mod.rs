//! CLI command definitions and dispatch.

pub mod cleanup;
pub mod exec;
pub mod ls;
pub mod mount;
pub mod unmount;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use qimi_common::config::QimiConfig;
use qimi_common::constants::CONFIG_ENV;
use qimi_common::error::QimiError;
use qimi_runtime::engine::Engine;

/// qimi — mount QEMU images (.qcow2, .qcow2c, .raw) and run binaries inside them.
#[derive(Parser, Debug)]
#[command(name = "qimi", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Log level (debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// JSON configuration file overriding the default host layout.
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount a QEMU image, optionally under a name.
    Mount(mount::MountArgs),
    /// Unmount an image by file path or name.
    Unmount(unmount::UnmountArgs),
    /// List mounted images and where they are mounted.
    Ls(ls::LsArgs),
    /// Run a command inside an image, mounting it first if needed.
    Exec(exec::ExecArgs),
    /// Drop mount entries that are no longer valid (e.g. after a reboot).
    Cleanup(cleanup::CleanupArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if configuration loading or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Mount(args) => mount::execute(args, config),
        Command::Unmount(args) => unmount::execute(args, config),
        Command::Ls(args) => ls::execute(args, config),
        Command::Exec(args) => exec::execute(args, config),
        Command::Cleanup(args) => cleanup::execute(args, config),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<QimiConfig> {
    let Some(path) = path else {
        return Ok(QimiConfig::default());
    };
    tracing::debug!(path = %path.display(), "loading configuration");
    QimiConfig::load(path).map_err(|e| anyhow::anyhow!("{e}"))
}

/// Opens the engine for a command that touches devices and mounts:
/// checks for root and for the external tools first.
fn privileged_engine(config: QimiConfig) -> anyhow::Result<Engine> {
    require_root()?;
    let engine = Engine::new(config).map_err(|e| anyhow::anyhow!("{e}"))?;
    engine.check_dependencies().map_err(|e| {
        tracing::error!(error = %e, "system dependencies not met");
        anyhow::anyhow!("{e}")
    })?;
    Ok(engine)
}

fn require_root() -> anyhow::Result<()> {
    if nix::unistd::Uid::effective().is_root() {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "{}",
        QimiError::PermissionDenied {
            message: "this command requires root privileges, run it with sudo".into(),
        }
    ))
}
