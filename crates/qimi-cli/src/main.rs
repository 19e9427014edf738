//! # qimi — QEMU image mount-and-exec
//!
//! Attaches disk images through NBD, mounts their root filesystem, and
//! runs commands inside them with a usable chroot environment.

#![allow(clippy::print_stdout)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    commands::execute(cli)
}

/// Installs the fmt subscriber. `RUST_LOG` wins over `--log-level`; an
/// unknown level falls back to `info`.
fn init_tracing(level: &str) {
    let requested = level.trim().to_ascii_lowercase();
    let valid = LOG_LEVELS.contains(&requested.as_str());
    let default = if valid { requested.as_str() } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if !valid {
        tracing::warn!(level, "invalid log level, using info");
    }
}
