//! `qimi exec` — Run a command inside an image.

use clap::Args;
use qimi_common::config::QimiConfig;
use qimi_runtime::engine::ExecOptions;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Keep stdin attached to the command.
    #[arg(short, long)]
    pub interactive: bool,

    /// Mount read-only if the image has to be mounted for this run.
    #[arg(long)]
    pub read_only: bool,

    /// Nameserver for the guest's resolv.conf. Repeat or comma-separate
    /// for several; without it the host's resolv.conf is used.
    #[arg(long = "nameserver", value_name = "IP", value_delimiter = ',')]
    pub nameservers: Vec<String>,

    /// Image path or mount name.
    pub target: String,

    /// Command to run inside the image, followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

/// Executes the `exec` command and exits with the guest command's status.
///
/// Ctrl+C is left to the guest while it runs; qimi itself keeps going so
/// resolv.conf is restored and the namespace mounts come down.
///
/// # Errors
///
/// Returns an error if privileges or dependencies are missing, the target
/// cannot be resolved, or the command cannot be started.
pub fn execute(args: ExecArgs, config: QimiConfig) -> anyhow::Result<()> {
    let engine = super::privileged_engine(config)?;

    let Some((command, rest)) = args.command.split_first() else {
        return Err(anyhow::anyhow!("no command given"));
    };
    let options = ExecOptions {
        command: command.clone(),
        args: rest.to_vec(),
        interactive: args.interactive,
        read_only: args.read_only,
        nameservers: args.nameservers,
    };

    ctrlc::set_handler(|| tracing::debug!("interrupt received, waiting for the guest command"))
        .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    let code = engine
        .exec(&args.target, &options)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    if code != 0 {
        tracing::debug!(code, "guest command failed");
        std::process::exit(code);
    }
    Ok(())
}
