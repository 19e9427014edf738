//! External command execution.
//!
//! qemu-nbd, partprobe, lsblk, mount, umount and chroot are all driven
//! through [`CommandRunner`], so the allocator and orchestrators can be
//! exercised against a scripted host.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::process::{Command, ExitStatus, Stdio};

use qimi_common::error::{QimiError, Result};

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<OsString>,
}

impl Invocation {
    /// Starts an invocation of `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, in order.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        let _ = cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Stdout and stderr joined, trimmed.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }

    /// Converts a nonzero exit into `QimiError::ExternalTool`.
    ///
    /// # Errors
    ///
    /// Returns `ExternalTool` carrying the rendered invocation and the
    /// captured output when the command did not succeed.
    pub fn check(self, invocation: &Invocation) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(QimiError::ExternalTool {
            command: invocation.to_string(),
            status: self
                .code
                .map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}")),
            output: self.combined(),
        })
    }
}

/// Runs external programs on behalf of the core.
pub trait CommandRunner: Send + Sync {
    /// Runs to completion with captured output. A nonzero exit is not an
    /// error at this level; callers decide via [`CommandOutput::check`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the program could not be started.
    fn output(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Runs with stdout/stderr attached to ours and returns the exit code.
    /// Stdin is attached only when `attach_stdin` is set.
    ///
    /// # Errors
    ///
    /// Returns an error only if the program could not be started.
    fn attached(&self, invocation: &Invocation, attach_stdin: bool) -> Result<i32>;

    /// Whether `program` resolves on `PATH`.
    fn locate(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn output(&self, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::trace!(command = %invocation, "running");
        let output = invocation
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| QimiError::io(invocation.program(), e))?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn attached(&self, invocation: &Invocation, attach_stdin: bool) -> Result<i32> {
        tracing::trace!(command = %invocation, attach_stdin, "running attached");
        let stdin = if attach_stdin {
            Stdio::inherit()
        } else {
            Stdio::null()
        };
        let status = invocation
            .command()
            .stdin(stdin)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| QimiError::io(invocation.program(), e))?;
        Ok(exit_code(status))
    }
}

/// Shell-style exit code: the status code, or 128 + signal number.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Scripted runner for tests that must not touch the host.

    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    use super::{CommandOutput, CommandRunner, Invocation};
    use crate::namespace::ops::{self, MountOps};
    use qimi_common::error::{QimiError, Result};
    use qimi_common::types::NamespaceMount;

    /// Records every invocation and answers from a prefix-matched script.
    ///
    /// Unscripted invocations succeed with empty output, `attached` returns
    /// the configured exit code, and every program is found on `PATH`
    /// unless listed with [`ScriptedRunner::without`]. As a [`MountOps`]
    /// it records the equivalent `mount`/`umount` command lines and fails
    /// those whose scripted reply is a failure.
    #[derive(Debug, Default)]
    pub struct ScriptedRunner {
        replies: Vec<(String, CommandOutput)>,
        missing: Vec<String>,
        exit_code: i32,
        unstartable: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        /// A runner where everything succeeds.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Answers invocations whose rendering starts with `prefix`.
        /// The first matching prefix wins.
        #[must_use]
        pub fn on(mut self, prefix: &str, reply: CommandOutput) -> Self {
            self.replies.push((prefix.to_string(), reply));
            self
        }

        /// Makes `locate(program)` fail.
        #[must_use]
        pub fn without(mut self, program: &str) -> Self {
            self.missing.push(program.to_string());
            self
        }

        /// Exit code reported for attached runs.
        #[must_use]
        pub const fn exiting_with(mut self, code: i32) -> Self {
            self.exit_code = code;
            self
        }

        /// Makes every `attached` run fail to start.
        #[must_use]
        pub const fn unstartable(mut self) -> Self {
            self.unstartable = true;
            self
        }

        /// Every invocation so far, rendered.
        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Invocations of `program` only.
        #[must_use]
        pub fn calls_to(&self, program: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.split(' ').next() == Some(program))
                .collect()
        }

        fn record(&self, rendered: String) -> String {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(rendered.clone());
            rendered
        }

        fn reply(&self, rendered: &str) -> CommandOutput {
            self.replies
                .iter()
                .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
                .map_or_else(|| CommandOutput::ok(""), |(_, reply)| reply.clone())
        }

        fn syscall(&self, rendered: String) -> Result<()> {
            let rendered = self.record(rendered);
            let reply = self.reply(&rendered);
            match reply.code {
                Some(0) => Ok(()),
                code => Err(QimiError::ExternalTool {
                    status: code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}")),
                    output: reply.combined(),
                    command: rendered,
                }),
            }
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn output(&self, invocation: &Invocation) -> Result<CommandOutput> {
            let rendered = self.record(invocation.to_string());
            Ok(self.reply(&rendered))
        }

        fn attached(&self, invocation: &Invocation, _attach_stdin: bool) -> Result<i32> {
            let _ = self.record(invocation.to_string());
            if self.unstartable {
                return Err(QimiError::io(
                    invocation.program(),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
            Ok(self.exit_code)
        }

        fn locate(&self, program: &str) -> bool {
            !self.missing.iter().any(|m| m == program)
        }
    }

    impl MountOps for ScriptedRunner {
        fn mount(&self, entry: &NamespaceMount, target: &Path) -> Result<()> {
            self.syscall(ops::render_mount(entry, target))
        }

        fn unmount(&self, target: &Path, detach: bool) -> Result<()> {
            self.syscall(ops::render_unmount(target, detach))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_renders_program_and_args() {
        let inv = Invocation::new("mount").args(["-t", "proc", "none"]).arg("/tmp/x/proc");
        assert_eq!(inv.to_string(), "mount -t proc none /tmp/x/proc");
        assert_eq!(inv.program(), "mount");
        assert_eq!(inv.arguments().len(), 4);
    }

    #[test]
    fn check_maps_failure_to_external_tool() {
        let inv = Invocation::new("qemu-nbd").arg("--connect");
        let err = CommandOutput::failed(1, "Failed to open /dev/nbd0")
            .check(&inv)
            .expect_err("nonzero exit");
        match err {
            QimiError::ExternalTool {
                command,
                status,
                output,
            } => {
                assert_eq!(command, "qemu-nbd --connect");
                assert_eq!(status, "exit code 1");
                assert!(output.contains("/dev/nbd0"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn check_passes_success_through() {
        let out = CommandOutput::ok("fine").check(&Invocation::new("true")).expect("ok");
        assert_eq!(out.stdout, "fine");
    }

    #[test]
    fn combined_joins_streams() {
        let out = CommandOutput {
            code: Some(2),
            stdout: "a\n".into(),
            stderr: "b\n".into(),
        };
        assert_eq!(out.combined(), "a\nb");
    }

    #[test]
    fn system_runner_reports_exit_code() {
        let runner = SystemRunner;
        let out = runner
            .output(&Invocation::new("sh").args(["-c", "echo hi; exit 3"]))
            .expect("spawn sh");
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[test]
    fn system_runner_missing_program_is_io_error() {
        let err = SystemRunner
            .output(&Invocation::new("definitely-not-a-real-program-qimi"))
            .expect_err("missing program");
        assert!(matches!(err, QimiError::Io { .. }));
    }
}
