//! Helpers intended for [`std::process::Command`] and the [`Runner`]
//! abstraction used to invoke privileged host tools.

use std::fmt::Debug;
use std::process::{Command, Output};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// A child process exited unsuccessfully.
///
/// The captured stdout and stderr are kept together since most of the
/// tools we drive (mkfs, parted, grub2-install) split their diagnostics
/// between both streams.
#[derive(Debug, thiserror::Error)]
#[error("{cmd} failed ({}): {}", self.status(), self.output.trim())]
pub struct CommandError {
    /// The command line, shell quoted
    pub cmd: String,
    /// Exit code, absent when the process was killed by a signal
    pub code: Option<i32>,
    /// Combined stdout and stderr
    pub output: String,
}

impl CommandError {
    fn status(&self) -> String {
        match self.code {
            Some(c) => format!("exit status {c}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Render a command line for logging.
fn quoted_cmdline<'a>(words: impl IntoIterator<Item = &'a str> + Clone) -> String {
    shlex::try_join(words.clone()).unwrap_or_else(|_| words.into_iter().collect::<Vec<_>>().join(" "))
}

fn check_output(cmd: String, output: Output) -> Result<Vec<u8>> {
    if output.status.success() {
        return Ok(output.stdout);
    }
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(CommandError {
        cmd,
        code: output.status.code(),
        output: combined,
    }
    .into())
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, discarding stdout. A non-zero exit
    /// is turned into a [`CommandError`].
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout.
    fn run_get_output(&mut self) -> Result<Vec<u8>>;

    /// Execute the child process and parse its stdout as UTF-8.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;

    /// The command line of this child, shell quoted.
    fn to_string_pretty(&self) -> String;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run(&mut self) -> Result<()> {
        self.run_get_output().map(|_| ())
    }

    fn run_get_output(&mut self) -> Result<Vec<u8>> {
        let cmd = self.to_string_pretty();
        let output = self.output().with_context(|| format!("Spawning {cmd}"))?;
        check_output(cmd, output)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let buf = self.run_get_output()?;
        String::from_utf8(buf).context("Parsing command output as UTF-8")
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let buf = self.run_get_output()?;
        serde_json::from_slice(&buf).context("Parsing command output as JSON")
    }

    fn to_string_pretty(&self) -> String {
        let words = std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|w| w.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        quoted_cmdline(words.iter().map(String::as_str))
    }
}

/// Executes external commands on behalf of the deployment engine.
///
/// Everything that touches block devices, bootloaders or image tooling
/// goes through this seam so it can be substituted in tests.
pub trait Runner: Debug {
    /// Run `cmd` with `args`, returning its stdout. A non-zero exit is an
    /// error carrying the captured stdout and stderr.
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Whether `cmd` can be found in `$PATH`.
    fn command_exists(&self, cmd: &str) -> bool;

    /// Like [`Runner::run`], decoding the output lossily as UTF-8.
    fn run_string(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let out = self.run(cmd, args)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// The [`Runner`] that spawns real host processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        Command::new(cmd).args(args).log_debug().run_get_output()
    }

    fn command_exists(&self, cmd: &str) -> bool {
        which::which(cmd).is_ok()
    }
}

/// Render `cmd args...` the same way the runner logs it.
pub fn format_cmdline(cmd: &str, args: &[&str]) -> String {
    quoted_cmdline(std::iter::once(cmd).chain(args.iter().copied()))
}
