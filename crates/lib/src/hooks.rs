//! Cloud-init hook stages run around each action.

use std::fmt::Debug;

use anyhow::{anyhow, Result};
use camino::Utf8Path;

use osdeploy_utils::Runner;

use crate::chroot::Chroot;
use crate::config::Config;
use crate::constants::{COS_SETUP_KARG, PROC_CMDLINE};
use crate::error::DeployError;
use crate::kernel::Cmdline;

/// Runs one cloud-init stage over a set of configuration paths.
pub trait HookRunner: Debug {
    /// Run `stage` over the configuration files and directories in `paths`.
    fn run_stage(&self, stage: &str, paths: &[&str]) -> Result<()>;

    /// Run `stage` over `file` read as dot notation, e.g. a kernel command
    /// line carrying `stages.initramfs[0].commands[0]=...`.
    fn run_dot_notation_stage(&self, stage: &str, file: &str) -> Result<()>;
}

/// Runs stages with an external cloud-init tool, `<command> -s <stage> <paths>`.
#[derive(Debug)]
pub struct CommandHookRunner<'a> {
    runner: &'a dyn Runner,
    command: String,
}

impl<'a> CommandHookRunner<'a> {
    /// Run stages with `command` through `runner`.
    pub fn new(runner: &'a dyn Runner, command: &str) -> Self {
        Self {
            runner,
            command: command.to_owned(),
        }
    }
}

impl HookRunner for CommandHookRunner<'_> {
    fn run_stage(&self, stage: &str, paths: &[&str]) -> Result<()> {
        if paths.is_empty() {
            tracing::debug!("No cloud-init paths for stage {stage}");
            return Ok(());
        }
        let mut args = vec!["-s", stage];
        args.extend_from_slice(paths);
        self.runner.run(&self.command, &args)?;
        Ok(())
    }

    fn run_dot_notation_stage(&self, stage: &str, file: &str) -> Result<()> {
        self.runner.run(&self.command, &["--dotnotation", "-s", stage, file])?;
        Ok(())
    }
}

/// Run `stage` and its `.before` and `.after` variants over the configured
/// paths that exist. With `cos.setup` on the kernel command line, its paths
/// get `.before` first and `.after` last. A final pass reads the kernel
/// command line itself as dot notation. Every invocation is attempted;
/// failures are collected into one error.
pub(crate) fn run_stage(cfg: &Config, stage: &str) -> Result<()> {
    let cmdline = Cmdline::from_runner(cfg.runner)?;
    let setup = cmdline.values_of(COS_SETUP_KARG);
    let setup: Vec<&str> = setup.iter().map(String::as_str).collect();
    let paths: Vec<&str> = cfg
        .run
        .cloud_init_paths
        .iter()
        .filter(|p| p.exists())
        .map(|p| p.as_str())
        .collect();
    let (before, after) = (format!("{stage}.before"), format!("{stage}.after"));
    let variants = [before.as_str(), stage, after.as_str()];

    let mut invocations: Vec<(&str, &[&str])> = Vec::new();
    if !setup.is_empty() {
        invocations.push((before.as_str(), setup.as_slice()));
    }
    invocations.extend(variants.iter().map(|v| (*v, paths.as_slice())));
    if !setup.is_empty() {
        invocations.push((after.as_str(), setup.as_slice()));
    }

    let mut errors = Vec::new();
    for (name, paths) in invocations {
        if let Err(e) = cfg.hooks.run_stage(name, paths) {
            errors.push(format!("{name}: {e:#}"));
        }
    }
    for name in variants {
        if let Err(e) = cfg.hooks.run_dot_notation_stage(name, PROC_CMDLINE) {
            errors.push(format!("{name} ({PROC_CMDLINE}): {e:#}"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(errors.join("; ")))
    }
}

/// Run the hook `stage`. Failures are fatal only in strict mode.
pub(crate) fn run_hook(cfg: &Config, stage: &str) -> Result<()> {
    tracing::info!("Running {stage} hook");
    match run_stage(cfg, stage) {
        Ok(()) => Ok(()),
        Err(e) if cfg.run.strict => Err(DeployError::HookFailed {
            stage: stage.to_owned(),
            message: format!("{e:#}"),
        }
        .into()),
        Err(e) => {
            tracing::warn!("{stage}: {e:#}");
            tracing::warn!("Some errors found but were ignored. Enable --strict mode to fail on those");
            Ok(())
        }
    }
}

/// Run the hook `stage` chrooted into `root`, with each `(source, target)`
/// of `binds` bound into it.
pub(crate) fn run_chroot_hook(cfg: &Config, stage: &str, root: &Utf8Path, binds: &[(&Utf8Path, &str)]) -> Result<()> {
    let mut chroot = Chroot::new(cfg, root);
    for (source, target) in binds {
        chroot.add_bind(source, Utf8Path::new(target));
    }
    chroot.run_callback(|| run_hook(cfg, stage))
}
