//! # Command line interface
//!
//! Parses arguments, merges them over the configuration file and wires the
//! real host collaborators into the actions.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use osdeploy_mount::SystemMounter;
use osdeploy_utils::SystemRunner;

use crate::action::{InstallAction, ResetAction, UpgradeAction};
use crate::chroot::RealSyscall;
use crate::config::{Config, Interrupt, RunConfig};
use crate::constants::{CONFIG_PATH, PACKAGE_CONFIG_PATH};
use crate::cosign::CosignVerifier;
use crate::extract::SkopeoExtractor;
use crate::hooks::CommandHookRunner;
use crate::luet::LuetInstaller;
use crate::source::ImageSource;
use crate::spec::{Firmware, HostState, InstallSpec, PartTable, ResetSpec, UpgradeSpec};

/// What to do once an action succeeds.
#[derive(Debug, Clone, Default, clap::Args, PartialEq, Eq)]
pub(crate) struct PowerOpts {
    /// Reboot the system when done
    #[clap(long, conflicts_with = "poweroff")]
    pub(crate) reboot: bool,

    /// Power the system off when done
    #[clap(long)]
    pub(crate) poweroff: bool,
}

/// Options for a fresh installation.
#[derive(Debug, Clone, clap::Args, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// Block device, or an existing file to install to through a loop device
    pub(crate) target: Utf8PathBuf,

    /// Source of the active system, e.g. `docker:registry.example/os:v1` or
    /// `dir:/path`. Defaults to the live media root when booted from it.
    #[clap(long)]
    pub(crate) source: Option<ImageSource>,

    /// Source of the recovery system. Defaults to the recovery squashfs on
    /// the live media, or a copy of the active image.
    #[clap(long)]
    pub(crate) recovery_source: Option<ImageSource>,

    /// Keep the existing partitions, locating them by filesystem label
    #[clap(long)]
    pub(crate) no_format: bool,

    /// Overwrite an existing installation with `--no-format`
    #[clap(long)]
    pub(crate) force: bool,

    /// Firmware to install for, instead of the one detected
    #[clap(long, value_enum)]
    pub(crate) firmware: Option<Firmware>,

    /// Partition table type; GPT unless configured otherwise
    #[clap(long, value_enum)]
    pub(crate) part_table: Option<PartTable>,

    /// Add a boot console for this tty, e.g. `ttyS0`
    #[clap(long)]
    pub(crate) tty: Option<String>,

    /// Eject the installation media when done
    #[clap(long)]
    pub(crate) eject_cd: bool,

    #[clap(flatten)]
    pub(crate) power: PowerOpts,
}

/// Options for restoring the system from recovery.
#[derive(Debug, Clone, clap::Args, PartialEq, Eq)]
pub(crate) struct ResetOpts {
    /// Also wipe the persistent and OEM partitions
    #[clap(long)]
    pub(crate) reset_persistent: bool,

    /// Deploy the active system from this source instead of the recovery image
    #[clap(long)]
    pub(crate) source: Option<ImageSource>,

    /// Add a boot console for this tty
    #[clap(long)]
    pub(crate) tty: Option<String>,

    #[clap(flatten)]
    pub(crate) power: PowerOpts,
}

/// Options for an in-place upgrade.
#[derive(Debug, Clone, clap::Args, PartialEq, Eq)]
pub(crate) struct UpgradeOpts {
    /// Source of the new system image
    #[clap(long)]
    pub(crate) source: Option<ImageSource>,

    /// Upgrade the recovery image instead of the active one
    #[clap(long)]
    pub(crate) recovery: bool,

    /// Skip signature verification of container images
    #[clap(long)]
    pub(crate) no_verify: bool,

    #[clap(flatten)]
    pub(crate) power: PowerOpts,
}

#[derive(Debug, Clone, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum Opt {
    /// Partition a disk and install the system to it
    Install(InstallOpts),
    /// Restore the active and passive systems from recovery
    ///
    /// Only possible while booted from the recovery system.
    Reset(ResetOpts),
    /// Replace the active system, or the recovery system, with a new image
    ///
    /// The running image is kept as the fallback (passive) system.
    Upgrade(UpgradeOpts),
}

/// Deploy, reset and upgrade image-based operating systems.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "osdeploy", version)]
pub struct Cli {
    /// Path to the configuration file
    #[clap(long, global = true, default_value = CONFIG_PATH)]
    config: Utf8PathBuf,

    /// Log at debug level
    #[clap(long, global = true)]
    debug: bool,

    /// Fail when a hook stage fails instead of only logging it
    #[clap(long, global = true)]
    strict: bool,

    #[clap(subcommand)]
    opt: Opt,
}

impl Cli {
    /// Whether debug logging was requested.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Load the configuration, apply the command line over it and run the
    /// requested action against the host.
    pub fn run(self, interrupt: Interrupt) -> Result<()> {
        let mut run = RunConfig::load(&self.config)?;
        self.apply_overrides(&mut run);

        let runner = SystemRunner;
        let mounter = SystemMounter;
        let hooks = CommandHookRunner::new(&runner, &run.hook_command);
        let extractor = SkopeoExtractor::new(&runner);
        let verifier = CosignVerifier::new(&runner);
        let packages = LuetInstaller::new(&runner, Utf8Path::new(PACKAGE_CONFIG_PATH));
        let cfg = Config {
            run: &run,
            runner: &runner,
            mounter: &mounter,
            hooks: &hooks,
            syscall: &RealSyscall,
            extractor: &extractor,
            verifier: &verifier,
            packages: &packages,
            interrupt,
        };

        let host = HostState::probe();
        tracing::debug!("Host: {host:?}");
        match self.opt {
            Opt::Install(opts) => {
                let spec = install_spec(&opts, &run, &host)?;
                InstallAction::new(&cfg, spec).run()
            }
            Opt::Reset(opts) => {
                let mut spec = ResetSpec::from_host(&cfg, &host)?;
                configure_reset(&mut spec, opts, &run);
                ResetAction::new(&cfg, spec).run()
            }
            Opt::Upgrade(opts) => {
                let source = opts.source.unwrap_or_default();
                let mut spec = UpgradeSpec::from_host(&cfg, source, opts.recovery)?;
                spec.grub_default_entry = run.install.grub_default_entry.clone();
                UpgradeAction::new(&cfg, spec).run()
            }
        }
    }

    /// Command line flags win over the configuration file.
    fn apply_overrides(&self, run: &mut RunConfig) {
        if self.strict {
            run.strict = true;
        }
        let power = match &self.opt {
            Opt::Install(o) => {
                run.eject_cd |= o.eject_cd;
                &o.power
            }
            Opt::Reset(o) => &o.power,
            Opt::Upgrade(o) => {
                if o.no_verify {
                    run.cosign = false;
                }
                &o.power
            }
        };
        if power.reboot {
            run.reboot = true;
            run.poweroff = false;
        } else if power.poweroff {
            run.poweroff = true;
            run.reboot = false;
        }
    }
}

fn install_spec(opts: &InstallOpts, run: &RunConfig, host: &HostState) -> Result<InstallSpec> {
    let mut spec = InstallSpec::new(&opts.target, host);
    spec.apply_config(&run.install)?;
    if let Some(fw) = opts.firmware {
        spec.firmware = fw;
    }
    if let Some(pt) = opts.part_table {
        spec.part_table = pt;
    }
    spec.add_firmware_partitions()?;
    if let Some(src) = &opts.source {
        spec.active.source = src.clone();
    }
    if let Some(src) = &opts.recovery_source {
        spec.recovery.source = src.clone();
    }
    spec.no_format = opts.no_format;
    spec.force = opts.force;
    spec.tty = opts.tty.clone().or_else(|| run.tty.clone());
    Ok(spec)
}

fn configure_reset(spec: &mut ResetSpec, opts: ResetOpts, run: &RunConfig) {
    if let Some(src) = opts.source {
        spec.set_source(src);
    }
    spec.reset_persistent = opts.reset_persistent;
    spec.tty = opts.tty.or_else(|| run.tty.clone());
    if let Some(conf) = &run.install.grub_conf {
        spec.grub_conf = conf.clone();
    }
    spec.grub_default_entry = run.install.grub_default_entry.clone();
}
