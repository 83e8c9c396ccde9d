//! Run configuration and the bundle of host collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use osdeploy_mount::Mounter;
use osdeploy_utils::Runner;

use crate::chroot::Syscall;
use crate::constants::CLOUD_INIT_PATHS;
use crate::error::DeployError;
use crate::hooks::HookRunner;
use crate::source::{ImageExtractor, PackageInstaller, Verifier};
use crate::spec::{Firmware, PartTable};

/// Settings shared by every action, loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RunConfig {
    /// Fail when a cloud-init hook fails
    pub strict: bool,
    /// Reboot once done
    pub reboot: bool,
    /// Power off once done, unless rebooting
    pub poweroff: bool,
    /// Eject the installation media once done
    pub eject_cd: bool,
    /// Serial console to enable in the boot menu
    pub tty: Option<String>,
    /// Host architecture, as used in shim directory names
    pub arch: String,
    /// Verify container image signatures
    pub cosign: bool,
    /// Public key for `cosign`; keyless verification without one
    pub cosign_key: Option<Utf8PathBuf>,
    /// Take container images from local storage
    pub local: bool,
    /// Cloud-init configuration passed to every hook stage
    pub cloud_init_paths: Vec<Utf8PathBuf>,
    /// The cloud-init runner binary
    pub hook_command: String,
    /// Repositories for channel sources
    pub repositories: Vec<Repository>,
    /// Defaults for `install`
    pub install: InstallConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            strict: false,
            reboot: false,
            poweroff: false,
            eject_cd: false,
            tty: None,
            arch: std::env::consts::ARCH.to_owned(),
            cosign: false,
            cosign_key: None,
            local: false,
            cloud_init_paths: CLOUD_INIT_PATHS.iter().map(Utf8PathBuf::from).collect(),
            hook_command: "yip".to_owned(),
            repositories: Vec::new(),
            install: InstallConfig::default(),
        }
    }
}

/// A package repository used by channel sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Repository {
    /// Repository name
    pub name: String,
    /// Repository location
    pub uri: String,
    /// Passed through to luet
    #[serde(default)]
    pub priority: Option<u32>,
    /// Repository type, `docker` by default
    #[serde(default = "default_repository_type", rename = "type")]
    pub kind: String,
}

fn default_repository_type() -> String {
    "docker".to_owned()
}

/// Defaults for `install`, overridable on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct InstallConfig {
    /// Firmware to install for; detected when unset
    pub firmware: Option<Firmware>,
    /// Partition table; `gpt` when unset
    pub part_table: Option<PartTable>,
    /// Grub configuration template, relative to the deployed root
    pub grub_conf: Option<Utf8PathBuf>,
    /// Override the default entry name in the boot menu
    pub grub_default_entry: Option<String>,
    /// Keyed by partition role
    pub partitions: BTreeMap<String, PartitionConfig>,
}

/// Overrides for one partition of the default layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PartitionConfig {
    /// e.g. `512MiB` or `20G`; `0` takes the rest of the disk
    pub size: Option<String>,
    /// Filesystem type
    pub fs: Option<String>,
    /// Filesystem label
    pub label: Option<String>,
}

impl RunConfig {
    /// Load `path`. A missing file yields the defaults.
    #[context("Loading configuration from {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {path}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&buf).context("Parsing")
    }

    /// The container platform matching [`RunConfig::arch`].
    pub fn platform(&self) -> String {
        let arch = match self.arch.as_str() {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            o => o,
        };
        format!("linux/{arch}")
    }
}

/// Set once a termination signal arrives; checked between phases.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Request that the running action stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`Interrupt::trigger`] was called.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything an action needs from the host, passed explicitly so each
/// collaborator can be replaced.
#[derive(Debug)]
pub struct Config<'a> {
    /// Settings
    pub run: &'a RunConfig,
    /// Host commands
    pub runner: &'a dyn Runner,
    /// Mounts and unmounts
    pub mounter: &'a dyn Mounter,
    /// Cloud-init hook stages
    pub hooks: &'a dyn HookRunner,
    /// Process level calls for chroots
    pub syscall: &'a dyn Syscall,
    /// Container image extraction
    pub extractor: &'a dyn ImageExtractor,
    /// Image signature verification
    pub verifier: &'a dyn Verifier,
    /// Channel sources
    pub packages: &'a dyn PackageInstaller,
    /// Set when a termination signal arrives
    pub interrupt: Interrupt,
}

impl Config<'_> {
    /// Fail with [`DeployError::Interrupted`] if a signal has arrived.
    pub fn check_interrupted(&self) -> Result<()> {
        if self.interrupt.is_triggered() {
            return Err(DeployError::Interrupted.into());
        }
        Ok(())
    }
}
