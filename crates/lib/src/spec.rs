//! The data model: partitions, images and the plan for each action.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use osdeploy_blockdev::parse_size_mib;

use crate::config::{Config, InstallConfig};
use crate::constants::*;
use crate::error::DeployError;
use crate::probe;
use crate::source::ImageSource;

/// How the machine boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    /// UEFI
    Efi,
    /// Legacy BIOS
    Bios,
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Firmware::Efi => "efi",
            Firmware::Bios => "bios",
        })
    }
}

/// Partition table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PartTable {
    /// GUID partition table
    Gpt,
    /// DOS partition table
    Msdos,
}

impl fmt::Display for PartTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartTable::Gpt => "gpt",
            PartTable::Msdos => "msdos",
        })
    }
}

/// A partition role marker, as understood by parted(8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionFlag {
    /// Bootable, msdos only
    Boot,
    /// EFI system partition
    Esp,
    /// BIOS boot partition
    BiosGrub,
}

impl PartitionFlag {
    /// The name parted(8) uses.
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionFlag::Boot => "boot",
            PartitionFlag::Esp => "esp",
            PartitionFlag::BiosGrub => "bios_grub",
        }
    }
}

impl FromStr for PartitionFlag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "boot" => Ok(PartitionFlag::Boot),
            "esp" => Ok(PartitionFlag::Esp),
            "bios_grub" => Ok(PartitionFlag::BiosGrub),
            o => Err(anyhow!("Unknown partition flag: {o}")),
        }
    }
}

impl fmt::Display for PartitionFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A partition, either planned or discovered on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Role, e.g. `state`; the key in a [`PartitionMap`]
    pub name: String,
    /// GPT partition label
    pub label: String,
    /// Filesystem label
    pub filesystem_label: String,
    /// In MiB; 0 means the rest of the disk
    pub size: u64,
    /// Filesystem type; empty for none
    pub fs: String,
    /// Flags to set after creation
    pub flags: Vec<PartitionFlag>,
    /// Where the partition is mounted while deploying
    pub mount_point: Option<Utf8PathBuf>,
    /// Device node, known once created or discovered
    pub path: Option<Utf8PathBuf>,
    /// The disk holding this partition
    pub disk: Option<Utf8PathBuf>,
}

impl Partition {
    fn planned(name: &str, fs_label: &str, size: u64, fs: &str, mount_point: Option<&str>) -> Self {
        Self {
            name: name.to_owned(),
            label: name.to_owned(),
            filesystem_label: fs_label.to_owned(),
            size,
            fs: fs.to_owned(),
            flags: Vec::new(),
            mount_point: mount_point.map(Utf8PathBuf::from),
            path: None,
            disk: None,
        }
    }

    /// Device node of this partition, or an error naming it.
    pub fn device(&self) -> Result<&Utf8Path> {
        self.path
            .as_deref()
            .ok_or_else(|| anyhow!("Partition {} has no device", self.name))
    }

    /// Mount point of this partition, or an error naming it.
    pub fn mount_path(&self) -> Result<&Utf8Path> {
        self.mount_point
            .as_deref()
            .ok_or_else(|| anyhow!("Partition {} has no mount point", self.name))
    }
}

/// Partitions found on the host, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct PartitionList(pub Vec<Partition>);

impl PartitionList {
    /// The partition with filesystem label `label`.
    pub fn by_filesystem_label(&self, label: &str) -> Option<&Partition> {
        self.0.iter().find(|p| p.filesystem_label == label)
    }

    /// The partition with GPT label `label`.
    pub fn by_label(&self, label: &str) -> Option<&Partition> {
        self.0.iter().find(|p| p.label == label)
    }

    /// All partitions.
    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.0.iter()
    }
}

fn creation_rank(p: &Partition) -> usize {
    PARTITION_ORDER
        .iter()
        .position(|n| *n == p.name)
        .unwrap_or(PARTITION_ORDER.len())
}

fn mount_depth(p: &Partition) -> usize {
    p.mount_point
        .as_deref()
        .map(|m| m.components().count())
        .unwrap_or_default()
}

/// Partitions keyed by role name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMap(BTreeMap<String, Partition>);

impl PartitionMap {
    /// Insert `p` under its name, returning any partition it replaces.
    pub fn insert(&mut self, p: Partition) -> Option<Partition> {
        self.0.insert(p.name.clone(), p)
    }

    /// The partition with role `name`.
    pub fn get(&self, name: &str) -> Option<&Partition> {
        self.0.get(name)
    }

    /// Mutable access to the partition with role `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Partition> {
        self.0.get_mut(name)
    }

    /// Like [`PartitionMap::get`], failing with [`DeployError::NotFound`].
    pub fn require(&self, name: &str) -> Result<&Partition> {
        self.get(name)
            .ok_or_else(|| DeployError::NotFound(name.to_owned()).into())
    }

    /// Remove and return the partition with role `name`.
    pub fn remove(&mut self, name: &str) -> Option<Partition> {
        self.0.remove(name)
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no partitions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mutable access to every partition, by name.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Partition> {
        self.0.values_mut()
    }

    /// The order partitions are laid out on disk: efi, bios, oem, recovery,
    /// state, persistent, then any others by name.
    pub fn by_creation_order(&self) -> Vec<&Partition> {
        // Values come out sorted by name, so the stable sort breaks ties by name
        let mut parts: Vec<_> = self.0.values().collect();
        parts.sort_by_key(|p| creation_rank(p));
        parts
    }

    /// Partitions with a mount point, shallowest first (or deepest first
    /// when `descending`). Equal depths keep creation order, so the
    /// descending order is the exact reverse of the ascending one.
    pub fn by_mount_depth(&self, descending: bool) -> Vec<&Partition> {
        let mut parts: Vec<_> = self
            .by_creation_order()
            .into_iter()
            .filter(|p| p.mount_point.is_some())
            .collect();
        parts.sort_by_key(|p| mount_depth(p));
        if descending {
            parts.reverse();
        }
        parts
    }
}

/// A filesystem image file holding a system tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Image file path
    pub file: Utf8PathBuf,
    /// Filesystem label
    pub label: String,
    /// In MiB
    pub size: u64,
    /// Filesystem type
    pub fs: String,
    /// What to deploy into the image
    pub source: ImageSource,
    /// Where the image is mounted while deploying
    pub mount_point: Option<Utf8PathBuf>,
    /// Set while mounted
    pub loop_device: Option<Utf8PathBuf>,
}

impl Image {
    fn system(file: Utf8PathBuf, label: &str, source: ImageSource) -> Self {
        Self {
            file,
            label: label.to_owned(),
            size: IMG_SIZE,
            fs: LINUX_IMG_FS.to_owned(),
            source,
            mount_point: None,
            loop_device: None,
        }
    }

    /// Whether the image is a read-only squashfs.
    pub fn is_squashfs(&self) -> bool {
        self.fs == SQUASHFS
    }
}

fn image_file(mount_point: &Utf8Path, name: &str) -> Utf8PathBuf {
    mount_point.join(IMAGES_SUBDIR).join(name)
}

/// Facts about the running host that shape the default plans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    /// Booted through EFI firmware
    pub efi: bool,
    /// Root tree of the live media, when booted from it
    pub iso_root: Option<Utf8PathBuf>,
    /// Recovery squashfs shipped on the live media
    pub iso_recovery: Option<Utf8PathBuf>,
}

impl HostState {
    /// Inspect the running host.
    pub fn probe() -> Self {
        let exists = |p: &str| Utf8Path::new(p).exists().then(|| Utf8PathBuf::from(p));
        let recovery = Utf8Path::new(LIVE_DIR).join(RECOVERY_SQUASH_FILE);
        Self {
            efi: Utf8Path::new(EFI_DEVICE).exists(),
            iso_root: exists(ISO_BASE_TREE),
            iso_recovery: recovery.exists().then_some(recovery),
        }
    }
}

/// Everything `install` needs to lay out and populate a disk.
#[derive(Debug, Clone)]
pub struct InstallSpec {
    /// Disk to install to
    pub target: Utf8PathBuf,
    /// Firmware to install for
    pub firmware: Firmware,
    /// Partition table format
    pub part_table: PartTable,
    /// Partitions to create, keyed by role
    pub partitions: PartitionMap,
    /// The image booted by default
    pub active: Image,
    /// The image booted for recovery
    pub recovery: Image,
    /// A copy of the active image to fall back to
    pub passive: Image,
    /// Grub configuration template, relative to the deployed root
    pub grub_conf: Utf8PathBuf,
    /// Override the default entry name in the boot menu
    pub grub_default_entry: Option<String>,
    /// Serial console to enable in the boot menu
    pub tty: Option<String>,
    /// Reuse the existing partitions instead of repartitioning
    pub no_format: bool,
    /// Overwrite an existing installation when reusing partitions
    pub force: bool,
}

impl InstallSpec {
    /// The default layout for `target`. Firmware partitions are added
    /// separately by [`InstallSpec::add_firmware_partitions`] once the
    /// firmware and table type are final.
    pub fn new(target: impl Into<Utf8PathBuf>, host: &HostState) -> Self {
        let mut partitions = PartitionMap::default();
        partitions.insert(Partition::planned(OEM_PART, OEM_LABEL, OEM_SIZE, LINUX_FS, Some(OEM_DIR)));
        partitions.insert(Partition::planned(
            RECOVERY_PART,
            RECOVERY_LABEL,
            RECOVERY_SIZE,
            LINUX_FS,
            Some(RECOVERY_DIR),
        ));
        partitions.insert(Partition::planned(STATE_PART, STATE_LABEL, STATE_SIZE, LINUX_FS, Some(STATE_DIR)));
        partitions.insert(Partition::planned(
            PERSISTENT_PART,
            PERSISTENT_LABEL,
            PERSISTENT_SIZE,
            LINUX_FS,
            Some(PERSISTENT_DIR),
        ));

        let state_dir = Utf8Path::new(STATE_DIR);
        let recovery_dir = Utf8Path::new(RECOVERY_DIR);
        let mut active = Image::system(
            image_file(state_dir, ACTIVE_IMG_FILE),
            ACTIVE_LABEL,
            host.iso_root.clone().map(ImageSource::Dir).unwrap_or_default(),
        );
        active.mount_point = Some(ACTIVE_DIR.into());

        let recovery = match &host.iso_recovery {
            Some(squash) => Image {
                label: String::new(),
                fs: SQUASHFS.to_owned(),
                ..Image::system(
                    image_file(recovery_dir, RECOVERY_SQUASH_FILE),
                    "",
                    ImageSource::File(squash.clone()),
                )
            },
            None => Image::system(
                image_file(recovery_dir, RECOVERY_IMG_FILE),
                SYSTEM_LABEL,
                ImageSource::File(active.file.clone()),
            ),
        };
        let passive = Image::system(
            image_file(state_dir, PASSIVE_IMG_FILE),
            PASSIVE_LABEL,
            ImageSource::File(active.file.clone()),
        );

        Self {
            target: target.into(),
            firmware: if host.efi { Firmware::Efi } else { Firmware::Bios },
            part_table: PartTable::Gpt,
            partitions,
            active,
            recovery,
            passive,
            grub_conf: GRUB_CONF.into(),
            grub_default_entry: None,
            tty: None,
            no_format: false,
            force: false,
        }
    }

    /// Add the partitions the firmware needs to boot: an ESP for EFI, a
    /// `bios_grub` partition for BIOS on GPT, or the boot flag on the
    /// state partition for BIOS on MSDOS.
    pub fn add_firmware_partitions(&mut self) -> Result<()> {
        match (self.firmware, self.part_table) {
            (Firmware::Efi, PartTable::Gpt) => {
                let mut efi = Partition::planned(EFI_PART, EFI_LABEL, EFI_SIZE, EFI_FS, Some(EFI_DIR));
                efi.flags.push(PartitionFlag::Esp);
                self.partitions.insert(efi);
            }
            (Firmware::Bios, PartTable::Gpt) => {
                let mut bios = Partition::planned(BIOS_PART, "", BIOS_SIZE, "", None);
                bios.flags.push(PartitionFlag::BiosGrub);
                self.partitions.insert(bios);
            }
            (Firmware::Bios, PartTable::Msdos) => {
                let state = self
                    .partitions
                    .get_mut(STATE_PART)
                    .ok_or_else(|| DeployError::NotFound(STATE_PART.to_owned()))?;
                if !state.flags.contains(&PartitionFlag::Boot) {
                    state.flags.push(PartitionFlag::Boot);
                }
            }
            (Firmware::Efi, PartTable::Msdos) => {
                bail!("EFI firmware requires a GPT partition table")
            }
        }
        Ok(())
    }

    /// Apply the `[install]` section of the configuration file.
    pub fn apply_config(&mut self, config: &InstallConfig) -> Result<()> {
        if let Some(fw) = config.firmware {
            self.firmware = fw;
        }
        if let Some(pt) = config.part_table {
            self.part_table = pt;
        }
        if let Some(conf) = &config.grub_conf {
            self.grub_conf = conf.clone();
        }
        if let Some(entry) = &config.grub_default_entry {
            self.grub_default_entry = Some(entry.clone());
        }
        for (name, pc) in &config.partitions {
            let part = self
                .partitions
                .get_mut(name)
                .ok_or_else(|| anyhow!("Unknown partition in configuration: {name}"))?;
            if let Some(size) = &pc.size {
                part.size = parse_size_mib(size).with_context(|| format!("Parsing size of {name}"))?;
            }
            if let Some(fs) = &pc.fs {
                part.fs = fs.clone();
            }
            if let Some(label) = &pc.label {
                part.filesystem_label = label.clone();
            }
        }
        Ok(())
    }

    /// Reject plans that cannot be laid out.
    pub fn sanitize(&self) -> Result<()> {
        self.partitions.require(STATE_PART)?;
        self.partitions.require(RECOVERY_PART)?;
        let parts = self.partitions.by_creation_order();
        let last = parts.len().saturating_sub(1);
        for (i, p) in parts.iter().enumerate() {
            if p.size == 0 && i != last {
                bail!("Only the last partition can use the remaining space, not {}", p.name);
            }
        }
        if self.active.source.is_empty() {
            bail!("No source given for the active system image");
        }
        Ok(())
    }
}

fn discovered_role(found: &PartitionList, label: &str, role: &str, default_mount: &str) -> Option<Partition> {
    let mut p = found.by_filesystem_label(label)?.clone();
    p.name = role.to_owned();
    p.mount_point.get_or_insert_with(|| default_mount.into());
    Some(p)
}

/// Everything `reset` needs to restore the system from recovery.
#[derive(Debug, Clone)]
pub struct ResetSpec {
    /// Disk holding the partitions
    pub target: Utf8PathBuf,
    /// Booted through EFI firmware
    pub efi: bool,
    /// Partitions to reformat and remount, keyed by role
    pub partitions: PartitionMap,
    /// The image rebuilt from recovery
    pub active: Image,
    /// A copy of the new active image
    pub passive: Image,
    /// Grub configuration template, relative to the deployed root
    pub grub_conf: Utf8PathBuf,
    /// Override the default entry name in the boot menu
    pub grub_default_entry: Option<String>,
    /// Serial console to enable in the boot menu
    pub tty: Option<String>,
    /// Also wipe the persistent and OEM partitions
    pub reset_persistent: bool,
}

impl ResetSpec {
    /// Build the plan from the running recovery system.
    #[context("Preparing reset")]
    pub fn from_host(cfg: &Config, host: &HostState) -> Result<Self> {
        if !probe::booted_from_recovery(cfg.runner)? {
            return Err(DeployError::WrongBootSource("reset").into());
        }
        let squash = probe::booted_from(cfg.runner, RECOVERY_SQUASH_FILE)?;
        let found = probe::discover(cfg.runner)?;
        Self::from_partitions(&found, host, squash)
    }

    pub(crate) fn from_partitions(found: &PartitionList, host: &HostState, recovery_squash: bool) -> Result<Self> {
        let mut partitions = PartitionMap::default();
        let state = discovered_role(found, STATE_LABEL, STATE_PART, STATE_DIR)
            .ok_or_else(|| DeployError::NotFound(STATE_LABEL.to_owned()))?;
        let target = state
            .disk
            .clone()
            .ok_or_else(|| anyhow!("Unknown disk for state partition"))?;
        let state_dir = state.mount_path()?.to_owned();
        partitions.insert(state);
        if host.efi {
            let efi = discovered_role(found, EFI_LABEL, EFI_PART, EFI_DIR)
                .ok_or_else(|| DeployError::NotFound(EFI_LABEL.to_owned()))?;
            partitions.insert(efi);
        }
        for (label, role, dir) in [(OEM_LABEL, OEM_PART, OEM_DIR), (PERSISTENT_LABEL, PERSISTENT_PART, PERSISTENT_DIR)] {
            match discovered_role(found, label, role, dir) {
                Some(p) => {
                    partitions.insert(p);
                }
                None => tracing::warn!("No {role} partition found"),
            }
        }

        let source = if recovery_squash {
            ImageSource::Dir(ISO_BASE_TREE.into())
        } else {
            ImageSource::File(image_file(Utf8Path::new(RUNNING_STATE_DIR), RECOVERY_IMG_FILE))
        };
        let mut active = Image::system(image_file(&state_dir, ACTIVE_IMG_FILE), ACTIVE_LABEL, source);
        active.mount_point = Some(ACTIVE_DIR.into());
        let passive = Image::system(
            image_file(&state_dir, PASSIVE_IMG_FILE),
            PASSIVE_LABEL,
            ImageSource::File(active.file.clone()),
        );

        Ok(Self {
            target,
            efi: host.efi,
            partitions,
            active,
            passive,
            grub_conf: GRUB_CONF.into(),
            grub_default_entry: None,
            tty: None,
            reset_persistent: false,
        })
    }

    /// Deploy the active system from `source` instead of the recovery image.
    pub fn set_source(&mut self, source: ImageSource) {
        if !source.is_empty() {
            self.active.source = source;
        }
    }
}

/// Everything `upgrade` needs to replace the active or recovery image.
#[derive(Debug, Clone)]
pub struct UpgradeSpec {
    /// Upgrade the recovery image even when booted from active
    pub recovery_upgrade: bool,
    /// Content of the new image
    pub source: ImageSource,
    /// Partitions found on the host
    pub partitions: PartitionMap,
    /// The active image, replaced unless upgrading recovery
    pub active: Image,
    /// The recovery image
    pub recovery: Image,
    /// Where the previous active image is kept
    pub passive_file: Utf8PathBuf,
    /// Where the new image is mounted while being built
    pub transition_dir: Utf8PathBuf,
    /// Override the default entry name in the boot menu
    pub grub_default_entry: Option<String>,
}

impl UpgradeSpec {
    /// Plan an upgrade against the partitions on this host.
    #[context("Preparing upgrade")]
    pub fn from_host(cfg: &Config, source: ImageSource, recovery_upgrade: bool) -> Result<Self> {
        let found = probe::discover(cfg.runner)?;
        Self::from_partitions(&found, source, recovery_upgrade)
    }

    pub(crate) fn from_partitions(found: &PartitionList, source: ImageSource, recovery_upgrade: bool) -> Result<Self> {
        if source.is_empty() {
            bail!("No upgrade source given");
        }
        let mut partitions = PartitionMap::default();
        let state = discovered_role(found, STATE_LABEL, STATE_PART, RUNNING_STATE_DIR)
            .ok_or_else(|| DeployError::NotFound(STATE_LABEL.to_owned()))?;
        let state_dir = state.mount_path()?.to_owned();
        partitions.insert(state);
        let recovery_dir = match discovered_role(found, RECOVERY_LABEL, RECOVERY_PART, RECOVERY_DIR) {
            Some(p) => {
                let dir = p.mount_path()?.to_owned();
                partitions.insert(p);
                dir
            }
            None if recovery_upgrade => return Err(DeployError::NotFound(RECOVERY_LABEL.to_owned()).into()),
            None => RECOVERY_DIR.into(),
        };
        // Only bound into the chroot where already mounted
        for (label, role) in [(OEM_LABEL, OEM_PART), (PERSISTENT_LABEL, PERSISTENT_PART)] {
            if let Some(mut p) = found.by_filesystem_label(label).cloned() {
                p.name = role.to_owned();
                partitions.insert(p);
            }
        }

        let active = Image::system(image_file(&state_dir, ACTIVE_IMG_FILE), ACTIVE_LABEL, source.clone());
        let recovery = Image::system(image_file(&recovery_dir, RECOVERY_IMG_FILE), SYSTEM_LABEL, source.clone());
        Ok(Self {
            recovery_upgrade,
            source,
            partitions,
            active,
            recovery,
            passive_file: image_file(&state_dir, PASSIVE_IMG_FILE),
            transition_dir: TRANSITION_DIR.into(),
            grub_default_entry: None,
        })
    }
}
