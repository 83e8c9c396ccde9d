//! Discovery of partitions and of what the host booted from.

use std::time::Duration;

use anyhow::Result;
use fn_error_context::context;

use osdeploy_blockdev::{list_devices, Device, DeviceTree};
use osdeploy_utils::{ResultExt, Runner};

use crate::constants::{
    ACTIVE_IMG_FILE, ACTIVE_LABEL, PASSIVE_IMG_FILE, PASSIVE_LABEL, RECOVERY_IMG_FILE, RECOVERY_SQUASH_FILE,
    SYSTEM_LABEL,
};
use crate::error::DeployError;
use crate::kernel::Cmdline;
use crate::spec::{Partition, PartitionList};

/// Which system image the host is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSource {
    /// The active image
    Active,
    /// The passive (fallback) image
    Passive,
    /// The recovery image
    Recovery,
    /// Live media or an unrelated system
    Unknown,
}

/// Convert an lsblk listing to partitions, skipping whole disks and
/// devices that merely back another (loop devices, LUKS containers).
pub(crate) fn partitions_from_devices(devices: &[Device]) -> PartitionList {
    let tree = DeviceTree::new(devices);
    let parts = devices
        .iter()
        .filter(|d| !d.is_overlay())
        .filter(|d| !matches!(d.devtype.as_deref(), Some("disk" | "rom")))
        .map(|d| Partition {
            name: d.partlabel.clone().unwrap_or_default(),
            label: d.partlabel.clone().unwrap_or_default(),
            filesystem_label: d.label.clone().unwrap_or_default(),
            size: d.fssize_mib(),
            fs: d.fstype.clone().unwrap_or_default(),
            flags: d.flags().iter().filter_map(|f| f.parse().ok()).collect(),
            mount_point: d.mountpoint.as_deref().filter(|m| !m.is_empty()).map(Into::into),
            path: Some(d.path().into()),
            disk: Some(tree.root_disk(d).path().into()),
        })
        .collect();
    PartitionList(parts)
}

/// Every partition on the host.
#[context("Discovering partitions")]
pub fn discover(runner: &dyn Runner) -> Result<PartitionList> {
    let devices = list_devices(runner)?;
    Ok(partitions_from_devices(&devices))
}

/// Find the partition whose filesystem has `label`, trying up to `attempts`
/// times and letting udev settle in between.
pub fn get_by_label(runner: &dyn Runner, label: &str, attempts: u32) -> Result<Partition> {
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            runner.run("udevadm", &["settle"]).log_err_with("udevadm settle");
            std::thread::sleep(Duration::from_secs(1));
        }
        if let Some(p) = discover(runner)?.by_filesystem_label(label) {
            return Ok(p.clone());
        }
    }
    Err(DeployError::NotFound(label.to_owned()).into())
}

/// Whether `marker` appears on the kernel command line.
pub fn booted_from(runner: &dyn Runner, marker: &str) -> Result<bool> {
    Ok(Cmdline::from_runner(runner)?.contains(marker))
}

/// Classify the running image by the root label or image file name the
/// boot menu put on the kernel command line.
pub fn boot_source(runner: &dyn Runner) -> Result<BootSource> {
    let cmdline = Cmdline::from_runner(runner)?;
    let any = |markers: &[&str]| markers.iter().any(|m| cmdline.contains(m));
    let source = if any(&[RECOVERY_SQUASH_FILE, RECOVERY_IMG_FILE, SYSTEM_LABEL]) {
        BootSource::Recovery
    } else if any(&[PASSIVE_LABEL, PASSIVE_IMG_FILE]) {
        BootSource::Passive
    } else if any(&[ACTIVE_LABEL, ACTIVE_IMG_FILE]) {
        BootSource::Active
    } else {
        BootSource::Unknown
    };
    tracing::debug!("Booted from {source:?}");
    Ok(source)
}

/// Whether the running system is the recovery image.
pub fn booted_from_recovery(runner: &dyn Runner) -> Result<bool> {
    Ok(boot_source(runner)? == BootSource::Recovery)
}
