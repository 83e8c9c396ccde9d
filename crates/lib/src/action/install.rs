//! Fresh installation to a disk.

use anyhow::{anyhow, bail, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use osdeploy_blockdev::{partition_device_path, LoopbackDevice};
use osdeploy_utils::ResultExt;

use super::chroot_binds;
use crate::cleanstack::CleanupStack;
use crate::config::Config;
use crate::constants::{
    AFTER_INSTALL_CHROOT_HOOK, AFTER_INSTALL_HOOK, BEFORE_INSTALL_HOOK, EFI_PART, RECOVERY_PART, STATE_PART,
};
use crate::error::DeployError;
use crate::grub::{self, Grub, GrubInstall};
use crate::hooks;
use crate::imager::ImageManager;
use crate::partitioner::{format_partition, Disk};
use crate::probe::{self, BootSource};
use crate::reboot;
use crate::selinux;
use crate::spec::{Firmware, InstallSpec};

/// Installs a system onto a disk, or a disk image file, from scratch.
#[derive(Debug)]
pub struct InstallAction<'a> {
    cfg: &'a Config<'a>,
    spec: InstallSpec,
}

impl<'a> InstallAction<'a> {
    /// Plan an install of `spec`.
    pub fn new(cfg: &'a Config<'a>, spec: InstallSpec) -> Self {
        Self { cfg, spec }
    }

    /// Partition, format and populate the target, then install the
    /// bootloader. The partition table is not restored on failure; every
    /// mount is.
    #[context("Installing to {}", self.spec.target)]
    pub fn run(mut self) -> Result<()> {
        let cfg = self.cfg;
        self.spec.sanitize()?;
        hooks::run_hook(cfg, BEFORE_INSTALL_HOOK)?;
        cfg.check_interrupted()?;

        let loopdev = if self.spec.target.is_file() {
            Some(LoopbackDevice::new(cfg.runner, &self.spec.target)?)
        } else {
            None
        };
        let target = loopdev
            .as_ref()
            .map_or_else(|| self.spec.target.clone(), |l| l.path().to_owned());

        let imager = ImageManager::new(cfg);
        let mut cleanup = CleanupStack::new();
        let r = self
            .prepare_partitions(&target)
            .and_then(|_| self.deploy(&imager, &mut cleanup, &target));
        cleanup.cleanup(r)?;
        if let Some(loopdev) = loopdev {
            loopdev.close()?;
        }
        tracing::info!("Installation complete");
        reboot::finish(cfg)
    }

    fn prepare_partitions(&mut self, target: &Utf8Path) -> Result<()> {
        if self.spec.no_format {
            return self.find_partitions();
        }
        let runner = self.cfg.runner;
        let mut disk = Disk::load(runner, target);
        tracing::info!("Partitioning {target}");
        disk.wipe()?;
        disk.new_partition_table(self.spec.part_table)?;
        let order: Vec<String> = self
            .spec
            .partitions
            .by_creation_order()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        for name in &order {
            self.cfg.check_interrupted()?;
            let Some(part) = self.spec.partitions.get_mut(name) else {
                continue;
            };
            let partno = disk.create_partition(&part.label, part.size, &part.fs, &part.flags)?;
            part.path = Some(partition_device_path(target, partno));
            part.disk = Some(target.to_owned());
        }
        disk.settle()?;
        for part in self.spec.partitions.by_creation_order() {
            format_partition(runner, part)?;
        }
        Ok(())
    }

    /// Reuse partitions already on the host, matched by filesystem label.
    fn find_partitions(&mut self) -> Result<()> {
        let runner = self.cfg.runner;
        if !self.spec.force && matches!(probe::boot_source(runner)?, BootSource::Active | BootSource::Passive) {
            bail!("Use --force to install over the running system");
        }
        let found = probe::discover(runner)?;
        let efi = self.spec.firmware == Firmware::Efi;
        for part in self.spec.partitions.iter_mut() {
            if part.filesystem_label.is_empty() {
                continue;
            }
            match found.by_filesystem_label(&part.filesystem_label) {
                Some(existing) => {
                    part.path = existing.path.clone();
                    part.disk = existing.disk.clone();
                }
                None if part.name == STATE_PART || part.name == RECOVERY_PART || (efi && part.name == EFI_PART) => {
                    return Err(DeployError::NotFound(part.filesystem_label.clone()).into());
                }
                None => tracing::warn!("No {} partition found", part.name),
            }
        }
        Ok(())
    }

    fn deploy<'s>(
        &mut self,
        imager: &'s ImageManager<'_>,
        cleanup: &mut CleanupStack<'s>,
        target: &Utf8Path,
    ) -> Result<()> {
        let cfg = self.cfg;
        let spec = &mut self.spec;

        let parts = spec.partitions.clone();
        cleanup.push("unmount partitions", move || imager.unmount_partitions(&parts));
        imager.mount_partitions(&spec.partitions)?;

        let root: Utf8PathBuf = spec
            .active
            .mount_point
            .clone()
            .ok_or_else(|| anyhow!("No mount point for the active image"))?;
        let active_root = root.clone();
        cleanup.push("unmount active image", move || imager.unmount_if_mounted(&active_root));
        imager.deploy_image(&mut spec.active, true)?;
        cfg.check_interrupted()?;

        hooks::run_chroot_hook(cfg, AFTER_INSTALL_CHROOT_HOOK, &root, &chroot_binds(&spec.partitions))?;

        // Grub goes in while the active tree is still mounted; recovery and
        // passive are copies of the finished active image.
        let state = spec.partitions.require(STATE_PART)?;
        let state_dir = state.mount_path()?;
        let efi_dir = match spec.firmware {
            Firmware::Efi => Some(spec.partitions.require(EFI_PART)?.mount_path()?),
            Firmware::Bios => None,
        };
        let grub = Grub::new(cfg);
        grub.install(&GrubInstall {
            target: target.as_str(),
            root: &root,
            boot_dir: state_dir,
            grub_conf: &spec.grub_conf,
            tty: spec.tty.as_deref(),
            efi_dir,
            state_label: &state.filesystem_label,
        })?;
        selinux::relabel(cfg, &root).log_err_default();
        let entry = grub::default_entry(&root, spec.grub_default_entry.as_deref()).log_err_default();
        imager.unmount_image(&mut spec.active)?;
        cfg.check_interrupted()?;

        imager.deploy_image(&mut spec.recovery, false)?;
        imager.deploy_image(&mut spec.passive, false)?;

        hooks::run_hook(cfg, AFTER_INSTALL_HOOK)?;
        grub.set_default_entry(state_dir, entry.as_deref()).log_err();
        Ok(())
    }
}
