//! Restoring the active system from the recovery system.

use anyhow::{anyhow, Result};
use fn_error_context::context;

use osdeploy_utils::ResultExt;

use super::chroot_binds;
use crate::cleanstack::CleanupStack;
use crate::config::Config;
use crate::constants::{
    AFTER_RESET_CHROOT_HOOK, AFTER_RESET_HOOK, BEFORE_RESET_HOOK, EFI_PART, OEM_PART, PERSISTENT_PART,
    STATE_PART,
};
use crate::grub::{self, Grub, GrubInstall};
use crate::hooks;
use crate::imager::ImageManager;
use crate::partitioner::format_partition;
use crate::reboot;
use crate::selinux;
use crate::spec::ResetSpec;

/// Reformats the state partition and redeploys the active and passive
/// images, by default from the recovery image.
#[derive(Debug)]
pub struct ResetAction<'a> {
    cfg: &'a Config<'a>,
    spec: ResetSpec,
}

impl<'a> ResetAction<'a> {
    /// Plan a reset to `spec`.
    pub fn new(cfg: &'a Config<'a>, spec: ResetSpec) -> Self {
        Self { cfg, spec }
    }

    /// Reformat, redeploy both images and reinstall the bootloader.
    #[context("Resetting {}", self.spec.target)]
    pub fn run(mut self) -> Result<()> {
        let cfg = self.cfg;
        hooks::run_hook(cfg, BEFORE_RESET_HOOK)?;
        cfg.check_interrupted()?;

        let imager = ImageManager::new(cfg);
        self.reformat(&imager)?;

        let mut cleanup = CleanupStack::new();
        let r = self.deploy(&imager, &mut cleanup);
        cleanup.cleanup(r)?;
        tracing::info!("Reset complete");
        reboot::finish(cfg)
    }

    /// Wipe the state partition, and with `reset_persistent` the persistent
    /// and OEM partitions too. Partitions are reformatted in place, never
    /// recreated.
    fn reformat(&self, imager: &ImageManager) -> Result<()> {
        let mut names = vec![STATE_PART];
        if self.spec.reset_persistent {
            names.extend([PERSISTENT_PART, OEM_PART]);
        }
        for name in names {
            let Some(part) = self.spec.partitions.get(name) else {
                continue;
            };
            if let Some(mount_point) = &part.mount_point {
                imager.unmount_if_mounted(mount_point)?;
            }
            tracing::info!("Formatting {} partition", part.name);
            format_partition(self.cfg.runner, part)?;
        }
        Ok(())
    }

    fn deploy<'s>(&mut self, imager: &'s ImageManager<'_>, cleanup: &mut CleanupStack<'s>) -> Result<()> {
        let cfg = self.cfg;
        let spec = &mut self.spec;

        let parts = spec.partitions.clone();
        cleanup.push("unmount partitions", move || imager.unmount_partitions(&parts));
        imager.mount_partitions(&spec.partitions)?;

        let root = spec
            .active
            .mount_point
            .clone()
            .ok_or_else(|| anyhow!("No mount point for the active image"))?;
        let active_root = root.clone();
        cleanup.push("unmount active image", move || imager.unmount_if_mounted(&active_root));
        imager.deploy_image(&mut spec.active, true)?;
        cfg.check_interrupted()?;

        let state = spec.partitions.require(STATE_PART)?;
        let state_dir = state.mount_path()?;
        let efi_dir = if spec.efi {
            Some(spec.partitions.require(EFI_PART)?.mount_path()?)
        } else {
            None
        };
        let grub = Grub::new(cfg);
        grub.install(&GrubInstall {
            target: spec.target.as_str(),
            root: &root,
            boot_dir: state_dir,
            grub_conf: &spec.grub_conf,
            tty: spec.tty.as_deref(),
            efi_dir,
            state_label: &state.filesystem_label,
        })?;
        selinux::relabel(cfg, &root).log_err_default();
        hooks::run_chroot_hook(cfg, AFTER_RESET_CHROOT_HOOK, &root, &chroot_binds(&spec.partitions))?;
        let entry = grub::default_entry(&root, spec.grub_default_entry.as_deref()).log_err_default();
        imager.unmount_image(&mut spec.active)?;
        cfg.check_interrupted()?;

        imager.deploy_image(&mut spec.passive, false)?;

        hooks::run_hook(cfg, AFTER_RESET_HOOK)?;
        grub.set_default_entry(state_dir, entry.as_deref()).log_err();
        Ok(())
    }
}
