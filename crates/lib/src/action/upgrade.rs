//! In-place upgrade of the active or recovery image.
//!
//! The image backing the running system is never written to. New content
//! goes to a transition image next to the target, which is renamed over
//! the target only once fully populated.

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use osdeploy_utils::ResultExt;

use super::chroot_binds;
use crate::cleanstack::CleanupStack;
use crate::config::Config;
use crate::constants::{
    AFTER_UPGRADE_CHROOT_HOOK, AFTER_UPGRADE_HOOK, BEFORE_UPGRADE_HOOK, PASSIVE_LABEL, RECOVERY_PART,
    RECOVERY_SQUASH_FILE, SQUASHFS, STATE_PART, TRANSITION_IMG_FILE, TRANSITION_SQUASH_FILE,
};
use crate::grub::{self, Grub};
use crate::hooks;
use crate::imager::{set_label, ImageManager, MountMode};
use crate::probe::{self, BootSource};
use crate::reboot;
use crate::selinux;
use crate::spec::{Image, Partition, UpgradeSpec};

/// Builds a new system image and swaps it in for the active image, or for
/// the recovery image when booted from recovery or asked to.
#[derive(Debug)]
pub struct UpgradeAction<'a> {
    cfg: &'a Config<'a>,
    spec: UpgradeSpec,
}

impl<'a> UpgradeAction<'a> {
    /// Plan an upgrade to `spec`.
    pub fn new(cfg: &'a Config<'a>, spec: UpgradeSpec) -> Self {
        Self { cfg, spec }
    }

    /// Build a transition image and swap it in. Upgrades the recovery
    /// image instead when asked to, or when booted from recovery.
    #[context("Upgrading from {}", self.spec.source)]
    pub fn run(self) -> Result<()> {
        let cfg = self.cfg;
        let boot = probe::boot_source(cfg.runner)?;
        let upgrade_recovery = self.spec.recovery_upgrade || boot == BootSource::Recovery;
        hooks::run_hook(cfg, BEFORE_UPGRADE_HOOK)?;
        cfg.check_interrupted()?;

        let imager = ImageManager::new(cfg);
        let mut cleanup = CleanupStack::new();
        let r = self.upgrade(&imager, &mut cleanup, boot, upgrade_recovery);
        cleanup.cleanup(r)?;
        tracing::info!("Upgrade complete");
        reboot::finish(cfg)
    }

    /// Make the partition holding the target image writable. A partition
    /// the running system already mounted is remounted read-write and put
    /// back to read-only afterwards.
    fn mount_target_partition<'s>(
        &self,
        imager: &'s ImageManager<'a>,
        cleanup: &mut CleanupStack<'s>,
        part: &Partition,
    ) -> Result<()> {
        let mounter = self.cfg.mounter;
        let device = part.device()?.to_owned();
        let mount_point = part.mount_path()?.to_owned();
        if mounter.is_mount_point(&mount_point)? {
            tracing::debug!("Remounting {mount_point} read-write");
            mounter.mount(device.as_str(), &mount_point, "", &["remount", "rw"])?;
            cleanup.push(format!("remount {mount_point} read-only"), move || {
                mounter.mount(device.as_str(), &mount_point, "", &["remount", "ro"])
            });
        } else {
            imager.mount_partition(part, MountMode::ReadWrite)?;
            cleanup.push(format!("unmount {mount_point}"), move || imager.unmount_if_mounted(&mount_point));
        }
        Ok(())
    }

    fn upgrade<'s>(
        &self,
        imager: &'s ImageManager<'a>,
        cleanup: &mut CleanupStack<'s>,
        boot: BootSource,
        upgrade_recovery: bool,
    ) -> Result<()> {
        let cfg = self.cfg;
        let spec = &self.spec;
        let (part_name, mut target) = if upgrade_recovery {
            (RECOVERY_PART, spec.recovery.clone())
        } else {
            (STATE_PART, spec.active.clone())
        };
        let part = spec.partitions.require(part_name)?;
        self.mount_target_partition(imager, cleanup, part)?;

        let dir = target
            .file
            .parent()
            .ok_or_else(|| anyhow!("Invalid image path {}", target.file))?
            .to_owned();
        if upgrade_recovery {
            // Follow whatever format the installed recovery image has
            let squash = dir.join(RECOVERY_SQUASH_FILE);
            if squash.exists() {
                tracing::debug!("Found {squash}, upgrading a squashfs recovery image");
                target.file = squash;
                target.fs = SQUASHFS.to_owned();
                target.label.clear();
            }
        }
        tracing::info!("Upgrading {}", target.file);

        let transition_name = if target.is_squashfs() {
            TRANSITION_SQUASH_FILE
        } else {
            TRANSITION_IMG_FILE
        };
        let mut transition = Image {
            file: dir.join(transition_name),
            mount_point: Some(spec.transition_dir.clone()),
            loop_device: None,
            ..target.clone()
        };
        let (transition_file, transition_dir) = (transition.file.clone(), spec.transition_dir.clone());
        cleanup.push("discard transition image", move || {
            imager.unmount_if_mounted(&transition_dir)?;
            if transition_file.exists() {
                std::fs::remove_file(&transition_file)
                    .with_context(|| format!("Removing {transition_file}"))?;
            }
            Ok(())
        });

        let mut entry = None;
        if transition.is_squashfs() {
            imager.deploy_image(&mut transition, false)?;
        } else {
            imager.deploy_image(&mut transition, true)?;
            let root = transition.mount_point.clone().unwrap_or_default();
            hooks::run_chroot_hook(cfg, AFTER_UPGRADE_CHROOT_HOOK, &root, &chroot_binds(&spec.partitions))?;
            selinux::relabel(cfg, &root).log_err_default();
            entry = grub::default_entry(&root, spec.grub_default_entry.as_deref()).log_err_default();
            imager.unmount_image(&mut transition)?;
        }
        cfg.check_interrupted()?;

        let backup = (boot == BootSource::Active && !upgrade_recovery).then_some(spec.passive_file.as_path());
        swap_in(cfg, &transition.file, &target.file, backup)?;

        hooks::run_hook(cfg, AFTER_UPGRADE_HOOK)?;
        if !upgrade_recovery {
            let state_dir = spec.partitions.require(STATE_PART)?.mount_path()?;
            Grub::new(cfg).set_default_entry(state_dir, entry.as_deref()).log_err();
        }
        Ok(())
    }
}

/// Rename `transition` over `target`. With `backup`, the current target is
/// first kept there as the fallback image; if the final rename fails it is
/// moved back, so `target` never goes missing.
#[context("Replacing {target}")]
fn swap_in(cfg: &Config, transition: &Utf8Path, target: &Utf8Path, backup: Option<&Utf8Path>) -> Result<()> {
    let backup = match backup {
        Some(_) if !target.exists() => {
            tracing::warn!("No {target} to keep as fallback");
            None
        }
        b => b,
    };
    if let Some(passive) = backup {
        tracing::info!("Moving {target} to {passive}");
        std::fs::rename(target, passive).with_context(|| format!("Renaming {target} to {passive}"))?;
    }
    tracing::info!("Moving {transition} to {target}");
    if let Err(e) = std::fs::rename(transition, target) {
        if let Some(passive) = backup {
            std::fs::rename(passive, target)
                .with_context(|| format!("Restoring {target}"))
                .log_err_default();
        }
        return Err(e).with_context(|| format!("Renaming {transition} to {target}"));
    }
    if let Some(passive) = backup {
        // The new image is in place; a wrong label on the fallback only
        // affects its boot menu entry
        set_label(cfg, passive, PASSIVE_LABEL).log_err_default();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::constants::{ACTIVE_LABEL, MIB};
    use crate::probe::partitions_from_devices;
    use crate::source::ImageSource;
    use crate::testutils::{reroot, reroot_image, reroot_partitions, tempdir, FakeRunner, Fakes};

    const BOOTED_ACTIVE: &str = "root=LABEL=COS_STATE cos-img/filename=/cOS/active.img";
    const BOOTED_PASSIVE: &str = "root=LABEL=COS_STATE cos-img/filename=/cOS/passive.img";
    const BOOTED_RECOVERY: &str = "root=LABEL=COS_RECOVERY cos-img/filename=/cOS/recovery.img";

    fn plan(root: &Utf8Path, recovery_upgrade: bool) -> Result<UpgradeSpec> {
        let devices = osdeploy_blockdev::parse_lsblk(include_bytes!("../../tests/fixtures/lsblk.json"))?;
        let source = ImageSource::Docker("quay.io/org/os:v2".into());
        let mut spec = UpgradeSpec::from_partitions(&partitions_from_devices(&devices), source, recovery_upgrade)?;
        reroot_partitions(&mut spec.partitions, root);
        reroot_image(&mut spec.active, root);
        reroot_image(&mut spec.recovery, root);
        spec.active.size = 1;
        spec.recovery.size = 1;
        spec.passive_file = reroot(root, &spec.passive_file);
        spec.transition_dir = reroot(root, &spec.transition_dir);
        std::fs::create_dir_all(spec.active.file.parent().unwrap())?;
        std::fs::create_dir_all(spec.recovery.file.parent().unwrap())?;
        Ok(spec)
    }

    fn state_dir(spec: &UpgradeSpec) -> Utf8PathBuf {
        spec.partitions.get(STATE_PART).unwrap().mount_point.clone().unwrap()
    }

    #[test]
    fn test_upgrade_from_active() -> Result<()> {
        let (_td, root) = tempdir();
        let spec = plan(&root, false)?;
        let state = state_dir(&spec);
        let (active, passive) = (spec.active.file.clone(), spec.passive_file.clone());
        std::fs::write(&active, "running")?;
        std::fs::write(&passive, "fallback")?;
        let fakes = Fakes::with_runner(FakeRunner::new().with_cmdline(BOOTED_ACTIVE));
        fakes.mounter.add("/dev/sda4", &state, &["ro"]);
        let cfg = fakes.config();
        UpgradeAction::new(&cfg, spec).run()?;

        // The running image is now the fallback
        assert_eq!(std::fs::read_to_string(&passive)?, "running");
        assert_eq!(std::fs::metadata(&active)?.len(), MIB);
        assert!(!state.join("cOS/transition.img").exists());
        let runner = &fakes.runner;
        assert_eq!(
            runner.matching("mkfs"),
            [format!("mkfs.ext2 -F -L {ACTIVE_LABEL} {state}/cOS/transition.img")]
        );
        assert_eq!(runner.matching("tune2fs"), [format!("tune2fs -L COS_PASSIVE {passive}")]);
        assert_eq!(
            fakes.extractor.calls(),
            [format!("quay.io/org/os:v2 {root}/run/cos/transition linux/amd64 false")]
        );

        let log = fakes.mounter.log();
        assert_eq!(log.first().unwrap(), &format!("remount {state} rw"));
        assert_eq!(log.last().unwrap(), &format!("remount {state} ro"));
        assert_eq!(fakes.mounter.options_of(&state).unwrap(), ["ro"]);
        assert_eq!(fakes.mounter.mounted(), [state]);

        let stages = fakes.hooks.stages();
        assert_eq!(
            stages.iter().filter(|s| !s.contains('.')).collect::<Vec<_>>(),
            ["before-upgrade", "after-upgrade-chroot", "after-upgrade"]
        );
        Ok(())
    }

    #[test]
    fn test_upgrade_from_passive() -> Result<()> {
        let (_td, root) = tempdir();
        let spec = plan(&root, false)?;
        let state = state_dir(&spec);
        let (active, passive) = (spec.active.file.clone(), spec.passive_file.clone());
        std::fs::write(&active, "broken")?;
        std::fs::write(&passive, "running")?;
        let fakes = Fakes::with_runner(FakeRunner::new().with_cmdline(BOOTED_PASSIVE));
        let cfg = fakes.config();
        UpgradeAction::new(&cfg, spec).run()?;

        assert_eq!(std::fs::read_to_string(&passive)?, "running");
        assert_eq!(std::fs::metadata(&active)?.len(), MIB);
        assert!(!fakes.runner.called("tune2fs"));
        let log = fakes.mounter.log();
        assert_eq!(log.first().unwrap(), &format!("mount /dev/sda4 {state}"));
        assert_eq!(log.last().unwrap(), &format!("umount {state}"));
        assert!(fakes.mounter.mounted().is_empty());
        Ok(())
    }

    #[test]
    fn test_upgrade_recovery_squashfs() -> Result<()> {
        let (_td, root) = tempdir();
        let spec = plan(&root, false)?;
        let recovery_dir = spec.recovery.file.parent().unwrap().to_owned();
        let squash = recovery_dir.join(RECOVERY_SQUASH_FILE);
        std::fs::write(&squash, "old")?;
        let active = spec.active.file.clone();
        std::fs::write(&active, "untouched")?;

        let runner = FakeRunner::new()
            .with_cmdline(BOOTED_RECOVERY)
            .with_side_effect(|cmd, args| {
                (cmd == "mksquashfs").then(|| std::fs::write(args[1], "new").map(|_| Vec::new()).map_err(Into::into))
            });
        let fakes = Fakes::with_runner(runner);
        let cfg = fakes.config();
        UpgradeAction::new(&cfg, spec).run()?;

        assert_eq!(std::fs::read_to_string(&squash)?, "new");
        assert!(!recovery_dir.join(TRANSITION_SQUASH_FILE).exists());
        assert!(!recovery_dir.join("recovery.img").exists());
        assert_eq!(std::fs::read_to_string(&active)?, "untouched");
        let transition = recovery_dir.join(TRANSITION_SQUASH_FILE);
        assert!(fakes.runner.matching("mksquashfs")[0].contains(&format!(" {transition} -b 1024k")));
        // Nothing is chrooted into a read-only image
        assert!(fakes.syscall.chroots().is_empty());
        assert!(!fakes.runner.called("grub2-editenv"));
        assert!(fakes.mounter.mounted().is_empty());
        Ok(())
    }

    #[test]
    fn test_upgrade_recovery_image() -> Result<()> {
        let (_td, root) = tempdir();
        let spec = plan(&root, true)?;
        let recovery = spec.recovery.file.clone();
        std::fs::write(&recovery, "old")?;
        let fakes = Fakes::with_runner(FakeRunner::new().with_cmdline(BOOTED_ACTIVE));
        let cfg = fakes.config();
        UpgradeAction::new(&cfg, spec).run()?;

        assert_eq!(std::fs::metadata(&recovery)?.len(), MIB);
        assert!(!fakes.runner.called("tune2fs"));
        assert_eq!(fakes.runner.matching("mkfs")[0], format!("mkfs.ext2 -F -L COS_SYSTEM {}", recovery.with_file_name(TRANSITION_IMG_FILE)));
        Ok(())
    }

    #[test]
    fn test_relabel_failure_keeps_active() -> Result<()> {
        let (_td, root) = tempdir();
        let spec = plan(&root, false)?;
        let (active, passive) = (spec.active.file.clone(), spec.passive_file.clone());
        std::fs::write(&active, "running")?;
        let runner = FakeRunner::new()
            .with_cmdline(BOOTED_ACTIVE)
            .with_side_effect(|cmd, _| (cmd == "tune2fs").then(|| Err(anyhow::anyhow!("tune2fs: bad superblock"))));
        let fakes = Fakes::with_runner(runner);
        let cfg = fakes.config();
        UpgradeAction::new(&cfg, spec).run()?;

        assert_eq!(std::fs::metadata(&active)?.len(), MIB);
        assert_eq!(std::fs::read_to_string(&passive)?, "running");
        assert!(fakes.runner.called("tune2fs"));
        Ok(())
    }

    #[test]
    fn test_swap_in_restores_target() -> Result<()> {
        let (_td, root) = tempdir();
        let (active, passive) = (root.join("active.img"), root.join("passive.img"));
        std::fs::write(&active, "running")?;
        let fakes = Fakes::new();
        let cfg = fakes.config();
        // The transition image is missing, so the final rename fails
        let err = swap_in(&cfg, &root.join("transition.img"), &active, Some(&passive)).unwrap_err();
        assert!(format!("{err:#}").contains("transition.img"));
        assert_eq!(std::fs::read_to_string(&active)?, "running");
        assert!(!passive.exists());
        assert!(!fakes.runner.called("tune2fs"));
        Ok(())
    }

    #[test]
    fn test_failure_keeps_target() -> Result<()> {
        let (_td, root) = tempdir();
        let spec = plan(&root, false)?;
        let state = state_dir(&spec);
        let (active, passive) = (spec.active.file.clone(), spec.passive_file.clone());
        std::fs::write(&active, "running")?;
        let fakes = Fakes::with_runner(FakeRunner::new().with_cmdline(BOOTED_ACTIVE));
        fakes.extractor.fail.set(true);
        fakes.mounter.add("/dev/sda4", &state, &["ro"]);
        let cfg = fakes.config();
        assert!(UpgradeAction::new(&cfg, spec).run().is_err());

        assert_eq!(std::fs::read_to_string(&active)?, "running");
        assert!(!passive.exists());
        assert!(!state.join("cOS/transition.img").exists());
        assert_eq!(fakes.mounter.options_of(&state).unwrap(), ["ro"]);
        assert_eq!(fakes.mounter.mounted(), [state]);
        Ok(())
    }
}
