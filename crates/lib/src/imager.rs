//! Creating, mounting and populating filesystem images, and mounting
//! partitions.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config::Config;
use crate::constants::{MIB, ROOT_TREE_DIRS, SYNC_EXCLUDES};
use crate::error::DeployError;
use crate::partitioner::format_device;
use crate::source::ImageSource;
use crate::spec::{Image, Partition, PartitionMap};

/// How an image or partition is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountMode {
    ReadWrite,
    ReadOnly,
}

impl MountMode {
    fn as_str(&self) -> &'static str {
        match self {
            MountMode::ReadWrite => "rw",
            MountMode::ReadOnly => "ro",
        }
    }
}

#[derive(Debug)]
pub(crate) struct ImageManager<'a> {
    cfg: &'a Config<'a>,
}

impl<'a> ImageManager<'a> {
    pub(crate) fn new(cfg: &'a Config<'a>) -> Self {
        Self { cfg }
    }

    /// Allocate `img.file` at its full size and make a filesystem on it.
    #[context("Creating image {}", img.file)]
    pub(crate) fn create_filesystem_image(&self, img: &Image) -> Result<()> {
        if img.is_squashfs() {
            bail!("squashfs images are built from a tree, not formatted");
        }
        if let Some(parent) = img.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(&img.file)
            .and_then(|f| f.set_len(img.size * MIB))
            .with_context(|| DeployError::AllocationError(img.file.clone()))?;
        format_device(self.cfg.runner, &img.file, &img.fs, &img.label)
    }

    /// Mount `img` at its mount point through a loop device.
    #[context("Mounting {}", img.file)]
    pub(crate) fn mount_image(&self, img: &mut Image, mode: MountMode) -> Result<()> {
        let mount_point = img
            .mount_point
            .clone()
            .ok_or_else(|| anyhow!("No mount point for {}", img.file))?;
        std::fs::create_dir_all(&mount_point)?;
        self.cfg
            .mounter
            .mount(img.file.as_str(), &mount_point, "auto", &["loop", mode.as_str()])?;
        img.loop_device = self
            .cfg
            .mounter
            .list()?
            .into_iter()
            .rev()
            .find(|m| m.path == mount_point)
            .map(|m| Utf8PathBuf::from(m.device));
        Ok(())
    }

    pub(crate) fn unmount_image(&self, img: &mut Image) -> Result<()> {
        if let Some(mount_point) = &img.mount_point {
            self.unmount_if_mounted(mount_point)?;
        }
        img.loop_device = None;
        Ok(())
    }

    /// Unmount `path` if something is mounted there.
    pub(crate) fn unmount_if_mounted(&self, path: &Utf8Path) -> Result<()> {
        if self.cfg.mounter.is_mount_point(path)? {
            self.cfg.mounter.unmount(path)?;
        }
        Ok(())
    }

    /// Write `img` from its source. With `leave_mounted`, the image stays
    /// mounted read-write at its mount point afterwards.
    #[context("Deploying {}", img.file)]
    pub(crate) fn deploy_image(&self, img: &mut Image, leave_mounted: bool) -> Result<()> {
        tracing::info!("Deploying {} from {}", img.file, img.source);
        match img.source.clone() {
            ImageSource::Empty => {
                tracing::debug!("Nothing to deploy to {}", img.file);
                return Ok(());
            }
            ImageSource::File(src) => {
                self.copy_file(&src, &img.file)?;
                if !img.is_squashfs() && !img.label.is_empty() {
                    set_label(self.cfg, &img.file, &img.label)?;
                }
                if !leave_mounted || img.mount_point.is_none() {
                    return Ok(());
                }
                let mode = if img.is_squashfs() {
                    MountMode::ReadOnly
                } else {
                    MountMode::ReadWrite
                };
                self.mount_image(img, mode)?;
            }
            src if img.is_squashfs() => {
                self.build_squashfs(&src, &img.file)?;
                if leave_mounted && img.mount_point.is_some() {
                    self.mount_image(img, MountMode::ReadOnly)?;
                }
            }
            src => {
                self.create_filesystem_image(img)?;
                self.mount_image(img, MountMode::ReadWrite)?;
                let mount_point = img
                    .mount_point
                    .clone()
                    .ok_or_else(|| anyhow!("No mount point for {}", img.file))?;
                let populated = self
                    .populate(&src, &mount_point)
                    .and_then(|_| self.create_dir_structure(&mount_point));
                if populated.is_err() || !leave_mounted {
                    // Keep the populate error if both fail
                    let unmounted = self.unmount_image(img);
                    populated?;
                    unmounted?;
                }
            }
        }
        Ok(())
    }

    /// Write the content of `src` into the directory `target`.
    fn populate(&self, src: &ImageSource, target: &Utf8Path) -> Result<()> {
        let run = self.cfg.run;
        match src {
            ImageSource::Dir(dir) => self.sync_data(dir, target),
            ImageSource::Docker(reference) => {
                if run.cosign {
                    let key = run.cosign_key.as_deref();
                    if !self.cfg.verifier.verify(reference, key)? {
                        return Err(DeployError::Verification(reference.clone()).into());
                    }
                }
                self.cfg
                    .extractor
                    .extract_image(reference, target, &run.platform(), run.local)
            }
            ImageSource::Channel(package) => {
                self.cfg.packages.sync_repositories(&run.repositories)?;
                self.cfg.packages.unpack(target, package)
            }
            o => bail!("Cannot populate a tree from {o}"),
        }
    }

    /// Stage `src` in a scratch directory next to `file`, then pack it.
    fn build_squashfs(&self, src: &ImageSource, file: &Utf8Path) -> Result<()> {
        let parent = file
            .parent()
            .ok_or_else(|| anyhow!("Invalid image path {file}"))?;
        std::fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)
            .context("Creating staging directory")?;
        let staging_path = Utf8Path::from_path(staging.path())
            .ok_or_else(|| anyhow!("Non UTF-8 staging path"))?;
        self.populate(src, staging_path)?;
        self.create_dir_structure(staging_path)?;
        if file.exists() {
            std::fs::remove_file(file)?;
        }
        let mut args = vec![staging_path.as_str(), file.as_str(), "-b", "1024k", "-comp", "xz"];
        if self.cfg.run.arch == "x86_64" {
            args.extend(["-Xbcj", "x86"]);
        }
        self.cfg.runner.run("mksquashfs", &args)?;
        Ok(())
    }

    /// Copy the tree `src` into `target`, skipping pseudo filesystems.
    #[context("Copying {src} to {target}")]
    pub(crate) fn sync_data(&self, src: &Utf8Path, target: &Utf8Path) -> Result<()> {
        let excludes: Vec<String> = SYNC_EXCLUDES.iter().map(|e| format!("--exclude={e}")).collect();
        let src = format!("{}/", src.as_str().trim_end_matches('/'));
        let target = format!("{}/", target.as_str().trim_end_matches('/'));
        let mut args = vec!["-aqAX"];
        args.extend(excludes.iter().map(String::as_str));
        args.extend([src.as_str(), target.as_str()]);
        self.cfg.runner.run("rsync", &args)?;
        Ok(())
    }

    /// Create the top level directories every root needs.
    pub(crate) fn create_dir_structure(&self, root: &Utf8Path) -> Result<()> {
        for dir in ROOT_TREE_DIRS {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).with_context(|| format!("Creating {path}"))?;
        }
        std::fs::set_permissions(root.join("tmp"), std::fs::Permissions::from_mode(0o1777))
            .context("Setting permissions of tmp")?;
        Ok(())
    }

    #[context("Copying {src} to {dst}")]
    pub(crate) fn copy_file(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)?;
        Ok(())
    }

    /// Mount every partition that has a mount point, parents first.
    #[context("Mounting partitions")]
    pub(crate) fn mount_partitions(&self, parts: &PartitionMap) -> Result<()> {
        for part in parts.by_mount_depth(false) {
            if part.path.is_none() {
                tracing::debug!("Not mounting {}, no device", part.name);
                continue;
            }
            self.mount_partition(part, MountMode::ReadWrite)?;
        }
        Ok(())
    }

    pub(crate) fn mount_partition(&self, part: &Partition, mode: MountMode) -> Result<()> {
        let device = part.device()?;
        let target = part.mount_path()?;
        let mounts = self.cfg.mounter.list()?;
        if mounts.iter().any(|m| m.path == target && m.device == device.as_str()) {
            tracing::debug!("{device} already mounted at {target}");
            return Ok(());
        }
        std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
        self.cfg
            .mounter
            .mount(device.as_str(), target, "auto", &[mode.as_str()])
    }

    /// Unmount partitions children first. Every partition is attempted; the
    /// first failure is returned.
    pub(crate) fn unmount_partitions(&self, parts: &PartitionMap) -> Result<()> {
        let mut result = Ok(());
        for part in parts.by_mount_depth(true) {
            let Some(mount_point) = &part.mount_point else {
                continue;
            };
            if let Err(e) = self.unmount_if_mounted(mount_point) {
                tracing::warn!("Unmounting {}: {e:#}", part.name);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

/// Rewrite the filesystem label of an ext image or device.
pub(crate) fn set_label(cfg: &Config, device: &Utf8Path, label: &str) -> Result<()> {
    cfg.runner
        .run("tune2fs", &["-L", label, device.as_str()])
        .with_context(|| format!("Labeling {device} as {label}"))?;
    Ok(())
}
