//! Helpers for mounting filesystems and inspecting the mount table.

use std::fmt::Debug;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use osdeploy_utils::CommandRunExt;

/// A single entry of `findmnt -J` output.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    /// Mounted device or, for bind mounts, `device[/subdir]`
    pub source: String,
    /// Mount point
    pub target: String,
    /// Filesystem type
    #[serde(rename = "fstype")]
    pub fstype: String,
    /// Comma separated mount options
    #[serde(default)]
    pub options: String,
    /// Nested mounts, in tree output
    #[serde(default)]
    pub children: Option<Vec<Filesystem>>,
}

#[derive(Deserialize, Debug)]
struct Findmnt {
    filesystems: Vec<Filesystem>,
}

/// An active mount as seen through a [`Mounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// What is mounted
    pub device: String,
    /// Where
    pub path: Utf8PathBuf,
    /// Filesystem type
    pub fstype: String,
    /// Mount options, split
    pub options: Vec<String>,
}

impl From<Filesystem> for MountPoint {
    fn from(fs: Filesystem) -> Self {
        Self {
            device: fs.source,
            path: fs.target.into(),
            fstype: fs.fstype,
            options: fs
                .options
                .split(',')
                .filter(|o| !o.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        }
    }
}

/// Mounts and unmounts filesystems, and reports the mount table.
pub trait Mounter: Debug {
    /// Mount `device` at `target`. An empty `fstype` lets mount(8) probe.
    fn mount(&self, device: &str, target: &Utf8Path, fstype: &str, options: &[&str]) -> Result<()>;

    /// Unmount whatever is mounted at `target`.
    fn unmount(&self, target: &Utf8Path) -> Result<()>;

    /// The current mount table.
    fn list(&self) -> Result<Vec<MountPoint>>;

    /// Whether something is mounted exactly at `path`.
    fn is_mount_point(&self, path: &Utf8Path) -> Result<bool> {
        Ok(self.list()?.iter().any(|m| m.path == path))
    }
}

/// Parse the flattened output of `findmnt -J --list`.
pub fn parse_findmnt(buf: &[u8]) -> Result<Vec<Filesystem>> {
    let o: Findmnt = serde_json::from_slice(buf).context("Parsing findmnt output")?;
    let mut r = Vec::new();
    let mut stack = o.filesystems;
    stack.reverse();
    // Tree output nests children; keep parents before their children
    while let Some(mut fs) = stack.pop() {
        let children = fs.children.take().unwrap_or_default();
        r.push(fs);
        stack.extend(children.into_iter().rev());
    }
    Ok(r)
}

/// The [`Mounter`] backed by mount(8) and umount(8).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    #[context("Mounting {device} at {target}")]
    fn mount(&self, device: &str, target: &Utf8Path, fstype: &str, options: &[&str]) -> Result<()> {
        let mut cmd = Command::new("mount");
        if !fstype.is_empty() && fstype != "none" {
            cmd.args(["-t", fstype]);
        }
        if !options.is_empty() {
            let options = options.join(",");
            cmd.args(["-o", options.as_str()]);
        }
        cmd.arg(device).arg(target.as_str()).log_debug().run()
    }

    #[context("Unmounting {target}")]
    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        Command::new("umount")
            .arg(target.as_str())
            .log_debug()
            .run()
    }

    #[context("Listing mounts")]
    fn list(&self) -> Result<Vec<MountPoint>> {
        let buf = Command::new("findmnt")
            .args(["-J", "-l", "--output=SOURCE,TARGET,FSTYPE,OPTIONS"])
            .run_get_output()?;
        Ok(parse_findmnt(&buf)?.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_findmnt_tree() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
           "filesystems": [
              {
                 "source": "/dev/loop0",
                 "target": "/",
                 "fstype": "ext2",
                 "options": "ro,relatime",
                 "children": [
                    {
                       "source": "/dev/sda4",
                       "target": "/run/initramfs/cos-state",
                       "fstype": "ext4",
                       "options": "ro,relatime"
                    },{
                       "source": "/dev/sda2",
                       "target": "/oem",
                       "fstype": "ext4",
                       "options": "rw,relatime",
                       "children": [
                          {
                             "source": "/dev/sda3",
                             "target": "/oem/sub",
                             "fstype": "ext4",
                             "options": "rw"
                          }
                       ]
                    }
                 ]
              }
           ]
        }
        "# };
        let fs = parse_findmnt(fixture.as_bytes())?;
        let targets = fs.iter().map(|f| f.target.as_str()).collect::<Vec<_>>();
        assert_eq!(
            targets,
            ["/", "/run/initramfs/cos-state", "/oem", "/oem/sub"]
        );
        let state = MountPoint::from(fs[1].clone());
        assert_eq!(state.device, "/dev/sda4");
        assert_eq!(state.options, ["ro", "relatime"]);
        Ok(())
    }

    #[test]
    fn test_parse_findmnt_list() -> Result<()> {
        let fixture = br#"{"filesystems": [
            {"source": "tmpfs", "target": "/run", "fstype": "tmpfs", "options": ""}
        ]}"#;
        let fs = parse_findmnt(fixture)?;
        assert_eq!(fs.len(), 1);
        assert!(MountPoint::from(fs[0].clone()).options.is_empty());
        Ok(())
    }
}
