//! Partition table creation and filesystem formatting, via parted(8) and
//! the mkfs family.

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use osdeploy_blockdev::{partition_device_path, partitions_of, PartitionTable, PartitionType};
use osdeploy_utils::Runner;

use crate::constants::MIB;
use crate::error::DeployError;
use crate::spec::{PartTable, Partition, PartitionFlag};

/// Partitions start on 1MiB boundaries.
const ALIGNMENT_BYTES: u64 = MIB;
const DEFAULT_SECTOR_SIZE: u64 = 512;

/// A disk being partitioned, tracking the table as we change it.
#[derive(Debug)]
pub struct Disk<'a> {
    runner: &'a dyn Runner,
    device: Utf8PathBuf,
    table: Option<PartitionTable>,
    // Geometry from the last table read, kept across wipes
    sectorsize: Option<u64>,
    lastlba: Option<u64>,
}

impl<'a> Disk<'a> {
    /// Open `device`, reading its current partition table if any.
    pub fn load(runner: &'a dyn Runner, device: &Utf8Path) -> Self {
        let mut disk = Self {
            runner,
            device: device.to_owned(),
            table: None,
            sectorsize: None,
            lastlba: None,
        };
        disk.reload();
        disk
    }

    fn reload(&mut self) {
        self.table = match partitions_of(self.runner, &self.device) {
            Ok(t) => {
                self.sectorsize = t.sectorsize.or(self.sectorsize);
                self.lastlba = t.lastlba.or(self.lastlba);
                Some(t)
            }
            Err(e) => {
                tracing::debug!("No usable partition table on {}: {e:#}", self.device);
                None
            }
        };
    }

    fn sector_size(&self) -> u64 {
        self.table
            .as_ref()
            .map(|t| t.sector_size())
            .or(self.sectorsize)
            .unwrap_or(DEFAULT_SECTOR_SIZE)
    }

    /// The disk's device node.
    pub fn device(&self) -> &Utf8Path {
        &self.device
    }

    /// Number of partitions in the table.
    pub fn partition_count(&self) -> usize {
        self.table.as_ref().map_or(0, |t| t.partitions.len())
    }

    /// Remove filesystem and partition table signatures.
    #[context("Wiping {}", self.device)]
    pub fn wipe(&mut self) -> Result<()> {
        self.runner.run("wipefs", &["--all", "--force", self.device.as_str()])?;
        self.table = None;
        Ok(())
    }

    /// Write a new, empty partition table.
    #[context("Creating {kind} partition table on {}", self.device)]
    pub fn new_partition_table(&mut self, kind: PartTable) -> Result<()> {
        let label = kind.to_string();
        self.runner
            .run("parted", &["--script", "--", self.device.as_str(), "mklabel", &label])?;
        self.reload();
        if self.table.is_none() {
            // Not everything can be read back right away, e.g. loop devices
            // before the kernel rescans them
            self.table = Some(PartitionTable {
                label: match kind {
                    PartTable::Gpt => PartitionType::Gpt,
                    PartTable::Msdos => PartitionType::Dos,
                },
                device: self.device.to_string(),
                lastlba: self.lastlba,
                sectorsize: self.sectorsize,
                partitions: Vec::new(),
            });
        }
        Ok(())
    }

    /// Append a partition of `size` MiB (0 for the rest of the disk) and
    /// return its number. `name` is the GPT partition label.
    #[context("Creating partition {name} on {}", self.device)]
    pub fn create_partition(
        &mut self,
        name: &str,
        size: u64,
        fs: &str,
        flags: &[PartitionFlag],
    ) -> Result<u32> {
        let sector = self.sector_size();
        let table = self
            .table
            .as_mut()
            .ok_or_else(|| anyhow!("No partition table on {}", self.device))?;
        let align = (ALIGNMENT_BYTES / sector).max(1);
        let start = table
            .next_free_sector()
            .map(|s| s.div_ceil(align) * align)
            .unwrap_or(align);
        let end = match size {
            0 => None,
            n => Some(start + n * MIB / sector - 1),
        };
        if let Some(last) = table.lastlba {
            let required = end.unwrap_or(start);
            if required > last {
                return Err(DeployError::NoSpace {
                    disk: self.device.clone(),
                    required: required - start + 1,
                    available: last.saturating_sub(start) + 1,
                }
                .into());
            }
        }

        let partno = u32::try_from(table.partitions.len() + 1)?;
        let part_name = match table.label {
            PartitionType::Dos => "primary",
            _ => name,
        };
        let start_arg = format!("{start}s");
        let end_arg = end.map_or_else(|| "100%".to_owned(), |e| format!("{e}s"));
        let mut args = vec!["--script", "--machine", "--", self.device.as_str(), "unit", "s", "mkpart", part_name];
        if let Some(fs) = parted_fs_type(fs) {
            args.push(fs);
        }
        args.extend([start_arg.as_str(), end_arg.as_str()]);
        self.runner.run("parted", &args)?;

        let partno_arg = partno.to_string();
        for flag in flags {
            self.runner.run(
                "parted",
                &["--script", "--", self.device.as_str(), "set", &partno_arg, flag.as_str(), "on"],
            )?;
        }

        let node = partition_device_path(&self.device, partno);
        let psize = match (end, table.lastlba) {
            (Some(e), _) => e - start + 1,
            (None, Some(last)) => last - start + 1,
            (None, None) => 0,
        };
        table.partitions.push(osdeploy_blockdev::Partition {
            node: node.to_string(),
            start,
            size: psize,
            parttype: String::new(),
            uuid: None,
            name: Some(name.to_owned()),
        });
        tracing::debug!("Created partition {node} ({name}) at sector {start}");
        Ok(partno)
    }

    /// Grow the last partition to `size` MiB, or to the end of the disk
    /// when `size` is 0.
    #[context("Expanding last partition of {}", self.device)]
    pub fn expand_last_partition(&mut self, size: u64) -> Result<()> {
        let sector = self.sector_size();
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| anyhow!("No partition table on {}", self.device))?;
        let last = table
            .partitions
            .iter()
            .max_by_key(|p| p.start)
            .ok_or_else(|| anyhow!("No partitions on {}", self.device))?;
        let end = match size {
            0 => "100%".to_owned(),
            n => {
                let end = last.start + n * MIB / sector - 1;
                if end < last.start + last.size - 1 {
                    bail!("Shrinking partitions is not supported");
                }
                if let Some(lastlba) = table.lastlba.filter(|l| end > *l) {
                    return Err(DeployError::NoSpace {
                        disk: self.device.clone(),
                        required: end - last.start + 1,
                        available: lastlba - last.start + 1,
                    }
                    .into());
                }
                format!("{end}s")
            }
        };
        let partno = table.partitions.len().to_string();
        self.runner.run(
            "parted",
            &["--script", "--", self.device.as_str(), "unit", "s", "resizepart", &partno, &end],
        )?;
        self.reload();
        Ok(())
    }

    /// Wait for the kernel and udev to catch up with the new table.
    pub fn settle(&self) -> Result<()> {
        self.runner
            .run("partx", &["-u", self.device.as_str()])
            .context("Rescanning partitions")?;
        self.runner.run("udevadm", &["settle"])?;
        Ok(())
    }
}

/// The file system type hint parted expects for `fs`.
fn parted_fs_type(fs: &str) -> Option<&str> {
    match fs {
        "" => None,
        "vfat" | "fat" => Some("fat32"),
        "swap" => Some("linux-swap"),
        o => Some(o),
    }
}

/// Create a filesystem of type `fs` labelled `label` on `device`, which
/// may be a block device or an image file.
pub fn format_device(runner: &dyn Runner, device: &Utf8Path, fs: &str, label: &str) -> Result<()> {
    let dev = device.as_str();
    let (cmd, mut args): (String, Vec<&str>) = match fs {
        "ext2" | "ext3" | "ext4" => (format!("mkfs.{fs}"), vec!["-F"]),
        "xfs" | "btrfs" => (format!("mkfs.{fs}"), vec!["-f"]),
        "vfat" => ("mkfs.vfat".to_owned(), vec![]),
        o => return Err(DeployError::UnsupportedFilesystem(o.to_owned()).into()),
    };
    if !label.is_empty() {
        args.push(if fs == "vfat" { "-n" } else { "-L" });
        args.push(label);
    }
    args.push(dev);
    tracing::debug!("Formatting {device} as {fs}");
    runner
        .run(&cmd, &args)
        .map(|_| ())
        .with_context(|| DeployError::FormatError {
            device: device.to_owned(),
            fs: fs.to_owned(),
        })
}

/// Format `part` per its planned filesystem. Partitions without one, like
/// the BIOS boot partition, are left alone.
pub fn format_partition(runner: &dyn Runner, part: &Partition) -> Result<()> {
    if part.fs.is_empty() {
        tracing::debug!("Partition {} has no filesystem", part.name);
        return Ok(());
    }
    format_device(runner, part.device()?, &part.fs, &part.filesystem_label)
}
