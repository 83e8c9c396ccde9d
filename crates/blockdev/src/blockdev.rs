//! Block device discovery and loopback helpers.
//!
//! Everything here shells out through a [`Runner`] so callers can
//! substitute canned tool output.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Deserializer};

use osdeploy_utils::Runner;

/// Device type of loopback devices, which are always backed by something else.
pub const LOOP_TYPE: &str = "loop";
/// Filesystem type reported for LUKS containers.
pub const CRYPT_FSTYPE: &str = "crypto_LUKS";

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// One row of `lsblk --list` output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Device {
    /// Device name, e.g. `sda1`
    pub name: String,
    /// Kernel name, the key other rows use in `pkname`
    #[serde(default)]
    pub kname: Option<String>,
    /// Parent kernel name
    #[serde(default)]
    pub pkname: Option<String>,
    /// Device node; missing on older lsblk
    #[serde(default)]
    pub path: Option<String>,
    /// `disk`, `part`, `loop`, `crypt`...
    #[serde(default, rename = "type")]
    pub devtype: Option<String>,
    /// Filesystem label
    #[serde(default)]
    pub label: Option<String>,
    /// GPT partition name
    #[serde(default)]
    pub partlabel: Option<String>,
    /// Filesystem type
    #[serde(default)]
    pub fstype: Option<String>,
    /// Filesystem size in bytes
    #[serde(default, deserialize_with = "deserialize_size")]
    pub fssize: Option<u64>,
    /// Device size in bytes
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    /// Partition flags, whitespace separated
    #[serde(default)]
    pub partflags: Option<String>,
    /// Where the device is mounted, if anywhere
    #[serde(default)]
    pub mountpoint: Option<String>,
}

/// lsblk emits sizes as JSON numbers on newer util-linux and as strings on
/// older releases.
fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Num(u64),
        Str(String),
    }
    Ok(match Option::<Size>::deserialize(deserializer)? {
        Some(Size::Num(n)) => Some(n),
        Some(Size::Str(s)) => s.trim().parse().ok(),
        None => None,
    })
}

impl Device {
    /// The device node, derived from the name when lsblk has no `PATH`.
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    /// The name other rows reference as their parent.
    pub fn kernel_name(&self) -> &str {
        self.kname.as_deref().unwrap_or(&self.name)
    }

    /// Loop devices and LUKS containers are backed by another device or
    /// partition; they are never targets in their own right.
    pub fn is_overlay(&self) -> bool {
        self.devtype.as_deref() == Some(LOOP_TYPE) || self.fstype.as_deref() == Some(CRYPT_FSTYPE)
    }

    /// Size of the filesystem on this device in MiB, or 0 if unknown.
    pub fn fssize_mib(&self) -> u64 {
        self.fssize.unwrap_or_default() / (1024 * 1024)
    }

    /// Partition flags, split on whitespace.
    pub fn flags(&self) -> Vec<String> {
        self.partflags
            .as_deref()
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(ToOwned::to_owned)
            .collect()
    }
}

/// Parse `lsblk -J --list` output.
pub fn parse_lsblk(buf: &[u8]) -> Result<Vec<Device>> {
    let devs: DevicesOutput = serde_json::from_slice(buf).context("Parsing lsblk output")?;
    Ok(devs.blockdevices)
}

/// List every block device on the host as a flat list.
#[context("Listing block devices")]
pub fn list_devices(runner: &dyn Runner) -> Result<Vec<Device>> {
    let buf = runner.run("lsblk", &["-a", "-J", "-O", "-l", "-b"])?;
    parse_lsblk(&buf)
}

/// Index of devices by kernel name, used to walk up to root disks.
#[derive(Debug)]
pub struct DeviceTree<'a> {
    by_kname: HashMap<&'a str, &'a Device>,
}

impl<'a> DeviceTree<'a> {
    /// Index `devices`.
    pub fn new(devices: &'a [Device]) -> Self {
        let by_kname = devices.iter().map(|d| (d.kernel_name(), d)).collect();
        Self { by_kname }
    }

    /// Follow parent links until reaching a device without a parent. A
    /// partition of a LUKS container on `sda5` resolves to `sda`.
    pub fn root_disk(&self, dev: &'a Device) -> &'a Device {
        let mut current = dev;
        // Bounded in case of a malformed cyclic listing
        for _ in 0..self.by_kname.len() {
            let Some(parent) = current
                .pkname
                .as_deref()
                .filter(|p| !p.is_empty())
                .and_then(|p| self.by_kname.get(p))
            else {
                break;
            };
            current = parent;
        }
        current
    }
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// A partition as reported by `sfdisk -J`. Offsets are in sectors.
#[derive(Debug, Clone, Deserialize)]
pub struct Partition {
    /// Device node
    pub node: String,
    /// First sector
    pub start: u64,
    /// Length in sectors
    pub size: u64,
    /// GPT type GUID or MBR type code
    #[serde(rename = "type")]
    pub parttype: String,
    /// Partition UUID
    #[serde(default)]
    pub uuid: Option<String>,
    /// GPT partition name
    #[serde(default)]
    pub name: Option<String>,
}

/// Partition table flavors sfdisk reports.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// MBR, which sfdisk calls `dos`
    Dos,
    /// GUID partition table
    Gpt,
    /// Anything else, e.g. `sun`
    Unknown(String),
}

/// The partition table of one disk.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionTable {
    /// Table flavor
    pub label: PartitionType,
    /// Disk device node
    pub device: String,
    /// Last usable sector, absent on MBR
    #[serde(default)]
    pub lastlba: Option<u64>,
    /// Logical sector size in bytes
    #[serde(default)]
    pub sectorsize: Option<u64>,
    /// Partitions in table order; sfdisk omits the key for an empty table
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Logical sector size, 512 when sfdisk does not say.
    pub fn sector_size(&self) -> u64 {
        self.sectorsize.unwrap_or(512)
    }

    /// The sector right after the partition that ends last, or `None` for
    /// an empty table.
    pub fn next_free_sector(&self) -> Option<u64> {
        self.partitions.iter().map(|p| p.start + p.size).max()
    }
}

/// Parse `sfdisk -J` output.
pub fn parse_sfdisk(buf: &[u8]) -> Result<PartitionTable> {
    let o: SfDiskOutput = serde_json::from_slice(buf).context("Parsing sfdisk output")?;
    Ok(o.partitiontable)
}

/// Read the partition table of `dev`. Fails on a disk without one.
#[context("Listing partitions of {dev}")]
pub fn partitions_of(runner: &dyn Runner, dev: &Utf8Path) -> Result<PartitionTable> {
    let buf = runner.run("sfdisk", &["-J", dev.as_str()])?;
    parse_sfdisk(&buf)
}

/// The device node of partition `partno` on `disk`. Disks whose name ends
/// in a digit (nvme, mmcblk, loop) use a `p` separator.
pub fn partition_device_path(disk: &Utf8Path, partno: u32) -> Utf8PathBuf {
    let sep = if disk.as_str().ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    format!("{disk}{sep}{partno}").into()
}

/// A disk image file attached with `losetup`, so it can be partitioned
/// like a real disk. Detached on drop if not closed first.
#[derive(Debug)]
pub struct LoopbackDevice<'r> {
    runner: &'r dyn Runner,
    dev: Utf8PathBuf,
    attached: bool,
}

impl<'r> LoopbackDevice<'r> {
    /// Attach `file` to the first free loop device, scanning it for
    /// partitions.
    #[context("Attaching loopback device for {file}")]
    pub fn new(runner: &'r dyn Runner, file: &Utf8Path) -> Result<Self> {
        let out = runner.run_string("losetup", &["--show", "-P", "--find", file.as_str()])?;
        let dev = out.trim();
        if dev.is_empty() {
            return Err(anyhow!("losetup did not report a device for {file}"));
        }
        tracing::debug!("Attached {file} to {dev}");
        Ok(Self {
            runner,
            dev: dev.into(),
            attached: true,
        })
    }

    /// The loop device node, e.g. `/dev/loop0`.
    pub fn path(&self) -> &Utf8Path {
        &self.dev
    }

    fn detach(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.attached) {
            return Ok(());
        }
        self.runner.run("losetup", &["-d", self.dev.as_str()])?;
        Ok(())
    }

    /// Detach the device, reporting failure.
    pub fn close(mut self) -> Result<()> {
        self.detach()
    }
}

impl Drop for LoopbackDevice<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            tracing::warn!("Detaching {}: {e:#}", self.dev);
        }
    }
}

/// Parse a size in MiB. A bare number is MiB; `M`, `G` and `T` suffixes
/// (optionally `MiB`, `GiB`, `TiB`) scale by powers of 1024.
pub fn parse_size_mib(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let mul: u64 = match unit.trim() {
        "" | "M" | "MiB" => 1,
        "G" | "GiB" => 1024,
        "T" | "TiB" => 1024 * 1024,
        o => anyhow::bail!("Unknown size unit {o:?} in {s:?}"),
    };
    let n: u64 = num.parse().with_context(|| format!("Parsing size {s:?}"))?;
    n.checked_mul(mul).ok_or_else(|| anyhow!("Size {s:?} overflows"))
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingRunner {
        calls: RefCell<Vec<String>>,
    }

    impl Runner for RecordingRunner {
        fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
            self.calls
                .borrow_mut()
                .push(osdeploy_utils::format_cmdline(cmd, args));
            match cmd {
                "losetup" if args.contains(&"--find") => Ok(b"/dev/loop7\n".to_vec()),
                "lsblk" => Ok(include_bytes!("../tests/fixtures/lsblk.json").to_vec()),
                _ => Ok(Vec::new()),
            }
        }

        fn command_exists(&self, _cmd: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_parse_size_mib() {
        let ident_cases = [0, 10, 9, 1024].into_iter().map(|k| (k.to_string(), k));
        let cases = [
            ("0M", 0),
            ("10M", 10),
            ("10MiB", 10),
            ("1G", 1024),
            ("9G", 9216),
            ("15GiB", 15360),
            ("11T", 11 * 1024 * 1024),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v));
        for (s, v) in ident_cases.chain(cases) {
            assert_eq!(parse_size_mib(&s).unwrap(), v as u64, "Parsing {s}");
        }
        assert!(parse_size_mib("10Mfoo").is_err());
        assert!(parse_size_mib("G").is_err());
        assert!(parse_size_mib("10K").is_err());
        assert!(parse_size_mib("99999999999999T").is_err());
    }

    #[test]
    fn test_parse_lsblk() -> Result<()> {
        let runner = RecordingRunner::default();
        let devs = list_devices(&runner)?;
        assert_eq!(devs.len(), 8);
        assert_eq!(runner.calls.borrow()[0], "lsblk -a -J -O -l -b");

        let state = devs
            .iter()
            .find(|d| d.label.as_deref() == Some("COS_STATE"))
            .unwrap();
        // Older lsblk emits strings for sizes
        assert_eq!(state.fssize_mib(), 15269);
        assert_eq!(state.mountpoint.as_deref(), Some("/run/initramfs/cos-state"));
        assert!(state.flags().is_empty());

        let overlays = devs
            .iter()
            .filter(|d| d.is_overlay())
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(overlays, ["sda5", "loop0"]);
        Ok(())
    }

    #[test]
    fn test_root_disk() -> Result<()> {
        let devs = parse_lsblk(include_bytes!("../tests/fixtures/lsblk.json"))?;
        let tree = DeviceTree::new(&devs);
        let persistent = devs.iter().find(|d| d.kernel_name() == "dm-0").unwrap();
        assert_eq!(tree.root_disk(persistent).path(), "/dev/sda");
        let sda = &devs[0];
        assert_eq!(tree.root_disk(sda).path(), "/dev/sda");
        Ok(())
    }

    #[test]
    fn test_partition_device_path() {
        let cases = [
            ("/dev/sda", 1, "/dev/sda1"),
            ("/dev/vdb", 4, "/dev/vdb4"),
            ("/dev/nvme0n1", 2, "/dev/nvme0n1p2"),
            ("/dev/loop0", 3, "/dev/loop0p3"),
        ];
        for (disk, n, expected) in cases {
            assert_eq!(partition_device_path(disk.into(), n), expected);
        }
    }

    #[test]
    fn test_loopback() -> Result<()> {
        let runner = RecordingRunner::default();
        {
            let dev = LoopbackDevice::new(&runner, "/var/tmp/disk.raw".into())?;
            assert_eq!(dev.path().as_str(), "/dev/loop7");
        }
        let calls = runner.calls.borrow();
        similar_asserts::assert_eq!(
            calls.as_slice(),
            [
                "losetup --show -P --find /var/tmp/disk.raw",
                "losetup -d /dev/loop7",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_parse_sfdisk() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
            "partitiontable": {
               "label": "gpt",
               "id": "A67AA901-2C72-4818-B098-7F1CAC127279",
               "device": "/dev/loop0",
               "unit": "sectors",
               "firstlba": 34,
               "lastlba": 20971486,
               "sectorsize": 512,
               "partitions": [
                  {
                     "node": "/dev/loop0p1",
                     "start": 2048,
                     "size": 131072,
                     "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
                     "uuid": "58A4C5F0-BD12-424C-B563-195AC65A25DD",
                     "name": "efi"
                  },{
                     "node": "/dev/loop0p2",
                     "start": 133120,
                     "size": 131072,
                     "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
                     "uuid": "F51ABB0D-DA16-4A21-83CB-37F4C805AAA0",
                     "name": "oem"
                  }
               ]
            }
         }
        "# };
        let table = parse_sfdisk(fixture.as_bytes())?;
        assert_eq!(table.label, PartitionType::Gpt);
        assert_eq!(table.partitions[1].name.as_deref(), Some("oem"));
        assert_eq!(table.next_free_sector(), Some(264192));
        assert_eq!(table.sector_size(), 512);

        let empty = parse_sfdisk(
            br#"{"partitiontable": {"label": "dos", "device": "/dev/vdb", "sectorsize": 4096}}"#,
        )?;
        assert_eq!(empty.label, PartitionType::Dos);
        assert!(empty.partitions.is_empty());
        assert_eq!(empty.next_free_sector(), None);
        Ok(())
    }
}
