//! Well-known labels, paths and sizes of the deployed layout.

/// Filesystem label of the EFI system partition
pub const EFI_LABEL: &str = "COS_GRUB";
/// Filesystem label of the active system image
pub const ACTIVE_LABEL: &str = "COS_ACTIVE";
/// Filesystem label of the passive (fallback) system image
pub const PASSIVE_LABEL: &str = "COS_PASSIVE";
/// Filesystem label of a non-squashfs recovery system image
pub const SYSTEM_LABEL: &str = "COS_SYSTEM";
/// Filesystem label of the recovery partition
pub const RECOVERY_LABEL: &str = "COS_RECOVERY";
/// Filesystem label of the state partition
pub const STATE_LABEL: &str = "COS_STATE";
/// Filesystem label of the persistent partition
pub const PERSISTENT_LABEL: &str = "COS_PERSISTENT";
/// Filesystem label of the OEM partition
pub const OEM_LABEL: &str = "COS_OEM";
/// Volume label of the live installation media
pub const ISO_LABEL: &str = "COS_LIVE";

/// Partition role names. These double as GPT partition labels.
pub const EFI_PART: &str = "efi";
/// BIOS boot partition, GPT on BIOS only
pub const BIOS_PART: &str = "bios";
/// OEM configuration partition
pub const OEM_PART: &str = "oem";
/// Partition holding the recovery image
pub const RECOVERY_PART: &str = "recovery";
/// Partition holding the active and passive images
pub const STATE_PART: &str = "state";
/// Persistent data, mounted at `/usr/local`
pub const PERSISTENT_PART: &str = "persistent";

/// Partition creation order; unknown roles sort after these.
pub const PARTITION_ORDER: &[&str] = &[
    EFI_PART,
    BIOS_PART,
    OEM_PART,
    RECOVERY_PART,
    STATE_PART,
    PERSISTENT_PART,
];

/// Filesystem of the data partitions
pub const LINUX_FS: &str = "ext4";
/// Filesystem of system images
pub const LINUX_IMG_FS: &str = "ext2";
/// Read-only compressed image filesystem
pub const SQUASHFS: &str = "squashfs";
/// Filesystem of the EFI system partition
pub const EFI_FS: &str = "vfat";

/// Bytes per MiB
pub const MIB: u64 = 1024 * 1024;

// Sizes, in MiB
/// Default EFI partition size
pub const EFI_SIZE: u64 = 64;
/// Size of the BIOS boot partition
pub const BIOS_SIZE: u64 = 1;
/// Default OEM partition size
pub const OEM_SIZE: u64 = 64;
/// Default recovery partition size
pub const RECOVERY_SIZE: u64 = 8192;
/// Default state partition size
pub const STATE_SIZE: u64 = 15360;
/// Persistent takes the rest of the disk
pub const PERSISTENT_SIZE: u64 = 0;
/// Default system image size
pub const IMG_SIZE: u64 = 3072;

/// Mount point of the state partition while deploying
pub const STATE_DIR: &str = "/run/cos/state";
/// Mount point of the recovery partition while deploying
pub const RECOVERY_DIR: &str = "/run/cos/recovery";
/// Mount point of the OEM partition while deploying
pub const OEM_DIR: &str = "/run/cos/oem";
/// Mount point of the persistent partition while deploying
pub const PERSISTENT_DIR: &str = "/run/cos/persistent";
/// Mount point of the EFI partition while deploying
pub const EFI_DIR: &str = "/run/cos/efi";
/// Mount point of the active image while deploying
pub const ACTIVE_DIR: &str = "/run/cos/active";
/// Mount point of the transition image during an upgrade
pub const TRANSITION_DIR: &str = "/run/cos/transition";
/// Where the partition holding the booted image is mounted by the initramfs
pub const RUNNING_STATE_DIR: &str = "/run/initramfs/cos-state";
/// Mount point of the live media
pub const LIVE_DIR: &str = "/run/initramfs/live";
/// Root tree of a live ISO boot
pub const ISO_BASE_TREE: &str = "/run/rootfsbase";
/// Present only on EFI booted hosts
pub const EFI_DEVICE: &str = "/sys/firmware/efi";

/// Directory holding system images within the state and recovery partitions
pub const IMAGES_SUBDIR: &str = "cOS";
/// Active image file name
pub const ACTIVE_IMG_FILE: &str = "active.img";
/// Passive image file name
pub const PASSIVE_IMG_FILE: &str = "passive.img";
/// Recovery image file name
pub const RECOVERY_IMG_FILE: &str = "recovery.img";
/// Recovery image file name when squashfs
pub const RECOVERY_SQUASH_FILE: &str = "recovery.squashfs";
/// Upgrade staging image
pub const TRANSITION_IMG_FILE: &str = "transition.img";
/// Upgrade staging image for a squashfs recovery
pub const TRANSITION_SQUASH_FILE: &str = "transition.squashfs";

/// Hook stage `before-install`
pub const BEFORE_INSTALL_HOOK: &str = "before-install";
/// Hook stage `after-install-chroot`
pub const AFTER_INSTALL_CHROOT_HOOK: &str = "after-install-chroot";
/// Hook stage `after-install`
pub const AFTER_INSTALL_HOOK: &str = "after-install";
/// Hook stage `before-reset`
pub const BEFORE_RESET_HOOK: &str = "before-reset";
/// Hook stage `after-reset-chroot`
pub const AFTER_RESET_CHROOT_HOOK: &str = "after-reset-chroot";
/// Hook stage `after-reset`
pub const AFTER_RESET_HOOK: &str = "after-reset";
/// Hook stage `before-upgrade`
pub const BEFORE_UPGRADE_HOOK: &str = "before-upgrade";
/// Hook stage `after-upgrade-chroot`
pub const AFTER_UPGRADE_CHROOT_HOOK: &str = "after-upgrade-chroot";
/// Hook stage `after-upgrade`
pub const AFTER_UPGRADE_HOOK: &str = "after-upgrade";

/// Kernel argument naming extra cloud-init sources for every hook stage
pub const COS_SETUP_KARG: &str = "cos.setup";
/// Kernel command line, also read as dot notation cloud-init configuration
pub const PROC_CMDLINE: &str = "/proc/cmdline";
/// Default cloud-init configuration locations
pub const CLOUD_INIT_PATHS: &[&str] = &["/system/oem", "/oem/", "/usr/local/cloud-config/"];

/// Grub configuration template, relative to the deployed root
pub const GRUB_CONF: &str = "/etc/cos/grub.cfg";
/// Grub environment file on the state partition
pub const GRUB_OEM_ENV: &str = "grub_oem_env";
/// Grub environment variable naming the default entry
pub const GRUB_DEFAULT_ENTRY_KEY: &str = "default_menu_entry";
/// os-release key carrying the boot menu entry name
pub const GRUB_ENTRY_NAME_KEY: &str = "GRUB_ENTRY_NAME";
/// Console the grub configuration already enables
pub const DEFAULT_TTY: &str = "tty1";
/// Directory on the EFI partition holding our loaders
pub const EFI_VENDOR_DIR: &str = "EFI/elemental";
/// Firmware boot entry name
pub const EFI_BOOT_ENTRY: &str = "elemental";
/// Loaders copied from `usr/share/efi/<arch>` of the deployed root, shim first
pub const SHIM_FILES: &[&str] = &["shim.efi", "MokManager.efi", "grub.efi"];

/// Where persistent is bound in chroot hooks
pub const USR_LOCAL_PATH: &str = "/usr/local";
/// Where OEM is bound in chroot hooks
pub const OEM_PATH: &str = "/oem";

/// File contexts of the targeted policy, relative to the deployed root
pub const SELINUX_CONTEXT_FILE: &str = "etc/selinux/targeted/contexts/files/file_contexts";

/// Top level directories present in every deployed image
pub const ROOT_TREE_DIRS: &[&str] = &["sys", "proc", "dev", "tmp", "boot", "usr/local", "oem"];

/// Paths never copied from a directory source
pub const SYNC_EXCLUDES: &[&str] = &["/mnt", "/proc", "/sys", "/dev", "/tmp", "/host", "/run"];

/// Default location of the configuration file
pub const CONFIG_PATH: &str = "/etc/osdeploy/config.toml";
/// Where repository definitions for channel sources are written
pub const PACKAGE_CONFIG_PATH: &str = "/run/osdeploy/luet.yaml";
