//! The install, reset and upgrade state machines.
//!
//! Each action consumes its plan, registers teardown for every mount it
//! makes on a [`CleanupStack`](crate::cleanstack::CleanupStack) and unwinds
//! it before returning, whether or not the run succeeded.

mod install;
mod reset;
mod upgrade;

pub use install::InstallAction;
pub use reset::ResetAction;
pub use upgrade::UpgradeAction;

use camino::Utf8Path;

use crate::constants::{OEM_PART, OEM_PATH, PERSISTENT_PART, USR_LOCAL_PATH};
use crate::spec::PartitionMap;

/// Extra bind mounts for chroot hooks: the persistent partition at
/// `/usr/local` and the OEM partition at `/oem`, where those are part of
/// the plan.
fn chroot_binds(parts: &PartitionMap) -> Vec<(&Utf8Path, &'static str)> {
    [(PERSISTENT_PART, USR_LOCAL_PATH), (OEM_PART, OEM_PATH)]
        .into_iter()
        .filter_map(|(name, target)| {
            let mount_point = parts.get(name)?.mount_point.as_deref()?;
            Some((mount_point, target))
        })
        .collect()
}
