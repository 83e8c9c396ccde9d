//! Handling of system restarts/poweroff after an action completes

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::config::Config;
use crate::constants::ISO_LABEL;
use crate::probe;

/// systemd runs every executable here just before the final shutdown
const SHUTDOWN_HOOKS_DIR: &str = "/usr/lib/systemd/system-shutdown";
const EJECT_SCRIPT: &str = "#!/bin/sh\n/usr/bin/eject -rmF\n";
const DELAY: Duration = Duration::from_secs(5);

/// Apply the configured end of run behavior: arrange for the live media to
/// be ejected if asked to, then reboot, power off or just return.
pub(crate) fn finish(cfg: &Config) -> Result<()> {
    finish_with(cfg, Utf8Path::new(SHUTDOWN_HOOKS_DIR), DELAY)
}

fn finish_with(cfg: &Config, shutdown_dir: &Utf8Path, delay: Duration) -> Result<()> {
    let run = cfg.run;
    if run.eject_cd && probe::booted_from(cfg.runner, ISO_LABEL)? {
        install_eject_script(shutdown_dir)?;
    }
    if run.reboot {
        tracing::info!("Rebooting in {} seconds", delay.as_secs());
        restart(cfg, "reboot", delay)
    } else if run.poweroff {
        tracing::info!("Shutting down in {} seconds", delay.as_secs());
        restart(cfg, "poweroff", delay)
    } else {
        Ok(())
    }
}

#[context("Writing eject script")]
fn install_eject_script(dir: &Utf8Path) -> Result<()> {
    tracing::info!("Live media will be ejected on shutdown");
    std::fs::create_dir_all(dir)?;
    let path = dir.join("eject");
    std::fs::write(&path, EJECT_SCRIPT).with_context(|| format!("Writing {path}"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o744))?;
    Ok(())
}

/// Run `<cmd> -f` after `delay`.
#[context("Initiating {cmd}")]
fn restart(cfg: &Config, cmd: &str, delay: Duration) -> Result<()> {
    // Flush output streams
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::thread::sleep(delay);
    cfg.runner.run(cmd, &["-f"])?;
    Ok(())
}
