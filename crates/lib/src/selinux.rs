//! SELinux relabeling of a deployed tree.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::config::Config;
use crate::constants::SELINUX_CONTEXT_FILE;

/// Relabel `root` with the file contexts shipped inside it. Trees without a
/// targeted policy, and hosts without `setfiles`, are left alone.
#[context("Relabeling {root}")]
pub(crate) fn relabel(cfg: &Config, root: &Utf8Path) -> Result<()> {
    let contexts = root.join(SELINUX_CONTEXT_FILE);
    if !contexts.exists() {
        tracing::debug!("No SELinux file contexts in {root}");
        return Ok(());
    }
    if !cfg.runner.command_exists("setfiles") {
        tracing::debug!("setfiles not available, skipping relabel");
        return Ok(());
    }
    tracing::info!("Relabeling {root}");
    cfg.runner
        .run("setfiles", &["-r", root.as_str(), contexts.as_str(), root.as_str()])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{tempdir, Fakes};

    #[test]
    fn test_relabel() -> Result<()> {
        let (_td, root) = tempdir();
        let fakes = Fakes::new();
        let cfg = fakes.config();
        relabel(&cfg, &root)?;
        assert!(fakes.runner.calls().is_empty());

        let contexts = root.join(SELINUX_CONTEXT_FILE);
        std::fs::create_dir_all(contexts.parent().unwrap())?;
        std::fs::write(&contexts, "")?;
        relabel(&cfg, &root)?;
        assert_eq!(fakes.runner.calls(), [format!("setfiles -r {root} {contexts} {root}")]);
        Ok(())
    }
}
