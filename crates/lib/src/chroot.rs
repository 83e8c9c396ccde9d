//! Running code with a deployed tree as the root directory.

use std::fmt::Debug;
use std::fs::File;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config::Config;

/// The process level calls needed to enter and leave a chroot.
pub trait Syscall: Debug {
    /// Change the root directory.
    fn chroot(&self, path: &Utf8Path) -> Result<()>;
    /// Change the working directory.
    fn chdir(&self, path: &Utf8Path) -> Result<()>;
    /// Change directory to an open directory handle.
    fn fchdir(&self, dir: &File) -> Result<()>;
}

/// Direct system calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSyscall;

impl Syscall for RealSyscall {
    fn chroot(&self, path: &Utf8Path) -> Result<()> {
        rustix::process::chroot(path.as_std_path()).with_context(|| format!("chroot({path})"))
    }

    fn chdir(&self, path: &Utf8Path) -> Result<()> {
        rustix::process::chdir(path.as_std_path()).with_context(|| format!("chdir({path})"))
    }

    fn fchdir(&self, dir: &File) -> Result<()> {
        rustix::process::fchdir(dir).context("fchdir")
    }
}

const DEFAULT_BIND_MOUNTS: &[&str] = &["/dev", "/dev/pts", "/proc", "/sys"];

/// A root directory with the host's pseudo filesystems bound into it.
#[derive(Debug)]
pub(crate) struct Chroot<'a> {
    cfg: &'a Config<'a>,
    root: Utf8PathBuf,
    /// Host path and the path within the root to bind it at
    binds: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    active: Vec<Utf8PathBuf>,
}

impl<'a> Chroot<'a> {
    pub(crate) fn new(cfg: &'a Config<'a>, root: &Utf8Path) -> Self {
        let binds = DEFAULT_BIND_MOUNTS
            .iter()
            .map(|p| (Utf8PathBuf::from(p), Utf8PathBuf::from(p)))
            .collect();
        Self {
            cfg,
            root: root.to_owned(),
            binds,
            active: Vec::new(),
        }
    }

    /// Also bind `source` at `target` inside the root. Mounted after the
    /// defaults, in the order added.
    pub(crate) fn add_bind(&mut self, source: &Utf8Path, target: &Utf8Path) {
        self.binds.push((source.to_owned(), target.to_owned()));
    }

    fn inner_path(&self, target: &Utf8Path) -> Utf8PathBuf {
        self.root.join(target.strip_prefix("/").unwrap_or(target))
    }

    /// Bind mount everything. On failure, whatever was mounted is unmounted
    /// again.
    #[context("Preparing chroot {}", self.root)]
    pub(crate) fn prepare(&mut self) -> Result<()> {
        if !self.active.is_empty() {
            return Err(anyhow!("Chroot already prepared"));
        }
        for (source, target) in self.binds.clone() {
            let inner = self.inner_path(&target);
            let r = std::fs::create_dir_all(&inner)
                .with_context(|| format!("Creating {inner}"))
                .and_then(|_| self.cfg.mounter.mount(source.as_str(), &inner, "", &["bind"]));
            if let Err(e) = r {
                let _ = self.close();
                return Err(e);
            }
            self.active.push(inner);
        }
        Ok(())
    }

    /// Unmount in reverse order. Mounts that fail to unmount are kept so a
    /// later close can retry them.
    pub(crate) fn close(&mut self) -> Result<()> {
        let mut failed = Vec::new();
        let mut first_err = None;
        while let Some(path) = self.active.pop() {
            if let Err(e) = self.cfg.mounter.unmount(&path) {
                tracing::warn!("{e:#}");
                first_err.get_or_insert(e);
                failed.push(path);
            }
        }
        failed.reverse();
        self.active = failed;
        match first_err {
            Some(e) => Err(e.context(format!("Closing chroot {}", self.root))),
            None => Ok(()),
        }
    }

    /// Prepare, run `f` with the root changed, then return to the original
    /// root and close.
    pub(crate) fn run_callback<T>(&mut self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.prepare()?;
        let r = self.enter(f);
        let closed = self.close();
        let v = r?;
        closed?;
        Ok(v)
    }

    fn enter<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let syscall = self.cfg.syscall;
        let old_root = File::open("/").context("Opening /")?;
        syscall.chroot(&self.root)?;
        let r = syscall.chdir(Utf8Path::new("/")).and_then(|_| f());
        // Back to the original root: chdir to it, then chroot to "."
        let restored = syscall
            .fchdir(&old_root)
            .and_then(|_| syscall.chroot(Utf8Path::new(".")));
        let v = r?;
        restored.context("Leaving chroot")?;
        Ok(v)
    }
}
