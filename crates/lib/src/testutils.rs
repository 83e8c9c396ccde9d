//! Fake host collaborators recording what the engine asks of them.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::fs::File;

use anyhow::{anyhow, bail, Result};
use camino::{Utf8Path, Utf8PathBuf};

use osdeploy_mount::{MountPoint, Mounter};
use osdeploy_utils::Runner;

use crate::chroot::Syscall;
use crate::config::{Config, Interrupt, Repository, RunConfig};
use crate::hooks::HookRunner;
use crate::source::{ImageExtractor, PackageInstaller, Verifier};
use crate::spec::{Image, PartitionMap};

type SideEffect = Box<dyn Fn(&str, &[&str]) -> Option<Result<Vec<u8>>>>;

/// Records every command line, space joined. `cat /proc/cmdline` answers with the
/// configured kernel command line; anything else succeeds with no output
/// unless the side effect says otherwise.
#[derive(Default)]
pub(crate) struct FakeRunner {
    calls: RefCell<Vec<String>>,
    cmdline: RefCell<String>,
    side_effect: Option<SideEffect>,
}

impl fmt::Debug for FakeRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeRunner")
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_cmdline(self, cmdline: &str) -> Self {
        self.set_cmdline(cmdline);
        self
    }

    /// `f` may answer a command by returning `Some`.
    pub(crate) fn with_side_effect(
        mut self,
        f: impl Fn(&str, &[&str]) -> Option<Result<Vec<u8>>> + 'static,
    ) -> Self {
        self.side_effect = Some(Box::new(f));
        self
    }

    pub(crate) fn set_cmdline(&self, cmdline: &str) {
        *self.cmdline.borrow_mut() = cmdline.to_owned();
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Calls starting with `prefix`.
    pub(crate) fn matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub(crate) fn called(&self, prefix: &str) -> bool {
        !self.matching(prefix).is_empty()
    }

    pub(crate) fn clear(&self) {
        self.calls.borrow_mut().clear();
    }
}

impl Runner for FakeRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        let line = std::iter::once(cmd).chain(args.iter().copied()).collect::<Vec<_>>().join(" ");
        self.calls.borrow_mut().push(line);
        if let Some(r) = self.side_effect.as_ref().and_then(|f| f(cmd, args)) {
            return r;
        }
        if cmd == "cat" && args == ["/proc/cmdline"] {
            return Ok(self.cmdline.borrow().clone().into_bytes());
        }
        Ok(Vec::new())
    }

    fn command_exists(&self, _cmd: &str) -> bool {
        true
    }
}

/// An in-memory mount table.
#[derive(Debug, Default)]
pub(crate) struct FakeMounter {
    mounts: RefCell<Vec<MountPoint>>,
    log: RefCell<Vec<String>>,
    pub(crate) fail_mount: Cell<bool>,
    pub(crate) fail_unmount: Cell<bool>,
}

impl FakeMounter {
    /// `mount <device> <target>` and `umount <target>` entries, in order.
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub(crate) fn mounted(&self) -> Vec<Utf8PathBuf> {
        self.mounts.borrow().iter().map(|m| m.path.clone()).collect()
    }

    /// Pretend `device` is already mounted at `target`.
    pub(crate) fn add(&self, device: &str, target: &Utf8Path, options: &[&str]) {
        self.mounts.borrow_mut().push(MountPoint {
            device: device.to_owned(),
            path: target.to_owned(),
            fstype: String::new(),
            options: options.iter().map(|o| o.to_string()).collect(),
        });
    }

    pub(crate) fn options_of(&self, target: &Utf8Path) -> Option<Vec<String>> {
        self.mounts
            .borrow()
            .iter()
            .find(|m| m.path == target)
            .map(|m| m.options.clone())
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, device: &str, target: &Utf8Path, fstype: &str, options: &[&str]) -> Result<()> {
        if self.fail_mount.get() {
            bail!("mount {device} {target}: fake failure");
        }
        if options.contains(&"remount") {
            let mut mounts = self.mounts.borrow_mut();
            let m = mounts
                .iter_mut()
                .find(|m| m.path == target)
                .ok_or_else(|| anyhow!("{target} is not mounted"))?;
            m.options = options.iter().filter(|o| **o != "remount").map(|o| o.to_string()).collect();
            self.log.borrow_mut().push(format!("remount {target} {}", m.options.join(",")));
            return Ok(());
        }
        self.log.borrow_mut().push(format!("mount {device} {target}"));
        self.mounts.borrow_mut().push(MountPoint {
            device: device.to_owned(),
            path: target.to_owned(),
            fstype: fstype.to_owned(),
            options: options.iter().map(|o| o.to_string()).collect(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        if self.fail_unmount.get() {
            bail!("umount {target}: fake failure");
        }
        let mut mounts = self.mounts.borrow_mut();
        let idx = mounts
            .iter()
            .rposition(|m| m.path == target)
            .ok_or_else(|| anyhow!("umount: {target}: not mounted"))?;
        mounts.remove(idx);
        self.log.borrow_mut().push(format!("umount {target}"));
        Ok(())
    }

    fn list(&self) -> Result<Vec<MountPoint>> {
        Ok(self.mounts.borrow().clone())
    }
}

/// Records hook stages along with the paths they were given.
#[derive(Debug, Default)]
pub(crate) struct FakeHookRunner {
    runs: RefCell<Vec<(String, Vec<String>)>>,
    dot_notation: RefCell<Vec<String>>,
    pub(crate) fail: Cell<bool>,
}

impl FakeHookRunner {
    /// Stage names run over paths, in order.
    pub(crate) fn stages(&self) -> Vec<String> {
        self.runs.borrow().iter().map(|(s, _)| s.clone()).collect()
    }

    pub(crate) fn runs(&self) -> Vec<(String, Vec<String>)> {
        self.runs.borrow().clone()
    }

    pub(crate) fn dot_notation_stages(&self) -> Vec<String> {
        self.dot_notation.borrow().clone()
    }
}

impl HookRunner for FakeHookRunner {
    fn run_stage(&self, stage: &str, paths: &[&str]) -> Result<()> {
        let paths = paths.iter().map(|p| p.to_string()).collect();
        self.runs.borrow_mut().push((stage.to_owned(), paths));
        if self.fail.get() {
            bail!("{stage} failed");
        }
        Ok(())
    }

    fn run_dot_notation_stage(&self, stage: &str, _file: &str) -> Result<()> {
        self.dot_notation.borrow_mut().push(stage.to_owned());
        if self.fail.get() {
            bail!("{stage} failed");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeSyscall {
    chroots: RefCell<Vec<String>>,
    pub(crate) fail_chroot: Cell<bool>,
}

impl FakeSyscall {
    pub(crate) fn chroots(&self) -> Vec<String> {
        self.chroots.borrow().clone()
    }
}

impl Syscall for FakeSyscall {
    fn chroot(&self, path: &Utf8Path) -> Result<()> {
        if self.fail_chroot.get() {
            bail!("chroot {path}: fake failure");
        }
        self.chroots.borrow_mut().push(path.to_string());
        Ok(())
    }

    fn chdir(&self, _path: &Utf8Path) -> Result<()> {
        Ok(())
    }

    fn fchdir(&self, _dir: &File) -> Result<()> {
        Ok(())
    }
}

/// Writes a marker file instead of pulling an image.
#[derive(Debug, Default)]
pub(crate) struct FakeExtractor {
    calls: RefCell<Vec<String>>,
    pub(crate) fail: Cell<bool>,
}

impl FakeExtractor {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl ImageExtractor for FakeExtractor {
    fn extract_image(&self, reference: &str, destination: &Utf8Path, platform: &str, local: bool) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("{reference} {destination} {platform} {local}"));
        if self.fail.get() {
            bail!("pulling {reference}: fake failure");
        }
        std::fs::write(destination.join("extracted"), reference)?;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeVerifier {
    pub(crate) verified: Cell<bool>,
    calls: RefCell<Vec<String>>,
}

impl Default for FakeVerifier {
    fn default() -> Self {
        Self {
            verified: Cell::new(true),
            calls: RefCell::default(),
        }
    }
}

impl FakeVerifier {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Verifier for FakeVerifier {
    fn verify(&self, reference: &str, _public_key: Option<&Utf8Path>) -> Result<bool> {
        self.calls.borrow_mut().push(reference.to_owned());
        Ok(self.verified.get())
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakePackages {
    calls: RefCell<Vec<String>>,
}

impl FakePackages {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl PackageInstaller for FakePackages {
    fn sync_repositories(&self, repositories: &[Repository]) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("sync {}", repositories.len()));
        Ok(())
    }

    fn unpack(&self, destination: &Utf8Path, package: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("unpack {package} {destination}"));
        Ok(())
    }
}

/// One of every fake, plus a run configuration that finds no cloud-init
/// paths on the host.
#[derive(Debug)]
pub(crate) struct Fakes {
    pub(crate) run: RunConfig,
    pub(crate) runner: FakeRunner,
    pub(crate) mounter: FakeMounter,
    pub(crate) hooks: FakeHookRunner,
    pub(crate) syscall: FakeSyscall,
    pub(crate) extractor: FakeExtractor,
    pub(crate) verifier: FakeVerifier,
    pub(crate) packages: FakePackages,
}

impl Fakes {
    pub(crate) fn new() -> Self {
        Self::with_runner(FakeRunner::new())
    }

    pub(crate) fn with_runner(runner: FakeRunner) -> Self {
        let run = RunConfig {
            arch: "x86_64".into(),
            cloud_init_paths: Vec::new(),
            ..Default::default()
        };
        Self {
            run,
            runner,
            mounter: FakeMounter::default(),
            hooks: FakeHookRunner::default(),
            syscall: FakeSyscall::default(),
            extractor: FakeExtractor::default(),
            verifier: FakeVerifier::default(),
            packages: FakePackages::default(),
        }
    }

    pub(crate) fn config(&self) -> Config<'_> {
        Config {
            run: &self.run,
            runner: &self.runner,
            mounter: &self.mounter,
            hooks: &self.hooks,
            syscall: &self.syscall,
            extractor: &self.extractor,
            verifier: &self.verifier,
            packages: &self.packages,
            interrupt: Interrupt::default(),
        }
    }
}

/// `path` relocated under `root`, for plans built with absolute host paths.
pub(crate) fn reroot(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

/// Relocate every mount point in `parts` under `root`.
pub(crate) fn reroot_partitions(parts: &mut PartitionMap, root: &Utf8Path) {
    for p in parts.iter_mut() {
        p.mount_point = p.mount_point.as_deref().map(|m| reroot(root, m));
    }
}

/// Relocate the file and mount point of `img` under `root`.
pub(crate) fn reroot_image(img: &mut Image, root: &Utf8Path) {
    img.file = reroot(root, &img.file);
    img.mount_point = img.mount_point.as_deref().map(|m| reroot(root, m));
}

/// A temporary directory as a UTF-8 path.
pub(crate) fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let td = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(td.path()).unwrap().to_owned();
    (td, path)
}
