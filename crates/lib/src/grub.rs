//! Installing and configuring the GRUB bootloader.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config::Config;
use crate::constants::{
    DEFAULT_TTY, EFI_BOOT_ENTRY, EFI_VENDOR_DIR, GRUB_DEFAULT_ENTRY_KEY, GRUB_ENTRY_NAME_KEY,
    GRUB_OEM_ENV, SHIM_FILES,
};
use crate::error::DeployError;

/// Where and how to install the bootloader.
#[derive(Debug)]
pub(crate) struct GrubInstall<'a> {
    /// The disk (or loop device) to install to
    pub(crate) target: &'a str,
    /// The deployed root filesystem
    pub(crate) root: &'a Utf8Path,
    /// Holds the `grub2` (or `grub`) directory, the state partition
    pub(crate) boot_dir: &'a Utf8Path,
    /// Configuration template, relative to `root`
    pub(crate) grub_conf: &'a Utf8Path,
    /// Extra console; detected from the controlling terminal when unset
    pub(crate) tty: Option<&'a str>,
    /// Mount point of the EFI system partition, for EFI installs
    pub(crate) efi_dir: Option<&'a Utf8Path>,
    /// Label the EFI stub config searches for
    pub(crate) state_label: &'a str,
}

#[derive(Debug)]
pub(crate) struct Grub<'a> {
    cfg: &'a Config<'a>,
    dev_dir: Utf8PathBuf,
}

impl<'a> Grub<'a> {
    pub(crate) fn new(cfg: &'a Config<'a>) -> Self {
        Self {
            cfg,
            dev_dir: "/dev".into(),
        }
    }

    #[cfg(test)]
    fn with_dev_dir(mut self, dev_dir: &Utf8Path) -> Self {
        self.dev_dir = dev_dir.to_owned();
        self
    }

    /// Install the bootloader and copy the grub configuration of the
    /// deployed root into the boot directory.
    #[context("Installing grub to {}", opts.target)]
    pub(crate) fn install(&self, opts: &GrubInstall) -> Result<()> {
        if opts.efi_dir.is_none() {
            tracing::info!("Installing GRUB");
            let root_arg = format!("--root-directory={}", opts.root);
            let boot_arg = format!("--boot-directory={}", opts.boot_dir);
            let mut args = vec![root_arg.as_str(), boot_arg.as_str(), "--target=i386-pc"];
            if opts.target.starts_with("/dev/loop") {
                args.push("--force");
            }
            args.push(opts.target);
            self.cfg.runner.run("grub2-install", &args)?;
            tracing::info!("Grub install to device {} complete", opts.target);
        }

        let grub_dir = ["grub2", "grub"]
            .iter()
            .map(|d| opts.boot_dir.join(d))
            .find(|d| d.is_dir())
            .unwrap_or_else(|| opts.boot_dir.join("grub2"));
        tracing::debug!("Using grub config dir {grub_dir}");
        std::fs::create_dir_all(&grub_dir).with_context(|| format!("Creating {grub_dir}"))?;

        let template = opts
            .root
            .join(opts.grub_conf.strip_prefix("/").unwrap_or(opts.grub_conf));
        let contents =
            std::fs::read_to_string(&template).with_context(|| format!("Reading {template}"))?;
        let contents = match self.extra_tty(opts.tty) {
            Some(tty) => {
                tracing::info!("Adding extra tty ({tty}) to grub.cfg");
                add_console(&contents, &tty)
            }
            None => contents,
        };
        let dest = grub_dir.join("grub.cfg");
        std::fs::write(&dest, contents).with_context(|| format!("Writing {dest}"))?;

        if let Some(efi_dir) = opts.efi_dir {
            self.install_efi(opts, efi_dir)?;
        }
        Ok(())
    }

    /// The tty to add a console for, if any. The default tty and the plain
    /// console are already covered by the template.
    fn extra_tty(&self, tty: Option<&str>) -> Option<String> {
        let tty = match tty {
            Some(t) => t.to_owned(),
            None => match self.cfg.runner.run_string("tty", &[]) {
                Ok(out) => out.trim().trim_start_matches("/dev/").to_owned(),
                Err(e) => {
                    tracing::warn!("Failed to find current tty, leaving it unset: {e:#}");
                    return None;
                }
            },
        };
        if tty.is_empty() || tty == "console" || tty == DEFAULT_TTY {
            return None;
        }
        if !self.dev_dir.join(&tty).exists() {
            tracing::debug!("No such tty {tty}");
            return None;
        }
        Some(tty)
    }

    fn install_efi(&self, opts: &GrubInstall, efi_dir: &Utf8Path) -> Result<()> {
        let shim_dir = opts
            .root
            .join("usr/share/efi")
            .join(&self.cfg.run.arch);
        if !SHIM_FILES.iter().all(|f| shim_dir.join(f).is_file()) {
            return Err(DeployError::MissingShimFiles(shim_dir).into());
        }
        tracing::info!("Generating grub files for efi");
        let vendor_dir = efi_dir.join(EFI_VENDOR_DIR);
        std::fs::create_dir_all(&vendor_dir).with_context(|| format!("Creating {vendor_dir}"))?;
        for f in SHIM_FILES {
            let (src, dest) = (shim_dir.join(f), vendor_dir.join(f));
            tracing::debug!("Copying {src} to {dest}");
            std::fs::copy(&src, &dest).with_context(|| format!("Copying {src}"))?;
        }

        // Chainloads the grub.cfg on the partition carrying the state label
        let stub = format!(
            "search --no-floppy --label --set=root {}\nset prefix=($root)/grub2\nconfigfile ($root)/grub2/grub.cfg\n",
            opts.state_label
        );
        let stub_path = vendor_dir.join("grub.cfg");
        std::fs::write(&stub_path, stub).with_context(|| format!("Writing {stub_path}"))?;

        let loader = format!("\\{}\\{}", EFI_VENDOR_DIR.replace('/', "\\"), SHIM_FILES[0]);
        self.cfg.runner.run(
            "efibootmgr",
            &["-c", "-d", opts.target, "-p", "1", "-w", "-L", EFI_BOOT_ENTRY, "-l", &loader],
        )?;
        Ok(())
    }

    /// Set each variable in the grub environment block `env_file`.
    pub(crate) fn set_persistent_variables(
        &self,
        env_file: &Utf8Path,
        vars: &BTreeMap<&str, &str>,
    ) -> Result<()> {
        for (key, value) in vars {
            let var = format!("{key}={value}");
            tracing::debug!("Setting grub variable {var} in {env_file}");
            self.cfg
                .runner
                .run("grub2-editenv", &[env_file.as_str(), "set", &var])
                .context("Failed setting grub variables")?;
        }
        Ok(())
    }

    /// Persist `entry` as the default boot menu entry in the grub
    /// environment block of `state_dir`. Without an entry this does nothing.
    #[context("Setting default grub entry")]
    pub(crate) fn set_default_entry(&self, state_dir: &Utf8Path, entry: Option<&str>) -> Result<()> {
        let Some(entry) = entry else {
            tracing::info!("No default grub entry to set");
            return Ok(());
        };
        tracing::info!("Setting default grub entry to {entry}");
        let vars = BTreeMap::from([(GRUB_DEFAULT_ENTRY_KEY, entry)]);
        self.set_persistent_variables(&state_dir.join(GRUB_OEM_ENV), &vars)
    }
}

/// The default menu entry for the tree at `root`: `entry` when given, else
/// `GRUB_ENTRY_NAME` from its os-release.
pub(crate) fn default_entry(root: &Utf8Path, entry: Option<&str>) -> Result<Option<String>> {
    if let Some(e) = entry {
        return Ok(Some(e.to_owned()));
    }
    Ok(load_env_file(&root.join("etc/os-release"))?.remove(GRUB_ENTRY_NAME_KEY))
}

/// Add `console=<tty>` after every `console=<default tty>` argument.
fn add_console(contents: &str, tty: &str) -> String {
    let default = format!("console={DEFAULT_TTY}");
    contents.replace(&default, &format!("{default} console={tty}"))
}

/// Parse a shell style `KEY=value` file such as os-release. A missing file
/// is empty.
pub(crate) fn load_env_file(path: &Utf8Path) -> Result<BTreeMap<String, String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    let mut r = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            tracing::debug!("Ignoring {line} in {path}");
            continue;
        };
        let v = shlex::split(v)
            .map(|words| words.join(" "))
            .unwrap_or_else(|| v.to_owned());
        r.insert(k.trim().to_owned(), v);
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{tempdir, Fakes};
    use indoc::indoc;

    const TEMPLATE: &str = "linux /boot/vmlinuz console=tty1 root=LABEL=COS_STATE\n";

    fn deployed_root(root: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(root.join("etc/cos"))?;
        std::fs::write(root.join("etc/cos/grub.cfg"), TEMPLATE)?;
        Ok(())
    }

    #[test]
    fn test_load_env_file() -> Result<()> {
        let (_td, dir) = tempdir();
        let p = dir.join("os-release");
        std::fs::write(
            &p,
            indoc! {r#"
                # comment
                NAME="cOS"
                ID=cos
                GRUB_ENTRY_NAME='My OS'
                broken
            "#},
        )?;
        let env = load_env_file(&p)?;
        assert_eq!(env.len(), 3);
        assert_eq!(env["NAME"], "cOS");
        assert_eq!(env["GRUB_ENTRY_NAME"], "My OS");
        assert!(load_env_file(&dir.join("missing"))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_add_console() {
        assert_eq!(
            add_console(TEMPLATE, "ttyS0"),
            "linux /boot/vmlinuz console=tty1 console=ttyS0 root=LABEL=COS_STATE\n"
        );
    }

    #[test]
    fn test_install_bios() -> Result<()> {
        let (_td, dir) = tempdir();
        let (root, state, dev) = (dir.join("root"), dir.join("state"), dir.join("dev"));
        deployed_root(&root)?;
        std::fs::create_dir_all(state.join("grub"))?;
        std::fs::create_dir_all(&dev)?;
        std::fs::write(dev.join("ttyS0"), "")?;
        let fakes = Fakes::new();
        let cfg = fakes.config();
        let grub = Grub::new(&cfg).with_dev_dir(&dev);
        grub.install(&GrubInstall {
            target: "/dev/loop0",
            root: &root,
            boot_dir: &state,
            grub_conf: Utf8Path::new("/etc/cos/grub.cfg"),
            tty: Some("ttyS0"),
            efi_dir: None,
            state_label: "COS_STATE",
        })?;
        assert_eq!(
            fakes.runner.calls(),
            [format!(
                "grub2-install --root-directory={root} --boot-directory={state} --target=i386-pc --force /dev/loop0"
            )]
        );
        // The existing grub dir is picked up
        let written = std::fs::read_to_string(state.join("grub/grub.cfg"))?;
        assert!(written.contains("console=tty1 console=ttyS0"));
        assert!(!state.join("grub2").exists());
        Ok(())
    }

    #[test]
    fn test_install_efi() -> Result<()> {
        let (_td, dir) = tempdir();
        let (root, state, efi) = (dir.join("root"), dir.join("state"), dir.join("efi"));
        deployed_root(&root)?;
        let shims = root.join("usr/share/efi/x86_64");
        std::fs::create_dir_all(&shims)?;
        for f in SHIM_FILES {
            std::fs::write(shims.join(f), f)?;
        }
        let fakes = Fakes::new();
        let cfg = fakes.config();
        let grub = Grub::new(&cfg).with_dev_dir(&dir.join("nodev"));
        grub.install(&GrubInstall {
            target: "/dev/sda",
            root: &root,
            boot_dir: &state,
            grub_conf: Utf8Path::new("/etc/cos/grub.cfg"),
            tty: Some("ttyS0"),
            efi_dir: Some(&efi),
            state_label: "COS_STATE",
        })?;
        assert_eq!(
            fakes.runner.calls(),
            ["efibootmgr -c -d /dev/sda -p 1 -w -L elemental -l \\EFI\\elemental\\shim.efi"]
        );
        // No such tty, template copied untouched
        assert_eq!(std::fs::read_to_string(state.join("grub2/grub.cfg"))?, TEMPLATE);
        assert_eq!(std::fs::read_to_string(efi.join("EFI/elemental/grub.efi"))?, "grub.efi");
        let stub = std::fs::read_to_string(efi.join("EFI/elemental/grub.cfg"))?;
        assert!(stub.starts_with("search --no-floppy --label --set=root COS_STATE\n"));
        Ok(())
    }

    #[test]
    fn test_install_efi_missing_shim() -> Result<()> {
        let (_td, dir) = tempdir();
        let root = dir.join("root");
        deployed_root(&root)?;
        let fakes = Fakes::new();
        let cfg = fakes.config();
        let err = Grub::new(&cfg)
            .install(&GrubInstall {
                target: "/dev/sda",
                root: &root,
                boot_dir: &dir.join("state"),
                grub_conf: Utf8Path::new("/etc/cos/grub.cfg"),
                tty: Some("tty1"),
                efi_dir: Some(&dir.join("efi")),
                state_label: "COS_STATE",
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::MissingShimFiles(_))
        ));
        assert!(fakes.runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_detect_tty() -> Result<()> {
        let (_td, dir) = tempdir();
        std::fs::write(dir.join("ttyS1"), "")?;
        let runner = crate::testutils::FakeRunner::new().with_side_effect(|cmd, _| {
            (cmd == "tty").then(|| Ok(b"/dev/ttyS1\n".to_vec()))
        });
        let fakes = Fakes::with_runner(runner);
        let cfg = fakes.config();
        let grub = Grub::new(&cfg).with_dev_dir(&dir);
        assert_eq!(grub.extra_tty(None).as_deref(), Some("ttyS1"));
        assert_eq!(grub.extra_tty(Some("tty1")), None);
        assert_eq!(grub.extra_tty(Some("console")), None);
        Ok(())
    }

    #[test]
    fn test_set_default_entry() -> Result<()> {
        let (_td, dir) = tempdir();
        let (root, state) = (dir.join("root"), dir.join("state"));
        let fakes = Fakes::new();
        let cfg = fakes.config();
        let grub = Grub::new(&cfg);

        // Nothing to set
        assert_eq!(default_entry(&root, None)?, None);
        grub.set_default_entry(&state, None)?;
        assert!(fakes.runner.calls().is_empty());

        std::fs::create_dir_all(root.join("etc"))?;
        std::fs::write(root.join("etc/os-release"), "GRUB_ENTRY_NAME=\"Fancy OS\"\n")?;
        let entry = default_entry(&root, None)?;
        assert_eq!(entry.as_deref(), Some("Fancy OS"));
        assert_eq!(default_entry(&root, Some("Explicit"))?.as_deref(), Some("Explicit"));
        grub.set_default_entry(&state, entry.as_deref())?;
        assert_eq!(
            fakes.runner.calls(),
            [format!("grub2-editenv {state}/grub_oem_env set default_menu_entry=Fancy OS")]
        );
        Ok(())
    }
}
