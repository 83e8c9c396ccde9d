//! Container image extraction with skopeo and umoci.

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use osdeploy_utils::Runner;

use crate::source::ImageExtractor;

/// Copies an image into a scratch OCI layout with `skopeo`, unpacks its
/// root filesystem with `umoci`, then syncs that into the destination.
#[derive(Debug)]
pub struct SkopeoExtractor<'a> {
    runner: &'a dyn Runner,
}

impl<'a> SkopeoExtractor<'a> {
    /// Extract through `runner`.
    pub fn new(runner: &'a dyn Runner) -> Self {
        Self { runner }
    }
}

impl ImageExtractor for SkopeoExtractor<'_> {
    #[context("Extracting {reference}")]
    fn extract_image(
        &self,
        reference: &str,
        destination: &Utf8Path,
        platform: &str,
        local: bool,
    ) -> Result<()> {
        let work = tempfile::Builder::new()
            .prefix("osdeploy-oci-")
            .tempdir()
            .context("Creating scratch directory")?;
        let work = Utf8Path::from_path(work.path())
            .ok_or_else(|| anyhow!("Non UTF-8 scratch directory {:?}", work.path()))?
            .to_owned();
        let layout = format!("{}:latest", work.join("layout"));
        let rootfs = work.join("rootfs");

        let (os, arch) = platform.split_once('/').unwrap_or(("linux", platform));
        let src = if local {
            format!("containers-storage:{reference}")
        } else {
            format!("docker://{reference}")
        };
        let dest = format!("oci:{layout}");
        tracing::info!("Pulling {src} for {platform}");
        self.runner.run(
            "skopeo",
            &["copy", "--override-os", os, "--override-arch", arch, &src, &dest],
        )?;
        self.runner
            .run("umoci", &["raw", "unpack", "--image", &layout, rootfs.as_str()])?;
        self.runner.run(
            "rsync",
            &["-aqAX", &format!("{rootfs}/"), &format!("{destination}/")],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeRunner;

    #[test]
    fn test_extract() -> Result<()> {
        let runner = FakeRunner::new();
        let extractor = SkopeoExtractor::new(&runner);
        extractor.extract_image("quay.io/cos/system:v1", Utf8Path::new("/run/cos/active"), "linux/arm64", false)?;
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with(
            "skopeo copy --override-os linux --override-arch arm64 docker://quay.io/cos/system:v1 oci:"
        ));
        assert!(calls[1].starts_with("umoci raw unpack --image "));
        assert!(calls[2].ends_with("/rootfs/ /run/cos/active/"));

        runner.clear();
        extractor.extract_image("localhost/system", Utf8Path::new("/mnt"), "linux/amd64", true)?;
        assert!(runner.calls()[0].contains(" containers-storage:localhost/system "));
        Ok(())
    }
}
