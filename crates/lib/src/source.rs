//! Where image content comes from, and the collaborators that fetch it.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Repository;

/// The origin of an image's content.
///
/// URIs take the forms `dir:<path>`, `file:<path>`, `docker:<ref>` (also
/// `oci:<ref>`) and `channel:<package>`. A bare container reference is
/// read as `docker:`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ImageSource {
    /// Nothing to deploy
    #[default]
    Empty,
    /// A directory tree, copied recursively
    Dir(Utf8PathBuf),
    /// A raw filesystem image, copied byte for byte
    File(Utf8PathBuf),
    /// A container image reference, extracted
    Docker(String),
    /// A package in a repository channel, unpacked
    Channel(String),
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^[a-zA-Z0-9][a-zA-Z0-9._-]*(:[0-9]+)?",
            r"(/[a-z0-9]+([._-]+[a-z0-9]+)*)*",
            r"(:[\w][\w.-]{0,127})?",
            r"(@sha256:[a-f0-9]{64})?$"
        ))
        .unwrap()
    })
}

impl ImageSource {
    /// Whether there is nothing to deploy.
    pub fn is_empty(&self) -> bool {
        matches!(self, ImageSource::Empty)
    }

    /// The path of a filesystem source.
    pub fn path(&self) -> Option<&Utf8Path> {
        match self {
            ImageSource::Dir(p) | ImageSource::File(p) => Some(p),
            _ => None,
        }
    }
}

impl FromStr for ImageSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(ImageSource::Empty);
        }
        let Some((scheme, value)) = s.split_once(':').filter(|(scheme, _)| {
            matches!(*scheme, "dir" | "file" | "docker" | "oci" | "channel")
        }) else {
            if reference_regex().is_match(s) {
                return Ok(ImageSource::Docker(s.to_owned()));
            }
            return Err(anyhow!("Invalid image source: {s}"));
        };
        // Accept both scheme:/path and scheme:///path
        let value = value.strip_prefix("//").unwrap_or(value);
        if value.is_empty() {
            return Err(anyhow!("Empty value in image source: {s}"));
        }
        let src = match scheme {
            "dir" => ImageSource::Dir(value.into()),
            "file" => ImageSource::File(value.into()),
            "channel" => ImageSource::Channel(value.to_owned()),
            _ => {
                if !reference_regex().is_match(value) {
                    return Err(anyhow!("Invalid image reference: {value}"));
                }
                ImageSource::Docker(value.to_owned())
            }
        };
        Ok(src)
    }
}

impl Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Empty => Ok(()),
            ImageSource::Dir(p) => write!(f, "dir:{p}"),
            ImageSource::File(p) => write!(f, "file:{p}"),
            ImageSource::Docker(r) => write!(f, "docker:{r}"),
            ImageSource::Channel(c) => write!(f, "channel:{c}"),
        }
    }
}

impl From<ImageSource> for String {
    fn from(src: ImageSource) -> Self {
        src.to_string()
    }
}

impl TryFrom<String> for ImageSource {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Fetches a container image and writes its root filesystem to a directory.
pub trait ImageExtractor: Debug {
    /// Extract `reference` for `platform` (e.g. `linux/amd64`) into
    /// `destination`. With `local`, the image is taken from local container
    /// storage instead of a registry.
    fn extract_image(
        &self,
        reference: &str,
        destination: &Utf8Path,
        platform: &str,
        local: bool,
    ) -> Result<()>;
}

/// Checks a container image signature.
pub trait Verifier: Debug {
    /// Returns whether `reference` carries a valid signature. Keyless
    /// verification is used when no public key is given.
    fn verify(&self, reference: &str, public_key: Option<&Utf8Path>) -> Result<bool>;
}

/// Installs packages from repository channels.
pub trait PackageInstaller: Debug {
    /// Make `repositories` the set packages are resolved from.
    fn sync_repositories(&self, repositories: &[Repository]) -> Result<()>;

    /// Unpack `package` and its dependencies into `destination`.
    fn unpack(&self, destination: &Utf8Path, package: &str) -> Result<()>;
}
