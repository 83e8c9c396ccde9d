//! Reading the running kernel's command line.
//!
//! Only two questions are ever asked of it: whether a boot marker (a label
//! or an image file name) appears anywhere, and which values were given
//! for a `key=value` argument such as `cos.setup`.

use anyhow::Result;
use fn_error_context::context;

use osdeploy_utils::Runner;

use crate::constants::PROC_CMDLINE;

/// The kernel command line as a single string.
#[derive(Debug, Clone)]
pub(crate) struct Cmdline(String);

impl From<&str> for Cmdline {
    fn from(s: &str) -> Self {
        Self(s.trim().to_owned())
    }
}

impl Cmdline {
    /// Read `/proc/cmdline`. This goes through the runner rather than the
    /// filesystem so it can be faked.
    #[context("Reading kernel command line")]
    pub(crate) fn from_runner(runner: &dyn Runner) -> Result<Self> {
        let s = runner.run_string("cat", &[PROC_CMDLINE])?;
        Ok(Self::from(s.as_str()))
    }

    /// Arguments split on whitespace outside of double quotes, as
    /// `(key, value)` pairs. Surrounding quotes are stripped from values.
    pub(crate) fn args(&self) -> impl Iterator<Item = (&str, Option<&str>)> + '_ {
        let mut in_quotes = false;
        self.0
            .split(move |c: char| {
                if c == '"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|a| !a.is_empty())
            .map(|a| match a.split_once('=') {
                Some((k, v)) => {
                    let v = v.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(v);
                    (k, Some(v))
                }
                None => (a, None),
            })
    }

    /// Every value given for `key`, in order. Dashes and underscores in
    /// keys are interchangeable, as the kernel treats them.
    pub(crate) fn values_of(&self, key: &str) -> Vec<String> {
        let normalize = |s: &str| s.replace('-', "_");
        let key = normalize(key);
        self.args()
            .filter(|(k, _)| normalize(k) == key)
            .filter_map(|(_, v)| v.map(str::to_owned))
            .collect()
    }

    /// Whether `needle` occurs anywhere, arguments and values alike.
    pub(crate) fn contains(&self, needle: &str) -> bool {
        !needle.is_empty() && self.0.contains(needle)
    }
}
