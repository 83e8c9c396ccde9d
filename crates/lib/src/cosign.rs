//! Image signature verification with cosign.

use anyhow::Result;
use camino::Utf8Path;

use osdeploy_utils::{CommandError, Runner};

use crate::source::Verifier;

/// Runs `cosign verify`, keyless unless a public key is given.
#[derive(Debug)]
pub struct CosignVerifier<'a> {
    runner: &'a dyn Runner,
}

impl<'a> CosignVerifier<'a> {
    /// Verify through `runner`.
    pub fn new(runner: &'a dyn Runner) -> Self {
        Self { runner }
    }
}

impl Verifier for CosignVerifier<'_> {
    fn verify(&self, reference: &str, public_key: Option<&Utf8Path>) -> Result<bool> {
        let mut args = vec!["verify"];
        match public_key {
            Some(key) => args.extend(["--key", key.as_str()]),
            None => args.extend([
                "--certificate-identity-regexp",
                ".*",
                "--certificate-oidc-issuer-regexp",
                ".*",
            ]),
        }
        args.push(reference);
        tracing::info!("Verifying signature of {reference}");
        match self.runner.run("cosign", &args) {
            Ok(_) => Ok(true),
            // cosign ran and rejected the signature
            Err(e) if e.downcast_ref::<CommandError>().is_some() => {
                tracing::warn!("{e:#}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
