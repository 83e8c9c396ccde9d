//! Channel sources, installed with luet.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Serialize;

use osdeploy_utils::Runner;

use crate::config::Repository;
use crate::error::DeployError;
use crate::source::PackageInstaller;

#[derive(Debug, Serialize)]
struct LuetConfig<'a> {
    repositories: Vec<LuetRepository<'a>>,
}

#[derive(Debug, Serialize)]
struct LuetRepository<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    urls: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
    enable: bool,
}

/// Drives the `luet` CLI with a generated configuration file.
#[derive(Debug)]
pub struct LuetInstaller<'a> {
    runner: &'a dyn Runner,
    config_path: Utf8PathBuf,
}

impl<'a> LuetInstaller<'a> {
    /// Install through `runner`, with luet configuration written to `config_path`.
    pub fn new(runner: &'a dyn Runner, config_path: &Utf8Path) -> Self {
        Self {
            runner,
            config_path: config_path.to_owned(),
        }
    }
}

fn render_config(repositories: &[Repository]) -> Result<String> {
    let config = LuetConfig {
        repositories: repositories
            .iter()
            .map(|r| LuetRepository {
                name: &r.name,
                kind: &r.kind,
                urls: [&r.uri],
                priority: r.priority,
                enable: true,
            })
            .collect(),
    };
    Ok(serde_yaml::to_string(&config)?)
}

impl PackageInstaller for LuetInstaller<'_> {
    #[context("Syncing package repositories")]
    fn sync_repositories(&self, repositories: &[Repository]) -> Result<()> {
        if repositories.is_empty() {
            return Err(DeployError::NotFound("package repositories".into()).into());
        }
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, render_config(repositories)?)
            .with_context(|| format!("Writing {}", self.config_path))?;
        self.runner
            .run("luet", &["--config", self.config_path.as_str(), "repo", "update"])?;
        Ok(())
    }

    #[context("Installing {package}")]
    fn unpack(&self, destination: &Utf8Path, package: &str) -> Result<()> {
        self.runner.run(
            "luet",
            &[
                "--config",
                self.config_path.as_str(),
                "install",
                "-y",
                "--system-target",
                destination.as_str(),
                package,
            ],
        )?;
        Ok(())
    }
}
