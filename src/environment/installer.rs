use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info};

use super::manifest::Manifest;
use super::EnvironmentError;
use crate::config::InstallConfig;

/// Installs a manifest's packages into a sandbox directory.
///
/// The directory already holds the `package.json` written from the manifest
/// when `install()` is called.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, directory: &Path, manifest: &Manifest) -> Result<(), EnvironmentError>;
}

/// Shells out to a package manager (`npm install` by default).
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
}

impl CommandInstaller {
    pub fn new(config: &InstallConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(&self, directory: &Path, manifest: &Manifest) -> Result<(), EnvironmentError> {
        let command = self.command_line();
        info!(
            "Installing {} package(s) in {} ({command})",
            manifest.len(),
            directory.display()
        );

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(directory)
            // Telemetry and interactive noise off
            .env("DO_NOT_TRACK", "1")
            .env("NPM_CONFIG_UPDATE_NOTIFIER", "false")
            .env("NPM_CONFIG_FUND", "false")
            .env("NPM_CONFIG_AUDIT", "false")
            .env("DISABLE_OPENCOLLECTIVE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EnvironmentError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(EnvironmentError::Install {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!(
            "Install finished: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }
}
