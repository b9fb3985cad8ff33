//! Installing restic through the host's package manager.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

use super::PackageManager;
use crate::utils::errors::ReconciliationError;
use crate::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Apt,
    Dnf,
    Yum,
    Zypper,
    Pacman,
    Apk,
    /// restic is provisioned out of band
    None,
}

impl PackageKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "apt" => Some(PackageKind::Apt),
            "dnf" => Some(PackageKind::Dnf),
            "yum" => Some(PackageKind::Yum),
            "zypper" => Some(PackageKind::Zypper),
            "pacman" => Some(PackageKind::Pacman),
            "apk" => Some(PackageKind::Apk),
            "none" => Some(PackageKind::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Apt => "apt",
            PackageKind::Dnf => "dnf",
            PackageKind::Yum => "yum",
            PackageKind::Zypper => "zypper",
            PackageKind::Pacman => "pacman",
            PackageKind::Apk => "apk",
            PackageKind::None => "none",
        }
    }

    /// Non-interactive install command for the restic package.
    pub fn install_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            PackageKind::Apt => Some(("apt-get", &["install", "-y", "restic"])),
            PackageKind::Dnf => Some(("dnf", &["install", "-y", "restic"])),
            PackageKind::Yum => Some(("yum", &["install", "-y", "restic"])),
            PackageKind::Zypper => Some(("zypper", &["--non-interactive", "install", "restic"])),
            PackageKind::Pacman => Some(("pacman", &["-S", "--noconfirm", "--needed", "restic"])),
            PackageKind::Apk => Some(("apk", &["add", "--no-cache", "restic"])),
            PackageKind::None => None,
        }
    }
}

pub struct SystemPackages {
    kind: PackageKind,
    binary: PathBuf,
}

impl SystemPackages {
    pub fn new(kind: PackageKind, binary: PathBuf) -> Self {
        Self { kind, binary }
    }
}

#[async_trait]
impl PackageManager for SystemPackages {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    async fn installed_version(&self) -> std::result::Result<Option<String>, ReconciliationError> {
        let output = match Command::new(&self.binary).arg("version").output().await {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ReconciliationError::ToolVersion(format!(
                    "{}: {}",
                    self.binary.display(),
                    e
                )))
            }
        };

        if !output.status.success() {
            return Err(ReconciliationError::ToolVersion(format!(
                "{} version exited with {}",
                self.binary.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout).map(Some).ok_or_else(|| {
            ReconciliationError::ToolVersion(format!("unrecognised output: {}", stdout.trim()))
        })
    }

    async fn install(&self) -> Result<()> {
        let Some((program, args)) = self.kind.install_command() else {
            return Err(AgentError::Platform(
                "restic is not installed and no package manager is configured".to_string(),
            ));
        };

        info!(package_manager = %self.kind.as_str(), "Installing restic");

        if self.kind == PackageKind::Apt {
            let update = Command::new("apt-get")
                .arg("update")
                .env("DEBIAN_FRONTEND", "noninteractive")
                .output()
                .await?;
            if !update.status.success() {
                warn!(status = %update.status, "apt-get update failed, installing from the existing index");
            }
        }

        let output = Command::new(program)
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .output()
            .await?;

        if !output.status.success() {
            return Err(AgentError::Platform(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// `restic 0.16.4 compiled with go1.21.6 on linux/amd64` -> `0.16.4`
pub fn parse_version(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    match (words.next(), words.next()) {
        (Some("restic"), Some(version)) => Some(version.to_string()),
        _ => None,
    }
}
