//! Environment check run before the services start.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Found interpreter and package availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentReport {
    pub interpreter: PathBuf,
    pub version: String,
    pub packages: Vec<PackageStatus>,
}

impl EnvironmentReport {
    pub fn missing(&self) -> Vec<String> {
        self.packages
            .iter()
            .filter(|p| !p.installed)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Fail with [`Error::EnvironmentCheckFailed`] if any package is missing.
    pub fn ensure_complete(&self, requirements: Option<&Path>) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let interpreter = self.interpreter.display();
        let install_hint = match requirements {
            Some(path) => format!("{interpreter} -m pip install -r {}", path.display()),
            None => format!("{interpreter} -m pip install {}", missing.join(" ")),
        };
        Err(Error::EnvironmentCheckFailed {
            missing,
            install_hint,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageStatus {
    /// Distribution name as written in the requirements file.
    pub name: String,
    pub installed: bool,
}

/// Locate `interpreter`, query its version, and check that every package in
/// `requirements` can be imported.
pub async fn check_environment(
    interpreter: &str,
    requirements: Option<&Path>,
) -> Result<EnvironmentReport> {
    let interpreter_path =
        which::which(interpreter).map_err(|source| Error::InterpreterNotFound {
            interpreter: interpreter.to_string(),
            source,
        })?;
    debug!("Using interpreter {}", interpreter_path.display());

    let version = interpreter_version(&interpreter_path).await?;
    info!("Found {}", version);

    let mut packages = Vec::new();
    if let Some(path) = requirements {
        let contents = tokio::fs::read_to_string(path).await?;
        for name in parse_requirements(&contents) {
            let installed = can_import(&interpreter_path, &import_name(&name)).await?;
            if !installed {
                warn!(package = %name, "Package not importable");
            }
            packages.push(PackageStatus { name, installed });
        }
    }

    Ok(EnvironmentReport {
        interpreter: interpreter_path,
        version,
        packages,
    })
}

async fn interpreter_version(interpreter: &Path) -> Result<String> {
    let output = Command::new(interpreter)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await?;
    // Older interpreters print the version on stderr.
    let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        version = String::from_utf8_lossy(&output.stderr).trim().to_string();
    }
    Ok(version)
}

async fn can_import(interpreter: &Path, module: &str) -> Result<bool> {
    let status = Command::new(interpreter)
        .arg("-c")
        .arg(format!("import {module}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

/// Package names from a `requirements.txt`, without versions, extras, markers
/// or comments. Option lines (`-r`, `--index-url`) are skipped.
pub fn parse_requirements(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty() && !line.starts_with('-'))
        .filter_map(|line| {
            let end = line
                .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '[' | ';' | '@' | ' '))
                .unwrap_or(line.len());
            let name = line[..end].trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// Module name checked for a requirement: the distribution name with `-`
/// replaced by `_`. Distributions whose module name differs (`PyYAML` is
/// imported as `yaml`) are reported missing.
fn import_name(package: &str) -> String {
    package.replace('-', "_")
}
