//! External collaborators consumed through narrow trait seams
//!
//! The convergence engine never shells out directly; it talks to these five
//! traits. The `Host*` implementations wrap the real tools, and tests swap
//! in mocks.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::MigrateConfig;
use crate::runner;

/// Reports the installed platform generation.
pub trait VersionOracle {
    /// `(major, minor)` of the installed release. Fails when the host is
    /// not running the expected platform at all.
    fn current(&self) -> Result<(u32, u32)>;
}

/// Validates the host before migration is allowed to start.
pub trait PreflightChecker {
    /// Run the full check suite, returning blocking findings.
    /// An empty list means the host may migrate.
    fn run_full(&self) -> Result<Vec<String>>;
}

/// Answers whether this node is part of a cluster.
pub trait ClusterMembership {
    fn is_clustered(&self) -> bool;
}

/// Synchronous package-manager operations. Each either succeeds or fails
/// before the next convergence step runs.
pub trait PackageManager {
    fn update(&self) -> Result<()>;
    fn dist_upgrade(&self) -> Result<()>;
    fn reinstall(&self, package: &str) -> Result<()>;
    fn install_if_missing(&self, package: &str) -> Result<()>;
}

/// Minimal service control surface.
pub trait ServiceController {
    fn is_active(&self, name: &str) -> bool;
    fn disable_and_stop(&self, name: &str) -> Result<()>;
}

// ============================================================================
// Host implementations
// ============================================================================

/// Version oracle backed by the platform version tool.
pub struct HostVersionOracle {
    tool: String,
}

impl HostVersionOracle {
    pub fn new(cfg: &MigrateConfig) -> Self {
        Self {
            tool: cfg.version_tool.clone(),
        }
    }
}

impl VersionOracle for HostVersionOracle {
    fn current(&self) -> Result<(u32, u32)> {
        let line = runner::run_capture(&self.tool, &[])
            .with_context(|| format!("{} is not runnable on this host", self.tool))?;
        parse_version_line(&line)
            .with_context(|| format!("unexpected {} output: {line}", self.tool))
    }
}

/// Parse `pve-manager/8.2.4/deadbeef (running kernel: ...)` into `(8, 2)`.
fn parse_version_line(line: &str) -> Result<(u32, u32)> {
    let version = line
        .split('/')
        .nth(1)
        .context("missing version field")?;
    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|s| s.parse().ok())
        .context("missing major version")?;
    let minor = parts
        .next()
        .and_then(|s| s.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
        .unwrap_or(0);
    Ok((major, minor))
}

/// Pre-flight checker backed by the platform's own upgrade checklist tool.
pub struct HostPreflight {
    tool: String,
}

impl HostPreflight {
    pub fn new(cfg: &MigrateConfig) -> Self {
        Self {
            tool: cfg.preflight_tool.clone(),
        }
    }
}

impl PreflightChecker for HostPreflight {
    fn run_full(&self) -> Result<Vec<String>> {
        if !runner::command_exists(&self.tool) {
            anyhow::bail!("required pre-flight tool '{}' is not installed", self.tool);
        }

        // The checker prints its report on stdout and flags hard blockers
        // with FAIL: lines; it may exit non-zero when findings exist.
        let report = runner::run_capture_lenient(&self.tool, &["--full"])?;

        let findings: Vec<String> = report
            .lines()
            .filter(|l| l.trim_start().starts_with("FAIL:"))
            .map(|l| l.trim().to_string())
            .collect();

        log::debug!(
            "{} reported {} blocking finding(s)",
            self.tool,
            findings.len()
        );
        Ok(findings)
    }
}

/// Cluster membership derived from the corosync configuration.
pub struct HostCluster {
    conf: PathBuf,
}

impl HostCluster {
    pub fn new(cfg: &MigrateConfig) -> Self {
        Self {
            conf: cfg.cluster_conf.clone(),
        }
    }
}

impl ClusterMembership for HostCluster {
    fn is_clustered(&self) -> bool {
        self.conf.exists()
    }
}

/// apt-get wrapper. Unattended runs get a non-interactive frontend.
pub struct HostPackageManager {
    unattended: bool,
}

impl HostPackageManager {
    pub fn new(cfg: &MigrateConfig) -> Self {
        Self {
            unattended: cfg.unattended,
        }
    }

    fn apt(&self, args: &[&str]) -> Result<()> {
        let status = if self.unattended {
            runner::run_with_env("apt-get", args, &[("DEBIAN_FRONTEND", "noninteractive")])?
        } else {
            runner::run("apt-get", args)?
        };

        if status.success() {
            Ok(())
        } else {
            anyhow::bail!("apt-get {} exited with {status}", args.join(" "))
        }
    }
}

impl PackageManager for HostPackageManager {
    fn update(&self) -> Result<()> {
        self.apt(&["update"])
    }

    fn dist_upgrade(&self) -> Result<()> {
        self.apt(&["dist-upgrade", "-y"])
    }

    fn reinstall(&self, package: &str) -> Result<()> {
        self.apt(&["install", "--reinstall", "-y", package])
    }

    fn install_if_missing(&self, package: &str) -> Result<()> {
        if runner::run_quiet("dpkg", &["-s", package]) {
            log::debug!("{package} already installed");
            return Ok(());
        }
        self.apt(&["install", "-y", package])
    }
}

/// systemd service controller.
pub struct HostServices;

impl ServiceController for HostServices {
    fn is_active(&self, name: &str) -> bool {
        runner::run_quiet("systemctl", &["is-active", "--quiet", name])
    }

    fn disable_and_stop(&self, name: &str) -> Result<()> {
        let status = runner::run("systemctl", &["disable", "--now", name])?;
        if status.success() {
            Ok(())
        } else {
            anyhow::bail!("systemctl disable --now {name} exited with {status}")
        }
    }
}

/// The full collaborator set handed to the engine.
pub struct Collaborators<'a> {
    pub oracle: &'a dyn VersionOracle,
    pub preflight: &'a dyn PreflightChecker,
    pub cluster: &'a dyn ClusterMembership,
    pub pkg: &'a dyn PackageManager,
    pub svc: &'a dyn ServiceController,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_line() {
        let (major, minor) =
            parse_version_line("pve-manager/8.2.4/faa83925c9641325 (running kernel: 6.8.4-2-pve)")
                .unwrap();
        assert_eq!((major, minor), (8, 2));
    }

    #[test]
    fn test_parse_version_line_short() {
        assert_eq!(parse_version_line("pve-manager/9.0/abc").unwrap(), (9, 0));
    }

    #[test]
    fn test_parse_version_line_garbage() {
        assert!(parse_version_line("command not found").is_err());
    }
}
