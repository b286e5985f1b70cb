use anyhow::{Context, Result};
use std::process::{Command, ExitStatus, Stdio};

/// Run a command and inherit stdio (shows output in real-time)
pub fn run(cmd: &str, args: &[&str]) -> Result<ExitStatus> {
    Command::new(cmd)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to execute: {} {}", cmd, args.join(" ")))
}

/// Run a command with extra environment variables, inheriting stdio.
///
/// apt frontends read `DEBIAN_FRONTEND` and friends from the environment,
/// so unattended mode is injected here rather than via flags.
pub fn run_with_env(cmd: &str, args: &[&str], env: &[(&str, &str)]) -> Result<ExitStatus> {
    Command::new(cmd)
        .args(args)
        .envs(env.iter().copied())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to execute: {} {}", cmd, args.join(" ")))
}

/// Run a command and capture output
pub fn run_capture(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute: {} {}", cmd, args.join(" ")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Command failed: {}", stderr.trim())
    }
}

/// Run a command and capture stdout regardless of exit status.
///
/// Pre-flight checkers report findings on stdout and may exit non-zero
/// when findings exist; the caller inspects the text, not the status.
pub fn run_capture_lenient(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute: {} {}", cmd, args.join(" ")))?;

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run a command silently, returning success/failure
pub fn run_quiet(cmd: &str, args: &[&str]) -> bool {
    Command::new(cmd)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check if a command exists
pub fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
