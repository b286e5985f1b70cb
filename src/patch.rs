//! Marker-guarded idempotent patching
//!
//! A patch is a body of text appended to a target file exactly once. The
//! marker embedded in the body is the sole truth source for "already
//! applied": created on first write, never removed automatically.

use anyhow::{Context, Result};
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::config::MigrateConfig;

/// Marker proving the UI patch has been applied to the widget library.
pub const NONAG_MARKER: &str = "pveup-nonag-v1";

/// Append `body` to `target` unless `marker` is already present.
///
/// An absent target is a no-op, not an error: patch targets belong to
/// optional software. Returns whether the patch was applied.
pub fn apply(target: &Path, marker: &str, body: &str) -> Result<bool> {
    debug_assert!(body.contains(marker), "patch body must embed its marker");

    if !target.exists() {
        log::debug!("patch target absent, skipping: {}", target.display());
        return Ok(false);
    }

    let content = fs::read_to_string(target)
        .with_context(|| format!("Failed to read {}", target.display()))?;
    if content.contains(marker) {
        log::debug!("patch already applied to {}", target.display());
        return Ok(false);
    }

    let mut file = OpenOptions::new()
        .append(true)
        .open(target)
        .with_context(|| format!("Failed to open {}", target.display()))?;
    if !content.ends_with('\n') && !content.is_empty() {
        writeln!(file)?;
    }
    file.write_all(body.as_bytes())
        .with_context(|| format!("Failed to patch {}", target.display()))?;
    Ok(true)
}

/// JavaScript appended to the widget library: overrides the subscription
/// check so the nag dialog never fires. Loaded after the original
/// definitions, so the override wins.
pub fn nonag_body() -> String {
    format!(
        "// {NONAG_MARKER}\nProxmox.Utils.checked_command = function(orig_cmd) {{ orig_cmd(); }};\n"
    )
}

/// Shell helper that re-applies the UI patch. Installed once; the apt hook
/// below runs it after every package operation so toolkit upgrades do not
/// resurrect the nag.
fn script_body(cfg: &MigrateConfig) -> String {
    format!(
        "#!/bin/sh\n\
         # re-applies the subscription notice patch after package operations\n\
         LIB=\"{lib}\"\n\
         [ -f \"$LIB\" ] || exit 0\n\
         grep -q \"{marker}\" \"$LIB\" && exit 0\n\
         cat >> \"$LIB\" <<'EOF'\n\
         {body}EOF\n",
        lib = cfg.widget_lib.display(),
        marker = NONAG_MARKER,
        body = nonag_body(),
    )
}

/// Write the persistent re-patch script if it does not exist yet.
/// File presence is the only detection; content is never compared.
pub fn ensure_script(cfg: &MigrateConfig) -> Result<bool> {
    let path = &cfg.patch_script;
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, script_body(cfg))
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
    }
    Ok(true)
}

/// Write the package-manager post-step hook that invokes the script,
/// if it does not exist yet.
pub fn ensure_hook(cfg: &MigrateConfig) -> Result<bool> {
    let path = cfg.patch_hook_path();
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let body = format!(
        "DPkg::Post-Invoke {{ \"{}\"; }};\n",
        cfg.patch_script.display()
    );
    fs::write(&path, body)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_exactly_once() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("proxmoxlib.js");
        fs::write(&target, "Ext.define('Proxmox.Utils', {});\n").unwrap();

        let body = nonag_body();
        assert!(apply(&target, NONAG_MARKER, &body).unwrap());
        assert!(!apply(&target, NONAG_MARKER, &body).unwrap());
        assert!(!apply(&target, NONAG_MARKER, &body).unwrap());

        let content = fs::read_to_string(&target).unwrap();
        assert_eq!(content.matches(NONAG_MARKER).count(), 1);
    }

    #[test]
    fn test_absent_target_is_noop() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("missing.js");
        assert!(!apply(&target, NONAG_MARKER, &nonag_body()).unwrap());
        assert!(!target.exists());
    }

    #[test]
    fn test_apply_adds_newline_before_body() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("lib.js");
        fs::write(&target, "var x = 1;").unwrap();

        apply(&target, NONAG_MARKER, &nonag_body()).unwrap();
        let content = fs::read_to_string(&target).unwrap();
        assert!(content.contains("var x = 1;\n//"));
    }

    #[test]
    fn test_artifacts_created_at_most_once() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = MigrateConfig::from_env(true);
        cfg.patch_script = tmp.path().join("bin/pveup-nonag.sh");
        cfg.apt_conf_dir = tmp.path().join("apt.conf.d");

        assert!(ensure_script(&cfg).unwrap());
        assert!(!ensure_script(&cfg).unwrap());
        assert!(ensure_hook(&cfg).unwrap());
        assert!(!ensure_hook(&cfg).unwrap());

        let hook = fs::read_to_string(cfg.patch_hook_path()).unwrap();
        assert!(hook.contains("DPkg::Post-Invoke"));
        assert!(hook.contains(cfg.patch_script.to_str().unwrap()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&cfg.patch_script).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
