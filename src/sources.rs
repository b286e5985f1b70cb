//! Repository declaration model and format migration
//!
//! Declarations come in two formats: legacy one-line apt syntax (`deb URI
//! suite component...`) and structured deb822 stanzas. The format is
//! decided once at load time from the file extension and carried as a tag
//! on the declaration, never re-derived at use sites.
//!
//! Every rewrite here is idempotent: a second pass over already-migrated
//! files performs no write.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::MigrateConfig;
use crate::ui;

/// Declaration syntax, fixed at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// One-line `deb ...` syntax (`.list` files)
    Legacy,
    /// deb822 stanzas (`.sources` files)
    Structured,
}

/// One configured package source, as parsed from disk.
#[derive(Debug, Clone)]
pub struct RepoDecl {
    pub path: PathBuf,
    pub format: SourceFormat,
    /// Any active entry present (legacy) / not `Enabled: no` (structured)
    pub enabled: bool,
    pub suites: Vec<String>,
    pub uris: Vec<String>,
    pub components: Vec<String>,
    pub raw: String,
}

impl RepoDecl {
    fn mentions_uri(&self, uri: &str) -> bool {
        self.uris.iter().any(|u| u.starts_with(uri))
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Every declaration file currently on disk: the conventional single file
/// plus all `.list` and `.sources` files in the declarations directory.
/// Renamed-aside `.bak` copies are ignored.
pub fn declaration_paths(cfg: &MigrateConfig) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    if cfg.sources_file.exists() {
        paths.push(cfg.sources_file.clone());
    }

    if cfg.sources_dir.is_dir() {
        let mut dir_paths: Vec<PathBuf> = fs::read_dir(&cfg.sources_dir)
            .with_context(|| format!("Failed to read {}", cfg.sources_dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("list" | "sources")
                )
            })
            .collect();
        dir_paths.sort();
        paths.extend(dir_paths);
    }

    Ok(paths)
}

/// Load and parse every declaration, tagging each with its format.
pub fn load(cfg: &MigrateConfig) -> Result<Vec<RepoDecl>> {
    declaration_paths(cfg)?
        .iter()
        .map(|path| {
            let format = if path == &cfg.sources_file
                || path.extension().and_then(|e| e.to_str()) == Some("list")
            {
                SourceFormat::Legacy
            } else {
                SourceFormat::Structured
            };
            load_one(path, format)
        })
        .collect()
}

fn load_one(path: &Path, format: SourceFormat) -> Result<RepoDecl> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(match format {
        SourceFormat::Legacy => parse_legacy(path, &raw),
        SourceFormat::Structured => parse_structured(path, &raw),
    })
}

/// Parse one-line syntax. A file counts as enabled when at least one
/// uncommented `deb`/`deb-src` entry remains.
fn parse_legacy(path: &Path, raw: &str) -> RepoDecl {
    let mut uris = Vec::new();
    let mut suites = Vec::new();
    let mut components = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("deb" | "deb-src") => {}
            _ => continue,
        }

        // An [option=value ...] block may follow the type; skip it whole.
        let mut next = tokens.next();
        if let Some(tok) = next {
            if tok.starts_with('[') {
                let mut tok = tok;
                while !tok.ends_with(']') {
                    match tokens.next() {
                        Some(t) => tok = t,
                        None => break,
                    }
                }
                next = tokens.next();
            }
        }

        if let Some(uri) = next {
            uris.push(uri.to_string());
        }
        if let Some(suite) = tokens.next() {
            suites.push(suite.to_string());
        }
        components.extend(tokens.map(str::to_string));
    }

    let enabled = !uris.is_empty();
    RepoDecl {
        path: path.to_path_buf(),
        format: SourceFormat::Legacy,
        enabled,
        suites,
        uris,
        components,
        raw: raw.to_string(),
    }
}

/// Parse deb822 stanzas. Multiple stanzas in one file are merged; the file
/// counts as disabled only when a stanza says so explicitly.
fn parse_structured(path: &Path, raw: &str) -> RepoDecl {
    let mut uris = Vec::new();
    let mut suites = Vec::new();
    let mut components = Vec::new();
    let mut enabled = true;

    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let values = value.split_whitespace().map(str::to_string);
        match key.trim() {
            "URIs" => uris.extend(values),
            "Suites" => suites.extend(values),
            "Components" => components.extend(values),
            "Enabled" => {
                if matches!(value.trim(), "no" | "false" | "0") {
                    enabled = false;
                }
            }
            _ => {}
        }
    }

    RepoDecl {
        path: path.to_path_buf(),
        format: SourceFormat::Structured,
        enabled,
        suites,
        uris,
        components,
        raw: raw.to_string(),
    }
}

// ============================================================================
// Rewrites
// ============================================================================

/// Replace every whole-word occurrence of `from` with `to` in `path`.
///
/// Returns whether the file changed. A file without the token is left
/// byte-identical, so a second call is always a no-op.
pub fn migrate_token(path: &Path, from: &str, to: &str) -> Result<bool> {
    if from == to {
        return Ok(false);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let re = Regex::new(&format!(r"\b{}\b", regex::escape(from)))
        .context("Invalid token pattern")?;
    if !re.is_match(&content) {
        return Ok(false);
    }

    let rewritten = re.replace_all(&content, to);
    fs::write(path, rewritten.as_ref())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("rewrote {from} -> {to} in {}", path.display());
    Ok(true)
}

/// Rename a superseded file aside with a `.bak` suffix.
///
/// An existing `.bak` is never overwritten; the rename is skipped with a
/// warning instead. Nothing is ever deleted.
pub fn rename_aside(path: &Path) -> Result<Option<PathBuf>> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        anyhow::bail!("Cannot rename {}", path.display());
    };
    let bak = path.with_file_name(format!("{name}.bak"));

    if bak.exists() {
        ui::warn(&format!(
            "Not renaming {}: {} already exists",
            path.display(),
            bak.display()
        ));
        return Ok(None);
    }

    fs::rename(path, &bak)
        .with_context(|| format!("Failed to rename {} aside", path.display()))?;
    Ok(Some(bak))
}

/// Flip the `Enabled:` field of a structured declaration in place,
/// preserving every other line. Returns whether the file changed.
pub fn set_enabled(path: &Path, enabled: bool) -> Result<bool> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let desired = if enabled { "Enabled: yes" } else { "Enabled: no" };

    let mut lines: Vec<String> = Vec::new();
    let mut found = false;
    let mut changed = false;

    for line in content.lines() {
        if line.trim_start().starts_with("Enabled:") {
            found = true;
            if line.trim() != desired {
                changed = true;
                lines.push(desired.to_string());
                continue;
            }
        }
        lines.push(line.to_string());
    }

    if !found {
        if enabled {
            // Absent means enabled already.
            return Ok(false);
        }
        lines.push(desired.to_string());
        changed = true;
    }

    if !changed {
        return Ok(false);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    fs::write(path, out)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// Comment out every uncommented entry line mentioning `uri`.
/// Used to disable a policy-excluded channel inside a mixed legacy file.
pub fn disable_legacy_lines(path: &Path, uri: &str) -> Result<bool> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut changed = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if !trimmed.starts_with('#')
                && (trimmed.starts_with("deb ") || trimmed.starts_with("deb-src "))
                && line.contains(uri)
            {
                changed = true;
                format!("# {line}")
            } else {
                line.to_string()
            }
        })
        .collect();

    if !changed {
        return Ok(false);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    fs::write(path, out)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// Render the structured free-channel declaration bound to the target suite.
pub fn render_community(cfg: &MigrateConfig) -> String {
    format!(
        "Types: deb\nURIs: {}\nSuites: {}\nComponents: {}\nSigned-By: {}\n",
        cfg.community_uri,
        cfg.target.codename,
        cfg.community_component,
        cfg.keyring_path.display()
    )
}

// ============================================================================
// Channel policy migration
// ============================================================================

/// Converge the platform channel declarations onto the structured format:
/// the subscription-only channel ends disabled, the free channel ends as
/// one enabled structured declaration at the target suite, and superseded
/// legacy copies are renamed aside. Returns change descriptions; an empty
/// list means the layout was already converged.
pub fn migrate_channels(cfg: &MigrateConfig, decls: &[RepoDecl]) -> Result<Vec<String>> {
    let mut changes = Vec::new();

    // Disable the policy-excluded channel first.
    for decl in decls {
        if !decl.mentions_uri(&cfg.enterprise_uri) || !decl.enabled {
            continue;
        }
        match decl.format {
            SourceFormat::Structured => {
                if set_enabled(&decl.path, false)? {
                    changes.push(format!("disabled {}", decl.path.display()));
                }
            }
            SourceFormat::Legacy => {
                if decl.uris.iter().all(|u| u.starts_with(&cfg.enterprise_uri)) {
                    if let Some(bak) = rename_aside(&decl.path)? {
                        changes.push(format!(
                            "renamed {} -> {}",
                            decl.path.display(),
                            bak.display()
                        ));
                    }
                } else if disable_legacy_lines(&decl.path, &cfg.enterprise_uri)? {
                    changes.push(format!(
                        "commented {} entries in {}",
                        cfg.enterprise_component,
                        decl.path.display()
                    ));
                }
            }
        }
    }

    // Structured wins: any legacy declaration of the free channel is
    // superseded and renamed aside.
    for decl in decls {
        if decl.format == SourceFormat::Legacy
            && decl.mentions_uri(&cfg.community_uri)
            && decl.uris.iter().all(|u| u.starts_with(&cfg.community_uri))
        {
            if let Some(bak) = rename_aside(&decl.path)? {
                changes.push(format!(
                    "renamed {} -> {}",
                    decl.path.display(),
                    bak.display()
                ));
            }
        }
    }

    // Ensure one enabled structured free-channel declaration. An existing
    // one is left in place (its suite converges via the token rewrite, its
    // content is never rewritten); only a host without one gets the new
    // declaration written.
    let existing = decls.iter().find(|d| {
        d.format == SourceFormat::Structured && d.mentions_uri(&cfg.community_uri)
    });

    match existing {
        Some(decl) => {
            // Policy re-enables the free tier, nothing else.
            if set_enabled(&decl.path, true)? {
                changes.push(format!("re-enabled {}", decl.path.display()));
            }
        }
        None => {
            let dest = cfg.community_sources_path();
            let desired = render_community(cfg);
            if fs::read_to_string(&dest).ok().as_deref() != Some(desired.as_str()) {
                fs::write(&dest, &desired)
                    .with_context(|| format!("Failed to write {}", dest.display()))?;
                changes.push(format!("wrote {}", dest.display()));
            }
        }
    }

    Ok(changes)
}

/// Advisory: both paid and free channels left active after migration.
pub fn mixed_channels(cfg: &MigrateConfig, decls: &[RepoDecl]) -> bool {
    let enterprise_active = decls
        .iter()
        .any(|d| d.enabled && d.mentions_uri(&cfg.enterprise_uri));
    let community_active = decls
        .iter()
        .any(|d| d.enabled && d.mentions_uri(&cfg.community_uri));
    enterprise_active && community_active
}

// ============================================================================
// Tests
// ============================================================================
