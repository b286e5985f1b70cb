//! Dated backup snapshots of the files about to be rewritten
//!
//! One snapshot directory per calendar day, named `YYYY-MM-DD` under the
//! backup root. A second run on the same day reuses the existing snapshot
//! untouched: idempotence is keyed on the date alone, not on file content.
//! Files are copied in, never deleted.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::ui;

const MANIFEST_NAME: &str = "snapshot.json";

/// A day's snapshot: where it lives and what it captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// Calendar-day key for this snapshot
    pub date: NaiveDate,
    /// Snapshot directory (backup root + date)
    pub root: PathBuf,
    /// original path -> copied path; only ever grows
    pub captured: BTreeMap<PathBuf, PathBuf>,
    /// When the snapshot was first created
    pub created_at: DateTime<Utc>,
}

pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Snapshot directory for a given date.
    pub fn snapshot_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format("%Y-%m-%d").to_string())
    }

    /// Ensure a snapshot exists for `date`, capturing `sources`.
    ///
    /// If the dated directory already exists, the recorded snapshot is
    /// returned as-is: no new copies are made regardless of how often the
    /// tool runs that day. Missing source paths are skipped with a warning.
    pub fn ensure(&self, sources: &[PathBuf], date: NaiveDate) -> Result<BackupSnapshot> {
        let dir = self.snapshot_dir(date);

        if dir.exists() {
            ui::dim(&format!(
                "Reusing existing backup {}",
                dir.display()
            ));
            return self.load_or_rebuild(&dir, date);
        }

        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create backup dir {}", dir.display()))?;

        let mut snapshot = BackupSnapshot {
            date,
            root: dir.clone(),
            captured: BTreeMap::new(),
            created_at: Utc::now(),
        };

        for source in sources {
            if !source.exists() {
                ui::warn(&format!(
                    "Backup source missing, skipping: {}",
                    source.display()
                ));
                continue;
            }
            capture(source, &dir, &mut snapshot.captured)?;
        }

        self.write_manifest(&snapshot)?;
        ui::success(&format!(
            "Backed up {} into {}",
            ui::count_label(snapshot.captured.len(), "file"),
            dir.display()
        ));
        Ok(snapshot)
    }

    fn write_manifest(&self, snapshot: &BackupSnapshot) -> Result<()> {
        let path = snapshot.root.join(MANIFEST_NAME);
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Read the manifest of an existing snapshot, rebuilding it from the
    /// directory contents if it is missing or unreadable.
    fn load_or_rebuild(&self, dir: &Path, date: NaiveDate) -> Result<BackupSnapshot> {
        let manifest = dir.join(MANIFEST_NAME);
        if let Ok(content) = fs::read_to_string(&manifest) {
            if let Ok(snapshot) = serde_json::from_str::<BackupSnapshot>(&content) {
                return Ok(snapshot);
            }
            log::warn!("corrupt manifest at {}, rebuilding", manifest.display());
        }

        let mut captured = BTreeMap::new();
        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = entry.context("Failed to read backup entry")?;
            if entry.file_type().is_file() && entry.file_name() != MANIFEST_NAME {
                // Originals are unknown without a manifest; record the copies.
                captured.insert(entry.path().to_path_buf(), entry.path().to_path_buf());
            }
        }

        let snapshot = BackupSnapshot {
            date,
            root: dir.to_path_buf(),
            captured,
            created_at: Utc::now(),
        };
        self.write_manifest(&snapshot)?;
        Ok(snapshot)
    }
}

/// Copy one source (file or directory, recursively) into the snapshot dir,
/// recording every captured file.
fn capture(
    source: &Path,
    dir: &Path,
    captured: &mut BTreeMap<PathBuf, PathBuf>,
) -> Result<()> {
    let base_name = source
        .file_name()
        .with_context(|| format!("Backup source has no name: {}", source.display()))?;

    if source.is_file() {
        let dest = dir.join(base_name);
        fs::copy(source, &dest)
            .with_context(|| format!("Failed to copy {}", source.display()))?;
        captured.insert(source.to_path_buf(), dest);
        return Ok(());
    }

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.context("Failed to read directory entry")?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let dest = dir.join(base_name).join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            captured.insert(entry.path().to_path_buf(), dest);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_backup_once_per_day() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("sources.list");
        fs::write(&src, "deb http://x bookworm main\n").unwrap();

        let mgr = BackupManager::new(&tmp.path().join("backups"));
        let first = mgr.ensure(&[src.clone()], date("2026-08-06")).unwrap();
        assert_eq!(first.captured.len(), 1);

        // Mutate the source; a same-day re-run must not copy again.
        fs::write(&src, "deb http://x trixie main\n").unwrap();
        let second = mgr.ensure(&[src.clone()], date("2026-08-06")).unwrap();
        let copy = second.captured.get(&src).unwrap();
        let content = fs::read_to_string(copy).unwrap();
        assert!(content.contains("bookworm"), "same-day re-run overwrote the snapshot");

        let days: Vec<_> = fs::read_dir(tmp.path().join("backups"))
            .unwrap()
            .collect();
        assert_eq!(days.len(), 1);

        // The following day gets its own independent snapshot.
        mgr.ensure(&[src], date("2026-08-07")).unwrap();
        let days: Vec<_> = fs::read_dir(tmp.path().join("backups"))
            .unwrap()
            .collect();
        assert_eq!(days.len(), 2);
    }

    #[test]
    fn test_missing_source_is_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let mgr = BackupManager::new(&tmp.path().join("backups"));
        let snapshot = mgr
            .ensure(&[tmp.path().join("nope.list")], date("2026-08-06"))
            .unwrap();
        assert!(snapshot.captured.is_empty());
    }

    #[test]
    fn test_directory_sources_are_captured_recursively() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sources.list.d");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.list"), "deb http://a bookworm main\n").unwrap();
        fs::write(dir.join("b.sources"), "Types: deb\n").unwrap();

        let mgr = BackupManager::new(&tmp.path().join("backups"));
        let snapshot = mgr.ensure(&[dir], date("2026-08-06")).unwrap();
        assert_eq!(snapshot.captured.len(), 2);
        for copy in snapshot.captured.values() {
            assert!(copy.exists());
        }
    }

    #[test]
    fn test_manifest_rebuilt_when_corrupt() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("sources.list");
        fs::write(&src, "deb http://x bookworm main\n").unwrap();

        let mgr = BackupManager::new(&tmp.path().join("backups"));
        let first = mgr.ensure(&[src.clone()], date("2026-08-06")).unwrap();
        fs::write(first.root.join("snapshot.json"), "{not json").unwrap();

        let rebuilt = mgr.ensure(&[src], date("2026-08-06")).unwrap();
        assert_eq!(rebuilt.captured.len(), 1);
    }
}
