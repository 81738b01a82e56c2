use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;

/// Suffix marker for snapshot files. Anything carrying it is excluded from
/// compilation input lists.
pub const BACKUP_MARKER: &str = ".backup.";

#[derive(Clone, Debug)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub original_path: PathBuf,
    pub created_at: String,
}

/// Timestamped snapshots with atomic rollback. One snapshot per safe-edit
/// session; restoring rolls back everything since the snapshot.
#[derive(Default)]
pub struct BackupManager;

impl BackupManager {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    pub fn create(&self, path: &Path) -> anyhow::Result<BackupEntry> {
        let created_at = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("backup target has no file name: {}", path.display()))?;
        let mut backup_path = path.with_file_name(format!("{file_name}{BACKUP_MARKER}{created_at}"));
        // Same-millisecond snapshots of one file get a disambiguating suffix.
        let mut serial = 0u32;
        while backup_path.exists() {
            serial += 1;
            backup_path = path.with_file_name(format!("{file_name}{BACKUP_MARKER}{created_at}.{serial}"));
        }
        fs::copy(path, &backup_path)
            .with_context(|| format!("snapshot {} -> {}", path.display(), backup_path.display()))?;
        Ok(BackupEntry {
            path: backup_path,
            original_path: path.to_path_buf(),
            created_at,
        })
    }

    pub fn restore(&self, entry: &BackupEntry) -> anyhow::Result<()> {
        fs::copy(&entry.path, &entry.original_path).with_context(|| {
            format!(
                "restore {} -> {}",
                entry.path.display(),
                entry.original_path.display()
            )
        })?;
        Ok(())
    }

    /// Snapshots of `path`, oldest first.
    pub fn list(&self, path: &Path) -> anyhow::Result<Vec<BackupEntry>> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
        let prefix = format!("{file_name}{BACKUP_MARKER}");
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read dir: {}", dir.display()))? {
            let entry = entry.context("dir entry")?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stamp) = name.strip_prefix(&prefix) {
                out.push(BackupEntry {
                    path: entry.path(),
                    original_path: path.to_path_buf(),
                    created_at: stamp.to_string(),
                });
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Drop all but the newest `keep_n` snapshots of `path`.
    pub fn cleanup(&self, path: &Path, keep_n: usize) -> anyhow::Result<usize> {
        let entries = self.list(path)?;
        let drop_n = entries.len().saturating_sub(keep_n);
        for entry in entries.iter().take(drop_n) {
            fs::remove_file(&entry.path)
                .with_context(|| format!("remove snapshot: {}", entry.path.display()))?;
        }
        Ok(drop_n)
    }

    pub fn remove(&self, entry: &BackupEntry) -> anyhow::Result<()> {
        fs::remove_file(&entry.path)
            .with_context(|| format!("remove snapshot: {}", entry.path.display()))?;
        Ok(())
    }
}

/// True for snapshot files that must not reach the compiler's input set.
#[must_use]
pub fn is_backup_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(|name| name.contains(BACKUP_MARKER))
        .unwrap_or(false)
}
