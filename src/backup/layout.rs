use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};

/// Top-level directory on a backup drive.
pub const BACKUPS_DIR: &str = "coldvault-backups";
pub const MANIFEST_FILE: &str = "manifest.json";
const ITEMS_DIR: &str = "items";

/// Paths of backups below a drive's mount point:
/// `<mount>/coldvault-backups/<backup_id>/{manifest.json, items/<item_id>.json}`.
#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(mount_point: &Path) -> Self {
        Self {
            root: mount_point.join(BACKUPS_DIR),
        }
    }

    pub fn backup_dir(&self, backup_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(safe_component(backup_id)?))
    }

    pub fn items_dir(&self, backup_id: &str) -> Result<PathBuf> {
        Ok(self.backup_dir(backup_id)?.join(ITEMS_DIR))
    }

    pub fn item_path(&self, backup_id: &str, item_id: &str) -> Result<PathBuf> {
        Ok(self
            .items_dir(backup_id)?
            .join(format!("{}.json", safe_component(item_id)?)))
    }

    pub fn manifest_path(&self, backup_id: &str) -> Result<PathBuf> {
        Ok(self.backup_dir(backup_id)?.join(MANIFEST_FILE))
    }

    /// Ids of backup directories that carry a manifest. Directories without
    /// one are unfinished or cancelled backups and are skipped.
    pub fn complete_backups(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if entry.path().join(MANIFEST_FILE).is_file() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Ids come from manifests on removable media and must not be able to
/// escape the backup directory.
fn safe_component(id: &str) -> Result<&str> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(id)
    } else {
        Err(VaultError::validation(format!("invalid record id: {id:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_follow_the_layout() {
        let layout = BackupLayout::new(Path::new("/mnt/x"));

        assert_eq!(
            layout.item_path("b1", "i1").unwrap(),
            PathBuf::from("/mnt/x/coldvault-backups/b1/items/i1.json")
        );
        assert_eq!(
            layout.manifest_path("b1").unwrap(),
            PathBuf::from("/mnt/x/coldvault-backups/b1/manifest.json")
        );
    }

    #[test]
    fn traversal_is_rejected() {
        let layout = BackupLayout::new(Path::new("/mnt/x"));

        assert!(layout.item_path("b1", "../../etc/passwd").is_err());
        assert!(layout.backup_dir("..").is_err());
        assert!(layout.backup_dir("").is_err());
    }

    #[test]
    fn only_backups_with_manifest_are_listed() {
        let dir = tempdir().unwrap();
        let layout = BackupLayout::new(dir.path());
        assert!(layout.complete_backups().unwrap().is_empty());

        fs::create_dir_all(layout.items_dir("done").unwrap()).unwrap();
        fs::write(layout.manifest_path("done").unwrap(), b"{}").unwrap();
        fs::create_dir_all(layout.items_dir("partial").unwrap()).unwrap();

        assert_eq!(layout.complete_backups().unwrap(), vec!["done".to_string()]);
    }
}
