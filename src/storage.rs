//! Crash-safe file persistence for the store, the trust table and backup
//! manifests.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};

use crate::crypto::aead::secure_random;
use crate::error::{Result, VaultError};

/// A single file persisted with atomic replace.
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| {
            VaultError::Storage(format!("failed to read {}: {e}", self.path.display()))
        })
    }

    /// Deserialize the file, or `None` if it does not exist yet.
    pub fn load_json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if !self.exists() {
            return Ok(None);
        }
        let data = self.load()?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    pub fn save_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.save(&data)
    }

    /// Atomically replace the file: write a sibling temp file, fsync it,
    /// rename it over the target, then fsync the directory. A crash leaves
    /// either the old or the new contents, never a partial write.
    pub fn save(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.random_tmp_path()?;

        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|e| VaultError::Storage(format!("failed to create temporary file: {e}")))?;

        tmp_file.write_all(data)?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(VaultError::Storage(format!("atomic replace failed: {e}")));
        }

        sync_parent(&self.path)
    }

    /// Format: `filename.tmp.<randomhex>`
    fn random_tmp_path(&self) -> Result<PathBuf> {
        let mut buf = [0u8; 8];
        secure_random(&mut buf)?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| VaultError::Storage("storage path has no file name".into()))?
            .to_string_lossy();

        let tmp_name = format!("{}.tmp.{}", file_name, hex::encode(buf));

        Ok(self.path.with_file_name(tmp_name))
    }
}

/// Write a new file and flush it to the device before returning. Fails if
/// the file already exists.
pub fn write_durable(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| VaultError::Storage(format!("failed to create {}: {e}", path.display())))?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    sync_parent(path)
}

fn sync_parent(path: &Path) -> Result<()> {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[test]
    fn load_returns_written_data() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("store.json"));
        storage.save(b"hello world").unwrap();

        assert_eq!(storage.load().unwrap(), b"hello world");
    }

    #[test]
    fn load_fails_if_file_does_not_exist() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("missing.json"));

        assert!(matches!(storage.load(), Err(VaultError::Storage(_))));
    }

    #[test]
    fn json_roundtrip_and_missing_file() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Doc {
            name: String,
        }

        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("doc.json"));
        assert_eq!(storage.load_json::<Doc>().unwrap(), None);

        let doc = Doc { name: "a".into() };
        storage.save_json(&doc).unwrap();
        assert_eq!(storage.load_json::<Doc>().unwrap(), Some(doc));
    }

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let storage = Storage::new(path.clone());

        storage.save(b"first").unwrap();
        storage.save(b"second").unwrap();

        assert_eq!(fs::read(path).unwrap(), b"second");
    }

    #[test]
    fn tmp_file_is_removed_after_success() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("store.json"));
        storage.save(b"data").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        assert_eq!(entries, vec!["store.json"]);
    }

    #[test]
    fn tmp_names_are_unique_siblings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let storage = Storage::new(path.clone());

        let a = storage.random_tmp_path().unwrap();
        let b = storage.random_tmp_path().unwrap();

        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
    }

    #[test]
    fn parent_directory_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("store.json");

        Storage::new(nested.clone()).save(b"data").unwrap();

        assert!(nested.exists());
    }

    #[test]
    fn write_durable_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("item.json");

        write_durable(&path, b"one").unwrap();
        assert!(write_durable(&path, b"two").is_err());
        assert_eq!(fs::read(&path).unwrap(), b"one");
    }
}
