use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoEngine, KdfParams, MIN_PASSWORD_LEN};
use crate::error::{Result, VaultError};

pub const STORE_FILE: &str = "store.json";
pub const TRUST_TABLE_FILE: &str = "drives.json";

/// User-level configuration loaded from `<config dir>/coldvault/config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Directory of the secret store and the drive trust table.
    pub data_dir: Option<PathBuf>,
    /// Drives are mounted below this directory, one subdirectory per drive.
    pub mount_root: Option<PathBuf>,
    pub kdf: KdfConfig,
    pub min_password_length: usize,
    pub device_timeout_secs: u64,
    pub refresh_staleness_secs: u64,
    /// Prefixed to every device tool invocation, e.g. `sudo`.
    pub privilege_command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            mount_root: None,
            kdf: KdfConfig::default(),
            min_password_length: MIN_PASSWORD_LEN,
            device_timeout_secs: 120,
            refresh_staleness_secs: 30,
            privilege_command: None,
        }
    }
}

/// Argon2id cost for newly sealed envelopes. Existing envelopes keep the
/// cost they were sealed with.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct KdfConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        let kdf = KdfParams::default();
        Self {
            memory_kib: kdf.mem_cost_kib(),
            iterations: kdf.time_cost(),
            parallelism: kdf.parallelism(),
        }
    }
}

impl Config {
    pub fn engine(&self) -> Result<CryptoEngine> {
        let kdf = KdfParams::new(
            self.kdf.memory_kib,
            self.kdf.iterations,
            self.kdf.parallelism,
        )?;
        CryptoEngine::new(kdf, self.min_password_length)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }

    pub fn mount_root(&self) -> Result<PathBuf> {
        match &self.mount_root {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("mnt")),
        }
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(STORE_FILE))
    }

    pub fn trust_table_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(TRUST_TABLE_FILE))
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn refresh_staleness(&self) -> Duration {
        Duration::from_secs(self.refresh_staleness_secs)
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    load_from_path(default_path()?)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = toml::from_str(&contents)
        .map_err(|e| VaultError::validation(format!("invalid config {}: {e}", path.display())))?;
    if config.device_timeout_secs == 0 {
        return Err(VaultError::validation("device_timeout_secs must be positive"));
    }
    Ok(config)
}

pub fn default_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "coldvault")
        .ok_or_else(|| VaultError::Storage("could not determine platform directories".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn empty_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write");

        assert_eq!(load_from_path(&path).expect("load"), Config::default());
    }

    #[test]
    fn parses_partial_config() {
        let contents = r#"
            data_dir = "/tmp/coldvault-data"
            device_timeout_secs = 30
            privilege_command = "sudo"
            [kdf]
            memory_kib = 1024
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/tmp/coldvault-data")));
        assert_eq!(cfg.device_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.privilege_command.as_deref(), Some("sudo"));
        assert_eq!(cfg.kdf.memory_kib, 1024);
        assert_eq!(cfg.kdf.iterations, KdfConfig::default().iterations);
        assert_eq!(cfg.min_password_length, MIN_PASSWORD_LEN);
        assert_eq!(
            cfg.store_path().expect("store path"),
            PathBuf::from("/tmp/coldvault-data/store.json")
        );
        assert_eq!(
            cfg.mount_root().expect("mount root"),
            PathBuf::from("/tmp/coldvault-data/mnt")
        );
    }

    #[test]
    fn rejects_malformed_and_zero_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        fs::write(&path, "device_timeout_secs = \"soon\"").expect("write");
        assert!(load_from_path(&path).is_err());

        fs::write(&path, "device_timeout_secs = 0").expect("write");
        assert!(load_from_path(&path).is_err());
    }

    #[test]
    fn engine_uses_configured_cost() {
        let cfg = Config {
            kdf: KdfConfig {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            min_password_length: 12,
            ..Config::default()
        };

        let engine = cfg.engine().expect("engine");
        assert_eq!(engine.kdf().mem_cost_kib(), 64);
        assert_eq!(engine.min_password_len(), 12);
        assert!(engine.check_password_policy("short-pw").is_err());
    }
}
