//! Removable drives: how they are probed, identified and classified.
//!
//! A [`DeviceBackend`] performs the raw block-device work. [`SystemDevices`]
//! shells out to the platform tools; [`SimulatedDevices`] keeps everything in
//! memory for tests and dry runs.

pub mod registry;
pub mod simulated;
pub mod system;

pub use registry::{DeviceRegistry, DriveLease};
pub use simulated::{SimOp, SimulatedDevices};
pub use system::SystemDevices;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix of every drive id.
pub const DRIVE_ID_PREFIX: &str = "drv-";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FilesystemState {
    Unformatted,
    PlainFilesystem,
    EncryptedLocked,
    EncryptedUnlocked,
    Mounted,
    /// An operation holds the drive, or one failed part way and the drive
    /// needs re-inspection.
    Busy,
}

impl fmt::Display for FilesystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilesystemState::Unformatted => "unformatted",
            FilesystemState::PlainFilesystem => "plain-filesystem",
            FilesystemState::EncryptedLocked => "encrypted-locked",
            FilesystemState::EncryptedUnlocked => "encrypted-unlocked",
            FilesystemState::Mounted => "mounted",
            FilesystemState::Busy => "busy",
        };
        f.write_str(name)
    }
}

/// Operator-assigned trust, ordered from least to most trusted.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum TrustLevel {
    #[default]
    Untrusted,
    Partial,
    Full,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Partial => "partial",
            TrustLevel::Full => "full",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = crate::error::VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "untrusted" => Ok(TrustLevel::Untrusted),
            "partial" => Ok(TrustLevel::Partial),
            "full" => Ok(TrustLevel::Full),
            other => Err(crate::error::VaultError::validation(format!(
                "unknown trust level: {other}"
            ))),
        }
    }
}

/// A removable drive as last seen by the registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    pub id: String,
    pub device_path: PathBuf,
    pub label: Option<String>,
    pub filesystem_state: FilesystemState,
    pub trust_level: TrustLevel,
    pub last_seen: DateTime<Utc>,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub size_bytes: u64,
    /// Data partition, once the drive has one.
    pub partition: Option<PathBuf>,
    /// Name of the open encrypted mapping, if unlocked.
    pub mapper: Option<String>,
    pub mount_point: Option<PathBuf>,
    /// Whether the drive was attached during the latest refresh.
    pub present: bool,
    /// `false` when the id was derived without a hardware serial and may not
    /// survive a re-plug into another port.
    pub identity_stable: bool,
}

/// What a probe found on the drive's data partition (or the raw device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSignature {
    Empty,
    Filesystem { fstype: String },
    EncryptedContainer,
}

/// Raw scan result for one removable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProbe {
    pub device_path: PathBuf,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub size_bytes: u64,
    pub label: Option<String>,
    pub partition: Option<PathBuf>,
    pub content: ContentSignature,
    pub mapper: Option<String>,
    pub mount_point: Option<PathBuf>,
}

impl DeviceProbe {
    /// Stable id for the drive, and whether it came from a hardware serial.
    pub fn drive_id(&self) -> (String, bool) {
        match self.serial.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(serial) => (hashed_id(&[serial.as_bytes()]), true),
            None => {
                let size = self.size_bytes.to_le_bytes();
                let path = self.device_path.to_string_lossy();
                let model = self.model.as_deref().unwrap_or_default();
                (
                    hashed_id(&[model.as_bytes(), &size, path.as_bytes()]),
                    false,
                )
            }
        }
    }

    pub fn classify(&self) -> FilesystemState {
        match (&self.content, &self.mapper, &self.mount_point) {
            (ContentSignature::Empty, _, _) => FilesystemState::Unformatted,
            (ContentSignature::Filesystem { .. }, _, Some(_)) => FilesystemState::Mounted,
            (ContentSignature::Filesystem { .. }, _, None) => FilesystemState::PlainFilesystem,
            (ContentSignature::EncryptedContainer, None, _) => FilesystemState::EncryptedLocked,
            (ContentSignature::EncryptedContainer, Some(_), Some(_)) => FilesystemState::Mounted,
            (ContentSignature::EncryptedContainer, Some(_), None) => {
                FilesystemState::EncryptedUnlocked
            }
        }
    }
}

fn hashed_id(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{DRIVE_ID_PREFIX}{}", &digest[..16])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    Normal,
    Force,
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Term,
    Kill,
}

/// Failure reported by a device backend. Never carries a password.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{program} exited with status {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container passphrase rejected")]
    AuthenticationFailed,

    #[error("unexpected device state: {0}")]
    Parse(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Raw block-device operations.
///
/// Each call is one attempt. Retrying with more force is decided by the
/// lifecycle manager, which also bounds every call with a timeout.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Enumerate attached removable devices.
    async fn scan(&self) -> BackendResult<Vec<DeviceProbe>>;

    /// Unmount every filesystem on `device`, its partitions and any
    /// container opened on them.
    async fn unmount(&self, device: &Path, mode: UnmountMode) -> BackendResult<()>;

    /// Process ids holding `device` or one of its partitions open.
    async fn holders(&self, device: &Path) -> BackendResult<Vec<u32>>;

    async fn kill_holders(&self, device: &Path, signal: KillSignal) -> BackendResult<()>;

    /// Erase filesystem, container and partition-table signatures.
    async fn wipe_signatures(&self, device: &Path, force: bool) -> BackendResult<()>;

    /// Write a fresh GPT with one partition spanning the device. Returns the
    /// partition path.
    async fn write_partition_table(&self, device: &Path, reread: bool) -> BackendResult<PathBuf>;

    async fn create_container(&self, partition: &Path, password: &str) -> BackendResult<()>;

    /// Open the container as `mapper`. Returns the path of the mapped device.
    async fn open_container(
        &self,
        partition: &Path,
        mapper: &str,
        password: &str,
    ) -> BackendResult<PathBuf>;

    async fn close_container(&self, mapper: &str) -> BackendResult<()>;

    async fn make_filesystem(&self, target: &Path, label: &str, force: bool) -> BackendResult<()>;

    async fn mount(&self, source: &Path, target: &Path) -> BackendResult<()>;

    /// Flush pending writes to all devices.
    async fn sync(&self) -> BackendResult<()>;
}

/// Path of an open mapping.
pub fn mapper_path(mapper: &str) -> PathBuf {
    Path::new("/dev/mapper").join(mapper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(serial: Option<&str>) -> DeviceProbe {
        DeviceProbe {
            device_path: PathBuf::from("/dev/sdb"),
            serial: serial.map(Into::into),
            model: Some("Cruzer".into()),
            size_bytes: 16_000_000_000,
            label: None,
            partition: None,
            content: ContentSignature::Empty,
            mapper: None,
            mount_point: None,
        }
    }

    #[test]
    fn serial_gives_stable_id_independent_of_path() {
        let a = probe(Some("4C530001"));
        let mut b = probe(Some("4C530001"));
        b.device_path = PathBuf::from("/dev/sdc");

        let (id_a, stable) = a.drive_id();
        assert!(stable);
        assert_eq!(id_a, b.drive_id().0);
        assert!(id_a.starts_with(DRIVE_ID_PREFIX));
        assert_eq!(id_a.len(), DRIVE_ID_PREFIX.len() + 16);
    }

    #[test]
    fn missing_serial_falls_back_to_unstable_id() {
        let a = probe(None);
        let mut b = probe(Some("  "));
        b.device_path = PathBuf::from("/dev/sdc");

        let (id_a, stable) = a.drive_id();
        assert!(!stable);
        assert_ne!(id_a, b.drive_id().0);
    }

    #[test]
    fn classification() {
        let mut p = probe(Some("s"));
        assert_eq!(p.classify(), FilesystemState::Unformatted);

        p.content = ContentSignature::Filesystem {
            fstype: "vfat".into(),
        };
        assert_eq!(p.classify(), FilesystemState::PlainFilesystem);
        p.mount_point = Some("/media/usb".into());
        assert_eq!(p.classify(), FilesystemState::Mounted);

        p.content = ContentSignature::EncryptedContainer;
        p.mount_point = None;
        assert_eq!(p.classify(), FilesystemState::EncryptedLocked);
        p.mapper = Some("coldvault-x".into());
        assert_eq!(p.classify(), FilesystemState::EncryptedUnlocked);
        p.mount_point = Some("/mnt/x".into());
        assert_eq!(p.classify(), FilesystemState::Mounted);
    }

    #[test]
    fn trust_levels_are_ordered() {
        assert!(TrustLevel::Untrusted < TrustLevel::Partial);
        assert!(TrustLevel::Partial < TrustLevel::Full);
        assert_eq!(TrustLevel::default(), TrustLevel::Untrusted);
        assert_eq!("FULL".parse::<TrustLevel>().unwrap(), TrustLevel::Full);
    }
}
