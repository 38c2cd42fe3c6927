//! In-memory device backend.
//!
//! Each simulated drive keeps its files in a scratch directory that is moved
//! to the mount point on `mount` and back on `unmount`, so data written
//! through a mount survives lock/unlock cycles the way it would on real
//! media. Failures, delays and stubborn holder processes can be injected per
//! drive.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    BackendError, BackendResult, ContentSignature, DeviceBackend, DeviceProbe, KillSignal,
    UnmountMode, mapper_path,
};
use crate::crypto::{CryptoEngine, EncryptionEnvelope, KdfParams};
use crate::error::Result;

const SIM_SIZE_BYTES: u64 = 32 * 1024 * 1024 * 1024;

/// Backend operations that failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Scan,
    Unmount,
    KillHolders,
    Wipe,
    Partition,
    CreateContainer,
    OpenContainer,
    CloseContainer,
    MakeFilesystem,
    Mount,
}

impl SimOp {
    fn program(self) -> &'static str {
        match self {
            SimOp::Scan => "lsblk",
            SimOp::Unmount => "umount",
            SimOp::KillHolders => "fuser",
            SimOp::Wipe => "wipefs",
            SimOp::Partition => "parted",
            SimOp::CreateContainer | SimOp::OpenContainer | SimOp::CloseContainer => "cryptsetup",
            SimOp::MakeFilesystem => "mkfs.ext4",
            SimOp::Mount => "mount",
        }
    }
}

enum Media {
    Blank,
    Plain { fstype: String },
    Container {
        canary: EncryptionEnvelope,
        formatted: bool,
    },
}

struct SimDevice {
    serial: Option<String>,
    size_bytes: u64,
    label: Option<String>,
    partition: Option<PathBuf>,
    media: Media,
    mapper: Option<String>,
    mount_point: Option<PathBuf>,
    holders: Vec<u32>,
    stubborn_holders: bool,
    failures: HashMap<SimOp, usize>,
    data_dir: PathBuf,
}

impl SimDevice {
    fn matches(&self, device_path: &Path, path: &Path) -> bool {
        device_path == path
            || self.partition.as_deref() == Some(path)
            || self.mapper.as_deref().map(mapper_path).as_deref() == Some(path)
    }

    /// Consume one injected failure for `op`, if any.
    fn injected(&mut self, op: SimOp) -> BackendResult<()> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                Err(command_error(op, "injected failure"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct SimState {
    devices: BTreeMap<PathBuf, SimDevice>,
    delay: Duration,
    journal: Vec<String>,
}

impl SimState {
    fn device(&mut self, path: &Path) -> BackendResult<(&PathBuf, &mut SimDevice)> {
        self.devices
            .iter_mut()
            .find(|(device_path, dev)| dev.matches(device_path, path))
            .ok_or_else(|| BackendError::Parse(format!("no such device: {}", path.display())))
    }
}

fn command_error(op: SimOp, stderr: &str) -> BackendError {
    BackendError::Command {
        program: op.program().to_string(),
        code: Some(1),
        stderr: stderr.to_string(),
    }
}

/// Removable media simulated in memory, backed by scratch directories.
pub struct SimulatedDevices {
    root: PathBuf,
    engine: CryptoEngine,
    state: Mutex<SimState>,
}

impl fmt::Debug for SimulatedDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDevices")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl SimulatedDevices {
    /// Drive contents live under `root`, which must be on the same
    /// filesystem as the mount root.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            engine: CryptoEngine::new(KdfParams::new(64, 1, 1)?, 1)?,
            state: Mutex::new(SimState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug in a blank drive.
    pub fn attach(&self, device_path: impl Into<PathBuf>, serial: Option<&str>) -> Result<()> {
        self.insert(device_path.into(), serial, Media::Blank, None)
    }

    /// Plug in a drive that already carries a plain filesystem.
    pub fn attach_plain(
        &self,
        device_path: impl Into<PathBuf>,
        serial: Option<&str>,
        fstype: &str,
        label: &str,
    ) -> Result<()> {
        let device_path = device_path.into();
        let media = Media::Plain {
            fstype: fstype.to_string(),
        };
        self.insert(device_path, serial, media, Some(label.to_string()))
    }

    fn insert(
        &self,
        device_path: PathBuf,
        serial: Option<&str>,
        media: Media,
        label: Option<String>,
    ) -> Result<()> {
        let name = device_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "device".into());
        let data_dir = self.root.join(name);
        fs::create_dir_all(&data_dir)?;

        let partition = match media {
            Media::Blank => None,
            _ => Some(partition_path(&device_path)),
        };

        self.lock().devices.insert(
            device_path,
            SimDevice {
                serial: serial.map(Into::into),
                size_bytes: SIM_SIZE_BYTES,
                label,
                partition,
                media,
                mapper: None,
                mount_point: None,
                holders: Vec::new(),
                stubborn_holders: false,
                failures: HashMap::new(),
                data_dir,
            },
        );
        Ok(())
    }

    /// Unplug a drive. Its contents stay in the scratch directory.
    pub fn detach(&self, device_path: impl AsRef<Path>) {
        self.lock().devices.remove(device_path.as_ref());
    }

    /// Make the next `times` calls of `op` on the drive fail.
    pub fn fail_times(&self, device_path: impl AsRef<Path>, op: SimOp, times: usize) {
        if let Some(dev) = self.lock().devices.get_mut(device_path.as_ref()) {
            dev.failures.insert(op, times);
        }
    }

    /// Make every call of `op` on the drive fail.
    pub fn fail(&self, device_path: impl AsRef<Path>, op: SimOp) {
        self.fail_times(device_path, op, usize::MAX);
    }

    /// Pretend `pids` hold the drive open. Stubborn holders ignore SIGTERM.
    pub fn set_holders(&self, device_path: impl AsRef<Path>, pids: Vec<u32>, stubborn: bool) {
        if let Some(dev) = self.lock().devices.get_mut(device_path.as_ref()) {
            dev.holders = pids;
            dev.stubborn_holders = stubborn;
        }
    }

    /// Delay applied to every operation.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Operations performed so far, e.g. `unmount:force` or `wipe`.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    async fn pause(&self) {
        let delay = self.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn partition_path(device: &Path) -> PathBuf {
    let mut name = device.as_os_str().to_owned();
    name.push("1");
    PathBuf::from(name)
}

fn clear_dir(dir: &Path) -> BackendResult<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

#[async_trait]
impl DeviceBackend for SimulatedDevices {
    async fn scan(&self) -> BackendResult<Vec<DeviceProbe>> {
        self.pause().await;
        let state = self.lock();

        let mut probes = Vec::new();
        for (path, dev) in &state.devices {
            if dev.failures.get(&SimOp::Scan).is_some_and(|n| *n > 0) {
                return Err(command_error(SimOp::Scan, "injected failure"));
            }
            let content = match &dev.media {
                Media::Blank => ContentSignature::Empty,
                Media::Plain { fstype } => ContentSignature::Filesystem {
                    fstype: fstype.clone(),
                },
                Media::Container { .. } => ContentSignature::EncryptedContainer,
            };
            probes.push(DeviceProbe {
                device_path: path.clone(),
                serial: dev.serial.clone(),
                model: Some("Simulated USB".into()),
                size_bytes: dev.size_bytes,
                label: dev.label.clone(),
                partition: dev.partition.clone(),
                content,
                mapper: dev.mapper.clone(),
                mount_point: dev.mount_point.clone(),
            });
        }
        Ok(probes)
    }

    async fn unmount(&self, device: &Path, mode: UnmountMode) -> BackendResult<()> {
        self.pause().await;
        let mut state = self.lock();
        state
            .journal
            .push(format!("unmount:{}", format!("{mode:?}").to_lowercase()));
        let (_, dev) = state.device(device)?;
        dev.injected(SimOp::Unmount)?;

        if let Some(target) = dev.mount_point.take() {
            fs::rename(&target, &dev.data_dir)?;
        }
        Ok(())
    }

    async fn holders(&self, device: &Path) -> BackendResult<Vec<u32>> {
        self.pause().await;
        let mut state = self.lock();
        let (_, dev) = state.device(device)?;
        Ok(dev.holders.clone())
    }

    async fn kill_holders(&self, device: &Path, signal: KillSignal) -> BackendResult<()> {
        self.pause().await;
        let mut state = self.lock();
        state
            .journal
            .push(format!("kill-holders:{}", format!("{signal:?}").to_lowercase()));
        let (_, dev) = state.device(device)?;
        dev.injected(SimOp::KillHolders)?;

        if signal == KillSignal::Kill || !dev.stubborn_holders {
            dev.holders.clear();
        }
        Ok(())
    }

    async fn wipe_signatures(&self, device: &Path, force: bool) -> BackendResult<()> {
        self.pause().await;
        let mut state = self.lock();
        state
            .journal
            .push(if force { "wipe:force" } else { "wipe" }.to_string());
        let (_, dev) = state.device(device)?;
        dev.injected(SimOp::Wipe)?;

        if dev.mount_point.is_some() || dev.mapper.is_some() {
            return Err(command_error(SimOp::Wipe, "device or resource busy"));
        }
        dev.media = Media::Blank;
        dev.partition = None;
        dev.label = None;
        clear_dir(&dev.data_dir)
    }

    async fn write_partition_table(&self, device: &Path, reread: bool) -> BackendResult<PathBuf> {
        self.pause().await;
        let mut state = self.lock();
        state
            .journal
            .push(if reread { "partition:reread" } else { "partition" }.to_string());
        let (path, dev) = state.device(device)?;
        let partition = partition_path(path);
        dev.injected(SimOp::Partition)?;

        dev.media = Media::Blank;
        dev.partition = Some(partition.clone());
        Ok(partition)
    }

    async fn create_container(&self, partition: &Path, password: &str) -> BackendResult<()> {
        self.pause().await;
        let canary = self
            .engine
            .seal_canary(password)
            .map_err(|err| BackendError::Parse(err.to_string()))?;

        let mut state = self.lock();
        state.journal.push("create-container".into());
        let (_, dev) = state.device(partition)?;
        dev.injected(SimOp::CreateContainer)?;

        dev.media = Media::Container {
            canary,
            formatted: false,
        };
        clear_dir(&dev.data_dir)
    }

    async fn open_container(
        &self,
        partition: &Path,
        mapper: &str,
        password: &str,
    ) -> BackendResult<PathBuf> {
        self.pause().await;
        let canary = {
            let mut state = self.lock();
            state.journal.push("open-container".into());
            let (_, dev) = state.device(partition)?;
            dev.injected(SimOp::OpenContainer)?;
            match &dev.media {
                Media::Container { canary, .. } => canary.clone(),
                _ => {
                    return Err(command_error(
                        SimOp::OpenContainer,
                        "device is not a valid LUKS device",
                    ));
                }
            }
        };

        if !self.engine.verify_password(&canary, password) {
            return Err(BackendError::AuthenticationFailed);
        }

        let mut state = self.lock();
        let (_, dev) = state.device(partition)?;
        dev.mapper = Some(mapper.to_string());
        Ok(mapper_path(mapper))
    }

    async fn close_container(&self, mapper: &str) -> BackendResult<()> {
        self.pause().await;
        let mut state = self.lock();
        state.journal.push("close-container".into());
        let (_, dev) = state.device(&mapper_path(mapper))?;
        dev.injected(SimOp::CloseContainer)?;

        if dev.mount_point.is_some() {
            return Err(command_error(SimOp::CloseContainer, "device is still in use"));
        }
        dev.mapper = None;
        Ok(())
    }

    async fn make_filesystem(&self, target: &Path, label: &str, force: bool) -> BackendResult<()> {
        self.pause().await;
        let mut state = self.lock();
        state.journal.push(
            if force {
                "make-filesystem:force"
            } else {
                "make-filesystem"
            }
            .to_string(),
        );
        let (_, dev) = state.device(target)?;
        dev.injected(SimOp::MakeFilesystem)?;

        let on_mapper = dev.mapper.as_deref().map(mapper_path).as_deref() == Some(target);
        match &mut dev.media {
            Media::Container { formatted, .. } if on_mapper => {
                if *formatted && !force {
                    return Err(command_error(
                        SimOp::MakeFilesystem,
                        "contains an ext4 file system",
                    ));
                }
                *formatted = true;
            }
            Media::Container { .. } => {
                return Err(command_error(
                    SimOp::MakeFilesystem,
                    "refusing to format a locked container",
                ));
            }
            Media::Plain { .. } if !force => {
                return Err(command_error(
                    SimOp::MakeFilesystem,
                    "contains an existing file system",
                ));
            }
            media => {
                *media = Media::Plain {
                    fstype: "ext4".into(),
                };
            }
        }
        dev.label = Some(label.to_string());
        clear_dir(&dev.data_dir)
    }

    async fn mount(&self, source: &Path, target: &Path) -> BackendResult<()> {
        self.pause().await;
        let mut state = self.lock();
        state.journal.push("mount".into());
        let (_, dev) = state.device(source)?;
        dev.injected(SimOp::Mount)?;

        let mountable = match &dev.media {
            Media::Plain { .. } => true,
            Media::Container { formatted, .. } => *formatted && dev.mapper.is_some(),
            Media::Blank => false,
        };
        if !mountable {
            return Err(command_error(SimOp::Mount, "wrong fs type or bad superblock"));
        }
        if dev.mount_point.is_some() {
            return Err(command_error(SimOp::Mount, "already mounted"));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.exists() {
            fs::remove_dir(target)?;
        }
        fs::rename(&dev.data_dir, target)?;
        dev.mount_point = Some(target.to_path_buf());
        Ok(())
    }

    async fn sync(&self) -> BackendResult<()> {
        self.pause().await;
        self.lock().journal.push("sync".into());
        Ok(())
    }
}
