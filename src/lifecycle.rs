//! Drive state machine: format, encrypt, unlock, lock, mount, unmount.
//!
//! Every operation takes a [`DriveLease`] first, so two operations on one
//! drive never interleave. Destructive steps run in a fixed order; each is
//! retried with more force only within itself and a failed step aborts the
//! whole operation with the drive left `Busy` for re-inspection.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::crypto::{CryptoEngine, require_password};
use crate::device::{
    BackendError, DeviceBackend, DeviceRegistry, Drive, DriveLease, FilesystemState, KillSignal,
    TrustLevel, UnmountMode, mapper_path,
};
use crate::error::{Result, VaultError};

/// Filesystem label given to encrypted backup drives.
pub const DEFAULT_LABEL: &str = "COLDVAULT";
/// ext4 labels are limited to 16 bytes.
const MAX_LABEL_LEN: usize = 16;
const MAPPER_PREFIX: &str = "coldvault-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStep {
    Scan,
    Unmount,
    KillHolders,
    Wipe,
    Partition,
    CreateContainer,
    CreateFilesystem,
    CloseContainer,
    Unlock,
    Mount,
    Sync,
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleStep::Scan => "scan",
            LifecycleStep::Unmount => "unmount",
            LifecycleStep::KillHolders => "kill-holders",
            LifecycleStep::Wipe => "wipe",
            LifecycleStep::Partition => "partition",
            LifecycleStep::CreateContainer => "create-container",
            LifecycleStep::CreateFilesystem => "create-filesystem",
            LifecycleStep::CloseContainer => "close-container",
            LifecycleStep::Unlock => "unlock",
            LifecycleStep::Mount => "mount",
            LifecycleStep::Sync => "sync",
        };
        f.write_str(name)
    }
}

/// Mapping name used when coldvault opens a drive's container.
pub fn mapper_name(drive_id: &str) -> String {
    format!("{MAPPER_PREFIX}{drive_id}")
}

pub struct DriveLifecycleManager {
    registry: Arc<DeviceRegistry>,
    backend: Arc<dyn DeviceBackend>,
    engine: CryptoEngine,
    mount_root: PathBuf,
    timeout: Duration,
}

impl DriveLifecycleManager {
    pub fn new(registry: Arc<DeviceRegistry>, engine: CryptoEngine, mount_root: PathBuf) -> Self {
        Self {
            backend: registry.backend(),
            timeout: registry.timeout(),
            registry,
            engine,
            mount_root,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Where a drive is mounted by coldvault.
    pub fn mount_point_for(&self, drive_id: &str) -> PathBuf {
        self.mount_root.join(drive_id)
    }

    /// Destroy everything on the drive and leave it as a locked encrypted
    /// container holding an empty ext4 filesystem.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn format_and_encrypt(&self, drive_id: &str, password: &str) -> Result<Drive> {
        self.engine.check_password_policy(password)?;
        let lease = self.lease_for_format(drive_id)?;
        let drive = lease.drive().clone();
        info!("formatting drive with encryption");

        let partition = self.wipe_and_partition(&drive).await?;

        self.bounded(
            drive_id,
            LifecycleStep::CreateContainer,
            self.backend.create_container(&partition, password),
        )
        .await?;

        let mapper = mapper_name(drive_id);
        let mapped = self
            .bounded(
                drive_id,
                LifecycleStep::CreateFilesystem,
                self.backend.open_container(&partition, &mapper, password),
            )
            .await?;
        let backend = self.backend.as_ref();
        let target = mapped.as_path();
        self.escalate(
            drive_id,
            LifecycleStep::CreateFilesystem,
            &[false, true],
            |force| backend.make_filesystem(target, DEFAULT_LABEL, force),
        )
        .await?;

        self.bounded(
            drive_id,
            LifecycleStep::CloseContainer,
            self.backend.close_container(&mapper),
        )
        .await?;

        info!("drive formatted and locked");
        Ok(lease.complete(|d| {
            d.filesystem_state = FilesystemState::EncryptedLocked;
            d.partition = Some(partition);
            d.mapper = None;
            d.mount_point = None;
            d.label = Some(DEFAULT_LABEL.to_string());
        }))
    }

    /// Destroy everything on the drive and leave a plain ext4 filesystem.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn format_plain(&self, drive_id: &str, label: Option<&str>) -> Result<Drive> {
        let label = normalize_label(label)?;
        let lease = self.lease_for_format(drive_id)?;
        let drive = lease.drive().clone();
        info!("formatting drive without encryption");

        let partition = self.wipe_and_partition(&drive).await?;
        let backend = self.backend.as_ref();
        let (target, fs_label) = (partition.as_path(), label.as_str());
        self.escalate(
            drive_id,
            LifecycleStep::CreateFilesystem,
            &[false, true],
            |force| backend.make_filesystem(target, fs_label, force),
        )
        .await?;

        info!("drive formatted");
        Ok(lease.complete(|d| {
            d.filesystem_state = FilesystemState::PlainFilesystem;
            d.partition = Some(partition);
            d.mapper = None;
            d.mount_point = None;
            d.label = Some(label);
        }))
    }

    /// `EncryptedLocked -> EncryptedUnlocked`. A rejected password leaves the
    /// drive as it was.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn unlock(&self, drive_id: &str, password: &str) -> Result<Drive> {
        require_password(password)?;
        let lease = self.lease_in(drive_id, &[FilesystemState::EncryptedLocked], "unlock")?;
        let drive = lease.drive().clone();

        let partition = drive.partition.clone().unwrap_or(drive.device_path.clone());
        let mapper = mapper_name(drive_id);
        let result = self
            .bounded(
                drive_id,
                LifecycleStep::Unlock,
                self.backend.open_container(&partition, &mapper, password),
            )
            .await;

        match result {
            Ok(_) => {
                info!("drive unlocked");
                Ok(lease.complete(|d| {
                    d.filesystem_state = FilesystemState::EncryptedUnlocked;
                    d.mapper = Some(mapper);
                }))
            }
            // An open attempt that timed out may still complete.
            Err(err @ VaultError::Timeout { .. }) => Err(err),
            Err(err) => {
                warn!("unlock failed: {err}");
                lease.restore();
                Err(err)
            }
        }
    }

    /// Close the container. Unmounts first if needed; a locked drive is left
    /// alone.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn lock(&self, drive_id: &str) -> Result<Drive> {
        let current = self.registry.get(drive_id)?;
        if current.filesystem_state == FilesystemState::EncryptedLocked {
            return Ok(current);
        }

        let lease = self.lease_in(
            drive_id,
            &[FilesystemState::EncryptedUnlocked, FilesystemState::Mounted],
            "lock",
        )?;
        let drive = lease.drive().clone();
        let Some(mapper) = drive.mapper.clone() else {
            return Err(invalid_state(lease, "lock"));
        };

        if drive.mount_point.is_some() {
            self.unmount_step(&drive, &[UnmountMode::Normal, UnmountMode::Force])
                .await?;
        }
        self.bounded(
            drive_id,
            LifecycleStep::CloseContainer,
            self.backend.close_container(&mapper),
        )
        .await?;

        info!("drive locked");
        Ok(lease.complete(|d| {
            d.filesystem_state = FilesystemState::EncryptedLocked;
            d.mapper = None;
            d.mount_point = None;
        }))
    }

    /// Mount a plain or unlocked drive under the mount root. Mounting a
    /// mounted drive returns its current mount point.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn mount(&self, drive_id: &str) -> Result<PathBuf> {
        if let Some(existing) = self.current_mount(drive_id)? {
            return Ok(existing);
        }

        let lease = self.lease_in(
            drive_id,
            &[
                FilesystemState::PlainFilesystem,
                FilesystemState::EncryptedUnlocked,
            ],
            "mount",
        )?;
        let drive = lease.drive().clone();

        let source = match (&drive.mapper, &drive.partition) {
            (Some(mapper), _) => mapper_path(mapper),
            (None, Some(partition)) => partition.clone(),
            (None, None) => drive.device_path.clone(),
        };
        let target = self.mount_point_for(drive_id);

        self.bounded(
            drive_id,
            LifecycleStep::Mount,
            self.backend.mount(&source, &target),
        )
        .await?;

        info!(mount_point = %target.display(), "drive mounted");
        let mount_point = target.clone();
        lease.complete(|d| {
            d.filesystem_state = FilesystemState::Mounted;
            d.mount_point = Some(mount_point);
        });
        Ok(target)
    }

    /// Unmount the drive. Unmounting a drive that is not mounted succeeds.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn unmount(&self, drive_id: &str) -> Result<Drive> {
        let current = self.registry.get(drive_id)?;
        if current.filesystem_state != FilesystemState::Mounted {
            if current.filesystem_state == FilesystemState::Busy {
                return Err(VaultError::ResourceBusy {
                    drive_id: drive_id.to_string(),
                });
            }
            return Ok(current);
        }

        let lease = self.lease_in(drive_id, &[FilesystemState::Mounted], "unmount")?;
        let drive = lease.drive().clone();
        self.unmount_step(&drive, &[UnmountMode::Normal, UnmountMode::Force])
            .await?;

        info!("drive unmounted");
        Ok(lease.complete(|d| {
            d.filesystem_state = if d.mapper.is_some() {
                FilesystemState::EncryptedUnlocked
            } else {
                FilesystemState::PlainFilesystem
            };
            d.mount_point = None;
        }))
    }

    /// Unmount, lock and flush so the drive can be pulled.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn eject(&self, drive_id: &str) -> Result<Drive> {
        let mut drive = self.unmount(drive_id).await?;
        if drive.mapper.is_some() {
            drive = self.lock(drive_id).await?;
        }
        self.bounded(drive_id, LifecycleStep::Sync, self.backend.sync())
            .await?;
        info!("drive ready to remove");
        Ok(drive)
    }

    /// Bring the drive to `Mounted`, unlocking it with `password` if it is
    /// a locked container. Returns the mount point.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn prepare_for_backup(
        &self,
        drive_id: &str,
        password: Option<&str>,
    ) -> Result<PathBuf> {
        let drive = self.registry.get(drive_id)?;
        match drive.filesystem_state {
            FilesystemState::Mounted
            | FilesystemState::PlainFilesystem
            | FilesystemState::EncryptedUnlocked => self.mount(drive_id).await,
            FilesystemState::EncryptedLocked => {
                let password = password.ok_or_else(|| {
                    VaultError::validation("drive password is required to unlock the drive")
                })?;
                self.unlock(drive_id, password).await?;
                self.mount(drive_id).await
            }
            FilesystemState::Busy => Err(VaultError::ResourceBusy {
                drive_id: drive_id.to_string(),
            }),
            state @ FilesystemState::Unformatted => Err(VaultError::InvalidState {
                drive_id: drive_id.to_string(),
                state,
                operation: "back up to",
            }),
        }
    }

    // ---------------------------------------------------------------

    fn lease_for_format(&self, drive_id: &str) -> Result<DriveLease> {
        let drive = self.registry.get(drive_id)?;
        require_trust(&drive, TrustLevel::Partial)?;
        self.registry.try_lease(drive_id)
    }

    fn lease_in(
        &self,
        drive_id: &str,
        allowed: &[FilesystemState],
        operation: &'static str,
    ) -> Result<DriveLease> {
        let lease = self.registry.try_lease(drive_id)?;
        if !allowed.contains(&lease.drive().filesystem_state) {
            return Err(invalid_state(lease, operation));
        }
        Ok(lease)
    }

    fn current_mount(&self, drive_id: &str) -> Result<Option<PathBuf>> {
        let drive = self.registry.get(drive_id)?;
        Ok(match drive.filesystem_state {
            FilesystemState::Mounted => drive.mount_point,
            _ => None,
        })
    }

    /// Steps 1 to 4 of a format: unmount, kill holders, wipe, partition.
    async fn wipe_and_partition(&self, drive: &Drive) -> Result<PathBuf> {
        let id = drive.id.as_str();
        let device = drive.device_path.as_path();
        let backend = self.backend.as_ref();

        self.unmount_step(
            drive,
            &[UnmountMode::Normal, UnmountMode::Force, UnmountMode::Lazy],
        )
        .await?;
        if let Some(mapper) = &drive.mapper {
            self.bounded(
                id,
                LifecycleStep::Unmount,
                backend.close_container(mapper),
            )
            .await?;
        }
        self.kill_holders_step(drive).await?;
        self.escalate(id, LifecycleStep::Wipe, &[false, true], |force| {
            backend.wipe_signatures(device, force)
        })
        .await?;
        self.escalate(id, LifecycleStep::Partition, &[false, true], |reread| {
            backend.write_partition_table(device, reread)
        })
        .await
    }

    async fn unmount_step(&self, drive: &Drive, modes: &[UnmountMode]) -> Result<()> {
        let device = drive.device_path.as_path();
        let backend = self.backend.as_ref();
        self.escalate(&drive.id, LifecycleStep::Unmount, modes, |mode| {
            backend.unmount(device, mode)
        })
        .await
    }

    async fn kill_holders_step(&self, drive: &Drive) -> Result<()> {
        let id = drive.id.as_str();
        let device = drive.device_path.as_path();
        let step = LifecycleStep::KillHolders;

        let mut holders = self.bounded(id, step, self.backend.holders(device)).await?;
        for signal in [KillSignal::Term, KillSignal::Kill] {
            if holders.is_empty() {
                return Ok(());
            }
            warn!(
                drive_id = id,
                count = holders.len(),
                ?signal,
                "terminating processes holding the drive"
            );
            self.bounded(id, step, self.backend.kill_holders(device, signal))
                .await?;
            holders = self.bounded(id, step, self.backend.holders(device)).await?;
        }

        if holders.is_empty() {
            Ok(())
        } else {
            Err(VaultError::Device {
                drive_id: id.to_string(),
                step,
                reason: format!("{} process(es) still hold the device", holders.len()),
            })
        }
    }

    /// Run one backend call under the device timeout.
    async fn bounded<T>(
        &self,
        drive_id: &str,
        step: LifecycleStep,
        call: impl Future<Output = std::result::Result<T, BackendError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                warn!(drive_id, %step, "device operation timed out");
                Err(VaultError::Timeout {
                    drive_id: drive_id.to_string(),
                    step,
                })
            }
            Ok(Err(BackendError::AuthenticationFailed)) => Err(VaultError::AuthenticationFailed),
            Ok(Err(err)) => Err(VaultError::Device {
                drive_id: drive_id.to_string(),
                step,
                reason: err.to_string(),
            }),
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Try `attempt` with each mode in turn until one succeeds. Timeouts and
    /// rejected passwords are not retried.
    async fn escalate<M, T, F, Fut>(
        &self,
        drive_id: &str,
        step: LifecycleStep,
        modes: &[M],
        mut attempt: F,
    ) -> Result<T>
    where
        M: Copy + fmt::Debug,
        F: FnMut(M) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let mut last = None;
        for &mode in modes {
            match self.bounded(drive_id, step, attempt(mode)).await {
                Ok(value) => return Ok(value),
                Err(err @ (VaultError::Timeout { .. } | VaultError::AuthenticationFailed)) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(drive_id, %step, ?mode, "attempt failed: {err}");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| VaultError::Device {
            drive_id: drive_id.to_string(),
            step,
            reason: "no attempt was made".into(),
        }))
    }
}

pub(crate) fn require_trust(drive: &Drive, required: TrustLevel) -> Result<()> {
    if drive.trust_level < required {
        return Err(VaultError::TrustRequired {
            drive_id: drive.id.clone(),
            required,
            actual: drive.trust_level,
        });
    }
    Ok(())
}

/// Release a lease taken on a drive in the wrong state.
fn invalid_state(lease: DriveLease, operation: &'static str) -> VaultError {
    let drive = lease.restore();
    VaultError::InvalidState {
        drive_id: drive.id,
        state: drive.filesystem_state,
        operation,
    }
}

fn normalize_label(label: Option<&str>) -> Result<String> {
    let label = label.map(str::trim).unwrap_or(DEFAULT_LABEL);
    if label.is_empty() {
        return Err(VaultError::validation("label must not be empty"));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(VaultError::validation(
            "label may only contain ASCII letters, digits, '-' and '_'",
        ));
    }
    let mut label = label.to_string();
    label.truncate(MAX_LABEL_LEN);
    Ok(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn step_names() {
        assert_eq!(LifecycleStep::KillHolders.to_string(), "kill-holders");
        assert_eq!(LifecycleStep::CreateContainer.to_string(), "create-container");
        assert_eq!(LifecycleStep::CloseContainer.to_string(), "close-container");
    }

    #[test]
    fn labels_are_checked_and_truncated() {
        assert_eq!(normalize_label(None).unwrap(), DEFAULT_LABEL);
        assert_eq!(
            normalize_label(Some("a-very-long-label-indeed")).unwrap(),
            "a-very-long-labe"
        );
        assert!(normalize_label(Some(" ")).is_err());
        assert!(normalize_label(Some("bad/label")).is_err());
    }

    #[test]
    fn mapper_names_carry_the_drive_id() {
        assert_eq!(mapper_name("drv-01"), "coldvault-drv-01");
        assert_eq!(
            mapper_path(&mapper_name("drv-01")),
            Path::new("/dev/mapper/coldvault-drv-01")
        );
    }
}
