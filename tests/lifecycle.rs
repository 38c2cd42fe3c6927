use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use coldvault::device::SimOp;
use coldvault::{
    CryptoEngine, DeviceRegistry, DriveLifecycleManager, ErrorKind, FilesystemState, KdfParams,
    LifecycleStep, SimulatedDevices, Storage, TrustLevel, VaultError,
};
use tempfile::{TempDir, tempdir};

const DEVICE: &str = "/dev/sdb";
const DRIVE_PW: &str = "drive-password";

struct Rig {
    _dir: TempDir,
    sim: Arc<SimulatedDevices>,
    registry: Arc<DeviceRegistry>,
    lifecycle: Arc<DriveLifecycleManager>,
    drive_id: String,
}

async fn rig_with_timeout(timeout: Duration) -> Rig {
    let dir = tempdir().unwrap();
    let sim = Arc::new(SimulatedDevices::new(dir.path().join("media")).unwrap());
    sim.attach(DEVICE, Some("SIM-SERIAL-1")).unwrap();

    let registry = Arc::new(
        DeviceRegistry::open(
            sim.clone(),
            Storage::new(dir.path().join("drives.json")),
            timeout,
        )
        .unwrap(),
    );
    let drives = registry.refresh().await.unwrap();
    let drive_id = drives[0].id.clone();

    let engine = CryptoEngine::new(KdfParams::new(64, 1, 1).unwrap(), 8).unwrap();
    let lifecycle = Arc::new(DriveLifecycleManager::new(
        Arc::clone(&registry),
        engine,
        dir.path().join("mnt"),
    ));

    Rig {
        _dir: dir,
        sim,
        registry,
        lifecycle,
        drive_id,
    }
}

async fn rig() -> Rig {
    rig_with_timeout(Duration::from_secs(5)).await
}

async fn trusted_rig() -> Rig {
    let rig = rig().await;
    rig.registry
        .set_trust_level(&rig.drive_id, TrustLevel::Partial)
        .unwrap();
    rig
}

fn state(rig: &Rig) -> FilesystemState {
    rig.registry.get(&rig.drive_id).unwrap().filesystem_state
}

#[tokio::test]
async fn new_drive_is_untrusted_and_unformatted() {
    let rig = rig().await;
    let drive = rig.registry.get(&rig.drive_id).unwrap();

    assert_eq!(drive.trust_level, TrustLevel::Untrusted);
    assert_eq!(drive.filesystem_state, FilesystemState::Unformatted);
    assert!(drive.present);
    assert!(drive.identity_stable);
}

#[tokio::test]
async fn drive_identity_follows_the_serial_not_the_path() {
    let rig = trusted_rig().await;

    rig.sim.detach(DEVICE);
    rig.sim.attach("/dev/sdc", Some("SIM-SERIAL-1")).unwrap();
    let drives = rig.registry.refresh().await.unwrap();

    assert_eq!(drives.len(), 1);
    assert_eq!(drives[0].id, rig.drive_id);
    assert_eq!(drives[0].device_path, Path::new("/dev/sdc"));
    assert_eq!(drives[0].trust_level, TrustLevel::Partial);
}

#[tokio::test]
async fn format_runs_steps_in_order() {
    let rig = trusted_rig().await;

    let drive = rig
        .lifecycle
        .format_and_encrypt(&rig.drive_id, DRIVE_PW)
        .await
        .unwrap();

    assert_eq!(drive.filesystem_state, FilesystemState::EncryptedLocked);
    assert_eq!(state(&rig), FilesystemState::EncryptedLocked);
    assert_eq!(
        rig.sim.journal(),
        vec![
            "unmount:normal",
            "wipe",
            "partition",
            "create-container",
            "open-container",
            "make-filesystem",
            "close-container",
        ]
    );
}

#[tokio::test]
async fn format_without_password_is_rejected_before_touching_the_drive() {
    let rig = trusted_rig().await;

    let err = rig
        .lifecycle
        .format_and_encrypt(&rig.drive_id, "")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(rig.sim.journal().is_empty());
    assert_eq!(state(&rig), FilesystemState::Unformatted);
}

#[tokio::test]
async fn format_needs_partial_trust() {
    let rig = rig().await;

    let err = rig
        .lifecycle
        .format_and_encrypt(&rig.drive_id, DRIVE_PW)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        VaultError::TrustRequired {
            required: TrustLevel::Partial,
            actual: TrustLevel::Untrusted,
            ..
        }
    ));
    assert!(rig.sim.journal().is_empty());
}

#[tokio::test]
async fn wipe_is_retried_with_force() {
    let rig = trusted_rig().await;
    rig.sim.fail_times(DEVICE, SimOp::Wipe, 1);

    rig.lifecycle
        .format_and_encrypt(&rig.drive_id, DRIVE_PW)
        .await
        .unwrap();

    let journal = rig.sim.journal();
    assert_eq!(&journal[1..3], ["wipe", "wipe:force"]);
}

#[tokio::test]
async fn failed_step_is_named_and_leaves_drive_busy() {
    let rig = trusted_rig().await;
    rig.sim.fail(DEVICE, SimOp::Wipe);

    let err = rig
        .lifecycle
        .format_and_encrypt(&rig.drive_id, DRIVE_PW)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        VaultError::Device {
            step: LifecycleStep::Wipe,
            ..
        }
    ));
    assert!(err.to_string().contains("wipe"));
    assert!(!rig.sim.journal().contains(&"partition".to_string()));
    assert_eq!(state(&rig), FilesystemState::Busy);
}

#[tokio::test]
async fn holders_are_terminated_then_killed() {
    let rig = trusted_rig().await;
    rig.sim.set_holders(DEVICE, vec![4242], true);

    rig.lifecycle
        .format_and_encrypt(&rig.drive_id, DRIVE_PW)
        .await
        .unwrap();

    let journal = rig.sim.journal();
    assert!(journal.contains(&"kill-holders:term".to_string()));
    assert!(journal.contains(&"kill-holders:kill".to_string()));
}

#[tokio::test]
async fn cooperative_holders_only_get_sigterm() {
    let rig = trusted_rig().await;
    rig.sim.set_holders(DEVICE, vec![4242], false);

    rig.lifecycle
        .format_and_encrypt(&rig.drive_id, DRIVE_PW)
        .await
        .unwrap();

    let journal = rig.sim.journal();
    assert!(journal.contains(&"kill-holders:term".to_string()));
    assert!(!journal.contains(&"kill-holders:kill".to_string()));
}

#[tokio::test]
async fn concurrent_format_is_rejected_as_busy() {
    let rig = trusted_rig().await;
    rig.sim.set_delay(Duration::from_millis(30));

    let lifecycle = Arc::clone(&rig.lifecycle);
    let drive_id = rig.drive_id.clone();
    let first =
        tokio::spawn(async move { lifecycle.format_and_encrypt(&drive_id, DRIVE_PW).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = rig
        .lifecycle
        .format_and_encrypt(&rig.drive_id, "other-password")
        .await
        .unwrap_err();
    assert_eq!(second.kind(), ErrorKind::ResourceBusy);

    let drive = first.await.unwrap().unwrap();
    assert_eq!(drive.filesystem_state, FilesystemState::EncryptedLocked);
    assert_eq!(
        rig.sim
            .journal()
            .iter()
            .filter(|op| op.as_str() == "create-container")
            .count(),
        1
    );
}

#[tokio::test]
async fn wrong_password_keeps_drive_locked() {
    let rig = trusted_rig().await;
    rig.lifecycle
        .format_and_encrypt(&rig.drive_id, DRIVE_PW)
        .await
        .unwrap();

    let err = rig
        .lifecycle
        .unlock(&rig.drive_id, "wrong-password")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    assert_eq!(state(&rig), FilesystemState::EncryptedLocked);
}

#[tokio::test]
async fn unlock_mount_unmount_lock() {
    let rig = trusted_rig().await;
    let id = rig.drive_id.as_str();
    rig.lifecycle.format_and_encrypt(id, DRIVE_PW).await.unwrap();

    let drive = rig.lifecycle.unlock(id, DRIVE_PW).await.unwrap();
    assert_eq!(drive.filesystem_state, FilesystemState::EncryptedUnlocked);
    assert!(drive.mapper.is_some());

    let mount_point = rig.lifecycle.mount(id).await.unwrap();
    assert_eq!(mount_point, rig.lifecycle.mount_point_for(id));
    assert!(mount_point.is_dir());
    assert_eq!(rig.lifecycle.mount(id).await.unwrap(), mount_point);
    assert_eq!(state(&rig), FilesystemState::Mounted);

    let drive = rig.lifecycle.unmount(id).await.unwrap();
    assert_eq!(drive.filesystem_state, FilesystemState::EncryptedUnlocked);
    let again = rig.lifecycle.unmount(id).await.unwrap();
    assert_eq!(again.filesystem_state, FilesystemState::EncryptedUnlocked);

    let drive = rig.lifecycle.lock(id).await.unwrap();
    assert_eq!(drive.filesystem_state, FilesystemState::EncryptedLocked);
    assert!(drive.mapper.is_none());
}

#[tokio::test]
async fn eject_unmounts_locks_and_syncs() {
    let rig = trusted_rig().await;
    let id = rig.drive_id.as_str();
    rig.lifecycle.format_and_encrypt(id, DRIVE_PW).await.unwrap();
    rig.lifecycle.unlock(id, DRIVE_PW).await.unwrap();
    rig.lifecycle.mount(id).await.unwrap();

    let drive = rig.lifecycle.eject(id).await.unwrap();

    assert_eq!(drive.filesystem_state, FilesystemState::EncryptedLocked);
    assert_eq!(rig.sim.journal().last().map(String::as_str), Some("sync"));
}

#[tokio::test]
async fn mount_of_locked_drive_is_invalid_state() {
    let rig = trusted_rig().await;
    let id = rig.drive_id.as_str();
    rig.lifecycle.format_and_encrypt(id, DRIVE_PW).await.unwrap();

    let err = rig.lifecycle.mount(id).await.unwrap_err();

    assert!(matches!(
        err,
        VaultError::InvalidState {
            state: FilesystemState::EncryptedLocked,
            ..
        }
    ));
    assert_eq!(state(&rig), FilesystemState::EncryptedLocked);
}

#[tokio::test]
async fn plain_format_mounts_without_password() {
    let rig = trusted_rig().await;
    let id = rig.drive_id.as_str();

    let drive = rig.lifecycle.format_plain(id, Some("photos")).await.unwrap();
    assert_eq!(drive.filesystem_state, FilesystemState::PlainFilesystem);
    assert_eq!(drive.label.as_deref(), Some("photos"));

    let mount_point = rig.lifecycle.prepare_for_backup(id, None).await.unwrap();
    assert!(mount_point.is_dir());
}

#[tokio::test]
async fn timed_out_unlock_leaves_drive_busy() {
    let rig = rig_with_timeout(Duration::from_millis(50)).await;
    let id = rig.drive_id.as_str();
    rig.registry.set_trust_level(id, TrustLevel::Partial).unwrap();
    rig.lifecycle.format_and_encrypt(id, DRIVE_PW).await.unwrap();

    rig.sim.set_delay(Duration::from_millis(500));
    let err = rig.lifecycle.unlock(id, DRIVE_PW).await.unwrap_err();

    assert!(matches!(
        err,
        VaultError::Timeout {
            step: LifecycleStep::Unlock,
            ..
        }
    ));
    assert_eq!(state(&rig), FilesystemState::Busy);
}
