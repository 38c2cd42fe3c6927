use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use super::{DeviceBackend, Drive, FilesystemState, TrustLevel};
use crate::error::{RecordKind, Result, VaultError};
use crate::lifecycle::LifecycleStep;
use crate::storage::Storage;

const TABLE_VERSION: u8 = 2;

/// Placeholder id used in errors that concern the scan rather than a drive.
pub const ALL_DRIVES: &str = "*";

/// What survives a restart: identity and trust. Everything else about a
/// drive comes from the next scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct TrustRecord {
    id: String,
    serial: Option<String>,
    identity_stable: bool,
    trust_level: TrustLevel,
    last_seen: DateTime<Utc>,
}

impl From<&Drive> for TrustRecord {
    fn from(drive: &Drive) -> Self {
        Self {
            id: drive.id.clone(),
            serial: drive.serial.clone(),
            identity_stable: drive.identity_stable,
            trust_level: drive.trust_level,
            last_seen: drive.last_seen,
        }
    }
}

impl From<TrustRecord> for Drive {
    /// A known drive that has not been scanned yet. Its state is unknown
    /// until it is seen again.
    fn from(record: TrustRecord) -> Self {
        Self {
            id: record.id,
            device_path: PathBuf::new(),
            label: None,
            filesystem_state: FilesystemState::Busy,
            trust_level: record.trust_level,
            last_seen: record.last_seen,
            serial: record.serial,
            model: None,
            size_bytes: 0,
            partition: None,
            mapper: None,
            mount_point: None,
            present: false,
            identity_stable: record.identity_stable,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct TrustTable {
    version: u8,
    drives: BTreeMap<String, TrustRecord>,
}

#[derive(Default)]
struct RegistryState {
    drives: BTreeMap<String, Drive>,
    leased: HashSet<String>,
    last_refresh: Option<Instant>,
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Current view of removable drives plus the persisted trust table.
///
/// Every drive ever seen stays listed; drives missing from the latest scan
/// are marked not present instead of being dropped, so stored passwords and
/// trust survive an unplug.
pub struct DeviceRegistry {
    backend: Arc<dyn DeviceBackend>,
    table: Storage,
    timeout: Duration,
    state: Arc<Mutex<RegistryState>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeviceRegistry {
    /// Load the trust table (if any). Known drives start out as not present
    /// until the first refresh.
    pub fn open(backend: Arc<dyn DeviceBackend>, table: Storage, timeout: Duration) -> Result<Self> {
        let drives = table
            .load_json::<TrustTable>()?
            .map(|t| t.drives)
            .unwrap_or_default()
            .into_iter()
            .map(|(id, record)| (id, Drive::from(record)))
            .collect();

        Ok(Self {
            backend,
            table,
            timeout,
            state: Arc::new(Mutex::new(RegistryState {
                drives,
                ..Default::default()
            })),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn backend(&self) -> Arc<dyn DeviceBackend> {
        Arc::clone(&self.backend)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Re-scan attached media and merge it with what is already known.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<Vec<Drive>> {
        let probes = match tokio::time::timeout(self.timeout, self.backend.scan()).await {
            Err(_) => {
                return Err(VaultError::Timeout {
                    drive_id: ALL_DRIVES.into(),
                    step: LifecycleStep::Scan,
                });
            }
            Ok(Err(err)) => {
                return Err(VaultError::Device {
                    drive_id: ALL_DRIVES.into(),
                    step: LifecycleStep::Scan,
                    reason: err.to_string(),
                });
            }
            Ok(Ok(probes)) => probes,
        };

        let now = Utc::now();
        let mut state = lock(&self.state);
        let mut seen = HashSet::new();

        for probe in probes {
            let (id, identity_stable) = probe.drive_id();
            let trust_level = match state.drives.get(&id) {
                Some(known) => known.trust_level,
                None => {
                    info!(drive_id = %id, identity_stable, "new drive detected");
                    TrustLevel::default()
                }
            };
            let filesystem_state = if state.leased.contains(&id) {
                FilesystemState::Busy
            } else {
                probe.classify()
            };

            seen.insert(id.clone());
            state.drives.insert(
                id.clone(),
                Drive {
                    id,
                    device_path: probe.device_path,
                    label: probe.label,
                    filesystem_state,
                    trust_level,
                    last_seen: now,
                    serial: probe.serial,
                    model: probe.model,
                    size_bytes: probe.size_bytes,
                    partition: probe.partition,
                    mapper: probe.mapper,
                    mount_point: probe.mount_point,
                    present: true,
                    identity_stable,
                },
            );
        }

        for drive in state.drives.values_mut() {
            if !seen.contains(&drive.id) && drive.present {
                debug!(drive_id = %drive.id, "drive no longer attached");
                drive.present = false;
            }
        }
        state.last_refresh = Some(Instant::now());
        self.persist(&state)?;

        Ok(state.drives.values().cloned().collect())
    }

    /// `true` if there was no refresh within `window`.
    pub fn is_stale(&self, window: Duration) -> bool {
        match lock(&self.state).last_refresh {
            Some(at) => at.elapsed() > window,
            None => true,
        }
    }

    pub async fn refresh_if_stale(&self, window: Duration) -> Result<Vec<Drive>> {
        if self.is_stale(window) {
            self.refresh().await
        } else {
            Ok(self.list())
        }
    }

    pub fn list(&self) -> Vec<Drive> {
        lock(&self.state).drives.values().cloned().collect()
    }

    pub fn get(&self, drive_id: &str) -> Result<Drive> {
        lock(&self.state)
            .drives
            .get(drive_id)
            .cloned()
            .ok_or_else(|| VaultError::not_found(RecordKind::Drive, drive_id))
    }

    /// The only way a drive gains (or loses) trust. Persisted immediately.
    pub fn set_trust_level(&self, drive_id: &str, level: TrustLevel) -> Result<Drive> {
        let mut state = lock(&self.state);
        let drive = state
            .drives
            .get_mut(drive_id)
            .ok_or_else(|| VaultError::not_found(RecordKind::Drive, drive_id))?;
        let previous = drive.trust_level;
        drive.trust_level = level;
        let updated = drive.clone();

        if let Err(err) = self.persist(&state) {
            if let Some(drive) = state.drives.get_mut(drive_id) {
                drive.trust_level = previous;
            }
            return Err(err);
        }

        info!(drive_id, %previous, %level, "trust level changed");
        Ok(updated)
    }

    /// Drop a detached drive and its trust from the registry.
    pub fn forget(&self, drive_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let drive = state
            .drives
            .get(drive_id)
            .ok_or_else(|| VaultError::not_found(RecordKind::Drive, drive_id))?;
        if drive.present {
            return Err(VaultError::validation(format!(
                "drive '{drive_id}' is attached; detach it before forgetting it"
            )));
        }
        if state.leased.contains(drive_id) {
            return Err(VaultError::ResourceBusy {
                drive_id: drive_id.to_string(),
            });
        }

        let removed = state.drives.remove(drive_id);
        if let Err(err) = self.persist(&state) {
            if let Some(drive) = removed {
                state.drives.insert(drive_id.to_string(), drive);
            }
            return Err(err);
        }
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(drive_id);

        info!(drive_id, "drive forgotten");
        Ok(())
    }

    /// Take exclusive use of an attached drive. The drive reports `Busy`
    /// until the lease is settled; a second caller gets `ResourceBusy`.
    pub fn try_lease(&self, drive_id: &str) -> Result<DriveLease> {
        let lock_for_drive = {
            let state = lock(&self.state);
            if !state.drives.contains_key(drive_id) {
                return Err(VaultError::not_found(RecordKind::Drive, drive_id));
            }
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(drive_id.to_string()).or_default())
        };

        let guard = lock_for_drive
            .try_lock_owned()
            .map_err(|_| VaultError::ResourceBusy {
                drive_id: drive_id.to_string(),
            })?;

        let mut state = lock(&self.state);
        let drive = state
            .drives
            .get_mut(drive_id)
            .ok_or_else(|| VaultError::not_found(RecordKind::Drive, drive_id))?;
        if !drive.present {
            return Err(VaultError::validation(format!(
                "drive '{drive_id}' is not attached"
            )));
        }

        let snapshot = drive.clone();
        drive.filesystem_state = FilesystemState::Busy;
        state.leased.insert(drive_id.to_string());
        debug!(drive_id, "drive leased");

        Ok(DriveLease {
            state: Arc::clone(&self.state),
            drive: snapshot,
            settled: false,
            _guard: guard,
        })
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        self.table.save_json(&TrustTable {
            version: TABLE_VERSION,
            drives: state
                .drives
                .iter()
                .map(|(id, drive)| (id.clone(), TrustRecord::from(drive)))
                .collect(),
        })
    }
}

/// Exclusive hold on one drive for the duration of an operation.
///
/// Settle it with [`complete`](Self::complete) or [`restore`](Self::restore).
/// A lease dropped unsettled (an operation failed part way) leaves the drive
/// `Busy` until a refresh reclassifies it.
pub struct DriveLease {
    state: Arc<Mutex<RegistryState>>,
    drive: Drive,
    settled: bool,
    _guard: OwnedMutexGuard<()>,
}

impl DriveLease {
    /// The drive as it was when the lease was taken.
    pub fn drive(&self) -> &Drive {
        &self.drive
    }

    /// Record the outcome of the operation and release the drive.
    pub fn complete(mut self, update: impl FnOnce(&mut Drive)) -> Drive {
        self.settled = true;
        let mut state = lock(&self.state);
        state.leased.remove(&self.drive.id);

        match state.drives.get_mut(&self.drive.id) {
            Some(drive) => {
                drive.filesystem_state = self.drive.filesystem_state;
                update(drive);
                drive.clone()
            }
            None => {
                let mut drive = self.drive.clone();
                update(&mut drive);
                drive
            }
        }
    }

    /// Release the drive in the state it had before.
    pub fn restore(self) -> Drive {
        self.complete(|_| {})
    }
}

impl Drop for DriveLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = lock(&self.state);
        state.leased.remove(&self.drive.id);
        warn!(
            drive_id = %self.drive.id,
            "operation did not complete; drive stays busy until re-inspected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevices;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        sim: Arc<SimulatedDevices>,
        table: Storage,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let sim = Arc::new(SimulatedDevices::new(dir.path().join("media")).unwrap());
        let table = Storage::new(dir.path().join("drives.json"));
        Fixture {
            _dir: dir,
            sim,
            table,
        }
    }

    fn registry(f: &Fixture) -> DeviceRegistry {
        DeviceRegistry::open(f.sim.clone(), f.table.clone(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn new_drive_is_untrusted() {
        let f = fixture();
        f.sim.attach("/dev/sdb", Some("SER-1")).unwrap();

        let drives = registry(&f).refresh().await.unwrap();

        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].trust_level, TrustLevel::Untrusted);
        assert_eq!(drives[0].filesystem_state, FilesystemState::Unformatted);
        assert!(drives[0].present);
    }

    #[tokio::test]
    async fn trust_survives_reopen_and_new_device_path() {
        let f = fixture();
        f.sim.attach("/dev/sdb", Some("SER-1")).unwrap();
        let reg = registry(&f);
        let id = reg.refresh().await.unwrap()[0].id.clone();
        reg.set_trust_level(&id, TrustLevel::Full).unwrap();
        drop(reg);

        f.sim.detach("/dev/sdb");
        f.sim.attach("/dev/sdc", Some("SER-1")).unwrap();
        let reg = registry(&f);
        assert!(!reg.get(&id).unwrap().present);

        let drives = reg.refresh().await.unwrap();
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].id, id);
        assert_eq!(drives[0].trust_level, TrustLevel::Full);
        assert_eq!(drives[0].device_path, std::path::PathBuf::from("/dev/sdc"));
    }

    #[tokio::test]
    async fn table_keeps_only_identity_and_trust() {
        let f = fixture();
        f.sim.attach("/dev/sdb", Some("SER-1")).unwrap();
        let reg = registry(&f);
        let drive = reg.refresh().await.unwrap()[0].clone();
        reg.set_trust_level(&drive.id, TrustLevel::Partial).unwrap();

        let table: serde_json::Value = f.table.load_json().unwrap().unwrap();
        let record = &table["drives"][drive.id.as_str()];
        let mut fields: Vec<_> = record.as_object().unwrap().keys().cloned().collect();
        fields.sort();
        assert_eq!(
            fields,
            ["id", "identity_stable", "last_seen", "serial", "trust_level"]
        );
        assert_eq!(record["trust_level"], "partial");

        let reopened = registry(&f).get(&drive.id).unwrap();
        assert_eq!(reopened.trust_level, TrustLevel::Partial);
        assert_eq!(reopened.serial.as_deref(), Some("SER-1"));
        assert!(!reopened.present);
        assert!(reopened.mount_point.is_none());
    }

    #[tokio::test]
    async fn detached_drive_is_retained() {
        let f = fixture();
        f.sim.attach("/dev/sdb", Some("SER-1")).unwrap();
        let reg = registry(&f);
        let before = reg.refresh().await.unwrap()[0].clone();

        f.sim.detach("/dev/sdb");
        let after = reg.refresh().await.unwrap();

        assert_eq!(after.len(), 1);
        assert!(!after[0].present);
        assert_eq!(after[0].last_seen, before.last_seen);
    }

    #[tokio::test]
    async fn staleness_window() {
        let f = fixture();
        let reg = registry(&f);
        assert!(reg.is_stale(Duration::from_secs(60)));

        reg.refresh().await.unwrap();

        assert!(!reg.is_stale(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(reg.is_stale(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn second_lease_is_rejected() {
        let f = fixture();
        f.sim.attach("/dev/sdb", Some("SER-1")).unwrap();
        let reg = registry(&f);
        let id = reg.refresh().await.unwrap()[0].id.clone();

        let lease = reg.try_lease(&id).unwrap();
        assert_eq!(reg.get(&id).unwrap().filesystem_state, FilesystemState::Busy);
        assert!(matches!(
            reg.try_lease(&id),
            Err(VaultError::ResourceBusy { .. })
        ));

        let drive = lease.restore();
        assert_eq!(drive.filesystem_state, FilesystemState::Unformatted);
        assert!(reg.try_lease(&id).is_ok());
    }

    #[tokio::test]
    async fn unsettled_lease_leaves_drive_busy_until_refresh() {
        let f = fixture();
        f.sim.attach("/dev/sdb", Some("SER-1")).unwrap();
        let reg = registry(&f);
        let id = reg.refresh().await.unwrap()[0].id.clone();

        drop(reg.try_lease(&id).unwrap());
        assert_eq!(reg.get(&id).unwrap().filesystem_state, FilesystemState::Busy);

        reg.refresh().await.unwrap();
        assert_eq!(
            reg.get(&id).unwrap().filesystem_state,
            FilesystemState::Unformatted
        );
    }

    #[tokio::test]
    async fn forget_requires_detached_drive() {
        let f = fixture();
        f.sim.attach("/dev/sdb", Some("SER-1")).unwrap();
        let reg = registry(&f);
        let id = reg.refresh().await.unwrap()[0].id.clone();

        assert!(matches!(reg.forget(&id), Err(VaultError::Validation(_))));

        f.sim.detach("/dev/sdb");
        reg.refresh().await.unwrap();
        reg.forget(&id).unwrap();

        assert!(reg.list().is_empty());
        assert!(matches!(reg.get(&id), Err(VaultError::NotFound { .. })));
    }

    #[tokio::test]
    async fn unknown_drive_is_not_found() {
        let f = fixture();
        let reg = registry(&f);

        assert!(matches!(
            reg.set_trust_level("drv-0000000000000000", TrustLevel::Full),
            Err(VaultError::NotFound { .. })
        ));
        assert!(matches!(
            reg.try_lease("drv-0000000000000000"),
            Err(VaultError::NotFound { .. })
        ));
    }
}
