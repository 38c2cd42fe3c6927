//! Offline key vault with authenticated encryption at rest and encrypted
//! cold-storage backups on removable drives.
//!
//! [`ColdVault`] wires the components together:
//!
//! - [`SecretStore`] keeps vault items and stored passwords as encryption
//!   envelopes ([`crypto`]).
//! - [`DeviceRegistry`] tracks removable drives and their trust level.
//! - [`DriveLifecycleManager`] formats, unlocks, mounts and ejects drives.
//! - [`BackupEngine`] writes vaults to drives and reads them back.

pub mod backup;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod storage;
pub mod store;

pub use crate::backup::{
    BackupArchive, BackupEngine, BackupRequest, CancelToken, RestoreRequest, VerifyReport,
};
pub use crate::config::Config;
pub use crate::crypto::{CryptoEngine, EncryptionEnvelope, KdfParams};
pub use crate::device::{
    DeviceBackend, DeviceRegistry, Drive, FilesystemState, SimulatedDevices, SystemDevices,
    TrustLevel,
};
pub use crate::error::{ErrorKind, RecordKind, Result, VaultError};
pub use crate::lifecycle::{DriveLifecycleManager, LifecycleStep};
pub use crate::storage::Storage;
pub use crate::store::{
    ImportReport, ItemMetadata, NewItem, PasswordInfo, PasswordScope, RestoredItem, SecretStore,
};

use std::sync::Arc;

use tracing::info;
use zeroize::Zeroizing;

/// The assembled vault.
pub struct ColdVault {
    config: Config,
    store: Arc<SecretStore>,
    registry: Arc<DeviceRegistry>,
    lifecycle: Arc<DriveLifecycleManager>,
    backups: BackupEngine,
}

impl ColdVault {
    /// Create a new store under the configured data directory.
    pub async fn init(
        config: Config,
        master: Zeroizing<String>,
        backend: Arc<dyn DeviceBackend>,
    ) -> Result<Self> {
        let engine = config.engine()?;
        engine.check_password_policy(&master)?;
        let storage = Storage::new(config.store_path()?);
        let store = blocking(move || SecretStore::init(storage, engine, master)).await?;
        Self::assemble(config, store, backend)
    }

    /// Open an existing store; a wrong master password is
    /// `AuthenticationFailed`.
    pub async fn open(
        config: Config,
        master: Zeroizing<String>,
        backend: Arc<dyn DeviceBackend>,
    ) -> Result<Self> {
        let engine = config.engine()?;
        crypto::require_password(&master)?;
        let storage = Storage::new(config.store_path()?);
        let store = blocking(move || SecretStore::open(storage, engine, master)).await?;
        Self::assemble(config, store, backend)
    }

    fn assemble(
        config: Config,
        store: SecretStore,
        backend: Arc<dyn DeviceBackend>,
    ) -> Result<Self> {
        let engine = *store.engine();
        let store = Arc::new(store);
        let registry = Arc::new(DeviceRegistry::open(
            backend,
            Storage::new(config.trust_table_path()?),
            config.device_timeout(),
        )?);
        let lifecycle = Arc::new(DriveLifecycleManager::new(
            Arc::clone(&registry),
            engine,
            config.mount_root()?,
        ));
        let backups = BackupEngine::new(Arc::clone(&store), Arc::clone(&lifecycle), engine);

        info!(data_dir = %config.data_dir()?.display(), "vault opened");
        Ok(Self {
            config,
            store,
            registry,
            lifecycle,
            backups,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<DriveLifecycleManager> {
        &self.lifecycle
    }

    pub fn backups(&self) -> &BackupEngine {
        &self.backups
    }

    // ---------------------------------------------------------------
    // stored passwords

    pub async fn save_password(
        &self,
        scope: PasswordScope,
        password: Zeroizing<String>,
        hint: Option<String>,
    ) -> Result<String> {
        let store = Arc::clone(&self.store);
        blocking(move || store.put_password(&scope, &password, hint)).await
    }

    pub async fn get_password(&self, scope: PasswordScope) -> Result<Zeroizing<String>> {
        let store = Arc::clone(&self.store);
        blocking(move || store.get_password(&scope)).await
    }

    pub fn delete_password(&self, scope: &PasswordScope) -> Result<bool> {
        self.store.delete_password(scope)
    }

    // ---------------------------------------------------------------
    // items

    pub fn list_items(&self, vault_id: &str) -> Result<Vec<ItemMetadata>> {
        self.store.list_items(vault_id)
    }

    pub async fn decrypt_item(
        &self,
        item_id: &str,
        password: Zeroizing<String>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let store = Arc::clone(&self.store);
        let item_id = item_id.to_string();
        blocking(move || store.decrypt_item(&item_id, &password)).await
    }

    // ---------------------------------------------------------------
    // drives

    /// Known drives, rescanning first if the last scan is older than the
    /// configured staleness window.
    pub async fn list_drives(&self) -> Result<Vec<Drive>> {
        self.registry
            .refresh_if_stale(self.config.refresh_staleness())
            .await
    }

    pub fn set_trust_level(&self, drive_id: &str, level: TrustLevel) -> Result<Drive> {
        self.registry.set_trust_level(drive_id, level)
    }

    pub async fn format_and_encrypt(&self, drive_id: &str, password: &str) -> Result<Drive> {
        self.lifecycle.format_and_encrypt(drive_id, password).await
    }

    pub async fn unlock_drive(&self, drive_id: &str, password: &str) -> Result<Drive> {
        self.lifecycle.unlock(drive_id, password).await
    }

    // ---------------------------------------------------------------
    // backups

    pub async fn create_backup(
        &self,
        request: &BackupRequest,
        cancel: &CancelToken,
    ) -> Result<BackupArchive> {
        self.backups.create_backup(request, cancel).await
    }

    pub async fn restore_backup(&self, request: &RestoreRequest) -> Result<Vec<RestoredItem>> {
        self.backups.restore_backup(request).await
    }
}

/// Run KDF-bound work off the async workers.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VaultError::Storage(format!("background task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KdfConfig;
    use tempfile::tempdir;

    fn cheap_config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: Some(dir.join("data")),
            mount_root: Some(dir.join("mnt")),
            kdf: KdfConfig {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn stored_passwords_are_scoped() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(SimulatedDevices::new(dir.path().join("media")).unwrap());
        let vault = ColdVault::init(
            cheap_config(dir.path()),
            Zeroizing::new("master-password".into()),
            backend,
        )
        .await
        .unwrap();

        vault
            .save_password(
                PasswordScope::drive("u1", "d1"),
                Zeroizing::new("drive-password".into()),
                None,
            )
            .await
            .unwrap();

        let got = vault
            .get_password(PasswordScope::drive("u1", "d1"))
            .await
            .unwrap();
        assert_eq!(got.as_str(), "drive-password");

        let err = vault
            .get_password(PasswordScope::drive("u1", "d2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn reopen_checks_the_master_password() {
        let dir = tempdir().unwrap();
        let backend: Arc<dyn DeviceBackend> =
            Arc::new(SimulatedDevices::new(dir.path().join("media")).unwrap());
        ColdVault::init(
            cheap_config(dir.path()),
            Zeroizing::new("master-password".into()),
            Arc::clone(&backend),
        )
        .await
        .unwrap();

        let err = ColdVault::open(
            cheap_config(dir.path()),
            Zeroizing::new("not-the-master".into()),
            Arc::clone(&backend),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);

        assert!(
            ColdVault::open(
                cheap_config(dir.path()),
                Zeroizing::new("master-password".into()),
                backend,
            )
            .await
            .is_ok()
        );
    }

    #[tokio::test]
    async fn empty_master_password_is_rejected() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(SimulatedDevices::new(dir.path().join("media")).unwrap());

        let err = ColdVault::init(cheap_config(dir.path()), Zeroizing::new(String::new()), backend)
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!dir.path().join("data").join("store.json").exists());
    }
}
