//! Export a vault to a removable drive and restore it from one.
//!
//! Items are re-wrapped under the backup password bound to the recovery
//! phrase, so a backup opens without the vault password but never without
//! the phrase. Each item file is flushed before the next is written and the
//! manifest goes last: a backup directory with a manifest is complete, one
//! without is not a backup at all. The manifest carries a sealed digest of
//! its own contents, so entries cannot be dropped or swapped unnoticed.

pub mod layout;

pub use layout::BackupLayout;

use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::blocking;
use crate::crypto::digest::content_hash;
use crate::crypto::{CryptoEngine, EncryptionEnvelope, require_password};
use crate::device::{DeviceRegistry, FilesystemState, TrustLevel};
use crate::error::{RecordKind, Result, VaultError};
use crate::lifecycle::{DriveLifecycleManager, require_trust};
use crate::storage::{Storage, write_durable};
use crate::store::{ItemMetadata, RestoredItem, SecretStore, VaultItem};

const ARCHIVE_VERSION: u8 = 1;

/// Stands in for an item id when the manifest itself fails its check.
pub const MANIFEST_ENTRY: &str = "manifest";

/// Cooperative cancellation for long-running backups and restores. Checked
/// between items; an item already being written always finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub item_id: String,
    /// SHA-256 (hex) of the item file as written.
    pub content_hash: String,
}

/// The manifest of a complete backup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    pub format_version: u8,
    pub id: String,
    pub source_vault_id: String,
    pub drive_id: String,
    pub manifest: Vec<ManifestEntry>,
    /// Argon2id PHC string; the phrase itself is never stored.
    pub recovery_phrase_hash: String,
    /// Canary under the backup password alone, so a wrong password is told
    /// apart from a wrong phrase.
    pub password_canary: EncryptionEnvelope,
    /// [`BackupArchive::digest`] sealed under the password bound to the phrase.
    pub seal: EncryptionEnvelope,
    pub created_at: DateTime<Utc>,
}

impl BackupArchive {
    /// SHA-256 over every field the seal vouches for, entries in order.
    pub fn digest(&self) -> String {
        manifest_digest(
            &self.id,
            &self.source_vault_id,
            &self.drive_id,
            &self.created_at,
            &self.recovery_phrase_hash,
            &self.manifest,
        )
    }
}

/// One item file on the drive.
#[derive(Serialize, Deserialize)]
struct BackupEntry {
    item: ItemMetadata,
    envelope: EncryptionEnvelope,
}

pub struct BackupRequest {
    pub vault_id: String,
    pub drive_id: String,
    pub vault_password: Zeroizing<String>,
    pub backup_password: Zeroizing<String>,
    pub recovery_phrase: Zeroizing<String>,
    /// Wipe and encrypt the drive first. Never done unless asked for.
    pub format_drive: bool,
    /// Needed to format the drive or to unlock a locked one.
    pub drive_password: Option<Zeroizing<String>>,
}

impl fmt::Debug for BackupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupRequest")
            .field("vault_id", &self.vault_id)
            .field("drive_id", &self.drive_id)
            .field("format_drive", &self.format_drive)
            .finish_non_exhaustive()
    }
}

pub struct RestoreRequest {
    pub drive_id: String,
    /// Latest backup on the drive when `None`.
    pub backup_id: Option<String>,
    pub backup_password: Zeroizing<String>,
    pub recovery_phrase: Zeroizing<String>,
    pub drive_password: Option<Zeroizing<String>>,
}

impl fmt::Debug for RestoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreRequest")
            .field("drive_id", &self.drive_id)
            .field("backup_id", &self.backup_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub backup_id: String,
    pub verified: usize,
}

pub struct BackupEngine {
    store: Arc<SecretStore>,
    registry: Arc<DeviceRegistry>,
    lifecycle: Arc<DriveLifecycleManager>,
    engine: CryptoEngine,
}

impl BackupEngine {
    pub fn new(
        store: Arc<SecretStore>,
        lifecycle: Arc<DriveLifecycleManager>,
        engine: CryptoEngine,
    ) -> Self {
        Self {
            store,
            registry: Arc::clone(lifecycle.registry()),
            lifecycle,
            engine,
        }
    }

    /// Write every active item of the vault to the drive.
    pub async fn create_backup(
        &self,
        request: &BackupRequest,
        cancel: &CancelToken,
    ) -> Result<BackupArchive> {
        self.create_backup_with_progress(request, cancel, |_, _| {}).await
    }

    /// [`create_backup`](Self::create_backup), calling `progress(written, total)`
    /// after each item file is flushed.
    #[instrument(skip_all, fields(vault_id = %request.vault_id, drive_id = %request.drive_id))]
    pub async fn create_backup_with_progress<P>(
        &self,
        request: &BackupRequest,
        cancel: &CancelToken,
        mut progress: P,
    ) -> Result<BackupArchive>
    where
        P: FnMut(usize, usize) + Send,
    {
        require_password(&request.vault_password)?;
        self.engine.check_password_policy(&request.backup_password)?;

        let engine = self.engine;
        let phrase = request.recovery_phrase.clone();
        let phrase_hash = blocking(move || engine.hash_recovery_phrase(&phrase)).await?;

        let store = Arc::clone(&self.store);
        let (vault_id, vault_password) =
            (request.vault_id.clone(), request.vault_password.clone());
        if !blocking(move || store.verify_vault_password(&vault_id, &vault_password)).await? {
            return Err(VaultError::AuthenticationFailed);
        }

        let drive = self.registry.get(&request.drive_id)?;
        require_trust(&drive, TrustLevel::Full)?;

        let drive_password = request.drive_password.as_deref().map(String::as_str);
        if request.format_drive {
            let password = drive_password.ok_or_else(|| {
                VaultError::validation("drive password is required to format the drive")
            })?;
            self.lifecycle
                .format_and_encrypt(&request.drive_id, password)
                .await?;
        }

        let progress: &mut (dyn FnMut(usize, usize) + Send) = &mut progress;
        self.with_mounted(&request.drive_id, drive_password, move |mount| {
            self.write_backup(request, mount, phrase_hash, cancel, progress)
        })
        .await
    }

    /// Complete backups on the drive, newest first.
    #[instrument(skip_all, fields(drive_id = %drive_id))]
    pub async fn list_backups(
        &self,
        drive_id: &str,
        drive_password: Option<&str>,
    ) -> Result<Vec<BackupArchive>> {
        let drive = self.registry.get(drive_id)?;
        require_trust(&drive, TrustLevel::Partial)?;

        self.with_mounted(drive_id, drive_password, |mount| async move {
            let layout = BackupLayout::new(&mount);
            let mut archives = Vec::new();
            for id in layout.complete_backups()? {
                match load_archive(&layout, &id) {
                    Ok(archive) => archives.push(archive),
                    Err(err) => warn!(backup_id = %id, "unreadable manifest: {err}"),
                }
            }
            archives.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(archives)
        })
        .await
    }

    /// Re-hash every item file against the manifest without decrypting. This
    /// needs no password, so it cannot check the sealed digest; a restore does.
    #[instrument(skip_all, fields(drive_id = %drive_id, backup_id = %backup_id))]
    pub async fn verify_backup(
        &self,
        drive_id: &str,
        backup_id: &str,
        drive_password: Option<&str>,
    ) -> Result<VerifyReport> {
        let drive = self.registry.get(drive_id)?;
        require_trust(&drive, TrustLevel::Partial)?;

        self.with_mounted(drive_id, drive_password, |mount| async move {
            let layout = BackupLayout::new(&mount);
            let archive = load_archive(&layout, backup_id)?;

            let mut validated = Vec::new();
            for entry in &archive.manifest {
                let intact = layout
                    .item_path(backup_id, &entry.item_id)
                    .ok()
                    .and_then(|path| fs::read(path).ok())
                    .is_some_and(|bytes| content_hash(&bytes) == entry.content_hash);
                if !intact {
                    return Err(VaultError::IntegrityViolation {
                        backup_id: backup_id.to_string(),
                        item_id: entry.item_id.clone(),
                        validated,
                    });
                }
                validated.push(entry.item_id.clone());
            }

            info!(verified = validated.len(), "backup verified");
            Ok(VerifyReport {
                backup_id: backup_id.to_string(),
                verified: validated.len(),
            })
        })
        .await
    }

    /// Read a backup back. The recovery phrase is checked before any item
    /// is touched; any damaged item fails the whole restore.
    #[instrument(skip_all, fields(drive_id = %request.drive_id))]
    pub async fn restore_backup(&self, request: &RestoreRequest) -> Result<Vec<RestoredItem>> {
        require_password(&request.backup_password)?;
        if request.recovery_phrase.trim().is_empty() {
            return Err(VaultError::validation("recovery phrase is required"));
        }

        let drive = self.registry.get(&request.drive_id)?;
        require_trust(&drive, TrustLevel::Partial)?;

        let drive_password = request.drive_password.as_deref().map(String::as_str);
        self.with_mounted(&request.drive_id, drive_password, |mount| {
            self.read_backup(request, mount)
        })
        .await
    }

    // ---------------------------------------------------------------

    /// Mount the drive, hold it for the duration of `work`, then release it
    /// still mounted.
    async fn with_mounted<'a, T, F, Fut>(
        &'a self,
        drive_id: &'a str,
        drive_password: Option<&'a str>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mount = self
            .lifecycle
            .prepare_for_backup(drive_id, drive_password)
            .await?;

        let lease = self.registry.try_lease(drive_id)?;
        if lease.drive().filesystem_state != FilesystemState::Mounted {
            let drive = lease.restore();
            return Err(VaultError::InvalidState {
                drive_id: drive.id,
                state: drive.filesystem_state,
                operation: "use for backups",
            });
        }

        let result = work(mount).await;
        lease.restore();
        result
    }

    async fn write_backup(
        &self,
        request: &BackupRequest,
        mount: PathBuf,
        recovery_phrase_hash: String,
        cancel: &CancelToken,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<BackupArchive> {
        let items = self.store.active_items(&request.vault_id)?;
        let total = items.len();
        let backup_id = Uuid::new_v4().to_string();
        let layout = BackupLayout::new(&mount);
        fs::create_dir_all(layout.items_dir(&backup_id)?)?;

        let engine = self.engine;
        let sealing_secret =
            engine.bind_recovery_phrase(&request.backup_password, &request.recovery_phrase)?;
        let backup_password = request.backup_password.clone();
        let password_canary = blocking(move || engine.seal_canary(&backup_password)).await?;

        info!(backup_id = %backup_id, total, "writing backup");
        let mut manifest = Vec::with_capacity(total);
        for (completed, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(backup_id = %backup_id, completed, total, "backup cancelled");
                return Err(VaultError::Cancelled { completed, total });
            }

            let path = layout.item_path(&backup_id, &item.id)?;
            let vault_password = request.vault_password.clone();
            let secret = sealing_secret.clone();
            let entry =
                blocking(move || write_entry(&engine, item, &path, &vault_password, &secret))
                    .await?;

            debug!(item_id = %entry.item_id, "item written");
            manifest.push(entry);
            progress(completed + 1, total);
        }

        let created_at = Utc::now();
        let digest = manifest_digest(
            &backup_id,
            &request.vault_id,
            &request.drive_id,
            &created_at,
            &recovery_phrase_hash,
            &manifest,
        );
        let seal = blocking(move || engine.encrypt(digest.as_bytes(), &sealing_secret)).await?;

        let archive = BackupArchive {
            format_version: ARCHIVE_VERSION,
            id: backup_id.clone(),
            source_vault_id: request.vault_id.clone(),
            drive_id: request.drive_id.clone(),
            manifest,
            recovery_phrase_hash,
            password_canary,
            seal,
            created_at,
        };
        Storage::new(layout.manifest_path(&backup_id)?).save_json(&archive)?;

        info!(backup_id = %backup_id, items = total, "backup complete");
        Ok(archive)
    }

    async fn read_backup(
        &self,
        request: &RestoreRequest,
        mount: PathBuf,
    ) -> Result<Vec<RestoredItem>> {
        let layout = BackupLayout::new(&mount);
        let backup_id = match &request.backup_id {
            Some(id) => id.clone(),
            None => latest_backup(&layout)?
                .ok_or_else(|| VaultError::not_found(RecordKind::Backup, &request.drive_id))?,
        };
        let archive = load_archive(&layout, &backup_id)?;

        let engine = self.engine;
        let phrase = request.recovery_phrase.clone();
        let stored_hash = archive.recovery_phrase_hash.clone();
        if !blocking(move || Ok(engine.verify_recovery_phrase(&phrase, &stored_hash))).await? {
            warn!(backup_id = %backup_id, "recovery phrase rejected");
            return Err(VaultError::RecoveryPhraseMismatch { backup_id });
        }

        let password = request.backup_password.clone();
        let canary = archive.password_canary.clone();
        if !blocking(move || Ok(engine.verify_password(&canary, &password))).await? {
            return Err(VaultError::AuthenticationFailed);
        }

        // The password is right, so a seal that does not open means the
        // phrase hash on the drive is not the one this backup was made with.
        let sealing_secret =
            engine.bind_recovery_phrase(&request.backup_password, &request.recovery_phrase)?;
        let seal = archive.seal.clone();
        let secret = sealing_secret.clone();
        let sealed_digest = blocking(move || Ok(engine.decrypt(&seal, &secret).ok())).await?;
        let Some(sealed_digest) = sealed_digest else {
            warn!(backup_id = %backup_id, "manifest seal rejected the recovery phrase");
            return Err(VaultError::RecoveryPhraseMismatch { backup_id });
        };
        if sealed_digest.as_slice() != archive.digest().as_bytes() {
            warn!(backup_id = %backup_id, "manifest does not match its seal");
            return Err(VaultError::IntegrityViolation {
                backup_id,
                item_id: MANIFEST_ENTRY.to_string(),
                validated: Vec::new(),
            });
        }

        let mut validated = Vec::new();
        let mut restored = Vec::with_capacity(archive.manifest.len());
        for entry in archive.manifest {
            let path = layout.item_path(&backup_id, &entry.item_id).ok();
            let password = sealing_secret.clone();
            let expected = entry.clone();
            let opened = blocking(move || {
                Ok(path.and_then(|p| open_entry(&engine, &p, &expected, &password)))
            })
            .await?;

            match opened {
                Some(item) => {
                    validated.push(entry.item_id);
                    restored.push(item);
                }
                None => {
                    warn!(backup_id = %backup_id, item_id = %entry.item_id, "integrity check failed");
                    return Err(VaultError::IntegrityViolation {
                        backup_id,
                        item_id: entry.item_id,
                        validated,
                    });
                }
            }
        }

        info!(backup_id = %backup_id, items = restored.len(), "backup restored");
        Ok(restored)
    }
}

fn load_archive(layout: &BackupLayout, backup_id: &str) -> Result<BackupArchive> {
    let archive: BackupArchive = Storage::new(layout.manifest_path(backup_id)?)
        .load_json()?
        .ok_or_else(|| VaultError::not_found(RecordKind::Backup, backup_id))?;
    if archive.format_version != ARCHIVE_VERSION {
        return Err(VaultError::validation(format!(
            "unsupported backup format version: {}",
            archive.format_version
        )));
    }
    Ok(archive)
}

fn latest_backup(layout: &BackupLayout) -> Result<Option<String>> {
    let mut newest: Option<(DateTime<Utc>, String)> = None;
    for id in layout.complete_backups()? {
        let Ok(archive) = load_archive(layout, &id) else {
            continue;
        };
        if newest.as_ref().is_none_or(|(at, _)| archive.created_at > *at) {
            newest = Some((archive.created_at, id));
        }
    }
    Ok(newest.map(|(_, id)| id))
}

fn manifest_digest(
    backup_id: &str,
    source_vault_id: &str,
    drive_id: &str,
    created_at: &DateTime<Utc>,
    recovery_phrase_hash: &str,
    manifest: &[ManifestEntry],
) -> String {
    let mut text = format!(
        "coldvault-backup v{ARCHIVE_VERSION}\n{backup_id}\n{source_vault_id}\n{drive_id}\n{}\n{recovery_phrase_hash}\n{}\n",
        created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        manifest.len(),
    );
    for entry in manifest {
        text.push_str(&format!("{} {}\n", entry.item_id, entry.content_hash));
    }
    content_hash(text.as_bytes())
}

/// Re-wrap one item under the sealing secret and flush it to `path`.
fn write_entry(
    engine: &CryptoEngine,
    item: VaultItem,
    path: &Path,
    vault_password: &str,
    sealing_secret: &str,
) -> Result<ManifestEntry> {
    let envelope = engine.rewrap(&item.private_key_envelope, vault_password, sealing_secret)?;
    let entry = BackupEntry {
        item: ItemMetadata::from(&item),
        envelope,
    };
    let bytes = serde_json::to_vec_pretty(&entry)?;
    write_durable(path, &bytes)?;

    Ok(ManifestEntry {
        item_id: item.id,
        content_hash: content_hash(&bytes),
    })
}

/// Read, hash-check and decrypt one item file. `None` on any mismatch.
fn open_entry(
    engine: &CryptoEngine,
    path: &Path,
    expected: &ManifestEntry,
    password: &str,
) -> Option<RestoredItem> {
    let bytes = fs::read(path).ok()?;
    if content_hash(&bytes) != expected.content_hash {
        return None;
    }
    let entry: BackupEntry = serde_json::from_slice(&bytes).ok()?;
    if entry.item.id != expected.item_id {
        return None;
    }
    let secret = engine.decrypt(&entry.envelope, password).ok()?;

    Some(RestoredItem {
        metadata: entry.item,
        secret,
    })
}
