//! Persistent mapping of vault items and stored passwords to encryption
//! envelopes.
//!
//! The store file holds metadata in the clear and every secret as an
//! envelope. Opening it needs the master password, which seals the stored
//! passwords and a master canary. Each vault has its own password, checked
//! against the vault canary before anything is sealed into it.

pub mod model;

pub use model::{
    ImportReport, ItemMetadata, KeyFamily, KeyRole, LifecycleState, NewItem, PasswordInfo,
    PasswordScope, RestoredItem, StoredPassword, TargetKind, VaultInfo, VaultItem, VaultRecord,
};

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{CryptoEngine, EncryptionEnvelope, require_password};
use crate::error::{RecordKind, Result, VaultError};
use crate::storage::Storage;

const STORE_VERSION: u8 = 1;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoreState {
    version: u8,
    created_at: chrono::DateTime<Utc>,
    master_canary: EncryptionEnvelope,
    vaults: BTreeMap<String, VaultRecord>,
    items: BTreeMap<String, VaultItem>,
    passwords: BTreeMap<String, StoredPassword>,
}

impl StoreState {
    fn vault(&self, vault_id: &str) -> Result<&VaultRecord> {
        self.vaults
            .get(vault_id)
            .ok_or_else(|| VaultError::not_found(RecordKind::Vault, vault_id))
    }

    fn item(&self, item_id: &str) -> Result<&VaultItem> {
        self.items
            .get(item_id)
            .ok_or_else(|| VaultError::not_found(RecordKind::Item, item_id))
    }

    fn item_mut(&mut self, item_id: &str) -> Result<&mut VaultItem> {
        self.items
            .get_mut(item_id)
            .ok_or_else(|| VaultError::not_found(RecordKind::Item, item_id))
    }

    fn password_id(&self, scope: &PasswordScope) -> Option<String> {
        self.passwords
            .values()
            .find(|p| &p.scope == scope)
            .map(|p| p.id.clone())
    }

    fn items_in(&self, vault_id: &str, state: LifecycleState) -> Vec<&VaultItem> {
        self.items
            .values()
            .filter(|i| i.vault_id == vault_id && i.lifecycle_state == state)
            .collect()
    }
}

/// Encrypted-at-rest store of vaults, items and stored passwords.
///
/// Shared across workers behind an `Arc`. Key derivation and AEAD run
/// outside the internal lock so independent decrypts proceed in parallel.
pub struct SecretStore {
    storage: Storage,
    engine: CryptoEngine,
    master: Zeroizing<String>,
    state: RwLock<StoreState>,
}

impl SecretStore {
    /// Create a new store sealed by `master`.
    pub fn init(storage: Storage, engine: CryptoEngine, master: Zeroizing<String>) -> Result<Self> {
        if storage.exists() {
            return Err(VaultError::validation(format!(
                "store already exists at {}",
                storage.path().display()
            )));
        }

        let master_canary = engine.seal_canary(&master)?;
        let state = StoreState {
            version: STORE_VERSION,
            created_at: Utc::now(),
            master_canary,
            vaults: BTreeMap::new(),
            items: BTreeMap::new(),
            passwords: BTreeMap::new(),
        };
        storage.save_json(&state)?;
        info!(path = %storage.path().display(), "store initialized");

        Ok(Self {
            storage,
            engine,
            master,
            state: RwLock::new(state),
        })
    }

    /// Open an existing store; a wrong master password is
    /// `AuthenticationFailed`.
    pub fn open(storage: Storage, engine: CryptoEngine, master: Zeroizing<String>) -> Result<Self> {
        let state: StoreState = storage.load_json()?.ok_or_else(|| {
            VaultError::validation(format!(
                "store does not exist at {}",
                storage.path().display()
            ))
        })?;

        if state.version != STORE_VERSION {
            return Err(VaultError::validation(format!(
                "unsupported store version: {}",
                state.version
            )));
        }

        if !engine.verify_password(&state.master_canary, &master) {
            return Err(VaultError::AuthenticationFailed);
        }

        Ok(Self {
            storage,
            engine,
            master,
            state: RwLock::new(state),
        })
    }

    pub fn engine(&self) -> &CryptoEngine {
        &self.engine
    }

    // ---------------------------------------------------------------
    // vaults
    // ---------------------------------------------------------------

    pub fn create_vault(&self, name: &str, password: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VaultError::validation("vault name is required"));
        }
        let canary = self.engine.seal_canary(password)?;

        let id = Uuid::new_v4().to_string();
        self.commit(|state| {
            if state.vaults.values().any(|v| v.name == name) {
                return Err(VaultError::AlreadyExists {
                    kind: RecordKind::Vault,
                    id: name.to_string(),
                });
            }
            state.vaults.insert(
                id.clone(),
                VaultRecord {
                    id: id.clone(),
                    name: name.to_string(),
                    canary,
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })?;

        info!(vault_id = %id, "vault created");
        Ok(id)
    }

    pub fn list_vaults(&self) -> Result<Vec<VaultInfo>> {
        let state = self.read()?;
        Ok(state
            .vaults
            .values()
            .map(|v| VaultInfo {
                id: v.id.clone(),
                name: v.name.clone(),
                created_at: v.created_at,
                active_items: state.items_in(&v.id, LifecycleState::Active).len(),
                trashed_items: state.items_in(&v.id, LifecycleState::Trashed).len(),
            })
            .collect())
    }

    /// Look a vault up by id, falling back to its name.
    pub fn resolve_vault(&self, id_or_name: &str) -> Result<String> {
        let state = self.read()?;
        if state.vaults.contains_key(id_or_name) {
            return Ok(id_or_name.to_string());
        }
        state
            .vaults
            .values()
            .find(|v| v.name == id_or_name)
            .map(|v| v.id.clone())
            .ok_or_else(|| VaultError::not_found(RecordKind::Vault, id_or_name))
    }

    pub fn verify_vault_password(&self, vault_id: &str, password: &str) -> Result<bool> {
        let canary = self.read()?.vault(vault_id)?.canary.clone();
        Ok(self.engine.verify_password(&canary, password))
    }

    /// Re-wrap every item of the vault, and its canary, under `new`.
    /// Returns how many items were re-wrapped.
    pub fn rotate_vault_password(&self, vault_id: &str, old: &str, new: &str) -> Result<usize> {
        self.engine.check_password_policy(new)?;

        // Held for the whole rotation so no item lands under the old password
        // half way through.
        let mut guard = self.write()?;
        let mut draft = guard.clone();

        let vault = draft.vault(vault_id)?;
        if !self.engine.verify_password(&vault.canary, old) {
            return Err(VaultError::AuthenticationFailed);
        }
        let canary = self.engine.seal_canary(new)?;

        let mut rewrapped = 0;
        for item in draft.items.values_mut().filter(|i| i.vault_id == vault_id) {
            item.private_key_envelope =
                self.engine
                    .rewrap(&item.private_key_envelope, old, new)?;
            rewrapped += 1;
        }
        if let Some(vault) = draft.vaults.get_mut(vault_id) {
            vault.canary = canary;
        }

        self.storage.save_json(&draft)?;
        *guard = draft;

        info!(vault_id, rewrapped, "vault password rotated");
        Ok(rewrapped)
    }

    // ---------------------------------------------------------------
    // items
    // ---------------------------------------------------------------

    pub fn put_item(&self, vault_id: &str, vault_password: &str, new: NewItem) -> Result<String> {
        if new.public_identifier.trim().is_empty() {
            return Err(VaultError::validation("public identifier is required"));
        }
        if new.secret.is_empty() {
            return Err(VaultError::validation("secret is empty"));
        }

        let canary = self.read()?.vault(vault_id)?.canary.clone();
        if !self.engine.verify_password(&canary, vault_password) {
            return Err(VaultError::AuthenticationFailed);
        }

        let envelope = self.engine.encrypt(&new.secret, vault_password)?;
        let id = Uuid::new_v4().to_string();

        let item = VaultItem {
            id: id.clone(),
            vault_id: vault_id.to_string(),
            key_family: new.key_family,
            role: new.role,
            network: new.network,
            public_identifier: new.public_identifier,
            public_key: new.public_key,
            private_key_envelope: envelope,
            entropy_source: new.entropy_source,
            quantum_enhanced: new.quantum_enhanced,
            created_at: Utc::now(),
            last_used: None,
            lifecycle_state: LifecycleState::Active,
        };

        self.commit(|state| {
            // A rotation in between would leave this item under a stale password.
            if state.vault(vault_id)?.canary != canary {
                return Err(VaultError::AuthenticationFailed);
            }
            state.items.insert(id.clone(), item);
            Ok(())
        })?;

        debug!(vault_id, item_id = %id, "item stored");
        Ok(id)
    }

    pub fn get_item_metadata(&self, item_id: &str) -> Result<ItemMetadata> {
        Ok(ItemMetadata::from(self.read()?.item(item_id)?))
    }

    /// Active items of a vault.
    pub fn list_items(&self, vault_id: &str) -> Result<Vec<ItemMetadata>> {
        self.list_in(vault_id, LifecycleState::Active)
    }

    /// Trashed items of a vault.
    pub fn list_trash(&self, vault_id: &str) -> Result<Vec<ItemMetadata>> {
        self.list_in(vault_id, LifecycleState::Trashed)
    }

    fn list_in(&self, vault_id: &str, lifecycle: LifecycleState) -> Result<Vec<ItemMetadata>> {
        let state = self.read()?;
        state.vault(vault_id)?;
        Ok(state
            .items_in(vault_id, lifecycle)
            .into_iter()
            .map(ItemMetadata::from)
            .collect())
    }

    /// Full records of the active items, envelopes included. Used by backups.
    pub(crate) fn active_items(&self, vault_id: &str) -> Result<Vec<VaultItem>> {
        let state = self.read()?;
        state.vault(vault_id)?;
        Ok(state
            .items_in(vault_id, LifecycleState::Active)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Decrypt an item's secret for the caller. The plaintext is never kept.
    pub fn decrypt_item(&self, item_id: &str, password: &str) -> Result<Zeroizing<Vec<u8>>> {
        let envelope = self.read()?.item(item_id)?.private_key_envelope.clone();
        let plaintext = self.engine.decrypt(&envelope, password)?;

        let touched = self.commit(|state| {
            state.item_mut(item_id)?.last_used = Some(Utc::now());
            Ok(())
        });
        if let Err(err) = touched {
            warn!(item_id, "failed to record last use: {err}");
        }

        Ok(plaintext)
    }

    pub fn trash_item(&self, item_id: &str) -> Result<()> {
        self.set_lifecycle(item_id, LifecycleState::Trashed)
    }

    pub fn restore_item(&self, item_id: &str) -> Result<()> {
        self.set_lifecycle(item_id, LifecycleState::Active)
    }

    fn set_lifecycle(&self, item_id: &str, lifecycle: LifecycleState) -> Result<()> {
        self.commit(|state| {
            state.item_mut(item_id)?.lifecycle_state = lifecycle;
            Ok(())
        })?;
        debug!(item_id, ?lifecycle, "item lifecycle changed");
        Ok(())
    }

    /// Irreversibly delete a trashed item.
    pub fn purge_item(&self, item_id: &str) -> Result<()> {
        self.commit(|state| {
            if state.item(item_id)?.lifecycle_state != LifecycleState::Trashed {
                return Err(VaultError::validation(format!(
                    "item '{item_id}' must be trashed before it can be purged"
                )));
            }
            state.items.remove(item_id);
            Ok(())
        })?;
        info!(item_id, "item purged");
        Ok(())
    }

    /// Seal restored items into a vault under its password. Items whose id
    /// already exists are skipped.
    pub fn import_items(
        &self,
        vault_id: &str,
        vault_password: &str,
        restored: &[RestoredItem],
    ) -> Result<ImportReport> {
        let (canary, existing) = {
            let state = self.read()?;
            let canary = state.vault(vault_id)?.canary.clone();
            let existing: Vec<String> = restored
                .iter()
                .filter(|r| state.items.contains_key(&r.metadata.id))
                .map(|r| r.metadata.id.clone())
                .collect();
            (canary, existing)
        };
        if !self.engine.verify_password(&canary, vault_password) {
            return Err(VaultError::AuthenticationFailed);
        }

        let mut sealed = Vec::new();
        for r in restored.iter().filter(|r| !existing.contains(&r.metadata.id)) {
            let meta = &r.metadata;
            sealed.push(VaultItem {
                id: meta.id.clone(),
                vault_id: vault_id.to_string(),
                key_family: meta.key_family.clone(),
                role: meta.role,
                network: meta.network.clone(),
                public_identifier: meta.public_identifier.clone(),
                public_key: meta.public_key.clone(),
                private_key_envelope: self.engine.encrypt(&r.secret, vault_password)?,
                entropy_source: meta.entropy_source.clone(),
                quantum_enhanced: meta.quantum_enhanced,
                created_at: meta.created_at,
                last_used: meta.last_used,
                lifecycle_state: LifecycleState::Active,
            });
        }

        let mut report = ImportReport {
            skipped: existing,
            ..Default::default()
        };
        self.commit(|state| {
            if state.vault(vault_id)?.canary != canary {
                return Err(VaultError::AuthenticationFailed);
            }
            for item in sealed {
                if state.items.contains_key(&item.id) {
                    report.skipped.push(item.id);
                    continue;
                }
                report.imported.push(item.id.clone());
                state.items.insert(item.id.clone(), item);
            }
            Ok(())
        })?;

        info!(
            vault_id,
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            "items imported"
        );
        Ok(report)
    }

    // ---------------------------------------------------------------
    // stored passwords
    // ---------------------------------------------------------------

    /// Store (or replace) the password for `scope`. One entry per scope.
    pub fn put_password(
        &self,
        scope: &PasswordScope,
        password: &str,
        hint: Option<String>,
    ) -> Result<String> {
        validate_scope(scope)?;
        require_password(password)?;

        let envelope = self.engine.encrypt(password.as_bytes(), &self.master)?;
        let now = Utc::now();

        let id = self.commit(|state| {
            let id = match state.password_id(scope) {
                Some(id) => {
                    if let Some(existing) = state.passwords.get_mut(&id) {
                        existing.envelope = envelope;
                        existing.hint = hint;
                        existing.updated_at = now;
                    }
                    id
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    state.passwords.insert(
                        id.clone(),
                        StoredPassword {
                            id: id.clone(),
                            scope: scope.clone(),
                            envelope,
                            hint,
                            created_at: now,
                            updated_at: now,
                            last_used: None,
                        },
                    );
                    id
                }
            };
            Ok(id)
        })?;

        debug!(password_id = %id, target_kind = %scope.target_kind, "stored password saved");
        Ok(id)
    }

    /// Recover the stored password for `scope`. Callers must never log the
    /// result.
    pub fn get_password(&self, scope: &PasswordScope) -> Result<Zeroizing<String>> {
        let (id, envelope) = {
            let state = self.read()?;
            let id = state
                .password_id(scope)
                .ok_or_else(|| VaultError::not_found(RecordKind::Password, scope.to_string()))?;
            let envelope = state.passwords[&id].envelope.clone();
            (id, envelope)
        };

        let plaintext = self.engine.decrypt(&envelope, &self.master)?;
        let password = Zeroizing::new(
            String::from_utf8(plaintext.to_vec())
                .map_err(|_| VaultError::Serialization("stored password is not UTF-8".into()))?,
        );

        let touched = self.commit(|state| {
            if let Some(stored) = state.passwords.get_mut(&id) {
                stored.last_used = Some(Utc::now());
            }
            Ok(())
        });
        if let Err(err) = touched {
            warn!(password_id = %id, "failed to record last use: {err}");
        }

        Ok(password)
    }

    /// Replace the hint of an existing entry without touching the password.
    pub fn update_password_hint(&self, scope: &PasswordScope, hint: Option<String>) -> Result<()> {
        validate_scope(scope)?;
        self.commit(|state| {
            let stored = state
                .password_id(scope)
                .and_then(|id| state.passwords.get_mut(&id))
                .ok_or_else(|| VaultError::not_found(RecordKind::Password, scope.to_string()))?;
            stored.hint = hint;
            stored.updated_at = Utc::now();
            Ok(())
        })?;

        debug!(target_kind = %scope.target_kind, "stored password hint updated");
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub fn delete_password(&self, scope: &PasswordScope) -> Result<bool> {
        self.commit(|state| {
            Ok(match state.password_id(scope) {
                Some(id) => state.passwords.remove(&id).is_some(),
                None => false,
            })
        })
    }

    pub fn list_passwords(&self, owner_id: &str) -> Result<Vec<PasswordInfo>> {
        Ok(self
            .read()?
            .passwords
            .values()
            .filter(|p| p.scope.owner_id == owner_id)
            .map(PasswordInfo::from)
            .collect())
    }

    // ---------------------------------------------------------------

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|err| VaultError::Storage(format!("lock poisoned: {err}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|err| VaultError::Storage(format!("lock poisoned: {err}")))
    }

    /// Apply `f` to a copy of the state, persist the copy, then publish it.
    /// Memory and disk never diverge when either step fails.
    fn commit<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut guard = self.write()?;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        self.storage.save_json(&draft)?;
        *guard = draft;
        Ok(out)
    }
}

fn validate_scope(scope: &PasswordScope) -> Result<()> {
    if scope.owner_id.trim().is_empty() {
        return Err(VaultError::validation("owner id is required"));
    }
    if scope.target_id.trim().is_empty() {
        return Err(VaultError::validation("target id is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_engine;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    const MASTER: &str = "master-password";
    const VAULT_PW: &str = "vault-password";

    fn new_store() -> (TempDir, SecretStore) {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("store.json"));
        let store =
            SecretStore::init(storage, test_engine(), Zeroizing::new(MASTER.to_string())).unwrap();
        (dir, store)
    }

    fn new_item(public_identifier: &str, secret: &[u8]) -> NewItem {
        NewItem {
            key_family: KeyFamily::Bitcoin,
            role: KeyRole::Treasury,
            network: "testnet".into(),
            public_identifier: public_identifier.into(),
            public_key: "02abcdef".into(),
            entropy_source: "os-rng".into(),
            quantum_enhanced: false,
            secret: Zeroizing::new(secret.to_vec()),
        }
    }

    #[test]
    fn init_fails_if_store_exists() {
        let (dir, _store) = new_store();
        let storage = Storage::new(dir.path().join("store.json"));

        assert!(matches!(
            SecretStore::init(storage, test_engine(), Zeroizing::new(MASTER.into())),
            Err(VaultError::Validation(_))
        ));
    }

    #[test]
    fn open_with_wrong_master_fails() {
        let (dir, _store) = new_store();
        let storage = Storage::new(dir.path().join("store.json"));

        assert!(matches!(
            SecretStore::open(storage.clone(), test_engine(), Zeroizing::new("wrong-master".into())),
            Err(VaultError::AuthenticationFailed)
        ));
        assert!(SecretStore::open(storage, test_engine(), Zeroizing::new(MASTER.into())).is_ok());
    }

    #[test]
    fn open_missing_store_fails() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("nope.json"));

        assert!(SecretStore::open(storage, test_engine(), Zeroizing::new(MASTER.into())).is_err());
    }

    #[test]
    fn items_persist_across_reopen() {
        let (dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        let id = store.put_item(&vault, VAULT_PW, new_item("bc1qxyz", b"k1")).unwrap();
        drop(store);

        let storage = Storage::new(dir.path().join("store.json"));
        let store = SecretStore::open(storage, test_engine(), Zeroizing::new(MASTER.into())).unwrap();

        assert_eq!(store.decrypt_item(&id, VAULT_PW).unwrap().as_slice(), b"k1");
    }

    #[test]
    fn store_file_holds_no_plaintext() {
        let (dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        store
            .put_item(&vault, VAULT_PW, new_item("bc1q", b"PLAINTEXT-KEY-MATERIAL"))
            .unwrap();
        store
            .put_password(&PasswordScope::drive("u1", "d1"), "PLAINTEXT-DRIVE-PW", None)
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("store.json")).unwrap();
        assert!(!raw.contains("PLAINTEXT-KEY-MATERIAL"));
        assert!(!raw.contains("PLAINTEXT-DRIVE-PW"));
        assert!(!raw.contains(MASTER));
    }

    #[test]
    fn duplicate_vault_name_fails() {
        let (_dir, store) = new_store();
        store.create_vault("main", VAULT_PW).unwrap();

        assert!(matches!(
            store.create_vault("main", VAULT_PW),
            Err(VaultError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn resolve_vault_by_name_or_id() {
        let (_dir, store) = new_store();
        let id = store.create_vault("cold", VAULT_PW).unwrap();

        assert_eq!(store.resolve_vault("cold").unwrap(), id);
        assert_eq!(store.resolve_vault(&id).unwrap(), id);
        assert!(store.resolve_vault("warm").is_err());
    }

    #[test]
    fn put_item_checks_vault_password() {
        let (_dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();

        assert!(matches!(
            store.put_item(&vault, "not-the-password", new_item("a", b"k")),
            Err(VaultError::AuthenticationFailed)
        ));
        assert!(matches!(
            store.put_item("missing", VAULT_PW, new_item("a", b"k")),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn metadata_exposes_only_envelope_length() {
        let (_dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        let id = store.put_item(&vault, VAULT_PW, new_item("addr", b"0123456789")).unwrap();

        let meta = store.get_item_metadata(&id).unwrap();
        assert_eq!(meta.public_identifier, "addr");
        assert!(meta.envelope_len > 10);

        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("private_key_envelope"));
    }

    #[test]
    fn decrypt_item_errors() {
        let (_dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        let id = store.put_item(&vault, VAULT_PW, new_item("a", b"k")).unwrap();

        assert!(matches!(
            store.decrypt_item(&id, "wrong-password"),
            Err(VaultError::AuthenticationFailed)
        ));
        assert!(matches!(
            store.decrypt_item("missing", VAULT_PW),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn decrypt_item_records_last_use() {
        let (_dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        let id = store.put_item(&vault, VAULT_PW, new_item("a", b"k")).unwrap();
        assert!(store.get_item_metadata(&id).unwrap().last_used.is_none());

        store.decrypt_item(&id, VAULT_PW).unwrap();

        assert!(store.get_item_metadata(&id).unwrap().last_used.is_some());
    }

    #[test]
    fn trash_restore_and_purge() {
        let (_dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        let id = store.put_item(&vault, VAULT_PW, new_item("a", b"k")).unwrap();

        assert!(store.purge_item(&id).is_err());

        store.trash_item(&id).unwrap();
        assert!(store.list_items(&vault).unwrap().is_empty());
        assert_eq!(store.list_trash(&vault).unwrap().len(), 1);

        store.restore_item(&id).unwrap();
        assert_eq!(store.list_items(&vault).unwrap().len(), 1);

        store.trash_item(&id).unwrap();
        store.purge_item(&id).unwrap();
        assert!(matches!(
            store.get_item_metadata(&id),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn rotation_rewraps_items() {
        let (_dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        let a = store.put_item(&vault, VAULT_PW, new_item("a", b"ka")).unwrap();
        let b = store.put_item(&vault, VAULT_PW, new_item("b", b"kb")).unwrap();
        store.trash_item(&b).unwrap();

        assert!(matches!(
            store.rotate_vault_password(&vault, "wrong-password", "new-vault-password"),
            Err(VaultError::AuthenticationFailed)
        ));
        assert_eq!(
            store
                .rotate_vault_password(&vault, VAULT_PW, "new-vault-password")
                .unwrap(),
            2
        );

        assert!(store.decrypt_item(&a, VAULT_PW).is_err());
        assert_eq!(
            store.decrypt_item(&a, "new-vault-password").unwrap().as_slice(),
            b"ka"
        );
        assert_eq!(
            store.decrypt_item(&b, "new-vault-password").unwrap().as_slice(),
            b"kb"
        );
        assert!(store.verify_vault_password(&vault, "new-vault-password").unwrap());
    }

    #[test]
    fn stored_password_scenario() {
        let (_dir, store) = new_store();
        let d1 = PasswordScope::drive("u1", "d1");
        let d2 = PasswordScope::drive("u1", "d2");

        store.put_password(&d1, "drive-one-secret", Some("usual".into())).unwrap();

        assert_eq!(store.get_password(&d1).unwrap().as_str(), "drive-one-secret");
        assert!(matches!(
            store.get_password(&d2),
            Err(VaultError::NotFound { .. })
        ));
        // Another owner does not hold the scope.
        assert!(store.get_password(&PasswordScope::drive("u2", "d1")).is_err());
    }

    #[test]
    fn stored_password_is_unique_per_scope() {
        let (_dir, store) = new_store();
        let scope = PasswordScope::vault("u1", "v1");

        let first = store.put_password(&scope, "one", None).unwrap();
        let second = store.put_password(&scope, "two", Some("new".into())).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get_password(&scope).unwrap().as_str(), "two");
        let listed = store.list_passwords("u1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hint.as_deref(), Some("new"));
        assert!(listed[0].last_used.is_some());
    }

    #[test]
    fn hint_changes_without_the_password() {
        let (_dir, store) = new_store();
        let scope = PasswordScope::drive("u1", "d1");
        store.put_password(&scope, "drive-secret", Some("old".into())).unwrap();

        store.update_password_hint(&scope, Some("blue stick".into())).unwrap();
        assert_eq!(store.list_passwords("u1").unwrap()[0].hint.as_deref(), Some("blue stick"));
        assert_eq!(store.get_password(&scope).unwrap().as_str(), "drive-secret");

        store.update_password_hint(&scope, None).unwrap();
        assert_eq!(store.list_passwords("u1").unwrap()[0].hint, None);

        assert!(matches!(
            store.update_password_hint(&PasswordScope::drive("u1", "d2"), None),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_password_is_idempotent() {
        let (_dir, store) = new_store();
        let scope = PasswordScope::drive("u1", "d1");
        store.put_password(&scope, "pw", None).unwrap();

        assert!(store.delete_password(&scope).unwrap());
        assert!(!store.delete_password(&scope).unwrap());
        assert!(store.get_password(&scope).is_err());
    }

    #[test]
    fn empty_password_or_scope_is_rejected() {
        let (_dir, store) = new_store();

        assert!(matches!(
            store.put_password(&PasswordScope::drive("u1", "d1"), "", None),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            store.put_password(&PasswordScope::drive("", "d1"), "pw", None),
            Err(VaultError::Validation(_))
        ));
    }

    #[test]
    fn import_skips_existing_ids() {
        let (_dir, store) = new_store();
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        let id = store.put_item(&vault, VAULT_PW, new_item("a", b"ka")).unwrap();
        let mut meta = store.get_item_metadata(&id).unwrap();

        let existing = RestoredItem {
            metadata: meta.clone(),
            secret: Zeroizing::new(b"ka".to_vec()),
        };
        meta.id = "restored-1".into();
        let fresh = RestoredItem {
            metadata: meta,
            secret: Zeroizing::new(b"kb".to_vec()),
        };

        let report = store.import_items(&vault, VAULT_PW, &[existing, fresh]).unwrap();

        assert_eq!(report.imported, vec!["restored-1".to_string()]);
        assert_eq!(report.skipped, vec![id]);
        assert_eq!(
            store.decrypt_item("restored-1", VAULT_PW).unwrap().as_slice(),
            b"kb"
        );
    }

    #[test]
    fn parallel_decrypts_are_independent() {
        let (_dir, store) = new_store();
        let store = Arc::new(store);
        let vault = store.create_vault("main", VAULT_PW).unwrap();
        let ids: Vec<_> = (0..4)
            .map(|i| {
                store
                    .put_item(&vault, VAULT_PW, new_item(&format!("a{i}"), format!("k{i}").as_bytes()))
                    .unwrap()
            })
            .collect();

        let handles: Vec<_> = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let pt = store.decrypt_item(&id, VAULT_PW).unwrap();
                    assert_eq!(pt.as_slice(), format!("k{i}").as_bytes());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
