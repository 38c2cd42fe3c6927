use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::EncryptionEnvelope;
use crate::error::VaultError;

/// Blockchain family a key belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum KeyFamily {
    Bitcoin,
    Ethereum,
    Cosmos,
    /// Any other chain, by name.
    Custom(String),
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFamily::Bitcoin => f.write_str("bitcoin"),
            KeyFamily::Ethereum => f.write_str("ethereum"),
            KeyFamily::Cosmos => f.write_str("cosmos"),
            KeyFamily::Custom(name) => f.write_str(name),
        }
    }
}

impl FromStr for KeyFamily {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "" => Err(VaultError::validation("key family is required")),
            "bitcoin" => Ok(KeyFamily::Bitcoin),
            "ethereum" => Ok(KeyFamily::Ethereum),
            "cosmos" => Ok(KeyFamily::Cosmos),
            _ => Ok(KeyFamily::Custom(s.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyRole {
    #[default]
    Standard,
    Genesis,
    Validator,
    Treasury,
    Governance,
    Emergency,
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyRole::Standard => "standard",
            KeyRole::Genesis => "genesis",
            KeyRole::Validator => "validator",
            KeyRole::Treasury => "treasury",
            KeyRole::Governance => "governance",
            KeyRole::Emergency => "emergency",
        };
        f.write_str(name)
    }
}

impl FromStr for KeyRole {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(KeyRole::Standard),
            "genesis" => Ok(KeyRole::Genesis),
            "validator" => Ok(KeyRole::Validator),
            "treasury" => Ok(KeyRole::Treasury),
            "governance" => Ok(KeyRole::Governance),
            "emergency" => Ok(KeyRole::Emergency),
            other => Err(VaultError::validation(format!("unknown key role: {other}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Active,
    Trashed,
}

/// A stored key. The private key only exists inside `private_key_envelope`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VaultItem {
    pub id: String,
    pub vault_id: String,
    pub key_family: KeyFamily,
    pub role: KeyRole,
    pub network: String,
    pub public_identifier: String,
    pub public_key: String,
    pub private_key_envelope: EncryptionEnvelope,
    pub entropy_source: String,
    pub quantum_enhanced: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub lifecycle_state: LifecycleState,
}

/// Everything about an item except its envelope, of which only the encoded
/// length is reported.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub id: String,
    pub vault_id: String,
    pub key_family: KeyFamily,
    pub role: KeyRole,
    pub network: String,
    pub public_identifier: String,
    pub public_key: String,
    pub entropy_source: String,
    pub quantum_enhanced: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub lifecycle_state: LifecycleState,
    pub envelope_len: usize,
}

impl From<&VaultItem> for ItemMetadata {
    fn from(item: &VaultItem) -> Self {
        Self {
            id: item.id.clone(),
            vault_id: item.vault_id.clone(),
            key_family: item.key_family.clone(),
            role: item.role,
            network: item.network.clone(),
            public_identifier: item.public_identifier.clone(),
            public_key: item.public_key.clone(),
            entropy_source: item.entropy_source.clone(),
            quantum_enhanced: item.quantum_enhanced,
            created_at: item.created_at,
            last_used: item.last_used,
            lifecycle_state: item.lifecycle_state,
            envelope_len: item.private_key_envelope.encoded_len(),
        }
    }
}

/// Input for `SecretStore::put_item`.
pub struct NewItem {
    pub key_family: KeyFamily,
    pub role: KeyRole,
    pub network: String,
    pub public_identifier: String,
    pub public_key: String,
    pub entropy_source: String,
    pub quantum_enhanced: bool,
    pub secret: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for NewItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewItem")
            .field("key_family", &self.key_family)
            .field("role", &self.role)
            .field("network", &self.network)
            .field("public_identifier", &self.public_identifier)
            .field("secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// An item read back from a backup: its metadata plus the decrypted secret.
pub struct RestoredItem {
    pub metadata: ItemMetadata,
    pub secret: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for RestoredItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoredItem")
            .field("metadata", &self.metadata)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VaultRecord {
    pub id: String,
    pub name: String,
    /// Canary sealed under the vault password.
    pub canary: EncryptionEnvelope,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VaultInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub active_items: usize,
    pub trashed_items: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    Drive,
    Vault,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Drive => f.write_str("drive"),
            TargetKind::Vault => f.write_str("vault"),
        }
    }
}

/// Who a stored password belongs to and what it unlocks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PasswordScope {
    pub owner_id: String,
    pub target_id: String,
    pub target_kind: TargetKind,
}

impl PasswordScope {
    pub fn drive(owner_id: impl Into<String>, drive_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            target_id: drive_id.into(),
            target_kind: TargetKind::Drive,
        }
    }

    pub fn vault(owner_id: impl Into<String>, vault_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            target_id: vault_id.into(),
            target_kind: TargetKind::Vault,
        }
    }
}

impl fmt::Display for PasswordScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.owner_id, self.target_kind, self.target_id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredPassword {
    pub id: String,
    pub scope: PasswordScope,
    pub envelope: EncryptionEnvelope,
    pub hint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Stored password without its envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PasswordInfo {
    pub id: String,
    pub scope: PasswordScope,
    pub hint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

impl From<&StoredPassword> for PasswordInfo {
    fn from(stored: &StoredPassword) -> Self {
        Self {
            id: stored.id.clone(),
            scope: stored.scope.clone(),
            hint: stored.hint.clone(),
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            last_used: stored.last_used,
        }
    }
}

/// Outcome of importing restored items into a vault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: Vec<String>,
    /// Ids already present in the store, left untouched.
    pub skipped: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_family_parses_known_and_custom() {
        assert_eq!("Bitcoin".parse::<KeyFamily>().unwrap(), KeyFamily::Bitcoin);
        assert_eq!(
            "zap-chain".parse::<KeyFamily>().unwrap(),
            KeyFamily::Custom("zap-chain".into())
        );
        assert!("".parse::<KeyFamily>().is_err());
    }

    #[test]
    fn key_role_parses() {
        assert_eq!("treasury".parse::<KeyRole>().unwrap(), KeyRole::Treasury);
        assert!("root".parse::<KeyRole>().is_err());
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let item = NewItem {
            key_family: KeyFamily::Ethereum,
            role: KeyRole::Standard,
            network: "mainnet".into(),
            public_identifier: "0xabc".into(),
            public_key: "04ff".into(),
            entropy_source: "os".into(),
            quantum_enhanced: false,
            secret: Zeroizing::new(b"super-secret-key".to_vec()),
        };

        let rendered = format!("{item:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("super-secret-key"));
    }
}
