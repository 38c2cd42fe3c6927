//! Content hashing for backup manifests, and recovery phrases: generation,
//! one-way hashing, and binding a phrase into a backup's sealing secret.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use bip39::Mnemonic;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::aead::{generate_salt, secure_random};
use super::kdf::KdfParams;
use crate::error::{Result, VaultError};

/// Hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Argon2id PHC string of a recovery phrase. The phrase is normalised first
/// (whitespace collapsed, lowercased) so re-typing it with different spacing
/// still matches.
pub fn hash_recovery_phrase(phrase: &str, kdf: KdfParams) -> Result<String> {
    let normalized = normalize_phrase(phrase)?;
    let salt = generate_salt()?;
    let salt = SaltString::encode_b64(&salt)
        .map_err(|e| VaultError::validation(format!("salt encoding failed: {e}")))?;

    let params = Params::new(kdf.mem_cost_kib(), kdf.time_cost(), kdf.parallelism(), None)
        .map_err(|e| VaultError::validation(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let hash = argon2
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|e| VaultError::validation(format!("recovery phrase hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Checks `phrase` against a stored PHC string. Never errors; a malformed
/// stored hash simply does not match.
pub fn verify_recovery_phrase(phrase: &str, stored_hash: &str) -> bool {
    let Ok(normalized) = normalize_phrase(phrase) else {
        return false;
    };
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(normalized.as_bytes(), &parsed)
        .is_ok()
}

/// Fresh 24-word BIP-39 phrase from 256 bits of OS entropy.
pub fn generate_recovery_phrase() -> Result<Zeroizing<String>> {
    let mut entropy = Zeroizing::new([0u8; 32]);
    secure_random(&mut entropy[..])?;
    let mnemonic = Mnemonic::from_entropy(&entropy[..])
        .map_err(|e| VaultError::validation(format!("mnemonic generation failed: {e}")))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Secret that backup items and the manifest seal are encrypted under. Both
/// the backup password and the recovery phrase are needed to rebuild it.
pub fn bind_recovery_phrase(password: &str, phrase: &str) -> Result<Zeroizing<String>> {
    let normalized = normalize_phrase(phrase)?;
    Ok(Zeroizing::new(format!("{password}\n{}", normalized.as_str())))
}

fn normalize_phrase(phrase: &str) -> Result<Zeroizing<String>> {
    let normalized = Zeroizing::new(
        phrase
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    );
    if normalized.is_empty() {
        return Err(VaultError::validation("recovery phrase is required"));
    }
    Ok(normalized)
}
