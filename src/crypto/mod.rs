//! Password-based authenticated encryption.
//!
//! Every secret at rest is an [`EncryptionEnvelope`]: Argon2id derives a key
//! from the caller's password and a fresh salt, XChaCha20-Poly1305 encrypts
//! under a fresh nonce, and the envelope header is authenticated alongside
//! the ciphertext.

pub mod aead;
pub mod digest;
pub mod envelope;
pub mod kdf;

pub use envelope::{Algorithm, EncryptionEnvelope};
pub use kdf::KdfParams;

use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Length of the salt (16 bytes).
pub const SALT_LEN: usize = 16;
/// Length of the nonce (24 bytes for XChaCha20-Poly1305).
pub const NONCE_LEN: usize = 24;
/// Length of the encryption key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;
/// Length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;
/// Default minimum password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Known plaintext sealed into canary envelopes.
const CANARY: &[u8] = b"coldvault-canary-v1";

/// Encrypts and decrypts envelopes and enforces the password policy.
///
/// Cheap to clone; holds only the cost parameters for new envelopes.
#[derive(Debug, Clone, Copy)]
pub struct CryptoEngine {
    kdf: KdfParams,
    min_password_len: usize,
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            min_password_len: MIN_PASSWORD_LEN,
        }
    }
}

impl CryptoEngine {
    pub fn new(kdf: KdfParams, min_password_len: usize) -> Result<Self> {
        kdf.validate()?;
        Ok(Self {
            kdf,
            min_password_len: min_password_len.max(1),
        })
    }

    pub fn kdf(&self) -> KdfParams {
        self.kdf
    }

    pub fn min_password_len(&self) -> usize {
        self.min_password_len
    }

    /// Minimum length only; composition rules are deliberately absent.
    pub fn check_password_policy(&self, password: &str) -> Result<()> {
        require_password(password)?;
        if password.chars().count() < self.min_password_len {
            return Err(VaultError::validation(format!(
                "password must be at least {} characters",
                self.min_password_len
            )));
        }
        Ok(())
    }

    pub fn derive_key(
        &self,
        password: &str,
        salt: &[u8],
        kdf: KdfParams,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        require_password(password)?;
        kdf::derive_key(password, salt, kdf)
    }

    /// Seal `plaintext` under `password` with a fresh salt and nonce.
    pub fn encrypt(&self, plaintext: &[u8], password: &str) -> Result<EncryptionEnvelope> {
        self.check_password_policy(password)?;

        let algorithm = Algorithm::Argon2idXChaCha20Poly1305;
        let salt = aead::generate_salt()?;
        let nonce = aead::generate_nonce()?;
        let key = kdf::derive_key(password, &salt, self.kdf)?;

        let header = envelope::header_bytes(algorithm, &self.kdf, &salt, &nonce);
        let (ciphertext, tag) = aead::seal(&key, &nonce, &header, plaintext)?;

        Ok(EncryptionEnvelope::new(
            algorithm, self.kdf, salt, nonce, ciphertext, tag,
        ))
    }

    /// Re-derive the key from the envelope's own salt and cost parameters and
    /// open it. A wrong password and a tampered envelope fail identically.
    pub fn decrypt(
        &self,
        envelope: &EncryptionEnvelope,
        password: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        require_password(password)?;

        match envelope.algorithm() {
            Algorithm::Argon2idXChaCha20Poly1305 => {
                let key = kdf::derive_key(password, envelope.salt(), *envelope.kdf())
                    .map_err(|_| VaultError::AuthenticationFailed)?;
                aead::open(
                    &key,
                    envelope.nonce(),
                    &envelope.header_bytes(),
                    envelope.ciphertext(),
                    envelope.tag(),
                )
            }
        }
    }

    /// Decrypt under `old` and seal again under `new`.
    pub fn rewrap(
        &self,
        envelope: &EncryptionEnvelope,
        old: &str,
        new: &str,
    ) -> Result<EncryptionEnvelope> {
        let plaintext = self.decrypt(envelope, old)?;
        self.encrypt(&plaintext, new)
    }

    pub fn seal_canary(&self, password: &str) -> Result<EncryptionEnvelope> {
        self.encrypt(CANARY, password)
    }

    /// `true` if `password` opens the canary envelope. Never errors.
    pub fn verify_password(&self, canary: &EncryptionEnvelope, password: &str) -> bool {
        match self.decrypt(canary, password) {
            Ok(plaintext) => plaintext.as_slice() == CANARY,
            Err(_) => false,
        }
    }

    pub fn hash_recovery_phrase(&self, phrase: &str) -> Result<String> {
        digest::hash_recovery_phrase(phrase, self.kdf)
    }

    pub fn verify_recovery_phrase(&self, phrase: &str, stored_hash: &str) -> bool {
        digest::verify_recovery_phrase(phrase, stored_hash)
    }

    pub fn bind_recovery_phrase(&self, password: &str, phrase: &str) -> Result<Zeroizing<String>> {
        digest::bind_recovery_phrase(password, phrase)
    }
}

/// There is no default password: an absent one is always a validation error.
pub fn require_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(VaultError::validation("password is required"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_engine() -> CryptoEngine {
    CryptoEngine::new(KdfParams::new(64, 1, 1).unwrap(), MIN_PASSWORD_LEN).unwrap()
}
