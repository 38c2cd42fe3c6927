//! Binary encoding of an encryption envelope.
//!
//! V1 layout (little endian):
//! ```text
//! MAGIC (4) | VERSION (1) | ALGORITHM (1) | MEM_COST (4) | TIME_COST (4) | PARALLELISM (4)
//!   | SALT (16) | NONCE (24) | CT_LEN (4) | CIPHERTEXT | TAG (16)
//! ```
//! Everything before `CT_LEN` is the header and is bound as associated data,
//! so altering any field fails authentication rather than decrypting to
//! something else.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::kdf::KdfParams;
use super::{NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::error::{Result, VaultError};

/// Magic bytes identifying an envelope ("CVEV").
pub const MAGIC: &[u8; 4] = b"CVEV";
pub const VERSION_V1: u8 = 1;

const MAGIC_LEN: usize = 4;
const VER_LEN: usize = 1;
const ALG_LEN: usize = 1;
const MEM_LEN: usize = 4;
const TIME_LEN: usize = 4;
const PAR_LEN: usize = 4;
const CT_LEN_LEN: usize = 4;

/// Length of the authenticated header.
pub const HEADER_LEN: usize =
    MAGIC_LEN + VER_LEN + ALG_LEN + MEM_LEN + TIME_LEN + PAR_LEN + SALT_LEN + NONCE_LEN;

/// Authenticated encryption scheme of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
    /// Argon2id key derivation, XChaCha20-Poly1305 encryption.
    Argon2idXChaCha20Poly1305 = 1,
}

impl Algorithm {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Algorithm::Argon2idXChaCha20Poly1305),
            other => Err(VaultError::validation(format!(
                "unsupported envelope algorithm: {other}"
            ))),
        }
    }
}

/// Everything needed to authenticate and decrypt a secret, except the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    algorithm: Algorithm,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
    tag: [u8; TAG_LEN],
}

impl EncryptionEnvelope {
    pub(crate) fn new(
        algorithm: Algorithm,
        kdf: KdfParams,
        salt: [u8; SALT_LEN],
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
        tag: [u8; TAG_LEN],
    ) -> Self {
        Self {
            algorithm,
            kdf,
            salt,
            nonce,
            ciphertext,
            tag,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn tag(&self) -> &[u8; TAG_LEN] {
        &self.tag
    }

    /// Length of the encoded envelope, the only size information metadata
    /// views expose.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + CT_LEN_LEN + self.ciphertext.len() + TAG_LEN
    }

    pub(crate) fn header_bytes(&self) -> Vec<u8> {
        header_bytes(self.algorithm, &self.kdf, &self.salt, &self.nonce)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.header_bytes());
        buf.extend_from_slice(&(self.ciphertext.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.ciphertext);
        buf.extend_from_slice(&self.tag);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + CT_LEN_LEN + TAG_LEN {
            return Err(malformed("envelope too short"));
        }

        if &data[..MAGIC_LEN] != MAGIC {
            return Err(malformed("invalid magic"));
        }

        let version = data[MAGIC_LEN];
        if version != VERSION_V1 {
            return Err(malformed(&format!("unsupported version: {version}")));
        }

        let mut offset = MAGIC_LEN + VER_LEN;
        let algorithm = Algorithm::from_id(data[offset])?;
        offset += ALG_LEN;

        let mem_cost_kib = read_u32(data, offset);
        offset += MEM_LEN;

        let time_cost = read_u32(data, offset);
        offset += TIME_LEN;

        let parallelism = read_u32(data, offset);
        offset += PAR_LEN;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[offset..offset + SALT_LEN]);
        offset += SALT_LEN;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[offset..offset + NONCE_LEN]);
        offset += NONCE_LEN;

        let ct_len = read_u32(data, offset) as usize;
        offset += CT_LEN_LEN;

        if data.len() != offset + ct_len + TAG_LEN {
            return Err(malformed("length mismatch"));
        }

        let ciphertext = data[offset..offset + ct_len].to_vec();
        offset += ct_len;

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[offset..]);

        Ok(Self {
            algorithm,
            kdf: KdfParams::new(mem_cost_kib, time_cost, parallelism)?,
            salt,
            nonce,
            ciphertext,
            tag,
        })
    }
}

pub(crate) fn header_bytes(
    algorithm: Algorithm,
    kdf: &KdfParams,
    salt: &[u8; SALT_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);

    buf.extend_from_slice(MAGIC);
    buf.push(VERSION_V1);
    buf.push(algorithm.id());

    buf.extend_from_slice(&kdf.mem_cost_kib().to_le_bytes());
    buf.extend_from_slice(&kdf.time_cost().to_le_bytes());
    buf.extend_from_slice(&kdf.parallelism().to_le_bytes());

    buf.extend_from_slice(salt);
    buf.extend_from_slice(nonce);

    buf
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn malformed(reason: &str) -> VaultError {
    VaultError::validation(format!("malformed envelope: {reason}"))
}

// Persisted as base64 of the binary encoding so the algorithm id travels with it.
impl Serialize for EncryptionEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for EncryptionEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        EncryptionEnvelope::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
