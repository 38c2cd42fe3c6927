use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::KEY_LEN;
use crate::error::{Result, VaultError};

/// Upper bounds applied to parameters read back from envelopes.
pub const MAX_MEM_COST_KIB: u32 = 4 * 1024 * 1024; // 4 GiB
pub const MAX_TIME_COST: u32 = 1024;

/// Argon2id cost parameters. Recorded in every envelope so the defaults can
/// be raised later without invalidating older envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 64 * 1024, // 64 MiB
            time_cost: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn new(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Self {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn time_cost(&self) -> u32 {
        self.time_cost
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_cost < 1 {
            return Err(VaultError::validation("argon2 time cost must be >= 1"));
        }
        if self.parallelism < 1 {
            return Err(VaultError::validation("argon2 parallelism must be >= 1"));
        }
        if self.mem_cost_kib > MAX_MEM_COST_KIB || self.time_cost > MAX_TIME_COST {
            return Err(VaultError::validation("argon2 cost exceeds supported maximum"));
        }
        if self.mem_cost_kib < self.parallelism.saturating_mul(8) {
            return Err(VaultError::validation(
                "argon2 memory cost must be at least 8 * parallelism",
            ));
        }
        Ok(())
    }
}

/// Derive a 256-bit key from `password` with Argon2id.
pub fn derive_key(password: &str, salt: &[u8], kdf: KdfParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    kdf.validate()?;

    let params = Params::new(
        kdf.mem_cost_kib,
        kdf.time_cost,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::validation(format!("invalid argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, key.as_mut())
        .map_err(|e| VaultError::validation(format!("argon2 key derivation failed: {e}")))?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfParams {
        KdfParams::new(64, 1, 1).unwrap()
    }

    #[test]
    fn kdf_is_deterministic() {
        let salt = [42u8; 16];

        let k1 = derive_key("password", &salt, cheap()).unwrap();
        let k2 = derive_key("password", &salt, cheap()).unwrap();

        assert_eq!(*k1, *k2);
    }

    #[test]
    fn kdf_params_affect_output() {
        let salt = [7u8; 16];

        let k1 = derive_key("pw", &salt, KdfParams::new(64, 1, 1).unwrap()).unwrap();
        let k2 = derive_key("pw", &salt, KdfParams::new(128, 1, 1).unwrap()).unwrap();

        assert_ne!(*k1, *k2);
    }

    #[test]
    fn salt_affects_output() {
        let k1 = derive_key("pw", &[1u8; 16], cheap()).unwrap();
        let k2 = derive_key("pw", &[2u8; 16], cheap()).unwrap();

        assert_ne!(*k1, *k2);
    }

    #[test]
    fn kdf_invalid_params_fail_gracefully() {
        assert!(matches!(
            KdfParams::new(0, 0, 0),
            Err(VaultError::Validation(_))
        ));
        assert!(KdfParams::new(8, 1, 2).is_err());
        assert!(KdfParams::new(MAX_MEM_COST_KIB + 1, 1, 1).is_err());
        assert!(KdfParams::new(64, MAX_TIME_COST + 1, 1).is_err());
    }
}
