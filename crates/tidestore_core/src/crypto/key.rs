//! Key material and secret providers.
//!
//! # Responsibility
//! - Validate key/IV lengths once, when material enters the process.
//! - Abstract where key material comes from (keychain, env, tests).
//!
//! # Invariants
//! - `KeyMaterial` always holds exactly `KEY_LEN` + `IV_LEN` bytes.
//! - `Debug` output never contains key bytes.

use super::{CryptoError, IV_LEN, KEY_LEN};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt::{Debug, Formatter};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Default environment variable holding the base64 attribute key.
pub const DEFAULT_KEY_VAR: &str = "TIDESTORE_ATTRIBUTE_KEY";
/// Default environment variable holding the base64 attribute IV.
pub const DEFAULT_IV_VAR: &str = "TIDESTORE_ATTRIBUTE_IV";

/// Symmetric key and initialization vector for attribute encryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl KeyMaterial {
    /// Builds key material from raw byte slices.
    ///
    /// # Errors
    /// - `InvalidKeyLength` unless `key` is exactly 32 bytes.
    /// - `InvalidIvLength` unless `iv` is exactly 16 bytes.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let key_bytes =
            <[u8; KEY_LEN]>::try_from(key).map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            })?;
        let iv_bytes = <[u8; IV_LEN]>::try_from(iv).map_err(|_| CryptoError::InvalidIvLength {
            expected: IV_LEN,
            actual: iv.len(),
        })?;

        Ok(Self {
            key: key_bytes,
            iv: iv_bytes,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial { .. }")
    }
}

/// Source of attribute key material.
///
/// Implementations front a secret store; the store handle asks once, at open.
pub trait SecretProvider {
    fn key_material(&self) -> Result<KeyMaterial, CryptoError>;
}

/// Provider over material that the caller already holds.
#[derive(Debug, Clone)]
pub struct StaticSecretProvider {
    material: KeyMaterial,
}

impl StaticSecretProvider {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            material: KeyMaterial::new(key, iv)?,
        })
    }
}

impl From<KeyMaterial> for StaticSecretProvider {
    fn from(material: KeyMaterial) -> Self {
        Self { material }
    }
}

impl SecretProvider for StaticSecretProvider {
    fn key_material(&self) -> Result<KeyMaterial, CryptoError> {
        Ok(self.material.clone())
    }
}

/// Provider reading base64-encoded key and IV from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSecretProvider {
    key_var: String,
    iv_var: String,
}

impl EnvSecretProvider {
    pub fn new(key_var: impl Into<String>, iv_var: impl Into<String>) -> Self {
        Self {
            key_var: key_var.into(),
            iv_var: iv_var.into(),
        }
    }

    fn read_secret(name: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded =
            std::env::var(name).map_err(|_| CryptoError::MissingSecret(name.to_string()))?;
        STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidEncoding(name.to_string()))
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_VAR, DEFAULT_IV_VAR)
    }
}

impl SecretProvider for EnvSecretProvider {
    fn key_material(&self) -> Result<KeyMaterial, CryptoError> {
        let mut key = Self::read_secret(&self.key_var)?;
        let mut iv = Self::read_secret(&self.iv_var)?;
        let material = KeyMaterial::new(&key, &iv);
        key.zeroize();
        iv.zeroize();
        material
    }
}
