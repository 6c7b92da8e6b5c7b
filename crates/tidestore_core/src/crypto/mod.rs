//! Attribute encryption primitives.
//!
//! # Responsibility
//! - Hold injected key material for the attribute cipher.
//! - Provide the AES-256-CBC byte transform used for encrypted attributes.
//! - Wrap the transform with the fail-soft policy used by persistence.
//!
//! # Invariants
//! - Key material is never compiled in; it always comes from a `SecretProvider`.
//! - Key bytes are zeroized when `KeyMaterial` is dropped.
//! - `AttributeTransform` never returns an error; failures are counted instead.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod cipher;
mod key;
mod transform;

pub use cipher::{decrypt, encrypt, BLOCK_LEN, IV_LEN, KEY_LEN};
pub use key::{EnvSecretProvider, KeyMaterial, SecretProvider, StaticSecretProvider};
pub use transform::{AttributeTransform, TIMESTAMP_FORMAT};

/// Failure raised by key handling or the block cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    InvalidKeyLength { expected: usize, actual: usize },
    InvalidIvLength { expected: usize, actual: usize },
    /// Secret provider could not find the named secret.
    MissingSecret(String),
    /// Secret value is present but not valid base64.
    InvalidEncoding(String),
    /// Ciphertext length is zero or not a multiple of the block size.
    MalformedCiphertext(usize),
    /// Decryption produced invalid PKCS#7 padding.
    Padding,
    /// Decrypted bytes are not valid UTF-8 where text was expected.
    Utf8,
    /// Decrypted text does not match the timestamp format.
    TimestampFormat(String),
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKeyLength { expected, actual } => {
                write!(f, "invalid key length {actual}, expected {expected}")
            }
            Self::InvalidIvLength { expected, actual } => {
                write!(f, "invalid iv length {actual}, expected {expected}")
            }
            Self::MissingSecret(name) => write!(f, "secret `{name}` is not available"),
            Self::InvalidEncoding(name) => write!(f, "secret `{name}` is not valid base64"),
            Self::MalformedCiphertext(len) => {
                write!(f, "ciphertext length {len} is not a positive multiple of {BLOCK_LEN}")
            }
            Self::Padding => write!(f, "invalid padding after decryption"),
            Self::Utf8 => write!(f, "decrypted bytes are not valid utf-8"),
            Self::TimestampFormat(value) => {
                write!(f, "decrypted value `{value}` does not match {TIMESTAMP_FORMAT}")
            }
        }
    }
}

impl Error for CryptoError {}
