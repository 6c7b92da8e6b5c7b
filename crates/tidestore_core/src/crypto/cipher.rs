//! AES-256-CBC with PKCS#7 padding.
//!
//! The IV is fixed per `KeyMaterial`, so equal plaintexts produce equal
//! ciphertexts under the same key.

use super::{CryptoError, KeyMaterial};
use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

/// Key length in bytes (256-bit key).
pub const KEY_LEN: usize = 32;
/// IV length in bytes, equal to the AES block size.
pub const IV_LEN: usize = 16;
/// AES block size in bytes.
pub const BLOCK_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encrypts `plaintext` under the key and IV held by `material`.
///
/// Output length is always a positive multiple of [`BLOCK_LEN`], including
/// for empty input.
pub fn encrypt(plaintext: &[u8], material: &KeyMaterial) -> Result<Vec<u8>, CryptoError> {
    let encryptor = Aes256CbcEnc::new_from_slices(material.key(), material.iv()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: material.key().len(),
        }
    })?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypts `ciphertext` produced by [`encrypt`] with the same material.
///
/// # Errors
/// - `MalformedCiphertext` when the input is empty or not block aligned.
/// - `Padding` when the key/IV do not match or the input was tampered with.
pub fn decrypt(ciphertext: &[u8], material: &KeyMaterial) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::MalformedCiphertext(ciphertext.len()));
    }

    let decryptor = Aes256CbcDec::new_from_slices(material.key(), material.iv()).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: material.key().len(),
        }
    })?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Padding)
}
