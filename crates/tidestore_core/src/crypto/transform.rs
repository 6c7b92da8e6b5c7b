//! Fail-soft attribute transform.
//!
//! # Responsibility
//! - Encrypt text and timestamp attribute values for storage.
//! - Reverse the transform on read.
//!
//! # Invariants
//! - Every failure returns `None`, increments `failure_count()` and logs a
//!   `crypto_transform` warning. Nothing here panics or propagates an error.
//! - Timestamps are encoded with [`TIMESTAMP_FORMAT`] in UTC before encryption,
//!   so round trips keep whole seconds only.

use super::{decrypt, encrypt, CryptoError, KeyMaterial};
use crate::model::record::AttributeValue;
use crate::model::schema::AttributeKind;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};

/// String layout used for encrypted timestamps (`YYYYMMDDhhmmss`, UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const MAX_TIMESTAMP_YEAR: i32 = 9999;

/// Reversible transform for attributes marked `encrypted` in the model.
#[derive(Debug)]
pub struct AttributeTransform {
    material: KeyMaterial,
    failures: AtomicU64,
}

impl AttributeTransform {
    pub fn new(material: KeyMaterial) -> Self {
        Self {
            material,
            failures: AtomicU64::new(0),
        }
    }

    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Option<Vec<u8>> {
        self.soften("encrypt", encrypt(plaintext, &self.material))
    }

    pub fn decrypt_bytes(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        self.soften("decrypt", decrypt(ciphertext, &self.material))
    }

    pub fn encrypt_text(&self, plaintext: &str) -> Option<Vec<u8>> {
        self.encrypt_bytes(plaintext.as_bytes())
    }

    pub fn decrypt_text(&self, ciphertext: &[u8]) -> Option<String> {
        let bytes = self.decrypt_bytes(ciphertext)?;
        self.soften(
            "decode_text",
            String::from_utf8(bytes).map_err(|_| CryptoError::Utf8),
        )
    }

    /// Formats `value` with [`TIMESTAMP_FORMAT`] and encrypts the string.
    ///
    /// Years outside `0..=9999` have no fixed-width form and are rejected.
    pub fn encrypt_timestamp(&self, value: DateTime<Utc>) -> Option<Vec<u8>> {
        if !(0..=MAX_TIMESTAMP_YEAR).contains(&value.year()) {
            return self.soften(
                "encode_timestamp",
                Err(CryptoError::TimestampFormat(value.year().to_string())),
            );
        }
        self.encrypt_text(&value.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn decrypt_timestamp(&self, ciphertext: &[u8]) -> Option<DateTime<Utc>> {
        let text = self.decrypt_text(ciphertext)?;
        let parsed = NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(|_| CryptoError::TimestampFormat(text));
        self.soften("decode_timestamp", parsed)
    }

    /// Encrypts text into the base64 form stored in record columns.
    pub fn seal_text(&self, plaintext: &str) -> Option<String> {
        self.encrypt_text(plaintext)
            .map(|ciphertext| STANDARD.encode(ciphertext))
    }

    pub fn open_text(&self, sealed: &str) -> Option<String> {
        let ciphertext = self.decode_sealed(sealed)?;
        self.decrypt_text(&ciphertext)
    }

    pub fn seal_timestamp(&self, value: DateTime<Utc>) -> Option<String> {
        self.encrypt_timestamp(value)
            .map(|ciphertext| STANDARD.encode(ciphertext))
    }

    pub fn open_timestamp(&self, sealed: &str) -> Option<DateTime<Utc>> {
        let ciphertext = self.decode_sealed(sealed)?;
        self.decrypt_timestamp(&ciphertext)
    }

    /// Encrypts a text or timestamp attribute value.
    ///
    /// Other kinds are not encryptable and count as a failure.
    pub fn encrypt_value(&self, value: &AttributeValue) -> Option<Vec<u8>> {
        match value {
            AttributeValue::Text(text) => self.encrypt_text(text),
            AttributeValue::Timestamp(timestamp) => self.encrypt_timestamp(*timestamp),
            AttributeValue::Null | AttributeValue::Integer(_) | AttributeValue::Bool(_) => self
                .soften(
                    "encrypt_value",
                    Err(CryptoError::InvalidEncoding(
                        "value kind is not encryptable".to_string(),
                    )),
                ),
        }
    }

    /// Decrypts `ciphertext` back into a value of `kind`.
    pub fn decrypt_value(&self, ciphertext: &[u8], kind: AttributeKind) -> Option<AttributeValue> {
        match kind {
            AttributeKind::Timestamp => self
                .decrypt_timestamp(ciphertext)
                .map(AttributeValue::Timestamp),
            _ => self.decrypt_text(ciphertext).map(AttributeValue::Text),
        }
    }

    /// Base64 form of [`Self::encrypt_value`], as stored in record columns.
    pub fn seal_value(&self, value: &AttributeValue) -> Option<String> {
        self.encrypt_value(value)
            .map(|ciphertext| STANDARD.encode(ciphertext))
    }

    pub fn open_value(&self, sealed: &str, kind: AttributeKind) -> Option<AttributeValue> {
        let ciphertext = self.decode_sealed(sealed)?;
        self.decrypt_value(&ciphertext, kind)
    }

    /// Number of failed transforms since this instance was created.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn decode_sealed(&self, sealed: &str) -> Option<Vec<u8>> {
        self.soften(
            "decode_base64",
            STANDARD
                .decode(sealed)
                .map_err(|_| CryptoError::InvalidEncoding("ciphertext".to_string())),
        )
    }

    fn soften<T>(&self, operation: &'static str, result: Result<T, CryptoError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                // Only the error kind is logged; payloads may be user secrets.
                warn!(
                    "event=crypto_transform module=crypto status=error operation={} failures={} error={}",
                    operation,
                    total,
                    error_code(&err)
                );
                None
            }
        }
    }
}

fn error_code(err: &CryptoError) -> &'static str {
    match err {
        CryptoError::InvalidKeyLength { .. } => "invalid_key_length",
        CryptoError::InvalidIvLength { .. } => "invalid_iv_length",
        CryptoError::MissingSecret(_) => "missing_secret",
        CryptoError::InvalidEncoding(_) => "invalid_encoding",
        CryptoError::MalformedCiphertext(_) => "malformed_ciphertext",
        CryptoError::Padding => "padding",
        CryptoError::Utf8 => "utf8",
        CryptoError::TimestampFormat(_) => "timestamp_format",
    }
}

#[cfg(test)]
mod tests {
    use super::AttributeTransform;
    use crate::crypto::KeyMaterial;
    use crate::model::record::AttributeValue;
    use crate::model::schema::AttributeKind;
    use chrono::{TimeZone, Utc};

    fn transform() -> AttributeTransform {
        AttributeTransform::new(KeyMaterial::new(&[0x11; 32], &[0x22; 16]).unwrap())
    }

    #[test]
    fn text_round_trip() {
        let transform = transform();
        let ciphertext = transform.encrypt_text("secret").unwrap();
        assert_eq!(transform.decrypt_text(&ciphertext).as_deref(), Some("secret"));
        assert_eq!(transform.failure_count(), 0);
    }

    #[test]
    fn timestamp_round_trip_keeps_whole_seconds() {
        let transform = transform();
        let value = Utc.with_ymd_and_hms(2018, 11, 23, 14, 5, 9).unwrap()
            + chrono::Duration::milliseconds(750);

        let ciphertext = transform.encrypt_timestamp(value).unwrap();
        let restored = transform.decrypt_timestamp(&ciphertext).unwrap();

        assert_eq!(
            restored,
            Utc.with_ymd_and_hms(2018, 11, 23, 14, 5, 9).unwrap()
        );
    }

    #[test]
    fn failures_return_none_and_are_counted() {
        let transform = transform();

        assert!(transform.decrypt_text(&[1, 2, 3]).is_none());
        assert_eq!(transform.failure_count(), 1);

        let not_a_timestamp = transform.encrypt_text("yesterday").unwrap();
        assert!(transform.decrypt_timestamp(&not_a_timestamp).is_none());
        assert_eq!(transform.failure_count(), 2);
    }

    #[test]
    fn sealed_values_round_trip_and_reject_bad_base64() {
        let transform = transform();
        let sealed = transform.seal_text("secret").unwrap();
        assert!(!sealed.contains("secret"));
        assert_eq!(transform.open_text(&sealed).as_deref(), Some("secret"));

        assert!(transform.open_text("%%%").is_none());
        assert_eq!(transform.failure_count(), 1);
    }

    #[test]
    fn values_round_trip_by_declared_kind() {
        let transform = transform();
        let birth = Utc.with_ymd_and_hms(1990, 4, 1, 8, 30, 0).unwrap();

        let sealed = transform.seal_value(&AttributeValue::Timestamp(birth)).unwrap();
        assert_eq!(
            transform.open_value(&sealed, AttributeKind::Timestamp),
            Some(AttributeValue::Timestamp(birth))
        );

        let sealed = transform.seal_value(&AttributeValue::from("secret")).unwrap();
        assert_eq!(
            transform.open_value(&sealed, AttributeKind::Text),
            Some(AttributeValue::from("secret"))
        );

        assert!(transform.seal_value(&AttributeValue::Integer(7)).is_none());
        assert_eq!(transform.failure_count(), 1);
    }

    #[test]
    fn timestamps_past_year_9999_are_rejected_on_encrypt() {
        let transform = transform();
        let far_future = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();

        assert!(transform.encrypt_timestamp(far_future).is_none());
        assert!(transform.seal_value(&AttributeValue::Timestamp(far_future)).is_none());
        assert_eq!(transform.failure_count(), 2);

        let last_year = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        let sealed = transform.seal_timestamp(last_year).unwrap();
        assert_eq!(transform.open_timestamp(&sealed), Some(last_year));
    }

    #[test]
    fn invalid_utf8_plaintext_is_a_soft_failure() {
        let transform = transform();
        let ciphertext = transform.encrypt_bytes(&[0xff, 0xfe, 0xfd]).unwrap();
        assert!(transform.decrypt_text(&ciphertext).is_none());
        assert_eq!(transform.failure_count(), 1);
    }
}
