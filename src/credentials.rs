//! Credential codec for stored database passwords.
//!
//! Passwords are persisted as a tagged [`StoredCredential`]: either legacy
//! plaintext or an AES-256-GCM envelope (`v1:<nonce>:<ciphertext>`, both
//! base64). The tag is explicit, so a plaintext password containing `:` is never
//! mistaken for an envelope.

use crate::error::{DbError, DbResult};
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

const ENVELOPE_VERSION: &str = "v1";
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

// Argon2id cost: 19 MiB, 2 passes, 1 lane.
const KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_ITERATIONS: u32 = 2;
const KDF_PARALLELISM: u32 = 1;

/// Application salt for key derivation. The key is derived once per process.
const KDF_SALT: &[u8] = b"db-gateway/credential-key/v1";

/// Persisted password representation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum StoredCredential {
    /// Legacy, unencrypted value
    Plaintext(String),
    /// `v1:<b64 nonce>:<b64 ciphertext>`
    Encrypted(String),
}

impl StoredCredential {
    pub fn plaintext(value: impl Into<String>) -> Self {
        Self::Plaintext(value.into())
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Plaintext(v) | Self::Encrypted(v) => v.is_empty(),
        }
    }

    /// The raw value when this credential is stored as plaintext.
    pub fn reveal_plaintext(&self) -> Option<&str> {
        match self {
            Self::Plaintext(v) => Some(v),
            Self::Encrypted(_) => None,
        }
    }

    fn raw(&self) -> &str {
        match self {
            Self::Plaintext(v) | Self::Encrypted(v) => v,
        }
    }
}

impl Default for StoredCredential {
    fn default() -> Self {
        Self::Plaintext(String::new())
    }
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plaintext(_) => f.write_str("Plaintext(***)"),
            Self::Encrypted(_) => f.write_str("Encrypted(***)"),
        }
    }
}

/// Encrypts and decrypts stored credentials.
///
/// A codec without a key still decrypts plaintext credentials (a no-op) but
/// cannot produce or open envelopes.
#[derive(Clone)]
pub struct CredentialCodec {
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl CredentialCodec {
    /// Derive the encryption key from a passphrase with Argon2id.
    pub fn new(passphrase: &str) -> DbResult<Self> {
        if passphrase.is_empty() {
            return Err(DbError::credential("Credential key cannot be empty"));
        }
        let params = Params::new(
            KDF_MEMORY_KIB,
            KDF_ITERATIONS,
            KDF_PARALLELISM,
            Some(KEY_SIZE),
        )
        .map_err(|e| DbError::credential(format!("Invalid Argon2 parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(passphrase.as_bytes(), KDF_SALT, key.as_mut_slice())
            .map_err(|e| DbError::credential(format!("Key derivation failed: {}", e)))?;

        Ok(Self { key: Some(key) })
    }

    /// A codec with no key; only plaintext credentials can be used.
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Build from an optional passphrase.
    pub fn from_passphrase(passphrase: Option<&str>) -> DbResult<Self> {
        match passphrase {
            Some(p) => Self::new(p),
            None => Ok(Self::disabled()),
        }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    fn cipher(&self) -> DbResult<Aes256Gcm> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| DbError::credential("No credential key configured"))?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice())))
    }

    /// Encrypt a plaintext password into an envelope.
    pub fn encrypt(&self, plaintext: &str) -> DbResult<StoredCredential> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| DbError::credential(format!("Encryption failed: {}", e)))?;

        Ok(StoredCredential::Encrypted(format!(
            "{}:{}:{}",
            ENVELOPE_VERSION,
            BASE64.encode(nonce),
            BASE64.encode(ciphertext)
        )))
    }

    /// Decrypt a stored credential. Plaintext values are returned unchanged.
    pub fn decrypt(&self, stored: &StoredCredential) -> DbResult<Zeroizing<String>> {
        let envelope = match stored {
            StoredCredential::Plaintext(v) => return Ok(Zeroizing::new(v.clone())),
            StoredCredential::Encrypted(v) => v,
        };

        let mut parts = envelope.splitn(3, ':');
        let (version, nonce_b64, ct_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(n), Some(c)) => (v, n, c),
            _ => return Err(DbError::credential("Malformed credential envelope")),
        };
        if version != ENVELOPE_VERSION {
            return Err(DbError::credential(format!(
                "Unsupported credential envelope version '{}'",
                version
            )));
        }

        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| DbError::credential(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(DbError::credential(format!(
                "Invalid nonce length: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(ct_b64)
            .map_err(|e| DbError::credential(format!("Invalid ciphertext encoding: {}", e)))?;

        let plaintext = Zeroizing::new(
            self.cipher()?
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
                .map_err(|_| DbError::credential("Decryption failed: wrong key or tampered data"))?,
        );

        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| DbError::credential("Decrypted credential is not valid UTF-8"))
    }

    /// Lenient decrypt used right before connecting.
    ///
    /// A credential that cannot be decrypted is logged and used as-is rather
    /// than failing the connection attempt.
    pub fn reveal(&self, stored: &StoredCredential) -> Zeroizing<String> {
        match self.decrypt(stored) {
            Ok(plain) => plain,
            Err(e) => {
                warn!(error = %e, "Could not decrypt stored credential, using raw value");
                Zeroizing::new(stored.raw().to_string())
            }
        }
    }

    /// Encrypt a plaintext credential when a key is configured.
    ///
    /// Already-encrypted values pass through. Without a key the plaintext is kept.
    pub fn seal(&self, stored: StoredCredential) -> DbResult<StoredCredential> {
        let StoredCredential::Plaintext(value) = &stored else {
            return Ok(stored);
        };
        if value.is_empty() {
            return Ok(stored);
        }
        if !self.has_key() {
            debug!("No credential key configured, keeping plaintext credential");
            return Ok(stored);
        }
        self.encrypt(value)
    }
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec")
            .field("has_key", &self.has_key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CredentialCodec {
        CredentialCodec::new("unit-test-passphrase").unwrap()
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        for secret in ["s3cret", "p:a:s:s", "ünïcødé 🔑", " spaces "] {
            let stored = codec.encrypt(secret).unwrap();
            assert!(stored.is_encrypted());
            assert_eq!(codec.decrypt(&stored).unwrap().as_str(), secret);
        }
    }

    #[test]
    fn test_plaintext_decrypt_is_noop() {
        let codec = codec();
        let legacy = StoredCredential::plaintext("v1:looks:like-an-envelope");
        assert_eq!(
            codec.decrypt(&legacy).unwrap().as_str(),
            "v1:looks:like-an-envelope"
        );
        assert_eq!(
            CredentialCodec::disabled().decrypt(&legacy).unwrap().as_str(),
            "v1:looks:like-an-envelope"
        );
    }

    #[test]
    fn test_envelope_format() {
        let StoredCredential::Encrypted(envelope) = codec().encrypt("x").unwrap() else {
            panic!("expected encrypted credential");
        };
        let parts: Vec<&str> = envelope.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "v1");
        assert_eq!(BASE64.decode(parts[1]).unwrap().len(), NONCE_SIZE);
    }

    #[test]
    fn test_nonce_is_random() {
        let codec = codec();
        assert_ne!(codec.encrypt("same").unwrap(), codec.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let stored = codec().encrypt("secret").unwrap();
        let other = CredentialCodec::new("another-passphrase").unwrap();
        assert!(matches!(
            other.decrypt(&stored),
            Err(DbError::Credential { .. })
        ));
    }

    #[test]
    fn test_reveal_falls_back_to_raw_value() {
        let stored = StoredCredential::Encrypted("not-an-envelope".into());
        assert_eq!(codec().reveal(&stored).as_str(), "not-an-envelope");
    }

    #[test]
    fn test_disabled_codec_cannot_encrypt() {
        assert!(CredentialCodec::disabled().encrypt("x").is_err());
    }

    #[test]
    fn test_seal() {
        let codec = codec();
        let sealed = codec.seal(StoredCredential::plaintext("pw")).unwrap();
        assert!(sealed.is_encrypted());
        assert_eq!(codec.seal(sealed.clone()).unwrap(), sealed);

        let kept = CredentialCodec::disabled()
            .seal(StoredCredential::plaintext("pw"))
            .unwrap();
        assert_eq!(kept.reveal_plaintext(), Some("pw"));
    }

    #[test]
    fn test_serde_tagged_representation() {
        let json = serde_json::to_value(StoredCredential::plaintext("pw")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "plaintext", "value": "pw"}));
        let back: StoredCredential =
            serde_json::from_value(serde_json::json!({"kind": "encrypted", "value": "v1:a:b"}))
                .unwrap();
        assert!(back.is_encrypted());
    }

    #[test]
    fn test_debug_redacts() {
        let s = format!("{:?}", StoredCredential::plaintext("hunter2"));
        assert!(!s.contains("hunter2"));
    }
}
