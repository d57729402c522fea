//! Token encryption using AES-256-GCM
//!
//! Secrets are persisted as a `nonceHex:authTagHex:ciphertextHex` envelope. Every
//! call draws a fresh 96-bit nonce, so encrypting the same value twice never yields
//! the same envelope. Decryption fails closed on any structural or authentication
//! problem.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const ENVELOPE_SEPARATOR: char = ':';

/// Crypto error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("malformed ciphertext envelope: {0}")]
    MalformedEnvelope(&'static str),
    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

impl ZeroizingKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(ZeroizingKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ZeroizingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ZeroizingKey([REDACTED])")
    }
}

/// Process-wide cipher for stored access tokens, refresh tokens and webhook secrets.
#[derive(Clone, Debug)]
pub struct TokenCipher {
    key: ZeroizingKey,
}

impl TokenCipher {
    pub fn new(key_bytes: Vec<u8>) -> Result<Self, CryptoError> {
        Ok(Self {
            key: ZeroizingKey::new(key_bytes)?,
        })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_bytes()))
    }

    /// Encrypts `plaintext` into a `nonceHex:authTagHex:ciphertextHex` envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        // aes-gcm appends the tag to the ciphertext
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}{sep}{}{sep}{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(ciphertext),
            sep = ENVELOPE_SEPARATOR
        ))
    }

    /// Decrypts an envelope produced by [`TokenCipher::encrypt`].
    pub fn decrypt(&self, envelope: &str) -> Result<String, CryptoError> {
        let parts: Vec<&str> = envelope.split(ENVELOPE_SEPARATOR).collect();
        let [nonce_hex, tag_hex, ciphertext_hex] = parts.as_slice() else {
            return Err(CryptoError::MalformedEnvelope("expected three segments"));
        };

        let nonce =
            hex::decode(nonce_hex).map_err(|_| CryptoError::MalformedEnvelope("nonce is not hex"))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::MalformedEnvelope("nonce has wrong length"));
        }
        let tag =
            hex::decode(tag_hex).map_err(|_| CryptoError::MalformedEnvelope("tag is not hex"))?;
        if tag.len() != TAG_LEN {
            return Err(CryptoError::MalformedEnvelope("tag has wrong length"));
        }
        let mut sealed = hex::decode(ciphertext_hex)
            .map_err(|_| CryptoError::MalformedEnvelope("ciphertext is not hex"))?;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }

    /// Encrypts an optional value, passing `None` through.
    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, CryptoError> {
        plaintext.map(|p| self.encrypt(p)).transpose()
    }
}

/// Generates a random key suitable for `HUB_ENCRYPTION_KEY`, hex encoded.
pub fn generate_key_hex() -> String {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    hex::encode(key)
}
