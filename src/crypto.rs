//! Encryption of the fiat-recipient blob.
//!
//! The recipient details attached to an order are opaque to the core and
//! MUST NOT reach the chain in the clear: the sweeper encrypts them with the
//! platform's long-term key before they are embedded in the gateway
//! `createOrder` call. Liquidity providers holding the key decrypt
//! off-chain.
//!
//! Wire format: `base64(nonce ‖ ciphertext)` with a fresh 96-bit nonce per
//! message, AES-256-GCM.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::config::EncryptionKey;

/// AES-256-GCM cipher over the platform's long-term recipient key.
#[derive(Clone)]
pub struct RecipientCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for RecipientCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecipientCipher(***)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("ciphertext is malformed")]
    Malformed,
}

impl RecipientCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key.0);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt a recipient blob for on-chain embedding.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut framed = Vec::with_capacity(nonce.len() + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    /// Decrypt a blob produced by [`RecipientCipher::encrypt`].
    ///
    /// The service itself only needs this for operator tooling and tests;
    /// providers run the same construction on their side.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        let framed = BASE64.decode(encoded).map_err(|_| CryptoError::Malformed)?;
        if framed.len() < 12 {
            return Err(CryptoError::Malformed);
        }
        let (nonce, ciphertext) = framed.split_at(12);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> RecipientCipher {
        RecipientCipher::new(&EncryptionKey([7u8; 32]))
    }

    #[test]
    fn round_trip() {
        let cipher = cipher();
        let plaintext = br#"{"institution":"FBNINGLA","account":"0123456789"}"#;
        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_ne!(encrypted.as_bytes(), plaintext.as_slice());
        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn fresh_nonce_per_message() {
        let cipher = cipher();
        let a = cipher.encrypt(b"same recipient").unwrap();
        let b = cipher.encrypt(b"same recipient").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = cipher();
        let encrypted = cipher.encrypt(b"payload").unwrap();
        let mut bytes = BASE64.decode(&encrypted).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);
        assert!(matches!(cipher.decrypt(&tampered), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn wrong_key_fails() {
        let encrypted = cipher().encrypt(b"payload").unwrap();
        let other = RecipientCipher::new(&EncryptionKey([8u8; 32]));
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn truncated_blob_is_malformed() {
        assert!(matches!(
            cipher().decrypt("AAAA"),
            Err(CryptoError::Malformed)
        ));
    }
}
