//! Sealing of stored credentials.
//!
//! Site keys and Plesk API keys are encrypted with AES-256-GCM before they
//! reach the database. The key is the SHA-256 digest of the configured
//! secret. Sealed values are `hex(nonce):hex(ciphertext)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("failed to seal credential")]
    Seal,
    #[error("failed to open credential: {0}")]
    Open(&'static str),
}

/// Encrypts and decrypts stored credentials.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce_bytes: [u8; 12] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Seal)?;
        Ok(format!("{}:{}", hex::encode(nonce_bytes), hex::encode(ciphertext)))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let (nonce_hex, data_hex) = sealed.split_once(':').ok_or(CryptoError::Open("malformed"))?;
        let nonce_bytes = hex::decode(nonce_hex).map_err(|_| CryptoError::Open("bad nonce"))?;
        if nonce_bytes.len() != 12 {
            return Err(CryptoError::Open("bad nonce"));
        }
        let ciphertext = hex::decode(data_hex).map_err(|_| CryptoError::Open("bad ciphertext"))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| CryptoError::Open("authentication failed"))?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Open("not utf-8"))
    }
}

/// Queryable one-way fingerprint of a credential.
pub fn fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let cipher = CredentialCipher::new("server-secret");
        let sealed = cipher.seal("pk_live_1234").unwrap();
        assert!(!sealed.contains("pk_live_1234"));
        assert_eq!(cipher.open(&sealed).unwrap(), "pk_live_1234");

        // Fresh nonce per seal.
        assert_ne!(sealed, cipher.seal("pk_live_1234").unwrap());
    }

    #[test]
    fn test_open_with_wrong_secret_fails() {
        let sealed = CredentialCipher::new("a").seal("key").unwrap();
        assert!(CredentialCipher::new("b").open(&sealed).is_err());
        assert!(CredentialCipher::new("a").open("nonsense").is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_eq!(fingerprint("abc").len(), 64);
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }
}
