//! Wire encryption
//!
//! Symmetric encryption of tunnel bodies, selected by (method, password).
//! Both peers derive the key from the shared password, so the derivation
//! must be deterministic: SHA-256 of the password bytes. Each frame
//! carries its own random 96-bit nonce, prepended to the ciphertext.

use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Frame encryptor selected by method name
#[derive(Clone)]
pub enum Encryptor {
    /// Pass bodies through untouched
    None,
    /// ChaCha20-Poly1305 AEAD with a password-derived key
    ChaCha20Poly1305 { key: [u8; 32] },
}

impl Encryptor {
    pub fn new(method: &str, password: &str) -> Result<Self> {
        match method {
            "" | "none" => Ok(Self::None),
            "chacha20-poly1305" => {
                let mut hasher = Sha256::new();
                hasher.update(password.as_bytes());
                let key: [u8; 32] = hasher.finalize().into();
                Ok(Self::ChaCha20Poly1305 { key })
            }
            other => Err(anyhow!("unknown encrypt method: {}", other)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(plaintext.to_vec()),
            Self::ChaCha20Poly1305 { key } => {
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| anyhow!("invalid key: {}", e))?;

                let mut nonce_bytes = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);

                let ciphertext = cipher
                    .encrypt(nonce, plaintext)
                    .map_err(|e| anyhow!("encryption failed: {}", e))?;

                // Prepend nonce to ciphertext
                let mut result = nonce_bytes.to_vec();
                result.extend(ciphertext);
                Ok(result)
            }
        }
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::ChaCha20Poly1305 { key } => {
                if data.len() < NONCE_LEN {
                    return Err(anyhow!("ciphertext too short"));
                }

                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| anyhow!("invalid key: {}", e))?;

                let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
                cipher
                    .decrypt(nonce, &data[NONCE_LEN..])
                    .map_err(|e| anyhow!("decryption failed: {}", e))
            }
        }
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "Encryptor::None"),
            Self::ChaCha20Poly1305 { .. } => write!(f, "Encryptor::ChaCha20Poly1305([REDACTED])"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let enc = Encryptor::new("chacha20-poly1305", "secret").unwrap();
        let plain = b"hello tunnel";
        let wire = enc.encrypt(plain).unwrap();
        assert_ne!(&wire[NONCE_LEN..], plain.as_slice());
        assert_eq!(enc.decrypt(&wire).unwrap(), plain);
    }

    #[test]
    fn test_same_password_same_key() {
        let a = Encryptor::new("chacha20-poly1305", "pw").unwrap();
        let b = Encryptor::new("chacha20-poly1305", "pw").unwrap();
        let wire = a.encrypt(b"x").unwrap();
        assert_eq!(b.decrypt(&wire).unwrap(), b"x");
    }

    #[test]
    fn test_none_passthrough() {
        let enc = Encryptor::new("none", "").unwrap();
        assert_eq!(enc.encrypt(b"abc").unwrap(), b"abc");
        assert_eq!(enc.decrypt(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_wrong_password_fails() {
        let a = Encryptor::new("chacha20-poly1305", "pw1").unwrap();
        let b = Encryptor::new("chacha20-poly1305", "pw2").unwrap();
        let wire = a.encrypt(b"x").unwrap();
        assert!(b.decrypt(&wire).is_err());
    }
}
