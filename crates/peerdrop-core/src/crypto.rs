//! Session cryptography
//!
//! Two independent primitives:
//! - RSA-OAEP (SHA-256 hash and MGF1, no label) wraps the per-connection
//!   session key for transport.
//! - AES-128-GCM seals every message once a session exists.
//!   Output format: nonce (12 bytes) || ciphertext || tag (16 bytes)

use crate::{Error, Result};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes128Gcm;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;

/// AES-128 key length
pub const SESSION_KEY_LEN: usize = 16;
/// GCM nonce length (96 bits)
pub const NONCE_LEN: usize = 12;
/// GCM tag length
pub const TAG_LEN: usize = 16;

/// Symmetric key for one connection
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Draw a fresh key from the OS RNG
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; SESSION_KEY_LEN];
        getrandom::getrandom(&mut key)
            .map_err(|e| Error::Crypto(format!("failed to generate session key: {}", e)))?;
        Ok(Self(key))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; SESSION_KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::Crypto(format!(
                "session key must be {} bytes, got {}",
                SESSION_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(GenericArray::from_slice(&self.0))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Encrypt a short secret under a peer's public key
pub fn wrap_key(public_key: &RsaPublicKey, key: &[u8]) -> Result<Vec<u8>> {
    public_key
        .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), key)
        .map_err(|e| Error::Crypto(format!("key wrap failed: {}", e)))
}

/// Recover a secret wrapped with [`wrap_key`]
pub fn unwrap_key(private_key: &RsaPrivateKey, wrapped: &[u8]) -> Result<Vec<u8>> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|e| Error::Crypto(format!("key unwrap failed: {}", e)))
}

/// Encrypt with a fresh random nonce
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt and authenticate `nonce || ciphertext || tag`
pub fn open(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Crypto(format!(
            "sealed message too short: {} bytes",
            sealed.len()
        )));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("authentication failed".to_string()))
}
