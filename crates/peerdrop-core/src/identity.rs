//! Peer identity: an RSA keypair and the peer id derived from it
//!
//! The peer id is the lowercase hex SHA-256 of the PEM (SubjectPublicKeyInfo)
//! encoding of the public key, so anyone holding the key can recompute it.

use crate::{Error, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// RSA modulus size for newly generated identities
pub const RSA_KEY_BITS: usize = 2048;

const PRIVATE_KEY_FILE: &str = "private_key.pem";
const PUBLIC_KEY_FILE: &str = "public_key.pem";

/// Derive the peer id for a PEM-encoded public key
pub fn peer_id(public_key_pem: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key_pem))
}

/// A peer's long-lived keypair
#[derive(Clone)]
pub struct Identity {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_key_pem: String,
    peer_id: String,
}

impl Identity {
    /// Generate a fresh in-memory identity
    pub fn generate() -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| Error::Key(format!("key generation failed: {}", e)))?;
        Self::from_private_key(private_key)
    }

    /// Load the identity stored in `key_dir`, creating and persisting one if
    /// either key file is missing
    pub fn ensure(key_dir: &Path) -> Result<Self> {
        let private_path = key_dir.join(PRIVATE_KEY_FILE);
        let public_path = key_dir.join(PUBLIC_KEY_FILE);

        if private_path.exists() && public_path.exists() {
            let pem = std::fs::read_to_string(&private_path)?;
            let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| Error::Key(format!("{}: {}", private_path.display(), e)))?;

            let public_pem = std::fs::read_to_string(&public_path)?;
            let public_key = RsaPublicKey::from_public_key_pem(&public_pem)
                .map_err(|e| Error::Key(format!("{}: {}", public_path.display(), e)))?;
            if public_key != RsaPublicKey::from(&private_key) {
                return Err(Error::Key(format!(
                    "{} does not match {}",
                    public_path.display(),
                    private_path.display()
                )));
            }

            let identity = Self::from_private_key(private_key)?;
            tracing::debug!("Loaded identity {} from {}", identity.short_id(), key_dir.display());
            return Ok(identity);
        }

        std::fs::create_dir_all(key_dir)?;
        let identity = Self::generate()?;

        let private_pem = identity
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Key(format!("failed to encode private key: {}", e)))?;
        std::fs::write(&private_path, private_pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::write(&public_path, identity.public_key_pem.as_bytes())?;

        tracing::info!("Generated identity {} in {}", identity.short_id(), key_dir.display());
        Ok(identity)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Key(format!("failed to encode public key: {}", e)))?;
        let peer_id = peer_id(public_key_pem.as_bytes());
        Ok(Self {
            private_key,
            public_key,
            public_key_pem,
            peer_id,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// The canonical PEM encoding the peer id is derived from
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// First 8 hex chars of the peer id, for logs
    pub fn short_id(&self) -> &str {
        &self.peer_id[..8]
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.peer_id)
    }
}

/// Decode a PEM public key received from the network
pub fn decode_public_key(pem: &[u8]) -> Result<RsaPublicKey> {
    let pem = std::str::from_utf8(pem)
        .map_err(|_| Error::ProtocolViolation("public key is not valid UTF-8".to_string()))?;
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| Error::ProtocolViolation(format!("invalid public key: {}", e)))
}
