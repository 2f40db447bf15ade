// Vault cryptography: AES-256-GCM at rest with a per-record key derived
// from the process-level secret and a random salt, plus HMAC-SHA256
// one-shot access tokens. Record bookkeeping (consumed flag, expiry) lives
// in the storage layer.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Encrypts vault payloads and mints/verifies their access tokens.
#[derive(Clone)]
pub struct VaultCrypto {
    secret: Vec<u8>,
}

/// Ciphertext envelope persisted to disk: salt || nonce || ciphertext.
pub struct Sealed {
    pub bytes: Vec<u8>,
}

impl VaultCrypto {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Derive the per-record data key from the master secret and salt.
    fn record_key(&self, salt: &[u8]) -> Aes256Gcm {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(salt);
        let key = hasher.finalize();
        Aes256Gcm::new_from_slice(&key).expect("sha256 output is a valid AES-256 key")
    }

    /// Encrypt plaintext for storage.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .record_key(&salt)
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Internal(anyhow::anyhow!("vault encryption failed")))?;

        let mut bytes = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        bytes.extend_from_slice(&salt);
        bytes.extend_from_slice(&nonce_bytes);
        bytes.extend_from_slice(&ciphertext);
        Ok(Sealed { bytes })
    }

    /// Decrypt a stored envelope.
    pub fn open(&self, id: Uuid, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SALT_SIZE + NONCE_SIZE {
            return Err(Error::VaultGone(id));
        }
        let (salt, rest) = sealed.split_at(SALT_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.record_key(salt)
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::VaultDenied(id))
    }

    /// Mint the one-shot access token for a record.
    pub fn token(&self, id: Uuid) -> String {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a presented token in constant time.
    pub fn verify_token(&self, id: Uuid, token: &str) -> Result<()> {
        let presented = hex::decode(token).map_err(|_| Error::VaultDenied(id))?;
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(id.as_bytes());
        mac.verify_slice(&presented).map_err(|_| Error::VaultDenied(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let crypto = VaultCrypto::new("master-secret");
        let id = Uuid::now_v7();
        let sealed = crypto.seal(b"netcdf bytes").unwrap();
        assert_ne!(sealed.bytes, b"netcdf bytes");
        let opened = crypto.open(id, &sealed.bytes).unwrap();
        assert_eq!(opened, b"netcdf bytes");
    }

    #[test]
    fn sealing_twice_differs() {
        let crypto = VaultCrypto::new("master-secret");
        let a = crypto.seal(b"data").unwrap();
        let b = crypto.seal(b"data").unwrap();
        assert_ne!(a.bytes, b.bytes);
    }

    #[test]
    fn wrong_secret_is_denied() {
        let crypto = VaultCrypto::new("master-secret");
        let other = VaultCrypto::new("other-secret");
        let id = Uuid::now_v7();
        let sealed = crypto.seal(b"data").unwrap();
        assert!(matches!(
            other.open(id, &sealed.bytes),
            Err(Error::VaultDenied(_))
        ));
    }

    #[test]
    fn truncated_envelope_is_gone() {
        let crypto = VaultCrypto::new("master-secret");
        let id = Uuid::now_v7();
        assert!(matches!(crypto.open(id, &[1, 2, 3]), Err(Error::VaultGone(_))));
    }

    #[test]
    fn token_verification() {
        let crypto = VaultCrypto::new("master-secret");
        let id = Uuid::now_v7();
        let token = crypto.token(id);
        assert!(crypto.verify_token(id, &token).is_ok());
        assert!(crypto.verify_token(id, "deadbeef").is_err());
        assert!(crypto.verify_token(Uuid::now_v7(), &token).is_err());
    }
}
