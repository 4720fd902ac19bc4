use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::Rng;

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;
const MASTER_KEY_CONTEXT: &str = "offline-sync 2024-06 master key from passphrase";
const SUBKEY_CONTEXT: &str = "offline-sync 2024-06 payload subkey";

/// Keyed encryption used for queued payloads.
#[async_trait::async_trait]
pub trait CryptoService: Send + Sync {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// ChaCha20-Poly1305 with one subkey per key id.
///
/// Output layout: `nonce (12 bytes) || ciphertext || tag`.
pub struct ChaChaCryptoService {
    master: [u8; 32],
}

impl ChaChaCryptoService {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(blake3::derive_key(MASTER_KEY_CONTEXT, passphrase.as_bytes()))
    }

    /// Short, non-secret identifier of the master key for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.master).as_bytes()[..4])
    }

    fn cipher(&self, key_id: &str) -> Result<ChaCha20Poly1305, CryptoError> {
        if key_id.is_empty() {
            return Err(CryptoError::UnknownKey("empty key id".to_string()));
        }
        let subkey = blake3::derive_key(SUBKEY_CONTEXT, &[self.master.as_slice(), key_id.as_bytes()].concat());
        ChaCha20Poly1305::new_from_slice(&subkey)
            .map_err(|e| CryptoError::UnknownKey(e.to_string()))
    }
}

impl std::fmt::Debug for ChaChaCryptoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaCryptoService")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[async_trait::async_trait]
impl CryptoService for ChaChaCryptoService {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher(key_id)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt(format!(
                "ciphertext is {} bytes, shorter than the nonce",
                ciphertext.len()
            )));
        }
        let cipher = self.cipher(key_id)?;
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);

        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}
